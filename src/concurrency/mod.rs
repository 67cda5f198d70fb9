mod instance_lock;

pub use instance_lock::{InstanceGuard, InstanceLock};
