//! Tamper-evident record of protection events.
//!
//! Every blocked settings access, bypass grant, bypass expiry and keyword
//! countdown expiry lands in an append-only, SHA-256 hash-chained JSONL log
//! under the state directory. `pinguard audit verify` walks the chain.

mod audit;

pub use self::audit::{
    AUDIT_FILENAME, AuditAction, AuditEntry, AuditLog, append_audit_entry, audit_file_path,
    read_audit_log, verify_audit_chain,
};
