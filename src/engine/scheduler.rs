//! Tokio-backed [`Scheduler`]: each timer is a sleeping task that posts its
//! event back into the engine's command channel.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::JoinHandle;
use tracing::debug;

use super::events::TimerEvent;
use super::host::{Scheduler, TimerId};
use super::runtime::Command;

pub struct TokioScheduler {
    // Weak, so pending timers never keep a finished engine's channel open.
    tx: WeakUnboundedSender<Command>,
    next_id: u64,
    tasks: HashMap<TimerId, JoinHandle<()>>,
}

impl TokioScheduler {
    pub(crate) fn new(tx: WeakUnboundedSender<Command>) -> Self {
        Self {
            tx,
            next_id: 0,
            tasks: HashMap::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks.values().filter(|h| !h.is_finished()).count()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, delay: Duration, event: TimerEvent) -> TimerId {
        self.tasks.retain(|_, handle| !handle.is_finished());

        self.next_id += 1;
        let id = TimerId(self.next_id);
        let tx = self.tx.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match tx.upgrade() {
                Some(tx) => {
                    let _ = tx.send(Command::Timer(event));
                }
                None => debug!("Engine gone, dropping timer {:?}", event),
            }
        });

        self.tasks.insert(id, handle);
        id
    }

    fn cancel(&mut self, id: TimerId) {
        if let Some(handle) = self.tasks.remove(&id) {
            handle.abort();
        }
    }

    fn cancel_all(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
