//! Per-address mailboxes.
//!
//! Every task address has at most one drain loop running at a time, so
//! merges and handler dispatches for one task never overlap. Different
//! addresses drain concurrently on the tokio runtime.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::engine::{TaskEngine, UpdateOutcome};
use crate::error::TaskError;
use crate::types::link::TaskAddress;
use crate::types::update::TaskUpdate;

pub(crate) type UpdateReply = oneshot::Sender<Result<UpdateOutcome, TaskError>>;
pub(crate) type ResumeReply = oneshot::Sender<Result<(), TaskError>>;

/// One unit of work for a task.
pub(crate) enum Envelope {
    /// Merge an update; reply if the sender waits.
    Update {
        update: TaskUpdate,
        reply: Option<UpdateReply>,
    },
    /// Re-dispatch the current sub-stage or a pending parent notification.
    Resume { reply: Option<ResumeReply> },
}

#[derive(Default)]
pub(crate) struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    running: AtomicBool,
}

impl Mailbox {
    fn is_idle(&self) -> bool {
        !self.running.load(Ordering::Acquire) && self.queue.lock().is_empty()
    }

    /// Claims the drain loop. Only the caller that flips `running` from
    /// `false` to `true` may start one.
    fn try_claim(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl TaskEngine {
    /// Queues `envelope` for `address` and starts a drain loop if none runs.
    pub(crate) fn enqueue(&self, address: TaskAddress, envelope: Envelope) {
        let mailbox = {
            // The shard lock is held while pushing so `remove_idle` can not
            // drop a mailbox that just received work.
            let entry = self
                .inner
                .mailboxes
                .entry(address.clone())
                .or_insert_with(|| Arc::new(Mailbox::default()));
            entry.queue.lock().push_back(envelope);
            Arc::clone(entry.value())
        };
        if mailbox.try_claim() {
            let engine = self.clone();
            tokio::spawn(async move { engine.drain(address, mailbox).await });
        }
    }

    async fn drain(self, address: TaskAddress, mailbox: Arc<Mailbox>) {
        loop {
            let next = mailbox.queue.lock().pop_front();
            match next {
                Some(envelope) => self.process(&address, envelope).await,
                None => {
                    mailbox.running.store(false, Ordering::Release);
                    // A sender may have pushed between pop and store.
                    if mailbox.queue.lock().is_empty() || !mailbox.try_claim() {
                        break;
                    }
                }
            }
        }
        drop(mailbox);
        self.remove_idle(&address);
    }

    fn remove_idle(&self, address: &TaskAddress) {
        self.inner
            .mailboxes
            .remove_if(address, |_, mailbox| {
                Arc::strong_count(mailbox) == 1 && mailbox.is_idle()
            });
    }

    async fn process(&self, address: &TaskAddress, envelope: Envelope) {
        let driver = match self.driver_for(address.workflow()) {
            Ok(driver) => driver,
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "dropping message for unregistered workflow");
                match envelope {
                    Envelope::Update { reply: Some(reply), .. } => {
                        let _ = reply.send(Err(e));
                    }
                    Envelope::Resume { reply: Some(reply) } => {
                        let _ = reply.send(Err(e));
                    }
                    _ => {}
                }
                return;
            }
        };

        match envelope {
            Envelope::Update { update, reply } => {
                let result = driver.apply(self, update).await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::warn!(address = %address, error = %e, "update rejected");
                        }
                    }
                }
            }
            Envelope::Resume { reply } => {
                let result = driver.resume(self, address).await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::warn!(address = %address, error = %e, "resume failed");
                        }
                    }
                }
            }
        }
    }
}
