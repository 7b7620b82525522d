//! Broker delivery envelope handed from the consumer to the worker pool.

use crate::domain::{Job, Result};

/// One-shot acknowledgement seam. The AMQP implementation lives in the
/// consumer; tests substitute a recording implementation.
pub trait Completer: Send {
    fn ack(self: Box<Self>) -> Result<()>;
    fn nack(self: Box<Self>, requeue: bool) -> Result<()>;
}

/// A deserialized job plus the means to settle its broker delivery. The
/// worker holds the envelope for the entire orchestration and settles it
/// exactly once.
pub struct JobMessage {
    pub job: Job,
    completer: Box<dyn Completer>,
}

impl JobMessage {
    pub fn new(job: Job, completer: Box<dyn Completer>) -> Self {
        JobMessage { job, completer }
    }

    /// Remove the message from the queue.
    pub fn ack(self) -> Result<()> {
        self.completer.ack()
    }

    /// Reject the message; `requeue` routes it back to the work queue,
    /// otherwise it goes to the dead-letter exchange.
    pub fn nack(self, requeue: bool) -> Result<()> {
        self.completer.nack(requeue)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use crate::domain::Language;
    use crate::testing::{counted_message, sample_job, CompletionLog};

    #[test]
    fn ack_settles_the_delivery_once() {
        let log = CompletionLog::new();
        let message = counted_message(sample_job(Language::Python), &log);
        message.ack().unwrap();
        assert_eq!(log.acks.load(Ordering::SeqCst), 1);
        assert_eq!(log.settled(), 1);
    }

    #[test]
    fn nack_distinguishes_requeue_from_dead_letter() {
        let log = CompletionLog::new();
        counted_message(sample_job(Language::Python), &log)
            .nack(true)
            .unwrap();
        counted_message(sample_job(Language::Cpp), &log)
            .nack(false)
            .unwrap();
        assert_eq!(log.requeues.load(Ordering::SeqCst), 1);
        assert_eq!(log.dead_letters.load(Ordering::SeqCst), 1);
        assert_eq!(Arc::strong_count(&log), 1, "completers release their log");
    }
}
