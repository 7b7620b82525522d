//! AMQP consumer: pulls deliveries with prefetch 1, wraps them as
//! [`JobMessage`]s, and feeds the bounded dispatch channel. Survives broker
//! loss with exponential-backoff reconnects.

use std::sync::Arc;
use std::time::Duration;

use amiquip::{
    AmqpValue, Channel, Connection, ConsumerMessage, ConsumerOptions, Delivery,
    ExchangeDeclareOptions, ExchangeType, FieldTable, QueueDeclareOptions,
};
use crossbeam_channel::Sender;

use crate::cancel::CancellationToken;
use crate::domain::{Job, Result, WorkerError};
use crate::message::{Completer, JobMessage};

/// Durable work queue carrying jobs from the intake service.
pub const WORK_QUEUE: &str = "execution_tasks";
/// Exchange that receives messages rejected without requeue.
pub const DEAD_LETTER_EXCHANGE: &str = "dlx.execution_tasks";
/// Routing key binding the dead-letter queue to the exchange.
pub const DEAD_LETTER_ROUTING_KEY: &str = "execution_tasks.dlq";

const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Long-lived consumer. One connection and one channel per process; the
/// prefetch window of 1 per worker channel is the backpressure mechanism.
pub struct Consumer {
    url: String,
    jobs: Sender<JobMessage>,
    token: CancellationToken,
}

impl Consumer {
    pub fn new(url: String, jobs: Sender<JobMessage>, token: CancellationToken) -> Self {
        Consumer { url, jobs, token }
    }

    /// Consume until the token cancels. Broker-side session loss triggers a
    /// reconnect with exponential backoff and an idempotent topology
    /// redeclare; there is no attempt cap.
    pub fn run(&self) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            if self.token.is_cancelled() {
                return Ok(());
            }
            match self.consume_session(&mut attempt) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if self.token.is_cancelled() {
                        return Ok(());
                    }
                    let delay = reconnect_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    log::warn!(
                        "broker session ended: {e}; reconnecting in {delay:?} (attempt {attempt})"
                    );
                    if self.token.wait_timeout(delay) {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One connect-declare-consume session. Returns `Ok(())` only for a
    /// cancellation-driven exit; every broker-side termination is an error
    /// so the outer loop reconnects.
    fn consume_session(&self, attempt: &mut u32) -> Result<()> {
        let mut connection = Connection::insecure_open(&self.url).map_err(broker_err)?;
        let channel = Arc::new(connection.open_channel(None).map_err(broker_err)?);
        channel.qos(0, 1, false).map_err(broker_err)?;

        let queue = declare_topology(&channel)?;
        let consumer = queue
            .consume(ConsumerOptions::default())
            .map_err(broker_err)?;

        log::info!("consuming from queue '{WORK_QUEUE}'");
        *attempt = 0;

        let session_result = loop {
            if self.token.is_cancelled() {
                let _ = consumer.cancel();
                break Ok(());
            }
            match consumer.receiver().recv_timeout(RECEIVE_POLL_INTERVAL) {
                Ok(ConsumerMessage::Delivery(delivery)) => {
                    self.dispatch(delivery, &channel)?;
                }
                Ok(other) => {
                    break Err(WorkerError::Broker(format!(
                        "consume stream closed: {other:?}"
                    )));
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    break Err(WorkerError::Broker(
                        "delivery stream disconnected".to_string(),
                    ));
                }
            }
        };

        let _ = connection.close();
        session_result
    }

    /// Deserialize and hand off one delivery. Malformed payloads are
    /// dead-lettered here and never reach a worker. A full dispatch channel
    /// blocks, which holds the unacknowledged prefetch window open and
    /// throttles the broker.
    fn dispatch(&self, delivery: Delivery, channel: &Arc<Channel>) -> Result<()> {
        let job = match decode_job(&delivery.body) {
            Ok(job) => job,
            Err(e) => {
                log::error!(
                    "malformed job payload ({} bytes), dead-lettering: {e}",
                    delivery.body.len()
                );
                delivery.nack(channel, false).map_err(broker_err)?;
                return Ok(());
            }
        };

        log::debug!(
            "received job: job_id={} language={}",
            job.job_id,
            job.language
        );

        let completer = AmqpCompleter {
            delivery,
            channel: Arc::clone(channel),
        };
        let message = JobMessage::new(job, Box::new(completer));

        if let Err(send_err) = self.jobs.send(message) {
            // Workers are gone; put the message back for the next process.
            let _ = send_err.into_inner().nack(true);
            return Err(WorkerError::Broker("dispatch channel closed".to_string()));
        }
        Ok(())
    }
}

/// Settles one AMQP delivery through the session's shared channel.
struct AmqpCompleter {
    delivery: Delivery,
    channel: Arc<Channel>,
}

impl Completer for AmqpCompleter {
    fn ack(self: Box<Self>) -> Result<()> {
        let AmqpCompleter { delivery, channel } = *self;
        delivery.ack(&channel).map_err(broker_err)
    }

    fn nack(self: Box<Self>, requeue: bool) -> Result<()> {
        let AmqpCompleter { delivery, channel } = *self;
        delivery.nack(&channel, requeue).map_err(broker_err)
    }
}

pub(crate) fn decode_job(body: &[u8]) -> serde_json::Result<Job> {
    serde_json::from_slice(body)
}

/// Redeclare the dead-letter exchange, its queue, and the work queue. All
/// declarations are idempotent so reconnects converge on the same topology.
fn declare_topology(channel: &Channel) -> Result<amiquip::Queue<'_>> {
    let dlx = channel
        .exchange_declare(
            ExchangeType::Direct,
            DEAD_LETTER_EXCHANGE,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
        )
        .map_err(broker_err)?;

    let dlq = channel
        .queue_declare(
            DEAD_LETTER_ROUTING_KEY,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
        )
        .map_err(broker_err)?;
    dlq.bind(&dlx, DEAD_LETTER_ROUTING_KEY, FieldTable::default())
        .map_err(broker_err)?;

    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-queue-type".into(),
        AmqpValue::LongString("quorum".into()),
    );
    arguments.insert(
        "x-dead-letter-exchange".into(),
        AmqpValue::LongString(DEAD_LETTER_EXCHANGE.into()),
    );
    arguments.insert(
        "x-dead-letter-routing-key".into(),
        AmqpValue::LongString(DEAD_LETTER_ROUTING_KEY.into()),
    );

    channel
        .queue_declare(
            WORK_QUEUE,
            QueueDeclareOptions {
                durable: true,
                arguments,
                ..QueueDeclareOptions::default()
            },
        )
        .map_err(broker_err)
}

fn broker_err(e: amiquip::Error) -> WorkerError {
    WorkerError::Broker(e.to_string())
}

fn reconnect_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    BASE_RECONNECT_DELAY
        .saturating_mul(factor)
        .min(MAX_RECONNECT_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Language;

    #[test]
    fn reconnect_delay_backs_off_exponentially_to_the_cap() {
        assert_eq!(reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(reconnect_delay(3), Duration::from_secs(8));
        assert_eq!(reconnect_delay(5), Duration::from_secs(30));
        assert_eq!(reconnect_delay(30), Duration::from_secs(30));
    }

    #[test]
    fn decode_accepts_the_queue_wire_format() {
        let body = br#"{
            "job_id": "0190b2f0-5b8e-7c11-a0c4-3bfa1e6d9a42",
            "language": "cpp",
            "source_code": "int main() { return 0; }",
            "stdin": "",
            "time_limit_ms": 5000,
            "memory_limit_kb": 262144,
            "status": "QUEUED",
            "created_at": "2025-06-01T10:00:00Z"
        }"#;
        let job = decode_job(body).expect("wire payload should decode");
        assert_eq!(job.language, Language::Cpp);
    }

    #[test]
    fn decode_rejects_malformed_payloads() {
        assert!(decode_job(b"not json at all").is_err());
        assert!(decode_job(br#"{"language": "python"}"#).is_err());
        assert!(decode_job(
            br#"{"job_id": "0190b2f0-5b8e-7c11-a0c4-3bfa1e6d9a42", "language": "brainfuck", "source_code": "+"}"#
        )
        .is_err());
    }
}
