use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::job::JobId;
use crate::runtime::WorkerId;

/// Timestamped lifecycle event.
#[derive(Clone, Debug, Serialize)]
pub struct PoolEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: PoolEventKind,
}

impl PoolEvent {
    pub fn new(kind: PoolEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Lifecycle transitions observed by the pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum PoolEventKind {
    /// A job was accepted and assigned an id.
    Submitted { job_id: JobId, job_type: String },
    /// A job was handed to a worker.
    Dispatched {
        job_id: JobId,
        worker_id: WorkerId,
        attempt: u32,
    },
    /// A worker reported success.
    Completed { job_id: JobId, worker_id: WorkerId },
    /// A worker reported failure.
    Failed {
        job_id: JobId,
        worker_id: WorkerId,
        error: String,
    },
    /// A job hit its deadline.
    TimedOut {
        job_id: JobId,
        worker_id: Option<WorkerId>,
    },
    /// A job was put back at the head of the queue after its worker crashed.
    Requeued { job_id: JobId, crashes: u32 },
    /// A job was rejected without a result: crash ceiling or shutdown.
    Rejected { job_id: JobId, reason: String },
    /// A worker slot came up, either at start or as a replacement.
    WorkerStarted { worker_id: WorkerId, generation: u64 },
    /// A worker slot's process or task ended.
    WorkerExited {
        worker_id: WorkerId,
        generation: u64,
        reason: String,
    },
    /// Shutdown began; no new jobs are accepted.
    ShutdownStarted { active_jobs: usize },
    /// All workers have been terminated.
    Stopped,
}

/// Fan-out bus for [`PoolEvent`]s.
///
/// Publishing never blocks. Events sent with no subscribers are dropped, and
/// a subscriber that falls more than `capacity` events behind receives
/// `RecvError::Lagged`.
pub struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
    capacity: usize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn publish(&self, kind: PoolEventKind) {
        let _ = self.sender.send(PoolEvent::new(kind));
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        for id in 0..3 {
            bus.publish(PoolEventKind::Submitted {
                job_id: JobId(id),
                job_type: "analyze".into(),
            });
        }

        for rx in [&mut rx1, &mut rx2] {
            for id in 0..3 {
                let event = timeout(Duration::from_millis(100), rx.recv())
                    .await
                    .expect("event should arrive")
                    .expect("channel open");
                assert_eq!(
                    event.kind,
                    PoolEventKind::Submitted {
                        job_id: JobId(id),
                        job_type: "analyze".into(),
                    }
                );
            }
        }
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(PoolEventKind::Stopped);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for id in 0..5 {
            bus.publish(PoolEventKind::Requeued {
                job_id: JobId(id),
                crashes: 1,
            });
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let encoded = serde_json::to_value(PoolEventKind::TimedOut {
            job_id: JobId(4),
            worker_id: Some(WorkerId(1)),
        })
        .unwrap();
        assert_eq!(
            encoded,
            serde_json::json!({"event": "timed_out", "job_id": 4, "worker_id": 1})
        );
    }
}
