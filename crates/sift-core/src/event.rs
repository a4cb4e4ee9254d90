use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::types::EngineEvent;

/// Broadcasts engine progress. Every subscriber sees every event; a slow
/// subscriber that falls more than `capacity` events behind stops early.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // Nobody listening is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Feed events to `on_event` until the next `RunFinished`.
    ///
    /// Call before starting the run. Awaiting the handle after the run
    /// returns then yields every event of that run, the last one included.
    pub fn watch_run<F>(&self, mut on_event: F) -> JoinHandle<()>
    where
        F: FnMut(&EngineEvent) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                on_event(&event);
                if event.ends_run() {
                    break;
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::types::{NodeStatus, RequestId, RunStatus};

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::NodeFinished {
            request_id: RequestId::from_str("r1"),
            node_id: "n1".into(),
            status: NodeStatus::Success,
            elapsed_ms: 3,
        });

        match rx.recv().await.unwrap() {
            EngineEvent::NodeFinished { node_id, status, .. } => {
                assert_eq!(node_id, "n1");
                assert_eq!(status, NodeStatus::Success);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(EngineEvent::PlanReady {
            request_id: RequestId::new(),
            nodes: 0,
            est_tokens: 0,
        });
    }

    #[tokio::test]
    async fn test_watch_run_sees_run_finished_then_stops() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let watcher = bus.watch_run(move |event| {
            sink.lock().unwrap().push(event.clone());
        });

        let id = RequestId::from_str("r1");
        bus.publish(EngineEvent::PlanReady {
            request_id: id.clone(),
            nodes: 1,
            est_tokens: 10,
        });
        bus.publish(EngineEvent::RunFinished {
            request_id: id.clone(),
            status: RunStatus::Done,
            total_tokens: 20,
        });
        // Belongs to a later run; the watcher has already stopped.
        bus.publish(EngineEvent::PlanReady {
            request_id: RequestId::from_str("r2"),
            nodes: 0,
            est_tokens: 0,
        });

        watcher.await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].ends_run());
        assert!(seen.iter().all(|e| e.request_id() == &id));
    }
}
