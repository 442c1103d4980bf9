use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;

use crate::types::{EventType, FlowEvent, RunId};

/// Capacity of the internal bus and each external topic. A subscriber
/// that falls further behind loses the oldest events; the lag is logged.
const CHANNEL_CAPACITY: usize = 1024;

type Handler = Arc<dyn Fn(FlowEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// In-process publish/subscribe bus plus the well-known external topics
/// that feed UI clients.
///
/// Bus delivery for a given run follows publish order. Handlers run
/// sequentially on the dispatcher task; a handler that panics or errors
/// is logged and never poisons the bus.
pub struct StreamFabric {
    bus: broadcast::Sender<FlowEvent>,
    topics: Mutex<HashMap<String, broadcast::Sender<FlowEvent>>>,
    handlers: RwLock<Vec<(EventType, Handler)>>,
}

impl StreamFabric {
    pub fn new() -> Arc<Self> {
        let (bus, _) = broadcast::channel(CHANNEL_CAPACITY);
        let fabric = Arc::new(Self {
            bus,
            topics: Mutex::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
        });
        fabric.clone().spawn_dispatcher();
        fabric
    }

    /// Topic name carrying every persisted event of one run.
    pub fn run_topic(run_id: RunId) -> String {
        format!("flow.events.{run_id}")
    }

    /// Topic carrying flow-stats changes.
    pub const FLOW_STATS_TOPIC: &'static str = "flow.stats";

    /// Topic name carrying one trigger's events.
    pub fn trigger_topic(name: &str) -> String {
        format!("trigger.events.{name}")
    }

    pub const TRIGGER_STATS_TOPIC: &'static str = "trigger.stats";

    /// Publish onto the internal bus. Best-effort: publishing never
    /// blocks on slow subscribers.
    pub fn publish(&self, event: FlowEvent) {
        let _ = self.bus.send(event);
    }

    /// Register a typed handler, invoked on the dispatcher task for
    /// every matching bus event.
    pub fn on_type<F, Fut>(&self, event_type: EventType, handler: F)
    where
        F: Fn(FlowEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)));
        self.handlers.write().unwrap().push((event_type, handler));
    }

    /// Raw bus subscription, for consumers that need every event.
    pub fn subscribe_bus(&self) -> broadcast::Receiver<FlowEvent> {
        self.bus.subscribe()
    }

    /// Publish onto an external topic. Called after persistence so topic
    /// delivery order matches stream order.
    pub fn publish_topic(&self, topic: &str, event: FlowEvent) {
        let sender = {
            let topics = self.topics.lock().unwrap();
            topics.get(topic).cloned()
        };
        if let Some(sender) = sender {
            let _ = sender.send(event);
        }
    }

    pub fn subscribe_topic(&self, topic: &str) -> broadcast::Receiver<FlowEvent> {
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Live events for one run, in persistence order.
    pub fn subscribe_run(&self, run_id: RunId) -> broadcast::Receiver<FlowEvent> {
        self.subscribe_topic(&Self::run_topic(run_id))
    }

    fn spawn_dispatcher(self: Arc<Self>) {
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let handlers: Vec<Handler> = {
                            let registered = self.handlers.read().unwrap();
                            registered
                                .iter()
                                .filter(|(t, _)| *t == event.event_type)
                                .map(|(_, h)| h.clone())
                                .collect()
                        };
                        for handler in handlers {
                            handler(event.clone()).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "fabric dispatcher lagged, dropped oldest events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn typed_handlers_see_matching_events() {
        let fabric = StreamFabric::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        fabric.on_type(EventType::Emit, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let run_id = RunId::new();
        fabric.publish(FlowEvent::new(EventType::Emit, run_id, "f"));
        fabric.publish(FlowEvent::new(EventType::Log, run_id, "f"));
        fabric.publish(FlowEvent::new(EventType::Emit, run_id, "f"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn run_topic_preserves_order() {
        let fabric = StreamFabric::new();
        let run_id = RunId::new();
        let mut rx = fabric.subscribe_run(run_id);

        for i in 1..=3u64 {
            let mut event = FlowEvent::new(EventType::Log, run_id, "f");
            event.id = i;
            fabric.publish_topic(&StreamFabric::run_topic(run_id), event);
        }

        for expected in 1..=3u64 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.id, expected);
        }
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let fabric = StreamFabric::new();
        fabric.publish_topic("trigger.events.none", FlowEvent::unscoped(EventType::TriggerFired));
    }
}
