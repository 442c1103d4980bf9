use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::fabric::StreamFabric;
use crate::storage::Store;
use crate::types::{
    EventType, FlowEvent, SubscriptionMode, Trigger, TriggerKind, TriggerSchedule, TriggerScope,
    TriggerStatus,
};

/// Options for registering (or updating) a trigger.
#[derive(Debug, Clone)]
pub struct RegisterTrigger {
    pub name: String,
    pub kind: TriggerKind,
    pub scope: TriggerScope,
    pub webhook: Option<String>,
    pub schedule: Option<TriggerSchedule>,
    pub config: Option<Value>,
}

impl RegisterTrigger {
    pub fn new(name: impl Into<String>, kind: TriggerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            scope: TriggerScope::Flow,
            webhook: None,
            schedule: None,
            config: None,
        }
    }

    pub fn with_schedule(mut self, cron: impl Into<String>, timezone: Option<String>) -> Self {
        self.schedule = Some(TriggerSchedule {
            cron: cron.into(),
            timezone,
        });
        self
    }
}

/// Shared trigger infrastructure: the `triggers` index is the source of
/// truth, a read-mostly cache fronts it, and every mutation publishes the
/// matching `trigger.*` event. The cache re-hydrates on those events, so
/// multiple instances converge.
pub struct TriggerRuntime {
    store: Arc<dyn Store>,
    fabric: Arc<StreamFabric>,
    config: RuntimeConfig,
    cache: RwLock<HashMap<String, Trigger>>,
}

impl TriggerRuntime {
    pub fn new(store: Arc<dyn Store>, fabric: Arc<StreamFabric>, config: RuntimeConfig) -> Arc<Self> {
        let runtime = Arc::new(Self {
            store,
            fabric,
            config,
            cache: RwLock::new(HashMap::new()),
        });
        runtime.clone().spawn_rehydrator();
        runtime
    }

    /// Load every trigger from the store into the cache. Called once at
    /// startup.
    pub async fn hydrate(&self) -> Result<usize> {
        let key = self.config.triggers_index();
        let count = self.store.index_count(&key).await?;
        let entries = self.store.index_read(&key, 0, count.max(1)).await?;

        let mut cache = self.cache.write().unwrap();
        cache.clear();
        for entry in &entries {
            match serde_json::from_value::<Trigger>(entry.metadata.clone()) {
                Ok(mut trigger) => {
                    trigger.version = entry.version;
                    cache.insert(trigger.name.clone(), trigger);
                }
                Err(e) => {
                    tracing::warn!(trigger = %entry.id, error = %e, "skipping undecodable trigger entry");
                }
            }
        }
        Ok(cache.len())
    }

    /// Idempotent upsert. Subscriptions and stats survive re-registration;
    /// the index version advances by one per call.
    pub async fn register_trigger(&self, opts: RegisterTrigger) -> Result<Trigger> {
        let key = self.config.triggers_index();
        let existing = self.store.index_get(&key, &opts.name).await?;
        let previous: Option<Trigger> = existing
            .as_ref()
            .and_then(|e| serde_json::from_value(e.metadata.clone()).ok());

        let trigger = Trigger {
            name: opts.name.clone(),
            kind: opts.kind,
            scope: opts.scope,
            status: previous
                .as_ref()
                .map(|t| t.status)
                .unwrap_or(TriggerStatus::Active),
            subscriptions: previous
                .as_ref()
                .map(|t| t.subscriptions.clone())
                .unwrap_or_default(),
            stats: previous
                .as_ref()
                .map(|t| t.stats.clone())
                .unwrap_or_default(),
            webhook: opts.webhook,
            schedule: opts.schedule,
            config: opts.config,
            version: 0,
        };

        let entry = self
            .store
            .index_add(
                &key,
                &opts.name,
                Utc::now().timestamp_millis(),
                serde_json::to_value(&trigger)?,
            )
            .await?;

        let mut trigger = trigger;
        trigger.version = entry.version;
        self.cache
            .write()
            .unwrap()
            .insert(trigger.name.clone(), trigger.clone());

        let event_type = if previous.is_some() {
            EventType::TriggerUpdated
        } else {
            EventType::TriggerRegistered
        };
        self.publish_trigger_event(
            &opts.name,
            FlowEvent::unscoped(event_type).with_data(serde_json::json!({
                "name": opts.name,
                "version": trigger.version,
            })),
        )
        .await?;

        Ok(trigger)
    }

    /// Subscribe a flow. `stats.active_subscribers` moves exactly once
    /// per (trigger, flow) pair; re-subscribing is a no-op.
    pub async fn subscribe_trigger(
        &self,
        trigger: &str,
        flow: &str,
        mode: SubscriptionMode,
    ) -> Result<()> {
        let key = self.config.triggers_index();
        self.ensure_exists(trigger).await?;

        let flow_name = flow.to_string();
        let entry = self
            .store
            .index_update_with_retry(&key, trigger, &move |metadata| {
                let already = metadata
                    .get("subscriptions")
                    .and_then(|v| v.as_object())
                    .map(|o| o.contains_key(&flow_name))
                    .unwrap_or(false);
                if already {
                    return;
                }
                {
                    if !metadata.is_object() {
                        *metadata = Value::Object(Default::default());
                    }
                    let map = metadata.as_object_mut().unwrap();
                    let subscriptions = map
                        .entry("subscriptions")
                        .or_insert_with(|| Value::Object(Default::default()));
                    if let Some(subs) = subscriptions.as_object_mut() {
                        subs.insert(
                            flow_name.clone(),
                            serde_json::json!({
                                "mode": mode,
                                "subscribed_at": Utc::now(),
                            }),
                        );
                    }
                }
                crate::storage::int_field_add(metadata, "stats.active_subscribers", 1);
            })
            .await?;

        self.refresh_cache(trigger, &entry.metadata, entry.version);
        self.publish_trigger_event(
            trigger,
            FlowEvent::unscoped(EventType::SubscriptionAdded).with_data(serde_json::json!({
                "trigger": trigger,
                "flow": flow,
                "mode": mode,
            })),
        )
        .await?;
        Ok(())
    }

    pub async fn unsubscribe_trigger(&self, trigger: &str, flow: &str) -> Result<()> {
        let key = self.config.triggers_index();
        self.ensure_exists(trigger).await?;

        let flow_name = flow.to_string();
        let entry = self
            .store
            .index_update_with_retry(&key, trigger, &move |metadata| {
                let removed = metadata
                    .get_mut("subscriptions")
                    .and_then(|v| v.as_object_mut())
                    .map(|map| map.remove(&flow_name).is_some())
                    .unwrap_or(false);
                if removed {
                    crate::storage::int_field_add(metadata, "stats.active_subscribers", -1);
                }
            })
            .await?;

        self.refresh_cache(trigger, &entry.metadata, entry.version);
        self.publish_trigger_event(
            trigger,
            FlowEvent::unscoped(EventType::SubscriptionRemoved).with_data(serde_json::json!({
                "trigger": trigger,
                "flow": flow,
            })),
        )
        .await?;
        Ok(())
    }

    /// Fire a trigger. Payloads above the threshold are parked in KV and
    /// replaced with a `{__payloadRef, __size}` stub in the event body.
    pub async fn emit_trigger(
        &self,
        name: &str,
        data: Value,
        payload_threshold: Option<usize>,
    ) -> Result<FlowEvent> {
        let trigger = self
            .get(name)
            .ok_or_else(|| Error::UnknownTrigger(name.to_string()))?;
        if trigger.status != TriggerStatus::Active {
            return Err(Error::Config(format!(
                "trigger {name} is {:?} and cannot fire",
                trigger.status
            )));
        }

        let threshold = payload_threshold.unwrap_or(self.config.payload_threshold);
        let serialized = serde_json::to_vec(&data)?;
        let body = if serialized.len() > threshold {
            let reference = hex::encode(Sha256::digest(&serialized));
            self.store
                .kv_set(&self.config.payload_key(&reference), data, None)
                .await?;
            serde_json::json!({
                "__payloadRef": reference,
                "__size": serialized.len(),
            })
        } else {
            data
        };

        let key = self.config.triggers_index();
        self.store
            .index_increment(&key, name, "stats.total_fires", 1)
            .await?;
        let fired_at = Utc::now();
        let entry = self
            .store
            .index_update_with_retry(&key, name, &move |metadata| {
                crate::storage::set_field(metadata, "stats.last_fired_at", serde_json::json!(fired_at));
            })
            .await?;
        self.refresh_cache(name, &entry.metadata, entry.version);

        let event = FlowEvent::unscoped(EventType::TriggerFired).with_data(serde_json::json!({
            "trigger": name,
            "payload": body,
        }));
        let stored = self.publish_trigger_event(name, event).await?;

        let mut stats_event = stored.clone();
        stats_event.data = serde_json::json!({
            "trigger": name,
            "total_fires": entry.metadata["stats"]["total_fires"],
        });
        self.fabric
            .publish_topic(StreamFabric::TRIGGER_STATS_TOPIC, stats_event);

        Ok(stored)
    }

    /// Follow a `__payloadRef` stub back to the stored payload.
    pub async fn resolve_payload(&self, body: &Value) -> Result<Value> {
        let Some(reference) = body.get("__payloadRef").and_then(|v| v.as_str()) else {
            return Ok(body.clone());
        };
        self.store
            .kv_get(&self.config.payload_key(reference))
            .await?
            .ok_or_else(|| {
                Error::TransientStore(format!("payload reference {reference} not found"))
            })
    }

    pub async fn update_trigger_status(&self, name: &str, status: TriggerStatus) -> Result<()> {
        let key = self.config.triggers_index();
        self.ensure_exists(name).await?;
        let entry = self
            .store
            .index_update_with_retry(&key, name, &move |metadata| {
                crate::storage::set_field(metadata, "status", serde_json::to_value(status).unwrap());
            })
            .await?;
        self.refresh_cache(name, &entry.metadata, entry.version);
        self.publish_trigger_event(
            name,
            FlowEvent::unscoped(EventType::TriggerUpdated).with_data(serde_json::json!({
                "name": name,
                "status": status,
            })),
        )
        .await?;
        Ok(())
    }

    /// Retire keeps the trigger and its history but stops fires.
    pub async fn retire_trigger(&self, name: &str, reason: &str) -> Result<()> {
        tracing::info!(trigger = name, reason, "retiring trigger");
        self.update_trigger_status(name, TriggerStatus::Retired).await
    }

    pub async fn delete_trigger(&self, name: &str) -> Result<()> {
        let key = self.config.triggers_index();
        self.store.index_delete(&key, name).await?;
        self.cache.write().unwrap().remove(name);

        match self
            .store
            .stream_delete(&self.config.trigger_stream(name))
            .await
        {
            Ok(()) => {}
            Err(Error::NotSupported(op)) => {
                tracing::debug!(trigger = name, op, "backend kept trigger stream");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Trigger> {
        self.cache.read().unwrap().get(name).cloned()
    }

    pub fn list(&self) -> Vec<Trigger> {
        let mut triggers: Vec<Trigger> = self.cache.read().unwrap().values().cloned().collect();
        triggers.sort_by(|a, b| a.name.cmp(&b.name));
        triggers
    }

    /// Flows auto-subscribed to a trigger, in name order.
    pub fn auto_subscribed_flows(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|t| {
                t.subscriptions
                    .iter()
                    .filter(|(_, s)| s.mode == SubscriptionMode::Auto)
                    .map(|(flow, _)| flow.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn ensure_exists(&self, name: &str) -> Result<()> {
        let key = self.config.triggers_index();
        if self.store.index_get(&key, name).await?.is_none() {
            return Err(Error::UnknownTrigger(name.to_string()));
        }
        Ok(())
    }

    fn refresh_cache(&self, name: &str, metadata: &Value, version: u64) {
        match serde_json::from_value::<Trigger>(metadata.clone()) {
            Ok(mut trigger) => {
                trigger.version = version;
                self.cache.write().unwrap().insert(name.to_string(), trigger);
            }
            Err(e) => {
                tracing::warn!(trigger = name, error = %e, "failed to refresh trigger cache");
            }
        }
    }

    /// Persist to the trigger stream, then publish on the bus and the
    /// external topic in persistence order.
    async fn publish_trigger_event(&self, name: &str, event: FlowEvent) -> Result<FlowEvent> {
        let stored = self
            .store
            .stream_append(&self.config.trigger_stream(name), event)
            .await?;
        self.fabric.publish(stored.clone());
        self.fabric
            .publish_topic(&StreamFabric::trigger_topic(name), stored.clone());
        Ok(stored)
    }

    /// Other instances' writes arrive as `trigger.*` events; re-read the
    /// index entry so the local cache converges.
    fn spawn_rehydrator(self: Arc<Self>) {
        let mut rx = self.fabric.subscribe_bus();
        let runtime = Arc::downgrade(&self);
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let is_trigger_event = matches!(
                    event.event_type,
                    EventType::TriggerRegistered
                        | EventType::TriggerUpdated
                        | EventType::SubscriptionAdded
                        | EventType::SubscriptionRemoved
                );
                if !is_trigger_event {
                    continue;
                }
                let Some(runtime) = runtime.upgrade() else { break };
                let name = event
                    .data
                    .get("trigger")
                    .or_else(|| event.data.get("name"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                if let Some(name) = name {
                    let key = runtime.config.triggers_index();
                    match runtime.store.index_get(&key, &name).await {
                        Ok(Some(entry)) => {
                            runtime.refresh_cache(&name, &entry.metadata, entry.version)
                        }
                        Ok(None) => {
                            runtime.cache.write().unwrap().remove(&name);
                        }
                        Err(e) => {
                            tracing::warn!(trigger = %name, error = %e, "trigger rehydrate failed")
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn runtime() -> Arc<TriggerRuntime> {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let fabric = StreamFabric::new();
        TriggerRuntime::new(store, fabric, RuntimeConfig::default())
    }

    #[tokio::test]
    async fn register_is_idempotent_with_version_bump() {
        let triggers = runtime();
        let opts = RegisterTrigger::new("deploy", TriggerKind::Webhook);

        let first = triggers.register_trigger(opts.clone()).await.unwrap();
        assert_eq!(first.version, 1);
        let second = triggers.register_trigger(opts).await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(triggers.list().len(), 1);
    }

    #[tokio::test]
    async fn subscribe_counts_each_pair_once() {
        let triggers = runtime();
        triggers
            .register_trigger(RegisterTrigger::new("deploy", TriggerKind::Manual))
            .await
            .unwrap();

        triggers
            .subscribe_trigger("deploy", "orders", SubscriptionMode::Auto)
            .await
            .unwrap();
        triggers
            .subscribe_trigger("deploy", "orders", SubscriptionMode::Auto)
            .await
            .unwrap();
        triggers
            .subscribe_trigger("deploy", "billing", SubscriptionMode::Manual)
            .await
            .unwrap();

        let trigger = triggers.get("deploy").unwrap();
        assert_eq!(trigger.stats.active_subscribers, 2);
        assert_eq!(trigger.subscriptions.len(), 2);
        assert_eq!(triggers.auto_subscribed_flows("deploy"), vec!["orders"]);

        triggers
            .unsubscribe_trigger("deploy", "orders")
            .await
            .unwrap();
        let trigger = triggers.get("deploy").unwrap();
        assert_eq!(trigger.stats.active_subscribers, 1);
        assert_eq!(trigger.subscriptions.len(), 1);
    }

    #[tokio::test]
    async fn large_payloads_are_offloaded() {
        let triggers = runtime();
        triggers
            .register_trigger(RegisterTrigger::new("big", TriggerKind::Event))
            .await
            .unwrap();

        let blob = "x".repeat(100 * 1024);
        let data = serde_json::json!({ "blob": blob });
        let fired = triggers.emit_trigger("big", data.clone(), None).await.unwrap();

        let body = &fired.data["payload"];
        assert!(body.get("__payloadRef").is_some());
        assert!(body["__size"].as_u64().unwrap() > 100 * 1024);

        let resolved = triggers.resolve_payload(body).await.unwrap();
        assert_eq!(resolved, data);
    }

    #[tokio::test]
    async fn small_payloads_stay_inline() {
        let triggers = runtime();
        triggers
            .register_trigger(RegisterTrigger::new("small", TriggerKind::Event))
            .await
            .unwrap();

        let data = serde_json::json!({ "n": 1 });
        let fired = triggers.emit_trigger("small", data.clone(), None).await.unwrap();
        assert_eq!(fired.data["payload"], data);

        let trigger = triggers.get("small").unwrap();
        assert_eq!(trigger.stats.total_fires, 1);
        assert!(trigger.stats.last_fired_at.is_some());
    }

    #[tokio::test]
    async fn retired_triggers_refuse_to_fire() {
        let triggers = runtime();
        triggers
            .register_trigger(RegisterTrigger::new("old", TriggerKind::Manual))
            .await
            .unwrap();
        triggers.retire_trigger("old", "superseded").await.unwrap();

        let err = triggers
            .emit_trigger("old", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
