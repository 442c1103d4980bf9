use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::analyzer::{analyze, AnalyzedFlow};
use crate::error::Result;
use crate::types::WorkerManifest;
use crate::worker::StepHandler;

/// Owns the analyzed flows and the `workerId -> handler` map.
///
/// Manifests are re-analyzed wholesale on every load; analysis is pure,
/// so a hot reload with identical manifests is a no-op.
pub struct FlowRegistry {
    flows: RwLock<HashMap<String, Arc<AnalyzedFlow>>>,
    handlers: RwLock<HashMap<String, Arc<dyn StepHandler>>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Analyze and install the given manifests, replacing any flows with
    /// the same names.
    pub fn load_manifests(&self, manifests: &[WorkerManifest]) -> Result<Vec<Arc<AnalyzedFlow>>> {
        let analyzed = analyze(manifests)?;
        let mut flows = self.flows.write().unwrap();
        let mut installed = Vec::with_capacity(analyzed.len());
        for flow in analyzed {
            tracing::info!(
                flow = %flow.id,
                steps = flow.steps.len(),
                max_level = flow.max_level,
                has_await = flow.has_await,
                "flow registered"
            );
            let flow = Arc::new(flow);
            flows.insert(flow.id.clone(), flow.clone());
            installed.push(flow);
        }
        Ok(installed)
    }

    pub fn register_handler(&self, worker_id: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers
            .write()
            .unwrap()
            .insert(worker_id.into(), handler);
    }

    pub fn flow(&self, name: &str) -> Option<Arc<AnalyzedFlow>> {
        self.flows.read().unwrap().get(name).cloned()
    }

    pub fn flow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.flows.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn flows(&self) -> Vec<Arc<AnalyzedFlow>> {
        let mut flows: Vec<Arc<AnalyzedFlow>> =
            self.flows.read().unwrap().values().cloned().collect();
        flows.sort_by(|a, b| a.id.cmp(&b.id));
        flows
    }

    pub fn handler(&self, worker_id: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.read().unwrap().get(worker_id).cloned()
    }

    /// Queues referenced by any registered flow, deduplicated.
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = Vec::new();
        for flow in self.flows.read().unwrap().values() {
            for step in &flow.steps {
                if !queues.contains(&step.queue) {
                    queues.push(step.queue.clone());
                }
            }
        }
        queues.sort();
        queues
    }
}

impl Default for FlowRegistry {
    fn default() -> Self {
        Self::new()
    }
}
