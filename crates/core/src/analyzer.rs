use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::types::{AwaitConfig, WorkerManifest, WorkerRole};

/// One analyzed step, with its resolved dependencies and DAG depth.
#[derive(Debug, Clone)]
pub struct AnalyzedStep {
    pub name: String,
    pub queue: String,
    pub worker_id: String,
    /// Tokens as declared in the manifest.
    pub subscribes: Vec<String>,
    /// Tokens the runtime actually gates on. Differs from `subscribes`
    /// for cyclic or unresolvable steps, which fall back to the entry.
    pub effective_subscribes: Vec<String>,
    pub emits: Vec<String>,
    pub await_before: Option<AwaitConfig>,
    pub await_after: Option<AwaitConfig>,
    pub step_timeout_ms: Option<u64>,
    /// Names of steps this step depends on.
    pub depends_on: Vec<String>,
    /// Longest-path depth from entry; 0 for the entry itself.
    pub level: u32,
    /// Set when the step sat on a dependency cycle.
    pub suspect: bool,
}

/// Static metadata for one flow, derived from its worker manifests.
#[derive(Debug, Clone)]
pub struct AnalyzedFlow {
    pub id: String,
    pub entry: String,
    /// Declaration order, entry first.
    pub steps: Vec<AnalyzedStep>,
    index: HashMap<String, usize>,
    /// Reverse dependency map: step -> steps it triggers.
    pub triggers: BTreeMap<String, Vec<String>>,
    pub max_level: u32,
    pub has_await: bool,
    pub stall_timeout_ms: Option<u64>,
    /// Trigger names the flow auto-subscribes to.
    pub trigger_subscriptions: Vec<String>,
}

impl AnalyzedFlow {
    pub fn step(&self, name: &str) -> Option<&AnalyzedStep> {
        self.index.get(name).map(|i| &self.steps[*i])
    }

    pub fn entry_step(&self) -> &AnalyzedStep {
        // The analyzer guarantees the entry exists at index 0.
        &self.steps[0]
    }

    /// Steps triggered by the given step, in declaration order.
    pub fn triggered_by(&self, step: &str) -> &[String] {
        self.triggers.get(step).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }

    /// Steps that emit the given token, by the same four-form match the
    /// analyzer uses. Used at runtime for `queue:`/`worker:` tokens,
    /// which never appear in a run's emitted-events set.
    pub fn emitters_of(&self, token: &str) -> Vec<&str> {
        if let Some(name) = token.strip_prefix("step:") {
            return self
                .steps
                .iter()
                .filter(|s| s.name == name)
                .map(|s| s.name.as_str())
                .collect();
        }
        if let Some(name) = token.strip_prefix("queue:") {
            return self
                .steps
                .iter()
                .filter(|s| s.queue == name)
                .map(|s| s.name.as_str())
                .collect();
        }
        if let Some(name) = token.strip_prefix("worker:") {
            return self
                .steps
                .iter()
                .filter(|s| s.worker_id == name)
                .map(|s| s.name.as_str())
                .collect();
        }
        Vec::new()
    }
}

/// How one subscription token resolved during analysis.
enum Resolution {
    Steps(Vec<String>),
    Unresolved,
}

/// Build one `AnalyzedFlow` per flow name found in the manifests.
///
/// Pure and deterministic: identical manifests produce identical output,
/// including step order (declaration order, entry first).
pub fn analyze(manifests: &[WorkerManifest]) -> Result<Vec<AnalyzedFlow>> {
    let mut flow_names: Vec<String> = Vec::new();
    let mut by_flow: HashMap<&str, Vec<&WorkerManifest>> = HashMap::new();
    for manifest in manifests {
        for flow in &manifest.flow_names {
            if !by_flow.contains_key(flow.as_str()) {
                flow_names.push(flow.clone());
            }
            by_flow.entry(flow.as_str()).or_default().push(manifest);
        }
    }

    let mut flows = Vec::new();
    for flow_name in &flow_names {
        flows.push(analyze_flow(flow_name, &by_flow[flow_name.as_str()])?);
    }
    Ok(flows)
}

fn analyze_flow(flow_name: &str, manifests: &[&WorkerManifest]) -> Result<AnalyzedFlow> {
    let entry: &WorkerManifest = manifests
        .iter()
        .find(|m| m.role == WorkerRole::Entry)
        .copied()
        .ok_or_else(|| Error::Config(format!("flow {flow_name} has no entry worker")))?;

    // Entry first, then the remaining steps in declaration order.
    let mut ordered: Vec<&WorkerManifest> = Vec::with_capacity(manifests.len());
    ordered.push(entry);
    for manifest in manifests.iter().copied() {
        if manifest.role != WorkerRole::Entry {
            ordered.push(manifest);
        } else if !std::ptr::eq(manifest, entry) {
            return Err(Error::Config(format!(
                "flow {flow_name} declares more than one entry worker"
            )));
        }
    }

    let mut index: HashMap<String, usize> = HashMap::new();
    for (i, manifest) in ordered.iter().enumerate() {
        if index.insert(manifest.step.clone(), i).is_some() {
            return Err(Error::Config(format!(
                "flow {flow_name} declares step {} twice",
                manifest.step
            )));
        }
    }

    let entry_name = entry.step.clone();

    // Resolve subscription tokens to emitting steps. A step whose tokens
    // do not fully resolve (or that declares none) hangs off the entry.
    let mut depends_on: Vec<Vec<String>> = Vec::with_capacity(ordered.len());
    let mut fallback: Vec<bool> = vec![false; ordered.len()];
    for (i, manifest) in ordered.iter().enumerate() {
        if i == 0 {
            depends_on.push(Vec::new());
            continue;
        }
        let mut deps: Vec<String> = Vec::new();
        let mut missing = false;
        for token in &manifest.subscribes {
            match resolve_token(token, &ordered) {
                Resolution::Steps(steps) => {
                    for step in steps {
                        if step != manifest.step && !deps.contains(&step) {
                            deps.push(step);
                        }
                    }
                }
                Resolution::Unresolved => {
                    tracing::warn!(
                        flow = flow_name,
                        step = %manifest.step,
                        token = %token,
                        "subscription token has no emitter; step will depend on entry"
                    );
                    missing = true;
                }
            }
        }
        if missing || deps.is_empty() {
            fallback[i] = true;
            deps = vec![entry_name.clone()];
        }
        depends_on.push(deps);
    }

    // Longest-path levels with visiting-set cycle detection.
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Gray,
        Black,
    }
    let mut marks = vec![Mark::White; ordered.len()];
    let mut levels = vec![0u32; ordered.len()];
    let mut suspects = vec![false; ordered.len()];

    fn visit(
        i: usize,
        depends_on: &[Vec<String>],
        index: &HashMap<String, usize>,
        marks: &mut [Mark],
        levels: &mut [u32],
        suspects: &mut [bool],
    ) -> u32 {
        match marks[i] {
            Mark::Black => return levels[i],
            Mark::Gray => {
                // Back edge: this step is on a cycle. Level 0 keeps it
                // from starving, the suspect flag surfaces the defect.
                suspects[i] = true;
                return 0;
            }
            Mark::White => {}
        }
        marks[i] = Mark::Gray;
        let mut level = 0;
        if i != 0 {
            level = 1;
            for dep in &depends_on[i] {
                if let Some(&j) = index.get(dep) {
                    let dep_level = visit(j, depends_on, index, marks, levels, suspects);
                    level = level.max(dep_level + 1);
                }
            }
        }
        if suspects[i] {
            level = 0;
        }
        marks[i] = Mark::Black;
        levels[i] = level;
        level
    }

    for i in 0..ordered.len() {
        visit(
            i,
            &depends_on,
            &index,
            &mut marks,
            &mut levels,
            &mut suspects,
        );
    }

    for (i, suspect) in suspects.iter().enumerate() {
        if *suspect {
            tracing::warn!(
                flow = flow_name,
                step = %ordered[i].step,
                "dependency cycle detected; step treated as depending on entry"
            );
        }
    }

    let mut steps = Vec::with_capacity(ordered.len());
    for (i, manifest) in ordered.iter().enumerate() {
        let (deps, effective) = if i == 0 {
            (Vec::new(), Vec::new())
        } else if suspects[i] || fallback[i] {
            (
                vec![entry_name.clone()],
                vec![format!("step:{entry_name}")],
            )
        } else {
            (depends_on[i].clone(), manifest.subscribes.clone())
        };

        steps.push(AnalyzedStep {
            name: manifest.step.clone(),
            queue: manifest.queue.clone(),
            worker_id: manifest.worker_id.clone(),
            subscribes: manifest.subscribes.clone(),
            effective_subscribes: effective,
            emits: manifest.emits.clone(),
            await_before: manifest.await_before.clone(),
            await_after: manifest.await_after.clone(),
            step_timeout_ms: manifest.step_timeout_ms,
            depends_on: deps,
            level: levels[i],
            suspect: suspects[i],
        });
    }

    // Mirror the final dependency edges into a graph; its reverse
    // adjacency is the triggers map.
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..steps.len()).map(|i| graph.add_node(i)).collect();
    for (i, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            if let Some(&j) = index.get(dep) {
                graph.add_edge(nodes[j], nodes[i], ());
            }
        }
    }

    let mut triggers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (j, step) in steps.iter().enumerate() {
        let mut dependents: Vec<usize> = graph
            .neighbors_directed(nodes[j], petgraph::Direction::Outgoing)
            .map(|n| graph[n])
            .collect();
        if dependents.is_empty() {
            continue;
        }
        // Declaration order.
        dependents.sort_unstable();
        triggers.insert(
            step.name.clone(),
            dependents.into_iter().map(|i| steps[i].name.clone()).collect(),
        );
    }

    let max_level = steps.iter().map(|s| s.level).max().unwrap_or(0);
    let has_await = steps
        .iter()
        .any(|s| s.await_before.is_some() || s.await_after.is_some());

    let mut trigger_subscriptions: Vec<String> = Vec::new();
    for manifest in &ordered {
        for name in &manifest.trigger_subscriptions {
            if !trigger_subscriptions.contains(name) {
                trigger_subscriptions.push(name.clone());
            }
        }
    }

    Ok(AnalyzedFlow {
        id: flow_name.to_string(),
        entry: entry_name,
        index,
        triggers,
        max_level,
        has_await,
        stall_timeout_ms: entry.stall_timeout_ms,
        trigger_subscriptions,
        steps,
    })
}

/// Resolve one subscription token against the flow's manifests.
///
/// Prefixed forms resolve by their prefix; a bare token tries step name,
/// queue name, worker id, then emitted tokens, first match winning.
fn resolve_token(token: &str, manifests: &[&WorkerManifest]) -> Resolution {
    if let Some(name) = token.strip_prefix("step:") {
        return match manifests.iter().find(|m| m.step == name) {
            Some(m) => Resolution::Steps(vec![m.step.clone()]),
            None => Resolution::Unresolved,
        };
    }
    if let Some(name) = token.strip_prefix("queue:") {
        return steps_where(manifests, |m| m.queue == name);
    }
    if let Some(name) = token.strip_prefix("worker:") {
        return steps_where(manifests, |m| m.worker_id == name);
    }

    if let Some(m) = manifests.iter().find(|m| m.step == token) {
        return Resolution::Steps(vec![m.step.clone()]);
    }
    if let Resolution::Steps(steps) = steps_where(manifests, |m| m.queue == token) {
        return Resolution::Steps(steps);
    }
    if let Resolution::Steps(steps) = steps_where(manifests, |m| m.worker_id == token) {
        return Resolution::Steps(steps);
    }
    steps_where(manifests, |m| m.emits.iter().any(|e| e == token))
}

fn steps_where(
    manifests: &[&WorkerManifest],
    predicate: impl Fn(&WorkerManifest) -> bool,
) -> Resolution {
    let steps: Vec<String> = manifests
        .iter()
        .filter(|m| predicate(m))
        .map(|m| m.step.clone())
        .collect();
    if steps.is_empty() {
        Resolution::Unresolved
    } else {
        Resolution::Steps(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(flow: &str, role: WorkerRole, step: &str) -> WorkerManifest {
        WorkerManifest {
            flow_names: vec![flow.to_string()],
            role,
            step: step.to_string(),
            queue: format!("{flow}-queue"),
            worker_id: format!("{step}-worker"),
            subscribes: Vec::new(),
            emits: Vec::new(),
            trigger_subscriptions: Vec::new(),
            await_before: None,
            await_after: None,
            step_timeout_ms: None,
            stall_timeout_ms: None,
        }
    }

    #[test]
    fn linear_flow_levels() {
        let mut entry = manifest("f", WorkerRole::Entry, "s1");
        entry.emits = vec!["done1".to_string()];
        let mut s2 = manifest("f", WorkerRole::Step, "s2");
        s2.subscribes = vec!["done1".to_string()];

        let flows = analyze(&[entry, s2]).unwrap();
        assert_eq!(flows.len(), 1);
        let flow = &flows[0];

        assert_eq!(flow.entry, "s1");
        assert_eq!(flow.step("s1").unwrap().level, 0);
        assert_eq!(flow.step("s2").unwrap().level, 1);
        assert_eq!(flow.step("s2").unwrap().depends_on, vec!["s1"]);
        assert_eq!(flow.triggered_by("s1"), ["s2"]);
        assert_eq!(flow.max_level, 1);
    }

    #[test]
    fn diamond_flow_levels() {
        let mut entry = manifest("f", WorkerRole::Entry, "s1");
        entry.emits = vec!["go".to_string()];
        let mut s2 = manifest("f", WorkerRole::Step, "s2");
        s2.subscribes = vec!["go".to_string()];
        let mut s3 = manifest("f", WorkerRole::Step, "s3");
        s3.subscribes = vec!["go".to_string()];
        let mut s4 = manifest("f", WorkerRole::Step, "s4");
        s4.subscribes = vec!["step:s2".to_string(), "step:s3".to_string()];

        let flows = analyze(&[entry, s2, s3, s4]).unwrap();
        let flow = &flows[0];
        assert_eq!(flow.step("s2").unwrap().level, 1);
        assert_eq!(flow.step("s3").unwrap().level, 1);
        assert_eq!(flow.step("s4").unwrap().level, 2);
        assert_eq!(flow.step("s4").unwrap().depends_on, vec!["s2", "s3"]);
        assert_eq!(flow.max_level, 2);
    }

    #[test]
    fn token_forms_resolve_by_priority() {
        let mut entry = manifest("f", WorkerRole::Entry, "s1");
        entry.queue = "ingest".to_string();
        entry.worker_id = "w-ingest".to_string();
        let mut a = manifest("f", WorkerRole::Step, "by_queue");
        a.subscribes = vec!["queue:ingest".to_string()];
        let mut b = manifest("f", WorkerRole::Step, "by_worker");
        b.subscribes = vec!["worker:w-ingest".to_string()];

        let flows = analyze(&[entry, a, b]).unwrap();
        let flow = &flows[0];
        assert_eq!(flow.step("by_queue").unwrap().depends_on, vec!["s1"]);
        assert_eq!(flow.step("by_worker").unwrap().depends_on, vec!["s1"]);
    }

    #[test]
    fn cycle_is_suspect_and_falls_back_to_entry() {
        let entry = manifest("f", WorkerRole::Entry, "s1");
        let mut a = manifest("f", WorkerRole::Step, "a");
        a.subscribes = vec!["step:b".to_string()];
        let mut b = manifest("f", WorkerRole::Step, "b");
        b.subscribes = vec!["step:a".to_string()];

        let flows = analyze(&[entry, a, b]).unwrap();
        let flow = &flows[0];

        let a = flow.step("a").unwrap();
        let b = flow.step("b").unwrap();
        assert!(a.suspect || b.suspect);
        for step in [a, b] {
            if step.suspect {
                assert_eq!(step.level, 0);
                assert_eq!(step.depends_on, vec!["s1"]);
                assert_eq!(step.effective_subscribes, vec!["step:s1"]);
            }
        }
    }

    #[test]
    fn missing_emitter_depends_on_entry() {
        let entry = manifest("f", WorkerRole::Entry, "s1");
        let mut orphan = manifest("f", WorkerRole::Step, "orphan");
        orphan.subscribes = vec!["never-emitted".to_string()];

        let flows = analyze(&[entry, orphan]).unwrap();
        let step = flows[0].step("orphan").unwrap();
        assert_eq!(step.depends_on, vec!["s1"]);
        assert_eq!(step.effective_subscribes, vec!["step:s1"]);
        assert_eq!(step.level, 1);
    }

    #[test]
    fn analysis_is_deterministic() {
        let mut entry = manifest("f", WorkerRole::Entry, "s1");
        entry.emits = vec!["go".to_string()];
        let mut s2 = manifest("f", WorkerRole::Step, "s2");
        s2.subscribes = vec!["go".to_string()];
        let mut s3 = manifest("f", WorkerRole::Step, "s3");
        s3.subscribes = vec!["go".to_string()];
        let manifests = [entry, s2, s3];

        let first = analyze(&manifests).unwrap();
        let second = analyze(&manifests).unwrap();
        let names_first: Vec<&str> = first[0].step_names().collect();
        let names_second: Vec<&str> = second[0].step_names().collect();
        assert_eq!(names_first, names_second);
        assert_eq!(first[0].max_level, second[0].max_level);
    }

    #[test]
    fn missing_entry_is_a_config_error() {
        let step = manifest("f", WorkerRole::Step, "s2");
        let err = analyze(&[step]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn flow_metadata_rolls_up() {
        let mut entry = manifest("f", WorkerRole::Entry, "s1");
        entry.stall_timeout_ms = Some(60_000);
        entry.trigger_subscriptions = vec!["nightly".to_string()];
        let mut s2 = manifest("f", WorkerRole::Step, "s2");
        s2.subscribes = vec!["step:s1".to_string()];
        s2.await_before = Some(AwaitConfig::Time {
            delay_ms: 100,
            timeout_action: Default::default(),
        });

        let flows = analyze(&[entry, s2]).unwrap();
        let flow = &flows[0];
        assert!(flow.has_await);
        assert_eq!(flow.stall_timeout_ms, Some(60_000));
        assert_eq!(flow.trigger_subscriptions, vec!["nightly"]);
    }
}
