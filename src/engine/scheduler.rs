//! Ready-queue scheduling over the plan DAG.
//!
//! A node is ready when every prerequisite edge source has completed and no
//! conditional lock remains. Edges whose source is a routing node place a
//! lock on the target; the lock lifts only when the routing node completes
//! and releases that specific target. Ready ties break by original plan
//! order, which keeps dispatch deterministic.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use thiserror::Error;

use crate::models::{Plan, PlanNodeKind};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchedulerError {
    #[error("plan graph contains a cycle involving {node_id:?}")]
    CycleDetected { node_id: String },
    #[error("edge references unknown node {node_id:?}")]
    UnknownNode { node_id: String },
}

/// Scheduler state for one plan.
#[derive(Debug)]
pub struct Scheduler {
    order: Vec<String>,
    index: BTreeMap<String, usize>,
    incoming: BTreeMap<String, BTreeSet<String>>,
    outgoing: BTreeMap<String, Vec<String>>,
    /// target -> routing nodes still holding a lock on it.
    conditional_locks: BTreeMap<String, BTreeSet<String>>,
    /// Routing edges, for re-arming locks on reset.
    routing_edges: Vec<(String, String)>,
    completed: BTreeSet<String>,
}

impl Scheduler {
    /// Build a scheduler, restoring completed nodes and prior conditional
    /// selections (`routing_selections[routing_node] = released targets`).
    pub fn new(
        plan: &Plan,
        completed_node_ids: &[String],
        routing_selections: &BTreeMap<String, Vec<String>>,
    ) -> Result<Self, SchedulerError> {
        let order: Vec<String> = plan.nodes.iter().map(|n| n.id.clone()).collect();
        let index: BTreeMap<String, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let mut incoming: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut outgoing: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut conditional_locks: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut routing_edges: Vec<(String, String)> = Vec::new();

        for id in &order {
            incoming.entry(id.clone()).or_default();
            outgoing.entry(id.clone()).or_default();
        }

        let routing_nodes: BTreeSet<&str> = plan
            .nodes
            .iter()
            .filter(|n| n.kind == PlanNodeKind::Routing)
            .map(|n| n.id.as_str())
            .collect();

        for edge in plan.effective_edges() {
            for endpoint in [&edge.from, &edge.to] {
                if !index.contains_key(endpoint) {
                    return Err(SchedulerError::UnknownNode {
                        node_id: endpoint.clone(),
                    });
                }
            }
            incoming
                .entry(edge.to.clone())
                .or_default()
                .insert(edge.from.clone());
            outgoing.entry(edge.from.clone()).or_default().push(edge.to.clone());

            if routing_nodes.contains(edge.from.as_str()) {
                routing_edges.push((edge.from.clone(), edge.to.clone()));
                conditional_locks
                    .entry(edge.to.clone())
                    .or_default()
                    .insert(edge.from.clone());
            }
        }

        detect_cycle(&order, &incoming)?;

        let mut scheduler = Self {
            order,
            index,
            incoming,
            outgoing,
            conditional_locks,
            routing_edges,
            completed: completed_node_ids.iter().cloned().collect(),
        };

        // Replay prior routing selections so resume re-opens the same branch.
        for (routing_node, targets) in routing_selections {
            scheduler.mark_conditional_release(routing_node, targets);
        }

        Ok(scheduler)
    }

    /// First ready node in plan order, without consuming it.
    pub fn peek(&self) -> Option<&str> {
        self.order
            .iter()
            .find(|id| self.is_ready(id))
            .map(String::as_str)
    }

    /// First ready node in plan order.
    pub fn next(&self) -> Option<String> {
        self.peek().map(|s| s.to_string())
    }

    /// Whether a node can be dispatched now.
    pub fn is_ready(&self, node_id: &str) -> bool {
        if self.completed.contains(node_id) || !self.index.contains_key(node_id) {
            return false;
        }
        let prerequisites_done = self
            .incoming
            .get(node_id)
            .map(|sources| sources.iter().all(|s| self.completed.contains(s)))
            .unwrap_or(true);
        let unlocked = self
            .conditional_locks
            .get(node_id)
            .map(BTreeSet::is_empty)
            .unwrap_or(true);
        prerequisites_done && unlocked
    }

    pub fn mark_completed(&mut self, node_id: &str) {
        self.completed.insert(node_id.to_string());
    }

    pub fn is_completed(&self, node_id: &str) -> bool {
        self.completed.contains(node_id)
    }

    pub fn completed_node_ids(&self) -> Vec<String> {
        // Preserve plan order rather than set order.
        self.order
            .iter()
            .filter(|id| self.completed.contains(*id))
            .cloned()
            .collect()
    }

    /// Release the lock a routing node holds on the selected targets.
    pub fn mark_conditional_release(&mut self, routing_node: &str, targets: &[String]) {
        for target in targets {
            if let Some(locks) = self.conditional_locks.get_mut(target) {
                locks.remove(routing_node);
            }
        }
    }

    /// Drop a node and every descendant from the completed set so they can
    /// re-run (the `goto` policy action). Locks from reset routing nodes
    /// re-arm. Returns the reset ids in plan order.
    pub fn reset_from_node(&mut self, node_id: &str) -> Vec<String> {
        if !self.index.contains_key(node_id) {
            return Vec::new();
        }

        let mut affected: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = VecDeque::from([node_id.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !affected.insert(current.clone()) {
                continue;
            }
            if let Some(children) = self.outgoing.get(&current) {
                for child in children {
                    queue.push_back(child.clone());
                }
            }
        }

        for id in &affected {
            self.completed.remove(id);
        }
        for (routing_node, target) in &self.routing_edges {
            if affected.contains(routing_node) {
                self.conditional_locks
                    .entry(target.clone())
                    .or_default()
                    .insert(routing_node.clone());
            }
        }

        self.order
            .iter()
            .filter(|id| affected.contains(*id))
            .cloned()
            .collect()
    }
}

/// Kahn's algorithm; anything left unprocessed sits on a cycle.
fn detect_cycle(
    order: &[String],
    incoming: &BTreeMap<String, BTreeSet<String>>,
) -> Result<(), SchedulerError> {
    let mut degree: BTreeMap<&str, usize> = order
        .iter()
        .map(|id| (id.as_str(), incoming.get(id).map(BTreeSet::len).unwrap_or(0)))
        .collect();
    let mut queue: VecDeque<&str> = order
        .iter()
        .filter(|id| degree.get(id.as_str()) == Some(&0))
        .map(String::as_str)
        .collect();
    let mut processed = 0usize;

    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (to, froms) in incoming {
        for from in froms {
            dependents.entry(from.as_str()).or_default().push(to.as_str());
        }
    }

    while let Some(current) = queue.pop_front() {
        processed += 1;
        if let Some(children) = dependents.get(current) {
            for child in children {
                let entry = degree.get_mut(child).expect("child indexed");
                *entry -= 1;
                if *entry == 0 {
                    queue.push_back(child);
                }
            }
        }
    }

    if processed != order.len() {
        let stuck = order
            .iter()
            .find(|id| degree.get(id.as_str()).copied().unwrap_or(0) > 0)
            .cloned()
            .unwrap_or_default();
        return Err(SchedulerError::CycleDetected { node_id: stuck });
    }
    Ok(())
}
