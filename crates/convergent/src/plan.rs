//! Orders diff actions into sequential waves of concurrently safe actions.
//!
//! Every action becomes a node in a dependency graph. Two kinds of edges
//! exist:
//!
//! - `Requires`: the target cannot run until the source succeeded. These come
//!   from namespace membership, CRD instances, `depends-on` hints and
//!   readiness-gated replacements, and they decide which actions are blocked
//!   when something fails.
//! - `Precedes`: pure ordering (sync waves, deletes after applies).
//!
//! Deletes walk the same relations in reverse: members go before their
//! Namespace and instances before their CRD. Wave numbers are longest paths
//! over the combined graph, so a node always lands strictly after every
//! predecessor.

use std::collections::{BTreeMap, HashMap};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::Serialize;

use crate::diff::{Action, Verb};
use crate::error::PlanError;
use crate::resource::ResourceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Requires,
    Precedes,
}

/// An action together with the actions it waits on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedAction {
    #[serde(flatten)]
    pub action: Action,
    /// Keys whose failure blocks this action.
    pub after: Vec<ResourceKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Wave {
    pub index: usize,
    /// Sorted by resource key.
    pub actions: Vec<PlannedAction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Plan {
    pub waves: Vec<Wave>,
    /// Resources already in sync.
    pub unchanged: Vec<ResourceKey>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    pub fn action_count(&self) -> usize {
        self.waves.iter().map(|w| w.actions.len()).sum()
    }

    /// Wave index of the action for `key`.
    pub fn wave_of(&self, key: &ResourceKey) -> Option<usize> {
        self.waves
            .iter()
            .find(|w| w.actions.iter().any(|a| &a.action.key == key))
            .map(|w| w.index)
    }
}

/// Builds a [`Plan`] from the differ's actions.
pub fn plan(actions: Vec<Action>) -> Result<Plan, PlanError> {
    let mut graph: DiGraph<usize, Edge> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..actions.len()).map(|i| graph.add_node(i)).collect();
    let index: HashMap<&ResourceKey, usize> =
        actions.iter().enumerate().map(|(i, a)| (&a.key, i)).collect();
    let defined_kinds: HashMap<&str, usize> = actions
        .iter()
        .enumerate()
        .filter_map(|(i, a)| a.defines_kind.as_deref().map(|k| (k, i)))
        .collect();

    for (i, action) in actions.iter().enumerate() {
        if let Some(ns) = &action.key.namespace {
            if let Some(&j) = index.get(&ResourceKey::namespace_object(ns)) {
                relate(&mut graph, &actions, nodes[j], nodes[i]);
            }
        }

        if let Some(&j) = defined_kinds.get(action.key.kind.as_str()) {
            if j != i {
                relate(&mut graph, &actions, nodes[j], nodes[i]);
            }
        }

        for reference in &action.depends_on {
            let dependency = ResourceKey::parse(reference, action.key.namespace.as_deref())
                .ok_or_else(|| PlanError::InvalidReference {
                    resource: action.key.to_string(),
                    reference: reference.clone(),
                })?;
            let unknown = || PlanError::UnknownDependency {
                resource: action.key.to_string(),
                dependency: dependency.to_string(),
            };
            let &j = index.get(&dependency).ok_or_else(unknown)?;
            if action.verb != Verb::Delete && actions[j].verb == Verb::Delete {
                return Err(unknown());
            }
            relate(&mut graph, &actions, nodes[j], nodes[i]);
        }

        if let Some(replacement) = &action.replaced_by {
            if let Some(&j) = index.get(replacement) {
                link(&mut graph, nodes[j], nodes[i], Edge::Requires);
            }
        }
    }

    order_sync_waves(&mut graph, &nodes, &actions)?;

    let deletes: Vec<usize> = (0..actions.len())
        .filter(|&i| actions[i].verb == Verb::Delete)
        .collect();
    for (i, action) in actions.iter().enumerate() {
        if matches!(action.verb, Verb::Create | Verb::Update) {
            for &d in &deletes {
                link(&mut graph, nodes[i], nodes[d], Edge::Precedes);
            }
        }
    }

    let order = toposort(&graph, None).map_err(|_| cycle_error(&graph, &actions))?;

    let mut level = vec![0usize; actions.len()];
    for node in order {
        let depth = graph
            .edges_directed(node, Direction::Incoming)
            .map(|e| level[graph[e.source()]] + 1)
            .max()
            .unwrap_or(0);
        level[graph[node]] = depth;
    }

    let mut by_level: BTreeMap<usize, Vec<PlannedAction>> = BTreeMap::new();
    let mut unchanged = Vec::new();
    for (i, action) in actions.iter().enumerate() {
        if action.is_noop() {
            unchanged.push(action.key.clone());
            continue;
        }
        let mut after: Vec<ResourceKey> = graph
            .edges_directed(nodes[i], Direction::Incoming)
            .filter(|e| *e.weight() == Edge::Requires)
            .map(|e| &actions[graph[e.source()]])
            .filter(|a| !a.is_noop())
            .map(|a| a.key.clone())
            .collect();
        after.sort();
        by_level.entry(level[i]).or_default().push(PlannedAction {
            action: action.clone(),
            after,
        });
    }

    let waves = by_level
        .into_values()
        .enumerate()
        .map(|(index, mut actions)| {
            actions.sort_by(|a, b| a.action.key.cmp(&b.action.key));
            Wave { index, actions }
        })
        .collect();
    unchanged.sort();

    Ok(Plan { waves, unchanged })
}

/// Adds a `Requires` edge from `dependency` to `dependent`, reversed when
/// both sides are deletes. A delete never waits on an apply through this
/// relation; the blanket delete ordering covers it.
fn relate(
    graph: &mut DiGraph<usize, Edge>,
    actions: &[Action],
    dependency: NodeIndex,
    dependent: NodeIndex,
) {
    let dependency_delete = actions[graph[dependency]].verb == Verb::Delete;
    let dependent_delete = actions[graph[dependent]].verb == Verb::Delete;
    match (dependency_delete, dependent_delete) {
        (false, false) => link(graph, dependency, dependent, Edge::Requires),
        (true, true) => link(graph, dependent, dependency, Edge::Requires),
        _ => {}
    }
}

fn link(graph: &mut DiGraph<usize, Edge>, from: NodeIndex, to: NodeIndex, edge: Edge) {
    match graph.find_edge(from, to) {
        Some(existing) if edge == Edge::Requires => graph[existing] = Edge::Requires,
        Some(_) => {}
        None => {
            graph.add_edge(from, to, edge);
        }
    }
}

/// Lower sync waves strictly precede higher ones; unannotated actions are wave 0.
fn order_sync_waves(
    graph: &mut DiGraph<usize, Edge>,
    nodes: &[NodeIndex],
    actions: &[Action],
) -> Result<(), PlanError> {
    let mut groups: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (i, action) in actions.iter().enumerate() {
        if action.verb == Verb::Delete {
            continue;
        }
        let wave = match &action.sync_wave {
            Some(raw) => raw.trim().parse::<i64>().map_err(|_| PlanError::InvalidSyncWave {
                resource: action.key.to_string(),
                value: raw.clone(),
            })?,
            None => 0,
        };
        groups.entry(wave).or_default().push(i);
    }

    let groups: Vec<Vec<usize>> = groups.into_values().collect();
    for pair in groups.windows(2) {
        for &earlier in &pair[0] {
            for &later in &pair[1] {
                link(graph, nodes[earlier], nodes[later], Edge::Precedes);
            }
        }
    }
    Ok(())
}

fn cycle_error(graph: &DiGraph<usize, Edge>, actions: &[Action]) -> PlanError {
    let component = tarjan_scc(graph)
        .into_iter()
        .find(|scc| scc.len() > 1 || graph.find_edge(scc[0], scc[0]).is_some())
        .unwrap_or_default();
    let mut members: Vec<String> = component
        .into_iter()
        .map(|n| actions[graph[n]].key.to_string())
        .collect();
    members.sort();
    PlanError::DependencyCycle { members }
}
