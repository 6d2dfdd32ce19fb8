//! Phase dependency graph: validation and readiness queries.
//!
//! Uses `petgraph` to model phase dependencies as a directed graph. A
//! topological sort rejects cycles at construction, and the sorted order is
//! kept so readiness and reachability can be evaluated in a single pass.

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use stagehand_types::error::GraphError;
use stagehand_types::phase::{PhaseDefinition, PhaseStatus};
use stagehand_types::unit::{Unit, UnitStatus};

/// Validated, topologically ordered phase graph for one job.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Phases in topological order (dependencies before dependents).
    phases: Vec<PhaseDefinition>,
    index: HashMap<String, usize>,
}

impl DependencyGraph {
    /// Build and validate the graph.
    ///
    /// Rejects an empty phase list, duplicate ids, a `depends_on` entry naming
    /// an undeclared phase, and any dependency cycle.
    pub fn new(phases: &[PhaseDefinition]) -> Result<Self, GraphError> {
        if phases.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut id_to_idx: HashMap<&str, usize> = HashMap::with_capacity(phases.len());
        for (i, phase) in phases.iter().enumerate() {
            if id_to_idx.insert(phase.id.as_str(), i).is_some() {
                return Err(GraphError::DuplicatePhase(phase.id.clone()));
            }
        }

        // Edge from dependency -> dependent
        let mut graph = DiGraph::<&str, ()>::new();
        let nodes: Vec<_> = phases.iter().map(|p| graph.add_node(p.id.as_str())).collect();

        for phase in phases {
            let to_idx = id_to_idx[phase.id.as_str()];
            for dep in &phase.depends_on {
                let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                    GraphError::UnknownDependency(format!(
                        "phase '{}' depends on unknown phase '{}'",
                        phase.id, dep
                    ))
                })?;
                graph.add_edge(nodes[*from_idx], nodes[to_idx], ());
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| {
            let node_id = graph[cycle.node_id()];
            GraphError::CycleDetected(format!("cycle detected involving phase '{node_id}'"))
        })?;

        let ordered: Vec<PhaseDefinition> = sorted
            .into_iter()
            .map(|node| phases[node.index()].clone())
            .collect();
        let index = ordered
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.clone(), i))
            .collect();

        Ok(Self {
            phases: ordered,
            index,
        })
    }

    /// All phases in topological order.
    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    pub fn phase(&self, id: &str) -> Option<&PhaseDefinition> {
        self.index.get(id).map(|&i| &self.phases[i])
    }

    pub fn global_phases(&self) -> impl Iterator<Item = &PhaseDefinition> {
        self.phases.iter().filter(|p| !p.per_unit)
    }

    pub fn per_unit_phases(&self) -> impl Iterator<Item = &PhaseDefinition> {
        self.phases.iter().filter(|p| p.per_unit)
    }

    // -----------------------------------------------------------------------
    // Readiness
    // -----------------------------------------------------------------------

    /// Per-unit phases ready to launch for `unit`, in topological order.
    ///
    /// A phase is ready when every dependency is in the unit's completed set
    /// or in `global_completed`, the unit has no phase running, and the phase
    /// is in neither the unit's completed nor failed set. A failed unit has
    /// nothing ready.
    pub fn ready_for_unit(
        &self,
        unit: &Unit,
        global_completed: &HashSet<String>,
    ) -> Vec<&PhaseDefinition> {
        if unit.status == UnitStatus::Failed || unit.current_phase.is_some() {
            return Vec::new();
        }
        self.per_unit_phases()
            .filter(|phase| !unit.is_attempted(&phase.id))
            .filter(|phase| {
                phase.depends_on.iter().all(|dep| {
                    unit.completed_phases.contains(dep) || global_completed.contains(dep)
                })
            })
            .collect()
    }

    /// Global phases ready to launch, in topological order.
    ///
    /// A global phase is ready when it has not started and each dependency is
    /// either a satisfied global phase or a per-unit phase listed in
    /// `complete_for_all_units`.
    pub fn ready_global(
        &self,
        global_status: &BTreeMap<String, PhaseStatus>,
        complete_for_all_units: &HashSet<String>,
    ) -> Vec<&PhaseDefinition> {
        let status_of = |id: &str| global_status.get(id).copied().unwrap_or_default();
        self.global_phases()
            .filter(|phase| status_of(&phase.id) == PhaseStatus::Pending)
            .filter(|phase| {
                phase.depends_on.iter().all(|dep| match self.phase(dep) {
                    Some(d) if d.per_unit => complete_for_all_units.contains(dep),
                    Some(_) => status_of(dep).is_satisfied(),
                    None => false,
                })
            })
            .collect()
    }

    /// Every phase that depends on `phase_id`, directly or transitively.
    pub fn dependents_of(&self, phase_id: &str) -> HashSet<String> {
        let mut found: HashSet<String> = HashSet::new();
        let mut frontier = vec![phase_id.to_string()];
        while let Some(current) = frontier.pop() {
            for phase in &self.phases {
                if phase.depends_on.contains(&current) && found.insert(phase.id.clone()) {
                    frontier.push(phase.id.clone());
                }
            }
        }
        found
    }

    // -----------------------------------------------------------------------
    // Reachability
    // -----------------------------------------------------------------------

    /// Work that can still happen for the given units and global phases.
    ///
    /// Walks the phases in topological order. A per-unit phase can still
    /// complete for a unit if it already has, or if it has not failed and all
    /// its dependencies can still complete. A pending global phase can still
    /// complete if its global dependencies can, and each per-unit dependency
    /// can complete for every unit that has not failed. Units in FAILED status
    /// are excluded entirely.
    pub fn reachability(
        &self,
        units: &[&Unit],
        global_status: &BTreeMap<String, PhaseStatus>,
    ) -> Reachability {
        let live: Vec<&Unit> = units
            .iter()
            .copied()
            .filter(|u| u.status != UnitStatus::Failed)
            .collect();

        let mut global_ok: HashMap<&str, bool> = HashMap::new();
        let mut unit_ok: HashMap<(&str, &str), bool> = HashMap::new();
        let mut reach = Reachability::default();

        for phase in &self.phases {
            if phase.per_unit {
                for unit in &live {
                    let ok = if unit.completed_phases.contains(&phase.id) {
                        true
                    } else if unit.failed_phases.contains(&phase.id) {
                        false
                    } else {
                        let deps_ok = phase.depends_on.iter().all(|dep| {
                            match self.phase(dep) {
                                Some(d) if d.per_unit => unit_ok
                                    .get(&(unit.unit_id.as_str(), dep.as_str()))
                                    .copied()
                                    .unwrap_or(false),
                                Some(_) => global_ok.get(dep.as_str()).copied().unwrap_or(false),
                                None => false,
                            }
                        });
                        if deps_ok {
                            reach
                                .remaining
                                .entry(unit.unit_id.clone())
                                .or_default()
                                .push(phase.id.clone());
                        }
                        deps_ok
                    };
                    unit_ok.insert((unit.unit_id.as_str(), phase.id.as_str()), ok);
                }
            } else {
                let status = global_status.get(&phase.id).copied().unwrap_or_default();
                let ok = match status {
                    PhaseStatus::Completed | PhaseStatus::Skipped | PhaseStatus::Running => true,
                    PhaseStatus::Failed | PhaseStatus::Blocked => false,
                    PhaseStatus::Pending => {
                        let deps_ok = phase.depends_on.iter().all(|dep| match self.phase(dep) {
                            Some(d) if d.per_unit => {
                                !live.is_empty()
                                    && live.iter().all(|u| {
                                        unit_ok
                                            .get(&(u.unit_id.as_str(), dep.as_str()))
                                            .copied()
                                            .unwrap_or(false)
                                    })
                            }
                            Some(_) => global_ok.get(dep.as_str()).copied().unwrap_or(false),
                            None => false,
                        });
                        if deps_ok {
                            reach.pending_globals.push(phase.id.clone());
                        } else {
                            reach.blocked_globals.push(phase.id.clone());
                        }
                        deps_ok
                    }
                };
                global_ok.insert(phase.id.as_str(), ok);
            }
        }

        reach
    }
}

/// Result of [`DependencyGraph::reachability`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reachability {
    /// Per live unit: unattempted phases that can still complete.
    pub remaining: HashMap<String, Vec<String>>,
    /// Pending global phases that can still run.
    pub pending_globals: Vec<String>,
    /// Pending global phases that never can.
    pub blocked_globals: Vec<String>,
}

impl Reachability {
    pub fn has_remaining(&self, unit_id: &str) -> bool {
        self.remaining.get(unit_id).is_some_and(|r| !r.is_empty())
    }
}
