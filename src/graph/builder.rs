//! Job graph construction - matrix expansion, condition gating, edges
//!
//! Turns the validated document into a DAG of concrete job instances.
//! All configuration errors surface here or earlier; once a `JobGraph`
//! exists the run can always be driven to a terminal status.

use crate::core::condition::Expr;
use crate::core::config::{ArtifactSpec, ConfigError, MatrixEdgePolicy, PipelineConfig};
use crate::core::context::RunContext;
use crate::core::state::{InstanceReport, InstanceStatus};
use crate::graph::matrix::{self, MatrixCoordinate};
use chrono::Utc;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// One concrete expansion of a job definition for one matrix coordinate
#[derive(Debug, Clone)]
pub struct JobInstance {
    /// Instance id: job id plus rendered coordinate, e.g. `test[os=linux]`
    pub id: String,

    /// Job definition this instance was expanded from
    pub job: String,

    pub coordinate: MatrixCoordinate,

    /// Opaque shell commands, run strictly in order
    pub steps: Vec<String>,

    pub timeout_secs: u64,

    /// Artifact names to materialize before the steps run (interpolated)
    pub inputs: Vec<String>,

    /// Artifacts to publish after success (names and paths interpolated)
    pub outputs: Vec<ArtifactSpec>,

    pub status: InstanceStatus,
}

impl JobInstance {
    pub fn report(&self) -> InstanceReport {
        InstanceReport {
            id: self.id.clone(),
            job: self.job.clone(),
            coordinate: self.coordinate.to_string(),
            status: self.status.clone(),
        }
    }
}

/// The run's execution plan: job instances and their dependency edges.
///
/// All run state lives in the instance statuses; the scheduler itself is
/// stateless between runs.
#[derive(Debug)]
pub struct JobGraph {
    graph: DiGraph<JobInstance, ()>,
    /// Node indices in declaration order; scheduling ties break on this
    order: Vec<NodeIndex>,
    by_id: HashMap<String, NodeIndex>,
}

impl JobGraph {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Instances in declaration order
    pub fn instances(&self) -> impl Iterator<Item = &JobInstance> {
        self.order.iter().filter_map(|&idx| self.graph.node_weight(idx))
    }

    pub fn instance(&self, id: &str) -> Option<&JobInstance> {
        self.by_id.get(id).and_then(|&idx| self.graph.node_weight(idx))
    }

    /// Ids of the instances a given instance directly depends on
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.by_id
            .get(id)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .filter_map(|n| self.graph.node_weight(n))
                    .map(|i| i.id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First runnable instance in declaration order, if any
    pub fn next_runnable(&self) -> Option<JobInstance> {
        self.instances()
            .find(|i| i.status == InstanceStatus::Runnable)
            .cloned()
    }

    pub fn mark_running(&mut self, id: &str) {
        self.set_status(
            id,
            InstanceStatus::Running {
                started_at: Utc::now(),
            },
        );
    }

    pub fn mark_succeeded(&mut self, id: &str) {
        let started_at = match self.instance(id).map(|i| &i.status) {
            Some(InstanceStatus::Running { started_at }) => *started_at,
            _ => Utc::now(),
        };
        self.set_status(
            id,
            InstanceStatus::Succeeded {
                started_at,
                finished_at: Utc::now(),
            },
        );
    }

    pub fn mark_failed(&mut self, id: &str, detail: String) {
        let started_at = match self.instance(id).map(|i| &i.status) {
            Some(InstanceStatus::Running { started_at }) => Some(*started_at),
            _ => None,
        };
        self.set_status(
            id,
            InstanceStatus::Failed {
                detail,
                started_at,
                finished_at: Utc::now(),
            },
        );
    }

    fn set_status(&mut self, id: &str, status: InstanceStatus) {
        if let Some(&idx) = self.by_id.get(id) {
            if let Some(instance) = self.graph.node_weight_mut(idx) {
                instance.status = status;
            }
        }
    }

    /// Re-evaluate non-terminal instances against their dependencies.
    ///
    /// An instance becomes `Runnable` when every dependency succeeded and
    /// `Skipped` when any dependency is failed/skipped/canceled. Skip
    /// propagation is transitive, so this iterates to a fixpoint. Returns
    /// true when any status changed.
    pub fn resolve(&mut self) -> bool {
        let mut changed_any = false;
        loop {
            let mut changed = false;
            for &idx in &self.order {
                let status = match self.graph.node_weight(idx) {
                    Some(i) => i.status.clone(),
                    None => continue,
                };
                if !matches!(status, InstanceStatus::Pending | InstanceStatus::Blocked) {
                    continue;
                }

                let mut blocking: Option<(String, &'static str)> = None;
                let mut outstanding = false;
                for dep_idx in self.graph.neighbors_directed(idx, Direction::Incoming) {
                    let dep = match self.graph.node_weight(dep_idx) {
                        Some(d) => d,
                        None => continue,
                    };
                    match &dep.status {
                        s if s.blocks_dependents() => {
                            let word = match s {
                                InstanceStatus::Failed { .. } => "failed",
                                InstanceStatus::Skipped { .. } => "was skipped",
                                _ => "was canceled",
                            };
                            blocking = Some((dep.id.clone(), word));
                            break;
                        }
                        s if s.is_succeeded() => {}
                        _ => outstanding = true,
                    }
                }

                let next = if let Some((dep_id, word)) = blocking {
                    Some(InstanceStatus::Skipped {
                        reason: format!("dependency '{}' {}", dep_id, word),
                    })
                } else if outstanding {
                    if status == InstanceStatus::Pending {
                        Some(InstanceStatus::Blocked)
                    } else {
                        None
                    }
                } else {
                    Some(InstanceStatus::Runnable)
                };

                if let Some(next) = next {
                    if let Some(instance) = self.graph.node_weight_mut(idx) {
                        instance.status = next;
                        changed = true;
                    }
                }
            }
            changed_any |= changed;
            if !changed {
                break;
            }
        }
        changed_any
    }

    /// Cancel every instance that has not been dispatched yet
    pub fn cancel_undispatched(&mut self) {
        for &idx in &self.order {
            if let Some(instance) = self.graph.node_weight_mut(idx) {
                if matches!(
                    instance.status,
                    InstanceStatus::Pending
                        | InstanceStatus::Blocked
                        | InstanceStatus::Runnable
                ) {
                    instance.status = InstanceStatus::Canceled;
                }
            }
        }
    }

    /// Force every non-terminal instance to `Skipped`. Last-resort guard
    /// so a run can always reach a terminal status.
    pub fn skip_stranded(&mut self, reason: &str) {
        for &idx in &self.order {
            if let Some(instance) = self.graph.node_weight_mut(idx) {
                if !instance.status.is_terminal() {
                    instance.status = InstanceStatus::Skipped {
                        reason: reason.to_string(),
                    };
                }
            }
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.instances().all(|i| i.status.is_terminal())
    }

    pub fn any_failed(&self) -> bool {
        self.instances()
            .any(|i| matches!(i.status, InstanceStatus::Failed { .. }))
    }

    /// Transitive upstream instance ids per instance; the artifact store
    /// uses this as the consumer scope index.
    pub fn upstream_sets(&self) -> HashMap<String, HashSet<String>> {
        let mut out = HashMap::with_capacity(self.order.len());
        for &idx in &self.order {
            let Some(instance) = self.graph.node_weight(idx) else {
                continue;
            };
            let mut upstream = HashSet::new();
            let mut stack: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .collect();
            while let Some(dep_idx) = stack.pop() {
                if let Some(dep) = self.graph.node_weight(dep_idx) {
                    if upstream.insert(dep.id.clone()) {
                        stack.extend(self.graph.neighbors_directed(dep_idx, Direction::Incoming));
                    }
                }
            }
            out.insert(instance.id.clone(), upstream);
        }
        out
    }

    /// Full per-instance status table in declaration order
    pub fn reports(&self) -> Vec<InstanceReport> {
        self.instances().map(|i| i.report()).collect()
    }
}

/// Builder for the run's job instance DAG
pub struct GraphBuilder<'a> {
    config: &'a PipelineConfig,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    /// Expand the document into a `JobGraph` for one run.
    ///
    /// Conditions are evaluated here, once, against the run context; a
    /// false condition pre-marks every instance of that job `Skipped`.
    /// On any error no instance survives.
    pub fn build(&self, ctx: &RunContext) -> Result<JobGraph, ConfigError> {
        self.config.validate()?;

        let mut graph = DiGraph::new();
        let mut order = Vec::new();
        let mut by_id = HashMap::new();
        let mut nodes_by_job: HashMap<String, Vec<NodeIndex>> = HashMap::new();

        for job in &self.config.jobs {
            let condition_met = match &job.condition {
                Some(source) => {
                    let expr = Expr::parse(source).map_err(|e| ConfigError::BadCondition {
                        job: job.id.clone(),
                        detail: e.to_string(),
                    })?;
                    expr.evaluate(ctx).map_err(|e| ConfigError::BadCondition {
                        job: job.id.clone(),
                        detail: e.to_string(),
                    })?
                }
                None => true,
            };

            let axes = job.matrix_axes()?;
            for coordinate in matrix::expand(&axes) {
                let id = format!("{}{}", job.id, coordinate);
                let status = if condition_met {
                    InstanceStatus::Pending
                } else {
                    InstanceStatus::Skipped {
                        reason: "condition evaluated to false".to_string(),
                    }
                };
                let instance = JobInstance {
                    id: id.clone(),
                    job: job.id.clone(),
                    steps: job.steps.clone(),
                    timeout_secs: job.effective_timeout(self.config.default_timeout_secs),
                    inputs: job
                        .inputs
                        .iter()
                        .map(|name| coordinate.interpolate(name))
                        .collect(),
                    outputs: job
                        .outputs
                        .iter()
                        .map(|spec| ArtifactSpec {
                            name: coordinate.interpolate(&spec.name),
                            path: coordinate.interpolate(&spec.path),
                        })
                        .collect(),
                    coordinate,
                    status,
                };
                let idx = graph.add_node(instance);
                order.push(idx);
                by_id.insert(id, idx);
                nodes_by_job.entry(job.id.clone()).or_default().push(idx);
            }
        }

        // Dependency edges: all-to-all between expansions, or narrowed to
        // coordinate-compatible pairs under the paired policy.
        for job in &self.config.jobs {
            let dependents = &nodes_by_job[&job.id];
            for dep in &job.needs {
                let producers =
                    nodes_by_job
                        .get(dep)
                        .ok_or_else(|| ConfigError::UnknownDependency {
                            job: job.id.clone(),
                            dependency: dep.clone(),
                        })?;
                for &from in producers {
                    for &to in dependents {
                        if self.config.matrix_edges == MatrixEdgePolicy::Paired {
                            let a = &graph[from].coordinate;
                            let b = &graph[to].coordinate;
                            if !a.agrees_with(b) {
                                continue;
                            }
                        }
                        graph.add_edge(from, to, ());
                    }
                }
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            let name = graph
                .node_weight(cycle.node_id())
                .map(|i| i.job.clone())
                .unwrap_or_default();
            return Err(ConfigError::CyclicDependency(name));
        }

        Ok(JobGraph {
            graph,
            order,
            by_id,
        })
    }
}
