//! Pipeline configuration from YAML

use crate::core::condition::Expr;
use crate::core::trigger::{EventKind, TriggerRule};
use crate::graph::matrix::MatrixAxis;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Errors that prevent a run from ever starting
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed pipeline document: {0}")]
    Malformed(#[from] serde_yaml::Error),

    #[error("failed to read pipeline document: {0}")]
    Io(#[from] std::io::Error),

    #[error("duplicate job id '{0}'")]
    DuplicateJob(String),

    #[error("job '{job}' depends on unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("cycle detected in job dependencies involving '{0}'")]
    CyclicDependency(String),

    #[error("trigger rule {index}: invalid schedule: {detail}")]
    BadCron { index: usize, detail: String },

    #[error("job '{job}': invalid condition: {detail}")]
    BadCondition { job: String, detail: String },

    #[error("job '{job}': invalid matrix: {detail}")]
    BadMatrix { job: String, detail: String },

    #[error("job '{job}' consumes artifact '{name}' that no dependency produces")]
    UnknownArtifactInput { job: String, name: String },
}

/// How dependency edges fan out between matrix-expanded jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatrixEdgePolicy {
    /// Every instance of the dependency blocks every instance of the dependent
    #[default]
    All,
    /// Instances are linked only when their coordinates agree on shared axes
    Paired,
}

/// Top-level pipeline document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    /// Pipeline version (optional)
    #[serde(default)]
    pub version: Option<String>,

    /// Trigger rules; an empty list accepts every event
    #[serde(default)]
    pub triggers: Vec<TriggerRuleConfig>,

    /// Variables exported to every step's environment
    #[serde(default)]
    variables: HashMap<String, Value>,

    /// Job definitions in declaration order
    pub jobs: Vec<JobConfig>,

    /// Edge fan-out policy between matrix-expanded jobs
    #[serde(default)]
    pub matrix_edges: MatrixEdgePolicy,

    /// Upper bound on concurrently running instances
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// Default timeout for a job instance (in seconds)
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,
}

/// One trigger rule as written in the document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRuleConfig {
    /// Event kind the rule applies to
    pub event: EventKind,

    /// Branch glob filters for push / pull_request rules
    #[serde(default)]
    pub branches: Vec<String>,

    /// Tag glob filters for tag rules
    #[serde(default)]
    pub tags: Vec<String>,

    /// Cron expression for schedule rules (UTC)
    #[serde(default)]
    pub cron: Option<String>,
}

/// Job definition as written in the document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Unique job identifier
    pub id: String,

    /// Job ids this job depends on
    #[serde(default)]
    pub needs: Vec<String>,

    /// Matrix axes; a YAML mapping so axis declaration order is preserved
    #[serde(default)]
    pub matrix: serde_yaml::Mapping,

    /// Condition expression; evaluated against the run context at build time
    #[serde(default)]
    pub condition: Option<String>,

    /// Opaque shell commands, run strictly in order
    #[serde(default)]
    pub steps: Vec<String>,

    /// Artifact names this job consumes
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Artifacts this job produces after success
    #[serde(default)]
    pub outputs: Vec<ArtifactSpec>,

    /// Timeout for this job's instances (overrides the document default)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// A declared artifact output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSpec {
    /// Artifact name; `{axis}` placeholders are filled from the coordinate
    pub name: String,

    /// Path of the produced file, relative to the instance workspace
    pub path: String,
}

impl PipelineConfig {
    /// Load a pipeline document from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a pipeline document from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the document; all errors here surface before any run starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Unique job ids
        let mut seen_ids = HashSet::new();
        for job in &self.jobs {
            if !seen_ids.insert(&job.id) {
                return Err(ConfigError::DuplicateJob(job.id.clone()));
            }
        }

        // Dependencies must resolve
        let job_ids: HashSet<_> = self.jobs.iter().map(|j| j.id.as_str()).collect();
        for job in &self.jobs {
            for dep in &job.needs {
                if !job_ids.contains(dep.as_str()) {
                    return Err(ConfigError::UnknownDependency {
                        job: job.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        self.check_cycles()?;

        // Trigger rules must compile (cron expressions parse)
        TriggerRule::compile_all(&self.triggers)?;

        // Conditions must parse and matrix axes must be well-formed
        for job in &self.jobs {
            if let Some(cond) = &job.condition {
                Expr::parse(cond).map_err(|e| ConfigError::BadCondition {
                    job: job.id.clone(),
                    detail: e.to_string(),
                })?;
            }
            job.matrix_axes()?;
        }

        self.check_artifact_wiring()?;

        Ok(())
    }

    /// Each declared input must be produced by some transitive dependency.
    /// Names carrying `{axis}` placeholders are resolved per instance and
    /// checked at runtime instead.
    fn check_artifact_wiring(&self) -> Result<(), ConfigError> {
        let by_id: HashMap<&str, &JobConfig> =
            self.jobs.iter().map(|j| (j.id.as_str(), j)).collect();

        for job in &self.jobs {
            if job.inputs.is_empty() {
                continue;
            }
            let upstream = self.transitive_deps(&job.id, &by_id);
            let mut produced: HashSet<&str> = HashSet::new();
            for dep in &upstream {
                if let Some(dep_job) = by_id.get(dep.as_str()) {
                    produced.extend(dep_job.outputs.iter().map(|o| o.name.as_str()));
                }
            }
            for input in &job.inputs {
                if input.contains('{') {
                    continue;
                }
                let satisfied = produced
                    .iter()
                    .any(|name| template_matches(name, input));
                if !satisfied {
                    return Err(ConfigError::UnknownArtifactInput {
                        job: job.id.clone(),
                        name: input.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn transitive_deps(&self, id: &str, by_id: &HashMap<&str, &JobConfig>) -> HashSet<String> {
        let mut out = HashSet::new();
        let mut stack: Vec<&str> = by_id
            .get(id)
            .map(|j| j.needs.iter().map(String::as_str).collect())
            .unwrap_or_default();
        while let Some(dep) = stack.pop() {
            if out.insert(dep.to_string()) {
                if let Some(job) = by_id.get(dep) {
                    stack.extend(job.needs.iter().map(String::as_str));
                }
            }
        }
        out
    }

    /// Check for cycles in the job dependency graph
    fn check_cycles(&self) -> Result<(), ConfigError> {
        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();

        for job in &self.jobs {
            if !visited.contains(&job.id) {
                self.dfs_check(&job.id, &mut visited, &mut recursion_stack)?;
            }
        }

        Ok(())
    }

    fn dfs_check(
        &self,
        job_id: &str,
        visited: &mut HashSet<String>,
        recursion_stack: &mut HashSet<String>,
    ) -> Result<(), ConfigError> {
        visited.insert(job_id.to_string());
        recursion_stack.insert(job_id.to_string());

        if let Some(job) = self.jobs.iter().find(|j| j.id == job_id) {
            for dep in &job.needs {
                if recursion_stack.contains(dep) {
                    return Err(ConfigError::CyclicDependency(dep.clone()));
                }
                if !visited.contains(dep) {
                    self.dfs_check(dep, visited, recursion_stack)?;
                }
            }
        }

        recursion_stack.remove(job_id);
        Ok(())
    }

    /// Document variables rendered to strings
    pub fn variables_as_string_map(&self) -> HashMap<String, String> {
        self.variables
            .iter()
            .map(|(k, v)| {
                let rendered = match v {
                    Value::String(s) => s.clone(),
                    Value::Bool(b) => b.to_string(),
                    Value::Number(n) => n.to_string(),
                    other => serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
                };
                (k.clone(), rendered)
            })
            .collect()
    }

    /// Override or add a document variable
    pub fn set_variable(&mut self, key: &str, value: &str) {
        self.variables
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    /// Job lookup by id
    pub fn job(&self, id: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.id == id)
    }
}

impl JobConfig {
    /// Parse the matrix mapping into ordered axes
    pub fn matrix_axes(&self) -> Result<Vec<MatrixAxis>, ConfigError> {
        let mut axes = Vec::with_capacity(self.matrix.len());
        for (key, value) in &self.matrix {
            let name = key
                .as_str()
                .ok_or_else(|| ConfigError::BadMatrix {
                    job: self.id.clone(),
                    detail: "axis name must be a string".to_string(),
                })?
                .to_string();

            let seq = value.as_sequence().ok_or_else(|| ConfigError::BadMatrix {
                job: self.id.clone(),
                detail: format!("axis '{}' must be a list of values", name),
            })?;
            if seq.is_empty() {
                return Err(ConfigError::BadMatrix {
                    job: self.id.clone(),
                    detail: format!("axis '{}' has no values", name),
                });
            }

            let mut values = Vec::with_capacity(seq.len());
            for v in seq {
                let rendered = match v {
                    Value::String(s) => s.clone(),
                    Value::Bool(b) => b.to_string(),
                    Value::Number(n) => n.to_string(),
                    _ => {
                        return Err(ConfigError::BadMatrix {
                            job: self.id.clone(),
                            detail: format!("axis '{}' has a non-scalar value", name),
                        })
                    }
                };
                values.push(rendered);
            }
            axes.push(MatrixAxis { name, values });
        }
        Ok(axes)
    }

    /// Effective timeout in seconds, falling back to the document default
    pub fn effective_timeout(&self, default_timeout_secs: Option<u64>) -> u64 {
        self.timeout_secs
            .or(default_timeout_secs)
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
    }
}

/// Default per-instance timeout when neither job nor document sets one
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Whether a declared output name could produce `name` once its `{axis}`
/// placeholders are interpolated. Placeholders match any substring; the
/// literal fragments must appear in order. Authoritative resolution
/// happens at runtime against the interpolated names.
fn template_matches(template: &str, name: &str) -> bool {
    if !template.contains('{') {
        return template == name;
    }

    let mut literals = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        literals.push(&rest[..open]);
        match rest[open..].find('}') {
            Some(close) => rest = &rest[open + close + 1..],
            None => return false,
        }
    }
    literals.push(rest);

    let mut remaining = name;
    for (i, literal) in literals.iter().enumerate() {
        if literal.is_empty() {
            continue;
        }
        if i == 0 {
            match remaining.strip_prefix(literal) {
                Some(tail) => remaining = tail,
                None => return false,
            }
        } else {
            match remaining.find(literal) {
                Some(pos) => remaining = &remaining[pos + literal.len()..],
                None => return false,
            }
        }
    }
    match literals.last() {
        Some(last) if !last.is_empty() => name.ends_with(last),
        _ => true,
    }
}
