//! In-memory artifact store with write-once names and dependency scoping

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Unknown run: {0}")]
    UnknownRun(String),

    #[error("Artifact '{name}' not found in this run")]
    NotFound { name: String },

    #[error("Artifact '{name}' already published by '{holder}'; rejected from '{producer}'")]
    Duplicate {
        name: String,
        holder: String,
        producer: String,
    },

    #[error("'{consumer}' cannot read artifact '{name}': producer '{producer}' is not upstream")]
    OutOfScope {
        name: String,
        consumer: String,
        producer: String,
    },

    #[error("Failed to flush artifacts: {0}")]
    Io(#[from] std::io::Error),
}

/// A published artifact: metadata plus its bytes
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub name: String,
    /// Instance id that published it
    pub producer: String,
    pub size: usize,
    /// Hex-encoded SHA-256 of the content
    pub digest: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub data: Arc<Vec<u8>>,
}

/// What to do with a run's artifacts once the run reaches a terminal status
#[derive(Debug, Clone, Default)]
pub enum RetentionPolicy {
    /// Drop everything
    #[default]
    Discard,
    /// Keep artifacts readable after the run completes
    Keep,
    /// Write each artifact's bytes to `<dir>/<run_id>/<name>` then drop
    Flush(PathBuf),
}

struct RunArtifacts {
    artifacts: HashMap<String, Artifact>,
    /// consumer instance id -> transitive upstream instance ids
    scope: HashMap<String, HashSet<String>>,
}

/// Write-once, run-scoped artifact storage.
///
/// Names are unique within a run; a second `put` with the same name is
/// rejected regardless of content. Reads are restricted to consumers
/// whose registered scope includes the producer.
#[derive(Default)]
pub struct ArtifactStore {
    runs: RwLock<HashMap<String, RunArtifacts>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open storage for a run and record its consumer scope index
    pub async fn register_run(&self, run_id: &str, scope: HashMap<String, HashSet<String>>) {
        let mut runs = self.runs.write().await;
        runs.insert(
            run_id.to_string(),
            RunArtifacts {
                artifacts: HashMap::new(),
                scope,
            },
        );
    }

    /// Publish an artifact. Rejects the call when the name is taken.
    pub async fn put(
        &self,
        run_id: &str,
        producer: &str,
        name: &str,
        data: Vec<u8>,
    ) -> Result<Artifact, ArtifactError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| ArtifactError::UnknownRun(run_id.to_string()))?;

        if let Some(existing) = run.artifacts.get(name) {
            return Err(ArtifactError::Duplicate {
                name: name.to_string(),
                holder: existing.producer.clone(),
                producer: producer.to_string(),
            });
        }

        let digest = hex_digest(&data);
        let artifact = Artifact {
            name: name.to_string(),
            producer: producer.to_string(),
            size: data.len(),
            digest,
            created_at: Utc::now(),
            data: Arc::new(data),
        };
        debug!(run = run_id, producer, name, size = artifact.size, "artifact published");
        run.artifacts.insert(name.to_string(), artifact.clone());
        Ok(artifact)
    }

    /// Fetch an artifact for a consumer instance.
    ///
    /// The consumer must be registered and the artifact's producer must be
    /// in its transitive upstream set.
    pub async fn get(
        &self,
        run_id: &str,
        consumer: &str,
        name: &str,
    ) -> Result<Artifact, ArtifactError> {
        let runs = self.runs.read().await;
        let run = runs
            .get(run_id)
            .ok_or_else(|| ArtifactError::UnknownRun(run_id.to_string()))?;

        let artifact = run
            .artifacts
            .get(name)
            .ok_or_else(|| ArtifactError::NotFound {
                name: name.to_string(),
            })?;

        let in_scope = run
            .scope
            .get(consumer)
            .map(|upstream| upstream.contains(&artifact.producer))
            .unwrap_or(false);
        if !in_scope {
            return Err(ArtifactError::OutOfScope {
                name: name.to_string(),
                consumer: consumer.to_string(),
                producer: artifact.producer.clone(),
            });
        }

        Ok(artifact.clone())
    }

    /// Artifacts published so far, sorted by name
    pub async fn list(&self, run_id: &str) -> Result<Vec<Artifact>, ArtifactError> {
        let runs = self.runs.read().await;
        let run = runs
            .get(run_id)
            .ok_or_else(|| ArtifactError::UnknownRun(run_id.to_string()))?;
        let mut out: Vec<Artifact> = run.artifacts.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Apply the retention policy now that the run is terminal
    pub async fn finish_run(
        &self,
        run_id: &str,
        policy: &RetentionPolicy,
    ) -> Result<(), ArtifactError> {
        match policy {
            RetentionPolicy::Keep => Ok(()),
            RetentionPolicy::Discard => {
                self.runs.write().await.remove(run_id);
                Ok(())
            }
            RetentionPolicy::Flush(dir) => {
                let removed = self.runs.write().await.remove(run_id);
                if let Some(run) = removed {
                    let run_dir = dir.join(run_id);
                    tokio::fs::create_dir_all(&run_dir).await?;
                    for artifact in run.artifacts.values() {
                        tokio::fs::write(run_dir.join(&artifact.name), artifact.data.as_slice())
                            .await?;
                    }
                }
                Ok(())
            }
        }
    }
}

fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let out = hasher.finalize();
    out.iter().map(|b| format!("{:02x}", b)).collect()
}
