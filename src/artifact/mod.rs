pub mod store;

pub use store::{Artifact, ArtifactError, ArtifactStore, RetentionPolicy};
