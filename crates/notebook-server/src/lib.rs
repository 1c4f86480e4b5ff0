//! Collaborative notebook backend.
//!
//! Wires the sandbox sessions, cell locks and realtime hub into one server,
//! and adds the pieces that need all of them: socket command handling,
//! agent tool turns and the feature-engineering pipeline.

pub mod agent;
pub mod collab;
pub mod config;
pub mod datasets;
pub mod error;
pub mod pipeline;
pub mod server;

pub use agent::{AgentRunner, AgentTool, ToolOutcome};
pub use collab::Collaboration;
pub use config::NotebookConfig;
pub use datasets::{DatasetRepository, DerivedDataset, FsDatasetRepository};
pub use error::{ServerError, ServerResult};
pub use pipeline::{ColumnMetadata, FeatureMetadata, FeaturePipeline, FeaturePipelineOutput};
pub use server::NotebookServer;
