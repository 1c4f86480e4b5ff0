use std::path::Path;
use std::sync::Arc;

use feature_compiler::{DatasetFormat, FEATURE_METADATA_KIND, FeatureSpec, PipelineIo};
use serde::{Deserialize, Serialize};
use session::SessionService;
use tracing::{debug, info};

use crate::datasets::{DatasetRepository, DerivedDataset};
use crate::error::{ServerError, ServerResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMetadata {
    pub name: String,
    /// pandas dtype name, e.g. `float64`.
    pub dtype: String,
    pub null_count: u64,
}

/// What a pipeline script reports about the derived dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureMetadata {
    pub columns: Vec<ColumnMetadata>,
    #[serde(default)]
    pub row_count: u64,
    #[serde(default)]
    pub sample: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeaturePipelineOutput {
    pub source_ref: String,
    pub dataset_ref: String,
    pub metadata: FeatureMetadata,
    pub script_digest: String,
    pub duration_ms: u64,
}

/// Compiles features, runs them against a dataset in the project's sandbox
/// and persists the result.
pub struct FeaturePipeline {
    sessions: Arc<SessionService>,
    datasets: Arc<dyn DatasetRepository>,
    sample_rows: usize,
}

impl FeaturePipeline {
    pub fn new(
        sessions: Arc<SessionService>,
        datasets: Arc<dyn DatasetRepository>,
        sample_rows: usize,
    ) -> Self {
        Self {
            sessions,
            datasets,
            sample_rows,
        }
    }

    pub async fn run(
        &self,
        project_id: &str,
        dataset_ref: &str,
        features: &[FeatureSpec],
        session_id: Option<&str>,
    ) -> ServerResult<FeaturePipelineOutput> {
        // Invalid features fail before any dataset or sandbox work.
        feature_compiler::validate(features)?;

        let input = self.datasets.resolve(dataset_ref).await?;
        let format = DatasetFormat::from_path(&input);
        let staged = self.datasets.staging_path(dataset_ref, format).await?;

        let result = self
            .execute(project_id, features, session_id, &input, &staged)
            .await;
        let (metadata, script_digest, duration_ms) = match result {
            Ok(done) => done,
            Err(e) => {
                discard(&staged).await;
                return Err(e);
            }
        };

        let persisted = self
            .datasets
            .persist(DerivedDataset {
                source_ref: dataset_ref.to_string(),
                path: staged,
                format,
                metadata: metadata.clone(),
            })
            .await?;
        info!(
            project_id,
            source = dataset_ref,
            derived = %persisted,
            columns = metadata.columns.len(),
            "feature pipeline finished"
        );
        Ok(FeaturePipelineOutput {
            source_ref: dataset_ref.to_string(),
            dataset_ref: persisted,
            metadata,
            script_digest,
            duration_ms,
        })
    }

    async fn execute(
        &self,
        project_id: &str,
        features: &[FeatureSpec],
        session_id: Option<&str>,
        input: &Path,
        output: &Path,
    ) -> ServerResult<(FeatureMetadata, String, u64)> {
        let mut io = PipelineIo::new(utf8(input)?, utf8(output)?);
        io.sample_rows = self.sample_rows;
        let script = feature_compiler::compile_pipeline(features, &io)?;
        debug!(project_id, digest = %script.digest(), "running feature pipeline");

        let result = self
            .sessions
            .execute(project_id, script.source(), session_id, None, None)
            .await?
            .into_result()?;

        let reported = result.output(FEATURE_METADATA_KIND).ok_or_else(|| {
            ServerError::Pipeline("script reported no feature metadata".to_string())
        })?;
        let metadata: FeatureMetadata = serde_json::from_value(reported.data.clone())?;
        if !tokio::fs::try_exists(output).await? {
            return Err(ServerError::Pipeline(
                "script did not write the derived dataset".to_string(),
            ));
        }
        Ok((metadata, script.digest(), result.duration_ms))
    }
}

fn utf8(path: &Path) -> ServerResult<&str> {
    path.to_str()
        .ok_or_else(|| ServerError::Dataset(format!("non UTF-8 path: {}", path.display())))
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "failed to remove staged dataset"),
    }
}
