//! Dataset persistence boundary. The server only needs to turn a dataset
//! reference into a path a sandbox can read, and to hand derived datasets
//! back for storage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use feature_compiler::DatasetFormat;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ServerError, ServerResult};
use crate::pipeline::FeatureMetadata;

const STAGING_DIR: &str = ".staging";
const METADATA_SUFFIX: &str = ".meta.json";

/// A dataset written by a feature pipeline, not yet persisted.
#[derive(Debug, Clone)]
pub struct DerivedDataset {
    pub source_ref: String,
    pub path: PathBuf,
    pub format: DatasetFormat,
    pub metadata: FeatureMetadata,
}

#[async_trait]
pub trait DatasetRepository: Send + Sync {
    /// Location of an existing dataset.
    async fn resolve(&self, dataset_ref: &str) -> ServerResult<PathBuf>;
    /// A fresh path the pipeline may write its output to.
    async fn staging_path(&self, source_ref: &str, format: DatasetFormat) -> ServerResult<PathBuf>;
    /// Store a derived dataset and return its new reference.
    async fn persist(&self, derived: DerivedDataset) -> ServerResult<String>;
}

/// Sidecar written next to each persisted dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMetadata {
    pub source_ref: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub metadata: FeatureMetadata,
}

/// Datasets as files `<dir>/<ref>.csv` or `<dir>/<ref>.parquet`.
pub struct FsDatasetRepository {
    dir: PathBuf,
}

impl FsDatasetRepository {
    pub async fn new(dir: PathBuf) -> ServerResult<Self> {
        tokio::fs::create_dir_all(dir.join(STAGING_DIR))
            .await
            .map_err(|e| ServerError::Dataset(format!("create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn metadata(&self, dataset_ref: &str) -> ServerResult<StoredMetadata> {
        check_ref(dataset_ref)?;
        let path = self.dir.join(format!("{dataset_ref}{METADATA_SUFFIX}"));
        let content = tokio::fs::read(&path)
            .await
            .map_err(|e| ServerError::Dataset(format!("read {}: {e}", path.display())))?;
        Ok(serde_json::from_slice(&content)?)
    }
}

fn extension(format: DatasetFormat) -> &'static str {
    match format {
        DatasetFormat::Csv => "csv",
        DatasetFormat::Parquet => "parquet",
    }
}

/// References are plain file stems; anything path-like is rejected.
fn check_ref(dataset_ref: &str) -> ServerResult<()> {
    let valid = !dataset_ref.is_empty()
        && !dataset_ref.starts_with('.')
        && dataset_ref
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ServerError::Dataset(format!("invalid dataset reference '{dataset_ref}'")))
    }
}

#[async_trait]
impl DatasetRepository for FsDatasetRepository {
    async fn resolve(&self, dataset_ref: &str) -> ServerResult<PathBuf> {
        check_ref(dataset_ref)?;
        for format in [DatasetFormat::Csv, DatasetFormat::Parquet] {
            let path = self.dir.join(format!("{dataset_ref}.{}", extension(format)));
            if tokio::fs::try_exists(&path).await? {
                return Ok(path);
            }
        }
        Err(ServerError::Dataset(format!("dataset '{dataset_ref}' not found")))
    }

    async fn staging_path(&self, source_ref: &str, format: DatasetFormat) -> ServerResult<PathBuf> {
        check_ref(source_ref)?;
        let name = format!("{source_ref}-{}.{}", uuid::Uuid::new_v4(), extension(format));
        Ok(self.dir.join(STAGING_DIR).join(name))
    }

    async fn persist(&self, derived: DerivedDataset) -> ServerResult<String> {
        let suffix: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(8)
            .collect();
        let dataset_ref = format!("{}-features-{suffix}", derived.source_ref);
        let target = self
            .dir
            .join(format!("{dataset_ref}.{}", extension(derived.format)));
        tokio::fs::rename(&derived.path, &target).await.map_err(|e| {
            ServerError::Dataset(format!("move {}: {e}", derived.path.display()))
        })?;

        let sidecar = StoredMetadata {
            source_ref: derived.source_ref,
            created_at: chrono::Utc::now(),
            metadata: derived.metadata,
        };
        let meta_path = self.dir.join(format!("{dataset_ref}{METADATA_SUFFIX}"));
        tokio::fs::write(&meta_path, serde_json::to_vec_pretty(&sidecar)?).await?;

        info!(dataset_ref = %dataset_ref, path = %target.display(), "derived dataset persisted");
        Ok(dataset_ref)
    }
}
