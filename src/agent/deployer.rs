//! Code-package deployers
//!
//! A deployer materialises one code artefact at a destination directory and
//! can clear it again. The concrete transfer (object store, archive format)
//! sits behind [`ObjectFetcher`]; the cache layout on disk is
//! `<deploy_dir>/layer[/func]/<bucket>/<object>` with path separators in the
//! object id flattened into the directory name.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ErrorCode, Status};

/// What kind of artefact a deploy request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    Function,
    Layer,
    WorkingDir,
}

/// One code artefact of a deploy-instance request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeArtifact {
    pub kind: ArtifactKind,
    /// Selects the deployer (e.g. `"remote"`, `"workingdir"`).
    pub storage_type: String,
    pub bucket: String,
    pub object_id: String,
}

/// A single artefact download bound for `destination`.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub artifact: CodeArtifact,
    pub destination: PathBuf,
    /// Monopoly instances must get a fresh extraction even when the
    /// destination already exists.
    pub monopoly: bool,
}

/// Outcome of one artefact deployment.
#[derive(Debug, Clone)]
pub struct DeployResult {
    pub status: Status,
    pub destination: PathBuf,
}

impl DeployResult {
    #[must_use]
    pub fn ok(destination: PathBuf) -> Self {
        Self {
            status: Status::ok(),
            destination,
        }
    }

    #[must_use]
    pub fn failed(destination: PathBuf, status: Status) -> Self {
        Self {
            status,
            destination,
        }
    }
}

/// Materialises and clears code artefacts.
#[async_trait]
pub trait Deployer: Send + Sync {
    fn storage_type(&self) -> &str;

    async fn deploy(&self, request: &DeployRequest) -> DeployResult;

    async fn clear(&self, destination: &Path) -> Status;
}

/// Transfers object bytes from wherever packages live.
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    async fn fetch(&self, bucket: &str, object_id: &str) -> Result<Vec<u8>, ErrorCode>;
}

/// On-disk destination for one artefact.
#[must_use]
pub fn code_destination(deploy_dir: &Path, artifact: &CodeArtifact) -> PathBuf {
    let mut destination = deploy_dir.join("layer");
    if artifact.kind == ArtifactKind::Function {
        destination = destination.join("func");
    }
    // Object ids may contain path separators; flatten them so one artefact
    // is exactly one directory.
    let flattened = artifact.object_id.replace(['/', '\\'], "_");
    destination.join(&artifact.bucket).join(flattened)
}

/// Deployer that downloads package bytes through an [`ObjectFetcher`].
pub struct RemoteDeployer {
    fetcher: Arc<dyn ObjectFetcher>,
}

impl RemoteDeployer {
    #[must_use]
    pub fn new(fetcher: Arc<dyn ObjectFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Deployer for RemoteDeployer {
    fn storage_type(&self) -> &str {
        "remote"
    }

    async fn deploy(&self, request: &DeployRequest) -> DeployResult {
        let artifact = &request.artifact;
        let bytes = match self.fetcher.fetch(&artifact.bucket, &artifact.object_id).await {
            Ok(bytes) => bytes,
            Err(code) => {
                warn!(
                    bucket = %artifact.bucket,
                    object = %artifact.object_id,
                    %code,
                    "code package download failed"
                );
                return DeployResult::failed(
                    request.destination.clone(),
                    Status::error(ErrorCode::UserCodeLoad, "code package download failed"),
                );
            }
        };
        if let Err(error) = tokio::fs::create_dir_all(&request.destination).await {
            return DeployResult::failed(
                request.destination.clone(),
                Status::error(
                    ErrorCode::UserCodeLoad,
                    format!("cannot create code destination: {error}"),
                ),
            );
        }
        let package = request.destination.join("package.bin");
        if let Err(error) = tokio::fs::write(&package, &bytes).await {
            return DeployResult::failed(
                request.destination.clone(),
                Status::error(
                    ErrorCode::UserCodeLoad,
                    format!("cannot write code package: {error}"),
                ),
            );
        }
        debug!(
            destination = %request.destination.display(),
            bytes = bytes.len(),
            "code package deployed"
        );
        DeployResult::ok(request.destination.clone())
    }

    async fn clear(&self, destination: &Path) -> Status {
        match tokio::fs::remove_dir_all(destination).await {
            Ok(()) => Status::ok(),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Status::ok(),
            Err(error) => Status::error(
                ErrorCode::InnerSystemError,
                format!("cannot clear code destination: {error}"),
            ),
        }
    }
}

/// Deployer that only prepares an instance's working directory.
pub struct WorkingDirDeployer;

#[async_trait]
impl Deployer for WorkingDirDeployer {
    fn storage_type(&self) -> &str {
        "workingdir"
    }

    async fn deploy(&self, request: &DeployRequest) -> DeployResult {
        match tokio::fs::create_dir_all(&request.destination).await {
            Ok(()) => DeployResult::ok(request.destination.clone()),
            Err(error) => DeployResult::failed(
                request.destination.clone(),
                Status::error(
                    ErrorCode::UserCodeLoad,
                    format!("cannot create working dir: {error}"),
                ),
            ),
        }
    }

    async fn clear(&self, destination: &Path) -> Status {
        match tokio::fs::remove_dir_all(destination).await {
            Ok(()) => Status::ok(),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Status::ok(),
            Err(error) => Status::error(
                ErrorCode::InnerSystemError,
                format!("cannot clear working dir: {error}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(kind: ArtifactKind, object_id: &str) -> CodeArtifact {
        CodeArtifact {
            kind,
            storage_type: "remote".to_string(),
            bucket: "bucket-1".to_string(),
            object_id: object_id.to_string(),
        }
    }

    #[test]
    fn test_destination_layout_for_layers_and_functions() {
        let root = Path::new("/var/cache/pkg");
        let layer = code_destination(root, &artifact(ArtifactKind::Layer, "libfoo"));
        assert_eq!(layer, PathBuf::from("/var/cache/pkg/layer/bucket-1/libfoo"));

        let func = code_destination(root, &artifact(ArtifactKind::Function, "echo"));
        assert_eq!(func, PathBuf::from("/var/cache/pkg/layer/func/bucket-1/echo"));
    }

    #[test]
    fn test_object_path_separators_are_flattened() {
        let root = Path::new("/var/cache/pkg");
        let nested = code_destination(root, &artifact(ArtifactKind::Layer, "team/app/v1"));
        assert_eq!(
            nested,
            PathBuf::from("/var/cache/pkg/layer/bucket-1/team_app_v1")
        );
    }

    struct StaticFetcher;

    #[async_trait]
    impl ObjectFetcher for StaticFetcher {
        async fn fetch(&self, _bucket: &str, _object_id: &str) -> Result<Vec<u8>, ErrorCode> {
            Ok(b"payload".to_vec())
        }
    }

    #[tokio::test]
    async fn test_remote_deployer_writes_and_clears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let deployer = RemoteDeployer::new(Arc::new(StaticFetcher));
        let artifact = artifact(ArtifactKind::Function, "echo");
        let destination = code_destination(dir.path(), &artifact);
        let request = DeployRequest {
            artifact,
            destination: destination.clone(),
            monopoly: false,
        };

        let result = deployer.deploy(&request).await;
        assert!(result.status.is_ok());
        assert!(destination.join("package.bin").exists());

        assert!(deployer.clear(&destination).await.is_ok());
        assert!(!destination.exists());
        // Clearing an already-clean destination stays ok.
        assert!(deployer.clear(&destination).await.is_ok());
    }
}
