//! Agent-side code deployment
//!
//! Per-request download → reference-counted caching → runtime start, with
//! bounded retries, grace-period cleanup and registration back to the local
//! scheduler.

mod deployer;
mod service;

pub use deployer::{
    ArtifactKind, CodeArtifact, DeployRequest, DeployResult, Deployer, ObjectFetcher,
    RemoteDeployer, WorkingDirDeployer, code_destination,
};
pub use service::{
    AgentConfig, AgentService, CodeReferInfo, DEFAULT_CLEAR_CODE_PACKAGE_INTERVAL,
    DEFAULT_DOWNLOAD_RETRY_COUNT, DEFAULT_DOWNLOAD_RETRY_INTERVAL, DeployInstanceRequest,
    RuntimeLauncher,
};
