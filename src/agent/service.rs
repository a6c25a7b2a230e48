//! Agent-side deployment service
//!
//! For each deploy-instance request the service resolves the artefact list
//! into `(deployer, destination)` pairs, deduplicates concurrent downloads
//! per destination through a shared-future map, retries failed downloads on
//! a bounded budget, starts the runtime on success, and reference-counts the
//! materialised destinations per instance. A destination whose reference set
//! empties is cleared after a grace period.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::deployer::{
    CodeArtifact, DeployRequest, DeployResult, Deployer, code_destination,
};
use crate::domain_types::{AgentId, InstanceId, RequestId, RuntimeId};
use crate::error::{ErrorCode, Status};
use crate::heartbeat::TimeoutHandler;
use crate::registration::RegistrationCoordinator;

/// Default bounded retries per artefact download.
pub const DEFAULT_DOWNLOAD_RETRY_COUNT: u32 = 3;
/// Default back-off between download attempts.
pub const DEFAULT_DOWNLOAD_RETRY_INTERVAL: Duration = Duration::from_secs(3);
/// Default grace period before an unreferenced destination is cleared.
pub const DEFAULT_CLEAR_CODE_PACKAGE_INTERVAL: Duration = Duration::from_secs(5);

/// Knobs of the deployment pipeline. The retry interval is a constructor
/// parameter so tests can run tight schedules without reaching into state.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub deploy_dir: PathBuf,
    pub download_retry_count: u32,
    pub download_retry_interval: Duration,
    pub clear_code_package_interval: Duration,
}

impl AgentConfig {
    #[must_use]
    pub fn new(deploy_dir: PathBuf) -> Self {
        Self {
            deploy_dir,
            download_retry_count: DEFAULT_DOWNLOAD_RETRY_COUNT,
            download_retry_interval: DEFAULT_DOWNLOAD_RETRY_INTERVAL,
            clear_code_package_interval: DEFAULT_CLEAR_CODE_PACKAGE_INTERVAL,
        }
    }
}

/// A request to place one instance with its code artefacts on this node.
#[derive(Debug, Clone)]
pub struct DeployInstanceRequest {
    pub request_id: RequestId,
    pub instance_id: InstanceId,
    pub artifacts: Vec<CodeArtifact>,
    pub monopoly: bool,
}

/// Starts and stops runtime processes for deployed instances.
#[async_trait::async_trait]
pub trait RuntimeLauncher: Send + Sync {
    async fn start(&self, request: &DeployInstanceRequest) -> Result<RuntimeId, Status>;

    async fn stop(&self, instance_id: &InstanceId) -> Status;
}

/// Which instances reference a deployed destination, and through which
/// deployer it was produced.
pub struct CodeReferInfo {
    pub instances: HashSet<InstanceId>,
    pub deployer: Arc<dyn Deployer>,
    pub last_access: Instant,
}

type SharedDeploy = Shared<BoxFuture<'static, DeployResult>>;

/// The per-node deployment actor.
pub struct AgentService {
    agent_id: AgentId,
    config: AgentConfig,
    deployers: HashMap<String, Arc<dyn Deployer>>,
    launcher: Arc<dyn RuntimeLauncher>,
    deploying: Mutex<HashMap<PathBuf, SharedDeploy>>,
    failed_requests: StdMutex<HashMap<RequestId, Status>>,
    code_refs: Mutex<HashMap<PathBuf, CodeReferInfo>>,
    clear_timers: Mutex<HashMap<PathBuf, tokio::task::JoinHandle<()>>>,
    register_completed: Arc<AtomicBool>,
    shutting_down: AtomicBool,
}

impl AgentService {
    #[must_use]
    pub fn new(
        agent_id: AgentId,
        config: AgentConfig,
        deployers: Vec<Arc<dyn Deployer>>,
        launcher: Arc<dyn RuntimeLauncher>,
    ) -> Arc<Self> {
        let deployers = deployers
            .into_iter()
            .map(|deployer| (deployer.storage_type().to_string(), deployer))
            .collect();
        Arc::new(Self {
            agent_id,
            config,
            deployers,
            launcher,
            deploying: Mutex::new(HashMap::new()),
            failed_requests: StdMutex::new(HashMap::new()),
            code_refs: Mutex::new(HashMap::new()),
            clear_timers: Mutex::new(HashMap::new()),
            register_completed: Arc::new(AtomicBool::new(false)),
            shutting_down: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Shared flag flipped once registration with the scheduler completes;
    /// the health endpoint reports OK off this.
    #[must_use]
    pub fn register_completed(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.register_completed)
    }

    /// Registers with the local scheduler, answering heartbeats once the
    /// handshake completes.
    pub async fn start_registration(
        self: &Arc<Self>,
        coordinator: &RegistrationCoordinator,
        scheduler_name: &str,
        scheduler_address: &str,
        payload: String,
        max_registers: u32,
        timeout_handler: TimeoutHandler,
    ) {
        coordinator.start_ping_responder().await;
        let registered = Arc::clone(&self.register_completed);
        let agent_id = self.agent_id.clone();
        coordinator
            .set_registered_callback(Arc::new(move |_payload| {
                info!(agent = %agent_id, "agent registered with local scheduler");
                registered.store(true, Ordering::SeqCst);
            }))
            .await;
        let timeout_agent = self.agent_id.clone();
        coordinator
            .set_register_timeout_callback(Arc::new(move || {
                error!(agent = %timeout_agent, "registration with local scheduler timed out");
            }))
            .await;
        coordinator
            .arm_heartbeat_observer(
                scheduler_name,
                scheduler_address,
                Duration::from_secs(60),
                timeout_handler,
            )
            .await;
        coordinator.start_register(scheduler_name, scheduler_address, payload, max_registers);
    }

    /// Runs the download → start → reference pipeline for one instance.
    pub async fn deploy_instance(self: &Arc<Self>, request: DeployInstanceRequest) -> Status {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Status::error(ErrorCode::InnerSystemError, "agent is shutting down");
        }
        info!(
            agent = %self.agent_id,
            request = %request.request_id,
            instance = %request.instance_id,
            artifacts = request.artifacts.len(),
            "deploying instance"
        );
        let mut plan: Vec<(Arc<dyn Deployer>, DeployRequest)> = Vec::new();
        for artifact in &request.artifacts {
            let Some(deployer) = self.deployers.get(&artifact.storage_type) else {
                return Status::error(
                    ErrorCode::UserCodeLoad,
                    format!("no deployer for storage type {}", artifact.storage_type),
                );
            };
            plan.push((
                Arc::clone(deployer),
                DeployRequest {
                    artifact: artifact.clone(),
                    destination: code_destination(&self.config.deploy_dir, artifact),
                    monopoly: request.monopoly,
                },
            ));
        }

        let mut failure: Option<Status> = None;
        for (deployer, deploy_request) in &plan {
            let result = self
                .download_shared(Arc::clone(deployer), deploy_request.clone())
                .await;
            if result.status.is_err() {
                error!(
                    request = %request.request_id,
                    destination = %result.destination.display(),
                    status = %result.status,
                    "artefact deployment failed"
                );
                failure = Some(result.status);
                break;
            }
        }
        self.drain_finished_downloads(&plan).await;

        if let Some(status) = failure {
            self.failed_requests
                .lock()
                .expect("failed requests lock")
                .insert(request.request_id.clone(), status.clone());
            self.clean_unreferenced(&plan).await;
            return status;
        }

        match self.launcher.start(&request).await {
            Ok(runtime_id) => {
                info!(
                    request = %request.request_id,
                    instance = %request.instance_id,
                    runtime = %runtime_id,
                    "runtime started"
                );
                for (deployer, deploy_request) in plan {
                    self.add_code_ref(
                        deploy_request.destination,
                        &request.instance_id,
                        deployer,
                    )
                    .await;
                }
                Status::ok()
            }
            Err(status) => {
                error!(
                    request = %request.request_id,
                    instance = %request.instance_id,
                    %status,
                    "runtime start failed"
                );
                self.clean_unreferenced(&plan).await;
                status
            }
        }
    }

    /// One download per destination: concurrent requests share the same
    /// future; monopoly requests always extract fresh.
    async fn download_shared(
        self: &Arc<Self>,
        deployer: Arc<dyn Deployer>,
        request: DeployRequest,
    ) -> DeployResult {
        if !request.monopoly {
            if self.code_refs.lock().await.contains_key(&request.destination) {
                return DeployResult::ok(request.destination);
            }
            let mut deploying = self.deploying.lock().await;
            if let Some(existing) = deploying.get(&request.destination).cloned() {
                drop(deploying);
                return existing.await;
            }
            let future = self.start_download(deployer, request.clone());
            deploying.insert(request.destination.clone(), future.clone());
            drop(deploying);
            return future.await;
        }
        self.start_download(deployer, request).await
    }

    fn start_download(
        self: &Arc<Self>,
        deployer: Arc<dyn Deployer>,
        request: DeployRequest,
    ) -> SharedDeploy {
        let retry_count = self.config.download_retry_count;
        let retry_interval = self.config.download_retry_interval;
        async move {
            let mut attempt = 0;
            loop {
                let result = deployer.deploy(&request).await;
                if result.status.is_ok() || attempt >= retry_count {
                    return result;
                }
                attempt += 1;
                warn!(
                    destination = %request.destination.display(),
                    attempt,
                    retry_count,
                    "code download failed, backing off before retry"
                );
                tokio::time::sleep(retry_interval).await;
            }
        }
        .boxed()
        .shared()
    }

    async fn drain_finished_downloads(&self, plan: &[(Arc<dyn Deployer>, DeployRequest)]) {
        let mut deploying = self.deploying.lock().await;
        for (_, deploy_request) in plan {
            let finished = deploying
                .get(&deploy_request.destination)
                .is_some_and(|future| future.peek().is_some());
            if finished {
                deploying.remove(&deploy_request.destination);
            }
        }
    }

    /// Clears destinations this request materialised that no instance ended
    /// up referencing.
    async fn clean_unreferenced(&self, plan: &[(Arc<dyn Deployer>, DeployRequest)]) {
        let unreferenced: Vec<usize> = {
            let refs = self.code_refs.lock().await;
            plan.iter()
                .enumerate()
                .filter(|(_, (_, deploy_request))| !refs.contains_key(&deploy_request.destination))
                .map(|(index, _)| index)
                .collect()
        };
        for index in unreferenced {
            let (deployer, deploy_request) = &plan[index];
            let _ = deployer.clear(&deploy_request.destination).await;
        }
    }

    async fn add_code_ref(
        self: &Arc<Self>,
        destination: PathBuf,
        instance_id: &InstanceId,
        deployer: Arc<dyn Deployer>,
    ) {
        // A fresh reference cancels any pending grace-period clear.
        if let Some(timer) = self.clear_timers.lock().await.remove(&destination) {
            timer.abort();
        }
        let mut refs = self.code_refs.lock().await;
        let entry = refs.entry(destination).or_insert_with(|| CodeReferInfo {
            instances: HashSet::new(),
            deployer,
            last_access: Instant::now(),
        });
        entry.instances.insert(instance_id.clone());
        entry.last_access = Instant::now();
    }

    /// Stops the runtime and detaches the instance from every destination;
    /// emptied destinations start their grace-period clear timer.
    pub async fn kill_instance(self: &Arc<Self>, instance_id: &InstanceId) -> Status {
        info!(agent = %self.agent_id, instance = %instance_id, "killing instance");
        let stop_status = self.launcher.stop(instance_id).await;
        if stop_status.is_err() {
            warn!(instance = %instance_id, status = %stop_status, "runtime stop reported failure");
        }
        let mut emptied: Vec<PathBuf> = Vec::new();
        {
            let mut refs = self.code_refs.lock().await;
            for (destination, info) in refs.iter_mut() {
                if info.instances.remove(instance_id) && info.instances.is_empty() {
                    emptied.push(destination.clone());
                }
            }
        }
        for destination in emptied {
            self.schedule_clear(destination).await;
        }
        stop_status
    }

    async fn schedule_clear(self: &Arc<Self>, destination: PathBuf) {
        let service = Arc::clone(self);
        let timer_destination = destination.clone();
        let grace = self.config.clear_code_package_interval;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            service.clear_if_unreferenced(&timer_destination).await;
        });
        if let Some(previous) = self
            .clear_timers
            .lock()
            .await
            .insert(destination, handle)
        {
            previous.abort();
        }
    }

    async fn clear_if_unreferenced(self: &Arc<Self>, destination: &Path) {
        let deployer = {
            let mut refs = self.code_refs.lock().await;
            match refs.get(destination) {
                Some(info) if info.instances.is_empty() => {
                    let deployer = Arc::clone(&info.deployer);
                    refs.remove(destination);
                    Some(deployer)
                }
                _ => None,
            }
        };
        self.clear_timers.lock().await.remove(destination);
        if let Some(deployer) = deployer {
            info!(destination = %destination.display(), "clearing unreferenced code package");
            let _ = deployer.clear(destination).await;
        }
    }

    /// Recorded failure for a deploy request, if any.
    #[must_use]
    pub fn failed_request(&self, request_id: &RequestId) -> Option<Status> {
        self.failed_requests
            .lock()
            .expect("failed requests lock")
            .get(request_id)
            .cloned()
    }

    /// Reference count of a destination; `None` when unknown.
    pub async fn reference_count(&self, destination: &Path) -> Option<usize> {
        self.code_refs
            .lock()
            .await
            .get(destination)
            .map(|info| info.instances.len())
    }

    /// Stops timers and clears every cached package.
    pub async fn graceful_shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        info!(agent = %self.agent_id, "agent graceful shutdown");
        for (_, timer) in self.clear_timers.lock().await.drain() {
            timer.abort();
        }
        let drained: Vec<(PathBuf, CodeReferInfo)> =
            self.code_refs.lock().await.drain().collect();
        for (destination, info) in drained {
            let _ = info.deployer.clear(&destination).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::deployer::{ArtifactKind, ObjectFetcher, RemoteDeployer};
    use crate::error::ErrorCode;
    use std::sync::atomic::AtomicU32;

    struct FlakyFetcher {
        failures_before_success: AtomicU32,
        fetch_count: AtomicU32,
    }

    impl FlakyFetcher {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_before_success: AtomicU32::new(failures),
                fetch_count: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl ObjectFetcher for FlakyFetcher {
        async fn fetch(&self, _bucket: &str, _object_id: &str) -> Result<Vec<u8>, ErrorCode> {
            self.fetch_count.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_before_success.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_before_success
                    .store(remaining - 1, Ordering::SeqCst);
                return Err(ErrorCode::UserCodeLoad);
            }
            Ok(b"code".to_vec())
        }
    }

    struct NullLauncher;

    #[async_trait::async_trait]
    impl RuntimeLauncher for NullLauncher {
        async fn start(&self, _request: &DeployInstanceRequest) -> Result<RuntimeId, Status> {
            Ok(RuntimeId::new("rt-1".to_string()))
        }

        async fn stop(&self, _instance_id: &InstanceId) -> Status {
            Status::ok()
        }
    }

    fn fast_config(deploy_dir: PathBuf) -> AgentConfig {
        AgentConfig {
            deploy_dir,
            download_retry_count: 3,
            download_retry_interval: Duration::from_millis(10),
            clear_code_package_interval: Duration::from_millis(50),
        }
    }

    fn service_with_fetcher(
        deploy_dir: PathBuf,
        fetcher: Arc<FlakyFetcher>,
    ) -> Arc<AgentService> {
        AgentService::new(
            AgentId::new("agent-1".to_string()),
            fast_config(deploy_dir),
            vec![Arc::new(RemoteDeployer::new(fetcher))],
            Arc::new(NullLauncher),
        )
    }

    fn request(request_id: &str, instance_id: &str) -> DeployInstanceRequest {
        DeployInstanceRequest {
            request_id: RequestId::new(request_id.to_string()),
            instance_id: InstanceId::new(instance_id.to_string()),
            artifacts: vec![CodeArtifact {
                kind: ArtifactKind::Function,
                storage_type: "remote".to_string(),
                bucket: "bucket-1".to_string(),
                object_id: "echo".to_string(),
            }],
            monopoly: false,
        }
    }

    #[tokio::test]
    async fn test_deploy_retries_then_succeeds_and_clears_after_kill() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = FlakyFetcher::new(2);
        let service = service_with_fetcher(dir.path().to_path_buf(), Arc::clone(&fetcher));
        let deploy = request("req-1", "instA");
        let destination = code_destination(dir.path(), &deploy.artifacts[0]);

        let status = service.deploy_instance(deploy).await;
        assert!(status.is_ok(), "deploy must succeed after two retries: {status}");
        assert_eq!(fetcher.fetch_count.load(Ordering::SeqCst), 3);
        assert_eq!(service.reference_count(&destination).await, Some(1));
        assert!(destination.exists());

        let killed = service
            .kill_instance(&InstanceId::new("instA".to_string()))
            .await;
        assert!(killed.is_ok());

        // Still cached during the grace period.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(destination.exists());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!destination.exists(), "grace period elapsed, package cleared");
        assert_eq!(service.reference_count(&destination).await, None);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_and_record_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = FlakyFetcher::new(u32::MAX);
        let service = service_with_fetcher(dir.path().to_path_buf(), Arc::clone(&fetcher));
        let deploy = request("req-1", "instA");
        let destination = code_destination(dir.path(), &deploy.artifacts[0]);

        let status = service.deploy_instance(deploy).await;
        assert_eq!(status.code, Some(ErrorCode::UserCodeLoad));
        // Initial attempt plus three retries.
        assert_eq!(fetcher.fetch_count.load(Ordering::SeqCst), 4);
        assert!(
            service
                .failed_request(&RequestId::new("req-1".to_string()))
                .is_some()
        );
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn test_concurrent_deploys_share_one_download() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = FlakyFetcher::new(0);
        let service = service_with_fetcher(dir.path().to_path_buf(), Arc::clone(&fetcher));

        let first = Arc::clone(&service);
        let second = Arc::clone(&service);
        let (a, b) = tokio::join!(
            first.deploy_instance(request("req-1", "instA")),
            second.deploy_instance(request("req-2", "instB")),
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
        // Both instances reference the same destination; one download ran
        // (the second request may also observe the already-deployed cache).
        assert!(fetcher.fetch_count.load(Ordering::SeqCst) <= 1);

        let destination = code_destination(dir.path(), &request("req-1", "instA").artifacts[0]);
        assert_eq!(service.reference_count(&destination).await, Some(2));
    }

    #[tokio::test]
    async fn test_new_reference_cancels_pending_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = FlakyFetcher::new(0);
        let service = service_with_fetcher(dir.path().to_path_buf(), Arc::clone(&fetcher));
        let destination = code_destination(dir.path(), &request("req-1", "instA").artifacts[0]);

        assert!(service.deploy_instance(request("req-1", "instA")).await.is_ok());
        assert!(service
            .kill_instance(&InstanceId::new("instA".to_string()))
            .await
            .is_ok());

        // Redeploy within the grace period keeps the package alive.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(service.deploy_instance(request("req-2", "instB")).await.is_ok());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(destination.exists(), "re-referenced package must survive");
        assert_eq!(service.reference_count(&destination).await, Some(1));
    }

    #[tokio::test]
    async fn test_monopoly_deploy_extracts_fresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = FlakyFetcher::new(0);
        let service = service_with_fetcher(dir.path().to_path_buf(), Arc::clone(&fetcher));

        assert!(service.deploy_instance(request("req-1", "instA")).await.is_ok());
        assert_eq!(fetcher.fetch_count.load(Ordering::SeqCst), 1);

        let mut monopoly = request("req-2", "instB");
        monopoly.monopoly = true;
        assert!(service.deploy_instance(monopoly).await.is_ok());
        // The cached destination is not good enough for a monopoly instance.
        assert_eq!(fetcher.fetch_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_clears_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = FlakyFetcher::new(0);
        let service = service_with_fetcher(dir.path().to_path_buf(), Arc::clone(&fetcher));
        let destination = code_destination(dir.path(), &request("req-1", "instA").artifacts[0]);

        assert!(service.deploy_instance(request("req-1", "instA")).await.is_ok());
        service.graceful_shutdown().await;
        assert!(!destination.exists());

        let rejected = service.deploy_instance(request("req-9", "instZ")).await;
        assert!(rejected.is_err());
    }
}
