//! Service dependency management
//!
//! Brings a run's auxiliary service cluster up and down: allocates the
//! port interval, resolves the graph, starts everything in parallel, gates
//! on readiness, and unwinds cleanly when anything fails. Also produces
//! the endpoint-injected copy of the compute-run config.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfiguration;
use crate::ports::{PortAllocation, PortAllocator, PortError};
use crate::resolver::{self, ResolveError};
use crate::supervisor::{ProcessStatus, ProcessSupervisor, SupervisorError};
use crate::template::{RunConfig, ServiceKind, Template};

/// Readiness polling tick
const READINESS_POLL: Duration = Duration::from_secs(2);

/// Hard cap on the readiness window
const READINESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from service cluster management
#[derive(Debug, Error)]
pub enum ServicesError {
    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("service {name} failed to start: {source}")]
    StartFailed {
        name: String,
        #[source]
        source: SupervisorError,
    },

    #[error("service {0} errored during readiness")]
    ServiceErrored(String),

    #[error("timed out waiting for services to come online: {pending:?}")]
    ReadinessTimeout { pending: Vec<String> },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Status entry for one service of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusRecord {
    pub name: String,
    pub kind: ServiceKind,
    pub status: ProcessStatus,
}

/// The concrete service cluster of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// The run's port allocation
    pub allocation: PortAllocation,

    /// Per-service statuses at bring-up
    pub services: Vec<ServiceStatusRecord>,

    /// Per-kind WebSocket URLs the compute process connects to
    pub service_urls: HashMap<ServiceKind, Vec<String>>,
}

/// Whether a process name is a service of the given run.
///
/// Services use the `_<runId>` suffix; the compute process uses a
/// distinct `-` separated prefix and is deliberately excluded here.
fn is_service_of_run(name: &str, run_id: &str) -> bool {
    name.rsplit_once('_').map(|(_, id)| id) == Some(run_id)
}

/// Brings service clusters up and down on behalf of the run manager
pub struct ServiceDependencyManager {
    supervisor: Arc<dyn ProcessSupervisor>,
    allocator: Arc<PortAllocator>,
    runtime: RuntimeConfiguration,
    log_dir: PathBuf,
    readiness_poll: Duration,
    readiness_timeout: Duration,
}

impl ServiceDependencyManager {
    /// Create a manager with the default readiness window (2 s poll, 30 s cap)
    pub fn new(
        supervisor: Arc<dyn ProcessSupervisor>,
        allocator: Arc<PortAllocator>,
        runtime: RuntimeConfiguration,
        log_dir: PathBuf,
    ) -> Self {
        Self {
            supervisor,
            allocator,
            runtime,
            log_dir,
            readiness_poll: READINESS_POLL,
            readiness_timeout: READINESS_TIMEOUT,
        }
    }

    /// Override the readiness window (tests)
    pub fn with_readiness_window(mut self, poll: Duration, timeout: Duration) -> Self {
        self.readiness_poll = poll;
        self.readiness_timeout = timeout;
        self
    }

    /// Bring up the full service cluster for a run.
    ///
    /// Returns the cluster description plus the endpoint-injected copy of
    /// the compute-run config. On any failure everything already started
    /// is stopped and the port allocation is released before the original
    /// error surfaces.
    pub async fn start_services_for_run(
        &self,
        run_id: &str,
        template: &Template,
        variant: Option<&str>,
    ) -> Result<(ServiceInfo, RunConfig), ServicesError> {
        let allocation = self.allocator.allocate(run_id)?;

        let graph = match resolver::resolve(
            template,
            variant,
            run_id,
            &allocation,
            &self.runtime,
            &self.log_dir,
        ) {
            Ok(graph) => graph,
            Err(e) => {
                let _ = self.allocator.release(run_id);
                return Err(e.into());
            }
        };

        if graph.services.is_empty() {
            // No ecosystem: the run proceeds without services
            info!("Run {} has no service ecosystem", run_id);
            return Ok((
                ServiceInfo {
                    allocation,
                    services: Vec::new(),
                    service_urls: HashMap::new(),
                },
                template.run_config.clone(),
            ));
        }

        info!(
            "Starting {} services for run {} on [{}, {})",
            graph.services.len(),
            run_id,
            allocation.start,
            allocation.end()
        );

        // Start everything in parallel, collecting per-service outcomes
        let starts = graph.services.iter().map(|service| {
            let supervisor = self.supervisor.clone();
            let spec = service.spec.clone();
            async move {
                let name = spec.name.clone();
                (name, supervisor.start(spec).await)
            }
        });
        let results = futures::future::join_all(starts).await;

        let mut first_failure: Option<ServicesError> = None;
        for (name, result) in results {
            match result {
                Ok(_) => debug!("Service {} started", name),
                Err(e) => {
                    warn!("Service {} failed to start: {}", name, e);
                    if first_failure.is_none() {
                        first_failure = Some(ServicesError::StartFailed { name, source: e });
                    }
                }
            }
        }

        if first_failure.is_none() {
            if let Err(e) = self.wait_for_readiness(run_id).await {
                first_failure = Some(e);
            }
        }

        if let Some(error) = first_failure {
            self.unwind(run_id).await;
            return Err(error);
        }

        let services = self
            .snapshot_services(run_id)
            .await?
            .into_iter()
            .map(|(name, status)| {
                let kind = graph
                    .services
                    .iter()
                    .find(|s| s.spec.name == name)
                    .map(|s| s.kind);
                ServiceStatusRecord {
                    name,
                    // Snapshot names come from the graph we just started
                    kind: kind.unwrap_or(ServiceKind::Variation),
                    status,
                }
            })
            .collect();

        let service_urls = graph.service_urls();
        let config = inject_endpoints(&template.run_config, &service_urls);

        Ok((
            ServiceInfo {
                allocation,
                services,
                service_urls,
            },
            config,
        ))
    }

    /// Poll the supervisor until every service of the run is online.
    async fn wait_for_readiness(&self, run_id: &str) -> Result<(), ServicesError> {
        let deadline = tokio::time::Instant::now() + self.readiness_timeout;

        loop {
            let snapshot = self.snapshot_services(run_id).await?;

            if let Some((name, _)) = snapshot
                .iter()
                .find(|(_, status)| *status == ProcessStatus::Errored)
            {
                return Err(ServicesError::ServiceErrored(name.clone()));
            }

            let pending: Vec<String> = snapshot
                .iter()
                .filter(|(_, status)| *status != ProcessStatus::Online)
                .map(|(name, _)| name.clone())
                .collect();

            if pending.is_empty() {
                info!("All services for run {} are online", run_id);
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ServicesError::ReadinessTimeout { pending });
            }

            tokio::time::sleep(self.readiness_poll).await;
        }
    }

    async fn snapshot_services(
        &self,
        run_id: &str,
    ) -> Result<Vec<(String, ProcessStatus)>, ServicesError> {
        Ok(self
            .supervisor
            .list()
            .await?
            .into_iter()
            .filter(|p| is_service_of_run(&p.name, run_id))
            .map(|p| (p.name, p.status))
            .collect())
    }

    /// Tear down every service of a run, best effort, then release ports.
    pub async fn stop_services_for_run(&self, run_id: &str) {
        let names: Vec<String> = match self.supervisor.list().await {
            Ok(processes) => processes
                .into_iter()
                .filter(|p| is_service_of_run(&p.name, run_id))
                .map(|p| p.name)
                .collect(),
            Err(e) => {
                warn!("Cannot list services for run {}: {}", run_id, e);
                Vec::new()
            }
        };

        for name in names {
            if let Err(e) = self.supervisor.stop(&name).await {
                warn!("Failed to stop {}: {}", name, e);
            }
            if let Err(e) = self.supervisor.delete(&name).await {
                warn!("Failed to delete {}: {}", name, e);
            }
        }

        if self.allocator.release(run_id).is_ok() {
            info!("Released port allocation of run {}", run_id);
        }
    }

    async fn unwind(&self, run_id: &str) {
        warn!("Unwinding service bring-up for run {}", run_id);
        self.stop_services_for_run(run_id).await;
    }
}

/// Substitute resolved service URLs into the recognized endpoint fields
/// of the run config, returning a modified copy.
pub fn inject_endpoints(
    config: &RunConfig,
    urls: &HashMap<ServiceKind, Vec<String>>,
) -> RunConfig {
    let mut config = config.clone();

    if let Some(variation) = urls.get(&ServiceKind::Variation) {
        config.gene_variation_servers = Some(variation.clone());
    }
    if let Some(render) = urls.get(&ServiceKind::Render) {
        config.gene_rendering_servers = Some(render.clone());
    }

    let feature_urls: Vec<String> = [
        ServiceKind::FeatureClap,
        ServiceKind::GenericFeatures,
        ServiceKind::RefFeatures,
    ]
    .iter()
    .filter_map(|k| urls.get(k))
    .flatten()
    .cloned()
    .collect();
    if !feature_urls.is_empty() {
        config.evaluation_feature_servers = Some(feature_urls);
    }

    let projection_urls: Vec<String> = [ServiceKind::QdhfProjection, ServiceKind::UmapProjection]
        .iter()
        .filter_map(|k| urls.get(k))
        .flatten()
        .cloned()
        .collect();
    if !projection_urls.is_empty() {
        config.evaluation_projection_servers = Some(projection_urls);
    }

    if let Some(quality) = urls.get(&ServiceKind::QualityMusicality) {
        config.evaluation_quality_servers = Some(quality.clone());
    }

    // A config using the combined evaluation list gets the union of
    // every resolved evaluation kind
    if config.gene_evaluation_servers.is_some() {
        let evaluation_urls: Vec<String> = [
            ServiceKind::FeatureClap,
            ServiceKind::GenericFeatures,
            ServiceKind::RefFeatures,
            ServiceKind::QualityMusicality,
            ServiceKind::QdhfProjection,
            ServiceKind::UmapProjection,
        ]
        .iter()
        .filter_map(|k| urls.get(k))
        .flatten()
        .cloned()
        .collect();
        if !evaluation_urls.is_empty() {
            config.gene_evaluation_servers = Some(evaluation_urls);
        }
    }

    for classifier in &mut config.classifiers {
        for class_config in &mut classifier.class_configurations {
            let extraction_kind = match (
                class_config.feature_extraction_type.as_deref(),
                class_config.feature_extraction_endpoint.as_deref(),
            ) {
                (Some("clap"), _) => Some(ServiceKind::FeatureClap),
                (Some("vggish"), _) => Some(ServiceKind::GenericFeatures),
                (_, Some(e)) if e.contains("/vggish") => Some(ServiceKind::GenericFeatures),
                (_, Some(e)) if e.contains("reference_embedding") => Some(ServiceKind::RefFeatures),
                _ => None,
            };
            if let (Some(kind), Some(endpoint)) =
                (extraction_kind, class_config.feature_extraction_endpoint.as_deref())
            {
                if let Some(base) = urls.get(&kind).and_then(|u| u.first()) {
                    class_config.feature_extraction_endpoint = Some(rebase(endpoint, base));
                }
            }

            if let Some(endpoint) = class_config.projection_endpoint.as_deref() {
                let kind = if endpoint.contains("qdhf") {
                    ServiceKind::QdhfProjection
                } else {
                    ServiceKind::UmapProjection
                };
                if let Some(base) = urls.get(&kind).and_then(|u| u.first()) {
                    class_config.projection_endpoint = Some(rebase(endpoint, base));
                }
            }

            if let Some(endpoint) = class_config.quality_endpoint.as_deref() {
                if endpoint.contains("musicality") {
                    if let Some(base) = urls
                        .get(&ServiceKind::QualityMusicality)
                        .and_then(|u| u.first())
                    {
                        class_config.quality_endpoint = Some(rebase(endpoint, base));
                    }
                }
            }
        }
    }

    config
}

/// Move an endpoint onto a new base URL, preserving its path and query
fn rebase(endpoint: &str, base: &str) -> String {
    if let Some(scheme_end) = endpoint.find("://") {
        let after_scheme = &endpoint[scheme_end + 3..];
        match after_scheme.find('/') {
            Some(path_at) => format!("{}{}", base, &after_scheme[path_at..]),
            None => base.to_string(),
        }
    } else if endpoint.starts_with('/') {
        format!("{}{}", base, endpoint)
    } else {
        base.to_string()
    }
}
