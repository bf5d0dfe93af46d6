//! Service graph resolution
//!
//! Turns a template's compute-run config plus a chosen ecosystem variant
//! into concrete process specs for the supervisor: which service kinds the
//! run needs, how many replicas of each, on which ports, and with what
//! command lines.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use crate::config::RuntimeConfiguration;
use crate::ports::PortAllocation;
use crate::supervisor::{service_process_name, PeriodicRestart, ProcessSpec};
use crate::template::{RunConfig, ServiceDefinition, ServiceKind, Template};

/// Hour stride for staggered periodic restarts
const RESTART_EVERY_HOURS: u8 = 2;

/// Errors from graph resolution
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("template {template} has no ecosystem variant {variant}")]
    UnknownVariant { template: String, variant: String },

    #[error("invalid argument template for {kind}: {source}")]
    BadArgs {
        kind: ServiceKind,
        #[source]
        source: shell_words::ParseError,
    },
}

/// One resolved service: its spec plus the ports its replicas occupy
#[derive(Debug, Clone)]
pub struct ResolvedService {
    pub kind: ServiceKind,
    pub stateful: bool,
    pub ports: Vec<u16>,
    pub spec: ProcessSpec,
}

/// The concrete service set for a run
#[derive(Debug, Clone, Default)]
pub struct ResolvedGraph {
    pub services: Vec<ResolvedService>,
    pub dimensions: usize,
    pub dimension_cells: Option<u64>,
}

impl ResolvedGraph {
    /// Per-kind WebSocket URLs, derived from the resolved ports
    pub fn service_urls(&self) -> HashMap<ServiceKind, Vec<String>> {
        self.services
            .iter()
            .map(|s| {
                let urls = s
                    .ports
                    .iter()
                    .map(|p| format!("ws://127.0.0.1:{}", p))
                    .collect();
                (s.kind, urls)
            })
            .collect()
    }
}

/// Decide which service kinds a run config requires.
///
/// `variation` and `render` are unconditional; the rest are detected from
/// the classifier configurations and the CMA-MAE block.
pub fn detect_requirements(config: &RunConfig) -> BTreeSet<ServiceKind> {
    let mut required = BTreeSet::new();
    required.insert(ServiceKind::Variation);
    required.insert(ServiceKind::Render);

    for classifier in &config.classifiers {
        for class_config in &classifier.class_configurations {
            let extraction_type = class_config.feature_extraction_type.as_deref().unwrap_or("");
            let extraction_endpoint = class_config
                .feature_extraction_endpoint
                .as_deref()
                .unwrap_or("");

            if extraction_type == "clap" {
                required.insert(ServiceKind::FeatureClap);
            }
            if extraction_type == "vggish" || extraction_endpoint.contains("/vggish") {
                required.insert(ServiceKind::GenericFeatures);
            }
            let has_reference_paths = class_config
                .z_score_normalisation_reference_features_paths
                .as_ref()
                .map(|p| !p.is_empty())
                .unwrap_or(false);
            if has_reference_paths || extraction_endpoint.contains("reference_embedding") {
                required.insert(ServiceKind::RefFeatures);
            }

            if let Some(projection) = class_config.projection_endpoint.as_deref() {
                if projection.contains("qdhf") {
                    required.insert(ServiceKind::QdhfProjection);
                }
                if projection.contains("umap")
                    || projection.contains("pca")
                    || projection.contains("quantised")
                {
                    required.insert(ServiceKind::UmapProjection);
                }
            }

            if let Some(quality) = class_config.quality_endpoint.as_deref() {
                if quality.contains("musicality") {
                    required.insert(ServiceKind::QualityMusicality);
                }
            }
        }
    }

    if config.cma_mae_config.as_ref().map(|c| c.enabled).unwrap_or(false) {
        required.insert(ServiceKind::Pyribs);
    }

    required
}

/// The server-URL list in the config that seeds a kind's instance count.
///
/// Evaluation kinds fall back to the combined `geneEvaluationServers`
/// list when their specific list is absent.
fn configured_server_list<'a>(config: &'a RunConfig, kind: ServiceKind) -> Option<&'a Vec<String>> {
    match kind {
        ServiceKind::Variation => config.gene_variation_servers.as_ref(),
        ServiceKind::Render => config.gene_rendering_servers.as_ref(),
        ServiceKind::FeatureClap | ServiceKind::GenericFeatures | ServiceKind::RefFeatures => {
            config
                .evaluation_feature_servers
                .as_ref()
                .or(config.gene_evaluation_servers.as_ref())
        }
        ServiceKind::QdhfProjection | ServiceKind::UmapProjection => {
            config
                .evaluation_projection_servers
                .as_ref()
                .or(config.gene_evaluation_servers.as_ref())
        }
        ServiceKind::QualityMusicality => config
            .evaluation_quality_servers
            .as_ref()
            .or(config.gene_evaluation_servers.as_ref()),
        ServiceKind::Pyribs => None,
    }
}

fn default_interpreter(kind: ServiceKind, runtime: &RuntimeConfiguration) -> String {
    match kind {
        ServiceKind::Variation | ServiceKind::Render => runtime.node_path.clone(),
        _ => runtime.python_path.clone(),
    }
}

fn default_script(kind: ServiceKind, runtime: &RuntimeConfiguration) -> String {
    let extension = match kind {
        ServiceKind::Variation | ServiceKind::Render => "js",
        _ => "py",
    };
    runtime
        .services_dir
        .join(format!("{}.{}", kind.logical_name(), extension))
        .to_string_lossy()
        .to_string()
}

/// Resolve the full service graph for a run.
///
/// `variant: None` means the template runs without an ecosystem; the
/// graph is empty. Ports come from the config's override table when
/// present, else from the allocation's per-kind offsets.
pub fn resolve(
    template: &Template,
    variant: Option<&str>,
    run_id: &str,
    allocation: &PortAllocation,
    runtime: &RuntimeConfiguration,
    log_dir: &PathBuf,
) -> Result<ResolvedGraph, ResolveError> {
    let Some(variant) = variant else {
        return Ok(ResolvedGraph::default());
    };
    let definitions = template
        .ecosystem(variant)
        .ok_or_else(|| ResolveError::UnknownVariant {
            template: template.name.clone(),
            variant: variant.to_string(),
        })?;

    let config = &template.run_config;
    let required = detect_requirements(config);
    let dimensions = config.dimensions();
    let dimension_cells = config.dimension_cells();

    let mut services = Vec::new();
    for &kind in &required {
        let declared = definitions.iter().find(|d| d.kind == kind);
        let definition = declared.cloned().unwrap_or_else(|| ServiceDefinition {
            kind,
            instances: 1,
            exec_mode: Default::default(),
            stateful: None,
            max_memory_restart_mb: runtime.default_service_memory_mb,
            base_port: None,
            periodic_restart: None,
            script: default_script(kind, runtime),
            args: String::new(),
            interpreter: Some(default_interpreter(kind, runtime)),
        });

        let instances = configured_server_list(config, kind)
            .map(|servers| servers.len() as u16)
            .filter(|n| *n > 0)
            .unwrap_or(definition.instances.max(1));

        // The config's ports table wins; the allocation's deterministic
        // offset is the default and supersedes the definition's own base
        let base_port = config
            .port_override(kind)
            .unwrap_or_else(|| allocation.port_for(kind));
        let ports: Vec<u16> = (0..instances).map(|i| base_port + i).collect();

        let stateful = definition.is_stateful();
        let name = service_process_name(kind.logical_name(), run_id);

        let args = substitute_tokens(
            &definition.args,
            base_port,
            dimensions,
            dimension_cells,
            runtime,
            run_id,
        );
        let args = shell_words::split(&args).map_err(|source| ResolveError::BadArgs { kind, source })?;

        let spec = ProcessSpec {
            name: name.clone(),
            script: substitute_tokens(
                &definition.script,
                base_port,
                dimensions,
                dimension_cells,
                runtime,
                run_id,
            ),
            args,
            cwd: None,
            env: HashMap::new(),
            interpreter: definition
                .interpreter
                .clone()
                .or_else(|| Some(default_interpreter(kind, runtime))),
            instances,
            exec_mode: definition.exec_mode,
            port: Some(base_port),
            autorestart: !stateful,
            max_memory_restart_mb: (!stateful)
                .then_some(definition.max_memory_restart_mb)
                .flatten(),
            periodic_restart: definition.wants_periodic_restart().then_some(PeriodicRestart {
                minute_offset: kind.restart_minute_offset(),
                every_hours: RESTART_EVERY_HOURS,
            }),
            out_log: Some(log_dir.join(format!("{}.out.log", name))),
            err_log: Some(log_dir.join(format!("{}.err.log", name))),
        };

        debug!(
            "Resolved {} for run {}: {} instances on ports {:?}",
            kind, run_id, instances, ports
        );
        services.push(ResolvedService {
            kind,
            stateful,
            ports,
            spec,
        });
    }

    Ok(ResolvedGraph {
        services,
        dimensions,
        dimension_cells,
    })
}

/// Patch well-known tokens in scripts and argument templates
fn substitute_tokens(
    input: &str,
    port: u16,
    dimensions: usize,
    dimension_cells: Option<u64>,
    runtime: &RuntimeConfiguration,
    run_id: &str,
) -> String {
    input
        .replace("{port}", &port.to_string())
        .replace("{dimensions}", &dimensions.to_string())
        .replace(
            "{dimensionCells}",
            &dimension_cells.unwrap_or_default().to_string(),
        )
        .replace("{modelPath}", &runtime.model_dir.to_string_lossy())
        .replace("{runId}", run_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{ClassConfiguration, Classifier, CmaMaeConfig};
    use serde_json::json;

    fn runtime() -> RuntimeConfiguration {
        RuntimeConfiguration {
            cli_script: PathBuf::from("/opt/kromosynth-cli/cli-app/kromosynth.js"),
            services_dir: PathBuf::from("/opt/kromosynth-services"),
            node_path: "node".into(),
            python_path: "python3".into(),
            model_dir: PathBuf::from("/opt/models"),
            default_service_memory_mb: Some(2048),
        }
    }

    fn config_with(class_config: ClassConfiguration) -> RunConfig {
        RunConfig {
            classifiers: vec![Classifier {
                class_configurations: vec![class_config],
                classification_dimensions: vec![json!(100), json!(100)],
                extra: Default::default(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_baseline_requirements() {
        let required = detect_requirements(&RunConfig::default());
        assert!(required.contains(&ServiceKind::Variation));
        assert!(required.contains(&ServiceKind::Render));
        assert_eq!(required.len(), 2);
    }

    #[test]
    fn test_clap_detection() {
        let config = config_with(ClassConfiguration {
            feature_extraction_type: Some("clap".into()),
            ..Default::default()
        });
        assert!(detect_requirements(&config).contains(&ServiceKind::FeatureClap));
    }

    #[test]
    fn test_vggish_detection_by_endpoint() {
        let config = config_with(ClassConfiguration {
            feature_extraction_endpoint: Some("ws://example/vggish".into()),
            ..Default::default()
        });
        assert!(detect_requirements(&config).contains(&ServiceKind::GenericFeatures));
    }

    #[test]
    fn test_reference_features_detection() {
        let config = config_with(ClassConfiguration {
            z_score_normalisation_reference_features_paths: Some(vec!["/data/ref.json".into()]),
            ..Default::default()
        });
        assert!(detect_requirements(&config).contains(&ServiceKind::RefFeatures));

        let empty = config_with(ClassConfiguration {
            z_score_normalisation_reference_features_paths: Some(vec![]),
            ..Default::default()
        });
        assert!(!detect_requirements(&empty).contains(&ServiceKind::RefFeatures));
    }

    #[test]
    fn test_projection_and_quality_detection() {
        let config = config_with(ClassConfiguration {
            projection_endpoint: Some("/qdhf?dims=2".into()),
            quality_endpoint: Some("/musicality".into()),
            ..Default::default()
        });
        let required = detect_requirements(&config);
        assert!(required.contains(&ServiceKind::QdhfProjection));
        assert!(required.contains(&ServiceKind::QualityMusicality));
        assert!(!required.contains(&ServiceKind::UmapProjection));

        let umap = config_with(ClassConfiguration {
            projection_endpoint: Some("/umap".into()),
            ..Default::default()
        });
        assert!(detect_requirements(&umap).contains(&ServiceKind::UmapProjection));
    }

    #[test]
    fn test_pyribs_detection() {
        let mut config = RunConfig::default();
        config.cma_mae_config = Some(CmaMaeConfig {
            enabled: true,
            extra: Default::default(),
        });
        assert!(detect_requirements(&config).contains(&ServiceKind::Pyribs));
    }

    fn template_with(config: RunConfig, definitions: Vec<ServiceDefinition>) -> Template {
        let mut ecosystems = std::collections::HashMap::new();
        ecosystems.insert("default".to_string(), definitions);
        Template {
            name: "test".into(),
            run_config: config,
            hyperparameters: serde_json::Value::Null,
            ecosystems,
        }
    }

    #[test]
    fn test_resolve_ports_and_instances() {
        let config = RunConfig::default();
        let definitions = vec![ServiceDefinition {
            kind: ServiceKind::Variation,
            instances: 2,
            exec_mode: Default::default(),
            stateful: None,
            max_memory_restart_mb: Some(1024),
            base_port: None,
            periodic_restart: None,
            script: "variation.js".into(),
            args: "--port {port} --dims {dimensions}".into(),
            interpreter: Some("node".into()),
        }];
        let template = template_with(config, definitions);
        let allocation = PortAllocation { start: 50000, size: 1000 };

        let graph = resolve(
            &template,
            Some("default"),
            "run-1",
            &allocation,
            &runtime(),
            &PathBuf::from("/tmp/logs"),
        )
        .unwrap();

        let variation = graph
            .services
            .iter()
            .find(|s| s.kind == ServiceKind::Variation)
            .unwrap();
        assert_eq!(variation.ports, vec![50051, 50052]);
        assert_eq!(variation.spec.name, "kromosynth-gRPC-variation_run-1");
        assert_eq!(
            variation.spec.args,
            vec!["--port", "50051", "--dims", "0"]
        );
        assert!(variation.spec.autorestart);
        assert_eq!(variation.spec.max_memory_restart_mb, Some(1024));
        assert!(variation.spec.periodic_restart.is_some());

        // Render was required but undeclared: synthesized from defaults
        let render = graph
            .services
            .iter()
            .find(|s| s.kind == ServiceKind::Render)
            .unwrap();
        assert_eq!(render.ports, vec![50061]);
    }

    #[test]
    fn test_config_port_override_wins() {
        let mut config = RunConfig::default();
        let mut ports = std::collections::HashMap::new();
        ports.insert("variation".to_string(), 60100u16);
        config.ports = Some(ports);

        let template = template_with(config, vec![]);
        let allocation = PortAllocation { start: 50000, size: 1000 };
        let graph = resolve(
            &template,
            Some("default"),
            "run-1",
            &allocation,
            &runtime(),
            &PathBuf::from("/tmp/logs"),
        )
        .unwrap();

        let variation = graph
            .services
            .iter()
            .find(|s| s.kind == ServiceKind::Variation)
            .unwrap();
        assert_eq!(variation.ports, vec![60100]);
    }

    #[test]
    fn test_server_list_seeds_instances() {
        let mut config = RunConfig::default();
        config.gene_variation_servers = Some(vec![
            "ws://old:1".into(),
            "ws://old:2".into(),
            "ws://old:3".into(),
        ]);

        let template = template_with(config, vec![]);
        let allocation = PortAllocation { start: 50000, size: 1000 };
        let graph = resolve(
            &template,
            Some("default"),
            "run-1",
            &allocation,
            &runtime(),
            &PathBuf::from("/tmp/logs"),
        )
        .unwrap();

        let variation = graph
            .services
            .iter()
            .find(|s| s.kind == ServiceKind::Variation)
            .unwrap();
        assert_eq!(variation.ports, vec![50051, 50052, 50053]);
    }

    #[test]
    fn test_combined_evaluation_list_seeds_evaluation_kinds() {
        let mut config = config_with(ClassConfiguration {
            feature_extraction_type: Some("clap".into()),
            quality_endpoint: Some("/musicality".into()),
            ..Default::default()
        });
        config.gene_evaluation_servers = Some(vec!["ws://old:1".into(), "ws://old:2".into()]);

        let template = template_with(config, vec![]);
        let allocation = PortAllocation { start: 50000, size: 1000 };
        let graph = resolve(
            &template,
            Some("default"),
            "run-1",
            &allocation,
            &runtime(),
            &PathBuf::from("/tmp/logs"),
        )
        .unwrap();

        let clap = graph
            .services
            .iter()
            .find(|s| s.kind == ServiceKind::FeatureClap)
            .unwrap();
        assert_eq!(clap.ports, vec![50071, 50072]);

        let quality = graph
            .services
            .iter()
            .find(|s| s.kind == ServiceKind::QualityMusicality)
            .unwrap();
        assert_eq!(quality.ports.len(), 2);

        // Variation does not read the evaluation list
        let variation = graph
            .services
            .iter()
            .find(|s| s.kind == ServiceKind::Variation)
            .unwrap();
        assert_eq!(variation.ports, vec![50051]);
    }

    #[test]
    fn test_specific_evaluation_list_wins_over_combined() {
        let mut config = config_with(ClassConfiguration {
            feature_extraction_type: Some("clap".into()),
            ..Default::default()
        });
        config.gene_evaluation_servers = Some(vec!["ws://old:1".into(), "ws://old:2".into()]);
        config.evaluation_feature_servers = Some(vec!["ws://old:3".into()]);

        let template = template_with(config, vec![]);
        let allocation = PortAllocation { start: 50000, size: 1000 };
        let graph = resolve(
            &template,
            Some("default"),
            "run-1",
            &allocation,
            &runtime(),
            &PathBuf::from("/tmp/logs"),
        )
        .unwrap();

        let clap = graph
            .services
            .iter()
            .find(|s| s.kind == ServiceKind::FeatureClap)
            .unwrap();
        assert_eq!(clap.ports, vec![50071]);
    }

    #[test]
    fn test_stateful_services_get_no_restart_policies() {
        let mut config = RunConfig::default();
        config.cma_mae_config = Some(CmaMaeConfig {
            enabled: true,
            extra: Default::default(),
        });

        let template = template_with(config, vec![]);
        let allocation = PortAllocation { start: 50000, size: 1000 };
        let graph = resolve(
            &template,
            Some("default"),
            "run-1",
            &allocation,
            &runtime(),
            &PathBuf::from("/tmp/logs"),
        )
        .unwrap();

        let pyribs = graph
            .services
            .iter()
            .find(|s| s.kind == ServiceKind::Pyribs)
            .unwrap();
        assert!(pyribs.stateful);
        assert!(!pyribs.spec.autorestart);
        assert!(pyribs.spec.max_memory_restart_mb.is_none());
        assert!(pyribs.spec.periodic_restart.is_none());
    }

    #[test]
    fn test_no_variant_yields_empty_graph() {
        let template = template_with(RunConfig::default(), vec![]);
        let allocation = PortAllocation { start: 50000, size: 1000 };
        let graph = resolve(
            &template,
            None,
            "run-1",
            &allocation,
            &runtime(),
            &PathBuf::from("/tmp/logs"),
        )
        .unwrap();
        assert!(graph.services.is_empty());
    }

    #[test]
    fn test_unknown_variant_is_an_error() {
        let template = template_with(RunConfig::default(), vec![]);
        let allocation = PortAllocation { start: 50000, size: 1000 };
        let result = resolve(
            &template,
            Some("missing"),
            "run-1",
            &allocation,
            &runtime(),
            &PathBuf::from("/tmp/logs"),
        );
        assert!(matches!(result, Err(ResolveError::UnknownVariant { .. })));
    }

    #[test]
    fn test_service_urls() {
        let template = template_with(RunConfig::default(), vec![]);
        let allocation = PortAllocation { start: 50000, size: 1000 };
        let graph = resolve(
            &template,
            Some("default"),
            "run-1",
            &allocation,
            &runtime(),
            &PathBuf::from("/tmp/logs"),
        )
        .unwrap();

        let urls = graph.service_urls();
        assert_eq!(
            urls[&ServiceKind::Variation],
            vec!["ws://127.0.0.1:50051".to_string()]
        );
    }
}
