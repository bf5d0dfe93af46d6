//! Templates, ecosystem variants, and the compute-run configuration model
//!
//! Templates arrive already parsed (the on-disk JSONC files and the CLI
//! tooling that generates them live outside this crate). The run config is
//! a semi-open map: the fields the service graph resolver recognizes are
//! typed, everything else passes through an opaque container and is written
//! back unchanged into the working config.

use std::collections::HashMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Logical service kinds, closed set.
///
/// Discriminant order is load-bearing: it determines each kind's port
/// sub-offset inside an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u16)]
pub enum ServiceKind {
    Variation = 0,
    Render = 1,
    FeatureClap = 2,
    GenericFeatures = 3,
    RefFeatures = 4,
    QdhfProjection = 5,
    UmapProjection = 6,
    QualityMusicality = 7,
    Pyribs = 8,
}

impl ServiceKind {
    /// All kinds, in port-offset order
    pub const ALL: [ServiceKind; 9] = [
        ServiceKind::Variation,
        ServiceKind::Render,
        ServiceKind::FeatureClap,
        ServiceKind::GenericFeatures,
        ServiceKind::RefFeatures,
        ServiceKind::QdhfProjection,
        ServiceKind::UmapProjection,
        ServiceKind::QualityMusicality,
        ServiceKind::Pyribs,
    ];

    /// Logical process name. Must not contain `_`, which is reserved as
    /// the run-id separator in supervisor process names.
    pub fn logical_name(&self) -> &'static str {
        match self {
            ServiceKind::Variation => "kromosynth-gRPC-variation",
            ServiceKind::Render => "kromosynth-render",
            ServiceKind::FeatureClap => "kromosynth-evaluate-clap",
            ServiceKind::GenericFeatures => "kromosynth-evaluate-features",
            ServiceKind::RefFeatures => "kromosynth-evaluate-ref-features",
            ServiceKind::QdhfProjection => "kromosynth-projection-qdhf",
            ServiceKind::UmapProjection => "kromosynth-projection-umap",
            ServiceKind::QualityMusicality => "kromosynth-quality-musicality",
            ServiceKind::Pyribs => "kromosynth-pyribs",
        }
    }

    /// Config key used in the `ports` override table
    pub fn config_key(&self) -> &'static str {
        match self {
            ServiceKind::Variation => "variation",
            ServiceKind::Render => "render",
            ServiceKind::FeatureClap => "featureClap",
            ServiceKind::GenericFeatures => "genericFeatures",
            ServiceKind::RefFeatures => "refFeatures",
            ServiceKind::QdhfProjection => "qdhfProjection",
            ServiceKind::UmapProjection => "umapProjection",
            ServiceKind::QualityMusicality => "qualityMusicality",
            ServiceKind::Pyribs => "pyribs",
        }
    }

    /// Whether this kind holds state that cannot be rebuilt after a
    /// restart (trained projection models, the in-memory search archive).
    /// Stateful services are never auto-restarted once running.
    pub fn default_stateful(&self) -> bool {
        matches!(
            self,
            ServiceKind::QdhfProjection | ServiceKind::UmapProjection | ServiceKind::Pyribs
        )
    }

    /// Staggered minute offset for periodic restarts, distinct per kind
    /// so stateless services never restart in the same minute.
    pub fn restart_minute_offset(&self) -> u8 {
        match self {
            ServiceKind::Variation => 10,
            ServiceKind::Render => 20,
            ServiceKind::FeatureClap => 30,
            ServiceKind::GenericFeatures => 40,
            ServiceKind::RefFeatures => 50,
            ServiceKind::QdhfProjection => 15,
            ServiceKind::UmapProjection => 25,
            ServiceKind::QualityMusicality => 45,
            ServiceKind::Pyribs => 55,
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.config_key())
    }
}

/// Execution mode for a replicated service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// N instances listening on contiguous ports starting at the base
    #[default]
    Cluster,

    /// N fully independent instances
    Fork,
}

/// Declarative record of one auxiliary process in an ecosystem variant
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    /// Logical service kind
    pub kind: ServiceKind,

    /// Number of parallel replicas
    #[serde(default = "default_instances")]
    pub instances: u16,

    /// Execution mode
    #[serde(default)]
    pub exec_mode: ExecMode,

    /// Stateful override; absent means the kind's default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful: Option<bool>,

    /// Memory ceiling in MB that triggers a restart (stateless only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_restart_mb: Option<u64>,

    /// Base port override; absent means the allocation decides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_port: Option<u16>,

    /// Whether the service gets a staggered periodic restart; absent
    /// means yes for stateless kinds, never for stateful ones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub periodic_restart: Option<bool>,

    /// Script or executable path
    pub script: String,

    /// Argument template; `{port}`, `{dimensions}`, `{dimensionCells}`,
    /// `{modelPath}` and `{runId}` are substituted by the resolver
    #[serde(default)]
    pub args: String,

    /// Interpreter override (node, python, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
}

impl ServiceDefinition {
    /// Effective stateful flag
    pub fn is_stateful(&self) -> bool {
        self.stateful.unwrap_or_else(|| self.kind.default_stateful())
    }

    /// Whether this service receives a staggered periodic restart
    pub fn wants_periodic_restart(&self) -> bool {
        !self.is_stateful() && self.periodic_restart.unwrap_or(true)
    }
}

fn default_instances() -> u16 {
    1
}

/// One classifier's per-class configuration, scanned by the resolver
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_extraction_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_extraction_endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub projection_endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_score_normalisation_reference_features_paths: Option<Vec<String>>,

    /// Unrecognized fields, written back unchanged
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A classifier block in the run config
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Classifier {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub class_configurations: Vec<ClassConfiguration>,

    /// Entries describe the behaviour-space axes; numeric entries are
    /// counted as dimensions and the first gives the cell count per axis
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub classification_dimensions: Vec<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// CMA-MAE configuration block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CmaMaeConfig {
    pub enabled: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The compute-run configuration: a semi-open map with typed fields for
/// everything the resolver and run manager recognize, and a passthrough
/// container for the rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub classifiers: Vec<Classifier>,

    #[serde(rename = "cmaMAEConfig", skip_serializing_if = "Option::is_none")]
    pub cma_mae_config: Option<CmaMaeConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_evals: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_generations: Option<u64>,

    /// WebSocket URL lists the compute process connects to; rewritten by
    /// endpoint injection, their lengths also seed instance counts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gene_variation_servers: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gene_rendering_servers: Option<Vec<String>>,

    /// Combined evaluation-service list; the specific evaluation lists
    /// below take precedence over it when both are present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gene_evaluation_servers: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation_feature_servers: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation_quality_servers: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation_projection_servers: Option<Vec<String>>,

    /// Per-kind base-port overrides (kind config key -> port)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<HashMap<String, u16>>,

    /// Unrecognized fields, written back unchanged
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RunConfig {
    /// Count of numeric entries in the first classifier's dimensions
    pub fn dimensions(&self) -> usize {
        self.classifiers
            .first()
            .map(|c| {
                c.classification_dimensions
                    .iter()
                    .filter(|v| v.is_number())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Cell count per axis, from the first dimension entry
    pub fn dimension_cells(&self) -> Option<u64> {
        self.classifiers
            .first()
            .and_then(|c| c.classification_dimensions.first())
            .and_then(|v| v.as_u64())
    }

    /// Base-port override for a kind, if the config carries one
    pub fn port_override(&self, kind: ServiceKind) -> Option<u16> {
        self.ports
            .as_ref()
            .and_then(|p| p.get(kind.config_key()))
            .copied()
    }
}

/// A named, read-only configuration recipe for runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Template name
    pub name: String,

    /// The compute-run configuration
    pub run_config: RunConfig,

    /// Evolutionary hyperparameters, carried verbatim into the run's
    /// working directory
    #[serde(default)]
    pub hyperparameters: Value,

    /// Ecosystem variants: variant name -> service definitions
    #[serde(default)]
    pub ecosystems: HashMap<String, Vec<ServiceDefinition>>,
}

impl Template {
    /// Service definitions for a variant, if the template declares it
    pub fn ecosystem(&self, variant: &str) -> Option<&[ServiceDefinition]> {
        self.ecosystems.get(variant).map(|v| v.as_slice())
    }
}

/// In-memory registry of parsed templates.
///
/// The control surface registers templates here; the run manager and the
/// auto-run scheduler look them up by name.
pub struct TemplateStore {
    templates: DashMap<String, Template>,
}

impl TemplateStore {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            templates: DashMap::new(),
        }
    }

    /// Register or replace a template
    pub fn register(&self, template: Template) {
        self.templates.insert(template.name.clone(), template);
    }

    /// Look up a template by name
    pub fn get(&self, name: &str) -> Option<Template> {
        self.templates.get(name).map(|t| t.value().clone())
    }

    /// Whether a template exists
    pub fn exists(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// All registered template names
    pub fn names(&self) -> Vec<String> {
        self.templates.iter().map(|t| t.key().clone()).collect()
    }

    /// Remove a template
    pub fn remove(&self, name: &str) -> Option<Template> {
        self.templates.remove(name).map(|(_, t)| t)
    }
}

impl Default for TemplateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_kind_names_have_no_underscore() {
        for kind in ServiceKind::ALL {
            assert!(
                !kind.logical_name().contains('_'),
                "{} contains the run-id separator",
                kind.logical_name()
            );
        }
    }

    #[test]
    fn test_service_kind_serde_names() {
        let json = serde_json::to_string(&ServiceKind::FeatureClap).unwrap();
        assert_eq!(json, "\"featureClap\"");

        let kind: ServiceKind = serde_json::from_str("\"qdhfProjection\"").unwrap();
        assert_eq!(kind, ServiceKind::QdhfProjection);
    }

    #[test]
    fn test_restart_minute_offsets_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for kind in ServiceKind::ALL {
            assert!(seen.insert(kind.restart_minute_offset()));
            assert!(kind.restart_minute_offset() < 60);
        }
    }

    #[test]
    fn test_run_config_passthrough_round_trip() {
        let raw = serde_json::json!({
            "numberOfEvals": 10000,
            "batchSize": 32,
            "seedEvals": 128,
            "algorithm": "mapElites",
            "classifiers": [{
                "classificationDimensions": [100, 100],
                "classConfigurations": [{
                    "featureExtractionType": "clap",
                    "refinement": "none"
                }]
            }]
        });

        let config: RunConfig = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(config.number_of_evals, Some(10000));
        assert_eq!(config.dimensions(), 2);
        assert_eq!(config.dimension_cells(), Some(100));

        // Unrecognized fields survive a round trip
        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["seedEvals"], 128);
        assert_eq!(back["algorithm"], "mapElites");
        assert_eq!(
            back["classifiers"][0]["classConfigurations"][0]["refinement"],
            "none"
        );
    }

    #[test]
    fn test_dimensions_ignore_non_numeric_entries() {
        let config: RunConfig = serde_json::from_value(serde_json::json!({
            "classifiers": [{
                "classificationDimensions": [50, "duration", 50]
            }]
        }))
        .unwrap();

        assert_eq!(config.dimensions(), 2);
        assert_eq!(config.dimension_cells(), Some(50));
    }

    #[test]
    fn test_template_store() {
        let store = TemplateStore::new();
        assert!(!store.exists("evorun"));

        store.register(Template {
            name: "evorun".into(),
            run_config: RunConfig::default(),
            hyperparameters: Value::Null,
            ecosystems: HashMap::new(),
        });

        assert!(store.exists("evorun"));
        assert_eq!(store.names(), vec!["evorun".to_string()]);
        assert!(store.get("evorun").is_some());

        store.remove("evorun");
        assert!(!store.exists("evorun"));
    }
}
