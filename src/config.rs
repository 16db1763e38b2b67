//! JSON campaign configuration loading and validation, built around a flat
//! "section -> recognized keys with defaults" shape: every section is
//! validated even when absent from the file, so each key ends up with
//! either its provided value or its documented default.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::discovery::{DiscoveryConfig, GeneralizationStrategy};
use crate::errors::ConfigError;
use crate::feature::{FeatureConfig, FeatureKind};
use crate::interestingness::InterestingnessConfig;
use crate::utils::resolve_config_path;

fn is_doc_key(key: &str) -> bool {
    [".doc", ".comment", ".info", ".c"].iter().any(|suffix| key.ends_with(suffix))
}

fn check_unknown_keys(
    section: &str,
    obj: &serde_json::Map<String, Value>,
    recognized: &[&str],
) -> Result<(), ConfigError> {
    for key in obj.keys() {
        if is_doc_key(key) {
            continue;
        }
        if !recognized.contains(&key.as_str()) {
            return Err(ConfigError::UnknownKey { section: section.to_string(), key: key.clone() });
        }
    }
    Ok(())
}

fn get_section<'a>(doc: &'a Value, name: &str) -> serde_json::Map<String, Value> {
    doc.get(name).and_then(Value::as_object).cloned().unwrap_or_default()
}

fn wrong_shape(section: &str, key: &str, expected: &str) -> ConfigError {
    ConfigError::WrongShape { section: section.to_string(), key: key.to_string(), expected: expected.to_string() }
}

fn get_usize(obj: &serde_json::Map<String, Value>, section: &str, key: &str, default: usize) -> Result<usize, ConfigError> {
    match obj.get(key) {
        None => Ok(default),
        Some(v) => v.as_u64().map(|n| n as usize).ok_or_else(|| wrong_shape(section, key, "non-negative integer")),
    }
}

fn get_f64(obj: &serde_json::Map<String, Value>, section: &str, key: &str, default: f64) -> Result<f64, ConfigError> {
    match obj.get(key) {
        None => Ok(default),
        Some(v) => v.as_f64().ok_or_else(|| wrong_shape(section, key, "number")),
    }
}

fn get_bool(obj: &serde_json::Map<String, Value>, section: &str, key: &str, default: bool) -> Result<bool, ConfigError> {
    match obj.get(key) {
        None => Ok(default),
        Some(v) => v.as_bool().ok_or_else(|| wrong_shape(section, key, "boolean")),
    }
}

fn get_path(
    obj: &serde_json::Map<String, Value>,
    section: &str,
    key: &str,
    config_dir: &Path,
) -> Result<Option<PathBuf>, ConfigError> {
    match obj.get(key) {
        None => Ok(None),
        Some(v) => {
            let s = v.as_str().ok_or_else(|| wrong_shape(section, key, "string path"))?;
            Ok(Some(resolve_config_path(config_dir, s)))
        }
    }
}

fn parse_usize_list(
    obj: &serde_json::Map<String, Value>,
    section: &str,
    key: &str,
    default: Vec<usize>,
) -> Result<Vec<usize>, ConfigError> {
    match obj.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_array()
            .ok_or_else(|| wrong_shape(section, key, "list of integers"))?
            .iter()
            .map(|e| e.as_u64().map(|n| n as usize).ok_or_else(|| wrong_shape(section, key, "list of integers")))
            .collect(),
    }
}

fn parse_feature_kind(section: &str, key: &str, v: &Value) -> Result<FeatureKind, ConfigError> {
    if let Some(s) = v.as_str() {
        return match s {
            "singleton" => Ok(FeatureKind::Singleton),
            "subset" => Ok(FeatureKind::Subset),
            "subset_or_definitely_not" => Ok(FeatureKind::SubsetOrDefinitelyNot),
            _ => Err(wrong_shape(section, key, "singleton|subset|subset_or_definitely_not|[log_ub,max]|[editdistance,max]")),
        };
    }
    if let Some(arr) = v.as_array() {
        if arr.len() == 2 {
            if let Some(tag) = arr[0].as_str() {
                let max = arr[1].as_u64().map(|n| n as u32);
                return match (tag, max) {
                    ("log_ub", Some(max)) => Ok(FeatureKind::LogUpperBound(max)),
                    ("editdistance", Some(max)) => Ok(FeatureKind::EditDistance(max)),
                    _ => Err(wrong_shape(section, key, "[log_ub, max] or [editdistance, max]")),
                };
            }
        }
    }
    Err(wrong_shape(section, key, "singleton|subset|subset_or_definitely_not|[log_ub,max]|[editdistance,max]"))
}

/// `insn_feature_manager` section: a list of `[feature_name, kind]` pairs.
fn parse_insn_feature_manager(doc: &Value, section: &str) -> Result<Vec<FeatureConfig>, ConfigError> {
    let obj = get_section(doc, section);
    check_unknown_keys(section, &obj, &["features"])?;
    match obj.get("features") {
        None => Ok(crate::insn_feature_manager::InsnFeatureManager::default_features()),
        Some(v) => {
            let arr = v.as_array().ok_or_else(|| wrong_shape(section, "features", "list of [name, kind] pairs"))?;
            arr.iter()
                .map(|entry| {
                    let pair = entry.as_array().ok_or_else(|| wrong_shape(section, "features", "[name, kind] pair"))?;
                    if pair.len() != 2 {
                        return Err(wrong_shape(section, "features", "[name, kind] pair"));
                    }
                    let name = pair[0].as_str().ok_or_else(|| wrong_shape(section, "features", "feature name string"))?;
                    let kind = parse_feature_kind(section, "features", &pair[1])?;
                    Ok(FeatureConfig { name: name.to_string(), kind })
                })
                .collect()
        }
    }
}

/// `discovery` section.
fn parse_discovery(doc: &Value, section: &str) -> Result<DiscoveryConfig, ConfigError> {
    let obj = get_section(doc, section);
    check_unknown_keys(
        section,
        &obj,
        &[
            "discovery_batch_size",
            "discovery_possible_block_lengths",
            "generalization_batch_size",
            "generalization_strategy",
        ],
    )?;
    let default = DiscoveryConfig::default();
    let discovery_batch_size = get_usize(&obj, section, "discovery_batch_size", default.discovery_batch_size)?;
    let discovery_possible_block_lengths = parse_usize_list(
        &obj,
        section,
        "discovery_possible_block_lengths",
        default.discovery_possible_block_lengths,
    )?;
    let generalization_batch_size =
        get_usize(&obj, section, "generalization_batch_size", default.generalization_batch_size)?;
    let generalization_strategy = match obj.get("generalization_strategy") {
        None => default.generalization_strategy,
        Some(v) => {
            let arr = v
                .as_array()
                .ok_or_else(|| wrong_shape(section, "generalization_strategy", "list of [strategy, attempts] pairs"))?;
            arr.iter()
                .map(|entry| {
                    let pair = entry
                        .as_array()
                        .ok_or_else(|| wrong_shape(section, "generalization_strategy", "[strategy, attempts] pair"))?;
                    if pair.len() != 2 {
                        return Err(wrong_shape(section, "generalization_strategy", "[strategy, attempts] pair"));
                    }
                    let name = pair[0]
                        .as_str()
                        .ok_or_else(|| wrong_shape(section, "generalization_strategy", "strategy name string"))?;
                    let attempts = pair[1]
                        .as_u64()
                        .map(|n| n as usize)
                        .ok_or_else(|| wrong_shape(section, "generalization_strategy", "attempt count"))?;
                    let strategy = match name {
                        "max_benefit" => GeneralizationStrategy::MaxBenefit,
                        "random" => GeneralizationStrategy::Random,
                        _ => return Err(wrong_shape(section, "generalization_strategy", "max_benefit|random")),
                    };
                    Ok((strategy, attempts))
                })
                .collect::<Result<Vec<_>, ConfigError>>()?
        }
    };
    Ok(DiscoveryConfig {
        discovery_batch_size,
        discovery_possible_block_lengths,
        generalization_batch_size,
        generalization_strategy,
    })
}

/// `interestingness_metric` section.
fn parse_interestingness(doc: &Value, section: &str) -> Result<InterestingnessConfig, ConfigError> {
    let obj = get_section(doc, section);
    check_unknown_keys(section, &obj, &["min_interestingness", "mostly_interesting_ratio", "invert_interestingness"])?;
    let default = InterestingnessConfig::default();
    Ok(InterestingnessConfig {
        threshold: get_f64(&obj, section, "min_interestingness", default.threshold)?,
        invert: get_bool(&obj, section, "invert_interestingness", default.invert)?,
        mostly_ratio: get_f64(&obj, section, "mostly_interesting_ratio", default.mostly_ratio)?,
    })
}

/// `sampling` section: reserved for sampler tuning knobs. Currently has no
/// recognized keys beyond documentation keys, since the reserved/base
/// register pools are fixed ISA-level policy (`iwho_augmentation.rs`), not
/// per-campaign configuration.
fn parse_sampling(doc: &Value, section: &str) -> Result<(), ConfigError> {
    let obj = get_section(doc, section);
    check_unknown_keys(section, &obj, &[])
}

/// `iwho` section: same shape as `sampling` for the same reason.
fn parse_iwho(doc: &Value, section: &str) -> Result<(), ConfigError> {
    let obj = get_section(doc, section);
    check_unknown_keys(section, &obj, &[])
}

#[derive(Debug, Clone)]
pub struct MeasurementDbConfig {
    pub db_path: Option<PathBuf>,
}

fn parse_measurement_db(doc: &Value, section: &str, config_dir: &Path) -> Result<MeasurementDbConfig, ConfigError> {
    let obj = get_section(doc, section);
    check_unknown_keys(section, &obj, &["db_path"])?;
    Ok(MeasurementDbConfig { db_path: get_path(&obj, section, "db_path", config_dir)? })
}

#[derive(Debug, Clone)]
pub struct PredmanagerConfig {
    pub registry_path: Option<PathBuf>,
    pub num_processes: usize,
}

fn parse_predmanager(doc: &Value, section: &str, config_dir: &Path) -> Result<PredmanagerConfig, ConfigError> {
    let obj = get_section(doc, section);
    check_unknown_keys(section, &obj, &["registry_path", "num_processes"])?;
    Ok(PredmanagerConfig {
        registry_path: get_path(&obj, section, "registry_path", config_dir)?,
        num_processes: get_usize(&obj, section, "num_processes", 0)?,
    })
}

/// Everything parsed out of one campaign config document.
#[derive(Debug, Clone)]
pub struct CampaignConfig {
    pub features: Vec<FeatureConfig>,
    pub discovery: DiscoveryConfig,
    pub interestingness: InterestingnessConfig,
    pub measurement_db: MeasurementDbConfig,
    pub predmanager: PredmanagerConfig,
}

impl CampaignConfig {
    /// Loads and fully validates a campaign config file. Every recognized
    /// section is validated even if empty, so a config with only a
    /// `discovery` section still gets defaulted `interestingness_metric`,
    /// etc., from the closed set of recognized keys each section defines.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io { path: path.to_path_buf(), source: e })?;
        let doc: Value =
            serde_json::from_str(&text).map_err(|e| ConfigError::Json { path: path.to_path_buf(), source: e })?;
        let config_dir = path.parent().unwrap_or_else(|| Path::new("."));

        let features = parse_insn_feature_manager(&doc, "insn_feature_manager")?;
        parse_iwho(&doc, "iwho")?;
        let interestingness = parse_interestingness(&doc, "interestingness_metric")?;
        let discovery = parse_discovery(&doc, "discovery")?;
        parse_sampling(&doc, "sampling")?;
        let measurement_db = parse_measurement_db(&doc, "measurement_db", config_dir)?;
        let predmanager = parse_predmanager(&doc, "predmanager", config_dir)?;

        Ok(Self { features, discovery, interestingness, measurement_db, predmanager })
    }

    /// A config document with every section defaulted, suitable for
    /// `make-configs` to write out as a starting point.
    pub fn defaults() -> Self {
        Self {
            features: crate::insn_feature_manager::InsnFeatureManager::default_features(),
            discovery: DiscoveryConfig::default(),
            interestingness: InterestingnessConfig::default(),
            measurement_db: MeasurementDbConfig { db_path: Some(PathBuf::from("measurements.db")) },
            predmanager: PredmanagerConfig { registry_path: Some(PathBuf::from("predictors/registry.json")), num_processes: 0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut f = fs::File::create(dir.path().join("config.json")).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        dir
    }

    #[test]
    fn empty_document_loads_with_every_section_defaulted() {
        let dir = write_config("{}");
        let cfg = CampaignConfig::load(dir.path().join("config.json")).unwrap();
        assert_eq!(cfg.discovery, DiscoveryConfig::default());
        assert_eq!(cfg.interestingness, InterestingnessConfig::default());
    }

    #[test]
    fn unknown_key_in_a_recognized_section_is_rejected() {
        let dir = write_config(r#"{"discovery": {"not_a_real_key": 1}}"#);
        let err = CampaignConfig::load(dir.path().join("config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey { .. }));
    }

    #[test]
    fn documentation_keys_are_ignored() {
        let dir = write_config(r#"{"discovery": {"discovery_batch_size.doc": "how many blocks"}}"#);
        let cfg = CampaignConfig::load(dir.path().join("config.json")).unwrap();
        assert_eq!(cfg.discovery.discovery_batch_size, DiscoveryConfig::default().discovery_batch_size);
    }

    #[test]
    fn relative_paths_resolve_against_the_config_directory() {
        let dir = write_config(r#"{"measurement_db": {"db_path": "measurements.db"}}"#);
        let cfg = CampaignConfig::load(dir.path().join("config.json")).unwrap();
        assert_eq!(cfg.measurement_db.db_path, Some(dir.path().join("measurements.db")));
    }

    #[test]
    fn generalization_strategy_parses_named_strategies() {
        let dir = write_config(r#"{"discovery": {"generalization_strategy": [["max_benefit", 1], ["random", 3]]}}"#);
        let cfg = CampaignConfig::load(dir.path().join("config.json")).unwrap();
        assert_eq!(
            cfg.discovery.generalization_strategy,
            vec![(GeneralizationStrategy::MaxBenefit, 1), (GeneralizationStrategy::Random, 3)]
        );
    }
}
