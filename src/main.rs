#![allow(clippy::expect_fun_call)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
#[macro_use]
extern crate log;
use env_logger::Env;
use indicatif::ProgressIterator;
use mimalloc::MiMalloc;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

pub mod abstract_block;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod feature;
pub mod insn_feature_manager;
pub mod interestingness;
pub mod isa;
pub mod iwho_augmentation;
pub mod jsonrefs;
pub mod measurement_db;
pub mod predictor_pool;
pub mod sampler;
pub mod satsumption;
pub mod utils;
pub mod witness;

use abstract_block::AbstractBlock;
use config::CampaignConfig;
use discovery::{DiscoveryLoop, GeneralizationStrategy, TerminationSpec};
use insn_feature_manager::InsnFeatureManager;
use interestingness::PredictorResults;
use isa::{ConcreteBlock, IsaKnowledgeBase, SampleIsaKb, SchemeId};
use predictor_pool::{Predictor, PredictorOutcome, PredictorPool};
use sampler::Sampler;
use utils::check_or_create_dir;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Discover and generalize inconsistencies between throughput predictors.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a discovery campaign to an output directory.
    Discover {
        /// Path to the campaign config JSON.
        config: PathBuf,
        /// Predictor specs, `key=constant:<tp>` or `key=length[:scale]`.
        predictors: Vec<String>,
        /// Output directory for report.json, discoveries/ and witnesses/.
        #[arg(short, long, default_value = "anica-out")]
        out_dir: PathBuf,
        /// Stop after this many batches.
        #[arg(long)]
        num_batches: Option<u64>,
        /// Stop once this many discoveries have been made.
        #[arg(long)]
        num_discoveries: Option<u64>,
        /// RNG seed, for reproducible campaigns.
        #[arg(long, default_value = "0")]
        seed: u64,
    },
    /// Generalize one user-supplied block.
    Generalize {
        /// Comma-separated instruction scheme ids making up the starting block.
        asm: String,
        config: PathBuf,
        predictors: Vec<String>,
        #[arg(long, default_value = "0")]
        seed: u64,
    },
    /// Scaffold default configs in a directory.
    MakeConfigs { dir: PathBuf },
    /// Run each predictor on a sample of every known instruction scheme.
    CheckPredictors {
        config: PathBuf,
        predictors: Vec<String>,
        #[arg(long, default_value = "0")]
        seed: u64,
    },
}

/// A predictor whose "measurement" is computed in-process: no external
/// tool invocation, no subprocess, no real hardware measurement (excluded by
/// design). Specs are `key=constant:<tp>` (always predicts `<tp>`) or
/// `key=length[:scale]` (predicts `scale * block length`, default scale 1.0).
struct SpecPredictor {
    key: String,
    kind: SpecKind,
}

enum SpecKind {
    Constant(f64),
    LengthScaled(f64),
}

impl Predictor for SpecPredictor {
    fn key(&self) -> &str {
        &self.key
    }
    fn toolname(&self) -> &str {
        "spec"
    }
    fn version(&self) -> &str {
        "0"
    }
    fn uarch(&self) -> &str {
        "generic"
    }
    fn evaluate(&self, block: &ConcreteBlock) -> PredictorOutcome {
        match self.kind {
            SpecKind::Constant(v) => PredictorOutcome::Throughput(v),
            SpecKind::LengthScaled(scale) => PredictorOutcome::Throughput(scale * block.len() as f64),
        }
    }
}

fn parse_predictor(spec: &str) -> Result<SpecPredictor> {
    let (key, rest) = spec
        .split_once('=')
        .with_context(|| format!("predictor spec '{spec}' is missing '=' (expected key=kind[:value])"))?;
    let kind = if let Some(value) = rest.strip_prefix("constant:") {
        let v: f64 = value.parse().with_context(|| format!("bad constant value in '{spec}'"))?;
        SpecKind::Constant(v)
    } else if rest == "length" {
        SpecKind::LengthScaled(1.0)
    } else if let Some(value) = rest.strip_prefix("length:") {
        let v: f64 = value.parse().with_context(|| format!("bad length scale in '{spec}'"))?;
        SpecKind::LengthScaled(v)
    } else {
        bail!("unrecognized predictor kind in '{spec}', expected constant:<tp> or length[:scale]");
    };
    Ok(SpecPredictor { key: key.to_string(), kind })
}

fn build_pool(predictors: &[String]) -> Result<PredictorPool> {
    let mut pool = PredictorPool::new();
    for spec in predictors {
        pool.register(Box::new(parse_predictor(spec)?));
    }
    Ok(pool)
}

fn write_json(path: &Path, value: &impl serde::Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).with_context(|| format!("writing {path:?}"))?;
    Ok(())
}

fn run_discover(
    config_path: &Path,
    predictor_specs: &[String],
    out_dir: &Path,
    num_batches: Option<u64>,
    num_discoveries: Option<u64>,
    seed: u64,
) -> Result<()> {
    let config = CampaignConfig::load(config_path).with_context(|| format!("loading config {config_path:?}"))?;
    let kb = SampleIsaKb::new();
    let mgr = InsnFeatureManager::build(&kb, config.features.clone());
    let pool = build_pool(predictor_specs)?;

    check_or_create_dir(out_dir)?;
    let discoveries_dir = out_dir.join("discoveries");
    let witnesses_dir = out_dir.join("witnesses");
    check_or_create_dir(&discoveries_dir)?;
    check_or_create_dir(&witnesses_dir)?;

    let mut loop_ = DiscoveryLoop::new(&mgr, &kb, &pool, config.discovery, config.interestingness);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let termination = TerminationSpec { num_batches, num_discoveries, ..Default::default() };

    info!("starting discovery campaign, output to {out_dir:?}");
    loop_.run(termination, None, &mut rng);

    write_json(&out_dir.join("report.json"), &loop_.reports())?;
    for (i, (ab, witness)) in loop_.discoveries().iter().zip(loop_.witnesses().iter()).enumerate() {
        write_json(&discoveries_dir.join(format!("{i}.json")), ab)?;
        write_json(&witnesses_dir.join(format!("{i}.json")), witness)?;
    }
    info!("campaign finished: {} discoveries over {} batches", loop_.discoveries().len(), loop_.reports().len());
    Ok(())
}

fn run_generalize(asm: &str, config_path: &Path, predictor_specs: &[String], seed: u64) -> Result<()> {
    let config = CampaignConfig::load(config_path).with_context(|| format!("loading config {config_path:?}"))?;
    let kb = SampleIsaKb::new();
    let mgr = InsnFeatureManager::build(&kb, config.features.clone());
    let pool = build_pool(predictor_specs)?;

    // `asm` names a comma-separated sequence of instruction scheme ids (as
    // listed by `check-predictors`), not literal assembly with operands: the
    // starting point for generalization is every slot pinned to its exact
    // scheme and otherwise unconstrained, mirroring the singleton records
    // `AbstractBlock::from_concrete` would derive from one concrete sample.
    let scheme_ids: Vec<SchemeId> = asm
        .split(',')
        .map(|s| {
            let s = s.trim();
            kb.lookup_by_string(s).with_context(|| format!("unknown instruction scheme '{s}'"))
        })
        .collect::<Result<_>>()?;
    if scheme_ids.is_empty() {
        bail!("asm must name at least one instruction scheme");
    }

    let mut start = AbstractBlock::make_top(scheme_ids.len(), mgr.features());
    for (i, scheme) in scheme_ids.iter().enumerate() {
        start.insns[i].features = mgr.singleton_record_for(scheme);
        start.insns[i].present = feature::AbstractFeature::bottom(feature::FeatureKind::Singleton);
        start.insns[i].present.join(&feature::ConcreteFeatureValue::Scalar("true".to_string()));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let (result, trace) = discovery::generalize(
        &mgr,
        &kb,
        &pool,
        start,
        GeneralizationStrategy::MaxBenefit,
        config.discovery.generalization_batch_size,
        &config.interestingness,
        &mut rng,
    );

    println!("{}", serde_json::to_string_pretty(&result)?);
    eprintln!("witness trace ({} steps) follows on stderr:", trace.len());
    eprintln!("{}", serde_json::to_string_pretty(&trace)?);
    Ok(())
}

fn run_make_configs(dir: &Path) -> Result<()> {
    check_or_create_dir(dir)?;
    let defaults = CampaignConfig::defaults();

    let features: Vec<serde_json::Value> = defaults
        .features
        .iter()
        .map(|f| {
            let kind = match f.kind {
                feature::FeatureKind::Singleton => serde_json::json!("singleton"),
                feature::FeatureKind::Subset => serde_json::json!("subset"),
                feature::FeatureKind::SubsetOrDefinitelyNot => serde_json::json!("subset_or_definitely_not"),
                feature::FeatureKind::LogUpperBound(max) => serde_json::json!(["log_ub", max]),
                feature::FeatureKind::EditDistance(max) => serde_json::json!(["editdistance", max]),
            };
            serde_json::json!([f.name, kind])
        })
        .collect();

    let strategy: Vec<serde_json::Value> = defaults
        .discovery
        .generalization_strategy
        .iter()
        .map(|(s, attempts)| {
            let name = match s {
                GeneralizationStrategy::MaxBenefit => "max_benefit",
                GeneralizationStrategy::Random => "random",
            };
            serde_json::json!([name, attempts])
        })
        .collect();

    let doc = serde_json::json!({
        "insn_feature_manager": { "features": features },
        "iwho": {},
        "sampling": {},
        "interestingness_metric": {
            "min_interestingness": defaults.interestingness.threshold,
            "mostly_interesting_ratio": defaults.interestingness.mostly_ratio,
            "invert_interestingness": defaults.interestingness.invert,
        },
        "discovery": {
            "discovery_batch_size": defaults.discovery.discovery_batch_size,
            "discovery_possible_block_lengths": defaults.discovery.discovery_possible_block_lengths,
            "generalization_batch_size": defaults.discovery.generalization_batch_size,
            "generalization_strategy": strategy,
        },
        "measurement_db": { "db_path": "measurements.db" },
        "predmanager": { "registry_path": "predictors/registry.json", "num_processes": 0 },
    });

    write_json(&dir.join("config.json"), &doc)?;
    info!("wrote default config to {:?}", dir.join("config.json"));
    Ok(())
}

fn run_check_predictors(config_path: &Path, predictor_specs: &[String], seed: u64) -> Result<()> {
    let config = CampaignConfig::load(config_path).with_context(|| format!("loading config {config_path:?}"))?;
    let kb = SampleIsaKb::new();
    let mgr = InsnFeatureManager::build(&kb, config.features.clone());
    let pool = build_pool(predictor_specs)?;
    let sampler = Sampler::new(&mgr, &kb);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let schemes: Vec<_> = mgr.schemes().iter().cloned().collect();
    for scheme in schemes.iter().progress() {
        let mut ab = AbstractBlock::make_top(1, mgr.features());
        ab.insns[0].features = mgr.singleton_record_for(scheme);
        ab.insns[0].present = feature::AbstractFeature::bottom(feature::FeatureKind::Singleton);
        ab.insns[0]
            .present
            .join(&feature::ConcreteFeatureValue::Scalar("true".to_string()));

        match sampler.sample(&ab, &mut rng) {
            Ok(block) => {
                let results: PredictorResults = pool.eval_one(&block);
                println!("{scheme}: {results:?}");
            }
            Err(e) => warn!("{scheme}: could not sample a block: {e}"),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let env = Env::default().filter_or("LOG_LEVEL", "info").write_style_or("LOG_STYLE", "always");
    env_logger::init_from_env(env);

    let cli = Cli::parse();
    match &cli.command {
        Commands::Discover { config, predictors, out_dir, num_batches, num_discoveries, seed } => {
            run_discover(config, predictors, out_dir, *num_batches, *num_discoveries, *seed)
        }
        Commands::Generalize { asm, config, predictors, seed } => run_generalize(asm, config, predictors, *seed),
        Commands::MakeConfigs { dir } => run_make_configs(dir),
        Commands::CheckPredictors { config, predictors, seed } => run_check_predictors(config, predictors, *seed),
    }
}
