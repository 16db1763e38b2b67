//! DiscoveryLoop and generalize: the outer sample/filter/minimize/subsume/
//! generalize loop that drives exploration.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use log::{debug, info};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::abstract_block::{choose_max_benefit, choose_random, AbstractBlock, ExpansionToken};
use crate::insn_feature_manager::InsnFeatureManager;
use crate::interestingness::{is_interesting, is_mostly_interesting, InterestingnessConfig, PredictorResults};
use crate::isa::{ConcreteBlock, IsaKnowledgeBase, SchemeId};
use crate::predictor_pool::PredictorPool;
use crate::sampler::Sampler;
use crate::satsumption::{abstract_subsumed, check_subsumed};
use crate::witness::WitnessTrace;

/// `discovery_batch_size=100`, `discovery_possible_block_lengths=3..=8`,
/// `generalization_batch_size=100`,
/// `generalization_strategy=[(max_benefit,1),(random,3)]` are the
/// documented defaults for a freshly constructed config.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryConfig {
    pub discovery_batch_size: usize,
    pub discovery_possible_block_lengths: Vec<usize>,
    pub generalization_batch_size: usize,
    pub generalization_strategy: Vec<(GeneralizationStrategy, usize)>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_batch_size: 100,
            discovery_possible_block_lengths: (3..=8).collect(),
            generalization_batch_size: 100,
            generalization_strategy: vec![(GeneralizationStrategy::MaxBenefit, 1), (GeneralizationStrategy::Random, 3)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneralizationStrategy {
    MaxBenefit,
    Random,
}

/// One of `{num_batches, num_discoveries, same_num_discoveries, days/hours/
/// minutes/seconds}`. Any combination of fields may be set; the loop stops
/// at the first one that is hit.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminationSpec {
    pub num_batches: Option<u64>,
    pub num_discoveries: Option<u64>,
    pub same_num_discoveries: Option<u64>,
    pub max_duration: Option<Duration>,
}

struct TerminationTracker {
    spec: TerminationSpec,
    start: Instant,
    batches_run: u64,
    batches_since_last_discovery: u64,
}

impl TerminationTracker {
    fn new(spec: TerminationSpec) -> Self {
        Self { spec, start: Instant::now(), batches_run: 0, batches_since_last_discovery: 0 }
    }

    fn should_stop(&self, discoveries_so_far: u64) -> bool {
        if let Some(n) = self.spec.num_batches {
            if self.batches_run >= n {
                return true;
            }
        }
        if let Some(n) = self.spec.num_discoveries {
            if discoveries_so_far >= n {
                return true;
            }
        }
        if let Some(n) = self.spec.same_num_discoveries {
            if self.batches_since_last_discovery >= n {
                return true;
            }
        }
        if let Some(d) = self.spec.max_duration {
            if self.start.elapsed() >= d {
                return true;
            }
        }
        false
    }

    fn record_batch(&mut self, new_discoveries: usize) {
        self.batches_run += 1;
        if new_discoveries > 0 {
            self.batches_since_last_discovery = 0;
        } else {
            self.batches_since_last_discovery += 1;
        }
    }
}

/// Per-batch counters, mirroring the running report the original writes to
/// `report.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_index: u64,
    pub sampled: usize,
    pub interesting: usize,
    pub new_discoveries: usize,
    pub elapsed_secs: f64,
}

/// Tries `num` times (up to `2*num` attempts) to sample a concrete block
/// from `block`, honoring `blacklist`. Mirrors `sample_block_list`: failures
/// beyond the retry budget return a short batch rather than erroring.
pub fn sample_block_list(
    sampler: &Sampler,
    block: &AbstractBlock,
    num: usize,
    blacklist: &BTreeSet<SchemeId>,
    rng: &mut impl Rng,
) -> Vec<ConcreteBlock> {
    let mut out = Vec::with_capacity(num);
    let mut attempts = 0;
    while out.len() < num && attempts < 2 * num.max(1) {
        attempts += 1;
        match sampler.sample_excluding(block, rng, blacklist) {
            Ok(bb) => out.push(bb),
            Err(e) => debug!("a sample failed: {e}"),
        }
    }
    out
}

pub struct DiscoveryLoop<'a> {
    mgr: &'a InsnFeatureManager,
    kb: &'a dyn IsaKnowledgeBase,
    pool: &'a PredictorPool,
    config: DiscoveryConfig,
    interestingness: InterestingnessConfig,
    blacklist: BTreeSet<SchemeId>,
    discoveries: Vec<AbstractBlock>,
    witnesses: Vec<WitnessTrace>,
    reports: Vec<BatchReport>,
}

impl<'a> DiscoveryLoop<'a> {
    pub fn new(
        mgr: &'a InsnFeatureManager,
        kb: &'a dyn IsaKnowledgeBase,
        pool: &'a PredictorPool,
        config: DiscoveryConfig,
        interestingness: InterestingnessConfig,
    ) -> Self {
        Self {
            mgr,
            kb,
            pool,
            config,
            interestingness,
            blacklist: BTreeSet::new(),
            discoveries: Vec::new(),
            witnesses: Vec::new(),
            reports: Vec::new(),
        }
    }

    pub fn discoveries(&self) -> &[AbstractBlock] {
        &self.discoveries
    }

    pub fn witnesses(&self) -> &[WitnessTrace] {
        &self.witnesses
    }

    pub fn reports(&self) -> &[BatchReport] {
        &self.reports
    }

    /// Runs batches until `termination` is hit. `start_point`, if given,
    /// restricts sampling to that abstract block for every batch instead of
    /// drawing a fresh top block per batch.
    pub fn run(
        &mut self,
        termination: TerminationSpec,
        start_point: Option<AbstractBlock>,
        rng: &mut impl Rng,
    ) {
        let mut tracker = TerminationTracker::new(termination);
        let campaign_start = Instant::now();

        while !tracker.should_stop(self.discoveries.len() as u64) {
            let batch_start = Instant::now();
            let n_before = self.discoveries.len();

            let start = start_point.clone().unwrap_or_else(|| {
                let n = *self
                    .config
                    .discovery_possible_block_lengths
                    .choose(rng)
                    .expect("discovery_possible_block_lengths is non-empty");
                AbstractBlock::make_top(n, self.mgr.features())
            });

            let sampler = Sampler::new(self.mgr, self.kb);
            let blocks = sample_block_list(&sampler, &start, self.config.discovery_batch_size, &self.blacklist, rng);
            if blocks.is_empty() {
                info!("sampling failed for the whole batch, terminating discovery");
                break;
            }

            let results = self.pool.eval_batch(&blocks);
            let interesting: Vec<&ConcreteBlock> = blocks
                .iter()
                .zip(results.iter())
                .filter(|(_, r)| is_interesting(r, &self.interestingness))
                .map(|(b, _)| b)
                .collect();

            for block in interesting {
                self.process_interesting_block(block, rng);
            }

            let report = BatchReport {
                batch_index: tracker.batches_run,
                sampled: blocks.len(),
                interesting: interesting.len(),
                new_discoveries: self.discoveries.len() - n_before,
                elapsed_secs: batch_start.elapsed().as_secs_f64(),
            };
            tracker.record_batch(report.new_discoveries);
            self.reports.push(report);
        }

        debug!("discovery campaign finished after {:.1}s", campaign_start.elapsed().as_secs_f64());
    }

    fn process_interesting_block(&mut self, block: &ConcreteBlock, rng: &mut impl Rng) {
        let minimized = self.minimize(block, rng);

        for existing in &self.discoveries {
            let singleton = AbstractBlock::from_concrete(minimized.len(), self.mgr, self.kb, &minimized);
            if check_subsumed(&minimized, existing, self.mgr, self.kb) || existing.subsumes(&singleton) {
                return;
            }
        }

        let mut generalized: Vec<(AbstractBlock, WitnessTrace)> = Vec::new();
        for (strategy, attempts) in self.config.generalization_strategy.clone() {
            for _ in 0..attempts {
                let start = AbstractBlock::from_concrete(minimized.len(), self.mgr, self.kb, &minimized);
                let (result, witness) = generalize(self.mgr, self.kb, self.pool, start, strategy, self.config.generalization_batch_size, &self.interestingness, rng);
                generalized.push((result, witness));
            }
        }

        let maximal = keep_maximal(generalized, self.mgr);

        for (ab, witness) in maximal {
            if ab.n == 1 && ab.must_alias.is_empty() && ab.must_not_alias.is_empty() {
                let feasible = self.mgr.feasible(&ab.insns[0].features);
                let universe: BTreeSet<SchemeId> = self.mgr.schemes().iter().cloned().collect();
                self.blacklist.extend(feasible.materialize(&universe));
                info!("updated scheme blacklist: now {} entries", self.blacklist.len());
            }
            self.discoveries.push(ab);
            self.witnesses.push(witness);
        }
    }

    /// Repeatedly drops a random instruction from `block` as long as the
    /// shortened block is still mostly interesting and at least one
    /// instruction remains.
    fn minimize(&self, block: &ConcreteBlock, rng: &mut impl Rng) -> ConcreteBlock {
        let mut current = block.to_vec();
        loop {
            if current.len() <= 1 {
                return current;
            }
            let drop_idx = rng.gen_range(0..current.len());
            let mut candidate = current.clone();
            candidate.remove(drop_idx);

            let trials: Vec<PredictorResults> = (0..4).map(|_| self.pool.eval_one(&candidate)).collect();
            if is_mostly_interesting(&trials, &self.interestingness) {
                current = candidate;
            } else {
                return current;
            }
        }
    }
}

/// Deduplicates a batch of generalization results via abstract-to-abstract
/// subsumption, keeping only the maximal elements (nothing else in the set
/// subsumes them).
fn keep_maximal(items: Vec<(AbstractBlock, WitnessTrace)>, mgr: &InsnFeatureManager) -> Vec<(AbstractBlock, WitnessTrace)> {
    let mut keep = vec![true; items.len()];
    for i in 0..items.len() {
        if !keep[i] {
            continue;
        }
        for j in 0..items.len() {
            if i == j || !keep[j] {
                continue;
            }
            if items[i].0.n == items[j].0.n && abstract_subsumed(&items[i].0, &items[j].0, mgr) && i != j {
                // items[j] subsumes items[i]: i is not maximal, unless they're mutually subsuming (equal) and i < j.
                if !(abstract_subsumed(&items[j].0, &items[i].0, mgr) && i < j) {
                    keep[i] = false;
                }
            }
        }
    }
    items.into_iter().zip(keep).filter(|(_, k)| *k).map(|(v, _)| v).collect()
}

/// Generalizes `start` (known to sample mostly-interesting blocks) by
/// repeatedly expanding it one lattice step at a time, validating each step
/// against freshly sampled blocks.
pub fn generalize(
    mgr: &InsnFeatureManager,
    kb: &dyn IsaKnowledgeBase,
    pool: &PredictorPool,
    start: AbstractBlock,
    strategy: GeneralizationStrategy,
    batch_size: usize,
    interestingness: &InterestingnessConfig,
    rng: &mut impl Rng,
) -> (AbstractBlock, WitnessTrace) {
    let sampler = Sampler::new(mgr, kb);
    let mut trace = WitnessTrace::new(start.clone());

    let initial_samples = sample_block_list(&sampler, &start, batch_size, &BTreeSet::new(), rng);
    let initial_results: Vec<PredictorResults> = initial_samples.iter().map(|b| pool.eval_one(b)).collect();
    if !is_mostly_interesting(&initial_results, interestingness) {
        trace.add_termination("trivial abstraction not interesting", None);
        return (start, trace);
    }

    let mut working = start.clone();
    let mut do_not_expand: BTreeSet<ExpansionToken> = BTreeSet::new();

    loop {
        let options: Vec<_> = working
            .possible_expansions(mgr)
            .into_iter()
            .filter(|(t, _)| !do_not_expand.contains(t))
            .collect();
        if options.is_empty() {
            trace.add_termination("no more expansions remain", None);
            return (working, trace);
        }

        let token = match strategy {
            GeneralizationStrategy::MaxBenefit => choose_max_benefit(&options),
            GeneralizationStrategy::Random => choose_random(&options, rng),
        };
        let Some(token) = token else {
            trace.add_termination("no more expansions remain", None);
            return (working, trace);
        };
        let no_semantic_change = options.iter().find(|(t, _)| *t == token).map(|(_, (_, nc))| *nc).unwrap_or(false);

        let mut candidate = working.clone();
        candidate.apply_expansion(&token);

        if no_semantic_change {
            working = candidate;
            trace.add_taken(token, None);
            continue;
        }

        let samples = sample_block_list(&sampler, &candidate, batch_size, &BTreeSet::new(), rng);
        let results: Vec<PredictorResults> = samples.iter().map(|b| pool.eval_one(b)).collect();

        if is_mostly_interesting(&results, interestingness) {
            working = candidate;
            trace.add_taken(token, None);
        } else {
            trace.add_non_taken(token.clone(), None);
            do_not_expand.insert(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::SampleIsaKb;
    use crate::predictor_pool::{Predictor, PredictorOutcome, PredictorPool};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    struct FlatPredictor {
        key: String,
        value: f64,
    }

    impl Predictor for FlatPredictor {
        fn key(&self) -> &str {
            &self.key
        }
        fn toolname(&self) -> &str {
            "stub"
        }
        fn version(&self) -> &str {
            "0"
        }
        fn uarch(&self) -> &str {
            "generic"
        }
        fn evaluate(&self, block: &ConcreteBlock) -> PredictorOutcome {
            PredictorOutcome::Throughput(self.value * (block.len().max(1) as f64))
        }
    }

    fn disagreeing_pool() -> PredictorPool {
        let mut pool = PredictorPool::new();
        pool.register(Box::new(FlatPredictor { key: "a".into(), value: 1.0 }));
        pool.register(Box::new(FlatPredictor { key: "b".into(), value: 3.0 }));
        pool
    }

    #[test]
    fn discovery_batch_populates_discoveries_when_predictors_disagree() {
        let kb = SampleIsaKb::new();
        let mgr = InsnFeatureManager::build(&kb, InsnFeatureManager::default_features());
        let pool = disagreeing_pool();
        let config = DiscoveryConfig {
            discovery_batch_size: 8,
            discovery_possible_block_lengths: vec![1],
            generalization_batch_size: 4,
            generalization_strategy: vec![(GeneralizationStrategy::MaxBenefit, 1)],
        };
        let interestingness = InterestingnessConfig { threshold: 0.1, invert: false, mostly_ratio: 0.5 };
        let mut loop_ = DiscoveryLoop::new(&mgr, &kb, &pool, config, interestingness);

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        loop_.run(TerminationSpec { num_batches: Some(1), ..Default::default() }, None, &mut rng);

        assert_eq!(loop_.reports().len(), 1);
        assert!(loop_.reports()[0].sampled > 0);
    }

    #[test]
    fn generalize_terminates_when_the_starting_block_is_not_interesting() {
        let kb = SampleIsaKb::new();
        let mgr = InsnFeatureManager::build(&kb, InsnFeatureManager::default_features());
        let mut pool = PredictorPool::new();
        pool.register(Box::new(FlatPredictor { key: "a".into(), value: 1.0 }));
        pool.register(Box::new(FlatPredictor { key: "b".into(), value: 1.0 }));

        let start = AbstractBlock::make_top(1, mgr.features());
        let interestingness = InterestingnessConfig { threshold: 0.1, invert: false, mostly_ratio: 1.0 };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let (result, trace) = generalize(&mgr, &kb, &pool, start.clone(), GeneralizationStrategy::MaxBenefit, 4, &interestingness, &mut rng);

        assert_eq!(result.n, start.n);
        assert_eq!(trace.len(), 1);
    }

    #[test]
    fn termination_tracker_stops_after_configured_batch_count() {
        let kb = SampleIsaKb::new();
        let mgr = InsnFeatureManager::build(&kb, InsnFeatureManager::default_features());
        let pool = disagreeing_pool();
        let config = DiscoveryConfig {
            discovery_batch_size: 4,
            discovery_possible_block_lengths: vec![1],
            generalization_batch_size: 2,
            generalization_strategy: vec![(GeneralizationStrategy::Random, 1)],
        };
        let interestingness = InterestingnessConfig::default();
        let mut loop_ = DiscoveryLoop::new(&mgr, &kb, &pool, config, interestingness);
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        loop_.run(TerminationSpec { num_batches: Some(2), ..Default::default() }, None, &mut rng);
        assert_eq!(loop_.reports().len(), 2);
    }
}
