//! Runs a set of throughput predictors over sampled basic blocks. Predictors
//! that need to run alone (e.g. actual hardware measurements sensitive to
//! system noise) go first and sequentially, the rest fan out across a
//! thread pool: a channel sender is cloned into each parallel closure and
//! results are drained from the receiver after the `par_iter` completes,
//! then re-sorted by submission index to restore input order.

use std::sync::mpsc::channel;

use rayon::prelude::*;

use crate::interestingness::PredictorResults;
use crate::isa::ConcreteBlock;

/// A single evaluation outcome for one predictor on one block.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictorOutcome {
    Throughput(f64),
    Error(String),
}

impl PredictorOutcome {
    pub fn as_option(&self) -> Option<f64> {
        match self {
            PredictorOutcome::Throughput(tp) => Some(*tp),
            PredictorOutcome::Error(_) => None,
        }
    }
}

/// A throughput predictor. Implementations wrap whatever actually produces
/// a number for a block: a simulator invocation, a hardware measurement
/// harness, or (in tests) a stub.
pub trait Predictor: Send + Sync {
    fn key(&self) -> &str;
    fn toolname(&self) -> &str;
    fn version(&self) -> &str;
    fn uarch(&self) -> &str;

    /// Predictors that perform actual hardware measurements are sensitive to
    /// noise from concurrent predictors sharing the machine and must be run
    /// alone, sequentially, ahead of the rest of the pool.
    fn needs_to_run_alone(&self) -> bool {
        false
    }

    fn evaluate(&self, block: &ConcreteBlock) -> PredictorOutcome;
}

/// Owns a registered set of predictors and evaluates blocks against all of
/// them, run-alone predictors first.
pub struct PredictorPool {
    predictors: Vec<Box<dyn Predictor>>,
}

impl PredictorPool {
    pub fn new() -> Self {
        Self { predictors: Vec::new() }
    }

    pub fn register(&mut self, predictor: Box<dyn Predictor>) {
        self.predictors.push(predictor);
    }

    pub fn len(&self) -> usize {
        self.predictors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictors.is_empty()
    }

    /// Evaluates a single block against every registered predictor.
    pub fn eval_one(&self, block: &ConcreteBlock) -> PredictorResults {
        let mut out = PredictorResults::new();
        for p in &self.predictors {
            out.insert(p.key().to_string(), p.evaluate(block).as_option());
        }
        out
    }

    /// Evaluates a batch of blocks against every registered predictor.
    /// Run-alone predictors are evaluated sequentially over the whole batch
    /// first; the remaining predictors are fanned out per-block across a
    /// thread pool via a channel, then recombined in submission order.
    pub fn eval_batch(&self, blocks: &[ConcreteBlock]) -> Vec<PredictorResults> {
        let (run_alone, run_parallel): (Vec<_>, Vec<_>) =
            self.predictors.iter().partition(|p| p.needs_to_run_alone());

        let mut results: Vec<PredictorResults> = blocks
            .iter()
            .map(|block| {
                let mut r = PredictorResults::new();
                for p in &run_alone {
                    r.insert(p.key().to_string(), p.evaluate(block).as_option());
                }
                r
            })
            .collect();

        if run_parallel.is_empty() {
            return results;
        }

        let (sender, receiver) = channel();
        blocks
            .par_iter()
            .enumerate()
            .for_each_with(sender, |s, (idx, block)| {
                let mut r = PredictorResults::new();
                for p in &run_parallel {
                    r.insert(p.key().to_string(), p.evaluate(block).as_option());
                }
                s.send((idx, r)).expect("receiver outlives every sender clone");
            });

        for (idx, parallel_result) in receiver.iter() {
            results[idx].extend(parallel_result);
        }

        results
    }
}

impl Default for PredictorPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ConstantPredictor {
        key: String,
        value: f64,
        run_alone: bool,
    }

    impl Predictor for ConstantPredictor {
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
        fn needs_to_run_alone(&self) -> bool {
            self.run_alone
        }
        fn evaluate(&self, _block: &ConcreteBlock) -> PredictorOutcome {
            PredictorOutcome::Throughput(self.value)
        }
    }

    struct AlwaysErrorsPredictor;

    impl Predictor for AlwaysErrorsPredictor {
        fn key(&self) -> &str {
            "broken"
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
        fn evaluate(&self, _block: &ConcreteBlock) -> PredictorOutcome {
            PredictorOutcome::Error("simulated failure".to_string())
        }
    }

    #[test]
    fn eval_one_collects_a_result_per_predictor() {
        let mut pool = PredictorPool::new();
        pool.register(Box::new(ConstantPredictor { key: "a".into(), value: 1.0, run_alone: false }));
        pool.register(Box::new(AlwaysErrorsPredictor));

        let results = pool.eval_one(&Vec::new());
        assert_eq!(results.get("a"), Some(&Some(1.0)));
        assert_eq!(results.get("broken"), Some(&None));
    }

    #[test]
    fn eval_batch_preserves_block_order_across_run_alone_and_parallel_predictors() {
        let mut pool = PredictorPool::new();
        pool.register(Box::new(ConstantPredictor { key: "alone".into(), value: 3.0, run_alone: true }));
        pool.register(Box::new(ConstantPredictor { key: "par1".into(), value: 1.0, run_alone: false }));
        pool.register(Box::new(ConstantPredictor { key: "par2".into(), value: 2.0, run_alone: false }));

        let blocks: Vec<ConcreteBlock> = (0..20).map(|_| Vec::new()).collect();
        let results = pool.eval_batch(&blocks);

        assert_eq!(results.len(), blocks.len());
        for r in &results {
            assert_eq!(r.get("alone"), Some(&Some(3.0)));
            assert_eq!(r.get("par1"), Some(&Some(1.0)));
            assert_eq!(r.get("par2"), Some(&Some(2.0)));
        }
    }

    #[test]
    fn empty_pool_returns_empty_results_per_block() {
        let pool = PredictorPool::new();
        let blocks: Vec<ConcreteBlock> = vec![Vec::new(), Vec::new()];
        let results = pool.eval_batch(&blocks);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_empty());
    }
}
