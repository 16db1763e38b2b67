//! Scores a set of per-predictor throughput results for how much they
//! disagree, and decides whether that disagreement clears a threshold.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Below this, the sum of reported throughputs is treated as indistinguishable
/// from zero and would otherwise make the relative spread blow up on noise.
const EPSILON: f64 = 1e-3;

/// One predictor's result for a sample: a throughput-prediction in cycles,
/// or nothing if the predictor errored, timed out, or declined to answer.
pub type PredictorResults = BTreeMap<String, Option<f64>>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InterestingnessConfig {
    pub threshold: f64,
    pub invert: bool,
    pub mostly_ratio: f64,
}

impl Default for InterestingnessConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            invert: false,
            mostly_ratio: 1.0,
        }
    }
}

/// Symmetric relative spread of a set of predictor results, scaled by how
/// many predictors reported. `+∞` whenever any result is missing, null, or
/// non-positive, or when the results are collectively too close to zero to
/// trust a ratio computed from them.
pub fn interestingness(results: &PredictorResults) -> f64 {
    let mut values: Vec<f64> = Vec::with_capacity(results.len());
    for v in results.values() {
        match v {
            Some(tp) if *tp > 0.0 => values.push(*tp),
            _ => return f64::INFINITY,
        }
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let sum: f64 = values.iter().sum();
    if sum <= EPSILON {
        return f64::INFINITY;
    }
    let min = values[0];
    let max = *values.last().unwrap();
    (max - min) * values.len() as f64 / sum
}

pub fn is_interesting(results: &PredictorResults, cfg: &InterestingnessConfig) -> bool {
    let score = interestingness(results);
    let above = score.is_infinite() || score >= cfg.threshold;
    if cfg.invert {
        !above
    } else {
        above
    }
}

/// Whether at least `cfg.mostly_ratio` of `batch` are individually interesting.
pub fn is_mostly_interesting(batch: &[PredictorResults], cfg: &InterestingnessConfig) -> bool {
    if batch.is_empty() {
        return false;
    }
    let interesting_count = batch.iter().filter(|r| is_interesting(r, cfg)).count();
    (interesting_count as f64) / (batch.len() as f64) >= cfg.mostly_ratio
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(pairs: &[(&str, Option<f64>)]) -> PredictorResults {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn identical_results_are_not_interesting() {
        let r = results(&[("a", Some(2.0)), ("b", Some(2.0))]);
        assert_eq!(interestingness(&r), 0.0);
    }

    #[test]
    fn a_missing_result_is_always_maximally_interesting() {
        let r = results(&[("a", Some(2.0)), ("b", None)]);
        assert!(interestingness(&r).is_infinite());
    }

    #[test]
    fn a_zero_or_negative_result_is_always_maximally_interesting() {
        let r = results(&[("a", Some(2.0)), ("b", Some(0.0))]);
        assert!(interestingness(&r).is_infinite());
    }

    #[test]
    fn near_zero_total_throughput_is_maximally_interesting() {
        let r = results(&[("a", Some(0.0002)), ("b", Some(0.0003))]);
        assert!(interestingness(&r).is_infinite());
    }

    #[test]
    fn spread_scales_with_cardinality() {
        let r = results(&[("a", Some(1.0)), ("b", Some(2.0)), ("c", Some(2.0))]);
        // (max-min)*|V|/S = (2-1)*3/5 = 0.6
        assert!((interestingness(&r) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn is_interesting_respects_invert_flag() {
        let r = results(&[("a", Some(1.0)), ("b", Some(2.0))]);
        let cfg = InterestingnessConfig {
            threshold: 0.1,
            invert: false,
            mostly_ratio: 1.0,
        };
        assert!(is_interesting(&r, &cfg));
        let inverted = InterestingnessConfig { invert: true, ..cfg };
        assert!(!is_interesting(&r, &inverted));
    }

    #[test]
    fn is_mostly_interesting_requires_the_configured_ratio() {
        let cfg = InterestingnessConfig {
            threshold: 0.5,
            invert: false,
            mostly_ratio: 0.5,
        };
        let batch = vec![
            results(&[("a", Some(1.0)), ("b", Some(2.0))]), // interesting
            results(&[("a", Some(1.0)), ("b", Some(1.0))]), // not
        ];
        assert!(is_mostly_interesting(&batch, &cfg));
        let strict = InterestingnessConfig { mostly_ratio: 1.0, ..cfg };
        assert!(!is_mostly_interesting(&batch, &strict));
    }
}
