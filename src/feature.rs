//! The per-feature abstract-value lattice.
//!
//! Every instruction scheme carries a fixed record of named features.
//! [`AbstractFeature`] is the tagged union of the five required lattice
//! kinds; [`ConcreteFeatureValue`] is what a real scheme's feature record
//! holds. `enum-as-inner` gives each variant a cheap `as_*`/`into_*`
//! accessor instead of hand-written match arms.

use std::collections::BTreeSet;

use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};

/// A concrete scheme's value for one feature, as produced by the ISA-KB.
#[derive(Debug, Clone, PartialEq, Eq, EnumAsInner, Serialize, Deserialize)]
pub enum ConcreteFeatureValue {
    Scalar(String),
    Set(BTreeSet<String>),
    Count(u32),
}

/// The kind of lattice a configured feature uses, and its static
/// parameters (the `max` of a bounded kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureKind {
    Singleton,
    Subset,
    SubsetOrDefinitelyNot,
    LogUpperBound(u32),
    EditDistance(u32),
}

/// One configured feature: its name in the scheme's feature record and the
/// lattice it is abstracted with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub name: String,
    pub kind: FeatureKind,
}

fn log_ub(count: u32) -> u32 {
    // floor(log2(count + 1))
    (32 - (count + 1).leading_zeros()).saturating_sub(1)
}

/// A tagged per-feature abstract value. All variants support the same
/// capability set: `is_top`, `is_bottom`, `subsumes`, `subsumes_feature`,
/// `join`, `expand`.
#[derive(Debug, Clone, PartialEq, Eq, EnumAsInner, Serialize, Deserialize)]
pub enum AbstractFeature {
    /// ⊥, ⊤, or a single concrete value.
    Singleton(SingletonState),
    /// ⊥, or a required subset `S` of a set-valued concrete feature. `⊤` is
    /// represented as `Set(∅)`.
    Subset(SubsetState),
    /// Like `Subset`, plus a "definitely empty" branch for memory-access
    /// style descriptors.
    SubsetOrAbsent(SubsetOrAbsentState),
    /// ⊥ is `None`; otherwise an upper bound `k` in `0..=max`. `⊤ = max`.
    LogUpperBound { k: Option<u32>, max: u32 },
    /// ⊥ is `None`; otherwise an anchor string and an edit-distance bound
    /// `d` in `0..=max`. `⊤` is `d == max`.
    EditDistance {
        base: Option<String>,
        d: u32,
        max: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SingletonState {
    Bottom,
    Value(String),
    Top,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubsetState {
    Bottom,
    /// The required subset. Empty means `⊤`.
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubsetOrAbsentState {
    Bottom,
    DefinitelyAbsent,
    /// Non-empty concrete set, required to be a superset of the stored set.
    NonEmptySubset(BTreeSet<String>),
    Top,
}

impl AbstractFeature {
    pub fn bottom(kind: FeatureKind) -> Self {
        match kind {
            FeatureKind::Singleton => AbstractFeature::Singleton(SingletonState::Bottom),
            FeatureKind::Subset => AbstractFeature::Subset(SubsetState::Bottom),
            FeatureKind::SubsetOrDefinitelyNot => {
                AbstractFeature::SubsetOrAbsent(SubsetOrAbsentState::Bottom)
            }
            FeatureKind::LogUpperBound(max) => AbstractFeature::LogUpperBound { k: None, max },
            FeatureKind::EditDistance(max) => AbstractFeature::EditDistance {
                base: None,
                d: 0,
                max,
            },
        }
    }

    pub fn top(kind: FeatureKind) -> Self {
        match kind {
            FeatureKind::Singleton => AbstractFeature::Singleton(SingletonState::Top),
            FeatureKind::Subset => AbstractFeature::Subset(SubsetState::Set(BTreeSet::new())),
            FeatureKind::SubsetOrDefinitelyNot => {
                AbstractFeature::SubsetOrAbsent(SubsetOrAbsentState::Top)
            }
            FeatureKind::LogUpperBound(max) => AbstractFeature::LogUpperBound {
                k: Some(max),
                max,
            },
            FeatureKind::EditDistance(max) => AbstractFeature::EditDistance {
                base: Some(String::new()),
                d: max,
                max,
            },
        }
    }

    pub fn is_bottom(&self) -> bool {
        match self {
            AbstractFeature::Singleton(s) => *s == SingletonState::Bottom,
            AbstractFeature::Subset(s) => *s == SubsetState::Bottom,
            AbstractFeature::SubsetOrAbsent(s) => *s == SubsetOrAbsentState::Bottom,
            AbstractFeature::LogUpperBound { k, .. } => k.is_none(),
            AbstractFeature::EditDistance { base, .. } => base.is_none(),
        }
    }

    pub fn is_top(&self) -> bool {
        match self {
            AbstractFeature::Singleton(s) => *s == SingletonState::Top,
            AbstractFeature::Subset(s) => matches!(s, SubsetState::Set(set) if set.is_empty()),
            AbstractFeature::SubsetOrAbsent(s) => *s == SubsetOrAbsentState::Top,
            AbstractFeature::LogUpperBound { k, max } => *k == Some(*max),
            AbstractFeature::EditDistance { d, max, .. } => d == max,
        }
    }

    pub fn subsumes(&self, other: &AbstractFeature) -> bool {
        if other.is_bottom() {
            return true;
        }
        match (self, other) {
            (AbstractFeature::Singleton(a), AbstractFeature::Singleton(b)) => match (a, b) {
                (SingletonState::Top, _) => true,
                (_, SingletonState::Bottom) => true,
                (SingletonState::Value(v), SingletonState::Value(w)) => v == w,
                _ => false,
            },
            (AbstractFeature::Subset(SubsetState::Set(a)), AbstractFeature::Subset(b)) => match b {
                SubsetState::Bottom => true,
                SubsetState::Set(b) => a.is_subset(b),
            },
            (AbstractFeature::Subset(SubsetState::Bottom), _) => false,
            (AbstractFeature::SubsetOrAbsent(a), AbstractFeature::SubsetOrAbsent(b)) => {
                match (a, b) {
                    (SubsetOrAbsentState::Top, _) => true,
                    (_, SubsetOrAbsentState::Bottom) => true,
                    (SubsetOrAbsentState::DefinitelyAbsent, SubsetOrAbsentState::DefinitelyAbsent) => {
                        true
                    }
                    (SubsetOrAbsentState::NonEmptySubset(s), SubsetOrAbsentState::NonEmptySubset(w)) => {
                        s.is_subset(w)
                    }
                    _ => false,
                }
            }
            (
                AbstractFeature::LogUpperBound { k: ka, .. },
                AbstractFeature::LogUpperBound { k: kb, .. },
            ) => match (ka, kb) {
                (None, None) => true,
                (None, Some(_)) => false,
                (Some(_), None) => true,
                (Some(a), Some(b)) => a >= b,
            },
            (
                AbstractFeature::EditDistance { base: ba, d: da, max },
                AbstractFeature::EditDistance { base: bb, d: db, .. },
            ) => {
                if *da == *max {
                    return true;
                }
                match (ba, bb) {
                    (None, None) => true,
                    (None, Some(_)) => false,
                    (Some(_), None) => true,
                    (Some(a), Some(b)) => {
                        if a == b {
                            da >= db
                        } else {
                            strsim::levenshtein(a, b) as u32 + db <= *da
                        }
                    }
                }
            }
            _ => panic!("mismatched feature kinds compared"),
        }
    }

    pub fn subsumes_feature(&self, concrete: &ConcreteFeatureValue) -> bool {
        match (self, concrete) {
            (AbstractFeature::Singleton(s), ConcreteFeatureValue::Scalar(v)) => match s {
                SingletonState::Top => true,
                SingletonState::Bottom => false,
                SingletonState::Value(stored) => stored == v,
            },
            (AbstractFeature::Subset(s), ConcreteFeatureValue::Set(w)) => match s {
                SubsetState::Bottom => false,
                SubsetState::Set(s) => s.is_subset(w),
            },
            (AbstractFeature::SubsetOrAbsent(s), ConcreteFeatureValue::Set(w)) => match s {
                SubsetOrAbsentState::Top => true,
                SubsetOrAbsentState::Bottom => false,
                SubsetOrAbsentState::DefinitelyAbsent => w.is_empty(),
                SubsetOrAbsentState::NonEmptySubset(stored) => !w.is_empty() && stored.is_subset(w),
            },
            (AbstractFeature::LogUpperBound { k, .. }, ConcreteFeatureValue::Count(v)) => {
                k.is_some_and(|k| k >= log_ub(*v))
            }
            (AbstractFeature::EditDistance { base, d, max }, ConcreteFeatureValue::Scalar(v)) => {
                if *d == *max {
                    return true;
                }
                base.as_ref()
                    .is_some_and(|base| strsim::levenshtein(base, v) as u32 <= *d)
            }
            _ => panic!("feature kind / concrete value mismatch"),
        }
    }

    pub fn join(&mut self, concrete: &ConcreteFeatureValue) {
        match (self, concrete) {
            (AbstractFeature::Singleton(s), ConcreteFeatureValue::Scalar(v)) => {
                *s = match s {
                    SingletonState::Bottom => SingletonState::Value(v.clone()),
                    SingletonState::Value(stored) if stored == v => SingletonState::Value(v.clone()),
                    SingletonState::Value(_) => SingletonState::Top,
                    SingletonState::Top => SingletonState::Top,
                };
            }
            (AbstractFeature::Subset(s), ConcreteFeatureValue::Set(w)) => {
                *s = match s {
                    SubsetState::Bottom => SubsetState::Set(w.clone()),
                    SubsetState::Set(stored) => {
                        SubsetState::Set(stored.intersection(w).cloned().collect())
                    }
                };
            }
            (AbstractFeature::SubsetOrAbsent(s), ConcreteFeatureValue::Set(w)) => {
                *s = match (&s, w.is_empty()) {
                    (SubsetOrAbsentState::Bottom, true) => SubsetOrAbsentState::DefinitelyAbsent,
                    (SubsetOrAbsentState::Bottom, false) => {
                        SubsetOrAbsentState::NonEmptySubset(w.clone())
                    }
                    (SubsetOrAbsentState::DefinitelyAbsent, true) => {
                        SubsetOrAbsentState::DefinitelyAbsent
                    }
                    (SubsetOrAbsentState::DefinitelyAbsent, false) => SubsetOrAbsentState::Top,
                    (SubsetOrAbsentState::NonEmptySubset(_), true) => SubsetOrAbsentState::Top,
                    (SubsetOrAbsentState::NonEmptySubset(stored), false) => {
                        SubsetOrAbsentState::NonEmptySubset(stored.intersection(w).cloned().collect())
                    }
                    (SubsetOrAbsentState::Top, _) => SubsetOrAbsentState::Top,
                };
            }
            (AbstractFeature::LogUpperBound { k, max }, ConcreteFeatureValue::Count(v)) => {
                let kv = log_ub(*v).min(*max);
                *k = Some(k.map_or(kv, |cur| cur.max(kv)));
            }
            (AbstractFeature::EditDistance { base, d, max }, ConcreteFeatureValue::Scalar(v)) => {
                match base {
                    None => {
                        *base = Some(v.clone());
                        *d = 0;
                    }
                    Some(stored) => {
                        let dist = strsim::levenshtein(stored, v) as u32;
                        *d = (*d).max(dist).min(*max);
                    }
                }
            }
            _ => panic!("feature kind / concrete value mismatch"),
        }
    }

    /// Advances this feature one step toward `⊤`. Returns `false` (no
    /// change) if already `⊤`.
    pub fn expand(&mut self) -> bool {
        match self {
            AbstractFeature::Singleton(s) => {
                if *s == SingletonState::Top {
                    false
                } else {
                    *s = SingletonState::Top;
                    true
                }
            }
            AbstractFeature::Subset(s) => match s {
                SubsetState::Bottom => {
                    *s = SubsetState::Set(BTreeSet::new());
                    true
                }
                SubsetState::Set(set) => {
                    if let Some(smallest) = set.iter().next().cloned() {
                        set.remove(&smallest);
                        true
                    } else {
                        false
                    }
                }
            },
            AbstractFeature::SubsetOrAbsent(s) => match s {
                SubsetOrAbsentState::Top => false,
                SubsetOrAbsentState::Bottom => {
                    *s = SubsetOrAbsentState::DefinitelyAbsent;
                    true
                }
                SubsetOrAbsentState::DefinitelyAbsent => {
                    *s = SubsetOrAbsentState::Top;
                    true
                }
                SubsetOrAbsentState::NonEmptySubset(set) => {
                    if let Some(smallest) = set.iter().next().cloned() {
                        set.remove(&smallest);
                    } else {
                        *s = SubsetOrAbsentState::Top;
                    }
                    true
                }
            },
            AbstractFeature::LogUpperBound { k, max } => {
                if *k == Some(*max) {
                    false
                } else {
                    *k = Some(k.map_or(0, |cur| cur + 1));
                    true
                }
            }
            AbstractFeature::EditDistance { base, d, max } => {
                if *d == *max {
                    false
                } else if base.is_none() {
                    *base = Some(String::new());
                    *d = *max;
                    true
                } else {
                    *d += 1;
                    true
                }
            }
        }
    }
}

/// An abstract instruction's full feature record, keyed by feature name.
pub type AbstractFeatureRecord = std::collections::BTreeMap<String, AbstractFeature>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singleton_join_of_differing_values_jumps_to_top() {
        let mut f = AbstractFeature::bottom(FeatureKind::Singleton);
        f.join(&ConcreteFeatureValue::Scalar("add".into()));
        assert!(!f.is_top());
        f.join(&ConcreteFeatureValue::Scalar("add".into()));
        assert!(!f.is_top());
        f.join(&ConcreteFeatureValue::Scalar("sub".into()));
        assert!(f.is_top());
    }

    #[test]
    fn subset_join_intersects() {
        let mut f = AbstractFeature::bottom(FeatureKind::Subset);
        f.join(&ConcreteFeatureValue::Set(
            ["RW".to_string(), "R".to_string()].into_iter().collect(),
        ));
        f.join(&ConcreteFeatureValue::Set(["RW".to_string()].into_iter().collect()));
        assert!(f.subsumes_feature(&ConcreteFeatureValue::Set(
            ["RW".to_string()].into_iter().collect()
        )));
        assert!(!f.subsumes_feature(&ConcreteFeatureValue::Set(std::collections::BTreeSet::new())));
    }

    #[test]
    fn log_upper_bound_matches_by_log2() {
        let f = AbstractFeature::LogUpperBound { k: Some(2), max: 5 };
        assert!(f.subsumes_feature(&ConcreteFeatureValue::Count(3))); // floor(log2(4))=2
        assert!(!f.subsumes_feature(&ConcreteFeatureValue::Count(7))); // floor(log2(8))=3
    }

    #[test]
    fn edit_distance_subsumes_feature_within_bound() {
        let f = AbstractFeature::EditDistance {
            base: Some("add".into()),
            d: 1,
            max: 3,
        };
        assert!(f.subsumes_feature(&ConcreteFeatureValue::Scalar("adc".into())));
        assert!(!f.subsumes_feature(&ConcreteFeatureValue::Scalar("xor".into())));
    }

    #[test]
    fn expand_is_monotonic_and_eventually_reaches_top() {
        let mut f = AbstractFeature::bottom(FeatureKind::LogUpperBound(3));
        let mut steps = 0;
        while f.expand() {
            steps += 1;
            assert!(steps < 100, "expand did not converge to top");
        }
        assert!(f.is_top());
    }
}
