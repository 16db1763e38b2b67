//! Owns the feature configuration, builds per-feature inverted indices over
//! a filtered ISA universe, and answers "which schemes are feasible for
//! this abstract instruction".

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use crate::feature::{
    AbstractFeature, AbstractFeatureRecord, ConcreteFeatureValue, FeatureConfig, FeatureKind,
    SingletonState, SubsetOrAbsentState, SubsetState,
};
use crate::isa::{FeatureRecord, IsaKnowledgeBase, SchemeId};

const EXACT_SCHEME_FEATURE: &str = "exact_scheme";

/// Result of a feasibility lookup. Kept as a tri-state rather than always
/// materializing the full scheme set, since "all schemes" and "no schemes"
/// are both common and cheap to special-case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeasibleSet {
    Bottom,
    All,
    Some(BTreeSet<SchemeId>),
}

impl FeasibleSet {
    pub fn len(&self, universe_size: usize) -> usize {
        match self {
            FeasibleSet::Bottom => 0,
            FeasibleSet::All => universe_size,
            FeasibleSet::Some(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, FeasibleSet::Bottom) || matches!(self, FeasibleSet::Some(s) if s.is_empty())
    }

    pub fn contains(&self, scheme: &SchemeId, universe: &BTreeSet<SchemeId>) -> bool {
        match self {
            FeasibleSet::Bottom => false,
            FeasibleSet::All => universe.contains(scheme),
            FeasibleSet::Some(s) => s.contains(scheme),
        }
    }

    pub fn materialize(&self, universe: &BTreeSet<SchemeId>) -> BTreeSet<SchemeId> {
        match self {
            FeasibleSet::Bottom => BTreeSet::new(),
            FeasibleSet::All => universe.clone(),
            FeasibleSet::Some(s) => s.clone(),
        }
    }
}

enum FeatureIndex {
    Singleton(BTreeMap<String, BTreeSet<SchemeId>>),
    Subset(BTreeMap<String, BTreeSet<SchemeId>>),
    SubsetOrAbsent {
        elements: BTreeMap<String, BTreeSet<SchemeId>>,
        definitely_empty: BTreeSet<SchemeId>,
        definitely_nonempty: BTreeSet<SchemeId>,
    },
    LogUpperBound(BTreeMap<u32, BTreeSet<SchemeId>>),
    EditDistance(BTreeMap<String, BTreeSet<SchemeId>>),
}

pub struct InsnFeatureManager {
    features: Vec<FeatureConfig>,
    all_schemes: BTreeSet<SchemeId>,
    records: BTreeMap<SchemeId, FeatureRecord>,
    indices: BTreeMap<String, FeatureIndex>,
    editdist_cache: RefCell<BTreeMap<(String, String), Vec<(String, u32)>>>,
}

impl InsnFeatureManager {
    /// The feature configuration a fresh manager starts with.
    pub fn default_features() -> Vec<FeatureConfig> {
        vec![
            FeatureConfig {
                name: "exact_scheme".to_string(),
                kind: FeatureKind::Singleton,
            },
            FeatureConfig {
                name: "mnemonic".to_string(),
                kind: FeatureKind::EditDistance(3),
            },
            FeatureConfig {
                name: "opschemes".to_string(),
                kind: FeatureKind::Subset,
            },
            FeatureConfig {
                name: "memory_usage".to_string(),
                kind: FeatureKind::SubsetOrDefinitelyNot,
            },
            FeatureConfig {
                name: "uops_on_SKL".to_string(),
                kind: FeatureKind::LogUpperBound(5),
            },
            FeatureConfig {
                name: "category".to_string(),
                kind: FeatureKind::Singleton,
            },
            FeatureConfig {
                name: "extension".to_string(),
                kind: FeatureKind::Singleton,
            },
            FeatureConfig {
                name: "isa-set".to_string(),
                kind: FeatureKind::Singleton,
            },
            FeatureConfig {
                name: "has_lock".to_string(),
                kind: FeatureKind::Singleton,
            },
            FeatureConfig {
                name: "has_rep".to_string(),
                kind: FeatureKind::Singleton,
            },
        ]
    }

    pub fn build(kb: &dyn IsaKnowledgeBase, features: Vec<FeatureConfig>) -> Self {
        let all_schemes: BTreeSet<SchemeId> = kb.schemes().iter().cloned().collect();
        let mut records = BTreeMap::new();
        for s in &all_schemes {
            records.insert(s.clone(), kb.feature_record(s));
        }

        let mut indices = BTreeMap::new();
        for f in &features {
            if f.name == EXACT_SCHEME_FEATURE {
                continue;
            }
            let index = build_index(&f.kind, &all_schemes, &records, &f.name);
            indices.insert(f.name.clone(), index);
        }

        Self {
            features,
            all_schemes,
            records,
            indices,
            editdist_cache: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn features(&self) -> &[FeatureConfig] {
        &self.features
    }

    pub fn schemes(&self) -> &BTreeSet<SchemeId> {
        &self.all_schemes
    }

    pub fn feature_record(&self, scheme: &SchemeId) -> Option<&FeatureRecord> {
        self.records.get(scheme)
    }

    /// Builds the abstract feature record resulting from joining every
    /// configured feature of `scheme`'s concrete record into a fresh bottom
    /// record, i.e. `AbstractInsn::from(scheme)`'s feature half.
    pub fn singleton_record_for(&self, scheme: &SchemeId) -> AbstractFeatureRecord {
        let record = self
            .records
            .get(scheme)
            .unwrap_or_else(|| panic!("unknown scheme {scheme}"));
        let mut out = AbstractFeatureRecord::new();
        for f in &self.features {
            let mut v = AbstractFeature::bottom(f.kind);
            if let Some(concrete) = record.get(&f.name) {
                v.join(concrete);
            }
            out.insert(f.name.clone(), v);
        }
        out
    }

    pub fn top_record(&self) -> AbstractFeatureRecord {
        self.features
            .iter()
            .map(|f| (f.name.clone(), AbstractFeature::top(f.kind)))
            .collect()
    }

    /// Every scheme whose concrete feature record could join to `record`:
    /// the exact-scheme shortcut first, otherwise the intersection of every
    /// non-`⊤` feature's index bucket.
    pub fn feasible(&self, record: &AbstractFeatureRecord) -> FeasibleSet {
        if let Some(AbstractFeature::Singleton(s)) = record.get(EXACT_SCHEME_FEATURE) {
            match s {
                SingletonState::Value(v) => {
                    return if self.all_schemes.contains(v) {
                        FeasibleSet::Some([v.clone()].into_iter().collect())
                    } else {
                        FeasibleSet::Bottom
                    };
                }
                SingletonState::Bottom => return FeasibleSet::Bottom,
                SingletonState::Top => {}
            }
        }

        let mut candidates: Option<BTreeSet<SchemeId>> = None;
        for (name, feature) in record {
            if name == EXACT_SCHEME_FEATURE || feature.is_top() {
                continue;
            }
            if feature.is_bottom() {
                return FeasibleSet::Bottom;
            }
            let bucket = self.lookup_feature(name, feature);
            candidates = Some(match candidates {
                None => bucket,
                Some(c) => c.intersection(&bucket).cloned().collect(),
            });
        }

        match candidates {
            None => FeasibleSet::All,
            Some(c) => FeasibleSet::Some(c),
        }
    }

    fn lookup_feature(&self, name: &str, feature: &AbstractFeature) -> BTreeSet<SchemeId> {
        let index = self
            .indices
            .get(name)
            .unwrap_or_else(|| panic!("feature '{name}' is not indexed"));
        match (index, feature) {
            (FeatureIndex::Singleton(idx), AbstractFeature::Singleton(s)) => match s {
                SingletonState::Value(v) => idx.get(v).cloned().unwrap_or_default(),
                _ => BTreeSet::new(),
            },
            (FeatureIndex::Subset(idx), AbstractFeature::Subset(s)) => match s {
                SubsetState::Set(elements) => intersect_buckets(idx, elements),
                SubsetState::Bottom => BTreeSet::new(),
            },
            (
                FeatureIndex::SubsetOrAbsent {
                    elements,
                    definitely_empty,
                    definitely_nonempty,
                },
                AbstractFeature::SubsetOrAbsent(s),
            ) => match s {
                SubsetOrAbsentState::DefinitelyAbsent => definitely_empty.clone(),
                SubsetOrAbsentState::NonEmptySubset(subset) if subset.is_empty() => {
                    definitely_nonempty.clone()
                }
                SubsetOrAbsentState::NonEmptySubset(subset) => intersect_buckets(elements, subset),
                SubsetOrAbsentState::Bottom | SubsetOrAbsentState::Top => BTreeSet::new(),
            },
            (FeatureIndex::LogUpperBound(idx), AbstractFeature::LogUpperBound { k, .. }) => k
                .and_then(|k| idx.get(&k).cloned())
                .unwrap_or_default(),
            (FeatureIndex::EditDistance(idx), AbstractFeature::EditDistance { base, d, .. }) => {
                let Some(base) = base else { return BTreeSet::new() };
                self.editdist_buckets_within(name, idx, base, *d)
            }
            _ => panic!("feature '{name}' kind mismatch between index and abstract value"),
        }
    }

    fn editdist_buckets_within(
        &self,
        name: &str,
        idx: &BTreeMap<String, BTreeSet<SchemeId>>,
        base: &str,
        d: u32,
    ) -> BTreeSet<SchemeId> {
        let key = (name.to_string(), base.to_string());
        let mut cache = self.editdist_cache.borrow_mut();
        let sorted = cache.entry(key).or_insert_with(|| {
            let mut v: Vec<(String, u32)> = idx
                .keys()
                .map(|k| (k.clone(), strsim::levenshtein(base, k) as u32))
                .collect();
            v.sort_by_key(|(_, dist)| *dist);
            v
        });
        let mut out = BTreeSet::new();
        for (value, dist) in sorted.iter() {
            if *dist > d {
                break;
            }
            if let Some(bucket) = idx.get(value) {
                out.extend(bucket.iter().cloned());
            }
        }
        out
    }
}

fn intersect_buckets(
    idx: &BTreeMap<String, BTreeSet<SchemeId>>,
    elements: &BTreeSet<String>,
) -> BTreeSet<SchemeId> {
    let mut iter = elements.iter();
    let Some(first) = iter.next() else {
        return BTreeSet::new();
    };
    let mut acc = idx.get(first).cloned().unwrap_or_default();
    for e in iter {
        let bucket = idx.get(e).cloned().unwrap_or_default();
        acc = acc.intersection(&bucket).cloned().collect();
    }
    acc
}

fn log_ub(count: u32, max: u32) -> u32 {
    (32 - (count + 1).leading_zeros()).saturating_sub(1).min(max)
}

fn build_index(
    kind: &FeatureKind,
    schemes: &BTreeSet<SchemeId>,
    records: &BTreeMap<SchemeId, FeatureRecord>,
    name: &str,
) -> FeatureIndex {
    match kind {
        FeatureKind::Singleton => {
            let mut idx: BTreeMap<String, BTreeSet<SchemeId>> = BTreeMap::new();
            for s in schemes {
                if let Some(ConcreteFeatureValue::Scalar(v)) = records[s].get(name) {
                    idx.entry(v.clone()).or_default().insert(s.clone());
                }
            }
            FeatureIndex::Singleton(idx)
        }
        FeatureKind::EditDistance(_) => {
            let mut idx: BTreeMap<String, BTreeSet<SchemeId>> = BTreeMap::new();
            for s in schemes {
                if let Some(ConcreteFeatureValue::Scalar(v)) = records[s].get(name) {
                    idx.entry(v.clone()).or_default().insert(s.clone());
                }
            }
            FeatureIndex::EditDistance(idx)
        }
        FeatureKind::Subset => {
            let mut idx: BTreeMap<String, BTreeSet<SchemeId>> = BTreeMap::new();
            for s in schemes {
                if let Some(ConcreteFeatureValue::Set(set)) = records[s].get(name) {
                    for e in set {
                        idx.entry(e.clone()).or_default().insert(s.clone());
                    }
                }
            }
            FeatureIndex::Subset(idx)
        }
        FeatureKind::SubsetOrDefinitelyNot => {
            let mut elements: BTreeMap<String, BTreeSet<SchemeId>> = BTreeMap::new();
            let mut definitely_empty = BTreeSet::new();
            let mut definitely_nonempty = BTreeSet::new();
            for s in schemes {
                if let Some(ConcreteFeatureValue::Set(set)) = records[s].get(name) {
                    if set.is_empty() {
                        definitely_empty.insert(s.clone());
                    } else {
                        definitely_nonempty.insert(s.clone());
                        for e in set {
                            elements.entry(e.clone()).or_default().insert(s.clone());
                        }
                    }
                }
            }
            FeatureIndex::SubsetOrAbsent {
                elements,
                definitely_empty,
                definitely_nonempty,
            }
        }
        FeatureKind::LogUpperBound(max) => {
            let mut idx: BTreeMap<u32, BTreeSet<SchemeId>> = BTreeMap::new();
            for s in schemes {
                if let Some(ConcreteFeatureValue::Count(v)) = records[s].get(name) {
                    let k = log_ub(*v, *max);
                    for bucket in k..=*max {
                        idx.entry(bucket).or_default().insert(s.clone());
                    }
                }
            }
            FeatureIndex::LogUpperBound(idx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::SampleIsaKb;

    fn manager() -> InsnFeatureManager {
        let kb = SampleIsaKb::new();
        InsnFeatureManager::build(&kb, InsnFeatureManager::default_features())
    }

    #[test]
    fn exact_scheme_shortcuts_to_singleton_set() {
        let m = manager();
        let record = m.singleton_record_for(&"add r64, r64".to_string());
        match m.feasible(&record) {
            FeasibleSet::Some(s) => {
                assert_eq!(s.len(), 1);
                assert!(s.contains("add r64, r64"));
            }
            other => panic!("expected a singleton feasible set, got {other:?}"),
        }
    }

    #[test]
    fn top_record_is_feasible_for_everything() {
        let m = manager();
        let record = m.top_record();
        assert_eq!(m.feasible(&record), FeasibleSet::All);
    }

    #[test]
    fn mnemonic_only_constraint_matches_editdistance_neighbors() {
        let m = manager();
        let mut record = m.top_record();
        record.insert(
            "exact_scheme".to_string(),
            AbstractFeature::Singleton(SingletonState::Top),
        );
        record.insert(
            "mnemonic".to_string(),
            AbstractFeature::EditDistance {
                base: Some("add".to_string()),
                d: 0,
                max: 3,
            },
        );
        let feasible = m.feasible(&record);
        assert!(feasible.contains(&"add r64, r64".to_string(), m.schemes()));
        assert!(!feasible.contains(&"sub r64, r64".to_string(), m.schemes()));
    }

    #[test]
    fn feasible_set_matches_subsumes_feature_record_definition() {
        // Property 5 from the testable-properties list: feasible(A) equals
        // the set of schemes whose concrete record A subsumes.
        let m = manager();
        let mut record = m.top_record();
        record.insert(
            "category".to_string(),
            AbstractFeature::Singleton(SingletonState::Value("BINARY".to_string())),
        );
        let feasible = m.feasible(&record);
        for s in m.schemes() {
            let expected = record
                .iter()
                .all(|(name, f)| f.subsumes_feature(&m.feature_record(s).unwrap()[name]));
            assert_eq!(
                feasible.contains(s, m.schemes()),
                expected,
                "mismatch for scheme {s}"
            );
        }
    }
}
