//! AbstractInsn, AbstractBlock, the aliasing map, and expansion tokens.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};

use crate::feature::{AbstractFeature, AbstractFeatureRecord, ConcreteFeatureValue, FeatureConfig};
use crate::insn_feature_manager::InsnFeatureManager;
use crate::isa::{ConcreteInsn, IsaKnowledgeBase, OperandKey};
use crate::iwho_augmentation::IwhoAugmentation;

const PRESENT: &str = "__present__";

/// One operand position: the instruction slot it belongs to and its key
/// within that slot's scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AliasKey(pub usize, pub OperandKey);

fn normalize(a: AliasKey, b: AliasKey) -> (AliasKey, AliasKey) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AliasFact {
    MustAlias,
    MustNotAlias,
}

/// An atomic, one-step lattice move. Totally ordered so `max_benefit`
/// expansion selection can tie-break deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ExpansionToken {
    Insn(usize, String),
    Alias(AliasKey, AliasKey),
}

/// A single slot of an abstract block: whether the slot is definitely
/// present, definitely absent, or either (`present`, modeled as a
/// `Singleton` feature over `"true"`/`"false"`), plus its configured feature
/// record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbstractInsn {
    pub present: AbstractFeature,
    pub features: AbstractFeatureRecord,
}

impl AbstractInsn {
    pub fn bottom(configs: &[FeatureConfig]) -> Self {
        Self {
            present: AbstractFeature::bottom(crate::feature::FeatureKind::Singleton),
            features: configs
                .iter()
                .map(|f| (f.name.clone(), AbstractFeature::bottom(f.kind)))
                .collect(),
        }
    }

    pub fn top(configs: &[FeatureConfig]) -> Self {
        Self {
            present: AbstractFeature::top(crate::feature::FeatureKind::Singleton),
            features: configs
                .iter()
                .map(|f| (f.name.clone(), AbstractFeature::top(f.kind)))
                .collect(),
        }
    }

    /// Joins either a concrete instruction, or `None` for "this slot is
    /// absent" — which touches only the `present` pseudo-feature, matching
    /// the original's `extract_features(None) == {"present": False}`.
    pub fn join_concrete(&mut self, mgr: &InsnFeatureManager, insn: Option<&ConcreteInsn>) {
        match insn {
            None => self
                .present
                .join(&ConcreteFeatureValue::Scalar("false".to_string())),
            Some(ci) => {
                self.present
                    .join(&ConcreteFeatureValue::Scalar("true".to_string()));
                let record = mgr
                    .feature_record(&ci.scheme)
                    .unwrap_or_else(|| panic!("unknown scheme {}", ci.scheme));
                for (name, feat) in self.features.iter_mut() {
                    if let Some(cv) = record.get(name) {
                        feat.join(cv);
                    }
                }
            }
        }
    }

    pub fn subsumes(&self, other: &AbstractInsn) -> bool {
        self.present.subsumes(&other.present)
            && self
                .features
                .iter()
                .all(|(k, v)| v.subsumes(&other.features[k]))
    }
}

/// Fixed-length ordered tuple of abstract instructions plus an aliasing
/// map. `must_alias`/`must_not_alias` hold only directly-observed
/// ("primary") facts; the full must-alias equivalence closure is derived on
/// demand via union-find.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbstractBlock {
    pub n: usize,
    pub insns: Vec<AbstractInsn>,
    pub must_alias: BTreeSet<(AliasKey, AliasKey)>,
    pub must_not_alias: BTreeSet<(AliasKey, AliasKey)>,
    pub is_bot: bool,
}

impl AbstractBlock {
    pub fn make_top(n: usize, configs: &[FeatureConfig]) -> Self {
        Self {
            n,
            insns: (0..n).map(|_| AbstractInsn::top(configs)).collect(),
            must_alias: BTreeSet::new(),
            must_not_alias: BTreeSet::new(),
            is_bot: false,
        }
    }

    pub fn from_concrete(
        n: usize,
        mgr: &InsnFeatureManager,
        kb: &dyn IsaKnowledgeBase,
        concrete_bb: &[ConcreteInsn],
    ) -> Self {
        let mut block = Self {
            n,
            insns: (0..n).map(|_| AbstractInsn::bottom(mgr.features())).collect(),
            must_alias: BTreeSet::new(),
            must_not_alias: BTreeSet::new(),
            is_bot: false,
        };
        block.join(mgr, kb, concrete_bb);
        block
    }

    /// Folds one concrete sample into this block: joins every slot's
    /// feature record, then updates the aliasing facts for every pair of
    /// non-skipped operand positions across distinct present slots.
    pub fn join(&mut self, mgr: &InsnFeatureManager, kb: &dyn IsaKnowledgeBase, concrete_bb: &[ConcreteInsn]) {
        assert!(concrete_bb.len() <= self.n, "concrete block longer than abstract block");

        for i in 0..self.n {
            self.insns[i].join_concrete(mgr, concrete_bb.get(i));
        }

        for i in 0..self.n {
            let Some(ci) = concrete_bb.get(i) else { continue };
            for (ki, vi) in &ci.operands {
                if IwhoAugmentation::skip_for_aliasing(vi) {
                    continue;
                }
                for j in (i + 1)..self.n {
                    let Some(cj) = concrete_bb.get(j) else { continue };
                    for (kj, vj) in &cj.operands {
                        if IwhoAugmentation::skip_for_aliasing(vj) {
                            continue;
                        }
                        let a = AliasKey(i, *ki);
                        let b = AliasKey(j, *kj);
                        let concrete_fact = if IwhoAugmentation::must_alias(kb, vi, vj) {
                            Some(AliasFact::MustAlias)
                        } else if !IwhoAugmentation::may_alias(kb, vi, vj) {
                            Some(AliasFact::MustNotAlias)
                        } else {
                            None
                        };
                        self.join_alias_pair(normalize(a, b), concrete_fact);
                    }
                }
            }
        }
        self.recompute_bottom();
    }

    fn join_alias_pair(&mut self, key: (AliasKey, AliasKey), concrete: Option<AliasFact>) {
        match concrete {
            None => {
                self.must_alias.remove(&key);
                self.must_not_alias.remove(&key);
            }
            Some(AliasFact::MustAlias) => {
                if !self.must_not_alias.remove(&key) {
                    self.must_alias.insert(key);
                }
            }
            Some(AliasFact::MustNotAlias) => {
                if !self.must_alias.remove(&key) {
                    self.must_not_alias.insert(key);
                }
            }
        }
    }

    pub fn must_alias_components(&self) -> BTreeMap<AliasKey, usize> {
        let mut ids: BTreeMap<AliasKey, usize> = BTreeMap::new();
        for (a, b) in &self.must_alias {
            let next = ids.len();
            ids.entry(*a).or_insert(next);
            let next = ids.len();
            ids.entry(*b).or_insert(next);
        }
        let mut uf = UnionFind::new(ids.len().max(1));
        for (a, b) in &self.must_alias {
            uf.union(ids[a], ids[b]);
        }
        ids.into_iter().map(|(k, id)| (k, uf.find(id) as usize)).collect()
    }

    fn recompute_bottom(&mut self) {
        let comps = self.must_alias_components();
        for (a, b) in &self.must_not_alias {
            if let (Some(&ra), Some(&rb)) = (comps.get(a), comps.get(b)) {
                if ra == rb {
                    self.is_bot = true;
                    return;
                }
            }
        }
    }

    /// The aliasing lattice value for `(a, b)`, `None` meaning `⊤`.
    pub fn alias_fact(&self, a: AliasKey, b: AliasKey) -> Option<AliasFact> {
        let key = normalize(a, b);
        if self.must_not_alias.contains(&key) {
            return Some(AliasFact::MustNotAlias);
        }
        let comps = self.must_alias_components();
        if let (Some(&ra), Some(&rb)) = (comps.get(&key.0), comps.get(&key.1)) {
            if ra == rb {
                return Some(AliasFact::MustAlias);
            }
        }
        None
    }

    /// Whether every concrete block matched by `other` is also matched by
    /// `self`: per-slot feature subsumption plus agreement on every aliasing
    /// fact this block has pinned down.
    pub fn subsumes(&self, other: &AbstractBlock) -> bool {
        assert_eq!(self.n, other.n, "subsumes between mismatched block lengths");
        if other.is_bot {
            return true;
        }
        if self.is_bot {
            return false;
        }
        for i in 0..self.n {
            if !self.insns[i].subsumes(&other.insns[i]) {
                return false;
            }
        }
        for (a, b) in &self.must_alias {
            if other.alias_fact(*a, *b) != Some(AliasFact::MustAlias) {
                return false;
            }
        }
        for (a, b) in &self.must_not_alias {
            if other.alias_fact(*a, *b) != Some(AliasFact::MustNotAlias) {
                return false;
            }
        }
        true
    }

    fn feasible_len(&self, mgr: &InsnFeatureManager, record: &AbstractFeatureRecord) -> usize {
        mgr.feasible(record).len(mgr.schemes().len())
    }

    /// Every non-`⊤` feature and aliasing fact this block could forget one
    /// step of, each paired with a `(benefit, no_semantic_change)` heuristic:
    /// benefit estimates how many additional concrete schemes/facts the move
    /// would admit, and `no_semantic_change` flags a move that widens the
    /// lattice value without changing the feasible set at all.
    pub fn possible_expansions(&self, mgr: &InsnFeatureManager) -> Vec<(ExpansionToken, (f64, bool))> {
        let mut out = Vec::new();
        for (i, insn) in self.insns.iter().enumerate() {
            if !insn.present.is_top() {
                out.push((
                    ExpansionToken::Insn(i, PRESENT.to_string()),
                    (mgr.schemes().len() as f64, false),
                ));
            }
            for (name, feat) in &insn.features {
                if feat.is_top() {
                    continue;
                }
                let before = self.feasible_len(mgr, &insn.features);
                let mut clone = insn.features.clone();
                clone.get_mut(name).unwrap().expand();
                let after = self.feasible_len(mgr, &clone);
                let benefit = after.saturating_sub(before) as f64;
                out.push((ExpansionToken::Insn(i, name.clone()), (benefit, after == before)));
            }
        }
        for pair in self.must_alias.iter().chain(self.must_not_alias.iter()) {
            out.push((ExpansionToken::Alias(pair.0, pair.1), (1.0, false)));
        }
        out
    }

    /// Applies one step produced by `possible_expansions`, widening the
    /// targeted feature or forgetting the targeted aliasing fact.
    pub fn apply_expansion(&mut self, token: &ExpansionToken) {
        match token {
            ExpansionToken::Insn(i, name) => {
                if name == PRESENT {
                    self.insns[*i].present.expand();
                } else {
                    self.insns[*i]
                        .features
                        .get_mut(name)
                        .unwrap_or_else(|| panic!("unknown feature '{name}'"))
                        .expand();
                }
            }
            ExpansionToken::Alias(a, b) => {
                let key = normalize(*a, *b);
                self.must_alias.remove(&key);
                self.must_not_alias.remove(&key);
            }
        }
    }
}

/// Deterministic strategy: highest benefit, ties broken by token order.
pub fn choose_max_benefit(options: &[(ExpansionToken, (f64, bool))]) -> Option<ExpansionToken> {
    let max_benefit = options
        .iter()
        .map(|(_, (b, _))| *b)
        .fold(f64::NEG_INFINITY, f64::max);
    options
        .iter()
        .filter(|(_, (b, _))| *b == max_benefit)
        .map(|(t, _)| t.clone())
        .min()
}

/// Random strategy: uniformly pick among all offered expansions.
pub fn choose_random(
    options: &[(ExpansionToken, (f64, bool))],
    rng: &mut impl rand::Rng,
) -> Option<ExpansionToken> {
    if options.is_empty() {
        return None;
    }
    let idx = rng.gen_range(0..options.len());
    Some(options[idx].0.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{OperandValue, SampleIsaKb};
    use std::collections::BTreeMap;

    fn setup() -> (SampleIsaKb, InsnFeatureManager) {
        let kb = SampleIsaKb::new();
        let mgr = InsnFeatureManager::build(&kb, InsnFeatureManager::default_features());
        (kb, mgr)
    }

    fn insn(scheme: &str, operands: &[(u8, OperandValue)]) -> ConcreteInsn {
        ConcreteInsn {
            scheme: scheme.to_string(),
            operands: operands
                .iter()
                .map(|(k, v)| (OperandKey(*k), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn rax() -> OperandValue {
        OperandValue::Register {
            name: "rax".into(),
            width: 64,
            alias_class: "rax".into(),
        }
    }
    fn rbx() -> OperandValue {
        OperandValue::Register {
            name: "rbx".into(),
            width: 64,
            alias_class: "rbx".into(),
        }
    }
    fn imm(v: i64) -> OperandValue {
        OperandValue::Immediate { value: v, width: 32 }
    }

    #[test]
    fn reflexive_subsumption_holds() {
        let (kb, mgr) = setup();
        let block = vec![
            insn("add r64, imm32", &[(0, rax()), (1, imm(0x2a))]),
            insn("sub r64, r64", &[(0, rbx()), (1, rax())]),
        ];
        let ab = AbstractBlock::from_concrete(2, &mgr, &kb, &block);
        assert!(ab.subsumes(&ab));
    }

    #[test]
    fn join_monotonicity_holds() {
        let (kb, mgr) = setup();
        let first = vec![
            insn("add r64, imm32", &[(0, rax()), (1, imm(0x2a))]),
            insn("sub r64, r64", &[(0, rbx()), (1, rax())]),
        ];
        let mut ab = AbstractBlock::from_concrete(2, &mgr, &kb, &first);
        let pre = ab.clone();
        let second = vec![
            insn("add r64, imm32", &[(0, rbx()), (1, imm(0x1))]),
            insn("sub r64, r64", &[(0, rax()), (1, rbx())]),
        ];
        ab.join(&mgr, &kb, &second);
        assert!(ab.subsumes(&pre));
    }

    #[test]
    fn must_alias_forces_contradiction_to_bottom() {
        let (kb, mgr) = setup();
        let must_differ = vec![
            insn("sub r64, r64", &[(0, rax()), (1, rbx())]),
        ];
        let mut ab = AbstractBlock::from_concrete(1, &mgr, &kb, &must_differ);
        // directly force a contradictory must-alias fact between the two
        // operand positions that were just observed as must-not-alias.
        let a = AliasKey(0, OperandKey(0));
        let b = AliasKey(0, OperandKey(1));
        ab.must_alias.insert(normalize(a, b));
        ab.recompute_bottom();
        assert!(ab.is_bot);
    }

    #[test]
    fn expansion_monotonicity_holds() {
        let (kb, mgr) = setup();
        let block = vec![insn("add r64, imm32", &[(0, rax()), (1, imm(0x2a))])];
        let mut ab = AbstractBlock::from_concrete(1, &mgr, &kb, &block);
        let pre = ab.clone();
        let options = ab.possible_expansions(&mgr);
        let token = choose_max_benefit(&options).expect("at least one expansion available");
        ab.apply_expansion(&token);
        assert!(ab.subsumes(&pre));
    }
}
