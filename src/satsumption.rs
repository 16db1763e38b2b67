//! SAT-encoded subsumption checks: whether a concrete block is represented
//! by an abstract block, and whether one abstract block represents every
//! concrete block another one does. Only the order-preserving matching is
//! implemented; an unordered ("any permutation of instructions counts")
//! variant is deliberately not supported.

use std::collections::BTreeMap;

use itertools::Itertools;
use varisat::{CnfFormula, ExtendFormula, Lit, Solver};

use crate::abstract_block::{AbstractBlock, AliasFact, AliasKey};
use crate::insn_feature_manager::InsnFeatureManager;
use crate::isa::{ConcreteInsn, IsaKnowledgeBase};
use crate::iwho_augmentation::IwhoAugmentation;

/// Monotonically increasing pool of DIMACS-style variable numbers, mirroring
/// the Python implementation's `fresh_var` closure.
struct VarPool {
    next: i32,
}

impl VarPool {
    fn new() -> Self {
        Self { next: 1 }
    }

    fn fresh(&mut self) -> i32 {
        let v = self.next;
        self.next += 1;
        v
    }
}

fn pos(v: i32) -> Lit {
    Lit::from_dimacs(v as i64)
}

fn neg(v: i32) -> Lit {
    Lit::from_dimacs(-(v as i64))
}

fn at_most_one(formula: &mut CnfFormula, vars: &[i32]) {
    for i in 0..vars.len() {
        for j in (i + 1)..vars.len() {
            formula.add_clause(&[neg(vars[i]), neg(vars[j])]);
        }
    }
}

fn exactly_one(formula: &mut CnfFormula, vars: &[i32]) {
    let lits: Vec<Lit> = vars.iter().map(|&v| pos(v)).collect();
    formula.add_clause(&lits);
    at_most_one(formula, vars);
}

fn solve(formula: CnfFormula) -> bool {
    let mut solver = Solver::new();
    solver.add_formula(&formula);
    solver.solve().expect("varisat solve should not error on a well-formed formula")
}

/// `present` pinned to definitely absent: this slot requires no mapped
/// concrete instruction at all, matching the Python `present.val == False`
/// short-circuit in `AbsInsn.subsumes`/`compute_feasible_schemes`.
fn definitely_absent(insn: &crate::abstract_block::AbstractInsn) -> bool {
    use crate::feature::{AbstractFeature, SingletonState};
    matches!(
        &insn.present,
        AbstractFeature::Singleton(SingletonState::Value(v)) if v == "false"
    )
}

/// Decide whether there is an order-preserving injective mapping from the
/// abstract instructions of `ab` (skipping slots pinned definitely absent)
/// into the instructions of `bb` such that every mapped pair's scheme is
/// feasible and every non-`⊤` aliasing fact holds, with every concrete
/// instruction strictly between two consecutive mapped positions unmapped.
pub fn check_subsumed(
    bb: &[ConcreteInsn],
    ab: &AbstractBlock,
    mgr: &InsnFeatureManager,
    kb: &dyn IsaKnowledgeBase,
) -> bool {
    let active_slots: Vec<usize> = (0..ab.n)
        .filter(|&i| !definitely_absent(&ab.insns[i]))
        .collect();
    if active_slots.is_empty() {
        return true;
    }

    let mut pool = VarPool::new();
    let mut formula = CnfFormula::new();

    // map_vars[(aidx, cidx)] = the boolean variable for "abstract slot aidx
    // maps to concrete instruction cidx".
    let mut map_vars: BTreeMap<(usize, usize), i32> = BTreeMap::new();
    let mut by_a: BTreeMap<usize, Vec<i32>> = BTreeMap::new();
    let mut by_a_cidx: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut by_c: BTreeMap<usize, Vec<i32>> = BTreeMap::new();

    let universe = mgr.schemes().clone();
    for &aidx in &active_slots {
        let feasible = mgr.feasible(&ab.insns[aidx].features);
        for (cidx, ci) in bb.iter().enumerate() {
            if feasible.contains(&ci.scheme, &universe) {
                let var = pool.fresh();
                map_vars.insert((aidx, cidx), var);
                by_a.entry(aidx).or_default().push(var);
                by_a_cidx.entry(aidx).or_default().push(cidx);
                by_c.entry(cidx).or_default().push(var);
            }
        }
    }

    for &aidx in &active_slots {
        let Some(vs) = by_a.get(&aidx) else {
            return false;
        };
        exactly_one(&mut formula, vs);
    }
    for vs in by_c.values() {
        at_most_one(&mut formula, vs);
    }

    // aliasing constraints, one clause set per unordered pair of active slots.
    for (aidx1, aidx2) in active_slots.iter().tuple_combinations() {
        for (k1, k2) in operand_keys_of(ab, *aidx1)
            .into_iter()
            .cartesian_product(operand_keys_of(ab, *aidx2))
        {
            let fact = ab.alias_fact(AliasKey(*aidx1, k1), AliasKey(*aidx2, k2));
            let Some(fact) = fact else { continue };
            let should_alias = matches!(fact, AliasFact::MustAlias);
            let Some(c1s) = by_a_cidx.get(aidx1) else { continue };
            let Some(c2s) = by_a_cidx.get(aidx2) else { continue };
            for &cidx1 in c1s {
                let Some(op1) = bb[cidx1].get_operand(k1) else { continue };
                for &cidx2 in c2s {
                    if cidx1 == cidx2 {
                        continue;
                    }
                    let Some(op2) = bb[cidx2].get_operand(k2) else { continue };
                    let violates = if should_alias {
                        !IwhoAugmentation::must_alias(kb, op1, op2)
                    } else {
                        IwhoAugmentation::may_alias(kb, op1, op2)
                    };
                    if violates {
                        formula.add_clause(&[
                            neg(map_vars[&(*aidx1, cidx1)]),
                            neg(map_vars[&(*aidx2, cidx2)]),
                        ]);
                    }
                }
            }
        }
    }

    // order preservation / "clean" condition between consecutive active slots.
    for (pos_in_active, &aidx) in active_slots.iter().enumerate() {
        let next_aidx = active_slots[(pos_in_active + 1) % active_slots.len()];
        for cidx1 in 0..bb.len() {
            for cidx2 in 0..bb.len() {
                if cidx1 == cidx2 {
                    continue;
                }
                if (cidx1 + 1) % bb.len() == cidx2 {
                    continue;
                }
                let (Some(&v1), Some(&v2)) = (
                    map_vars.get(&(aidx, cidx1)),
                    map_vars.get(&(next_aidx, cidx2)),
                ) else {
                    continue;
                };
                let clean_var = pool.fresh();
                formula.add_clause(&[neg(v1), neg(v2), pos(clean_var)]);

                let mut mid = (cidx1 + 1) % bb.len();
                while mid != cidx2 {
                    for &aidx_it in &active_slots {
                        if let Some(&vm) = map_vars.get(&(aidx_it, mid)) {
                            formula.add_clause(&[neg(clean_var), neg(vm)]);
                        }
                    }
                    mid = (mid + 1) % bb.len();
                }
            }
        }
    }

    solve(formula)
}

fn operand_keys_of(ab: &AbstractBlock, aidx: usize) -> Vec<crate::isa::OperandKey> {
    // The aliasing map itself is the source of truth for which operand keys
    // at a slot participate: collect every key mentioned anywhere for this
    // slot rather than re-deriving it from scheme operand lists (an
    // abstract slot's feasible set may span schemes with different operand
    // layouts).
    let mut keys = std::collections::BTreeSet::new();
    for (a, b) in ab.must_alias.iter().chain(ab.must_not_alias.iter()) {
        if a.0 == aidx {
            keys.insert(a.1);
        }
        if b.0 == aidx {
            keys.insert(b.1);
        }
    }
    keys.into_iter().collect()
}

/// The abstract-to-abstract variant: decide whether `sup` represents every
/// concrete block that `sub` represents, via an order-preserving injective
/// mapping from `sub`'s abstract instructions into `sup`'s, using feasible-set
/// containment in place of scheme membership.
pub fn abstract_subsumed(
    sub: &AbstractBlock,
    sup: &AbstractBlock,
    mgr: &InsnFeatureManager,
) -> bool {
    if sub.n < sup.n {
        return false;
    }
    if sup.is_bot {
        return true;
    }
    if sub.is_bot {
        return false;
    }

    let universe: std::collections::BTreeSet<_> = mgr.schemes().clone();
    let sub_feasible: Vec<_> = (0..sub.n)
        .map(|i| mgr.feasible(&sub.insns[i].features).materialize(&universe))
        .collect();
    let sup_feasible: Vec<_> = (0..sup.n)
        .map(|i| mgr.feasible(&sup.insns[i].features).materialize(&universe))
        .collect();

    let mut pool = VarPool::new();
    let mut formula = CnfFormula::new();
    let mut map_vars: BTreeMap<(usize, usize), i32> = BTreeMap::new();
    let mut by_sup: BTreeMap<usize, Vec<i32>> = BTreeMap::new();
    let mut by_sup_idx: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut by_sub: BTreeMap<usize, Vec<i32>> = BTreeMap::new();

    for (i_sub, fs_sub) in sub_feasible.iter().enumerate() {
        for (i_sup, fs_sup) in sup_feasible.iter().enumerate() {
            if fs_sub.is_subset(fs_sup) {
                let var = pool.fresh();
                map_vars.insert((i_sub, i_sup), var);
                by_sup.entry(i_sup).or_default().push(var);
                by_sup_idx.entry(i_sup).or_default().push(i_sub);
                by_sub.entry(i_sub).or_default().push(var);
            }
        }
    }

    for i_sup in 0..sup.n {
        let Some(vs) = by_sup.get(&i_sup) else {
            return false;
        };
        exactly_one(&mut formula, vs);
    }
    for vs in by_sub.values() {
        at_most_one(&mut formula, vs);
    }

    for pair in sup.must_alias.iter().chain(sup.must_not_alias.iter()) {
        let (a, b) = *pair;
        let fact = sup.alias_fact(a, b);
        let Some(fact) = fact else { continue };
        let Some(i1_candidates) = by_sup_idx.get(&a.0) else { continue };
        let Some(i2_candidates) = by_sup_idx.get(&b.0) else { continue };
        for &i1_sub in i1_candidates {
            for &i2_sub in i2_candidates {
                let sub_fact = sub.alias_fact(AliasKey(i1_sub, a.1), AliasKey(i2_sub, b.1));
                let subsumed = sub_fact == Some(fact);
                if !subsumed {
                    if let (Some(&v1), Some(&v2)) = (
                        map_vars.get(&(i1_sub, a.0)),
                        map_vars.get(&(i2_sub, b.0)),
                    ) {
                        formula.add_clause(&[neg(v1), neg(v2)]);
                    }
                }
            }
        }
    }

    // order preservation between consecutive sup slots.
    for i_sup in 0..sup.n {
        let next_sup = (i_sup + 1) % sup.n;
        for i1 in 0..sub.n {
            for i2 in 0..sub.n {
                if i1 == i2 || (i1 + 1) % sub.n == i2 {
                    continue;
                }
                let (Some(&v1), Some(&v2)) =
                    (map_vars.get(&(i1, i_sup)), map_vars.get(&(i2, next_sup)))
                else {
                    continue;
                };
                let clean_var = pool.fresh();
                formula.add_clause(&[neg(v1), neg(v2), pos(clean_var)]);
                let mut mid = (i1 + 1) % sub.n;
                while mid != i2 {
                    for i_sup_it in 0..sup.n {
                        if let Some(&vm) = map_vars.get(&(mid, i_sup_it)) {
                            formula.add_clause(&[neg(clean_var), neg(vm)]);
                        }
                    }
                    mid = (mid + 1) % sub.n;
                }
            }
        }
    }

    solve(formula)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn_feature_manager::InsnFeatureManager;
    use crate::isa::{OperandKey, OperandValue, SampleIsaKb};
    use std::collections::BTreeMap as Map;

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
                .collect::<Map<_, _>>(),
        }
    }

    fn rax() -> OperandValue {
        OperandValue::Register { name: "rax".into(), width: 64, alias_class: "rax".into() }
    }
    fn rbx() -> OperandValue {
        OperandValue::Register { name: "rbx".into(), width: 64, alias_class: "rbx".into() }
    }
    fn rcx() -> OperandValue {
        OperandValue::Register { name: "rcx".into(), width: 64, alias_class: "rcx".into() }
    }
    fn imm(v: i64) -> OperandValue {
        OperandValue::Immediate { value: v, width: 32 }
    }

    #[test]
    fn reflexive_subsumption_holds_under_sat() {
        let (kb, mgr) = setup();
        let block = vec![
            insn("add r64, imm32", &[(0, rax()), (1, imm(0x2a))]),
            insn("sub r64, r64", &[(0, rbx()), (1, rax())]),
        ];
        let ab = AbstractBlock::from_concrete(2, &mgr, &kb, &block);
        assert!(check_subsumed(&block, &ab, &mgr, &kb));
    }

    #[test]
    fn reordering_is_tolerated_with_an_extra_clean_instruction() {
        // A block built from add;sub must still subsume its instructions
        // reordered as sub;add, and inserting a clean (unrelated)
        // instruction must not break it.
        let (kb, mgr) = setup();
        let original = vec![
            insn("add r64, imm32", &[(0, rax()), (1, imm(0x2a))]),
            insn("sub r64, r64", &[(0, rbx()), (1, rax())]),
        ];
        let ab = AbstractBlock::from_concrete(2, &mgr, &kb, &original);

        let reordered = vec![
            insn("sub r64, r64", &[(0, rbx()), (1, rax())]),
            insn("add r64, imm32", &[(0, rax()), (1, imm(0x2a))]),
        ];
        assert!(check_subsumed(&reordered, &ab, &mgr, &kb));

        let with_clean_insn = vec![
            insn("sub r64, r64", &[(0, rbx()), (1, rax())]),
            insn(
                "vaddpd ymm, ymm, ymm",
                &[
                    (0, OperandValue::Register { name: "ymm1".into(), width: 256, alias_class: "ymm1".into() }),
                    (1, OperandValue::Register { name: "ymm3".into(), width: 256, alias_class: "ymm3".into() }),
                    (2, OperandValue::Register { name: "ymm2".into(), width: 256, alias_class: "ymm2".into() }),
                ],
            ),
            insn("add r64, imm32", &[(0, rax()), (1, imm(0x2a))]),
        ];
        assert!(check_subsumed(&with_clean_insn, &ab, &mgr, &kb));
    }

    #[test]
    fn operand_mismatch_is_rejected() {
        let (kb, mgr) = setup();
        let original = vec![
            insn("add r64, imm32", &[(0, rax()), (1, imm(0x2a))]),
            insn("sub r64, r64", &[(0, rbx()), (1, rax())]),
        ];
        let ab = AbstractBlock::from_concrete(2, &mgr, &kb, &original);

        let mismatched = vec![
            insn("add r64, imm32", &[(0, rax()), (1, imm(0x2a))]),
            insn("sub r64, r64", &[(0, rbx()), (1, rcx())]),
        ];
        assert!(!check_subsumed(&mismatched, &ab, &mgr, &kb));
    }

    #[test]
    fn abstract_subsumption_is_reflexive() {
        let (kb, mgr) = setup();
        let block = vec![insn("add r64, imm32", &[(0, rax()), (1, imm(0x2a))])];
        let ab = AbstractBlock::from_concrete(1, &mgr, &kb, &block);
        assert!(abstract_subsumed(&ab, &ab, &mgr));
    }
}
