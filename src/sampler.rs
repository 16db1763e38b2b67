//! Instantiates a concrete block from an abstract block, deterministically
//! subject to a caller-supplied RNG: a scheme-per-slot draw, then an
//! operand-aliasing graph walk that pins fixed/must-alias operands before
//! filling in the rest.

use std::collections::{BTreeMap, BTreeSet};

use rand::seq::SliceRandom;
use rand::Rng;

use crate::abstract_block::{AbstractBlock, AliasKey};
use crate::errors::SamplingError;
use crate::insn_feature_manager::InsnFeatureManager;
use crate::isa::{ConcreteInsn, IsaKnowledgeBase, OperandConstraint, OperandKey, OperandValue, SchemeId};
use crate::iwho_augmentation::IwhoAugmentation;

/// Caches each slot's feasible-scheme set so repeated sampling of the same
/// abstract block does not re-run `InsnFeatureManager::feasible` every time.
pub struct Sampler<'a> {
    mgr: &'a InsnFeatureManager,
    kb: &'a dyn IsaKnowledgeBase,
}

impl<'a> Sampler<'a> {
    pub fn new(mgr: &'a InsnFeatureManager, kb: &'a dyn IsaKnowledgeBase) -> Self {
        Self { mgr, kb }
    }

    /// Draws one concrete block matched by `block`. Slots whose `present`
    /// feature is not pinned to `true` are flipped by the RNG; a slot pinned
    /// to `false` is omitted from the result.
    pub fn sample(
        &self,
        block: &AbstractBlock,
        rng: &mut impl Rng,
    ) -> Result<Vec<ConcreteInsn>, SamplingError> {
        self.sample_excluding(block, rng, &BTreeSet::new())
    }

    /// As [`Sampler::sample`], but schemes in `blacklist` are treated as
    /// infeasible for every slot.
    pub fn sample_excluding(
        &self,
        block: &AbstractBlock,
        rng: &mut impl Rng,
        blacklist: &BTreeSet<SchemeId>,
    ) -> Result<Vec<ConcreteInsn>, SamplingError> {
        let universe: BTreeSet<SchemeId> = self
            .mgr
            .schemes()
            .iter()
            .filter(|s| !blacklist.contains(*s))
            .cloned()
            .collect();

        let mut present = vec![false; block.n];
        let mut feasible_schemes: Vec<Vec<SchemeId>> = vec![Vec::new(); block.n];
        for i in 0..block.n {
            let insn = &block.insns[i];
            let is_present = if insn.present.is_top() {
                rng.gen_bool(0.5)
            } else {
                insn.present
                    .subsumes_feature(&crate::feature::ConcreteFeatureValue::Scalar(
                        "true".to_string(),
                    ))
            };
            present[i] = is_present;
            if !is_present {
                continue;
            }
            let fs = self.mgr.feasible(&insn.features);
            let mut schemes: Vec<SchemeId> = fs
                .materialize(&universe)
                .into_iter()
                .filter(|s| !blacklist.contains(s))
                .collect();
            if schemes.is_empty() {
                return Err(SamplingError::EmptyFeasibleSet(i));
            }
            schemes.sort();
            feasible_schemes[i] = schemes;
        }

        let mut chosen: Vec<Option<SchemeId>> = vec![None; block.n];
        for i in 0..block.n {
            if !present[i] {
                continue;
            }
            let schemes = &feasible_schemes[i];
            let idx = rng.gen_range(0..schemes.len());
            chosen[i] = Some(schemes[idx].clone());
        }

        let mut operands: Vec<BTreeMap<OperandKey, OperandValue>> = vec![BTreeMap::new(); block.n];
        self.resolve_aliasing(block, &chosen, &mut operands, rng)?;

        let mut out = Vec::new();
        for i in 0..block.n {
            if let Some(scheme) = &chosen[i] {
                out.push(ConcreteInsn {
                    scheme: scheme.clone(),
                    operands: operands[i].clone(),
                });
            }
        }
        Ok(out)
    }

    fn resolve_aliasing(
        &self,
        block: &AbstractBlock,
        chosen: &[Option<SchemeId>],
        operands: &mut [BTreeMap<OperandKey, OperandValue>],
        rng: &mut impl Rng,
    ) -> Result<(), SamplingError> {
        let components = block.must_alias_components();

        // group every operand position by its must-alias equivalence class;
        // positions absent from `components` are singleton classes of their own.
        let mut groups: BTreeMap<usize, Vec<AliasKey>> = BTreeMap::new();
        let mut next_singleton = components.len();
        for (i, scheme_id) in chosen.iter().enumerate() {
            let Some(scheme_id) = scheme_id else { continue };
            let scheme = self
                .kb
                .scheme(scheme_id)
                .unwrap_or_else(|| panic!("unknown scheme {scheme_id}"));
            for key in &scheme.operand_keys {
                let v = scheme.constraint(*key);
                if IwhoAugmentation::skip_for_aliasing(&placeholder_for(v)) {
                    continue;
                }
                let ak = AliasKey(i, *key);
                let root = match components.get(&ak) {
                    Some(&r) => r,
                    None => {
                        let id = next_singleton;
                        next_singleton += 1;
                        id
                    }
                };
                groups.entry(root).or_default().push(ak);
            }
        }

        // deterministic order: lowest AliasKey per group first.
        let mut group_order: Vec<(usize, Vec<AliasKey>)> = groups.into_iter().collect();
        group_order.sort_by_key(|(_, members)| *members.iter().min().unwrap());

        for (_, members) in &group_order {
            self.resolve_group(block, chosen, members, operands, rng)?;
        }

        Ok(())
    }

    fn resolve_group(
        &self,
        block: &AbstractBlock,
        chosen: &[Option<SchemeId>],
        members: &[AliasKey],
        operands: &mut [BTreeMap<OperandKey, OperandValue>],
        rng: &mut impl Rng,
    ) -> Result<(), SamplingError> {
        let constraint_for = |ak: &AliasKey| -> &OperandConstraint {
            let scheme_id = chosen[ak.0].as_ref().expect("present slot has a scheme");
            self.kb
                .scheme(scheme_id)
                .expect("scheme resolved above")
                .constraint(ak.1)
        };

        // a fixed operand in the group pins the whole class.
        let fixed = members.iter().find_map(|ak| match constraint_for(ak) {
            OperandConstraint::Fixed(v) => Some(v.clone()),
            _ => None,
        });

        let mut value = if let Some(v) = fixed {
            v
        } else {
            let first_constraint = constraint_for(&members[0]);
            let mut options = IwhoAugmentation::allowed_operands(first_constraint);
            if options.is_empty() {
                return Err(SamplingError::EmptyFeasibleSet(members[0].0));
            }
            self.exclude_must_not_alias(block, members, operands, &mut options);
            if options.is_empty() {
                return Err(SamplingError::AliasConflict((
                    members[0].0,
                    format!("{:?}", members[0].1),
                )));
            }
            options
                .choose(rng)
                .cloned()
                .expect("non-empty after exclusion check")
        };

        for ak in members {
            let required_width = match constraint_for(ak) {
                OperandConstraint::RegisterClass { width, .. } => Some(*width),
                OperandConstraint::Memory { width } => Some(*width),
                OperandConstraint::Immediate { width } => Some(*width),
                OperandConstraint::Fixed(_) | OperandConstraint::Symbol => None,
            };
            if let Some(width) = required_width {
                value = adjust_width(&value, width).ok_or(SamplingError::WidthMismatch(ak.0))?;
            }
            operands[ak.0].insert(ak.1, value.clone());
        }

        Ok(())
    }

    /// Drops any candidate that would must-alias an operand already placed
    /// at a must-not-alias neighbor of any member of this group. Neighbors
    /// not yet resolved (later in the deterministic group order) cannot
    /// conflict: their own resolution excludes *this* group's value in turn,
    /// since `exclude_must_not_alias` is symmetric over already-placed
    /// operands.
    fn exclude_must_not_alias(
        &self,
        block: &AbstractBlock,
        members: &[AliasKey],
        operands: &[BTreeMap<OperandKey, OperandValue>],
        options: &mut Vec<OperandValue>,
    ) {
        let mut placed_neighbors: Vec<OperandValue> = Vec::new();
        for member in members {
            for (a, b) in &block.must_not_alias {
                let neighbor = if a == member {
                    Some(*b)
                } else if b == member {
                    Some(*a)
                } else {
                    None
                };
                let Some(neighbor) = neighbor else { continue };
                if let Some(v) = operands[neighbor.0].get(&neighbor.1) {
                    placed_neighbors.push(v.clone());
                }
            }
        }
        if placed_neighbors.is_empty() {
            return;
        }
        options.retain(|candidate| {
            !placed_neighbors
                .iter()
                .any(|n| IwhoAugmentation::must_alias(self.kb, candidate, n))
        });
    }
}

fn adjust_width(v: &OperandValue, width: u32) -> Option<OperandValue> {
    match v {
        OperandValue::Register { name, alias_class, .. } => Some(OperandValue::Register {
            name: name.clone(),
            width,
            alias_class: alias_class.clone(),
        }),
        OperandValue::Memory { base, displacement, .. } => Some(OperandValue::Memory {
            base: base.clone(),
            displacement: *displacement,
            width,
        }),
        OperandValue::Immediate { value, .. } => Some(OperandValue::Immediate { value: *value, width }),
        OperandValue::Symbol => Some(OperandValue::Symbol),
    }
}

/// Used only to route a constraint to `IwhoAugmentation::skip_for_aliasing`,
/// which only inspects the operand *kind*, not its concrete fields.
fn placeholder_for(c: &OperandConstraint) -> OperandValue {
    match c {
        OperandConstraint::Fixed(v) => v.clone(),
        OperandConstraint::RegisterClass { width, .. } => OperandValue::Register {
            name: String::new(),
            width: *width,
            alias_class: String::new(),
        },
        OperandConstraint::Memory { width } => OperandValue::Memory {
            base: String::new(),
            displacement: 0,
            width: *width,
        },
        OperandConstraint::Immediate { width } => OperandValue::Immediate { value: 0, width: *width },
        OperandConstraint::Symbol => OperandValue::Symbol,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::SampleIsaKb;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn sampling_a_top_block_is_deterministic_under_a_fixed_seed() {
        let kb = SampleIsaKb::new();
        let mgr = InsnFeatureManager::build(&kb, InsnFeatureManager::default_features());
        let top = AbstractBlock::make_top(2, mgr.features());
        let sampler = Sampler::new(&mgr, &kb);

        let mut rng1 = ChaCha8Rng::seed_from_u64(7);
        let mut rng2 = ChaCha8Rng::seed_from_u64(7);
        let a = sampler.sample(&top, &mut rng1);
        let b = sampler.sample(&top, &mut rng2);
        assert_eq!(a.is_ok(), b.is_ok());
        if let (Ok(a), Ok(b)) = (a, b) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn sampling_an_exact_scheme_pin_always_produces_that_scheme() {
        let kb = SampleIsaKb::new();
        let mgr = InsnFeatureManager::build(&kb, InsnFeatureManager::default_features());
        let scheme = "add r64, r64".to_string();
        let singleton = mgr.singleton_record_for(&scheme);
        let mut block = AbstractBlock::make_top(1, mgr.features());
        block.insns[0].features = singleton;
        block.insns[0].present =
            crate::feature::AbstractFeature::bottom(crate::feature::FeatureKind::Singleton);
        block.insns[0]
            .present
            .join(&crate::feature::ConcreteFeatureValue::Scalar("true".to_string()));

        let sampler = Sampler::new(&mgr, &kb);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let sampled = sampler.sample(&block, &mut rng).expect("scheme is feasible");
        assert_eq!(sampled.len(), 1);
        assert_eq!(sampled[0].scheme, scheme);
    }

    #[test]
    fn empty_feasible_set_is_reported_as_an_error() {
        let kb = SampleIsaKb::new();
        let mgr = InsnFeatureManager::build(&kb, InsnFeatureManager::default_features());
        let mut block = AbstractBlock::make_top(1, mgr.features());
        // force an infeasible singleton: no scheme in the sample universe is named this.
        let mut record = block.insns[0].features.clone();
        let exact = record.get_mut("exact_scheme").unwrap();
        exact.join(&crate::feature::ConcreteFeatureValue::Scalar(
            "does not exist".to_string(),
        ));
        block.insns[0].features = record;
        block.insns[0].present =
            crate::feature::AbstractFeature::bottom(crate::feature::FeatureKind::Singleton);
        block.insns[0]
            .present
            .join(&crate::feature::ConcreteFeatureValue::Scalar("true".to_string()));

        let sampler = Sampler::new(&mgr, &kb);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let err = sampler.sample(&block, &mut rng).unwrap_err();
        assert_eq!(err, SamplingError::EmptyFeasibleSet(0));
    }
}
