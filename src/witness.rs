//! Ordered log of generalization steps, usable for replay and validation.

use serde::{Deserialize, Serialize};

use crate::abstract_block::{AbstractBlock, ExpansionToken};
use crate::errors::AssertionFailure;

/// Opaque reference to where the measurements backing a witness record live
/// (e.g. a measurement-database series id). The core only needs it to
/// survive a round trip, so it is kept as an arbitrary JSON value rather
/// than a typed field.
pub type MeasurementRef = Option<serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WitnessRecord {
    pub expansion: Option<ExpansionToken>,
    pub taken: bool,
    pub terminate: bool,
    pub comment: Option<String>,
    pub measurements: MeasurementRef,
}

impl WitnessRecord {
    pub fn taken(expansion: ExpansionToken, measurements: MeasurementRef) -> Self {
        Self { expansion: Some(expansion), taken: true, terminate: false, comment: None, measurements }
    }

    pub fn non_taken(expansion: ExpansionToken, measurements: MeasurementRef) -> Self {
        Self { expansion: Some(expansion), taken: false, terminate: false, comment: None, measurements }
    }

    pub fn termination(comment: impl Into<String>, measurements: MeasurementRef) -> Self {
        Self { expansion: None, taken: false, terminate: true, comment: Some(comment.into()), measurements }
    }
}

/// The starting abstract block plus the ordered record of expansions tried
/// during a single `generalize` run. Invariant: replaying every `taken`
/// record's expansion from `start`, in order, reproduces the final block a
/// generalization run returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WitnessTrace {
    pub start: AbstractBlock,
    pub trace: Vec<WitnessRecord>,
}

impl WitnessTrace {
    pub fn new(start: AbstractBlock) -> Self {
        Self { start, trace: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.trace.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trace.is_empty()
    }

    pub fn add_taken(&mut self, expansion: ExpansionToken, measurements: MeasurementRef) {
        self.trace.push(WitnessRecord::taken(expansion, measurements));
    }

    pub fn add_non_taken(&mut self, expansion: ExpansionToken, measurements: MeasurementRef) {
        self.trace.push(WitnessRecord::non_taken(expansion, measurements));
    }

    pub fn add_termination(&mut self, comment: impl Into<String>, measurements: MeasurementRef) {
        self.trace.push(WitnessRecord::termination(comment, measurements));
    }

    /// Replays every `taken` expansion from `start` up to (but not
    /// including) `index` records, or the whole trace if `index` is `None`.
    /// With `validate`, asserts after each applied expansion that the result
    /// still subsumes its own pre-state (expansion monotonicity) — an
    /// `AssertionFailure` here means the trace was corrupted or hand-edited
    /// inconsistently with the lattice.
    pub fn replay(&self, index: Option<usize>, validate: bool) -> Result<AbstractBlock, AssertionFailure> {
        let upto = index.unwrap_or(self.trace.len()).min(self.trace.len());
        let mut res = self.start.clone();
        for witness in &self.trace[..upto] {
            if witness.terminate {
                break;
            }
            if !witness.taken {
                continue;
            }
            let expansion = witness
                .expansion
                .as_ref()
                .expect("a taken witness record always carries its expansion token");
            let pre = if validate { Some(res.clone()) } else { None };
            res.apply_expansion(expansion);
            if let Some(pre) = pre {
                if !res.subsumes(&pre) {
                    return Err(AssertionFailure(format!(
                        "replaying expansion {expansion:?} did not preserve subsumption of the pre-expansion block"
                    )));
                }
            }
        }
        Ok(res)
    }

    /// The final block the trace reached: a full replay with no validation.
    pub fn final_block(&self) -> AbstractBlock {
        self.replay(None, false).expect("replay without validation never fails")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstract_block::ExpansionToken;
    use crate::insn_feature_manager::InsnFeatureManager;
    use crate::isa::SampleIsaKb;

    #[test]
    fn replay_of_taken_expansions_reproduces_final_block() {
        let kb = SampleIsaKb::new();
        let mgr = InsnFeatureManager::build(&kb, InsnFeatureManager::default_features());
        let start = AbstractBlock::make_top(0, mgr.features());
        // A trivial trace (no insns to expand) still round-trips: start == final.
        let trace = WitnessTrace::new(start.clone());
        let replayed = trace.replay(None, true).unwrap();
        assert_eq!(replayed.n, start.n);
    }

    #[test]
    fn taken_expansions_are_applied_and_non_taken_are_skipped() {
        let kb = SampleIsaKb::new();
        let mgr = InsnFeatureManager::build(&kb, InsnFeatureManager::default_features());
        let block = vec![crate::isa::ConcreteInsn {
            scheme: "add r64, imm32".to_string(),
            operands: {
                let mut m = std::collections::BTreeMap::new();
                m.insert(
                    crate::isa::OperandKey(0),
                    crate::isa::OperandValue::Register {
                        name: "rax".into(),
                        width: 64,
                        alias_class: "rax".into(),
                    },
                );
                m.insert(
                    crate::isa::OperandKey(1),
                    crate::isa::OperandValue::Immediate { value: 0x2a, width: 32 },
                );
                m
            },
        }];
        let start = AbstractBlock::from_concrete(1, &mgr, &kb, &block);
        let mut trace = WitnessTrace::new(start.clone());

        let options = start.possible_expansions(&mgr);
        let token = crate::abstract_block::choose_max_benefit(&options).unwrap();
        trace.add_taken(token.clone(), None);
        trace.add_non_taken(ExpansionToken::Insn(0, "does_not_exist".to_string()), None);
        trace.add_termination("no more expansions", None);

        let mut expected = start.clone();
        expected.apply_expansion(&token);

        let final_block = trace.final_block();
        assert!(final_block.subsumes(&expected));
        assert!(expected.subsumes(&final_block));
    }
}
