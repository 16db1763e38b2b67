//! Policy layer over the ISA-KB: which concrete operands the sampler is
//! allowed to synthesize, which operand positions participate in the
//! aliasing map at all, and how memory operands (which the core itself
//! synthesizes) alias each other.

use crate::isa::{IsaKnowledgeBase, OperandConstraint, OperandValue};

/// Base registers the sampler draws synthesized memory operands from.
pub const MEM_BASE_REGISTERS: &[&str] = &["rbp", "rsi", "rdi"];
/// Displacement choices paired with a base register to form `[base + d]`.
pub const MEM_DISPLACEMENTS: &[i64] = &[0x40, 0x80];
/// Never chosen as an operand: reserved by the (hypothetical) measurement
/// harness, plus the memory base pool above.
pub const RESERVED_REGISTERS: &[&str] = &["rsp", "r15", "r14"];

/// A handful of deterministic immediate values used when synthesizing
/// operands for an `Immediate` constraint.
const IMMEDIATE_CHOICES: &[i64] = &[0x0, 0x1, 0x2a];

pub struct IwhoAugmentation;

impl IwhoAugmentation {
    /// Concrete operands allowed for a given operand constraint, with the
    /// reserved-register pool excluded from register classes.
    pub fn allowed_operands(constraint: &OperandConstraint) -> Vec<OperandValue> {
        match constraint {
            OperandConstraint::Fixed(v) => vec![v.clone()],
            OperandConstraint::RegisterClass { choices, .. } => choices
                .iter()
                .filter(|v| !Self::is_reserved(v))
                .cloned()
                .collect(),
            OperandConstraint::Memory { width } => Self::synthesize_memory_operands(*width),
            OperandConstraint::Immediate { width } => IMMEDIATE_CHOICES
                .iter()
                .map(|v| OperandValue::Immediate {
                    value: *v,
                    width: *width,
                })
                .collect(),
            OperandConstraint::Symbol => vec![OperandValue::Symbol],
        }
    }

    pub fn synthesize_memory_operands(width: u32) -> Vec<OperandValue> {
        let mut out = Vec::with_capacity(MEM_BASE_REGISTERS.len() * MEM_DISPLACEMENTS.len());
        for base in MEM_BASE_REGISTERS {
            for displacement in MEM_DISPLACEMENTS {
                out.push(OperandValue::Memory {
                    base: base.to_string(),
                    displacement: *displacement,
                    width,
                });
            }
        }
        out
    }

    fn is_reserved(v: &OperandValue) -> bool {
        matches!(v, OperandValue::Register { name, .. } if RESERVED_REGISTERS.contains(&name.as_str()))
    }

    /// Operand kinds excluded from the aliasing map entirely: flag
    /// registers, immediates, and symbols can never alias anything.
    pub fn skip_for_aliasing(v: &OperandValue) -> bool {
        matches!(v, OperandValue::Immediate { .. } | OperandValue::Symbol)
            || v.is_flag_register()
    }

    /// Must-alias judgement. Memory operands synthesized by this module are
    /// special-cased: the core knows they alias iff base and displacement
    /// match, rather than asking the ISA-KB (which cannot know how `rbp`
    /// was parameterized here).
    pub fn must_alias(kb: &dyn IsaKnowledgeBase, a: &OperandValue, b: &OperandValue) -> bool {
        match (a, b) {
            (OperandValue::Memory { .. }, OperandValue::Memory { .. }) => Self::memory_same(a, b),
            _ => kb.must_alias(a, b),
        }
    }

    pub fn may_alias(kb: &dyn IsaKnowledgeBase, a: &OperandValue, b: &OperandValue) -> bool {
        match (a, b) {
            (OperandValue::Memory { .. }, OperandValue::Memory { .. }) => Self::memory_same(a, b),
            _ => kb.may_alias(a, b),
        }
    }

    fn memory_same(a: &OperandValue, b: &OperandValue) -> bool {
        matches!(
            (a, b),
            (
                OperandValue::Memory { base: ba, displacement: da, .. },
                OperandValue::Memory { base: bb, displacement: db, .. },
            ) if ba == bb && da == db
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::SampleIsaKb;

    #[test]
    fn reserved_registers_are_excluded_from_register_class_operands() {
        let constraint = OperandConstraint::RegisterClass {
            width: 64,
            choices: vec![
                OperandValue::Register {
                    name: "rax".into(),
                    width: 64,
                    alias_class: "rax".into(),
                },
                OperandValue::Register {
                    name: "r15".into(),
                    width: 64,
                    alias_class: "r15".into(),
                },
            ],
        };
        let allowed = IwhoAugmentation::allowed_operands(&constraint);
        assert_eq!(allowed.len(), 1);
    }

    #[test]
    fn synthesized_memory_operands_alias_by_base_and_displacement_only() {
        let kb = SampleIsaKb::new();
        let a = OperandValue::Memory {
            base: "rbp".into(),
            displacement: 0x40,
            width: 64,
        };
        let b = OperandValue::Memory {
            base: "rbp".into(),
            displacement: 0x40,
            width: 32,
        };
        let c = OperandValue::Memory {
            base: "rbp".into(),
            displacement: 0x80,
            width: 64,
        };
        assert!(IwhoAugmentation::must_alias(&kb, &a, &b));
        assert!(!IwhoAugmentation::must_alias(&kb, &a, &c));
    }

    #[test]
    fn immediates_and_symbols_are_skipped_for_aliasing() {
        assert!(IwhoAugmentation::skip_for_aliasing(&OperandValue::Immediate {
            value: 1,
            width: 32
        }));
        assert!(IwhoAugmentation::skip_for_aliasing(&OperandValue::Symbol));
        assert!(!IwhoAugmentation::skip_for_aliasing(&OperandValue::Register {
            name: "rax".into(),
            width: 64,
            alias_class: "rax".into(),
        }));
    }
}
