//! The ISA knowledge base boundary.
//!
//! AnICA-core is ISA-agnostic: everything it needs to know about concrete
//! instruction schemes, their operands, and their aliasing semantics is
//! reached through the [`IsaKnowledgeBase`] trait. In production this would
//! be backed by a real x86 instruction database; here it is backed by
//! [`SampleIsaKb`], a small hand-built universe that is enough to run the
//! discovery loop end to end without any external ISA database.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::feature::ConcreteFeatureValue;

/// Opaque identifier for an instruction scheme, e.g. `"add r64, r64"`.
pub type SchemeId = String;

/// Position of an operand within a scheme's explicit-then-implicit operand
/// list. Aliasing entries are keyed by `(insn_index, OperandKey)` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperandKey(pub u8);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperandValue {
    Register {
        name: String,
        width: u32,
        alias_class: String,
    },
    Immediate {
        value: i64,
        width: u32,
    },
    Memory {
        base: String,
        displacement: i64,
        width: u32,
    },
    Symbol,
}

impl OperandValue {
    pub fn width(&self) -> u32 {
        match self {
            OperandValue::Register { width, .. } => *width,
            OperandValue::Immediate { width, .. } => *width,
            OperandValue::Memory { width, .. } => *width,
            OperandValue::Symbol => 0,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, OperandValue::Memory { .. })
    }

    pub fn is_flag_register(&self) -> bool {
        matches!(self, OperandValue::Register { alias_class, .. } if alias_class == "flags")
    }
}

/// What concrete operands an operand position may be instantiated with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperandConstraint {
    Fixed(OperandValue),
    RegisterClass { width: u32, choices: Vec<OperandValue> },
    Memory { width: u32 },
    Immediate { width: u32 },
    Symbol,
}

impl OperandConstraint {
    pub fn is_fixed(&self) -> bool {
        matches!(self, OperandConstraint::Fixed(_))
    }
}

/// An instruction template: a mnemonic plus a fixed, ordered list of operand
/// positions with their constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsnScheme {
    pub id: SchemeId,
    pub mnemonic: String,
    pub operand_keys: Vec<OperandKey>,
    pub operand_constraints: BTreeMap<OperandKey, OperandConstraint>,
}

impl InsnScheme {
    pub fn constraint(&self, key: OperandKey) -> &OperandConstraint {
        self.operand_constraints
            .get(&key)
            .expect("operand key not registered for this scheme")
    }
}

/// A concrete instance of an [`InsnScheme`] with chosen operands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcreteInsn {
    pub scheme: SchemeId,
    pub operands: BTreeMap<OperandKey, OperandValue>,
}

impl ConcreteInsn {
    pub fn get_operand(&self, key: OperandKey) -> Option<&OperandValue> {
        self.operands.get(&key)
    }
}

/// An ordered sequence of concrete instructions.
pub type ConcreteBlock = Vec<ConcreteInsn>;

/// Mapping from configured feature name to its concrete value for one
/// instruction scheme. `None` means "this feature is not applicable /
/// unknown for this scheme", which feature joins treat as no observation.
pub type FeatureRecord = BTreeMap<String, ConcreteFeatureValue>;

/// The interface the discovery core consumes from an external ISA
/// knowledge base. Read-only after construction; freely shareable across
/// predictor-pool workers.
pub trait IsaKnowledgeBase: Send + Sync {
    fn schemes(&self) -> &[SchemeId];
    fn scheme(&self, id: &SchemeId) -> Option<&InsnScheme>;
    fn feature_record(&self, id: &SchemeId) -> FeatureRecord;

    /// Generic ISA-level aliasing oracle. [`crate::iwho_augmentation::IwhoAugmentation`]
    /// overrides this for memory operands it synthesized itself.
    fn must_alias(&self, a: &OperandValue, b: &OperandValue) -> bool;
    fn may_alias(&self, a: &OperandValue, b: &OperandValue) -> bool;

    fn assembly(&self, block: &[ConcreteInsn]) -> String;
    fn encode_hex(&self, block: &[ConcreteInsn]) -> String;

    /// Resolve a scheme string (as embedded in a `"$InsnScheme:<s>"` JSON
    /// reference, or typed by a user on the `generalize` CLI) back to a
    /// [`SchemeId`].
    fn lookup_by_string(&self, s: &str) -> Option<SchemeId>;
}

fn reg(name: &str, width: u32, alias_class: &str) -> OperandValue {
    OperandValue::Register {
        name: name.to_string(),
        width,
        alias_class: alias_class.to_string(),
    }
}

/// A small, self-contained x86-flavored instruction universe used by tests,
/// `make-configs`, and `check-predictors` when no real ISA-KB is wired in.
pub struct SampleIsaKb {
    schemes: Vec<SchemeId>,
    by_id: BTreeMap<SchemeId, InsnScheme>,
}

impl Default for SampleIsaKb {
    fn default() -> Self {
        Self::new()
    }
}

const GP_REGS: &[&str] = &["rax", "rbx", "rcx", "rdx", "rbp", "rsi", "rdi"];
const YMM_REGS: &[&str] = &["ymm0", "ymm1", "ymm2", "ymm3"];

impl SampleIsaKb {
    pub fn new() -> Self {
        let mut by_id = BTreeMap::new();

        let gp_choices: Vec<OperandValue> =
            GP_REGS.iter().map(|r| reg(r, 64, r)).collect();
        let ymm_choices: Vec<OperandValue> =
            YMM_REGS.iter().map(|r| reg(r, 256, r)).collect();

        let two_reg = |mnemonic: &str| -> InsnScheme {
            let id = format!("{mnemonic} r64, r64");
            let mut constraints = BTreeMap::new();
            constraints.insert(
                OperandKey(0),
                OperandConstraint::RegisterClass {
                    width: 64,
                    choices: gp_choices.clone(),
                },
            );
            constraints.insert(
                OperandKey(1),
                OperandConstraint::RegisterClass {
                    width: 64,
                    choices: gp_choices.clone(),
                },
            );
            InsnScheme {
                id: id.clone(),
                mnemonic: mnemonic.to_string(),
                operand_keys: vec![OperandKey(0), OperandKey(1)],
                operand_constraints: constraints,
            }
        };

        let reg_imm = |mnemonic: &str| -> InsnScheme {
            let id = format!("{mnemonic} r64, imm32");
            let mut constraints = BTreeMap::new();
            constraints.insert(
                OperandKey(0),
                OperandConstraint::RegisterClass {
                    width: 64,
                    choices: gp_choices.clone(),
                },
            );
            constraints.insert(OperandKey(1), OperandConstraint::Immediate { width: 32 });
            InsnScheme {
                id: id.clone(),
                mnemonic: mnemonic.to_string(),
                operand_keys: vec![OperandKey(0), OperandKey(1)],
                operand_constraints: constraints,
            }
        };

        for mnemonic in ["add", "sub", "mov", "cmp", "xor", "and", "or"] {
            let s = two_reg(mnemonic);
            by_id.insert(s.id.clone(), s);
            let s = reg_imm(mnemonic);
            by_id.insert(s.id.clone(), s);
        }

        // mov r64, [mem]
        {
            let id = "mov r64, m64".to_string();
            let mut constraints = BTreeMap::new();
            constraints.insert(
                OperandKey(0),
                OperandConstraint::RegisterClass {
                    width: 64,
                    choices: gp_choices.clone(),
                },
            );
            constraints.insert(OperandKey(1), OperandConstraint::Memory { width: 64 });
            by_id.insert(
                id.clone(),
                InsnScheme {
                    id,
                    mnemonic: "mov".to_string(),
                    operand_keys: vec![OperandKey(0), OperandKey(1)],
                    operand_constraints: constraints,
                },
            );
        }
        // mov [mem], r64
        {
            let id = "mov m64, r64".to_string();
            let mut constraints = BTreeMap::new();
            constraints.insert(OperandKey(0), OperandConstraint::Memory { width: 64 });
            constraints.insert(
                OperandKey(1),
                OperandConstraint::RegisterClass {
                    width: 64,
                    choices: gp_choices.clone(),
                },
            );
            by_id.insert(
                id.clone(),
                InsnScheme {
                    id,
                    mnemonic: "mov".to_string(),
                    operand_keys: vec![OperandKey(0), OperandKey(1)],
                    operand_constraints: constraints,
                },
            );
        }
        // nop
        {
            let id = "nop".to_string();
            by_id.insert(
                id.clone(),
                InsnScheme {
                    id,
                    mnemonic: "nop".to_string(),
                    operand_keys: vec![],
                    operand_constraints: BTreeMap::new(),
                },
            );
        }
        // vaddpd ymm, ymm, ymm
        {
            let id = "vaddpd ymm, ymm, ymm".to_string();
            let mut constraints = BTreeMap::new();
            for k in 0..3u8 {
                constraints.insert(
                    OperandKey(k),
                    OperandConstraint::RegisterClass {
                        width: 256,
                        choices: ymm_choices.clone(),
                    },
                );
            }
            by_id.insert(
                id.clone(),
                InsnScheme {
                    id,
                    mnemonic: "vaddpd".to_string(),
                    operand_keys: vec![OperandKey(0), OperandKey(1), OperandKey(2)],
                    operand_constraints: constraints,
                },
            );
        }

        let schemes: Vec<SchemeId> = by_id.keys().cloned().collect();
        Self { schemes, by_id }
    }

    fn uops_on_skl(mnemonic: &str) -> u32 {
        match mnemonic {
            "nop" => 0,
            "mov" => 1,
            "add" | "sub" | "cmp" | "xor" | "and" | "or" => 1,
            "vaddpd" => 2,
            _ => 1,
        }
    }

    fn category(mnemonic: &str) -> &'static str {
        match mnemonic {
            "add" | "sub" | "xor" | "and" | "or" => "BINARY",
            "cmp" => "COMPARE",
            "mov" => "DATAXFER",
            "vaddpd" => "AVX",
            "nop" => "NOP",
            _ => "UNKNOWN",
        }
    }
}

impl IsaKnowledgeBase for SampleIsaKb {
    fn schemes(&self) -> &[SchemeId] {
        &self.schemes
    }

    fn scheme(&self, id: &SchemeId) -> Option<&InsnScheme> {
        self.by_id.get(id)
    }

    fn feature_record(&self, id: &SchemeId) -> FeatureRecord {
        let scheme = self
            .by_id
            .get(id)
            .unwrap_or_else(|| panic!("unknown scheme {id}"));

        let mut rec = FeatureRecord::new();
        rec.insert(
            "exact_scheme".to_string(),
            ConcreteFeatureValue::Scalar(scheme.id.clone()),
        );
        rec.insert(
            "mnemonic".to_string(),
            ConcreteFeatureValue::Scalar(scheme.mnemonic.clone()),
        );

        let opschemes: std::collections::BTreeSet<String> = scheme
            .operand_keys
            .iter()
            .map(|k| format!("{:?}", scheme.constraint(*k)))
            .collect();
        rec.insert("opschemes".to_string(), ConcreteFeatureValue::Set(opschemes));

        let memory_usage: std::collections::BTreeSet<String> = scheme
            .operand_keys
            .iter()
            .filter_map(|k| match scheme.constraint(*k) {
                OperandConstraint::Memory { .. } => Some("RW".to_string()),
                OperandConstraint::Fixed(OperandValue::Memory { .. }) => Some("RW".to_string()),
                _ => None,
            })
            .collect();
        rec.insert(
            "memory_usage".to_string(),
            ConcreteFeatureValue::Set(memory_usage),
        );

        rec.insert(
            "uops_on_SKL".to_string(),
            ConcreteFeatureValue::Count(Self::uops_on_skl(&scheme.mnemonic)),
        );
        rec.insert(
            "category".to_string(),
            ConcreteFeatureValue::Scalar(Self::category(&scheme.mnemonic).to_string()),
        );
        rec.insert(
            "extension".to_string(),
            ConcreteFeatureValue::Scalar(if scheme.mnemonic == "vaddpd" {
                "AVX".to_string()
            } else {
                "BASE".to_string()
            }),
        );
        rec.insert(
            "isa-set".to_string(),
            ConcreteFeatureValue::Scalar(if scheme.mnemonic == "vaddpd" {
                "AVX".to_string()
            } else {
                "I86".to_string()
            }),
        );
        rec.insert(
            "has_lock".to_string(),
            ConcreteFeatureValue::Scalar("false".to_string()),
        );
        rec.insert(
            "has_rep".to_string(),
            ConcreteFeatureValue::Scalar("false".to_string()),
        );
        rec
    }

    fn must_alias(&self, a: &OperandValue, b: &OperandValue) -> bool {
        match (a, b) {
            (
                OperandValue::Register { alias_class: c1, .. },
                OperandValue::Register { alias_class: c2, .. },
            ) => c1 == c2,
            _ => a == b,
        }
    }

    fn may_alias(&self, a: &OperandValue, b: &OperandValue) -> bool {
        match (a, b) {
            (
                OperandValue::Register { alias_class: c1, .. },
                OperandValue::Register { alias_class: c2, .. },
            ) => c1 == c2,
            (OperandValue::Memory { .. }, OperandValue::Memory { .. }) => true,
            (OperandValue::Immediate { .. }, _) | (_, OperandValue::Immediate { .. }) => false,
            _ => a == b,
        }
    }

    fn assembly(&self, block: &[ConcreteInsn]) -> String {
        block
            .iter()
            .map(|insn| {
                let scheme = self.scheme(&insn.scheme).expect("unknown scheme");
                let ops: Vec<String> = scheme
                    .operand_keys
                    .iter()
                    .map(|k| format_operand(insn.operands.get(k)))
                    .collect();
                if ops.is_empty() {
                    scheme.mnemonic.clone()
                } else {
                    format!("{} {}", scheme.mnemonic, ops.join(", "))
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn encode_hex(&self, block: &[ConcreteInsn]) -> String {
        // A stand-in "encoding": every sample universe here is tiny enough
        // that hashing the assembly text is a stable, unique enough payload
        // for the measurement-database schema's `input_hex` column.
        let asm = self.assembly(block);
        hex::encode(asm.as_bytes())
    }

    fn lookup_by_string(&self, s: &str) -> Option<SchemeId> {
        if self.by_id.contains_key(s) {
            Some(s.to_string())
        } else {
            None
        }
    }
}

fn format_operand(v: Option<&OperandValue>) -> String {
    match v {
        None => "?".to_string(),
        Some(OperandValue::Register { name, .. }) => name.clone(),
        Some(OperandValue::Immediate { value, .. }) => format!("{value:#x}"),
        Some(OperandValue::Memory {
            base, displacement, ..
        }) => format!("[{base} + {displacement:#x}]"),
        Some(OperandValue::Symbol) => "<sym>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_kb_has_add_and_sub_schemes() {
        let kb = SampleIsaKb::new();
        assert!(kb.lookup_by_string("add r64, r64").is_some());
        assert!(kb.lookup_by_string("sub r64, imm32").is_some());
        assert!(kb.lookup_by_string("does not exist").is_none());
    }

    #[test]
    fn register_alias_class_drives_must_alias() {
        let kb = SampleIsaKb::new();
        let rax = reg("rax", 64, "rax");
        let rax2 = reg("rax", 64, "rax");
        let rbx = reg("rbx", 64, "rbx");
        assert!(kb.must_alias(&rax, &rax2));
        assert!(!kb.must_alias(&rax, &rbx));
        assert!(!kb.may_alias(&rax, &rbx));
    }
}
