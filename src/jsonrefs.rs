//! The `$Tag:value` reference convention used when a generic JSON payload
//! (a witness measurement reference, a discovery remark) embeds a name that
//! must resolve against the live ISA-KB when reloaded in a later process.
//!
//! AnICA-core's own serialized types (`AbstractBlock`, `ExpansionToken`, ...)
//! already store scheme references as plain `String`/`OperandKey` fields, so
//! they round-trip through `serde` without ambiguity and need no tagging.
//! This module exists for the one place that convention still matters: an
//! opaque `serde_json::Value` blob that embeds scheme names without a typed
//! field to guide deserialization.

use serde_json::Value;

use crate::errors::IsaLookupError;
use crate::isa::{IsaKnowledgeBase, OperandKey};

const INSN_SCHEME_TAG: &str = "$InsnScheme:";
const OPERAND_KIND_TAG: &str = "$OperandKind:";
const SV_TAG: &str = "$SV:";

/// Replaces every string leaf naming a scheme known to `kb` with its tagged
/// form, recursively.
pub fn introduce_json_references(value: &Value, kb: &dyn IsaKnowledgeBase) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(|v| introduce_json_references(v, kb)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), introduce_json_references(v, kb)))
                .collect(),
        ),
        Value::String(s) if kb.scheme(s).is_some() => Value::String(format!("{INSN_SCHEME_TAG}{s}")),
        other => other.clone(),
    }
}

/// Inverse of [`introduce_json_references`]: replaces tagged strings by
/// their resolved form. `$InsnScheme:` tags are validated against `kb` and
/// returned as plain scheme-name strings (fatal if the scheme is unknown);
/// `$OperandKind:`/`$SV:` tags are left as their bare payload since
/// AnICA-core represents operand kinds and special feature values as plain
/// data rather than an enum needing live-context resolution.
pub fn resolve_json_references(value: &Value, kb: &dyn IsaKnowledgeBase) -> Result<Value, IsaLookupError> {
    match value {
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|v| resolve_json_references(v, kb))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_json_references(v, kb)?);
            }
            Ok(Value::Object(out))
        }
        Value::String(s) => {
            if let Some(scheme) = s.strip_prefix(INSN_SCHEME_TAG) {
                if kb.scheme(scheme).is_none() {
                    return Err(IsaLookupError(scheme.to_string()));
                }
                return Ok(Value::String(scheme.to_string()));
            }
            if let Some(rest) = s.strip_prefix(OPERAND_KIND_TAG) {
                return Ok(Value::String(rest.to_string()));
            }
            if let Some(rest) = s.strip_prefix(SV_TAG) {
                return Ok(Value::String(rest.to_string()));
            }
            Ok(Value::String(s.clone()))
        }
        other => Ok(other.clone()),
    }
}

/// Tags a single operand key, for call sites that build a reference payload
/// field by field rather than walking a whole `Value` tree.
pub fn tag_operand_key(key: OperandKey) -> String {
    format!("{OPERAND_KIND_TAG}{}", key.0)
}

pub fn untag_operand_key(tagged: &str) -> Option<OperandKey> {
    tagged.strip_prefix(OPERAND_KIND_TAG).and_then(|v| v.parse::<u8>().ok()).map(OperandKey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::SampleIsaKb;
    use serde_json::json;

    #[test]
    fn known_scheme_names_are_tagged_and_untagged_round_trip() {
        let kb = SampleIsaKb::new();
        let payload = json!({ "remark": "used scheme", "scheme": "add r64, r64" });
        let tagged = introduce_json_references(&payload, &kb);
        assert_eq!(tagged["scheme"], json!("$InsnScheme:add r64, r64"));
        assert_eq!(tagged["remark"], json!("used scheme"));

        let resolved = resolve_json_references(&tagged, &kb).unwrap();
        assert_eq!(resolved, payload);
    }

    #[test]
    fn resolving_an_unknown_tagged_scheme_is_an_error() {
        let kb = SampleIsaKb::new();
        let tagged = json!({ "scheme": "$InsnScheme:not a real scheme" });
        let err = resolve_json_references(&tagged, &kb).unwrap_err();
        assert_eq!(err.0, "not a real scheme");
    }

    #[test]
    fn operand_key_tag_round_trips() {
        let key = OperandKey(3);
        let tagged = tag_operand_key(key);
        assert_eq!(untag_operand_key(&tagged), Some(key));
    }
}
