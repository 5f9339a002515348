//! Legacy field names and the rollout policy that governs them.

use serde_json::{Map, Value};
use std::str::FromStr;

use phaseguard_utils::types::{PhaseId, RolloutPhase};

/// A retired top-level field and the canonical path that replaced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyAlias {
    pub legacy: &'static str,
    /// Dotted path, at most two levels deep
    pub canonical: &'static str,
}

pub const LEGACY_ALIASES: [LegacyAlias; 7] = [
    LegacyAlias { legacy: "CurrentPhase", canonical: "Phase" },
    LegacyAlias { legacy: "Confidence", canonical: "ConfidenceLevel" },
    LegacyAlias { legacy: "NextStep", canonical: "Next" },
    LegacyAlias { legacy: "GateStatus", canonical: "Gates" },
    LegacyAlias { legacy: "ReasonPayload", canonical: "Diagnostics.ReasonPayloads" },
    LegacyAlias { legacy: "RulebookEvidence", canonical: "LoadEvidence" },
    LegacyAlias { legacy: "ADRs", canonical: "ArchitectureDecisions" },
];

/// How legacy names are treated for the current rollout phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliasPolicy {
    pub rollout: RolloutPhase,
    /// Compatibility flag, honoured only during `engine-only`
    pub allow_legacy_fields: bool,
}

impl AliasPolicy {
    #[must_use]
    pub fn accepts_legacy(&self) -> bool {
        match self.rollout {
            RolloutPhase::DualRead => true,
            RolloutPhase::EngineOnly => self.allow_legacy_fields,
            RolloutPhase::LegacyRemoved => false,
        }
    }

    /// Accepting legacy names in this phase warrants a warning.
    #[must_use]
    pub fn warns(&self) -> bool {
        self.rollout == RolloutPhase::EngineOnly && self.allow_legacy_fields
    }
}

/// One legacy field found in a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub field: &'static str,
    pub canonical: &'static str,
    /// The canonical field was already set and the legacy value was dropped
    pub shadowed: bool,
}

/// First legacy field found when the policy refuses them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyRejection {
    pub field: &'static str,
    pub canonical: &'static str,
    pub rollout: RolloutPhase,
}

/// Legacy fields present at the top level of `doc`, in alias-table order.
#[must_use]
pub fn legacy_fields(doc: &Value) -> Vec<LegacyAlias> {
    let Some(obj) = doc.as_object() else {
        return Vec::new();
    };
    LEGACY_ALIASES
        .iter()
        .copied()
        .filter(|a| obj.contains_key(a.legacy))
        .collect()
}

/// Rewrite legacy fields in place according to `policy`.
///
/// A canonical field that is already present wins over its legacy twin.
pub fn normalize(doc: &mut Value, policy: AliasPolicy) -> Result<Vec<Rewrite>, LegacyRejection> {
    let found = legacy_fields(doc);
    if found.is_empty() {
        return Ok(Vec::new());
    }
    if !policy.accepts_legacy() {
        let first = found[0];
        return Err(LegacyRejection {
            field: first.legacy,
            canonical: first.canonical,
            rollout: policy.rollout,
        });
    }
    Ok(rewrite_all(doc, &found))
}

/// Rewrite every legacy field regardless of rollout phase.
///
/// Used by the explicit operator migration.
pub fn force_normalize(doc: &mut Value) -> Vec<Rewrite> {
    let found = legacy_fields(doc);
    rewrite_all(doc, &found)
}

fn rewrite_all(doc: &mut Value, found: &[LegacyAlias]) -> Vec<Rewrite> {
    let Some(obj) = doc.as_object_mut() else {
        return Vec::new();
    };
    let mut rewrites = Vec::with_capacity(found.len());
    for alias in found {
        let Some(value) = obj.remove(alias.legacy) else {
            continue;
        };
        let value = upgrade_value(alias.legacy, value);
        let shadowed = !insert_if_absent(obj, alias.canonical, value);
        if shadowed {
            tracing::warn!(field = alias.legacy, canonical = alias.canonical, "legacy field shadowed by canonical field");
        }
        rewrites.push(Rewrite {
            field: alias.legacy,
            canonical: alias.canonical,
            shadowed,
        });
    }
    rewrites
}

/// Returns false when the target already exists.
fn insert_if_absent(obj: &mut Map<String, Value>, path: &str, value: Value) -> bool {
    match path.split_once('.') {
        None => {
            if obj.contains_key(path) {
                return false;
            }
            obj.insert(path.to_string(), value);
            true
        }
        Some((parent, child)) => {
            let entry = obj
                .entry(parent.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match entry.as_object_mut() {
                Some(inner) if !inner.contains_key(child) => {
                    inner.insert(child.to_string(), value);
                    true
                }
                _ => false,
            }
        }
    }
}

/// Older documents stored some values in flatter shapes.
fn upgrade_value(legacy: &str, value: Value) -> Value {
    match (legacy, value) {
        // "CurrentPhase": "5" or "architecture-review"
        ("CurrentPhase", Value::String(s)) => match PhaseId::from_str(&s) {
            Ok(p) => serde_json::json!({
                "Ordinal": p.ordinal(),
                "Token": p.token(),
                "Name": p.as_str(),
            }),
            Err(_) => Value::String(s),
        },
        // "GateStatus": {"P5-Architecture": "approved"}
        ("GateStatus", Value::Object(gates)) => Value::Object(
            gates
                .into_iter()
                .map(|(gate, status)| match status {
                    Value::String(_) => (gate, serde_json::json!({ "Status": status })),
                    other => (gate, other),
                })
                .collect(),
        ),
        (_, v) => v,
    }
}
