use camino::Utf8Path;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use phaseguard_utils::error::{ErrorCategory, UserFriendlyError};
use phaseguard_utils::types::SessionKey;

use crate::code::{Category, ReasonCode};

/// Payload attached to a reason code. Ordered so canonical output is stable.
pub type ReasonPayload = BTreeMap<String, String>;

/// Registry file compiled into the binary.
pub const BUILTIN_REGISTRY: &str = include_str!("../registry/reasons.toml");

/// Major registry schema version this engine understands.
pub const SUPPORTED_REGISTRY_MAJOR: &str = "1";

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-z_]+)\}").expect("placeholder pattern is valid"));

const AMBIENT_FIELDS: [&str; 2] = ["repo", "run_id"];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Failed to parse reason registry: {0}")]
    Parse(String),

    #[error("Reason registry version '{found}' is not supported (need {SUPPORTED_REGISTRY_MAJOR}.x)")]
    UnsupportedVersion { found: String },

    #[error("Reason registry names unknown code '{0}'")]
    UnknownCode(String),

    #[error("Reason registry lists '{0}' more than once")]
    DuplicateCode(String),

    #[error("Reason registry is missing code(s): {}", .0.join(", "))]
    MissingCodes(Vec<String>),

    #[error("Reason '{code}' uses placeholder '{{{placeholder}}}' that is not a required field")]
    UnknownPlaceholder { code: String, placeholder: String },

    #[error("Failed to read reason registry {path}: {reason}")]
    Read { path: String, reason: String },
}

impl UserFriendlyError for RegistryError {
    fn user_message(&self) -> String {
        self.to_string()
    }

    fn context(&self) -> Option<String> {
        Some("The reason registry is authoritative; the engine refuses to start with an inconsistent one".to_string())
    }

    fn suggestions(&self) -> Vec<String> {
        vec!["Run `phaseguard registry check <file>` and fix every reported entry".to_string()]
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Configuration
    }
}

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonSpec {
    pub code: ReasonCode,
    pub required_fields: Vec<String>,
    pub recovery_action: String,
    pub next_command: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryFile {
    registry_version: String,
    #[serde(default, rename = "reason")]
    reasons: Vec<RawSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSpec {
    code: String,
    #[serde(default)]
    required_fields: Vec<String>,
    recovery_action: String,
    next_command: String,
}

/// Values available to `{placeholder}` rendering besides the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderContext {
    pub repo: String,
    pub run_id: String,
}

impl RenderContext {
    #[must_use]
    pub fn for_key(key: &SessionKey) -> Self {
        Self {
            repo: key.repo_fingerprint.clone(),
            run_id: key.run_id.clone(),
        }
    }

    /// Context for engine-level operations that are not tied to a run.
    #[must_use]
    pub fn engine() -> Self {
        Self {
            repo: "<repo>".to_string(),
            run_id: "<run>".to_string(),
        }
    }
}

/// A validated reason with its rendered recovery guidance.
///
/// Every refusal that reaches a caller is one of these: exactly one primary
/// code, one recovery sentence and one concrete command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonEmission {
    pub code: ReasonCode,
    pub payload: ReasonPayload,
    pub recovery_action: String,
    pub next_command: String,
}

impl ReasonEmission {
    #[must_use]
    pub fn is_block(&self) -> bool {
        self.code.is_blocking()
    }

    #[must_use]
    pub fn category(&self) -> Category {
        self.code.category()
    }
}

impl std::fmt::Display for ReasonEmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.recovery_action)
    }
}

/// Why a payload does not satisfy its code's schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadProblem {
    Unregistered(String),
    MissingFields(ReasonCode, Vec<String>),
}

/// Closed, versioned reason-code registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonRegistry {
    version: String,
    specs: HashMap<ReasonCode, ReasonSpec>,
}

impl ReasonRegistry {
    /// Registry compiled into the engine.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::parse(BUILTIN_REGISTRY)
    }

    /// Load an external registry file.
    pub fn from_path(path: &Utf8Path) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path).map_err(|e| RegistryError::Read {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse and check a registry document.
    ///
    /// Fails on unknown or duplicate codes, on any engine code the file omits,
    /// and on placeholders that no required field can fill.
    pub fn parse(content: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile =
            toml::from_str(content).map_err(|e| RegistryError::Parse(e.to_string()))?;

        if file.registry_version.split('.').next() != Some(SUPPORTED_REGISTRY_MAJOR) {
            return Err(RegistryError::UnsupportedVersion {
                found: file.registry_version,
            });
        }

        let mut specs = HashMap::new();
        for raw in file.reasons {
            let code: ReasonCode = raw
                .code
                .parse()
                .map_err(|_| RegistryError::UnknownCode(raw.code.clone()))?;

            let allowed: BTreeSet<&str> = raw
                .required_fields
                .iter()
                .map(String::as_str)
                .chain(AMBIENT_FIELDS)
                .collect();
            for text in [&raw.recovery_action, &raw.next_command] {
                for cap in PLACEHOLDER.captures_iter(text) {
                    let name = &cap[1];
                    if !allowed.contains(name) {
                        return Err(RegistryError::UnknownPlaceholder {
                            code: raw.code.clone(),
                            placeholder: name.to_string(),
                        });
                    }
                }
            }

            let spec = ReasonSpec {
                code,
                required_fields: raw.required_fields,
                recovery_action: raw.recovery_action,
                next_command: raw.next_command,
            };
            if specs.insert(code, spec).is_some() {
                return Err(RegistryError::DuplicateCode(raw.code));
            }
        }

        let missing: Vec<String> = ReasonCode::all()
            .iter()
            .filter(|c| !specs.contains_key(c))
            .map(|c| c.as_str().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(RegistryError::MissingCodes(missing));
        }

        tracing::debug!(version = %file.registry_version, codes = specs.len(), "reason registry loaded");
        Ok(Self {
            version: file.registry_version,
            specs,
        })
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Entry for a code. Every code has one once the registry is loaded.
    #[must_use]
    pub fn spec(&self, code: ReasonCode) -> Option<&ReasonSpec> {
        self.specs.get(&code)
    }

    #[must_use]
    pub fn required_fields(&self, code: ReasonCode) -> &[String] {
        self.specs
            .get(&code)
            .map_or(&[][..], |s| s.required_fields.as_slice())
    }

    /// Required fields absent from (or blank in) `payload`, in registry order.
    #[must_use]
    pub fn missing_fields(&self, code: ReasonCode, payload: &ReasonPayload) -> Vec<String> {
        self.required_fields(code)
            .iter()
            .filter(|f| payload.get(*f).is_none_or(|v| v.trim().is_empty()))
            .cloned()
            .collect()
    }

    /// Check a free-form code string and its payload against the schema.
    pub fn check_payload(&self, code: &str, payload: &ReasonPayload) -> Result<ReasonCode, PayloadProblem> {
        let parsed: ReasonCode = code
            .parse()
            .map_err(|_| PayloadProblem::Unregistered(code.to_string()))?;
        let missing = self.missing_fields(parsed, payload);
        if missing.is_empty() {
            Ok(parsed)
        } else {
            Err(PayloadProblem::MissingFields(parsed, missing))
        }
    }

    /// Validate a free-form emission.
    ///
    /// An unregistered code or an incomplete payload is a contract violation:
    /// the original claim is dropped and replaced by the matching `BLOCKED-*`
    /// emission.
    #[must_use]
    pub fn validate_emission(
        &self,
        code: &str,
        payload: ReasonPayload,
        ctx: &RenderContext,
    ) -> ReasonEmission {
        match self.check_payload(code, &payload) {
            Ok(parsed) => self.render(parsed, payload, ctx),
            Err(PayloadProblem::Unregistered(raw)) => {
                tracing::error!(code = %raw, "unregistered reason code emitted");
                self.render(
                    ReasonCode::ReasonCodeUnregistered,
                    payload_of([("code", raw)]),
                    ctx,
                )
            }
            Err(PayloadProblem::MissingFields(parsed, missing)) => {
                tracing::error!(code = %parsed, missing = ?missing, "reason payload incomplete");
                self.render(
                    ReasonCode::ReasonPayloadIncomplete,
                    payload_of([
                        ("code", parsed.as_str().to_string()),
                        ("missing_fields", missing.join(",")),
                    ]),
                    ctx,
                )
            }
        }
    }

    /// Build a validated emission for a typed code.
    #[must_use]
    pub fn emit(&self, code: ReasonCode, payload: ReasonPayload, ctx: &RenderContext) -> ReasonEmission {
        self.validate_emission(code.as_str(), payload, ctx)
    }

    fn render(&self, code: ReasonCode, payload: ReasonPayload, ctx: &RenderContext) -> ReasonEmission {
        let (recovery_action, next_command) = match self.specs.get(&code) {
            Some(spec) => (
                fill(&spec.recovery_action, &payload, ctx),
                fill(&spec.next_command, &payload, ctx),
            ),
            None => (
                format!("Resolve {code}."),
                format!("phaseguard status --repo {} --run {}", ctx.repo, ctx.run_id),
            ),
        };
        ReasonEmission {
            code,
            payload,
            recovery_action,
            next_command,
        }
    }
}

fn fill(template: &str, payload: &ReasonPayload, ctx: &RenderContext) -> String {
    PLACEHOLDER
        .replace_all(template, |cap: &regex::Captures<'_>| {
            let name = &cap[1];
            match name {
                "repo" => ctx.repo.clone(),
                "run_id" => ctx.run_id.clone(),
                _ => payload
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| cap[0].to_string()),
            }
        })
        .into_owned()
}

/// Build a payload from literal pairs.
#[must_use]
pub fn payload_of<const N: usize, V: Into<String>>(pairs: [(&str, V); N]) -> ReasonPayload {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.into()))
        .collect()
}
