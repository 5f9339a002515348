//! CLI argument definitions and parsing structures

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};

/// phaseguard - evidence-gated phase/gate orchestration
#[derive(Parser, Debug)]
#[command(name = "phaseguard")]
#[command(about = "Drive a repository workflow through evidence-gated phases")]
#[command(long_about = r#"
phaseguard keeps one session state per (repo, run) and moves it through an
ordered set of phases. Gates approve only on fresh, trusted evidence; every
refusal names one reason code and one command to run next.

EXAMPLES:
  # Start a run from an identity_signal record
  phaseguard evidence add --repo a1b2c3 --run run-001 identity.json

  # Where is the run, and what does it need?
  phaseguard status --repo a1b2c3 --run run-001

  # Register a claim, record evidence for it, then evaluate the gate
  phaseguard claim add --repo a1b2c3 --run run-001 claim.json
  phaseguard evidence add --repo a1b2c3 --run run-001 test-run.json
  phaseguard advance --repo a1b2c3 --run run-001

  # Activate a locked rule bundle, or put the previous one back
  phaseguard activate --bundle ./bundles/core
  phaseguard rollback-engine --trigger bundle-incompatible

OUTPUT:
  stdout carries exactly one JCS-canonical JSON envelope per command.
  Logs go to stderr. The exit code follows the envelope:
  0 ok, 1 internal, 2 bad arguments, 3 blocked, 4 needs human,
  9 lock held, 11 integrity.

CONFIGURATION:
  Precedence: CLI flags > config file > defaults. The config file is
  discovered by walking upward from CWD for .phaseguard/config.toml.
"#)]
#[command(version)]
pub struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(long, global = true)]
    pub config: Option<Utf8PathBuf>,

    /// State root (overrides PHASEGUARD_HOME and the config file)
    #[arg(long, global = true)]
    pub home: Option<Utf8PathBuf>,

    /// Execution mode: interactive or pipeline
    #[arg(long, global = true)]
    pub execution_mode: Option<String>,

    /// Bounded wait for the run lock, in milliseconds
    #[arg(long, global = true)]
    pub lock_wait_ms: Option<u64>,

    /// Enable verbose logging on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log one JSON object per event on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Identifies one run.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Repository fingerprint
    #[arg(long)]
    pub repo: String,

    /// Run id
    #[arg(long)]
    pub run: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the run's phase, gate and next action without changing anything
    Status {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Evidence records
    #[command(subcommand)]
    Evidence(EvidenceCommands),

    /// Claims that evidence-backed gates verify
    #[command(subcommand)]
    Claim(ClaimCommands),

    /// Submit one iteration of architecture review feedback
    Review {
        #[command(flatten)]
        run: RunArgs,

        /// Gate under review
        #[arg(long, default_value = "P5-Architecture")]
        gate: String,

        /// Review JSON: issues, suggestions, questions, escalate, decisions, artifacts
        review: Utf8PathBuf,
    },

    /// Evaluate the pending evidence gate and advance as far as possible
    Advance {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Move the run back to an earlier phase (needs an authorization)
    RollbackPhase {
        #[command(flatten)]
        run: RunArgs,

        /// Target phase token or name
        #[arg(long)]
        to: String,

        /// Operator authorizing the rollback
        #[arg(long)]
        authorized_by: Option<String>,

        /// Why the run goes back
        #[arg(long)]
        reason: Option<String>,
    },

    /// Write a governed artifact through the persistence policy
    Persist {
        #[command(flatten)]
        run: RunArgs,

        /// Artifact kind (repo-cache, repo-map-digest, decision-pack,
        /// business-rules-inventory, workspace-memory)
        #[arg(long)]
        artifact: String,

        /// File holding the artifact content
        #[arg(long)]
        content: Utf8PathBuf,

        /// Operator confirmation phrase (interactive mode only)
        #[arg(long)]
        confirm: Option<String>,
    },

    /// Record confidence and an optional decision surface
    Assess {
        #[command(flatten)]
        run: RunArgs,

        /// Confidence level, 0 to 100
        #[arg(long)]
        confidence: u8,

        /// Decision question for architect mode
        #[arg(long, requires = "options")]
        question: Option<String>,

        /// One option of the decision surface (repeatable)
        #[arg(long = "option", requires = "question")]
        options: Vec<String>,
    },

    /// Log causes for an activation-hash change and re-check the run
    ExplainChange {
        #[command(flatten)]
        run: RunArgs,

        /// JSON array of change causes
        causes: Utf8PathBuf,
    },

    /// Rewrite legacy state fields to their canonical names
    MigrateState {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Stage, verify and activate a rule bundle
    Activate {
        /// Bundle directory holding bundle.toml and bundle.lock
        #[arg(long)]
        bundle: Utf8PathBuf,

        /// Run whose state must keep loading under the new bundle
        #[arg(long, requires = "run")]
        repo: Option<String>,

        #[arg(long, requires = "repo")]
        run: Option<String>,
    },

    /// Restore the previously active bundle
    RollbackEngine {
        /// startup-crash-loop, bundle-incompatible or integrity-mismatch
        #[arg(long)]
        trigger: String,
    },

    /// Reason code registry
    #[command(subcommand)]
    Registry(RegistryCommands),
}

#[derive(Subcommand, Debug)]
pub enum EvidenceCommands {
    /// Append one evidence record; the first one must be an identity_signal
    Add {
        #[command(flatten)]
        run: RunArgs,

        /// Evidence JSON: evidence_id, evidence_class, observed_at, payload
        file: Utf8PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum ClaimCommands {
    /// Register a claim for an evidence-backed gate
    Add {
        #[command(flatten)]
        run: RunArgs,

        /// Claim JSON: claim_id, label, kind, required_class, gate
        file: Utf8PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum RegistryCommands {
    /// Load and validate a registry file (the configured or built-in one by default)
    Check {
        /// Registry TOML to check
        file: Option<Utf8PathBuf>,
    },
}
