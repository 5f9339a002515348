//! CLI entry point and dispatch logic
//!
//! This module owns the `run()` function which:
//! - Parses CLI arguments and starts logging
//! - Builds CliArgs and discovers Config
//! - Dispatches to command handlers
//! - Prints the single JSON envelope and reports errors on stderr

use chrono::{DateTime, Utc};
use clap::Parser;

use super::args::{ClaimCommands, Cli, Commands, EvidenceCommands, RegistryCommands};
use super::commands::{self, CommandError};
use crate::config::ConfigError;
use crate::logging::init_tracing;
use crate::reason::{ReasonRegistry, RenderContext};
use crate::{CliArgs, Config, EngineError, ExecutionMode, ExitCode, OutputEnvelope, UserFriendlyError, emit_jcs};

/// What one invocation produced: the envelope for stdout and the exit code.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub envelope: OutputEnvelope,
    pub exit: ExitCode,
}

/// Main CLI execution function.
///
/// Prints exactly one envelope on stdout, error reports on stderr, and
/// returns `Err(ExitCode)` for any non-zero exit. main.rs only exits.
pub fn run() -> Result<(), ExitCode> {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.verbose, cli.log_json) {
        eprintln!("warning: logging not initialised: {e}");
    }

    let invocation = run_with(&cli, Utc::now());
    match emit_jcs(&invocation.envelope) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("✗ Failed to emit envelope: {e}");
            return Err(ExitCode::INTERNAL);
        }
    }
    if invocation.exit == ExitCode::SUCCESS {
        Ok(())
    } else {
        Err(invocation.exit)
    }
}

/// Run a parsed command at `now` without printing the envelope.
pub fn run_with(cli: &Cli, now: DateTime<Utc>) -> Invocation {
    let operation = operation_name(&cli.command);
    let config = match cli_args(cli).and_then(|args| Config::discover(&args)) {
        Ok(config) => config,
        Err(err) => return failure(CommandError::from(EngineError::from(err)), None, operation),
    };
    tracing::debug!(operation, home = %config.home(), "dispatching");

    match dispatch(&cli.command, &config, now) {
        Ok(envelope) => {
            let exit = envelope.exit_code();
            Invocation { envelope, exit }
        }
        Err(err) => failure(err, Some(&config), operation),
    }
}

fn cli_args(cli: &Cli) -> Result<CliArgs, ConfigError> {
    let execution_mode = cli
        .execution_mode
        .as_deref()
        .map(str::parse::<ExecutionMode>)
        .transpose()
        .map_err(|value| ConfigError::InvalidValue {
            key: "execution_mode".to_string(),
            value,
        })?;
    Ok(CliArgs {
        config_path: cli.config.clone(),
        home: cli.home.clone(),
        execution_mode,
        log_level: cli.verbose.then(|| "debug".to_string()),
        lock_wait_ms: cli.lock_wait_ms,
    })
}

fn operation_name(command: &Commands) -> &'static str {
    match command {
        Commands::Status { .. } => "status",
        Commands::Evidence(_) => "evidence",
        Commands::Claim(_) => "claim",
        Commands::Review { .. } => "review",
        Commands::Advance { .. } => "advance",
        Commands::RollbackPhase { .. } => "rollback-phase",
        Commands::Persist { .. } => "persist",
        Commands::Assess { .. } => "assess",
        Commands::ExplainChange { .. } => "explain-change",
        Commands::MigrateState { .. } => "migrate-state",
        Commands::Activate { .. } => "activate",
        Commands::RollbackEngine { .. } => "rollback-engine",
        Commands::Registry(_) => "registry",
    }
}

fn dispatch(command: &Commands, config: &Config, now: DateTime<Utc>) -> Result<OutputEnvelope, CommandError> {
    match command {
        Commands::Status { run } => commands::execute_status_command(config, run, now),
        Commands::Evidence(EvidenceCommands::Add { run, file }) => {
            commands::execute_evidence_add_command(config, run, file, now)
        }
        Commands::Claim(ClaimCommands::Add { run, file }) => {
            commands::execute_claim_add_command(config, run, file, now)
        }
        Commands::Review { run, gate, review } => {
            commands::execute_review_command(config, run, gate, review, now)
        }
        Commands::Advance { run } => commands::execute_advance_command(config, run, now),
        Commands::RollbackPhase {
            run,
            to,
            authorized_by,
            reason,
        } => commands::execute_rollback_phase_command(
            config,
            run,
            to,
            authorized_by.as_deref(),
            reason.as_deref(),
            now,
        ),
        Commands::Persist {
            run,
            artifact,
            content,
            confirm,
        } => commands::execute_persist_command(config, run, artifact, content, confirm.as_deref(), now),
        Commands::Assess {
            run,
            confidence,
            question,
            options,
        } => commands::execute_assess_command(config, run, *confidence, question.as_deref(), options, now),
        Commands::ExplainChange { run, causes } => {
            commands::execute_explain_change_command(config, run, causes, now)
        }
        Commands::MigrateState { run } => commands::execute_migrate_state_command(config, run, now),
        Commands::Activate { bundle, repo, run } => {
            commands::execute_activate_command(config, bundle, repo.as_deref(), run.as_deref(), now)
        }
        Commands::RollbackEngine { trigger } => commands::execute_rollback_engine_command(config, trigger, now),
        Commands::Registry(RegistryCommands::Check { file }) => {
            commands::execute_registry_check_command(config, file.as_deref())
        }
    }
}

/// Registry used to render an error envelope. Falls back to the built-in
/// one so a broken registry file still yields a coded refusal where possible.
fn error_registry(config: Option<&Config>) -> Option<ReasonRegistry> {
    config
        .and_then(|c| c.registry.path.as_deref())
        .and_then(|path| ReasonRegistry::from_path(path).ok())
        .or_else(|| ReasonRegistry::builtin().ok())
}

fn failure(err: CommandError, config: Option<&Config>, operation: &str) -> Invocation {
    let CommandError { error, key, phase } = err;
    eprintln!("{}", error.display_for_user());
    tracing::debug!(operation, error = %error, "command refused");

    let ctx = key.as_ref().map_or_else(RenderContext::engine, RenderContext::for_key);
    let registry = error_registry(config);
    let envelope = OutputEnvelope::for_error(&error, registry.as_ref(), phase, &ctx);
    Invocation {
        envelope,
        exit: error.to_exit_code(),
    }
}
