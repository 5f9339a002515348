//! Structured logging setup.
//!
//! Engine events carry the fields `repo`, `run_id`, `phase`, `gate` and
//! `reason_code` so a run can be reconstructed from logs alone. Logs go to
//! stderr; stdout is reserved for the JSON envelope.

use tracing::{Level, info, span, warn};
use tracing_subscriber::{EnvFilter, fmt, fmt::format::FmtSpan, prelude::*};

use crate::types::{PhaseId, SessionKey};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `verbose` selects debug output for the
/// phaseguard crates. `json` switches to one JSON object per event.
pub fn init_tracing(verbose: bool, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            if verbose {
                EnvFilter::try_new("phaseguard=debug,info")
            } else {
                EnvFilter::try_new("phaseguard=info,warn")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init()?;
    } else if verbose {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_line_number(false)
                    .with_file(false)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_line_number(false)
                    .with_file(false)
                    .compact(),
            )
            .try_init()?;
    }

    Ok(())
}

/// Span wrapping one engine operation on a session.
pub fn phase_span(key: &SessionKey, phase: PhaseId) -> tracing::Span {
    span!(
        Level::INFO,
        "engine_op",
        repo = %key.repo_fingerprint,
        run_id = %key.run_id,
        phase = %phase,
    )
}

/// Log a produced decision. Blocks are logged at warn level.
pub fn log_decision(key: &SessionKey, phase: PhaseId, gate: Option<&str>, reason_code: Option<&str>) {
    let gate = gate.unwrap_or("-");
    match reason_code {
        Some(code) if code.starts_with("BLOCKED-") => warn!(
            repo = %key.repo_fingerprint,
            run_id = %key.run_id,
            phase = %phase,
            gate = %gate,
            reason_code = %code,
            "decision blocked"
        ),
        _ => info!(
            repo = %key.repo_fingerprint,
            run_id = %key.run_id,
            phase = %phase,
            gate = %gate,
            reason_code = %reason_code.unwrap_or("-"),
            "decision produced"
        ),
    }
}
