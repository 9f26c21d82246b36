//! Tracing subscriber setup shared by the CLI and the HTTP service.
//!
//! Filter priority, highest first:
//!
//! 1. `QBANK_SYNC_LOG` (per-target directives, e.g. `qbank_sync=debug,warn`)
//! 2. `RUST_LOG`
//! 3. `-v` / `-q` flags
//! 4. the binary's baseline level

use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV_VAR: &str = "QBANK_SYNC_LOG";
const TARGET_PREFIX: &str = "qbank_sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    #[must_use]
    pub const fn from_flags(verbose: bool, quiet: bool) -> Self {
        if verbose {
            Self::Verbose
        } else if quiet {
            Self::Quiet
        } else {
            Self::Normal
        }
    }

    /// `baseline` applies when neither flag is set.
    #[must_use]
    pub const fn level(self, baseline: Level) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => baseline,
            Self::Verbose => Level::DEBUG,
        }
    }
}

/// Installs the global subscriber writing to stderr. A second call is a
/// no-op, which keeps embedded and test use safe.
pub fn init_subscriber(verbosity: Verbosity, baseline: Level) {
    let filter = build_env_filter(verbosity, baseline);
    let use_ansi = std::io::IsTerminal::is_terminal(&std::io::stderr());

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(use_ansi)
        .with_target(true)
        .with_level(true);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

fn build_env_filter(verbosity: Verbosity, baseline: Level) -> EnvFilter {
    if let Some(filter) = std::env::var(LOG_ENV_VAR)
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
    {
        return filter;
    }

    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let level = verbosity.level(baseline);
    let directive = if verbosity == Verbosity::Verbose {
        format!("{level},{TARGET_PREFIX}=debug")
    } else {
        level.to_string()
    };
    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}
