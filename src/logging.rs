//! Process-wide logging facade.
//!
//! Initialised exactly once at startup. The effective filter is, in order of
//! precedence: the `RUST_LOG` environment variable, the `--log-settings`
//! directive file, the configured severity name.

use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use color_eyre::eyre::{eyre, Result};
use tracing_subscriber::EnvFilter;

use crate::config::ConfigError;

/// Map a configured severity name onto a filter directive.
pub fn severity_directive(severity: &str) -> Result<&'static str, ConfigError> {
    match severity {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warning" => Ok("warn"),
        "error" => Ok("error"),
        "fatal" => Ok("error"),
        other => Err(ConfigError::InvalidSeverity(other.to_string())),
    }
}

/// Read the filter directive out of a log settings file.
///
/// The first non-empty line that is not a `#` comment is the directive.
fn directive_from_file(path: &Path) -> Result<String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre!("could not open {} file: {e}", path.display()))?;
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .ok_or_else(|| eyre!("no filter directive in {}", path.display()))
}

/// Install the global subscriber.
pub fn init(
    settings_file: Option<&Path>,
    log_file: Option<&Path>,
    severity: &str,
) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(env) => env,
        Err(_) => match settings_file {
            Some(path) => EnvFilter::try_new(directive_from_file(path)?)?,
            None => EnvFilter::try_new(severity_directive(severity)?)?,
        },
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true);

    match log_file {
        Some(path) => {
            let file = File::create(path)
                .map_err(|e| eyre!("could not open {} file: {e}", path.display()))?;
            builder.with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }

    Ok(())
}
