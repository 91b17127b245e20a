//! Batch settings from `--pm-*` flags.

use std::time::Duration;

use tracing::warn;

use crate::pool::PoolConfig;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_START_DELAY_MS: u64 = 1;
pub const DEFAULT_TIMEOUT_SECS: u64 = 7200;

/// Flag values as typed on the command line.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawOptions<'a> {
    pub max: Option<&'a str>,
    pub interval: Option<&'a str>,
    pub start_delay: Option<&'a str>,
    pub max_timeout: Option<&'a str>,
}

/// Resolved settings of one batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchConfig {
    pub pool: PoolConfig,
    /// Deadline of every child process.
    pub timeout: Duration,
    /// Non-fatal remarks about the requested settings.
    pub warnings: Vec<String>,
}

impl BatchConfig {
    /// Resolves `raw` for a machine with `cores` CPU cores.
    ///
    /// Invalid values fall back to their default and never fail.
    pub fn resolve(raw: &RawOptions<'_>, cores: usize) -> Self {
        let cores = cores.max(1);
        let concurrency = resolve_concurrency(raw.max, cores);
        let mut warnings = Vec::new();
        if concurrency > cores {
            warnings.push(format!(
                "--pm-max={} is higher than the {} detected CPU cores",
                concurrency, cores
            ));
        }
        Self {
            pool: PoolConfig {
                concurrency,
                poll_interval: Duration::from_millis(positive_or(
                    "--pm-interval",
                    raw.interval,
                    DEFAULT_POLL_INTERVAL_MS,
                )),
                start_delay: Duration::from_millis(positive_or(
                    "--pm-start-delay",
                    raw.start_delay,
                    DEFAULT_START_DELAY_MS,
                )),
            },
            timeout: Duration::from_secs(positive_or("--pm-max-timeout", raw.max_timeout, DEFAULT_TIMEOUT_SECS)),
            warnings,
        }
    }
}

/// `auto`, zero and garbage all mean one process per core.
fn resolve_concurrency(value: Option<&str>, cores: usize) -> usize {
    let value = match value.map(str::trim) {
        None | Some("auto") => return cores,
        Some(value) => value,
    };
    match value.parse::<usize>() {
        Ok(0) => cores,
        Ok(n) => n,
        Err(_) => {
            warn!(value, cores, "invalid --pm-max, using one process per core");
            cores
        }
    }
}

/// Parses a positive integer, falling back to `default` when zero or invalid.
fn positive_or(flag: &str, value: Option<&str>, default: u64) -> u64 {
    let value = match value {
        Some(value) => value.trim(),
        None => return default,
    };
    match value.parse::<u64>() {
        Ok(n) if n > 0 => n,
        _ => {
            warn!(flag, value, default, "invalid value, using default");
            default
        }
    }
}

/// Number of online CPU cores, at least 1.
pub fn detected_cores() -> usize {
    // SAFETY: No memory safety issue as this function takes and return a scalar.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}
