//! `NETSPLIT_*` environment overrides.
//!
//! Every lookup takes the value the setting would otherwise have (with its
//! source) and returns either that fallback or the environment's value. A
//! variable that is set but unusable is recorded as an [`EnvError`] and the
//! fallback is kept, so all bad variables can be reported in one go.

use std::env;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::source::Sourced;

const PREFIX: &str = "NETSPLIT_";

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// A `NETSPLIT_*` variable that is set but cannot be used.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("{var}={value:?} is not a valid {expected}")]
    Unparsable {
        var: String,
        value: String,
        expected: &'static str,
    },

    #[error("{var}={value} is outside {}..={}", .range.start(), .range.end())]
    OutOfRange {
        var: String,
        value: u32,
        range: RangeInclusive<u32>,
    },
}

/// Reads overrides and collects the problems it finds.
#[derive(Debug, Default)]
pub struct EnvParser {
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// `(full variable name, raw value)` when the variable is set.
    fn lookup(name: &str) -> Option<(String, String)> {
        let var = format!("{PREFIX}{name}");
        env::var(&var).ok().map(|value| (var, value))
    }

    /// Parse a set variable with `parse`, keeping `fallback` on failure.
    fn parsed<T>(
        &mut self,
        name: &str,
        fallback: Sourced<T>,
        expected: &'static str,
        parse: impl FnOnce(&str) -> Option<T>,
    ) -> Sourced<T> {
        let Some((var, raw)) = Self::lookup(name) else {
            return fallback;
        };
        match parse(raw.trim()) {
            Some(value) => Sourced::from_env(value, var),
            None => {
                self.errors.push(EnvError::Unparsable {
                    var,
                    value: raw,
                    expected,
                });
                fallback
            }
        }
    }

    pub fn string(&mut self, name: &str, fallback: Sourced<String>) -> Sourced<String> {
        match Self::lookup(name) {
            Some((var, value)) => Sourced::from_env(value, var),
            None => fallback,
        }
    }

    /// An empty variable clears the setting.
    pub fn optional_string(
        &mut self,
        name: &str,
        fallback: Sourced<Option<String>>,
    ) -> Sourced<Option<String>> {
        match Self::lookup(name) {
            Some((var, value)) => Sourced::from_env(Some(value).filter(|v| !v.is_empty()), var),
            None => fallback,
        }
    }

    /// Like [`optional_string`](Self::optional_string), with `~/` expanded
    /// in whichever value wins.
    pub fn path(&mut self, name: &str, fallback: Sourced<Option<PathBuf>>) -> Sourced<Option<PathBuf>> {
        let mut resolved = match Self::lookup(name) {
            Some((var, value)) => {
                Sourced::from_env(Some(PathBuf::from(value)).filter(|p| !p.as_os_str().is_empty()), var)
            }
            None => fallback,
        };
        resolved.value = resolved
            .value
            .map(|path| expand_home(&path.to_string_lossy()));
        resolved
    }

    /// Human-readable duration (`90s`, `2m`, `1h 30m`).
    pub fn duration(&mut self, name: &str, fallback: Sourced<Duration>) -> Sourced<Duration> {
        self.parsed(name, fallback, "duration (e.g. 90s, 2m)", |raw| {
            humantime::parse_duration(raw).ok()
        })
    }

    pub fn bounded_u32(
        &mut self,
        name: &str,
        fallback: Sourced<u32>,
        range: RangeInclusive<u32>,
    ) -> Sourced<u32> {
        let value = self.parsed(name, fallback.clone(), "non-negative integer", |raw| {
            raw.parse::<u32>().ok()
        });
        if value.is_from_env() && !range.contains(&value.value) {
            self.errors.push(EnvError::OutOfRange {
                var: value.env_var.unwrap_or_default(),
                value: value.value,
                range,
            });
            return fallback;
        }
        value
    }

    /// Tracing level name, lowercased.
    pub fn log_level(&mut self, name: &str, fallback: Sourced<String>) -> Sourced<String> {
        self.parsed(
            name,
            fallback,
            "log level (trace, debug, info, warn, error, off)",
            |raw| {
                let lower = raw.to_ascii_lowercase();
                LOG_LEVELS.contains(&lower.as_str()).then_some(lower)
            },
        )
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(value: &str) -> PathBuf {
    if let Some(stripped) = value.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(value)
}
