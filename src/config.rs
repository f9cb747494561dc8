use std::{env, str::FromStr};

use serde::Deserialize;

use crate::alloc::guard::DEFAULT_MIN_GUARD_SIZE;

/// What a release that finds a problem does after reporting it
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePolicy {
    /// Report, free what can be freed, and hand the error back
    #[default]
    Lenient,
    /// Report, free what can be freed, then `abort()`
    Strict,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Starting minimum guard length, rounded up to a power of two
    pub min_guard_size: usize,
    pub release_policy: ReleasePolicy,
    /// Fixed seed for guard bytes. `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_guard_size: DEFAULT_MIN_GUARD_SIZE,
            release_policy: ReleasePolicy::Lenient,
            seed: None,
        }
    }
}

impl Config {
    pub const MIN_GUARD_VAR: &'static str = "GALLOC_MIN_GUARD";
    pub const STRICT_VAR: &'static str = "GALLOC_STRICT";
    pub const SEED_VAR: &'static str = "GALLOC_SEED";

    /// Defaults, overridden by `GALLOC_MIN_GUARD`, `GALLOC_STRICT` (`1`/`true`)
    /// and `GALLOC_SEED`. Values that don't parse are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(min) = parse_var(&lookup, Self::MIN_GUARD_VAR) {
            config.min_guard_size = min;
        }
        if let Some(strict) = lookup(Self::STRICT_VAR) {
            match strict.trim() {
                "1" | "true" | "yes" => config.release_policy = ReleasePolicy::Strict,
                "0" | "false" | "no" | "" => config.release_policy = ReleasePolicy::Lenient,
                other => log::warn!(target: "galloc", "ignoring {}={other:?}", Self::STRICT_VAR),
            }
        }
        config.seed = parse_var(&lookup, Self::SEED_VAR);
        config
    }

    pub fn with_min_guard_size(mut self, min_guard_size: usize) -> Self {
        self.min_guard_size = min_guard_size;
        self
    }

    pub fn with_release_policy(mut self, release_policy: ReleasePolicy) -> Self {
        self.release_policy = release_policy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

fn parse_var<T: FromStr>(lookup: impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!(target: "galloc", "ignoring {key}={raw:?}");
            None
        }
    }
}
