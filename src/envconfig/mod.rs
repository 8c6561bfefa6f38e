use crate::convert::ExportOptions;
use std::env;

pub const HALF_VAR: &str = "CKPT_EXPORT_HALF";
pub const PICKLE_KEY_VAR: &str = "CKPT_EXPORT_PICKLE_KEY";
pub const NAME_VAR: &str = "CKPT_EXPORT_NAME";

/// Export defaults taken from the environment. Command line flags win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvConfig {
    pub half: bool,
    pub pickle_key: Option<String>,
    pub name: Option<String>,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            half: lookup(HALF_VAR).map(|v| parse_bool(&v)).unwrap_or(false),
            pickle_key: lookup(PICKLE_KEY_VAR).filter(|v| !v.trim().is_empty()),
            name: lookup(NAME_VAR).filter(|v| !v.trim().is_empty()),
        }
    }

    /// Layer explicit values over the environment defaults.
    pub fn options(&self, half: bool, pickle_key: Option<String>, name: Option<String>) -> ExportOptions {
        ExportOptions {
            half: half || self.half,
            pickle_key: pickle_key.or_else(|| self.pickle_key.clone()),
            name: name.or_else(|| self.name.clone()),
        }
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
