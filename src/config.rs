//! Runtime configuration surface (spec §6).
//!
//! Kept from the teacher's `config.rs` (`Config::from_file` reading TOML
//! via `serde` into nested structs) and retargeted: `ServerConfig`'s
//! bind address/port become nothing here (there's no HTTP surface), and
//! in its place sit the per-instance knobs spec §6 lists — glob policy,
//! `keep`, and the serve-on-close flag.

use std::path::Path;

use serde::Deserialize;

use crate::error::{LowFiveError, Result};
use crate::glob_policy::GlobPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub policy: GlobPolicy,
    #[serde(default)]
    pub keep: bool,
    /// Run the index/query server automatically when a served file is
    /// closed rather than requiring an explicit `serve_all()` call
    /// (spec §6 `serve_on_close` flag).
    #[serde(default)]
    pub serve_on_close: bool,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(LowFiveError::Io)?;
        let cfg: Config = toml::from_str(&content).map_err(LowFiveError::Toml)?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let toml = r#"
            keep = true
            serve_on_close = true

            [[policy.memory]]
            filename = "*.h5"
            path = "/data/*"
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert!(cfg.keep);
        assert!(cfg.serve_on_close);
        assert_eq!(cfg.policy.memory.len(), 1);
    }

    #[test]
    fn defaults_are_permissive_empty() {
        let cfg = Config::default();
        assert!(!cfg.keep);
        assert!(!cfg.serve_on_close);
        assert!(cfg.policy.memory.is_empty());
    }
}
