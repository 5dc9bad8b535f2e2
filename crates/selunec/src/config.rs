//! CLI configuration.
//!
//! `selunec run` accepts an optional TOML file tuning the collector and
//! bounding execution. Missing file or missing keys fall back to the
//! defaults below.
//!
//! ```toml
//! [gc]
//! pause = 200
//! stepmul = 200
//!
//! [run]
//! max-steps = 0   # 0 = unlimited
//! ```

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GcConfig {
    #[serde(default = "default_pause")]
    pub pause: u32,
    #[serde(default = "default_stepmul")]
    pub stepmul: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Instruction budget enforced through a count hook; 0 disables.
    #[serde(default, rename = "max-steps")]
    pub max_steps: u64,
}

fn default_pause() -> u32 {
    200
}

fn default_stepmul() -> u32 {
    200
}

impl Default for GcConfig {
    fn default() -> GcConfig {
        GcConfig { pause: default_pause(), stepmul: default_stepmul() }
    }
}

impl Default for RunConfig {
    fn default() -> RunConfig {
        RunConfig { max_steps: 0 }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read config {}: {e}", path.display()))?;
        toml::from_str(&text).map_err(|e| format!("invalid config {}: {e}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.gc.pause, 200);
        assert_eq!(c.gc.stepmul, 200);
        assert_eq!(c.run.max_steps, 0);
    }

    #[test]
    fn partial_overrides() {
        let c: Config = toml::from_str("[gc]\npause = 150\n").unwrap();
        assert_eq!(c.gc.pause, 150);
        assert_eq!(c.gc.stepmul, 200);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("[gc]\nspeed = 1\n").is_err());
    }
}
