use anyhow::{Context, Result};

use deck_trust::TrustLevel;

pub const ENV_LOG: &str = "DECK_LOG";
pub const ENV_FRAME_MS: &str = "DECK_FRAME_MS";
pub const ENV_MEMORY_LIMIT: &str = "DECK_MEMORY_LIMIT";
pub const ENV_ALLOW_SYSTEM_MODULES: &str = "DECK_ALLOW_SYSTEM_MODULES";

pub const DEFAULT_FRAME_MS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Trust given to the top-level script.
    pub script_trust: TrustLevel,
    pub frame_ms: u64,
    /// VM allocation cap in bytes; 0 disables the cap.
    pub memory_limit: usize,
    pub allow_system_modules: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            script_trust: TrustLevel::Trusted,
            frame_ms: DEFAULT_FRAME_MS,
            memory_limit: 0,
            allow_system_modules: true,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with `DECK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = RuntimeConfig::default();
        if let Ok(raw) = std::env::var(ENV_FRAME_MS) {
            cfg.frame_ms = parse_u64_env(ENV_FRAME_MS, &raw)?;
        }
        if let Ok(raw) = std::env::var(ENV_MEMORY_LIMIT) {
            cfg.memory_limit = parse_u64_env(ENV_MEMORY_LIMIT, &raw)? as usize;
        }
        if let Ok(raw) = std::env::var(ENV_ALLOW_SYSTEM_MODULES) {
            cfg.allow_system_modules = parse_bool_env(ENV_ALLOW_SYSTEM_MODULES, &raw)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_ms == 0 {
            anyhow::bail!("frame period must be at least 1 ms\n\nfix: set {ENV_FRAME_MS} or --frame-ms to a positive value");
        }
        Ok(())
    }
}

pub fn parse_bool_env(name: &str, raw: &str) -> Result<bool> {
    match raw.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Ok(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Ok(false),
        other => anyhow::bail!(
            "invalid environment variable {name}={other:?} (expected one of: 1, 0, true, false, yes, no)"
        ),
    }
}

fn parse_u64_env(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .with_context(|| format!("invalid environment variable {name}={raw:?} (expected an unsigned integer)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_env_accepts_the_usual_spellings() {
        for raw in ["1", "true", "YES", " yes "] {
            assert!(parse_bool_env("X", raw).unwrap(), "{raw}");
        }
        for raw in ["0", "false", "NO"] {
            assert!(!parse_bool_env("X", raw).unwrap(), "{raw}");
        }
        let err = parse_bool_env("DECK_X", "maybe").unwrap_err();
        assert!(err.to_string().contains("DECK_X=\"maybe\""));
    }

    #[test]
    fn defaults_and_validation() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.script_trust, TrustLevel::Trusted);
        assert_eq!(cfg.frame_ms, 10);
        assert!(cfg.allow_system_modules);
        cfg.validate().unwrap();

        let bad = RuntimeConfig {
            frame_ms: 0,
            ..RuntimeConfig::default()
        };
        assert!(format!("{:#}", bad.validate().unwrap_err()).contains("fix:"));
        assert!(parse_u64_env("N", "12x").is_err());
    }
}
