//! Shared trust-level registry.
//!
//! Every loaded script chunk carries one of these levels, and the level
//! decides which sandbox environment the chunk resolves globals against.

use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrustLevel {
    #[default]
    Untrusted = 1,
    Trusted = 2,
    Admin = 3,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TrustCaps {
    /// getmetatable/setmetatable, rawget/rawset, collectgarbage, getfenv/setfenv.
    pub allow_reflection: bool,
    /// Live (not copied) coroutine/debug/io/os/math/string/table modules.
    pub allow_live_modules: bool,
    pub shares_host_package: bool,
    pub allow_home_paths: bool,
    pub allow_system_paths: bool,
}

pub const ALL_TRUST_LEVELS: [TrustLevel; 3] =
    [TrustLevel::Untrusted, TrustLevel::Trusted, TrustLevel::Admin];

impl TrustLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustLevel::Untrusted => "untrusted",
            TrustLevel::Trusted => "trusted",
            TrustLevel::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "untrusted" => Some(TrustLevel::Untrusted),
            "trusted" => Some(TrustLevel::Trusted),
            "admin" => Some(TrustLevel::Admin),
            _ => None,
        }
    }

    pub fn as_int(self) -> i64 {
        self as i64
    }

    pub fn from_int(v: i64) -> Option<Self> {
        match v {
            1 => Some(TrustLevel::Untrusted),
            2 => Some(TrustLevel::Trusted),
            3 => Some(TrustLevel::Admin),
            _ => None,
        }
    }

    pub fn caps(self) -> TrustCaps {
        match self {
            TrustLevel::Untrusted => TrustCaps {
                allow_reflection: false,
                allow_live_modules: false,
                shares_host_package: false,
                allow_home_paths: false,
                allow_system_paths: false,
            },
            TrustLevel::Trusted => TrustCaps {
                allow_reflection: true,
                allow_live_modules: false,
                shares_host_package: false,
                allow_home_paths: true,
                allow_system_paths: false,
            },
            TrustLevel::Admin => TrustCaps {
                allow_reflection: true,
                allow_live_modules: true,
                shares_host_package: true,
                allow_home_paths: true,
                allow_system_paths: true,
            },
        }
    }

    /// Returns the level a loader may actually grant when `self` is requested
    /// by a caller running at `max`.
    pub fn clamp_to(self, max: TrustLevel) -> TrustLevel {
        self.min(max)
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TrustLevelParseError {
    value: String,
}

impl fmt::Display for TrustLevelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid trust level {:?} (expected one of: untrusted, trusted, admin)",
            self.value
        )
    }
}

impl std::error::Error for TrustLevelParseError {}

impl FromStr for TrustLevel {
    type Err = TrustLevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        TrustLevel::parse(&s).ok_or(TrustLevelParseError { value: s })
    }
}

#[cfg(feature = "clap")]
impl clap::ValueEnum for TrustLevel {
    fn value_variants<'a>() -> &'a [Self] {
        &ALL_TRUST_LEVELS
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(TrustLevel::Untrusted < TrustLevel::Trusted);
        assert!(TrustLevel::Trusted < TrustLevel::Admin);
        assert_eq!(TrustLevel::Admin.as_int(), 3);
    }

    #[test]
    fn clamp_never_exceeds_caller() {
        assert_eq!(
            TrustLevel::Admin.clamp_to(TrustLevel::Untrusted),
            TrustLevel::Untrusted
        );
        assert_eq!(
            TrustLevel::Trusted.clamp_to(TrustLevel::Admin),
            TrustLevel::Trusted
        );
    }

    #[test]
    fn parse_round_trips_every_level() {
        for &t in &ALL_TRUST_LEVELS {
            assert_eq!(TrustLevel::parse(t.as_str()), Some(t));
            assert_eq!(TrustLevel::from_int(t.as_int()), Some(t));
            assert_eq!(" Admin ".parse::<TrustLevel>().ok(), Some(TrustLevel::Admin));
        }
        assert!("root".parse::<TrustLevel>().is_err());
    }

    #[test]
    fn caps_grow_with_trust() {
        let u = TrustLevel::Untrusted.caps();
        assert!(!u.allow_reflection && !u.allow_live_modules && !u.allow_home_paths);

        let t = TrustLevel::Trusted.caps();
        assert!(t.allow_reflection && !t.allow_live_modules && !t.shares_host_package);

        let a = TrustLevel::Admin.caps();
        assert!(a.allow_reflection && a.allow_live_modules && a.shares_host_package);
        assert!(a.allow_system_paths);
    }
}
