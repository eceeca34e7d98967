//! `MAJOR.MINOR.PATCH` versions and bump rules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

/// Component incremented for the next release.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BumpKind {
    Major,
    Minor,
    #[default]
    Patch,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid version `{0}` (expected MAJOR.MINOR.PATCH)")]
pub struct VersionParseError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot bump {version}: {kind:?} component overflows")]
pub struct VersionOverflow {
    pub version: SemVer,
    pub kind: BumpKind,
}

impl SemVer {
    pub const ZERO: SemVer = SemVer {
        major: 0,
        minor: 0,
        patch: 0,
    };

    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Next version after `self`; lower components reset to zero.
    pub fn bump(self, kind: BumpKind) -> Result<Self, VersionOverflow> {
        let overflow = VersionOverflow {
            version: self,
            kind,
        };
        let next = match kind {
            BumpKind::Major => Self::new(self.major.checked_add(1).ok_or(overflow)?, 0, 0),
            BumpKind::Minor => {
                Self::new(self.major, self.minor.checked_add(1).ok_or(overflow)?, 0)
            }
            BumpKind::Patch => Self::new(
                self.major,
                self.minor,
                self.patch.checked_add(1).ok_or(overflow)?,
            ),
        };
        Ok(next)
    }
}

impl FromStr for SemVer {
    type Err = VersionParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let body = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let parts: Vec<&str> = body.split('.').collect();
        if parts.len() != 3 {
            return Err(VersionParseError(raw.to_string()));
        }
        let mut numbers = [0u64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(VersionParseError(raw.to_string()));
            }
            *slot = part
                .parse()
                .map_err(|_| VersionParseError(raw.to_string()))?;
        }
        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_optional_prefix() {
        assert_eq!("3.0.61".parse::<SemVer>(), Ok(SemVer::new(3, 0, 61)));
        assert_eq!("v1.2.3".parse::<SemVer>(), Ok(SemVer::new(1, 2, 3)));
        assert!("1.2".parse::<SemVer>().is_err());
        assert!("1.2.3-rc1".parse::<SemVer>().is_err());
        assert!("1..3".parse::<SemVer>().is_err());
    }

    #[test]
    fn bump_resets_lower_components() {
        let v = SemVer::new(3, 0, 61);
        assert_eq!(v.bump(BumpKind::Patch).expect("patch").to_string(), "3.0.62");
        assert_eq!(v.bump(BumpKind::Minor).expect("minor").to_string(), "3.1.0");
        assert_eq!(v.bump(BumpKind::Major).expect("major").to_string(), "4.0.0");
    }

    #[test]
    fn bump_at_the_top_of_a_component_is_an_error() {
        let v: SemVer = "0.0.18446744073709551615".parse().expect("parse");
        let err = v.bump(BumpKind::Patch).expect_err("overflow");
        assert_eq!(err.kind, BumpKind::Patch);
        assert_eq!(v.bump(BumpKind::Minor).expect("minor").to_string(), "0.1.0");
        assert!(SemVer::new(u64::MAX, 0, 0).bump(BumpKind::Major).is_err());
    }

    #[test]
    fn ordering_is_numeric() {
        assert!(SemVer::new(0, 10, 0) > SemVer::new(0, 9, 9));
    }
}
