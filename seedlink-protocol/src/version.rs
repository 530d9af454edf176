use crate::error::{Result, SeedlinkError};

/// SeedLink protocol dialect, selected once per session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolVersion {
    V3,
    V4,
}

impl ProtocolVersion {
    /// Version string as used by `SLPROTO` and capability tokens.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V3 => "3.1",
            Self::V4 => "4.0",
        }
    }

    /// Parse a version string (`"3"`, `"3.1"`, `"4"`, `"4.0"`).
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim() {
            "3" | "3.0" | "3.1" => Ok(Self::V3),
            "4" | "4.0" => Ok(Self::V4),
            other => Err(SeedlinkError::UnsupportedVersion(other.to_owned())),
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
