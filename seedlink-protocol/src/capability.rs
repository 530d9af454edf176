//! HELLO capability tokens and version negotiation.
//!
//! A server advertises its capabilities after `::` on the first HELLO line:
//! `SeedLink 4.0 :: SLPROTO:4.0 SLPROTO:3.1 MULTISTATION BATCH EXTSEQ INFO:JSON`.
//! The negotiated set is fixed for the lifetime of a session.

use crate::error::{Result, SeedlinkError};
use crate::version::ProtocolVersion;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    MultiStation,
    ExtendedSequence,
    Batch,
    InfoJson,
}

impl Capability {
    pub fn token(self) -> &'static str {
        match self {
            Self::MultiStation => "MULTISTATION",
            Self::ExtendedSequence => "EXTSEQ",
            Self::Batch => "BATCH",
            Self::InfoJson => "INFO:JSON",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// Capabilities advertised by a server.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    /// Offered protocol versions, in advertised order.
    pub versions: Vec<ProtocolVersion>,
    pub multistation: bool,
    pub extended_sequence: bool,
    pub batch: bool,
    pub info_json: bool,
    /// Tokens this implementation does not interpret.
    pub other: Vec<String>,
}

impl CapabilitySet {
    /// Everything this crate's server implements.
    pub fn full() -> Self {
        Self {
            versions: vec![ProtocolVersion::V4, ProtocolVersion::V3],
            multistation: true,
            extended_sequence: true,
            batch: true,
            info_json: true,
            other: Vec::new(),
        }
    }

    /// Parse capabilities from the text after the HELLO software name.
    ///
    /// Accepts `"(2020.075) :: SLPROTO:4.0 SLPROTO:3.1"` as well as a bare
    /// token list. Without a `::` separator only tokens that look like
    /// capabilities (contain `:` or are known keywords) are taken.
    pub fn parse(extra: &str) -> Self {
        let tokens: Vec<&str> = match extra.find("::") {
            Some(idx) => extra[idx + 2..].split_whitespace().collect(),
            None => extra
                .split_whitespace()
                .filter(|t| t.contains(':') || is_keyword(t))
                .collect(),
        };

        let mut set = Self::default();
        for token in tokens {
            let upper = token.to_ascii_uppercase();
            match upper.as_str() {
                "MULTISTATION" => set.multistation = true,
                "EXTSEQ" => set.extended_sequence = true,
                "BATCH" => set.batch = true,
                "INFO:JSON" => set.info_json = true,
                _ => match upper.strip_prefix("SLPROTO:") {
                    Some(v) => {
                        if let Ok(version) = ProtocolVersion::parse(v)
                            && !set.versions.contains(&version)
                        {
                            set.versions.push(version);
                        }
                    }
                    None => set.other.push(token.to_owned()),
                },
            }
        }

        // Servers that predate SLPROTO tokens speak v3 only
        if set.versions.is_empty() {
            set.versions.push(ProtocolVersion::V3);
        }
        set
    }

    /// Space-separated token list for the HELLO banner.
    pub fn to_tokens(&self) -> String {
        let mut tokens: Vec<String> = self
            .versions
            .iter()
            .map(|v| format!("SLPROTO:{}", v.as_str()))
            .collect();
        for (flag, cap) in [
            (self.multistation, Capability::MultiStation),
            (self.batch, Capability::Batch),
            (self.extended_sequence, Capability::ExtendedSequence),
            (self.info_json, Capability::InfoJson),
        ] {
            if flag {
                tokens.push(cap.token().to_owned());
            }
        }
        tokens.extend(self.other.iter().cloned());
        tokens.join(" ")
    }

    pub fn supports_version(&self, version: ProtocolVersion) -> bool {
        self.versions.contains(&version)
    }

    /// Whether `cap` is available in a session running `version`.
    ///
    /// v4 implies multi-station, extended sequences, and JSON INFO. BATCH is
    /// a v3 command. v3 sessions are always multi-station.
    pub fn supports(&self, cap: Capability, version: ProtocolVersion) -> bool {
        if !self.supports_version(version) {
            return false;
        }
        match (version, cap) {
            (ProtocolVersion::V4, Capability::Batch) => false,
            (ProtocolVersion::V4, _) => true,
            (ProtocolVersion::V3, Capability::MultiStation) => true,
            (ProtocolVersion::V3, Capability::Batch) => self.batch,
            (ProtocolVersion::V3, Capability::ExtendedSequence | Capability::InfoJson) => false,
        }
    }

    /// Choose a session version satisfying `request`.
    pub fn negotiate(&self, request: &CapabilityRequest) -> Result<ProtocolVersion> {
        let order = if request.prefer_v4 {
            [ProtocolVersion::V4, ProtocolVersion::V3]
        } else {
            [ProtocolVersion::V3, ProtocolVersion::V4]
        };
        order
            .into_iter()
            .find(|&v| {
                self.supports_version(v) && request.require.iter().all(|&cap| self.supports(cap, v))
            })
            .ok_or_else(|| {
                let missing: Vec<&str> = request
                    .require
                    .iter()
                    .filter(|&&cap| !order.iter().any(|&v| self.supports(cap, v)))
                    .map(|cap| cap.token())
                    .collect();
                SeedlinkError::UnsupportedVersion(format!(
                    "server offers [{}], missing [{}]",
                    self.to_tokens(),
                    missing.join(" ")
                ))
            })
    }
}

fn is_keyword(token: &str) -> bool {
    matches!(
        token.to_ascii_uppercase().as_str(),
        "MULTISTATION" | "EXTSEQ" | "BATCH"
    )
}

/// What a client asks for during the handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapabilityRequest {
    /// Switch to v4 with `SLPROTO 4.0` when the server offers it.
    pub prefer_v4: bool,
    /// Capabilities the session must have; the handshake fails otherwise.
    pub require: Vec<Capability>,
}

impl Default for CapabilityRequest {
    fn default() -> Self {
        Self {
            prefer_v4: true,
            require: Vec::new(),
        }
    }
}
