use crate::capability::CapabilitySet;
use crate::error::{Result, SeedlinkError};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Unsupported,
    Unexpected,
    Unauthorized,
    Limit,
    Arguments,
    Auth,
    Internal,
}

impl ErrorCode {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UNSUPPORTED" => Some(Self::Unsupported),
            "UNEXPECTED" => Some(Self::Unexpected),
            "UNAUTHORIZED" => Some(Self::Unauthorized),
            "LIMIT" => Some(Self::Limit),
            "ARGUMENTS" => Some(Self::Arguments),
            "AUTH" => Some(Self::Auth),
            "INTERNAL" => Some(Self::Internal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsupported => "UNSUPPORTED",
            Self::Unexpected => "UNEXPECTED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Limit => "LIMIT",
            Self::Arguments => "ARGUMENTS",
            Self::Auth => "AUTH",
            Self::Internal => "INTERNAL",
        }
    }

    /// The code a server reports for a protocol error.
    pub fn for_error(err: &SeedlinkError) -> Self {
        match err {
            SeedlinkError::InvalidCommand(_) | SeedlinkError::UnsupportedVersion(_) => {
                Self::Unsupported
            }
            SeedlinkError::UnexpectedCommand { .. } | SeedlinkError::VersionMismatch { .. } => {
                Self::Unexpected
            }
            SeedlinkError::CommandTooLong { .. } | SeedlinkError::PayloadTooLarge { .. } => {
                Self::Limit
            }
            SeedlinkError::InvalidEncoding => Self::Arguments,
            SeedlinkError::InvalidPattern { .. }
            | SeedlinkError::InvalidTime(_)
            | SeedlinkError::InvalidSequence(_)
            | SeedlinkError::InvalidInfoLevel(_) => Self::Arguments,
            _ => Self::Internal,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ok,
    Error {
        code: Option<ErrorCode>,
        description: String,
    },
    Hello {
        software: String,
        /// Version text, e.g. `"v3.1 (2020.075)"`.
        version: String,
        capabilities: CapabilitySet,
        organization: String,
    },
    End,
}

impl Response {
    pub fn error(code: ErrorCode, description: impl Into<String>) -> Self {
        Self::Error {
            code: Some(code),
            description: description.into(),
        }
    }

    /// Parse a single-line response: OK, ERROR, END.
    pub fn parse_line(line: &str) -> Result<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.eq_ignore_ascii_case("OK") {
            return Ok(Self::Ok);
        }

        if line.eq_ignore_ascii_case("END") {
            return Ok(Self::End);
        }

        if line.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("ERROR")) {
            return Ok(Self::parse_error(line));
        }

        Err(SeedlinkError::InvalidResponse(format!(
            "unrecognized response: {line:?}"
        )))
    }

    /// Parse a two-line HELLO response.
    ///
    /// Line 1: `"SeedLink v3.1 (2020.075) :: SLPROTO:4.0 SLPROTO:3.1"`
    /// Line 2: `"IRIS DMC"`
    pub fn parse_hello(line1: &str, line2: &str) -> Result<Self> {
        let line1 = line1.trim_end_matches('\n').trim_end_matches('\r');
        let line2 = line2.trim_end_matches('\n').trim_end_matches('\r');

        let main_part = match line1.find("::") {
            Some(idx) => line1[..idx].trim(),
            None => line1.trim(),
        };

        let (software, version) = match main_part.split_once(' ') {
            Some((sw, rest)) => (sw.to_owned(), rest.trim().to_owned()),
            None => (main_part.to_owned(), String::new()),
        };
        if software.is_empty() {
            return Err(SeedlinkError::InvalidResponse(format!(
                "empty HELLO banner: {line1:?}"
            )));
        }

        // Capabilities only come from the part after "::"
        let capabilities = match line1.find("::") {
            Some(idx) => CapabilitySet::parse(&line1[idx..]),
            None => CapabilitySet::parse(""),
        };

        Ok(Self::Hello {
            software,
            version,
            capabilities,
            organization: line2.to_owned(),
        })
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Ok => b"OK\r\n".to_vec(),
            Self::Error { code, description } => match (code, description.is_empty()) {
                (Some(c), true) => format!("ERROR {c}\r\n").into_bytes(),
                (Some(c), false) => format!("ERROR {c} {description}\r\n").into_bytes(),
                // v3 style: bare "ERROR"
                (None, true) => b"ERROR\r\n".to_vec(),
                (None, false) => format!("ERROR {description}\r\n").into_bytes(),
            },
            Self::Hello {
                software,
                version,
                capabilities,
                organization,
            } => {
                let tokens = capabilities.to_tokens();
                let line1 = if tokens.is_empty() {
                    format!("{software} {version}")
                } else {
                    format!("{software} {version} :: {tokens}")
                };
                format!("{line1}\r\n{organization}\r\n").into_bytes()
            }
            Self::End => b"END\r\n".to_vec(),
        }
    }

    /// Convert an `ERROR` response into the matching client-side error.
    pub fn into_error(self) -> Option<SeedlinkError> {
        match self {
            Self::Error { code, description } => Some(SeedlinkError::ServerError {
                code: code.map_or("ERROR", |c| c.as_str()).to_owned(),
                description,
            }),
            _ => None,
        }
    }

    fn parse_error(line: &str) -> Self {
        let after_error = line[5..].trim_start();

        let mut parts = after_error.splitn(2, ' ');
        let first_word = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("").to_owned();

        match ErrorCode::parse(first_word) {
            Some(code) => Self::Error {
                code: Some(code),
                description: rest,
            },
            // No recognized code: the whole remainder is the description
            None => Self::Error {
                code: None,
                description: after_error.to_owned(),
            },
        }
    }
}
