use std::fmt::{self, Write};
use std::str::SplitWhitespace;

use crate::error::{Result, SeedlinkError};
use crate::info::InfoLevel;
use crate::sequence::SequenceNumber;
use crate::time::Timestamp;
use crate::version::ProtocolVersion;

/// Default longest command line accepted, excluding the CRLF terminator.
pub const MAX_COMMAND_LEN: usize = 255;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    // Both v3 + v4
    Hello,
    Station {
        station: String,
        network: String,
    },
    Select {
        pattern: String,
    },
    /// `DATA [seq|ALL] [start [end]]`. `None` means "next" (live only);
    /// `ALL` is carried as [`SequenceNumber::ALL_DATA`].
    Data {
        sequence: Option<SequenceNumber>,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
    },
    End,
    Bye,
    Info {
        level: InfoLevel,
    },

    // v3 only
    Batch,
    Fetch {
        sequence: Option<SequenceNumber>,
        start: Option<Timestamp>,
    },
    Time {
        start: Timestamp,
        end: Option<Timestamp>,
    },
    Cat,

    // v4 only
    SlProto {
        version: ProtocolVersion,
    },
    Auth {
        value: String,
    },
    UserAgent {
        description: String,
    },
    EndFetch,
}

impl Command {
    /// Parse a command line without knowing the session version.
    ///
    /// A 6-digit hex token is read as a v3 sequence, anything else as v4
    /// decimal. Use [`Command::parse_for`] once the version is known.
    /// The line should NOT include the trailing `\r\n`.
    pub fn parse(line: &str) -> Result<Self> {
        Self::parse_with(line, None)
    }

    /// Parse a command line in the context of a negotiated version.
    pub fn parse_for(line: &str, version: ProtocolVersion) -> Result<Self> {
        Self::parse_with(line, Some(version))
    }

    fn parse_with(line: &str, version: Option<ProtocolVersion>) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut words = line.split_whitespace();
        let keyword = words
            .next()
            .ok_or_else(|| SeedlinkError::InvalidCommand("empty command".into()))?
            .to_ascii_uppercase();
        let mut args = Args {
            command: &keyword,
            words,
        };
        let seq = |s: &str| parse_sequence(s, version);

        let command = match keyword.as_str() {
            "HELLO" => Self::Hello,
            "END" => Self::End,
            "BYE" => Self::Bye,
            "BATCH" => Self::Batch,
            "CAT" => Self::Cat,
            "ENDFETCH" => Self::EndFetch,
            "STATION" => {
                let first = args.required("arguments")?;
                match args.optional() {
                    // v3 form: STATION STA NET
                    Some(net) => Self::Station {
                        station: first.to_owned(),
                        network: net.to_owned(),
                    },
                    None => {
                        let (net, sta) = first.split_once('_').ok_or_else(|| {
                            SeedlinkError::InvalidCommand(format!(
                                "STATION: expected 'STA NET' or 'NET_STA', got {first:?}"
                            ))
                        })?;
                        Self::Station {
                            station: sta.to_owned(),
                            network: net.to_owned(),
                        }
                    }
                }
            }
            "SELECT" => Self::Select {
                pattern: args.required("a pattern")?.to_owned(),
            },
            "DATA" => Self::Data {
                sequence: args.optional().map(seq).transpose()?,
                start: args.optional().map(Timestamp::parse).transpose()?,
                end: args.optional().map(Timestamp::parse).transpose()?,
            },
            "FETCH" => Self::Fetch {
                sequence: args.optional().map(seq).transpose()?,
                start: args.optional().map(Timestamp::parse).transpose()?,
            },
            "TIME" => Self::Time {
                start: Timestamp::parse(args.required("start")?)?,
                end: args.optional().map(Timestamp::parse).transpose()?,
            },
            "INFO" => Self::Info {
                level: InfoLevel::parse(args.required("a level")?)?,
            },
            "SLPROTO" => Self::SlProto {
                version: ProtocolVersion::parse(args.required("version")?)?,
            },
            // Free text; AUTH USERPASS carries two words.
            "AUTH" => Self::Auth {
                value: args.rest("a value")?,
            },
            "USERAGENT" => Self::UserAgent {
                description: args.rest("a description")?,
            },
            _ => {
                return Err(SeedlinkError::InvalidCommand(format!(
                    "unknown command: {keyword:?}"
                )));
            }
        };
        args.finish()?;
        Ok(command)
    }

    /// Serialize to wire bytes for the given protocol version.
    ///
    /// Returns `Err(VersionMismatch)` if the command is not valid for the version.
    pub fn to_bytes(&self, version: ProtocolVersion) -> Result<Vec<u8>> {
        if !self.is_valid_for(version) {
            return Err(SeedlinkError::VersionMismatch {
                command: self.name(),
                version,
            });
        }
        let line = self.format_line(version);
        Ok(format!("{line}\r\n").into_bytes())
    }

    /// Check if this command is valid for the given protocol version.
    pub fn is_valid_for(&self, version: ProtocolVersion) -> bool {
        match self {
            Self::Hello
            | Self::Station { .. }
            | Self::Select { .. }
            | Self::Data { .. }
            | Self::End
            | Self::Bye
            | Self::Info { .. } => true,
            Self::Batch | Self::Fetch { .. } | Self::Time { .. } | Self::Cat => {
                version == ProtocolVersion::V3
            }
            Self::SlProto { .. } | Self::Auth { .. } | Self::UserAgent { .. } | Self::EndFetch => {
                version == ProtocolVersion::V4
            }
        }
    }

    /// Upper-case keyword of this command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Station { .. } => "STATION",
            Self::Select { .. } => "SELECT",
            Self::Data { .. } => "DATA",
            Self::End => "END",
            Self::Bye => "BYE",
            Self::Info { .. } => "INFO",
            Self::Batch => "BATCH",
            Self::Fetch { .. } => "FETCH",
            Self::Time { .. } => "TIME",
            Self::Cat => "CAT",
            Self::SlProto { .. } => "SLPROTO",
            Self::Auth { .. } => "AUTH",
            Self::UserAgent { .. } => "USERAGENT",
            Self::EndFetch => "ENDFETCH",
        }
    }

    fn format_line(&self, version: ProtocolVersion) -> String {
        let mut line = self.name().to_owned();
        // Infallible for String.
        let _ = match self {
            Self::Hello
            | Self::End
            | Self::Bye
            | Self::Batch
            | Self::Cat
            | Self::EndFetch => Ok(()),
            Self::Station { station, network } => match version {
                ProtocolVersion::V3 => write!(line, " {station} {network}"),
                ProtocolVersion::V4 => write!(line, " {network}_{station}"),
            },
            Self::Select { pattern } => write!(line, " {pattern}"),
            Self::Data {
                sequence,
                start,
                end,
            } => write_position(&mut line, true, *sequence, &[*start, *end], version),
            Self::Fetch { sequence, start } => {
                write_position(&mut line, true, *sequence, &[*start], version)
            }
            Self::Time { start, end } => {
                write_position(&mut line, false, None, &[Some(*start), *end], version)
            }
            Self::Info { level } => write!(line, " {}", level.as_str()),
            Self::SlProto { version: v } => write!(line, " {v}"),
            Self::Auth { value } => write!(line, " {value}"),
            Self::UserAgent { description } => write!(line, " {description}"),
        };
        line
    }
}

/// Remaining words of a command line.
struct Args<'a> {
    command: &'a str,
    words: SplitWhitespace<'a>,
}

impl<'a> Args<'a> {
    fn optional(&mut self) -> Option<&'a str> {
        self.words.next()
    }

    fn required(&mut self, what: &str) -> Result<&'a str> {
        self.words.next().ok_or_else(|| {
            SeedlinkError::InvalidCommand(format!("{} requires {what}", self.command))
        })
    }

    fn rest(&mut self, what: &str) -> Result<String> {
        let rest: Vec<&str> = self.words.by_ref().collect();
        if rest.is_empty() {
            return Err(SeedlinkError::InvalidCommand(format!(
                "{} requires {what}",
                self.command
            )));
        }
        Ok(rest.join(" "))
    }

    fn finish(mut self) -> Result<()> {
        match self.words.next() {
            Some(_) => Err(SeedlinkError::InvalidCommand(format!(
                "{}: unexpected extra arguments",
                self.command
            ))),
            None => Ok(()),
        }
    }
}

/// Append `[seq] [times...]`. With `seq_slot` set, a time without a
/// sequence still needs the `ALL` placeholder.
fn write_position(
    line: &mut String,
    seq_slot: bool,
    sequence: Option<SequenceNumber>,
    times: &[Option<Timestamp>],
    version: ProtocolVersion,
) -> fmt::Result {
    let placeholder = seq_slot && times.iter().any(Option::is_some);
    let sequence = sequence.or(placeholder.then_some(SequenceNumber::ALL_DATA));
    if let Some(seq) = sequence {
        write!(line, " {}", format_sequence(seq, version))?;
    }
    for t in times.iter().flatten() {
        write!(line, " {}", format_time(*t, version))?;
    }
    Ok(())
}

/// Parse a sequence token. `ALL` maps to [`SequenceNumber::ALL_DATA`].
fn parse_sequence(s: &str, version: Option<ProtocolVersion>) -> Result<SequenceNumber> {
    if s.eq_ignore_ascii_case("ALL") {
        return Ok(SequenceNumber::ALL_DATA);
    }
    match version {
        Some(ProtocolVersion::V3) => SequenceNumber::from_v3_hex(s),
        Some(ProtocolVersion::V4) => SequenceNumber::from_v4_decimal(s),
        // Without a version, exactly 6 hex chars reads as v3
        None if s.len() == 6 && s.chars().all(|c| c.is_ascii_hexdigit()) => {
            SequenceNumber::from_v3_hex(s)
        }
        None => SequenceNumber::from_v4_decimal(s),
    }
}

fn format_sequence(seq: SequenceNumber, version: ProtocolVersion) -> String {
    if seq == SequenceNumber::ALL_DATA {
        return "ALL".into();
    }
    match version {
        ProtocolVersion::V3 => seq.to_v3_wire().to_v3_hex(),
        ProtocolVersion::V4 => seq.to_v4_decimal(),
    }
}

fn format_time(t: Timestamp, version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::V3 => t.to_time_command(),
        ProtocolVersion::V4 => t.to_iso(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> Timestamp {
        Timestamp::parse(s).unwrap()
    }

    #[test]
    fn parse_hello_case_insensitive() {
        assert_eq!(Command::parse("HELLO").unwrap(), Command::Hello);
        assert_eq!(Command::parse("hello").unwrap(), Command::Hello);
    }

    #[test]
    fn parse_station_both_forms() {
        let expected = Command::Station {
            station: "ANMO".into(),
            network: "IU".into(),
        };
        assert_eq!(Command::parse("STATION ANMO IU").unwrap(), expected);
        assert_eq!(Command::parse("STATION IU_ANMO").unwrap(), expected);
        assert!(Command::parse("STATION ANMO").is_err());
        assert!(Command::parse("STATION").is_err());
    }

    #[test]
    fn parse_select() {
        assert_eq!(
            Command::parse("SELECT 00BHZ.D").unwrap(),
            Command::Select {
                pattern: "00BHZ.D".into()
            }
        );
        assert!(Command::parse("SELECT").is_err());
        assert!(Command::parse("SELECT a b").is_err());
    }

    #[test]
    fn parse_data_variants() {
        assert_eq!(
            Command::parse("DATA").unwrap(),
            Command::Data {
                sequence: None,
                start: None,
                end: None
            }
        );
        assert_eq!(
            Command::parse("DATA 00001A").unwrap(),
            Command::Data {
                sequence: Some(SequenceNumber::new(26)),
                start: None,
                end: None
            }
        );
        assert_eq!(
            Command::parse("DATA ALL").unwrap(),
            Command::Data {
                sequence: Some(SequenceNumber::ALL_DATA),
                start: None,
                end: None
            }
        );
        assert_eq!(
            Command::parse("DATA 145 2024-01-15T00:00:00Z").unwrap(),
            Command::Data {
                sequence: Some(SequenceNumber::new(145)),
                start: Some(ts("2024-01-15T00:00:00Z")),
                end: None
            }
        );
    }

    #[test]
    fn parse_for_disambiguates_radix() {
        let v3 = Command::parse_for("DATA 000145", ProtocolVersion::V3).unwrap();
        let v4 = Command::parse_for("DATA 000145", ProtocolVersion::V4).unwrap();
        assert!(matches!(v3, Command::Data { sequence: Some(s), .. } if s.value() == 0x145));
        assert!(matches!(v4, Command::Data { sequence: Some(s), .. } if s.value() == 145));
        assert!(Command::parse_for("DATA 99", ProtocolVersion::V3).is_err());
    }

    #[test]
    fn parse_data_bad_time() {
        assert!(matches!(
            Command::parse("DATA 000001 notatime"),
            Err(SeedlinkError::InvalidTime(_))
        ));
    }

    #[test]
    fn parse_info() {
        assert_eq!(
            Command::parse("INFO STREAMS").unwrap(),
            Command::Info {
                level: InfoLevel::Streams
            }
        );
        assert!(Command::parse("INFO").is_err());
        assert!(Command::parse("INFO NOPE").is_err());
    }

    #[test]
    fn parse_fetch_and_time() {
        assert_eq!(
            Command::parse("FETCH").unwrap(),
            Command::Fetch {
                sequence: None,
                start: None
            }
        );
        assert_eq!(
            Command::parse("TIME 2024,1,15,0,0,0 2024,1,16,0,0,0").unwrap(),
            Command::Time {
                start: ts("2024,1,15,0,0,0"),
                end: Some(ts("2024,1,16,0,0,0")),
            }
        );
        assert!(Command::parse("TIME").is_err());
    }

    #[test]
    fn parse_v4_only_commands() {
        assert_eq!(
            Command::parse("SLPROTO 4.0").unwrap(),
            Command::SlProto {
                version: ProtocolVersion::V4
            }
        );
        assert!(matches!(
            Command::parse("SLPROTO 9.9"),
            Err(SeedlinkError::UnsupportedVersion(_))
        ));
        assert_eq!(
            Command::parse("AUTH USERPASS user secret").unwrap(),
            Command::Auth {
                value: "USERPASS user secret".into()
            }
        );
        assert_eq!(
            Command::parse("USERAGENT slinktool/4.3 libslink/2.7").unwrap(),
            Command::UserAgent {
                description: "slinktool/4.3 libslink/2.7".into()
            }
        );
        assert_eq!(Command::parse("ENDFETCH").unwrap(), Command::EndFetch);
    }

    #[test]
    fn parse_errors() {
        assert!(Command::parse("").is_err());
        assert!(Command::parse("   ").is_err());
        assert!(matches!(
            Command::parse("FOOBAR"),
            Err(SeedlinkError::InvalidCommand(_))
        ));
        assert!(Command::parse("END now").is_err());
    }

    #[test]
    fn parse_trailing_crlf() {
        assert_eq!(Command::parse("BYE\r\n").unwrap(), Command::Bye);
    }

    #[test]
    fn to_bytes_station() {
        let cmd = Command::Station {
            station: "ANMO".into(),
            network: "IU".into(),
        };
        assert_eq!(
            cmd.to_bytes(ProtocolVersion::V3).unwrap(),
            b"STATION ANMO IU\r\n"
        );
        assert_eq!(
            cmd.to_bytes(ProtocolVersion::V4).unwrap(),
            b"STATION IU_ANMO\r\n"
        );
    }

    #[test]
    fn to_bytes_data_per_version() {
        let cmd = Command::Data {
            sequence: Some(SequenceNumber::new(0x1_00_00_2A)),
            start: Some(ts("2024,1,15,10,30,45")),
            end: None,
        };
        assert_eq!(
            cmd.to_bytes(ProtocolVersion::V3).unwrap(),
            b"DATA 00002A 2024,1,15,10,30,45\r\n"
        );
        assert_eq!(
            cmd.to_bytes(ProtocolVersion::V4).unwrap(),
            b"DATA 16777258 2024-01-15T10:30:45Z\r\n"
        );
    }

    #[test]
    fn to_bytes_time_without_sequence_uses_all() {
        let cmd = Command::Data {
            sequence: None,
            start: Some(ts("2024-01-15T00:00:00Z")),
            end: Some(ts("2024-01-16T00:00:00Z")),
        };
        assert_eq!(
            cmd.to_bytes(ProtocolVersion::V4).unwrap(),
            b"DATA ALL 2024-01-15T00:00:00Z 2024-01-16T00:00:00Z\r\n"
        );
    }

    #[test]
    fn version_mismatch() {
        assert!(matches!(
            Command::Batch.to_bytes(ProtocolVersion::V4),
            Err(SeedlinkError::VersionMismatch { command: "BATCH", .. })
        ));
        assert!(
            Command::SlProto {
                version: ProtocolVersion::V4
            }
            .to_bytes(ProtocolVersion::V3)
            .is_err()
        );
        assert!(Command::Cat.is_valid_for(ProtocolVersion::V3));
        assert!(!Command::EndFetch.is_valid_for(ProtocolVersion::V3));
        assert!(Command::Hello.is_valid_for(ProtocolVersion::V4));
    }

    #[test]
    fn encode_decode_identity() {
        let commands = vec![
            (ProtocolVersion::V3, Command::Hello),
            (
                ProtocolVersion::V3,
                Command::Data {
                    sequence: Some(SequenceNumber::new(0xABCDEF)),
                    start: None,
                    end: None,
                },
            ),
            (
                ProtocolVersion::V3,
                Command::Time {
                    start: ts("2024,1,15,0,0,0"),
                    end: None,
                },
            ),
            (
                ProtocolVersion::V3,
                Command::Fetch {
                    sequence: Some(SequenceNumber::new(5)),
                    start: None,
                },
            ),
            (
                ProtocolVersion::V4,
                Command::Data {
                    sequence: Some(SequenceNumber::ALL_DATA),
                    start: None,
                    end: None,
                },
            ),
            (
                ProtocolVersion::V4,
                Command::Info {
                    level: InfoLevel::Capabilities,
                },
            ),
            (
                ProtocolVersion::V4,
                Command::UserAgent {
                    description: "client/1.0".into(),
                },
            ),
        ];
        for (version, cmd) in commands {
            let wire = cmd.to_bytes(version).unwrap();
            let line = std::str::from_utf8(&wire).unwrap();
            assert_eq!(Command::parse_for(line, version).unwrap(), cmd, "{line:?}");
        }
    }
}
