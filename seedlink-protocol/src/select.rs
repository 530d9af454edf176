//! Stream selection: STATION/SELECT patterns compiled into a matcher.
//!
//! Patterns use `*` (any run) and `?` (any one character) globs and match
//! case-sensitively. Two SELECT grammars are understood:
//!
//! - v3: `[!][LL]CCC[.T]`. One- and two-character channel patterns are
//!   padded on the left with `?` (`Z` selects `??Z`). `--` is the empty
//!   location.
//! - v4: `[!]LOC_B_S_SS[.FS]`. Band, source, and subsource form the
//!   channel; `F` is the payload format and `S` the subformat, which is
//!   matched against the record type.
//!
//! Includes are unioned, then `!` excludes are removed. A station with no
//! includes matches all of its streams.

use crate::command::Command;
use crate::error::{Result, SeedlinkError};
use crate::record::{StationId, StreamKey};
use crate::sequence::SequenceNumber;
use crate::time::{TimeWindow, Timestamp};
use crate::version::ProtocolVersion;

/// Glob match with `*` and `?`, case-sensitive.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let (p, t) = (pattern.as_bytes(), text.as_bytes());
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            // Let the last star absorb one more character
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&b| b == b'*')
}

fn is_glob(s: &str) -> bool {
    s.contains(['*', '?'])
}

fn validate(pattern: &str, part: &str, what: &str, extra: &[char]) -> Result<()> {
    if part.is_empty() {
        return Err(SeedlinkError::invalid_pattern(pattern, format!("empty {what}")));
    }
    match part
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '*' | '?') || extra.contains(c)))
    {
        Some(c) => Err(SeedlinkError::invalid_pattern(
            pattern,
            format!("invalid character {c:?} in {what}"),
        )),
        None => Ok(()),
    }
}

/// Pad a location code to two characters, as it appears in a SEED header.
fn header_location(location: &str) -> String {
    format!("{location:<2}")
}

/// One parsed SELECT pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectPattern {
    pub exclude: bool,
    /// Two-character location glob (space for blank), `None` for any.
    pub location: Option<String>,
    /// Three-element channel glob.
    pub channel: String,
    /// Payload format glob (v4 only).
    pub format: Option<char>,
    /// Record type glob.
    pub record_type: Option<char>,
}

impl SelectPattern {
    /// Parse a pattern in the grammar of `version`.
    ///
    /// A v4 session also accepts the v3 form when the pattern contains
    /// no `_`.
    pub fn parse(pattern: &str, version: ProtocolVersion) -> Result<Self> {
        let body = pattern.strip_prefix('!').unwrap_or(pattern);
        if version == ProtocolVersion::V4 && body.contains('_') {
            Self::parse_v4(pattern)
        } else {
            Self::parse_v3(pattern)
        }
    }

    /// Parse either grammar, choosing by the presence of `_`.
    pub fn parse_any(pattern: &str) -> Result<Self> {
        Self::parse(pattern, ProtocolVersion::V4)
    }

    fn parse_v3(pattern: &str) -> Result<Self> {
        let (exclude, body) = split_exclude(pattern);
        let (main, suffix) = split_suffix(body);

        let record_type = match suffix {
            None => None,
            Some(s) if s.chars().count() == 1 => s.chars().next(),
            Some(_) => {
                return Err(SeedlinkError::invalid_pattern(
                    pattern,
                    "type suffix must be one character",
                ));
            }
        };
        if let Some(t) = record_type {
            validate(pattern, &t.to_string(), "type", &[])?;
        }

        if !main.is_ascii() {
            return Err(SeedlinkError::invalid_pattern(pattern, "non-ASCII pattern"));
        }
        let (location, channel) = match main.len() {
            0 => return Err(SeedlinkError::invalid_pattern(pattern, "empty pattern")),
            1 => (None, format!("??{main}")),
            2 => (None, format!("?{main}")),
            3 => (None, main.to_owned()),
            4 => (Some(format!("?{}", &main[..1])), main[1..].to_owned()),
            5 => (Some(main[..2].to_owned()), main[2..].to_owned()),
            _ => return Err(SeedlinkError::invalid_pattern(pattern, "pattern too long")),
        };

        validate(pattern, &channel, "channel", &[])?;
        if let Some(loc) = &location {
            validate(pattern, loc, "location", &['-'])?;
        }

        Ok(Self {
            exclude,
            location: location.map(|l| l.replace('-', " ")),
            channel,
            format: None,
            record_type,
        })
    }

    fn parse_v4(pattern: &str) -> Result<Self> {
        let (exclude, body) = split_exclude(pattern);
        let (main, suffix) = split_suffix(body);

        let (format, record_type) = match suffix.map(|s| s.chars().collect::<Vec<_>>()) {
            None => (None, None),
            Some(cs) if cs.len() == 1 => (None, Some(cs[0])),
            Some(cs) if cs.len() == 2 => (Some(cs[0]), Some(cs[1])),
            Some(_) => {
                return Err(SeedlinkError::invalid_pattern(
                    pattern,
                    "format suffix must be one or two characters",
                ));
            }
        };
        for c in format.iter().chain(record_type.iter()) {
            validate(pattern, &c.to_string(), "format", &[])?;
        }

        let parts: Vec<&str> = main.split('_').collect();
        let (location, codes) = match parts.as_slice() {
            [loc, b, s, ss] => (Some(*loc), [*b, *s, *ss]),
            [b, s, ss] => (None, [*b, *s, *ss]),
            _ => {
                return Err(SeedlinkError::invalid_pattern(
                    pattern,
                    "expected LOC_B_S_SS or B_S_SS",
                ));
            }
        };
        for code in codes {
            validate(pattern, code, "channel", &[])?;
            if code.chars().count() != 1 {
                return Err(SeedlinkError::invalid_pattern(
                    pattern,
                    "band, source and subsource are single characters",
                ));
            }
        }

        let location = match location {
            None => None,
            Some("") => Some("  ".to_owned()),
            Some(loc) => {
                validate(pattern, loc, "location", &[])?;
                if loc.len() > 2 {
                    return Err(SeedlinkError::invalid_pattern(pattern, "location too long"));
                }
                if loc.contains('*') {
                    Some(loc.to_owned())
                } else {
                    Some(header_location(loc))
                }
            }
        };

        Ok(Self {
            exclude,
            location,
            channel: codes.concat(),
            format,
            record_type,
        })
    }

    /// Match a stream, ignoring the exclude flag.
    pub fn matches(&self, key: &StreamKey) -> bool {
        if !glob_match(&self.channel, &key.channel) {
            return false;
        }
        if let Some(loc) = &self.location
            && !glob_match(loc, &header_location(&key.location))
        {
            return false;
        }
        // Decoded records are miniSEED 2
        if let Some(f) = self.format
            && !glob_match(&f.to_string(), "2")
        {
            return false;
        }
        if let Some(t) = self.record_type
            && !glob_match(&t.to_string(), &key.record_type.to_string())
        {
            return false;
        }
        true
    }

    /// Render in the grammar of `version`.
    pub fn to_wire(&self, version: ProtocolVersion) -> String {
        let mut s = String::new();
        if self.exclude {
            s.push('!');
        }
        match version {
            ProtocolVersion::V3 => {
                if let Some(loc) = &self.location {
                    if loc.contains('*') {
                        s.push_str("??");
                    } else {
                        s.push_str(&loc.replace(' ', "-"));
                    }
                }
                s.push_str(&self.channel);
                if let Some(t) = self.record_type {
                    s.push('.');
                    s.push(t);
                }
            }
            ProtocolVersion::V4 => {
                let loc = self.location.as_deref().unwrap_or("*").trim_end();
                s.push_str(loc);
                for c in self.channel.chars() {
                    s.push('_');
                    s.push(c);
                }
                if self.record_type.is_some() || self.format.is_some() {
                    s.push('.');
                    s.push(self.format.unwrap_or('2'));
                    s.push(self.record_type.unwrap_or('*'));
                }
            }
        }
        s
    }
}

fn split_exclude(pattern: &str) -> (bool, &str) {
    match pattern.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, pattern),
    }
}

fn split_suffix(body: &str) -> (&str, Option<&str>) {
    match body.split_once('.') {
        Some((main, suffix)) => (main, Some(suffix)),
        None => (body, None),
    }
}

/// Network/station glob pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StationPattern {
    pub network: String,
    pub station: String,
}

impl StationPattern {
    pub fn new(network: &str, station: &str) -> Result<Self> {
        let network = network.to_ascii_uppercase();
        let station = station.to_ascii_uppercase();
        let text = format!("{network}_{station}");
        validate(&text, &network, "network", &[])?;
        validate(&text, &station, "station", &[])?;
        Ok(Self { network, station })
    }

    /// Parse `"NET_STA"`.
    pub fn parse(s: &str) -> Result<Self> {
        let (network, station) = s
            .split_once('_')
            .ok_or_else(|| SeedlinkError::invalid_pattern(s, "expected NET_STA"))?;
        Self::new(network, station)
    }

    pub fn exact(id: &StationId) -> Self {
        Self {
            network: id.network.clone(),
            station: id.station.clone(),
        }
    }

    pub fn matches(&self, id: &StationId) -> bool {
        glob_match(&self.network, &id.network) && glob_match(&self.station, &id.station)
    }

    pub fn is_wildcard(&self) -> bool {
        is_glob(&self.network) || is_glob(&self.station)
    }

    /// The concrete station id, when the pattern has no globs.
    pub fn as_station_id(&self) -> Option<StationId> {
        (!self.is_wildcard()).then(|| StationId::new(&self.network, &self.station))
    }
}

impl std::fmt::Display for StationPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.network, self.station)
    }
}

/// Where delivery starts for a station.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StartPoint {
    /// Only records appended from now on.
    #[default]
    Next,
    /// From the earliest retained record.
    All,
    /// Records with sequence greater than `after`. `time` is the start time
    /// of that record, used to disambiguate 24-bit v3 sequences.
    Sequence {
        after: SequenceNumber,
        time: Option<Timestamp>,
    },
    /// Records whose start time lies in the window.
    Time {
        start: Timestamp,
        end: Option<Timestamp>,
    },
}

impl StartPoint {
    /// Resume after the given record.
    pub fn after(sequence: SequenceNumber, time: Option<Timestamp>) -> Self {
        Self::Sequence {
            after: sequence,
            time,
        }
    }

    /// Time window implied by this start point, if any.
    pub fn window(&self) -> Option<TimeWindow> {
        match *self {
            Self::Time { start, end } => Some(TimeWindow { start, end }),
            _ => None,
        }
    }

    /// Interpret DATA/FETCH arguments.
    pub fn from_data_args(
        sequence: Option<SequenceNumber>,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
    ) -> Self {
        match (sequence, start) {
            (None, None) => Self::Next,
            (Some(seq), None) if seq == SequenceNumber::ALL_DATA => Self::All,
            (Some(seq), time) if seq != SequenceNumber::ALL_DATA && end.is_none() => {
                Self::Sequence { after: seq, time }
            }
            (_, Some(start)) => Self::Time { start, end },
            (Some(seq), None) => Self::Sequence {
                after: seq,
                time: None,
            },
        }
    }
}

/// Selection for one station pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StationSelector {
    pub station: StationPattern,
    pub patterns: Vec<SelectPattern>,
    pub start: StartPoint,
}

impl StationSelector {
    pub fn new(station: StationPattern) -> Self {
        Self {
            station,
            patterns: Vec::new(),
            start: StartPoint::Next,
        }
    }

    pub fn has_includes(&self) -> bool {
        self.patterns.iter().any(|p| !p.exclude)
    }

    /// Match a stream of a station already known to match `self.station`.
    pub fn matches_stream(&self, key: &StreamKey) -> bool {
        let included = !self.has_includes()
            || self
                .patterns
                .iter()
                .any(|p| !p.exclude && p.matches(key));
        included && !self.patterns.iter().any(|p| p.exclude && p.matches(key))
    }

    pub fn matches(&self, key: &StreamKey) -> bool {
        self.station.matches(&key.station) && self.matches_stream(key)
    }
}

/// A compiled subscription: one entry per station pattern.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    pub stations: Vec<StationSelector>,
}

impl Selector {
    /// Compile client-side selection strings of the form
    /// `NET_STA[:SEL[,SEL...]]`, e.g. `"IU_ANMO:BHZ,BHN"` or `"GE_*:BH?.D"`.
    pub fn compile<S: AsRef<str>>(specs: &[S], start: StartPoint) -> Result<Self> {
        let mut stations = Vec::with_capacity(specs.len());
        for spec in specs {
            let spec = spec.as_ref().trim();
            let (station, selects) = match spec.split_once(':') {
                Some((st, sel)) => (st, Some(sel)),
                None => (spec, None),
            };
            let mut entry = StationSelector::new(StationPattern::parse(station)?);
            entry.start = start;
            for sel in selects.into_iter().flat_map(|s| s.split(',')) {
                let sel = sel.trim();
                if !sel.is_empty() {
                    entry.patterns.push(SelectPattern::parse_any(sel)?);
                }
            }
            stations.push(entry);
        }
        Ok(Self { stations })
    }

    /// The first station entry matching `id`.
    pub fn station_entry(&self, id: &StationId) -> Option<&StationSelector> {
        self.stations.iter().find(|s| s.station.matches(id))
    }

    pub fn matches(&self, key: &StreamKey) -> bool {
        self.station_entry(&key.station)
            .is_some_and(|s| s.matches_stream(key))
    }

    pub fn matches_station(&self, id: &StationId) -> bool {
        self.station_entry(id).is_some()
    }

    /// Selection commands for `version`, without the final END/ENDFETCH.
    ///
    /// v4 requires a SELECT for every station, so an entry without patterns
    /// gets a match-all pattern.
    pub fn to_commands(&self, version: ProtocolVersion) -> Vec<Command> {
        let mut commands = Vec::new();
        for entry in &self.stations {
            commands.push(Command::Station {
                station: entry.station.station.clone(),
                network: entry.station.network.clone(),
            });
            for p in &entry.patterns {
                commands.push(Command::Select {
                    pattern: p.to_wire(version),
                });
            }
            if version == ProtocolVersion::V4 && entry.patterns.is_empty() {
                commands.push(Command::Select {
                    pattern: "*_*_*_*".into(),
                });
            }
            commands.push(start_command(entry.start, version));
        }
        commands
    }
}

fn start_command(start: StartPoint, version: ProtocolVersion) -> Command {
    match start {
        StartPoint::Next => Command::Data {
            sequence: None,
            start: None,
            end: None,
        },
        StartPoint::All => Command::Data {
            sequence: Some(SequenceNumber::ALL_DATA),
            start: None,
            end: None,
        },
        StartPoint::Sequence { after, time } => Command::Data {
            sequence: Some(after),
            start: time,
            end: None,
        },
        StartPoint::Time { start, end } => match version {
            ProtocolVersion::V3 => Command::Time { start, end },
            ProtocolVersion::V4 => Command::Data {
                sequence: None,
                start: Some(start),
                end,
            },
        },
    }
}

/// Accumulates STATION/SELECT/DATA/TIME commands on the server side.
///
/// SELECT and start commands apply to the most recent STATION. Before any
/// STATION (v3 uni-station mode) they apply to every station.
#[derive(Debug)]
pub struct SelectorBuilder {
    version: ProtocolVersion,
    stations: Vec<StationSelector>,
    uni: StationSelector,
}

impl SelectorBuilder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            stations: Vec::new(),
            uni: StationSelector::new(StationPattern {
                network: "*".into(),
                station: "*".into(),
            }),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    fn current(&mut self) -> &mut StationSelector {
        match self.stations.last_mut() {
            Some(entry) => entry,
            None => &mut self.uni,
        }
    }

    pub fn station(&mut self, network: &str, station: &str) -> Result<&StationPattern> {
        let pattern = StationPattern::new(network, station)?;
        self.stations.push(StationSelector::new(pattern));
        Ok(&self.current().station)
    }

    pub fn select(&mut self, pattern: &str) -> Result<()> {
        let version = self.version;
        if version == ProtocolVersion::V4 && self.stations.is_empty() {
            return Err(SeedlinkError::UnexpectedCommand {
                command: "SELECT",
                state: "no STATION",
            });
        }
        let parsed = SelectPattern::parse(pattern, version)?;
        self.current().patterns.push(parsed);
        Ok(())
    }

    pub fn start(&mut self, start: StartPoint) {
        self.current().start = start;
    }

    pub fn has_stations(&self) -> bool {
        !self.stations.is_empty()
    }

    /// The most recent STATION pattern, if any.
    pub fn last_station(&self) -> Option<&StationPattern> {
        self.stations.last().map(|s| &s.station)
    }

    /// Commit the selection.
    ///
    /// v4 requires at least one STATION, and a SELECT for each; the builder
    /// is left intact on error so the client can correct and retry.
    pub fn build(&self) -> Result<Selector> {
        match self.version {
            ProtocolVersion::V3 if self.stations.is_empty() => Ok(Selector {
                stations: vec![self.uni.clone()],
            }),
            ProtocolVersion::V3 => Ok(Selector {
                stations: self.stations.clone(),
            }),
            ProtocolVersion::V4 => {
                if self.stations.is_empty() {
                    return Err(SeedlinkError::InvalidCommand(
                        "no STATION selected".into(),
                    ));
                }
                if let Some(entry) = self.stations.iter().find(|s| !s.has_includes()) {
                    return Err(SeedlinkError::invalid_pattern(
                        &entry.station.to_string(),
                        "station has no SELECT",
                    ));
                }
                Ok(Selector {
                    stations: self.stations.clone(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(loc: &str, chan: &str, t: char) -> StreamKey {
        StreamKey::new(StationId::new("IU", "ANMO"), loc, chan, t)
    }

    fn v3(p: &str) -> SelectPattern {
        SelectPattern::parse(p, ProtocolVersion::V3).unwrap()
    }

    fn v4(p: &str) -> SelectPattern {
        SelectPattern::parse(p, ProtocolVersion::V4).unwrap()
    }

    #[test]
    fn glob_basics() {
        assert!(glob_match("BH?", "BHZ"));
        assert!(!glob_match("BH?", "BH"));
        assert!(glob_match("*", ""));
        assert!(glob_match("B*Z", "BHZ"));
        assert!(glob_match("B*Z", "BZ"));
        assert!(!glob_match("B*Z", "BHN"));
        assert!(glob_match("*A*B", "xxAyyAB"));
        assert!(!glob_match("bhz", "BHZ"));
    }

    #[test]
    fn v3_channel_only() {
        let pat = v3("BHZ");
        assert!(pat.location.is_none());
        assert!(pat.matches(&key("00", "BHZ", 'D')));
        assert!(pat.matches(&key("", "BHZ", 'D')));
        assert!(!pat.matches(&key("00", "BHN", 'D')));
    }

    #[test]
    fn v3_location_channel_and_type() {
        let pat = v3("00BHZ.D");
        assert!(pat.matches(&key("00", "BHZ", 'D')));
        assert!(!pat.matches(&key("10", "BHZ", 'D')));
        assert!(!pat.matches(&key("00", "BHZ", 'L')));
    }

    #[test]
    fn v3_padding_and_wildcards() {
        assert_eq!(v3("Z").channel, "??Z");
        assert_eq!(v3("HZ").channel, "?HZ");
        assert!(v3("??BHZ").matches(&key("", "BHZ", 'D')));
        assert!(v3("--BHZ").matches(&key("", "BHZ", 'D')));
        assert!(!v3("--BHZ").matches(&key("00", "BHZ", 'D')));
        assert!(v3("BH?").matches(&key("00", "BHE", 'D')));
    }

    #[test]
    fn v3_invalid() {
        for bad in ["", ".D", "00BHZX", "BH[Z", "BHZ.DD", "!"] {
            assert!(
                matches!(
                    SelectPattern::parse(bad, ProtocolVersion::V3),
                    Err(SeedlinkError::InvalidPattern { .. })
                ),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn v4_grammar() {
        let pat = v4("00_B_H_Z.2D");
        assert_eq!(pat.location.as_deref(), Some("00"));
        assert_eq!(pat.channel, "BHZ");
        assert_eq!(pat.format, Some('2'));
        assert_eq!(pat.record_type, Some('D'));
        assert!(pat.matches(&key("00", "BHZ", 'D')));
        assert!(!pat.matches(&key("00", "BHZ", 'E')));

        let any_loc = v4("*_B_H_?");
        assert!(any_loc.matches(&key("", "BHN", 'D')));
        assert!(any_loc.matches(&key("10", "BHE", 'D')));

        let empty_loc = v4("_L_H_Z");
        assert!(empty_loc.matches(&key("", "LHZ", 'D')));
        assert!(!empty_loc.matches(&key("00", "LHZ", 'D')));

        assert!(!v4("*_*_*_*.3D").matches(&key("00", "BHZ", 'D')));
    }

    #[test]
    fn v4_accepts_v3_form() {
        assert_eq!(v4("BHZ"), v3("BHZ"));
        assert!(SelectPattern::parse("B_HZ_Z", ProtocolVersion::V4).is_err());
        assert!(SelectPattern::parse("00_B_H", ProtocolVersion::V4).is_err());
    }

    #[test]
    fn wire_rendering_reparses() {
        for (src, version) in [
            ("00BHZ.D", ProtocolVersion::V3),
            ("!--LHZ", ProtocolVersion::V3),
            ("00_B_H_Z.2D", ProtocolVersion::V4),
            ("*_B_H_?", ProtocolVersion::V4),
        ] {
            let pat = SelectPattern::parse(src, version).unwrap();
            let wire = pat.to_wire(version);
            assert_eq!(SelectPattern::parse(&wire, version).unwrap(), pat, "{src}");
        }
        assert_eq!(v3("00BHZ.D").to_wire(ProtocolVersion::V4), "00_B_H_Z.2D");
        assert_eq!(v4("*_B_H_Z").to_wire(ProtocolVersion::V3), "??BHZ");
    }

    #[test]
    fn station_patterns() {
        let p = StationPattern::parse("GE_*").unwrap();
        assert!(p.is_wildcard());
        assert!(p.matches(&StationId::new("GE", "WLF")));
        assert!(!p.matches(&StationId::new("IU", "WLF")));
        assert!(StationPattern::parse("GEWLF").is_err());
        assert!(StationPattern::new("G E", "WLF").is_err());

        let exact = StationPattern::parse("iu_anmo").unwrap();
        assert_eq!(exact.as_station_id(), Some(StationId::new("IU", "ANMO")));
    }

    #[test]
    fn union_and_exclusion() {
        let sel = Selector::compile(&["IU_ANMO:BH?,LHZ,!BHE"], StartPoint::Next).unwrap();
        assert!(sel.matches(&key("00", "BHZ", 'D')));
        assert!(sel.matches(&key("00", "LHZ", 'D')));
        assert!(!sel.matches(&key("00", "BHE", 'D')));
        assert!(!sel.matches(&key("00", "VHZ", 'D')));

        let other = StreamKey::new(StationId::new("GE", "WLF"), "00", "BHZ", 'D');
        assert!(!sel.matches(&other));
    }

    #[test]
    fn empty_selection_matches_all_streams() {
        let sel = Selector::compile(&["IU_ANMO"], StartPoint::Next).unwrap();
        assert!(sel.matches(&key("00", "BHZ", 'D')));
        assert!(sel.matches(&key("", "LOG", 'L')));

        let only_excludes = Selector::compile(&["IU_ANMO:!LOG"], StartPoint::Next).unwrap();
        assert!(only_excludes.matches(&key("00", "BHZ", 'D')));
        assert!(!only_excludes.matches(&key("", "LOG", 'L')));
    }

    #[test]
    fn compile_rejects_bad_input() {
        assert!(Selector::compile(&["IUANMO"], StartPoint::Next).is_err());
        assert!(Selector::compile(&["IU_ANMO:BH[Z"], StartPoint::Next).is_err());
    }

    #[test]
    fn commands_per_version() {
        let sel = Selector::compile(
            &["IU_ANMO:00BHZ", "GE_WLF"],
            StartPoint::after(SequenceNumber::new(145), None),
        )
        .unwrap();

        let v3_cmds = sel.to_commands(ProtocolVersion::V3);
        let lines: Vec<String> = v3_cmds
            .iter()
            .map(|c| String::from_utf8(c.to_bytes(ProtocolVersion::V3).unwrap()).unwrap())
            .collect();
        assert_eq!(
            lines,
            vec![
                "STATION ANMO IU\r\n",
                "SELECT 00BHZ\r\n",
                "DATA 000091\r\n",
                "STATION WLF GE\r\n",
                "DATA 000091\r\n",
            ]
        );

        let v4_cmds = sel.to_commands(ProtocolVersion::V4);
        assert_eq!(
            v4_cmds[4],
            Command::Select {
                pattern: "*_*_*_*".into()
            }
        );
        assert_eq!(
            String::from_utf8(v4_cmds[2].to_bytes(ProtocolVersion::V4).unwrap()).unwrap(),
            "DATA 145\r\n"
        );
    }

    #[test]
    fn time_start_per_version() {
        let start = Timestamp::parse("2024-01-15T00:00:00Z").unwrap();
        let sel = Selector::compile(&["IU_ANMO"], StartPoint::Time { start, end: None }).unwrap();
        assert_eq!(
            sel.to_commands(ProtocolVersion::V3)[1],
            Command::Time { start, end: None }
        );
        assert_eq!(
            sel.to_commands(ProtocolVersion::V4)[2],
            Command::Data {
                sequence: None,
                start: Some(start),
                end: None
            }
        );
    }

    #[test]
    fn start_point_from_data_args() {
        let t = Timestamp::from_unix_seconds(100);
        let seq = SequenceNumber::new(5);
        assert_eq!(StartPoint::from_data_args(None, None, None), StartPoint::Next);
        assert_eq!(
            StartPoint::from_data_args(Some(SequenceNumber::ALL_DATA), None, None),
            StartPoint::All
        );
        assert_eq!(
            StartPoint::from_data_args(Some(seq), Some(t), None),
            StartPoint::after(seq, Some(t))
        );
        assert_eq!(
            StartPoint::from_data_args(Some(SequenceNumber::ALL_DATA), Some(t), None),
            StartPoint::Time {
                start: t,
                end: None
            }
        );
        assert_eq!(
            StartPoint::from_data_args(Some(seq), Some(t), Some(t)),
            StartPoint::Time {
                start: t,
                end: Some(t)
            }
        );
    }

    #[test]
    fn builder_v3_uni_station() {
        let mut b = SelectorBuilder::new(ProtocolVersion::V3);
        b.select("BHZ").unwrap();
        b.start(StartPoint::All);
        let sel = b.build().unwrap();
        assert_eq!(sel.stations.len(), 1);
        assert_eq!(sel.stations[0].start, StartPoint::All);
        assert!(sel.matches(&key("00", "BHZ", 'D')));
        assert!(!sel.matches(&key("00", "BHN", 'D')));
    }

    #[test]
    fn builder_v4_requires_select() {
        let mut b = SelectorBuilder::new(ProtocolVersion::V4);
        assert!(b.build().is_err());
        assert!(b.select("*_B_H_Z").is_err());

        b.station("IU", "ANMO").unwrap();
        assert!(matches!(
            b.build(),
            Err(SeedlinkError::InvalidPattern { .. })
        ));
        b.select("*_B_H_Z").unwrap();
        let sel = b.build().unwrap();
        assert!(sel.matches(&key("00", "BHZ", 'D')));
    }

    #[test]
    fn builder_invalid_pattern_is_recoverable() {
        let mut b = SelectorBuilder::new(ProtocolVersion::V3);
        b.station("ANMO", "IU").unwrap();
        let err = b.select("BH[").unwrap_err();
        assert!(!err.is_fatal());
        b.select("BHZ").unwrap();
        assert_eq!(b.build().unwrap().stations[0].patterns.len(), 1);
    }
}
