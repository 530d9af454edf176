//! INFO responses: XML documents for v3 sessions, JSON [`InfoDocument`]s for v4.

use std::fmt::Write as _;

use seedlink_mux_protocol::info::{ConnectionEntry, FormatInfo, IdInfo, StationInfo};
use seedlink_mux_protocol::{CapabilitySet, InfoDocument, InfoLevel};

/// Server identity shared by every INFO ID response.
#[derive(Clone, Debug)]
pub(crate) struct Identity {
    pub software: String,
    pub version: String,
    pub organization: String,
    pub started: String,
}

/// Escape XML special characters in attribute values.
fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

const XML_HEAD: &str = "<?xml version=\"1.0\"?>\n";

pub(crate) fn id_xml(identity: &Identity) -> String {
    format!(
        "{XML_HEAD}<seedlink software=\"{} {}\" organization=\"{}\" started=\"{}\"/>\n",
        xml_escape(&identity.software),
        xml_escape(&identity.version),
        xml_escape(&identity.organization),
        xml_escape(&identity.started),
    )
}

/// v3 sequence attributes are the low 24 bits in hex.
fn v3_seq(seq: u64) -> String {
    format!("{:06X}", seq & 0xFF_FFFF)
}

pub(crate) fn stations_xml(stations: &[StationInfo]) -> String {
    let mut xml = format!("{XML_HEAD}<seedlink>\n");
    for s in stations {
        let _ = writeln!(
            xml,
            "  <station name=\"{}\" network=\"{}\" description=\"{}\" begin_seq=\"{}\" end_seq=\"{}\" stream_check=\"enabled\"/>",
            xml_escape(&s.station),
            xml_escape(&s.network),
            xml_escape(&s.description),
            v3_seq(s.begin_seq),
            v3_seq(s.end_seq),
        );
    }
    xml.push_str("</seedlink>\n");
    xml
}

pub(crate) fn streams_xml(stations: &[StationInfo]) -> String {
    let mut xml = format!("{XML_HEAD}<seedlink>\n");
    for s in stations {
        let _ = writeln!(
            xml,
            "  <station name=\"{}\" network=\"{}\" description=\"{}\" begin_seq=\"{}\" end_seq=\"{}\">",
            xml_escape(&s.station),
            xml_escape(&s.network),
            xml_escape(&s.description),
            v3_seq(s.begin_seq),
            v3_seq(s.end_seq),
        );
        for st in &s.streams {
            let begin = st.begin_time.map(|t| t.to_display()).unwrap_or_default();
            let end = st.end_time.map(|t| t.to_display()).unwrap_or_default();
            let _ = writeln!(
                xml,
                "    <stream seedname=\"{}\" location=\"{}\" type=\"{}\" begin_time=\"{begin}\" end_time=\"{end}\" begin_recno=\"{}\" end_recno=\"{}\"/>",
                xml_escape(&st.channel),
                xml_escape(&st.location),
                xml_escape(&st.record_type),
                v3_seq(st.begin_seq),
                v3_seq(st.end_seq),
            );
        }
        xml.push_str("  </station>\n");
    }
    xml.push_str("</seedlink>\n");
    xml
}

pub(crate) fn connections_xml(connections: &[ConnectionEntry]) -> String {
    let mut xml = format!("{XML_HEAD}<seedlink>\n");
    for c in connections {
        let ua = c.useragent.as_deref().map(xml_escape).unwrap_or_default();
        let _ = writeln!(
            xml,
            "  <connection host=\"{}\" port=\"{}\" ctime=\"{}\" proto=\"{}\" useragent=\"{ua}\" state=\"{}\"/>",
            xml_escape(&c.host),
            c.port,
            xml_escape(&c.ctime),
            xml_escape(&c.proto),
            xml_escape(&c.state),
        );
    }
    xml.push_str("</seedlink>\n");
    xml
}

/// INFO GAPS: the retained ranges per station, with the evicted prefix
/// reported as a gap.
pub(crate) fn gaps_xml(stations: &[StationInfo]) -> String {
    let mut xml = format!("{XML_HEAD}<seedlink>\n");
    for s in stations {
        let _ = writeln!(
            xml,
            "  <station name=\"{}\" network=\"{}\">",
            xml_escape(&s.station),
            xml_escape(&s.network),
        );
        if s.begin_seq > 1 {
            let _ = writeln!(
                xml,
                "    <gap begin_seq=\"{}\" end_seq=\"{}\"/>",
                v3_seq(1),
                v3_seq(s.begin_seq - 1),
            );
        }
        xml.push_str("  </station>\n");
    }
    xml.push_str("</seedlink>\n");
    xml
}

/// Formats a server can emit, for INFO FORMATS.
pub(crate) fn formats() -> Vec<FormatInfo> {
    vec![
        FormatInfo {
            format: "2".to_owned(),
            subformat: ["D", "E", "C", "T", "L", "O"].map(String::from).to_vec(),
        },
        FormatInfo {
            format: "J".to_owned(),
            subformat: ["I", "R"].map(String::from).to_vec(),
        },
    ]
}

/// Build the v4 JSON document for `level`. Only the matching section is
/// populated. v3-only levels return `None`.
pub(crate) fn document(
    level: InfoLevel,
    identity: &Identity,
    stations: impl FnOnce(bool) -> Vec<StationInfo>,
    connections: impl FnOnce() -> Vec<ConnectionEntry>,
) -> Option<InfoDocument> {
    let mut doc = InfoDocument::default();
    match level {
        InfoLevel::Id => {
            doc.id = Some(IdInfo {
                software: identity.software.clone(),
                version: identity.version.clone(),
                organization: identity.organization.clone(),
                started: identity.started.clone(),
            });
        }
        InfoLevel::Stations => doc.station = stations(false),
        InfoLevel::Streams => doc.station = stations(true),
        InfoLevel::Connections => doc.connection = connections(),
        InfoLevel::Capabilities => {
            doc.capability = CapabilitySet::full()
                .to_tokens()
                .split_whitespace()
                .map(str::to_owned)
                .collect();
        }
        InfoLevel::Formats => doc.format = formats(),
        InfoLevel::Gaps | InfoLevel::All => return None,
    }
    Some(doc)
}

/// Build the v3 XML document for `level`. v4-only levels return `None`.
pub(crate) fn xml(
    level: InfoLevel,
    identity: &Identity,
    stations: impl FnOnce(bool) -> Vec<StationInfo>,
    connections: impl FnOnce() -> Vec<ConnectionEntry>,
) -> Option<String> {
    match level {
        InfoLevel::Id => Some(id_xml(identity)),
        InfoLevel::Stations => Some(stations_xml(&stations(false))),
        InfoLevel::Streams => Some(streams_xml(&stations(true))),
        InfoLevel::Connections => Some(connections_xml(&connections())),
        InfoLevel::Gaps => Some(gaps_xml(&stations(false))),
        InfoLevel::All => {
            let detail = stations(true);
            let mut xml = streams_xml(&detail);
            let conns = connections_xml(&connections());
            // Splice the connection list into the same <seedlink> element
            if let (Some(end), Some(body)) = (
                xml.rfind("</seedlink>"),
                conns.strip_prefix(XML_HEAD).and_then(|c| c.strip_prefix("<seedlink>\n")),
            ) {
                xml.truncate(end);
                xml.push_str(body);
            }
            Some(xml)
        }
        InfoLevel::Formats | InfoLevel::Capabilities => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seedlink_mux_protocol::Timestamp;
    use seedlink_mux_protocol::info::StreamInfo;

    fn identity() -> Identity {
        Identity {
            software: "SeedLink".into(),
            version: "v4.0".into(),
            organization: "seedlink-mux".into(),
            started: "2026/02/12 10:30:00".into(),
        }
    }

    fn anmo() -> StationInfo {
        StationInfo {
            network: "IU".into(),
            station: "ANMO".into(),
            description: String::new(),
            begin_seq: 4,
            end_seq: 5,
            streams: vec![
                StreamInfo {
                    location: "00".into(),
                    channel: "BHZ".into(),
                    record_type: "D".into(),
                    begin_seq: 4,
                    end_seq: 5,
                    begin_time: Some(Timestamp::from_unix_seconds(1_700_000_000)),
                    end_time: Some(Timestamp::from_unix_seconds(1_700_000_010)),
                },
                StreamInfo {
                    location: "00".into(),
                    channel: "BHN".into(),
                    record_type: "D".into(),
                    begin_seq: 5,
                    end_seq: 5,
                    begin_time: None,
                    end_time: None,
                },
            ],
        }
    }

    fn wlf() -> StationInfo {
        StationInfo {
            network: "GE".into(),
            station: "WLF".into(),
            description: String::new(),
            begin_seq: 1,
            end_seq: 0x1_000_002,
            streams: Vec::new(),
        }
    }

    #[test]
    fn xml_escape_special_chars() {
        assert_eq!(xml_escape("a&b<c>d\"e"), "a&amp;b&lt;c&gt;d&quot;e");
        assert_eq!(xml_escape("hello"), "hello");
    }

    #[test]
    fn id_xml_carries_identity() {
        let xml = id_xml(&identity());
        assert!(xml.contains("software=\"SeedLink v4.0\""));
        assert!(xml.contains("organization=\"seedlink-mux\""));
        assert!(xml.contains("started=\"2026/02/12 10:30:00\""));
    }

    #[test]
    fn stations_xml_uses_24_bit_hex() {
        let xml = stations_xml(&[anmo(), wlf()]);
        assert!(xml.contains("name=\"ANMO\" network=\"IU\""));
        assert!(xml.contains("begin_seq=\"000004\""));
        assert!(xml.contains("name=\"WLF\""));
        assert!(xml.contains("end_seq=\"000002\""));
    }

    #[test]
    fn streams_xml_nests_streams_per_station() {
        let xml = streams_xml(&[anmo(), wlf()]);
        assert_eq!(xml.matches("<station ").count(), 2);
        assert_eq!(xml.matches("</station>").count(), 2);
        assert!(xml.contains("seedname=\"BHZ\" location=\"00\" type=\"D\""));
        assert!(xml.contains("begin_time=\"2023/11/14 22:13:20\""));
        assert!(xml.contains("seedname=\"BHN\""));
    }

    #[test]
    fn gaps_xml_reports_evicted_prefix() {
        let xml = gaps_xml(&[anmo(), wlf()]);
        assert_eq!(xml.matches("<gap ").count(), 1);
        assert!(xml.contains("<gap begin_seq=\"000001\" end_seq=\"000003\"/>"));
    }

    #[test]
    fn connections_xml_lists_entries() {
        let entry = ConnectionEntry {
            host: "127.0.0.1".into(),
            port: 40000,
            ctime: "2026/02/12 10:30:00".into(),
            proto: "4.0".into(),
            useragent: Some("slink<1>".into()),
            state: "streaming".into(),
        };
        let xml = connections_xml(&[entry]);
        assert!(xml.contains("host=\"127.0.0.1\" port=\"40000\""));
        assert!(xml.contains("useragent=\"slink&lt;1&gt;\""));
        assert!(xml.contains("state=\"streaming\""));
    }

    #[test]
    fn all_xml_is_one_document() {
        let xml = xml(InfoLevel::All, &identity(), |_| vec![anmo()], Vec::new).unwrap();
        assert_eq!(xml.matches("<seedlink>").count(), 1);
        assert_eq!(xml.matches("</seedlink>").count(), 1);
        assert!(xml.contains("seedname=\"BHZ\""));
    }

    #[test]
    fn level_availability_per_version() {
        assert!(xml(InfoLevel::Formats, &identity(), |_| Vec::new(), Vec::new).is_none());
        assert!(document(InfoLevel::Gaps, &identity(), |_| Vec::new(), Vec::new).is_none());
    }

    #[test]
    fn document_populates_only_requested_section() {
        let doc = document(InfoLevel::Streams, &identity(), |streams| {
            assert!(streams);
            vec![anmo()]
        }, Vec::new)
        .unwrap();
        assert!(doc.id.is_none());
        assert_eq!(doc.station.len(), 1);
        assert_eq!(doc.station[0].streams.len(), 2);

        let doc = document(InfoLevel::Id, &identity(), |_| Vec::new(), Vec::new).unwrap();
        assert_eq!(doc.id.unwrap().organization, "seedlink-mux");
    }

    #[test]
    fn capabilities_and_formats_documents() {
        let doc = document(InfoLevel::Capabilities, &identity(), |_| Vec::new(), Vec::new).unwrap();
        assert!(doc.capability.contains(&"SLPROTO:4.0".to_owned()));
        assert!(doc.capability.contains(&"INFO:JSON".to_owned()));

        let doc = document(InfoLevel::Formats, &identity(), |_| Vec::new(), Vec::new).unwrap();
        assert_eq!(doc.format.len(), 2);
        assert_eq!(doc.format[1].subformat, vec!["I".to_owned(), "R".to_owned()]);
    }
}
