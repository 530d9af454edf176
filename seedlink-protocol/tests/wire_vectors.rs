//! Byte-level wire vectors for commands, responses, and frames.

use seedlink_mux_protocol::frame::{v3, v4};
use seedlink_mux_protocol::{
    Codec, Command, Decoded, Packet, PayloadFormat, PayloadSubformat, ProtocolVersion, RawFrame,
    Response, SequenceNumber, StationId, StreamKey, Timestamp,
};
use serde_json::{Value, json};

fn command_vectors() -> Value {
    json!([
        {"line": "HELLO", "v3": "HELLO\r\n", "v4": "HELLO\r\n"},
        {"line": "STATION ANMO IU", "v3": "STATION ANMO IU\r\n", "v4": "STATION IU_ANMO\r\n"},
        {"line": "STATION GE_*", "v3": "STATION * GE\r\n", "v4": "STATION GE_*\r\n"},
        {"line": "SELECT 00BHZ.D", "v3": "SELECT 00BHZ.D\r\n", "v4": "SELECT 00BHZ.D\r\n"},
        {"line": "DATA", "v3": "DATA\r\n", "v4": "DATA\r\n"},
        {"line": "DATA ALL", "v3": "DATA ALL\r\n", "v4": "DATA ALL\r\n"},
        {"line": "DATA 00002A", "v3": "DATA 00002A\r\n", "v4": "DATA 42\r\n"},
        {"line": "TIME 2024,1,15,0,0,0", "v3": "TIME 2024,1,15,0,0,0\r\n", "v4": null},
        {"line": "FETCH 00002A", "v3": "FETCH 00002A\r\n", "v4": null},
        {"line": "CAT", "v3": "CAT\r\n", "v4": null},
        {"line": "BATCH", "v3": "BATCH\r\n", "v4": null},
        {"line": "SLPROTO 4.0", "v3": null, "v4": "SLPROTO 4.0\r\n"},
        {"line": "ENDFETCH", "v3": null, "v4": "ENDFETCH\r\n"},
        {"line": "INFO STREAMS", "v3": "INFO STREAMS\r\n", "v4": "INFO STREAMS\r\n"},
        {"line": "END", "v3": "END\r\n", "v4": "END\r\n"},
        {"line": "BYE", "v3": "BYE\r\n", "v4": "BYE\r\n"}
    ])
}

#[test]
fn command_wire_forms() {
    for v in command_vectors().as_array().unwrap() {
        let line = v["line"].as_str().unwrap();
        let cmd = Command::parse(line).unwrap_or_else(|e| panic!("failed to parse {line:?}: {e}"));

        for (version, key) in [(ProtocolVersion::V3, "v3"), (ProtocolVersion::V4, "v4")] {
            match v[key].as_str() {
                Some(wire) => {
                    let bytes = cmd
                        .to_bytes(version)
                        .unwrap_or_else(|e| panic!("to_bytes({key}) failed for {line:?}: {e}"));
                    assert_eq!(std::str::from_utf8(&bytes).unwrap(), wire, "{key} wire for {line:?}");
                }
                None => assert!(cmd.to_bytes(version).is_err(), "{line:?} should fail for {key}"),
            }
        }
    }
}

#[test]
fn response_lines() {
    let vectors = json!([
        {"line": "OK", "code": null, "description": null},
        {"line": "ERROR", "code": null, "description": ""},
        {"line": "ERROR ARGUMENTS invalid pattern", "code": "ARGUMENTS", "description": "invalid pattern"},
        {"line": "ERROR UNEXPECTED", "code": "UNEXPECTED", "description": ""}
    ]);
    for v in vectors.as_array().unwrap() {
        let line = v["line"].as_str().unwrap();
        let resp = Response::parse_line(line).unwrap();
        match (&resp, v["description"].as_str()) {
            (Response::Ok, None) => {}
            (Response::Error { code, description }, Some(expected)) => {
                assert_eq!(code.map(|c| c.as_str()), v["code"].as_str(), "{line:?}");
                assert_eq!(description, expected, "{line:?}");
            }
            _ => panic!("unexpected parse of {line:?}: {resp:?}"),
        }
        assert_eq!(resp.to_bytes(), format!("{line}\r\n").into_bytes());
    }
}

#[test]
fn v3_data_frame_bytes() {
    let mut payload = [0u8; v3::PAYLOAD_LEN];
    payload[..6].copy_from_slice(b"000042");
    payload[6] = b'D';

    let frame = v3::write(SequenceNumber::new(0x0100_0042), &payload).unwrap();
    assert_eq!(&frame[..8], b"SL000042");
    assert_eq!(frame.len(), v3::FRAME_LEN);

    let raw = v3::parse(&frame).unwrap();
    assert_eq!(raw.sequence().value(), 0x42);
    assert_eq!(raw.payload(), &payload[..]);
}

#[test]
fn v3_info_header_bytes() {
    let frame = v3::write_info(true, b"<seedlink/>").unwrap();
    assert_eq!(&frame[..8], b"SLINFO *");
    let last = v3::write_info(false, b"").unwrap();
    assert_eq!(&last[..8], b"SLINFO  ");
    assert!(matches!(
        v3::parse(&frame).unwrap(),
        RawFrame::V3Info { more: true, .. }
    ));
}

#[test]
fn v4_frame_bytes() {
    // SE, '2', 'D', len=4, seq=258, idlen=7, "IU_ANMO", payload
    let expected = hex::decode(concat!(
        "5345", "32", "44", "04000000", "0201000000000000", "07",
        "49555f414e4d4f", "deadbeef"
    ))
    .unwrap();

    let frame = v4::write(
        PayloadFormat::MiniSeed2,
        PayloadSubformat::Data,
        SequenceNumber::new(258),
        "IU_ANMO",
        &[0xde, 0xad, 0xbe, 0xef],
    )
    .unwrap();
    assert_eq!(frame, expected);

    let (raw, consumed) = v4::parse(&frame).unwrap();
    assert_eq!(consumed, frame.len());
    assert_eq!(raw.station_id(), Some("IU_ANMO"));
    assert_eq!(raw.sequence().value(), 258);
}

#[test]
fn codec_decodes_a_mixed_v4_stream() {
    let key = StreamKey::new(StationId::new("XX", "ABC"), "00", "BHZ", 'D');
    let start = Timestamp::parse("2024-01-15T10:30:45Z").unwrap();
    let mut payload = vec![0u8; v3::PAYLOAD_LEN];
    key.write_mseed2_header(146, start, &mut payload);

    let mut wire = v4::write(
        PayloadFormat::MiniSeed2,
        PayloadSubformat::Data,
        SequenceNumber::new(146),
        "XX_ABC",
        &payload,
    )
    .unwrap();
    wire.extend_from_slice(b"END\r\n");

    let mut codec = Codec::new();
    codec.negotiate(ProtocolVersion::V4).unwrap();
    // Feed in uneven chunks
    let mut packets = Vec::new();
    for chunk in wire.chunks(97) {
        codec.extend(chunk);
        while let Decoded::Item(packet) = codec.decode_packet().unwrap() {
            packets.push(packet);
        }
    }

    assert_eq!(packets.len(), 2);
    match &packets[0] {
        Packet::Data(record) => {
            assert_eq!(record.key, key);
            assert_eq!(record.sequence.value(), 146);
            assert_eq!(record.start_time, start);
        }
        other => panic!("expected data, got {other:?}"),
    }
    assert_eq!(packets[1], Packet::End);
}
