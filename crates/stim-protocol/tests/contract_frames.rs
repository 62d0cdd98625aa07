//! Golden frame vectors shared with the device firmware team.
//!
//! Each test pins exact on-wire bytes so neither side of the link can drift:
//! encoding must reproduce the vector bit-for-bit, and the parser must accept
//! it (or reject the corrupted variants) exactly as the bench traces show.

use stim_protocol::packet::encode_command;
use stim_protocol::{DeviceErrorCode, FrameError, FrameParser, OpCode, Packet, PacketType};

fn parse_all(bytes: &[u8]) -> (Vec<Packet>, Vec<FrameError>) {
    let mut parser = FrameParser::new();
    let mut packets = Vec::new();
    let mut errors = Vec::new();
    for &b in bytes {
        match parser.push(b) {
            Ok(Some(p)) => packets.push(p),
            Ok(None) => {}
            Err(e) => errors.push(e),
        }
    }
    (packets, errors)
}

#[test]
fn watchdog_reset_request_vector() {
    let frame = encode_command(0x07, OpCode::WatchdogReset, &[]).unwrap();
    assert_eq!(frame, [0xAA, 0x01, 0x02, 0x01, 0x07, 0x01, 0x02, 0x0E]);
}

#[test]
fn watchdog_reset_ack_vector() {
    let (packets, errors) = parse_all(&[0xAA, 0x01, 0x02, 0x01, 0x07, 0x01, 0x00, 0x0C]);
    assert!(errors.is_empty());
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].packet_type(), PacketType::Command);
    assert_eq!(packets[0].id(), 0x07);
    assert_eq!(packets[0].payload(), [0x00]);
}

#[test]
fn start_streaming_error_reply_vector() {
    // Device rejects a duplicate StartStreaming with ERR_ALREADY_STREAMING.
    let request = encode_command(0x08, OpCode::StartStreaming, &[]).unwrap();
    assert_eq!(request, [0xAA, 0x01, 0x02, 0x01, 0x08, 0x01, 0x03, 0x10]);

    let (packets, errors) = parse_all(&[0xAA, 0x01, 0x02, 0x00, 0x08, 0x01, 0x05, 0x11]);
    assert!(errors.is_empty());
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].packet_type(), PacketType::Error);
    assert_eq!(packets[0].id(), 0x08);
    assert_eq!(
        DeviceErrorCode::from(packets[0].payload()[0]),
        DeviceErrorCode::AlreadyStreaming
    );
}

#[test]
fn garbage_prefix_is_skipped() {
    let (packets, errors) = parse_all(&[
        0xFF, 0xFF, 0xAA, 0x01, 0x02, 0x01, 0x07, 0x01, 0x02, 0x0E,
    ]);
    assert!(errors.is_empty(), "stray bytes before sync are not errors");
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].id(), 0x07);
}

#[test]
fn corrupted_checksum_is_dropped() {
    let (packets, errors) = parse_all(&[0xAA, 0x01, 0x02, 0x01, 0x07, 0x01, 0x02, 0x0D]);
    assert!(packets.is_empty());
    assert_eq!(
        errors,
        vec![FrameError::ChecksumMismatch {
            computed: 0x0E,
            received: 0x0D
        }]
    );
}

#[test]
fn every_encoded_packet_reparses_identically() {
    let cases = [
        (PacketType::Command, 0u8, vec![0x01]),
        (PacketType::Command, 255, vec![0x02, 0xAA, 0x00]),
        (PacketType::Error, 17, vec![0x05]),
        (PacketType::StreamData, 90, vec![0x10, 0x27, 0x00, 0x00, 0x34, 0x12]),
    ];
    for (packet_type, id, payload) in cases {
        let packet = Packet::new(packet_type, id, payload).unwrap();
        let (packets, errors) = parse_all(&packet.encode());
        assert!(errors.is_empty());
        assert_eq!(packets, vec![packet]);
    }
}
