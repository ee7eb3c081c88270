// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use proptest::prelude::*;
use serde_json::json;

fn roundtrip(env: &Envelope) -> Envelope {
    let frame = encode_frame(env).unwrap();
    decode_frame(&frame).unwrap()
}

#[test]
fn request_roundtrip() {
    let env = Envelope::Request {
        seq: 1,
        command: "exec".to_owned(),
        args: json!({"code": "print(1+2)"}),
        sid: Some(42),
        port: Some("COM3".to_owned()),
        timeout_ms: Some(10_000),
    };
    assert_eq!(roundtrip(&env), env);
}

#[test]
fn response_roundtrip() {
    let ok = Envelope::response_ok(7, json!({"output": "3\r\n"}));
    assert_eq!(roundtrip(&ok), ok);

    let err = Envelope::response_err(7, &crate::error::ReplError::busy("Connection COM3 is busy"));
    let back = roundtrip(&err);
    match back {
        Envelope::Response { seq, result, error } => {
            assert_eq!(seq, 7);
            assert!(result.is_none());
            assert_eq!(error.as_deref(), Some("Busy: Connection COM3 is busy"));
        }
        other => panic!("unexpected envelope: {other:?}"),
    }
}

#[test]
fn stream_bytes_roundtrip_and_decode() {
    let env = Envelope::stream_bytes(3, StreamType::Stdout, b"hello\r\n");
    let back = roundtrip(&env);
    match back {
        Envelope::Stream { stream_type: StreamType::Stdout, data: StreamData::Text(b64), .. } => {
            assert_eq!(decode_b64(&b64).unwrap(), b"hello\r\n");
        }
        other => panic!("unexpected envelope: {other:?}"),
    }
}

#[test]
fn progress_roundtrip() {
    let env = Envelope::stream_progress(
        9,
        ProgressEvent {
            current: 2,
            total: 5,
            file: Some("main.py".to_owned()),
            bytes: Some(8192),
            status: Some(ProgressStatus::Downloading),
        },
    );
    assert_eq!(roundtrip(&env), env);
}

#[test]
fn magic_mismatch_is_malformed() {
    let mut frame = encode_frame(&Envelope::Ack { seq: 1 }).unwrap();
    frame[0] = b'X';
    assert!(matches!(decode_frame(&frame), Err(DecodeError::Malformed(_))));
}

#[test]
fn wrong_version_is_malformed() {
    let mut frame = encode_frame(&Envelope::Ack { seq: 1 }).unwrap();
    frame[4] = 9;
    assert!(matches!(decode_frame(&frame), Err(DecodeError::Malformed(_))));
}

#[test]
fn truncated_frame_is_malformed() {
    let frame = encode_frame(&Envelope::Ack { seq: 1 }).unwrap();
    for cut in [0, 4, HEADER_LEN - 1, frame.len() - 1] {
        assert!(
            matches!(decode_frame(&frame[..cut]), Err(DecodeError::Malformed(_))),
            "cut at {cut} must be malformed"
        );
    }
}

#[test]
fn payload_at_limit_accepted_one_byte_over_rejected() {
    // Build a request whose serialized payload is exactly MAX_PAYLOAD_SIZE.
    let probe = Envelope::Request {
        seq: 1,
        command: "exec".to_owned(),
        args: json!({"code": ""}),
        sid: None,
        port: None,
        timeout_ms: None,
    };
    // Each added code char grows the payload by exactly one byte.
    let base = serde_json::to_vec(&probe).unwrap().len();
    let code = "a".repeat(MAX_PAYLOAD_SIZE - base);
    let at_limit = Envelope::Request {
        seq: 1,
        command: "exec".to_owned(),
        args: json!({ "code": code }),
        sid: None,
        port: None,
        timeout_ms: None,
    };
    let frame = encode_frame(&at_limit).unwrap();
    assert_eq!(frame.len(), HEADER_LEN + MAX_PAYLOAD_SIZE);
    assert_eq!(decode_frame(&frame).unwrap(), at_limit);

    let over = Envelope::Request {
        seq: 1,
        command: "exec".to_owned(),
        args: json!({ "code": format!("{code}a") }),
        sid: None,
        port: None,
        timeout_ms: None,
    };
    assert!(encode_frame(&over).is_err());
}

#[test]
fn oversize_incoming_frame_reports_seq() {
    // Hand-build a frame over the payload limit (encode_frame refuses to).
    let payload = format!(
        "{{\"seq\":77,\"type\":\"request\",\"command\":\"exec\",\"args\":{{\"code\":\"{}\"}}}}",
        "b".repeat(MAX_PAYLOAD_SIZE)
    );
    let mut frame = Vec::new();
    frame.extend_from_slice(MAGIC);
    frame.push(VERSION);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload.as_bytes());
    assert_eq!(decode_frame(&frame), Err(DecodeError::TooLarge { seq: Some(77) }));
}

proptest! {
    #[test]
    fn envelope_roundtrip_property(
        seq in any::<u32>(),
        command in "[a-z_]{1,24}",
        code in "[ -~]{0,256}",
        sid in proptest::option::of(any::<u64>()),
        port in proptest::option::of("[A-Za-z0-9/._-]{1,16}"),
    ) {
        let env = Envelope::Request {
            seq,
            command,
            args: json!({ "code": code }),
            sid,
            port,
            timeout_ms: None,
        };
        prop_assert_eq!(roundtrip(&env), env);
    }

    #[test]
    fn arbitrary_bytes_never_panic_decoder(data in proptest::collection::vec(any::<u8>(), 0..256)) {
        let _ = decode_frame(&data);
    }
}
