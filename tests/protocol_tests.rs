//! Integration tests for framing and the encrypted codec

use pyengine::protocol::{
    self, crypto, crypto::SecretKey, Command, Decoded, FrameDecoder, OperationKind,
    ProtocolError, Response, MAX_FRAME_SIZE,
};
use serde_json::json;

fn test_key() -> SecretKey {
    SecretKey::from_bytes([7u8; 32])
}

#[test]
fn sealed_response_roundtrip() {
    let key = test_key();
    let mut response = Response::success("E1");
    response.installed_packages = Some(vec!["requests".to_string()]);

    let frame = protocol::seal(&response, &key).expect("seal failed");
    let mut decoder = FrameDecoder::new();
    decoder.extend(&frame);

    let body = match decoder.next_frame() {
        Decoded::Frame(body) => body,
        other => panic!("Expected a frame, got {:?}", other),
    };
    let decoded: Response = protocol::open(&body, &key).expect("open failed");

    assert_eq!(decoded.status, "success");
    assert_eq!(decoded.execution_id.as_deref(), Some("E1"));
    assert_eq!(
        decoded.installed_packages,
        Some(vec!["requests".to_string()])
    );
    assert!(matches!(decoder.next_frame(), Decoded::NeedMore));
}

#[test]
fn decoder_reassembles_split_frames() {
    let key = test_key();
    let first = protocol::seal(&Response::success("A"), &key).unwrap();
    let second = protocol::seal(&Response::success("B"), &key).unwrap();

    let mut decoder = FrameDecoder::new();

    // Feed everything except the last byte of the second frame.
    let mut stream = first.clone();
    stream.extend_from_slice(&second);
    decoder.extend(&stream[..stream.len() - 1]);

    let body = match decoder.next_frame() {
        Decoded::Frame(body) => body,
        other => panic!("Expected first frame, got {:?}", other),
    };
    let a: Response = protocol::open(&body, &key).unwrap();
    assert_eq!(a.execution_id.as_deref(), Some("A"));

    assert!(matches!(decoder.next_frame(), Decoded::NeedMore));

    decoder.extend(&stream[stream.len() - 1..]);
    let body = match decoder.next_frame() {
        Decoded::Frame(body) => body,
        other => panic!("Expected second frame, got {:?}", other),
    };
    let b: Response = protocol::open(&body, &key).unwrap();
    assert_eq!(b.execution_id.as_deref(), Some("B"));
}

#[test]
fn zero_length_frame_is_fatal() {
    let mut decoder = FrameDecoder::new();
    decoder.extend(&0u32.to_be_bytes());
    assert!(matches!(
        decoder.next_frame(),
        Decoded::Fatal(ProtocolError::EmptyFrame)
    ));
    assert_eq!(decoder.buffered(), 0);
}

#[test]
fn oversized_frame_is_fatal() {
    let mut decoder = FrameDecoder::new();
    decoder.extend(&(MAX_FRAME_SIZE + 1).to_be_bytes());
    decoder.extend(&[0u8; 32]);
    assert!(matches!(
        decoder.next_frame(),
        Decoded::Fatal(ProtocolError::FrameTooLarge { .. })
    ));
    assert_eq!(decoder.buffered(), 0);
}

#[test]
fn frame_at_exactly_max_size_is_accepted() {
    // The header passes the size check; with only a partial body buffered
    // the decoder asks for more instead of disconnecting.
    let mut decoder = FrameDecoder::new();
    decoder.extend(&MAX_FRAME_SIZE.to_be_bytes());
    decoder.extend(&[0u8; 64]);
    assert!(matches!(decoder.next_frame(), Decoded::NeedMore));
}

#[test]
fn one_byte_frame_is_accepted() {
    let mut decoder = FrameDecoder::new();
    decoder.extend(&1u32.to_be_bytes());
    decoder.extend(&[0xAB]);
    match decoder.next_frame() {
        Decoded::Frame(body) => assert_eq!(body, vec![0xAB]),
        other => panic!("Expected a frame, got {:?}", other),
    }
}

#[test]
fn short_ciphertext_is_a_recoverable_error() {
    let key = test_key();
    let body = vec![0u8; 10];
    assert!(matches!(
        protocol::open::<Response>(&body, &key),
        Err(ProtocolError::TruncatedCiphertext)
    ));
}

#[test]
fn misaligned_ciphertext_fails_decryption() {
    let key = test_key();
    // 16 IV bytes plus a ciphertext that is not a whole number of blocks.
    let mut body = vec![0u8; 16];
    body.extend_from_slice(&[1u8; 20]);
    assert!(matches!(
        protocol::open::<Response>(&body, &key),
        Err(ProtocolError::DecryptFailed)
    ));
}

#[test]
fn non_json_plaintext_is_malformed() {
    let key = test_key();
    let body = crypto::encrypt(b"not json at all", &key);
    assert!(matches!(
        protocol::open::<Response>(&body, &key),
        Err(ProtocolError::MalformedMessage(_))
    ));
}

#[test]
fn endpoint_name_is_deterministic() {
    let a = crypto::endpoint_name();
    let b = crypto::endpoint_name();
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn independently_derived_keys_interoperate() {
    let sender = SecretKey::derive();
    let receiver = SecretKey::derive();

    let body = crypto::encrypt(b"hello", &sender);
    let plain = protocol::open_bytes(&body, &receiver).expect("decrypt failed");
    assert_eq!(plain, b"hello");
}

#[test]
fn fresh_ivs_differ_between_frames() {
    let key = test_key();
    let first = crypto::encrypt(b"same plaintext", &key);
    let second = crypto::encrypt(b"same plaintext", &key);
    assert_ne!(first[..16], second[..16]);
}

#[test]
fn command_wire_shape_matches_protocol() {
    let value = json!({
        "command": "installPackage",
        "executionId": "E2",
        "package": "requests",
    });
    let command: Command = serde_json::from_value(value).expect("parse failed");
    match command {
        Command::InstallPackage {
            execution_id,
            package,
        } => {
            assert_eq!(execution_id, "E2");
            assert_eq!(package, "requests");
        }
        other => panic!("Wrong variant: {:?}", other),
    }

    let encoded = serde_json::to_value(Command::Execute {
        execution_id: "E1".to_string(),
        script: "print(1)".to_string(),
        arguments: vec![json!(5), json!("x")],
        timeout: 5000,
    })
    .unwrap();
    assert_eq!(encoded["command"], "execute");
    assert_eq!(encoded["executionId"], "E1");
    assert_eq!(encoded["timeout"], 5000);
}

#[test]
fn missing_optional_fields_default_to_empty() {
    let value = json!({ "command": "execute" });
    let command: Command = serde_json::from_value(value).expect("parse failed");
    match command {
        Command::Execute {
            execution_id,
            script,
            arguments,
            timeout,
        } => {
            assert!(execution_id.is_empty());
            assert!(script.is_empty());
            assert!(arguments.is_empty());
            assert_eq!(timeout, 0);
        }
        other => panic!("Wrong variant: {:?}", other),
    }
}

#[test]
fn operation_kind_status_mapping() {
    let kinds = [
        OperationKind::Install,
        OperationKind::Reinstall,
        OperationKind::Update,
        OperationKind::InstallLocal,
        OperationKind::UpdateLocal,
        OperationKind::Uninstall,
        OperationKind::UpgradeAll,
        OperationKind::Search,
    ];
    for kind in kinds {
        assert_eq!(OperationKind::from_status(kind.progress_status()), kind);
    }
    assert_eq!(
        OperationKind::from_status("somethingElse"),
        OperationKind::Search
    );
}

#[test]
fn response_terminal_detection() {
    assert!(Response::success("E").is_terminal());
    assert!(Response::error("boom", None).is_terminal());
    assert!(!Response::started("E", "go").is_terminal());
    assert!(!Response::progress("E", OperationKind::Install, "stage").is_terminal());
}
