//! Round-trip tests for the typed message layer.

use bytes::BytesMut;
use uuid::Uuid;

use super::codec::Frame;
use super::messages::*;
use crate::protocol::codec::{FrameDecoder, DEFAULT_MAX_FRAME};
use crate::protocol::types::{
    Capabilities, Cardinality, InputLanguage, OutputFormat, TransactionState,
};

fn decode_one(bytes: &BytesMut) -> Frame {
    let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME);
    dec.extend(bytes);
    let frame = dec.next_frame().unwrap().unwrap();
    assert!(dec.next_frame().unwrap().is_none(), "extra frame bytes");
    frame
}

fn client_round_trip(message: ClientMessage) {
    let mut buf = BytesMut::new();
    message.encode_into(&mut buf);
    let first = buf.clone();
    let decoded = ClientMessage::decode(&decode_one(&buf)).unwrap();
    assert_eq!(decoded, message);

    // encode(decode(frame)) == frame
    let mut again = BytesMut::new();
    decoded.encode_into(&mut again);
    assert_eq!(again, first);
}

fn server_round_trip(message: ServerMessage) {
    let mut buf = BytesMut::new();
    message.encode_into(&mut buf);
    let first = buf.clone();
    let decoded = ServerMessage::decode(&decode_one(&buf)).unwrap();
    assert_eq!(decoded, message);

    let mut again = BytesMut::new();
    decoded.encode_into(&mut again);
    assert_eq!(again, first);
}

fn sample_query_params() -> QueryParams {
    QueryParams {
        annotations: vec![("tag".into(), "\"test\"".into())],
        allowed_capabilities: Capabilities::MODIFICATIONS | Capabilities::TRANSACTION,
        compilation_flags: 3,
        implicit_limit: 100,
        input_language: InputLanguage::EdgeQl,
        output_format: OutputFormat::Binary,
        expected_cardinality: Cardinality::Many,
        command_text: "select Post { title }".into(),
        state_typedesc_id: Uuid::from_u128(0xa1a2),
        state_data: vec![1, 2, 3],
    }
}

#[test]
fn test_client_handshake_round_trip() {
    client_round_trip(ClientMessage::ClientHandshake {
        major_ver: 2,
        minor_ver: 0,
        params: vec![
            ("user".into(), "edgedb".into()),
            ("branch".into(), "main".into()),
        ],
        extensions: vec![ProtocolExtension {
            name: "notebook".into(),
            annotations: vec![],
        }],
    });
}

#[test]
fn test_sasl_round_trips() {
    client_round_trip(ClientMessage::AuthenticationSaslInitialResponse {
        method: "SCRAM-SHA-256".into(),
        sasl_data: b"n,,n=user,r=nonce".to_vec(),
    });
    client_round_trip(ClientMessage::AuthenticationSaslResponse {
        sasl_data: b"c=biws,r=nonce,p=proof".to_vec(),
    });
    server_round_trip(ServerMessage::AuthenticationSaslRequired {
        methods: vec!["SCRAM-SHA-256".into()],
    });
    server_round_trip(ServerMessage::AuthenticationSaslContinue {
        sasl_data: b"r=nonce,s=salt,i=4096".to_vec(),
    });
    server_round_trip(ServerMessage::AuthenticationSaslFinal {
        sasl_data: b"v=signature".to_vec(),
    });
    server_round_trip(ServerMessage::AuthenticationOk);
}

#[test]
fn test_parse_round_trip() {
    client_round_trip(ClientMessage::Parse(sample_query_params()));
}

#[test]
fn test_execute_round_trip() {
    client_round_trip(ClientMessage::Execute(ExecuteParams {
        query: sample_query_params(),
        input_typedesc_id: Uuid::from_u128(1),
        output_typedesc_id: Uuid::from_u128(2),
        arguments: vec![0, 0, 0, 1],
    }));
}

#[test]
fn test_empty_payload_messages() {
    client_round_trip(ClientMessage::Sync);
    client_round_trip(ClientMessage::Flush);
    client_round_trip(ClientMessage::Terminate);
    client_round_trip(ClientMessage::RestoreEof);
}

#[test]
fn test_dump_restore_round_trips() {
    client_round_trip(ClientMessage::Dump {
        annotations: vec![("compress".into(), "true".into())],
    });
    client_round_trip(ClientMessage::Restore {
        headers: vec![(0x0101, vec![9, 9])],
        jobs: 4,
        data: vec![1, 2, 3, 4],
    });
    client_round_trip(ClientMessage::RestoreBlock {
        block_data: vec![5, 6],
    });
}

#[test]
fn test_server_handshake_round_trip() {
    server_round_trip(ServerMessage::ServerHandshake {
        major_ver: 2,
        minor_ver: 0,
        extensions: vec![],
    });
}

#[test]
fn test_ready_for_command_round_trip() {
    for state in [
        TransactionState::NotInTransaction,
        TransactionState::InTransaction,
        TransactionState::InFailedTransaction,
    ] {
        server_round_trip(ServerMessage::ReadyForCommand {
            annotations: vec![],
            transaction_state: state,
        });
    }
}

#[test]
fn test_command_cycle_round_trips() {
    server_round_trip(ServerMessage::CommandDataDescription {
        annotations: vec![],
        capabilities: Capabilities::NONE,
        result_cardinality: Cardinality::One,
        input_typedesc_id: Uuid::from_u128(10),
        input_typedesc: vec![1],
        output_typedesc_id: Uuid::from_u128(11),
        output_typedesc: vec![2, 3],
    });
    server_round_trip(ServerMessage::Data {
        rows: vec![vec![0, 0, 0, 1], vec![]],
    });
    server_round_trip(ServerMessage::CommandComplete {
        annotations: vec![],
        capabilities: Capabilities::NONE,
        status: "SELECT".into(),
        state_typedesc_id: Uuid::nil(),
        state_data: vec![],
    });
    server_round_trip(ServerMessage::StateDataDescription {
        typedesc_id: Uuid::from_u128(77),
        typedesc: vec![4, 4],
    });
}

#[test]
fn test_parameter_status_and_key_data() {
    server_round_trip(ServerMessage::ParameterStatus {
        name: b"suggested_pool_concurrency".to_vec(),
        value: b"10".to_vec(),
    });
    server_round_trip(ServerMessage::ServerKeyData { data: [7u8; 32] });
}

#[test]
fn test_error_and_log_round_trips() {
    server_round_trip(ServerMessage::ErrorResponse {
        severity: 120,
        code: 0x04010000,
        message: "unexpected token".into(),
        attributes: vec![(0xFFF3, b"3".to_vec()), (0xFFF4, b"14".to_vec())],
    });
    server_round_trip(ServerMessage::LogMessage {
        severity: 80,
        code: 0xF0010000,
        text: "deprecated feature".into(),
        annotations: vec![],
    });
}

#[test]
fn test_unknown_tag_is_rejected() {
    let frame = Frame::new(0x7f, vec![]);
    assert!(matches!(
        ClientMessage::decode(&frame),
        Err(crate::errors::ProtocolError::UnknownMessageTag(0x7f))
    ));
}

#[test]
fn test_short_payload_is_rejected() {
    // Execute with only half of the fixed prefix present.
    let frame = Frame::new(TAG_EXECUTE, vec![0u8; 10]);
    assert!(ClientMessage::decode(&frame).is_err());
}

#[test]
fn test_trailing_garbage_is_rejected() {
    let mut buf = BytesMut::new();
    ClientMessage::Sync.encode_into(&mut buf);
    // Rebuild the frame with one extra payload byte.
    let frame = Frame::new(TAG_SYNC, vec![0u8]);
    assert!(ClientMessage::decode(&frame).is_err());
    drop(buf);
}
