//! Typed view of the wire protocol: one variant per message kind, with
//! total decoding and symmetric encoding.
//!
//! Tag assignments are frozen (protocol 2.0). The two directions use
//! separate discriminated unions because several tag bytes are reused
//! between them.

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use crate::errors::ProtocolError;
use crate::protocol::codec::Frame;
use crate::protocol::types::{
    Capabilities, Cardinality, InputLanguage, OutputFormat, TransactionState,
};
use crate::protocol::wire::{
    put_annotations, put_bytes, put_key_values, put_lstring, put_uuid, WireReader,
};

// Client -> server tags.
pub const TAG_CLIENT_HANDSHAKE: u8 = b'V';
pub const TAG_AUTH_SASL_INITIAL: u8 = b'p';
pub const TAG_AUTH_SASL_RESPONSE: u8 = b'r';
pub const TAG_PARSE: u8 = b'P';
pub const TAG_EXECUTE: u8 = b'O';
pub const TAG_SYNC: u8 = b'S';
pub const TAG_FLUSH: u8 = b'H';
pub const TAG_TERMINATE: u8 = b'X';
pub const TAG_DUMP: u8 = b'>';
pub const TAG_RESTORE: u8 = b'<';
pub const TAG_RESTORE_BLOCK: u8 = b'=';
pub const TAG_RESTORE_EOF: u8 = b'.';

// Server -> client tags.
pub const TAG_SERVER_HANDSHAKE: u8 = b'v';
pub const TAG_AUTHENTICATION: u8 = b'R';
pub const TAG_PARAMETER_STATUS: u8 = b'S';
pub const TAG_SERVER_KEY_DATA: u8 = b'K';
pub const TAG_READY_FOR_COMMAND: u8 = b'Z';
pub const TAG_COMMAND_DATA_DESCRIPTION: u8 = b'T';
pub const TAG_STATE_DATA_DESCRIPTION: u8 = b's';
pub const TAG_DATA: u8 = b'D';
pub const TAG_COMMAND_COMPLETE: u8 = b'C';
pub const TAG_ERROR_RESPONSE: u8 = b'E';
pub const TAG_LOG_MESSAGE: u8 = b'L';

// Authentication sub-statuses on the 'R' frame.
const AUTH_STATUS_OK: i32 = 0x0;
const AUTH_STATUS_SASL_REQUIRED: i32 = 0x0A;
const AUTH_STATUS_SASL_CONTINUE: i32 = 0x0B;
const AUTH_STATUS_SASL_FINAL: i32 = 0x0C;

/// Shared prefix of `Parse` and `Execute`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryParams {
    pub annotations: Vec<(String, String)>,
    pub allowed_capabilities: Capabilities,
    pub compilation_flags: u64,
    pub implicit_limit: u64,
    pub input_language: InputLanguage,
    pub output_format: OutputFormat,
    pub expected_cardinality: Cardinality,
    pub command_text: String,
    pub state_typedesc_id: Uuid,
    pub state_data: Vec<u8>,
}

impl QueryParams {
    fn decode(r: &mut WireReader<'_>) -> Result<QueryParams, ProtocolError> {
        Ok(QueryParams {
            annotations: r.get_annotations()?,
            allowed_capabilities: Capabilities(r.get_u64()?),
            compilation_flags: r.get_u64()?,
            implicit_limit: r.get_u64()?,
            input_language: InputLanguage::from_u8(r.get_u8()?)?,
            output_format: OutputFormat::from_u8(r.get_u8()?)?,
            expected_cardinality: Cardinality::from_u8(r.get_u8()?)?,
            command_text: r.get_lstring()?,
            state_typedesc_id: r.get_uuid()?,
            state_data: r.get_bytes()?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        put_annotations(buf, &self.annotations);
        buf.put_u64(self.allowed_capabilities.0);
        buf.put_u64(self.compilation_flags);
        buf.put_u64(self.implicit_limit);
        buf.put_u8(self.input_language as u8);
        buf.put_u8(self.output_format as u8);
        buf.put_u8(self.expected_cardinality as u8);
        put_lstring(buf, &self.command_text);
        put_uuid(buf, &self.state_typedesc_id);
        put_bytes(buf, &self.state_data);
    }
}

/// `Execute` payload: the `Parse` prefix plus argument data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecuteParams {
    pub query: QueryParams,
    pub input_typedesc_id: Uuid,
    pub output_typedesc_id: Uuid,
    pub arguments: Vec<u8>,
}

/// A protocol extension advertised in either handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolExtension {
    pub name: String,
    pub annotations: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    ClientHandshake {
        major_ver: u16,
        minor_ver: u16,
        params: Vec<(String, String)>,
        extensions: Vec<ProtocolExtension>,
    },
    AuthenticationSaslInitialResponse {
        method: String,
        sasl_data: Vec<u8>,
    },
    AuthenticationSaslResponse {
        sasl_data: Vec<u8>,
    },
    Parse(QueryParams),
    Execute(ExecuteParams),
    Sync,
    Flush,
    Terminate,
    Dump {
        annotations: Vec<(String, String)>,
    },
    Restore {
        headers: Vec<(u16, Vec<u8>)>,
        jobs: u16,
        data: Vec<u8>,
    },
    RestoreBlock {
        block_data: Vec<u8>,
    },
    RestoreEof,
}

impl ClientMessage {
    pub fn kind(&self) -> u8 {
        match self {
            ClientMessage::ClientHandshake { .. } => TAG_CLIENT_HANDSHAKE,
            ClientMessage::AuthenticationSaslInitialResponse { .. } => TAG_AUTH_SASL_INITIAL,
            ClientMessage::AuthenticationSaslResponse { .. } => TAG_AUTH_SASL_RESPONSE,
            ClientMessage::Parse(_) => TAG_PARSE,
            ClientMessage::Execute(_) => TAG_EXECUTE,
            ClientMessage::Sync => TAG_SYNC,
            ClientMessage::Flush => TAG_FLUSH,
            ClientMessage::Terminate => TAG_TERMINATE,
            ClientMessage::Dump { .. } => TAG_DUMP,
            ClientMessage::Restore { .. } => TAG_RESTORE,
            ClientMessage::RestoreBlock { .. } => TAG_RESTORE_BLOCK,
            ClientMessage::RestoreEof => TAG_RESTORE_EOF,
        }
    }

    pub fn kind_name(kind: u8) -> &'static str {
        match kind {
            TAG_CLIENT_HANDSHAKE => "ClientHandshake",
            TAG_AUTH_SASL_INITIAL => "AuthenticationSASLInitialResponse",
            TAG_AUTH_SASL_RESPONSE => "AuthenticationSASLResponse",
            TAG_PARSE => "Parse",
            TAG_EXECUTE => "Execute",
            TAG_SYNC => "Sync",
            TAG_FLUSH => "Flush",
            TAG_TERMINATE => "Terminate",
            TAG_DUMP => "Dump",
            TAG_RESTORE => "Restore",
            TAG_RESTORE_BLOCK => "RestoreBlock",
            TAG_RESTORE_EOF => "RestoreEof",
            _ => "Unknown",
        }
    }

    pub fn decode(frame: &Frame) -> Result<ClientMessage, ProtocolError> {
        let name = ClientMessage::kind_name(frame.kind);
        let mut r = WireReader::new(&frame.payload, name);
        let message = match frame.kind {
            TAG_CLIENT_HANDSHAKE => {
                let major_ver = r.get_u16()?;
                let minor_ver = r.get_u16()?;
                let param_count = r.get_i16()?;
                let mut params = Vec::with_capacity(param_count.max(0) as usize);
                for _ in 0..param_count {
                    let name = r.get_lstring()?;
                    let value = r.get_lstring()?;
                    params.push((name, value));
                }
                let extensions = decode_extensions(&mut r)?;
                ClientMessage::ClientHandshake {
                    major_ver,
                    minor_ver,
                    params,
                    extensions,
                }
            }
            TAG_AUTH_SASL_INITIAL => ClientMessage::AuthenticationSaslInitialResponse {
                method: r.get_lstring()?,
                sasl_data: r.get_bytes()?,
            },
            TAG_AUTH_SASL_RESPONSE => ClientMessage::AuthenticationSaslResponse {
                sasl_data: r.get_bytes()?,
            },
            TAG_PARSE => ClientMessage::Parse(QueryParams::decode(&mut r)?),
            TAG_EXECUTE => {
                let query = QueryParams::decode(&mut r)?;
                ClientMessage::Execute(ExecuteParams {
                    query,
                    input_typedesc_id: r.get_uuid()?,
                    output_typedesc_id: r.get_uuid()?,
                    arguments: r.get_bytes()?,
                })
            }
            TAG_SYNC => ClientMessage::Sync,
            TAG_FLUSH => ClientMessage::Flush,
            TAG_TERMINATE => ClientMessage::Terminate,
            TAG_DUMP => ClientMessage::Dump {
                annotations: r.get_annotations()?,
            },
            TAG_RESTORE => {
                let headers = r.get_key_values()?;
                let jobs = r.get_u16()?;
                let data = r.get_raw(r.remaining())?.to_vec();
                ClientMessage::Restore { headers, jobs, data }
            }
            TAG_RESTORE_BLOCK => ClientMessage::RestoreBlock {
                block_data: r.get_bytes()?,
            },
            TAG_RESTORE_EOF => ClientMessage::RestoreEof,
            other => return Err(ProtocolError::UnknownMessageTag(other)),
        };
        r.expect_end()?;
        Ok(message)
    }

    /// Serialize to a full frame, header included.
    pub fn encode_into(&self, out: &mut BytesMut) {
        let mut buf = BytesMut::new();
        match self {
            ClientMessage::ClientHandshake {
                major_ver,
                minor_ver,
                params,
                extensions,
            } => {
                buf.put_u16(*major_ver);
                buf.put_u16(*minor_ver);
                buf.put_i16(params.len() as i16);
                for (name, value) in params {
                    put_lstring(&mut buf, name);
                    put_lstring(&mut buf, value);
                }
                encode_extensions(&mut buf, extensions);
            }
            ClientMessage::AuthenticationSaslInitialResponse { method, sasl_data } => {
                put_lstring(&mut buf, method);
                put_bytes(&mut buf, sasl_data);
            }
            ClientMessage::AuthenticationSaslResponse { sasl_data } => {
                put_bytes(&mut buf, sasl_data);
            }
            ClientMessage::Parse(params) => params.encode(&mut buf),
            ClientMessage::Execute(execute) => {
                execute.query.encode(&mut buf);
                put_uuid(&mut buf, &execute.input_typedesc_id);
                put_uuid(&mut buf, &execute.output_typedesc_id);
                put_bytes(&mut buf, &execute.arguments);
            }
            ClientMessage::Sync | ClientMessage::Flush | ClientMessage::Terminate => {}
            ClientMessage::Dump { annotations } => put_annotations(&mut buf, annotations),
            ClientMessage::Restore {
                headers,
                jobs,
                data,
            } => {
                put_key_values(&mut buf, headers);
                buf.put_u16(*jobs);
                buf.put_slice(data);
            }
            ClientMessage::RestoreBlock { block_data } => put_bytes(&mut buf, block_data),
            ClientMessage::RestoreEof => {}
        }
        Frame::new(self.kind(), buf.freeze()).encode_into(out);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    ServerHandshake {
        major_ver: u16,
        minor_ver: u16,
        extensions: Vec<ProtocolExtension>,
    },
    AuthenticationOk,
    AuthenticationSaslRequired {
        methods: Vec<String>,
    },
    AuthenticationSaslContinue {
        sasl_data: Vec<u8>,
    },
    AuthenticationSaslFinal {
        sasl_data: Vec<u8>,
    },
    ParameterStatus {
        name: Vec<u8>,
        value: Vec<u8>,
    },
    ServerKeyData {
        data: [u8; 32],
    },
    ReadyForCommand {
        annotations: Vec<(String, String)>,
        transaction_state: TransactionState,
    },
    CommandDataDescription {
        annotations: Vec<(String, String)>,
        capabilities: Capabilities,
        result_cardinality: Cardinality,
        input_typedesc_id: Uuid,
        input_typedesc: Vec<u8>,
        output_typedesc_id: Uuid,
        output_typedesc: Vec<u8>,
    },
    StateDataDescription {
        typedesc_id: Uuid,
        typedesc: Vec<u8>,
    },
    Data {
        rows: Vec<Vec<u8>>,
    },
    CommandComplete {
        annotations: Vec<(String, String)>,
        capabilities: Capabilities,
        status: String,
        state_typedesc_id: Uuid,
        state_data: Vec<u8>,
    },
    ErrorResponse {
        severity: u8,
        code: u32,
        message: String,
        attributes: Vec<(u16, Vec<u8>)>,
    },
    LogMessage {
        severity: u8,
        code: u32,
        text: String,
        annotations: Vec<(String, String)>,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> u8 {
        match self {
            ServerMessage::ServerHandshake { .. } => TAG_SERVER_HANDSHAKE,
            ServerMessage::AuthenticationOk
            | ServerMessage::AuthenticationSaslRequired { .. }
            | ServerMessage::AuthenticationSaslContinue { .. }
            | ServerMessage::AuthenticationSaslFinal { .. } => TAG_AUTHENTICATION,
            ServerMessage::ParameterStatus { .. } => TAG_PARAMETER_STATUS,
            ServerMessage::ServerKeyData { .. } => TAG_SERVER_KEY_DATA,
            ServerMessage::ReadyForCommand { .. } => TAG_READY_FOR_COMMAND,
            ServerMessage::CommandDataDescription { .. } => TAG_COMMAND_DATA_DESCRIPTION,
            ServerMessage::StateDataDescription { .. } => TAG_STATE_DATA_DESCRIPTION,
            ServerMessage::Data { .. } => TAG_DATA,
            ServerMessage::CommandComplete { .. } => TAG_COMMAND_COMPLETE,
            ServerMessage::ErrorResponse { .. } => TAG_ERROR_RESPONSE,
            ServerMessage::LogMessage { .. } => TAG_LOG_MESSAGE,
        }
    }

    pub fn kind_name(kind: u8) -> &'static str {
        match kind {
            TAG_SERVER_HANDSHAKE => "ServerHandshake",
            TAG_AUTHENTICATION => "Authentication",
            TAG_PARAMETER_STATUS => "ParameterStatus",
            TAG_SERVER_KEY_DATA => "ServerKeyData",
            TAG_READY_FOR_COMMAND => "ReadyForCommand",
            TAG_COMMAND_DATA_DESCRIPTION => "CommandDataDescription",
            TAG_STATE_DATA_DESCRIPTION => "StateDataDescription",
            TAG_DATA => "Data",
            TAG_COMMAND_COMPLETE => "CommandComplete",
            TAG_ERROR_RESPONSE => "ErrorResponse",
            TAG_LOG_MESSAGE => "LogMessage",
            _ => "Unknown",
        }
    }

    pub fn decode(frame: &Frame) -> Result<ServerMessage, ProtocolError> {
        let name = ServerMessage::kind_name(frame.kind);
        let mut r = WireReader::new(&frame.payload, name);
        let message = match frame.kind {
            TAG_SERVER_HANDSHAKE => ServerMessage::ServerHandshake {
                major_ver: r.get_u16()?,
                minor_ver: r.get_u16()?,
                extensions: decode_extensions(&mut r)?,
            },
            TAG_AUTHENTICATION => {
                let status = r.get_i32()?;
                match status {
                    AUTH_STATUS_OK => ServerMessage::AuthenticationOk,
                    AUTH_STATUS_SASL_REQUIRED => {
                        let count = r.get_i32()?;
                        let mut methods = Vec::with_capacity(count.max(0) as usize);
                        for _ in 0..count {
                            methods.push(r.get_lstring()?);
                        }
                        ServerMessage::AuthenticationSaslRequired { methods }
                    }
                    AUTH_STATUS_SASL_CONTINUE => ServerMessage::AuthenticationSaslContinue {
                        sasl_data: r.get_bytes()?,
                    },
                    AUTH_STATUS_SASL_FINAL => ServerMessage::AuthenticationSaslFinal {
                        sasl_data: r.get_bytes()?,
                    },
                    _ => {
                        return Err(ProtocolError::Malformed {
                            message: "Authentication",
                            detail: "unknown authentication status",
                        })
                    }
                }
            }
            TAG_PARAMETER_STATUS => ServerMessage::ParameterStatus {
                name: r.get_bytes()?,
                value: r.get_bytes()?,
            },
            TAG_SERVER_KEY_DATA => ServerMessage::ServerKeyData {
                data: r.get_fixed::<32>()?,
            },
            TAG_READY_FOR_COMMAND => ServerMessage::ReadyForCommand {
                annotations: r.get_annotations()?,
                transaction_state: TransactionState::from_u8(r.get_u8()?)?,
            },
            TAG_COMMAND_DATA_DESCRIPTION => ServerMessage::CommandDataDescription {
                annotations: r.get_annotations()?,
                capabilities: Capabilities(r.get_u64()?),
                result_cardinality: Cardinality::from_u8(r.get_u8()?)?,
                input_typedesc_id: r.get_uuid()?,
                input_typedesc: r.get_bytes()?,
                output_typedesc_id: r.get_uuid()?,
                output_typedesc: r.get_bytes()?,
            },
            TAG_STATE_DATA_DESCRIPTION => ServerMessage::StateDataDescription {
                typedesc_id: r.get_uuid()?,
                typedesc: r.get_bytes()?,
            },
            TAG_DATA => {
                let count = r.get_i16()?;
                let mut rows = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    let len = r.get_i32()?;
                    if len < 0 {
                        return Err(ProtocolError::Malformed {
                            message: "Data",
                            detail: "negative element length",
                        });
                    }
                    rows.push(r.get_raw(len as usize)?.to_vec());
                }
                ServerMessage::Data { rows }
            }
            TAG_COMMAND_COMPLETE => ServerMessage::CommandComplete {
                annotations: r.get_annotations()?,
                capabilities: Capabilities(r.get_u64()?),
                status: r.get_lstring()?,
                state_typedesc_id: r.get_uuid()?,
                state_data: r.get_bytes()?,
            },
            TAG_ERROR_RESPONSE => ServerMessage::ErrorResponse {
                severity: r.get_u8()?,
                code: r.get_u32()?,
                message: r.get_lstring()?,
                attributes: r.get_key_values()?,
            },
            TAG_LOG_MESSAGE => ServerMessage::LogMessage {
                severity: r.get_u8()?,
                code: r.get_u32()?,
                text: r.get_lstring()?,
                annotations: r.get_annotations()?,
            },
            other => return Err(ProtocolError::UnknownMessageTag(other)),
        };
        r.expect_end()?;
        Ok(message)
    }

    /// Serialize to a full frame, header included.
    pub fn encode_into(&self, out: &mut BytesMut) {
        let mut buf = BytesMut::new();
        match self {
            ServerMessage::ServerHandshake {
                major_ver,
                minor_ver,
                extensions,
            } => {
                buf.put_u16(*major_ver);
                buf.put_u16(*minor_ver);
                encode_extensions(&mut buf, extensions);
            }
            ServerMessage::AuthenticationOk => buf.put_i32(AUTH_STATUS_OK),
            ServerMessage::AuthenticationSaslRequired { methods } => {
                buf.put_i32(AUTH_STATUS_SASL_REQUIRED);
                buf.put_i32(methods.len() as i32);
                for method in methods {
                    put_lstring(&mut buf, method);
                }
            }
            ServerMessage::AuthenticationSaslContinue { sasl_data } => {
                buf.put_i32(AUTH_STATUS_SASL_CONTINUE);
                put_bytes(&mut buf, sasl_data);
            }
            ServerMessage::AuthenticationSaslFinal { sasl_data } => {
                buf.put_i32(AUTH_STATUS_SASL_FINAL);
                put_bytes(&mut buf, sasl_data);
            }
            ServerMessage::ParameterStatus { name, value } => {
                put_bytes(&mut buf, name);
                put_bytes(&mut buf, value);
            }
            ServerMessage::ServerKeyData { data } => buf.put_slice(data),
            ServerMessage::ReadyForCommand {
                annotations,
                transaction_state,
            } => {
                put_annotations(&mut buf, annotations);
                buf.put_u8(*transaction_state as u8);
            }
            ServerMessage::CommandDataDescription {
                annotations,
                capabilities,
                result_cardinality,
                input_typedesc_id,
                input_typedesc,
                output_typedesc_id,
                output_typedesc,
            } => {
                put_annotations(&mut buf, annotations);
                buf.put_u64(capabilities.0);
                buf.put_u8(*result_cardinality as u8);
                put_uuid(&mut buf, input_typedesc_id);
                put_bytes(&mut buf, input_typedesc);
                put_uuid(&mut buf, output_typedesc_id);
                put_bytes(&mut buf, output_typedesc);
            }
            ServerMessage::StateDataDescription {
                typedesc_id,
                typedesc,
            } => {
                put_uuid(&mut buf, typedesc_id);
                put_bytes(&mut buf, typedesc);
            }
            ServerMessage::Data { rows } => {
                buf.put_i16(rows.len() as i16);
                for row in rows {
                    buf.put_i32(row.len() as i32);
                    buf.put_slice(row);
                }
            }
            ServerMessage::CommandComplete {
                annotations,
                capabilities,
                status,
                state_typedesc_id,
                state_data,
            } => {
                put_annotations(&mut buf, annotations);
                buf.put_u64(capabilities.0);
                put_lstring(&mut buf, status);
                put_uuid(&mut buf, state_typedesc_id);
                put_bytes(&mut buf, state_data);
            }
            ServerMessage::ErrorResponse {
                severity,
                code,
                message,
                attributes,
            } => {
                buf.put_u8(*severity);
                buf.put_u32(*code);
                put_lstring(&mut buf, message);
                put_key_values(&mut buf, attributes);
            }
            ServerMessage::LogMessage {
                severity,
                code,
                text,
                annotations,
            } => {
                buf.put_u8(*severity);
                buf.put_u32(*code);
                put_lstring(&mut buf, text);
                put_annotations(&mut buf, annotations);
            }
        }
        Frame::new(self.kind(), buf.freeze()).encode_into(out);
    }
}

fn decode_extensions(r: &mut WireReader<'_>) -> Result<Vec<ProtocolExtension>, ProtocolError> {
    let count = r.get_i16()?;
    let mut out = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        out.push(ProtocolExtension {
            name: r.get_lstring()?,
            annotations: r.get_annotations()?,
        });
    }
    Ok(out)
}

fn encode_extensions(buf: &mut BytesMut, extensions: &[ProtocolExtension]) {
    buf.put_i16(extensions.len() as i16);
    for ext in extensions {
        put_lstring(buf, &ext.name);
        put_annotations(buf, &ext.annotations);
    }
}
