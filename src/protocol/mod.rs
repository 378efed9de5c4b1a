//! The binary wire protocol: framing, typed messages, and shared
//! enumerations.

pub mod codec;
pub mod messages;
pub mod types;
pub mod wire;

#[cfg(test)]
mod message_tests;

pub use codec::{read_frame, Frame, FrameDecoder, DEFAULT_MAX_FRAME};
pub use messages::{ClientMessage, ExecuteParams, ProtocolExtension, QueryParams, ServerMessage};
pub use types::{
    Capabilities, Cardinality, InputLanguage, OutputFormat, ProtocolVersion, TransactionState,
};
