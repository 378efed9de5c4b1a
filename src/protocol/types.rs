//! Wire-level enumerations and flag sets.
//!
//! Values here are part of the frozen wire contract (protocol 2.0) and must
//! not be renumbered.

use iota::iota;

use crate::errors::ProtocolError;

iota! {
    pub const CAP_BIT_MODIFICATIONS: u64 = 1 << iota;
        , CAP_BIT_SESSION_CONFIG
        , CAP_BIT_TRANSACTION
        , CAP_BIT_DDL
        , CAP_BIT_PERSISTENT_CONFIG
}

/// A bit mask of powers a compiled query needs, or a session allows.
///
/// Plain reads need no bit at all: an empty mask always passes the check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(pub u64);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    pub const MODIFICATIONS: Capabilities = Capabilities(CAP_BIT_MODIFICATIONS);
    pub const SESSION_CONFIG: Capabilities = Capabilities(CAP_BIT_SESSION_CONFIG);
    pub const TRANSACTION: Capabilities = Capabilities(CAP_BIT_TRANSACTION);
    pub const DDL: Capabilities = Capabilities(CAP_BIT_DDL);
    pub const PERSISTENT_CONFIG: Capabilities = Capabilities(CAP_BIT_PERSISTENT_CONFIG);
    pub const ALL: Capabilities = Capabilities(
        CAP_BIT_MODIFICATIONS
            | CAP_BIT_SESSION_CONFIG
            | CAP_BIT_TRANSACTION
            | CAP_BIT_DDL
            | CAP_BIT_PERSISTENT_CONFIG,
    );

    #[inline]
    pub fn contains(&self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn union(&self, other: Capabilities) -> Capabilities {
        Capabilities(self.0 | other.0)
    }

    /// Bits required by `self` that `allowed` does not grant.
    #[inline]
    pub fn missing_from(&self, allowed: Capabilities) -> Capabilities {
        Capabilities(self.0 & !allowed.0)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        for (bit, name) in [
            (CAP_BIT_MODIFICATIONS, "MODIFICATIONS"),
            (CAP_BIT_SESSION_CONFIG, "SESSION_CONFIG"),
            (CAP_BIT_TRANSACTION, "TRANSACTION"),
            (CAP_BIT_DDL, "DDL"),
            (CAP_BIT_PERSISTENT_CONFIG, "PERSISTENT_CONFIG"),
        ] {
            if self.0 & bit != 0 {
                out.push(name);
            }
        }
        out
    }
}

impl std::fmt::Display for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "READ");
        }
        write!(f, "{}", self.names().join("|"))
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;
    fn bitor(self, rhs: Capabilities) -> Capabilities {
        self.union(rhs)
    }
}

/// Data output format requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum OutputFormat {
    Binary = 0x62,
    Json = 0x6a,
    JsonElements = 0x4a,
    #[default]
    None = 0x6e,
}

impl OutputFormat {
    pub fn from_u8(value: u8) -> Result<OutputFormat, ProtocolError> {
        match value {
            0x62 => Ok(OutputFormat::Binary),
            0x6a => Ok(OutputFormat::Json),
            0x4a => Ok(OutputFormat::JsonElements),
            0x6e => Ok(OutputFormat::None),
            _ => Err(ProtocolError::Malformed {
                message: "Parse",
                detail: "unknown output format",
            }),
        }
    }
}

/// Language of the command text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum InputLanguage {
    #[default]
    EdgeQl = 0x45,
    Sql = 0x53,
}

impl InputLanguage {
    pub fn from_u8(value: u8) -> Result<InputLanguage, ProtocolError> {
        match value {
            0x45 => Ok(InputLanguage::EdgeQl),
            0x53 => Ok(InputLanguage::Sql),
            _ => Err(ProtocolError::Malformed {
                message: "Parse",
                detail: "unknown input language",
            }),
        }
    }
}

/// Result cardinality, expected (client side) or actual (server side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Cardinality {
    NoResult = 0x6e,
    AtMostOne = 0x6f,
    One = 0x41,
    #[default]
    Many = 0x6d,
    AtLeastOne = 0x4d,
}

impl Cardinality {
    pub fn from_u8(value: u8) -> Result<Cardinality, ProtocolError> {
        match value {
            0x6e => Ok(Cardinality::NoResult),
            0x6f => Ok(Cardinality::AtMostOne),
            0x41 => Ok(Cardinality::One),
            0x6d => Ok(Cardinality::Many),
            0x4d => Ok(Cardinality::AtLeastOne),
            _ => Err(ProtocolError::Malformed {
                message: "Parse",
                detail: "unknown cardinality",
            }),
        }
    }
}

/// Transaction state byte reported by `ReadyForCommand`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum TransactionState {
    #[default]
    NotInTransaction = 0x49, // 'I'
    InTransaction = 0x54,    // 'T'
    InFailedTransaction = 0x45, // 'E'
}

impl TransactionState {
    pub fn from_u8(value: u8) -> Result<TransactionState, ProtocolError> {
        match value {
            0x49 => Ok(TransactionState::NotInTransaction),
            0x54 => Ok(TransactionState::InTransaction),
            0x45 => Ok(TransactionState::InFailedTransaction),
            _ => Err(ProtocolError::Malformed {
                message: "ReadyForCommand",
                detail: "unknown transaction state",
            }),
        }
    }
}

/// Log message severity on `LogMessage`.
pub const LOG_SEVERITY_DEBUG: u8 = 20;
pub const LOG_SEVERITY_INFO: u8 = 40;
pub const LOG_SEVERITY_NOTICE: u8 = 60;
pub const LOG_SEVERITY_WARNING: u8 = 80;

/// A protocol version as negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// The single version this server speaks.
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 2, minor: 0 };
    /// Oldest version we still accept in a handshake.
    pub const MIN_SUPPORTED: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    pub fn new(major: u16, minor: u16) -> ProtocolVersion {
        ProtocolVersion { major, minor }
    }

    pub fn is_supported(&self) -> bool {
        *self >= ProtocolVersion::MIN_SUPPORTED && self.major <= ProtocolVersion::CURRENT.major
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
