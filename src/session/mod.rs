//! Per-connection session state: module aliases, session config, globals,
//! and the transaction state machine.
//!
//! The state is versioned: every distinct *shape* of the state (the set of
//! names and their scalar types) hashes to a 16-byte descriptor ID. The
//! server piggybacks `(descriptor_id, blob)` on `CommandComplete`; the
//! client echoes the pair on its next `Execute` so the server can
//! re-materialize the session after a backend swap. A descriptor ID of all
//! zeroes goes with an empty blob and means "default state".

use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_128;

use crate::errors::{StateError, TransactionError};
use crate::protocol::types::TransactionState;
use crate::protocol::wire::{put_lstring, WireReader};

const SECTION_ALIASES: u8 = 0;
const SECTION_CONFIG: u8 = 1;
const SECTION_GLOBALS: u8 = 2;

/// A session-settable scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    fn type_tag(&self) -> u8 {
        match self {
            Scalar::Str(_) => 1,
            Scalar::Int(_) => 2,
            Scalar::Float(_) => 3,
            Scalar::Bool(_) => 4,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.type_tag());
        match self {
            Scalar::Str(v) => put_lstring(buf, v),
            Scalar::Int(v) => buf.put_i64(*v),
            Scalar::Float(v) => buf.put_f64(*v),
            Scalar::Bool(v) => buf.put_u8(*v as u8),
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Scalar, StateError> {
        let malformed = |_| StateError::Malformed("bad scalar encoding");
        let tag = r.get_u8().map_err(malformed)?;
        Ok(match tag {
            1 => Scalar::Str(r.get_lstring().map_err(malformed)?),
            2 => Scalar::Int(r.get_u64().map_err(malformed)? as i64),
            3 => Scalar::Float(f64::from_bits(r.get_u64().map_err(malformed)?)),
            4 => Scalar::Bool(r.get_u8().map_err(malformed)? != 0),
            _ => return Err(StateError::Malformed("unknown scalar type tag")),
        })
    }
}

/// The mutable session state of one frontend connection.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    modaliases: BTreeMap<String, String>,
    config: BTreeMap<String, Scalar>,
    globals: BTreeMap<String, Scalar>,
    tx_state: TransactionState,
    /// Derived (descriptor_id, blob), cleared on every mutation.
    cached: Option<(Uuid, Vec<u8>)>,
}

impl SessionState {
    pub fn new() -> SessionState {
        SessionState::default()
    }

    pub fn is_default(&self) -> bool {
        self.modaliases.is_empty() && self.config.is_empty() && self.globals.is_empty()
    }

    pub fn modaliases(&self) -> &BTreeMap<String, String> {
        &self.modaliases
    }

    pub fn config(&self) -> &BTreeMap<String, Scalar> {
        &self.config
    }

    pub fn globals(&self) -> &BTreeMap<String, Scalar> {
        &self.globals
    }

    pub fn set_alias(&mut self, name: impl Into<String>, module: impl Into<String>) {
        self.modaliases.insert(name.into(), module.into());
        self.cached = None;
    }

    pub fn unset_alias(&mut self, name: &str) {
        if self.modaliases.remove(name).is_some() {
            self.cached = None;
        }
    }

    pub fn set_config(&mut self, name: impl Into<String>, value: Scalar) {
        self.config.insert(name.into(), value);
        self.cached = None;
    }

    pub fn unset_config(&mut self, name: &str) {
        if self.config.remove(name).is_some() {
            self.cached = None;
        }
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: Scalar) {
        self.globals.insert(name.into(), value);
        self.cached = None;
    }

    pub fn unset_global(&mut self, name: &str) {
        if self.globals.remove(name).is_some() {
            self.cached = None;
        }
    }

    pub fn get_config(&self, name: &str) -> Option<&Scalar> {
        self.config.get(name)
    }

    /// The descriptor ID and canonical blob for the current state.
    ///
    /// Derivation is memoized until the next mutation.
    pub fn serialize(&mut self) -> (Uuid, Vec<u8>) {
        if let Some((id, blob)) = &self.cached {
            return (*id, blob.clone());
        }
        let derived = if self.is_default() {
            (Uuid::nil(), Vec::new())
        } else {
            let blob = self.encode_blob();
            (self.descriptor_id(), blob)
        };
        self.cached = Some(derived.clone());
        derived
    }

    /// Stable hash over the state *schema*: section, name, and scalar type
    /// of every entry, in canonical (sorted) order. Values do not
    /// participate.
    fn descriptor_id(&self) -> Uuid {
        let mut schema = BytesMut::new();
        for (name, _) in &self.modaliases {
            schema.put_u8(SECTION_ALIASES);
            put_lstring(&mut schema, name);
            schema.put_u8(1);
        }
        for (name, value) in &self.config {
            schema.put_u8(SECTION_CONFIG);
            put_lstring(&mut schema, name);
            schema.put_u8(value.type_tag());
        }
        for (name, value) in &self.globals {
            schema.put_u8(SECTION_GLOBALS);
            put_lstring(&mut schema, name);
            schema.put_u8(value.type_tag());
        }
        Uuid::from_u128(xxh3_128(&schema))
    }

    fn encode_blob(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u16(self.modaliases.len() as u16);
        for (name, module) in &self.modaliases {
            put_lstring(&mut buf, name);
            put_lstring(&mut buf, module);
        }
        buf.put_u16(self.config.len() as u16);
        for (name, value) in &self.config {
            put_lstring(&mut buf, name);
            value.encode(&mut buf);
        }
        buf.put_u16(self.globals.len() as u16);
        for (name, value) in &self.globals {
            put_lstring(&mut buf, name);
            value.encode(&mut buf);
        }
        buf.to_vec()
    }

    /// Re-materialize state from a client-echoed `(descriptor_id, blob)`
    /// pair. The transaction state is not part of the blob and survives.
    pub fn restore(&mut self, id: Uuid, blob: &[u8]) -> Result<(), StateError> {
        if id.is_nil() {
            if !blob.is_empty() {
                return Err(StateError::Malformed(
                    "non-empty state data with zero descriptor id",
                ));
            }
            self.modaliases.clear();
            self.config.clear();
            self.globals.clear();
            self.cached = Some((Uuid::nil(), Vec::new()));
            return Ok(());
        }

        let mut restored = SessionState::new();
        let mut r = WireReader::new(blob, "state");
        let malformed = |_| StateError::Malformed("truncated state data");

        let alias_count = r.get_u16().map_err(malformed)?;
        for _ in 0..alias_count {
            let name = r.get_lstring().map_err(malformed)?;
            let module = r.get_lstring().map_err(malformed)?;
            restored.modaliases.insert(name, module);
        }
        let config_count = r.get_u16().map_err(malformed)?;
        for _ in 0..config_count {
            let name = r.get_lstring().map_err(malformed)?;
            let value = Scalar::decode(&mut r)?;
            restored.config.insert(name, value);
        }
        let global_count = r.get_u16().map_err(malformed)?;
        for _ in 0..global_count {
            let name = r.get_lstring().map_err(malformed)?;
            let value = Scalar::decode(&mut r)?;
            restored.globals.insert(name, value);
        }
        r.expect_end()
            .map_err(|_| StateError::Malformed("trailing bytes in state data"))?;

        let expected = restored.descriptor_id();
        if expected != id {
            return Err(StateError::Mismatch { expected, got: id });
        }

        self.modaliases = restored.modaliases;
        self.config = restored.config;
        self.globals = restored.globals;
        self.cached = Some((id, blob.to_vec()));
        Ok(())
    }

    // Transaction state machine.

    pub fn transaction_state(&self) -> TransactionState {
        self.tx_state
    }

    pub fn in_transaction(&self) -> bool {
        self.tx_state != TransactionState::NotInTransaction
    }

    pub fn in_failed_transaction(&self) -> bool {
        self.tx_state == TransactionState::InFailedTransaction
    }

    pub fn begin_transaction(&mut self) -> Result<(), TransactionError> {
        match self.tx_state {
            TransactionState::NotInTransaction => {
                self.tx_state = TransactionState::InTransaction;
                Ok(())
            }
            _ => Err(TransactionError::AlreadyInTransaction),
        }
    }

    pub fn commit_transaction(&mut self) -> Result<(), TransactionError> {
        match self.tx_state {
            TransactionState::InTransaction => {
                self.tx_state = TransactionState::NotInTransaction;
                Ok(())
            }
            TransactionState::InFailedTransaction => Err(TransactionError::InFailedTransaction),
            TransactionState::NotInTransaction => Err(TransactionError::NotInTransaction("COMMIT")),
        }
    }

    pub fn rollback_transaction(&mut self) -> Result<(), TransactionError> {
        match self.tx_state {
            TransactionState::InTransaction | TransactionState::InFailedTransaction => {
                self.tx_state = TransactionState::NotInTransaction;
                Ok(())
            }
            TransactionState::NotInTransaction => {
                Err(TransactionError::NotInTransaction("ROLLBACK"))
            }
        }
    }

    /// An error inside an open transaction poisons it.
    pub fn fail_transaction(&mut self) {
        if self.tx_state == TransactionState::InTransaction {
            self.tx_state = TransactionState::InFailedTransaction;
        }
    }

    /// The backend connection died: any open transaction is lost.
    pub fn backend_lost(&mut self) {
        if self.tx_state != TransactionState::NotInTransaction {
            self.tx_state = TransactionState::InFailedTransaction;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_has_nil_descriptor() {
        let mut state = SessionState::new();
        let (id, blob) = state.serialize();
        assert!(id.is_nil());
        assert!(blob.is_empty());
    }

    #[test]
    fn test_descriptor_is_zero_iff_blob_empty() {
        let mut state = SessionState::new();
        state.set_global("current_user_id", Scalar::Int(7));
        let (id, blob) = state.serialize();
        assert!(!id.is_nil());
        assert!(!blob.is_empty());

        state.unset_global("current_user_id");
        let (id, blob) = state.serialize();
        assert!(id.is_nil());
        assert!(blob.is_empty());
    }

    #[test]
    fn test_state_round_trip() {
        let mut state = SessionState::new();
        state.set_alias("m", "my_module");
        state.set_config("query_execution_timeout", Scalar::Int(30_000));
        state.set_global("tenant", Scalar::Str("acme".into()));
        state.set_global("beta", Scalar::Bool(true));
        let (id, blob) = state.serialize();

        let mut other = SessionState::new();
        other.restore(id, &blob).unwrap();
        assert_eq!(other.modaliases(), state.modaliases());
        assert_eq!(other.config(), state.config());
        assert_eq!(other.globals(), state.globals());
        assert_eq!(other.serialize(), (id, blob));
    }

    #[test]
    fn test_descriptor_depends_on_shape_not_values() {
        let mut a = SessionState::new();
        a.set_global("tenant", Scalar::Str("acme".into()));
        let mut b = SessionState::new();
        b.set_global("tenant", Scalar::Str("globex".into()));
        assert_eq!(a.serialize().0, b.serialize().0);

        let mut c = SessionState::new();
        c.set_global("tenant", Scalar::Int(1));
        assert_ne!(a.serialize().0, c.serialize().0);
    }

    #[test]
    fn test_restore_rejects_mismatched_id() {
        let mut state = SessionState::new();
        state.set_global("tenant", Scalar::Str("acme".into()));
        let (_, blob) = state.serialize();

        let mut other = SessionState::new();
        let err = other.restore(Uuid::from_u128(0xdead), &blob).unwrap_err();
        assert!(matches!(err, StateError::Mismatch { .. }));
    }

    #[test]
    fn test_restore_nil_resets() {
        let mut state = SessionState::new();
        state.set_alias("m", "my_module");
        state.restore(Uuid::nil(), &[]).unwrap();
        assert!(state.is_default());

        assert!(state.restore(Uuid::nil(), &[1]).is_err());
    }

    #[test]
    fn test_transaction_machine() {
        let mut state = SessionState::new();
        assert_eq!(
            state.transaction_state(),
            TransactionState::NotInTransaction
        );

        state.begin_transaction().unwrap();
        assert_eq!(state.transaction_state(), TransactionState::InTransaction);
        assert!(matches!(
            state.begin_transaction(),
            Err(TransactionError::AlreadyInTransaction)
        ));

        state.fail_transaction();
        assert_eq!(
            state.transaction_state(),
            TransactionState::InFailedTransaction
        );
        // COMMIT in a failed transaction is refused; ROLLBACK recovers.
        assert!(state.commit_transaction().is_err());
        state.rollback_transaction().unwrap();
        assert_eq!(
            state.transaction_state(),
            TransactionState::NotInTransaction
        );

        state.begin_transaction().unwrap();
        state.commit_transaction().unwrap();
        assert_eq!(
            state.transaction_state(),
            TransactionState::NotInTransaction
        );
    }

    #[test]
    fn test_fail_outside_transaction_is_noop() {
        let mut state = SessionState::new();
        state.fail_transaction();
        assert_eq!(
            state.transaction_state(),
            TransactionState::NotInTransaction
        );
    }

    #[test]
    fn test_backend_lost_poisons_open_transaction() {
        let mut state = SessionState::new();
        state.begin_transaction().unwrap();
        state.backend_lost();
        assert!(state.in_failed_transaction());
    }
}
