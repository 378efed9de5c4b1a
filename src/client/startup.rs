//! Handshake and authentication.

use log::{debug, warn};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};

use super::core::{FrontendSession, SessionPhase};
use crate::auth::scram::{ScramServer, SCRAM_SHA_256};
use crate::auth::AuthMethod;
use crate::errors::{AuthError, Error, ProtocolError};
use crate::protocol::messages::{ClientMessage, ServerMessage};
use crate::protocol::types::ProtocolVersion;

impl<S, T> FrontendSession<S, T>
where
    S: AsyncRead + Unpin,
    T: AsyncWrite + Unpin,
{
    /// Run the handshake: version negotiation, parameter intake, auth, and
    /// the post-auth parameter burst ending in `ReadyForCommand`.
    pub(crate) async fn handshake(&mut self) -> Result<(), Error> {
        let message = self.expect_client_message("ClientHandshake").await?;
        let (major_ver, minor_ver, params) = match message {
            ClientMessage::ClientHandshake {
                major_ver,
                minor_ver,
                params,
                ..
            } => (major_ver, minor_ver, params),
            other => {
                return Err(unexpected(&other, "ClientHandshake"));
            }
        };

        let requested = ProtocolVersion::new(major_ver, minor_ver);
        if !requested.is_supported() {
            return Err(ProtocolError::UnsupportedVersion {
                major: major_ver,
                minor: minor_ver,
            }
            .into());
        }
        if requested != ProtocolVersion::CURRENT {
            // Counter-offer our version; supported clients continue.
            self.queue(&ServerMessage::ServerHandshake {
                major_ver: ProtocolVersion::CURRENT.major,
                minor_ver: ProtocolVersion::CURRENT.minor,
                extensions: vec![],
            });
            if requested < ProtocolVersion::CURRENT {
                self.queue(&ServerMessage::LogMessage {
                    severity: crate::protocol::types::LOG_SEVERITY_WARNING,
                    code: 0,
                    text: format!(
                        "client requested protocol {requested}, serving {}",
                        ProtocolVersion::CURRENT
                    ),
                    annotations: vec![],
                });
            }
        }

        for (name, value) in &params {
            match name.as_str() {
                "user" => self.username = value.clone(),
                "database" | "branch" => self.branch = value.clone(),
                _ => debug!("[session: {}] ignoring connection param {name}", self.id),
            }
        }
        if self.username.is_empty() {
            return Err(ProtocolError::Malformed {
                message: "ClientHandshake",
                detail: "missing user parameter",
            }
            .into());
        }
        if !self.server.config.branch_allowed(&self.branch) {
            return Err(AuthError::UnknownBranch(self.branch.clone()).into());
        }

        self.phase = SessionPhase::AuthWait;
        match self.server.authenticator.method() {
            AuthMethod::Trust => {}
            AuthMethod::Scram => self.scram_exchange().await?,
        }

        self.queue(&ServerMessage::AuthenticationOk);
        let concurrency = self.server.config.general.max_server_connections.to_string();
        self.queue(&ServerMessage::ParameterStatus {
            name: b"suggested_pool_concurrency".to_vec(),
            value: concurrency.into_bytes(),
        });
        self.queue(&ServerMessage::ServerKeyData {
            data: rand::rng().random(),
        });
        let (state_id, _) = self.session.serialize();
        self.queue(&ServerMessage::StateDataDescription {
            typedesc_id: state_id,
            typedesc: vec![],
        });
        self.queue(&ServerMessage::ReadyForCommand {
            annotations: vec![],
            transaction_state: self.session.transaction_state(),
        });
        self.flush_out().await?;
        self.phase = SessionPhase::Ready;
        Ok(())
    }

    async fn scram_exchange(&mut self) -> Result<(), Error> {
        self.queue(&ServerMessage::AuthenticationSaslRequired {
            methods: vec![SCRAM_SHA_256.to_string()],
        });
        self.flush_out().await?;

        let (method, initial) = match self.expect_client_message("SASL initial response").await? {
            ClientMessage::AuthenticationSaslInitialResponse { method, sasl_data } => {
                (method, sasl_data)
            }
            other => return Err(unexpected(&other, "AuthenticationSASLInitialResponse")),
        };
        if method != SCRAM_SHA_256 {
            return Err(AuthError::UnsupportedMethod(method).into());
        }

        let verifier = self.server.authenticator.scram_verifier(&self.username)?;
        let mut scram = ScramServer::new(verifier);

        let client_first = String::from_utf8(initial)
            .map_err(|_| AuthError::Sasl("client-first is not UTF-8".to_string()))?;
        let server_first = scram.handle_client_first(&client_first)?;
        self.queue(&ServerMessage::AuthenticationSaslContinue {
            sasl_data: server_first.into_bytes(),
        });
        self.flush_out().await?;

        let final_data = match self.expect_client_message("SASL response").await? {
            ClientMessage::AuthenticationSaslResponse { sasl_data } => sasl_data,
            other => return Err(unexpected(&other, "AuthenticationSASLResponse")),
        };
        let client_final = String::from_utf8(final_data)
            .map_err(|_| AuthError::Sasl("client-final is not UTF-8".to_string()))?;
        let server_final = match scram.handle_client_final(&client_final) {
            Ok(sig) => sig,
            Err(err) => {
                warn!(
                    "[session: {}] authentication failed for {}: {err}",
                    self.id, self.username
                );
                return Err(AuthError::Failed(self.username.clone()).into());
            }
        };
        self.queue(&ServerMessage::AuthenticationSaslFinal {
            sasl_data: server_final.into_bytes(),
        });
        Ok(())
    }

    async fn expect_client_message(&mut self, expected: &'static str) -> Result<ClientMessage, Error> {
        let Some(frame) = self.next_frame().await? else {
            return Err(Error::Socket(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("client disconnected while {expected} was expected"),
            )));
        };
        Ok(ClientMessage::decode(&frame)?)
    }
}

fn unexpected(got: &ClientMessage, expected: &'static str) -> Error {
    ProtocolError::UnexpectedMessage {
        expected,
        got: got.kind() as char,
    }
    .into()
}
