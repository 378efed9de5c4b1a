//! Server-side SCRAM-SHA-256 (RFC 5802/7677) for the SASL handshake.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::errors::AuthError;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
pub const DEFAULT_ITERATIONS: u32 = 4096;
const NONCE_LENGTH: usize = 18;
const SALT_LENGTH: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// Derived credentials for one user, computed once at startup from the
/// configured password.
#[derive(Debug, Clone)]
pub struct ScramVerifier {
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub stored_key: [u8; 32],
    pub server_key: [u8; 32],
}

impl ScramVerifier {
    pub fn from_password(password: &str) -> Result<ScramVerifier, AuthError> {
        let mut salt = vec![0u8; SALT_LENGTH];
        rand::rng().fill(&mut salt[..]);
        ScramVerifier::from_password_with_salt(password, salt, DEFAULT_ITERATIONS)
    }

    pub fn from_password_with_salt(
        password: &str,
        salt: Vec<u8>,
        iterations: u32,
    ) -> Result<ScramVerifier, AuthError> {
        let prepared = stringprep::saslprep(password)
            .map_err(|_| AuthError::Sasl("password failed saslprep".to_string()))?;
        let salted = hi(prepared.as_bytes(), &salt, iterations);

        let client_key = hmac(&salted, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let server_key = hmac(&salted, b"Server Key");

        Ok(ScramVerifier {
            salt,
            iterations,
            stored_key,
            server_key,
        })
    }
}

/// Hi(): PBKDF2 with HMAC-SHA-256 as the PRF.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut block = salt.to_vec();
    block.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac(password, &block);
    let mut result = u;
    for _ in 1..iterations {
        u = hmac(password, &u);
        for (r, b) in result.iter_mut().zip(u.iter()) {
            *r ^= b;
        }
    }
    result
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn generate_nonce() -> String {
    let mut raw = [0u8; NONCE_LENGTH];
    rand::rng().fill(&mut raw);
    BASE64.encode(raw)
}

/// State machine for one SASL exchange.
pub struct ScramServer {
    verifier: ScramVerifier,
    server_nonce: String,
    client_first_bare: Option<String>,
    server_first: Option<String>,
    combined_nonce: Option<String>,
}

impl ScramServer {
    pub fn new(verifier: ScramVerifier) -> ScramServer {
        ScramServer {
            verifier,
            server_nonce: generate_nonce(),
            client_first_bare: None,
            server_first: None,
            combined_nonce: None,
        }
    }

    #[cfg(test)]
    fn with_nonce(verifier: ScramVerifier, nonce: &str) -> ScramServer {
        ScramServer {
            verifier,
            server_nonce: nonce.to_string(),
            client_first_bare: None,
            server_first: None,
            combined_nonce: None,
        }
    }

    /// Process `client-first-message`, producing `server-first-message`.
    pub fn handle_client_first(&mut self, message: &str) -> Result<String, AuthError> {
        // gs2 header: "n,," (no channel binding) or "y,,".
        let bare = message
            .strip_prefix("n,,")
            .or_else(|| message.strip_prefix("y,,"))
            .ok_or_else(|| AuthError::Sasl("unsupported gs2 header".to_string()))?;

        let mut client_nonce = None;
        for field in bare.split(',') {
            match field.split_once('=') {
                Some(("r", value)) => client_nonce = Some(value.to_string()),
                Some(("n", _)) | Some(("m", _)) => {}
                _ => {}
            }
        }
        let client_nonce =
            client_nonce.ok_or_else(|| AuthError::Sasl("missing client nonce".to_string()))?;

        let combined = format!("{client_nonce}{}", self.server_nonce);
        let server_first = format!(
            "r={combined},s={},i={}",
            BASE64.encode(&self.verifier.salt),
            self.verifier.iterations
        );

        self.client_first_bare = Some(bare.to_string());
        self.combined_nonce = Some(combined);
        self.server_first = Some(server_first.clone());
        Ok(server_first)
    }

    /// Verify `client-final-message`; on success returns
    /// `server-final-message` carrying the server signature.
    pub fn handle_client_final(&mut self, message: &str) -> Result<String, AuthError> {
        let (client_first_bare, server_first, combined_nonce) = match (
            &self.client_first_bare,
            &self.server_first,
            &self.combined_nonce,
        ) {
            (Some(a), Some(b), Some(c)) => (a.clone(), b.clone(), c.clone()),
            _ => return Err(AuthError::Sasl("client-final before client-first".to_string())),
        };

        let mut channel_binding = None;
        let mut nonce = None;
        let mut proof = None;
        for field in message.split(',') {
            match field.split_once('=') {
                Some(("c", value)) => channel_binding = Some(value.to_string()),
                Some(("r", value)) => nonce = Some(value.to_string()),
                Some(("p", value)) => proof = Some(value.to_string()),
                _ => {}
            }
        }

        // "biws" is base64("n,,"), "eSws" is base64("y,,").
        match channel_binding.as_deref() {
            Some("biws") | Some("eSws") => {}
            _ => return Err(AuthError::Sasl("bad channel binding".to_string())),
        }
        if nonce.as_deref() != Some(combined_nonce.as_str()) {
            return Err(AuthError::Sasl("nonce mismatch".to_string()));
        }
        let proof = proof.ok_or_else(|| AuthError::Sasl("missing proof".to_string()))?;
        let proof: Vec<u8> = BASE64
            .decode(proof)
            .map_err(|_| AuthError::Sasl("proof is not valid base64".to_string()))?;

        let client_final_without_proof = format!("c=biws,r={combined_nonce}");
        let auth_message =
            format!("{client_first_bare},{server_first},{client_final_without_proof}");

        let client_signature = hmac(&self.verifier.stored_key, auth_message.as_bytes());
        if proof.len() != client_signature.len() {
            return Err(AuthError::Sasl("bad proof length".to_string()));
        }
        let client_key: Vec<u8> = proof
            .iter()
            .zip(client_signature.iter())
            .map(|(p, s)| p ^ s)
            .collect();
        let recovered_stored_key: [u8; 32] = Sha256::digest(&client_key).into();

        // Constant-time-ish compare; a timing oracle on a 256-bit digest is
        // not practical but do not short-circuit anyway.
        let mut diff = 0u8;
        for (a, b) in recovered_stored_key.iter().zip(self.verifier.stored_key.iter()) {
            diff |= a ^ b;
        }
        if diff != 0 {
            return Err(AuthError::Sasl("proof verification failed".to_string()));
        }

        let server_signature = hmac(&self.verifier.server_key, auth_message.as_bytes());
        Ok(format!("v={}", BASE64.encode(server_signature)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A client implementation good enough to drive the server side.
    fn client_proof(
        password: &str,
        salt: &[u8],
        iterations: u32,
        auth_message: &str,
    ) -> (Vec<u8>, [u8; 32]) {
        let prepared = stringprep::saslprep(password).unwrap();
        let salted = hi(prepared.as_bytes(), salt, iterations);
        let client_key = hmac(&salted, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();
        let salted_server_key = hmac(&salted, b"Server Key");
        (proof, salted_server_key)
    }

    #[test]
    fn test_full_exchange() {
        let verifier = ScramVerifier::from_password_with_salt(
            "secret",
            b"0123456789abcdef".to_vec(),
            DEFAULT_ITERATIONS,
        )
        .unwrap();
        let mut server = ScramServer::with_nonce(verifier.clone(), "SERVERNONCE");

        let client_first = "n,,n=edgedb,r=CLIENTNONCE";
        let server_first = server.handle_client_first(client_first).unwrap();
        assert!(server_first.starts_with("r=CLIENTNONCESERVERNONCE,s="));

        let combined = "CLIENTNONCESERVERNONCE";
        let client_final_bare = format!("c=biws,r={combined}");
        let auth_message = format!("n=edgedb,r=CLIENTNONCE,{server_first},{client_final_bare}");
        let (proof, server_key) = client_proof(
            "secret",
            b"0123456789abcdef",
            DEFAULT_ITERATIONS,
            &auth_message,
        );

        let client_final = format!("{client_final_bare},p={}", BASE64.encode(&proof));
        let server_final = server.handle_client_final(&client_final).unwrap();

        // The client can verify the server signature too.
        let expected = hmac(&server_key, auth_message.as_bytes());
        assert_eq!(server_final, format!("v={}", BASE64.encode(expected)));
    }

    #[test]
    fn test_wrong_password_rejected() {
        let verifier = ScramVerifier::from_password_with_salt(
            "secret",
            b"0123456789abcdef".to_vec(),
            DEFAULT_ITERATIONS,
        )
        .unwrap();
        let mut server = ScramServer::with_nonce(verifier, "SERVERNONCE");
        let server_first = server.handle_client_first("n,,n=edgedb,r=CLIENTNONCE").unwrap();

        let combined = "CLIENTNONCESERVERNONCE";
        let client_final_bare = format!("c=biws,r={combined}");
        let auth_message = format!("n=edgedb,r=CLIENTNONCE,{server_first},{client_final_bare}");
        let (proof, _) = client_proof(
            "wrong-password",
            b"0123456789abcdef",
            DEFAULT_ITERATIONS,
            &auth_message,
        );
        let client_final = format!("{client_final_bare},p={}", BASE64.encode(&proof));
        assert!(server.handle_client_final(&client_final).is_err());
    }

    #[test]
    fn test_nonce_mismatch_rejected() {
        let verifier = ScramVerifier::from_password("secret").unwrap();
        let mut server = ScramServer::new(verifier);
        server.handle_client_first("n,,n=edgedb,r=CLIENTNONCE").unwrap();
        let err = server
            .handle_client_final("c=biws,r=OTHERNONCE,p=AAAA")
            .unwrap_err();
        assert!(matches!(err, AuthError::Sasl(_)));
    }

    #[test]
    fn test_final_before_first_rejected() {
        let verifier = ScramVerifier::from_password("secret").unwrap();
        let mut server = ScramServer::new(verifier);
        assert!(server.handle_client_final("c=biws,r=x,p=AAAA").is_err());
    }
}
