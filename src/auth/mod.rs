//! Authentication: SCRAM-SHA-256 for the binary protocol, Basic/Bearer for
//! the HTTP surface.

pub mod scram;

use std::collections::HashMap;

use crate::config::{AuthMethodName, Config};
use crate::errors::{AuthError, Error};

use scram::ScramVerifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Trust,
    Scram,
}

/// Credential store derived from the configuration at startup.
pub struct Authenticator {
    method: AuthMethod,
    verifiers: HashMap<String, ScramVerifier>,
    passwords: HashMap<String, String>,
    secret_key: Option<String>,
}

impl Authenticator {
    pub fn from_config(config: &Config) -> Result<Authenticator, Error> {
        let method = match config.general.auth_method {
            AuthMethodName::Trust => AuthMethod::Trust,
            AuthMethodName::Scram => AuthMethod::Scram,
        };
        let mut verifiers = HashMap::new();
        let mut passwords = HashMap::new();
        for user in &config.users {
            verifiers.insert(
                user.username.clone(),
                ScramVerifier::from_password(&user.password)?,
            );
            passwords.insert(user.username.clone(), user.password.clone());
        }
        Ok(Authenticator {
            method,
            verifiers,
            passwords,
            secret_key: config.general.secret_key.clone(),
        })
    }

    pub fn method(&self) -> AuthMethod {
        self.method
    }

    pub fn scram_verifier(&self, username: &str) -> Result<ScramVerifier, AuthError> {
        self.verifiers
            .get(username)
            .cloned()
            .ok_or_else(|| AuthError::Failed(username.to_string()))
    }

    /// HTTP Basic: compare without short-circuiting on the first byte.
    pub fn check_password(&self, username: &str, password: &str) -> bool {
        if self.method == AuthMethod::Trust {
            return true;
        }
        let Some(expected) = self.passwords.get(username) else {
            return false;
        };
        if expected.len() != password.len() {
            return false;
        }
        expected
            .bytes()
            .zip(password.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// HTTP Bearer: the instance secret key, when one is configured.
    pub fn check_bearer(&self, token: &str) -> bool {
        match &self.secret_key {
            Some(secret) => secret == token,
            None => false,
        }
    }
}
