//! Authentication handshake. The first line of every connection carries the
//! credentials (`ID:<id>,TOKEN:<password>`); a known id must match its stored
//! password, an unknown id is registered on the spot. Sessions only ever see
//! the resulting `(client_id, outcome)` pair, never the password.

use std::sync::Mutex;

use log::{error, info, warn};
use sha3::{Digest, Sha3_256};

use crate::broker::users::UserStore;
use crate::session::transport::Transport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Existing client, password matched.
    Success,
    /// First connection; the client was registered.
    New,
}

impl AuthOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthOutcome::Success => "SUCCESS",
            AuthOutcome::New => "NEW",
        }
    }
}

/// Contract for the stored-password representation: `hash` produces it,
/// `verify` checks a plaintext against it.
pub trait PasswordScheme: Send + Sync {
    fn hash(&self, plain: &str) -> String;
    fn verify(&self, plain: &str, stored: &str) -> bool;
}

/// SHA3-256 hex digest of the plaintext.
pub struct Sha3Scheme;

impl PasswordScheme for Sha3Scheme {
    fn hash(&self, plain: &str) -> String {
        let digest = Sha3_256::digest(plain.as_bytes());
        digest.iter().map(|byte| format!("{byte:02x}")).collect()
    }

    fn verify(&self, plain: &str, stored: &str) -> bool {
        self.hash(plain) == stored
    }
}

fn parse_credentials(line: &str) -> Option<(String, String)> {
    let (id_part, token_part) = line.split_once(',')?;
    let id = id_part.strip_prefix("ID:")?.trim();
    let token = token_part.strip_prefix("TOKEN:")?.trim();
    if id.is_empty() || token.is_empty() {
        return None;
    }
    Some((id.to_string(), token.to_string()))
}

/// Run the handshake on a fresh connection. Failure answers the peer and
/// closes; success leaves the AUTH response to the caller, which still has a
/// duplicate-session check to make.
pub async fn authenticate<T: Transport>(
    transport: &mut T,
    users: &Mutex<UserStore>,
    scheme: &dyn PasswordScheme,
) -> Option<(String, AuthOutcome)> {
    let line = match transport.read_line().await {
        Ok(Some(line)) => line,
        Ok(None) => {
            info!("connection closed before authenticating");
            return None;
        }
        Err(e) => {
            warn!("read failed during authentication: {e}");
            return None;
        }
    };

    let Some((client_id, token)) = parse_credentials(line.trim()) else {
        warn!("malformed credentials line");
        let _ = transport
            .write_line("AUTH FAIL: Malformed credentials. Use ID:<id>,TOKEN:<password>.")
            .await;
        transport.close().await;
        return None;
    };

    // Resolve the outcome with the store lock held, then answer without it.
    let outcome = {
        let mut store = users.lock().unwrap();
        match store.get(&client_id) {
            Some(stored) => {
                if scheme.verify(&token, stored) {
                    Some(AuthOutcome::Success)
                } else {
                    None
                }
            }
            None => {
                store.insert(&client_id, scheme.hash(&token));
                if let Err(e) = store.save() {
                    error!("user store save failed after registering {client_id}: {e}");
                }
                Some(AuthOutcome::New)
            }
        }
    };

    match outcome {
        Some(outcome) => {
            info!("authentication {} for {client_id}", outcome.as_str());
            Some((client_id, outcome))
        }
        None => {
            warn!("password mismatch for {client_id}");
            let _ = transport.write_line("AUTH FAIL: Invalid credentials.").await;
            transport.close().await;
            None
        }
    }
}
