use std::net::SocketAddr;

use base64::Engine as _;
use sha2::{Digest, Sha256};

/// The domain record behind an authenticated public key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub fingerprint: String,
    /// The authorized-key line (`<type> <base64>`) the client presented.
    pub content: String,
}

impl Identity {
    /// Identity given to every client when authentication is disabled.
    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// Per-connection facts established once by the handshake.
///
/// Every channel opened on the connection reads from it; nothing mutates it
/// after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub identity: Identity,
    /// The user name the client logged in as.
    pub user: String,
}

/// What a pre-login check gets to see about a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMeta {
    pub user: String,
    pub peer_addr: Option<SocketAddr>,
}

/// SHA-256 fingerprint of a base64 key blob, formatted like
/// `ssh-keygen -l` (`SHA256:<unpadded base64>`).
pub fn fingerprint(blob_b64: &str) -> Option<String> {
    let blob = base64::engine::general_purpose::STANDARD
        .decode(blob_b64.as_bytes())
        .ok()?;
    let hash = Sha256::digest(&blob);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    Some(format!("SHA256:{encoded}"))
}
