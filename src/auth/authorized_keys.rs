use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::identity::{fingerprint, Identity};
use super::policy::KeyLookup;
use crate::error::AuthError;

/// Key lookup backed by an OpenSSH `authorized_keys` file.
///
/// The file is re-read on every lookup so that key changes apply to the next
/// connection without a restart.  The identity id is the key fingerprint and
/// the name is the line's trailing comment.
#[derive(Debug, Clone)]
pub struct AuthorizedKeys {
    path: PathBuf,
}

impl AuthorizedKeys {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl KeyLookup for AuthorizedKeys {
    #[instrument(skip(self, authorized_key), fields(path = %self.path.display()))]
    async fn lookup(&self, authorized_key: &str) -> Result<Option<Identity>, AuthError> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            AuthError::Lookup(format!("failed to read {}: {e}", self.path.display()))
        })?;
        let identity = find_identity(&contents, authorized_key);
        if identity.is_none() {
            debug!("key not listed");
        }
        Ok(identity)
    }
}

/// Find the line listing `authorized_key` (`<type> <base64>`).  Lines may
/// carry an options prefix before the key type.
fn find_identity(contents: &str, authorized_key: &str) -> Option<Identity> {
    let mut wanted = authorized_key.split_whitespace();
    let (kind, blob) = (wanted.next()?, wanted.next()?);

    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .find_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let at = tokens
                .windows(2)
                .position(|pair| pair[0] == kind && pair[1] == blob)?;
            let fp = fingerprint(blob)?;
            let comment = tokens[at + 2..].join(" ");
            Some(Identity {
                id: fp.clone(),
                name: if comment.is_empty() { fp.clone() } else { comment },
                fingerprint: fp,
                content: format!("{kind} {blob}"),
            })
        })
}
