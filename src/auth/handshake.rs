use tracing::debug;

use super::identity::{ConnectionMeta, SessionContext};
use super::policy::Capabilities;
use crate::error::AuthError;

/// Run the public-key handshake: pre-login check, then key lookup.
///
/// Key material is only examined once the pre-login check has passed.  On
/// success the identity and the claimed user name are bound into the
/// connection's [`SessionContext`].
pub async fn authenticate(
    caps: &Capabilities,
    meta: &ConnectionMeta,
    authorized_key: &str,
) -> Result<SessionContext, AuthError> {
    caps.pre_login.check(meta).await?;

    let identity = caps
        .key_lookup
        .lookup(authorized_key)
        .await?
        .ok_or(AuthError::NoIdentity)?;

    debug!(user = %meta.user, identity = %identity.id, "handshake accepted");
    Ok(SessionContext {
        identity,
        user: meta.user.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::auth::identity::Identity;
    use crate::auth::policy::{KeyLookup, PushPolicy, RequiredUser};
    use crate::banner::TemplateBanner;

    #[derive(Default)]
    struct CountingLookup {
        calls: AtomicUsize,
        identity: Option<Identity>,
    }

    #[async_trait]
    impl KeyLookup for CountingLookup {
        async fn lookup(&self, _authorized_key: &str) -> Result<Option<Identity>, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.identity.clone())
        }
    }

    fn caps(lookup: Arc<CountingLookup>) -> Capabilities {
        Capabilities {
            pre_login: Arc::new(RequiredUser::new(Some("git".into()))),
            key_lookup: lookup,
            authorizer: Arc::new(PushPolicy::new(true)),
            banner: Arc::new(TemplateBanner::new(None)),
        }
    }

    fn meta(user: &str) -> ConnectionMeta {
        ConnectionMeta {
            user: user.into(),
            peer_addr: "127.0.0.1:50000".parse().ok(),
        }
    }

    fn alice() -> Identity {
        Identity {
            id: "42".into(),
            name: "alice".into(),
            fingerprint: "SHA256:abc".into(),
            content: "ssh-ed25519 AAAA".into(),
        }
    }

    #[tokio::test]
    async fn pre_login_rejection_skips_key_lookup() {
        let lookup = Arc::new(CountingLookup {
            identity: Some(alice()),
            ..Default::default()
        });
        let err = authenticate(&caps(lookup.clone()), &meta("root"), "ssh-ed25519 AAAA")
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::IncorrectUser("root".into()));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn accepted_key_binds_identity_and_user() {
        let lookup = Arc::new(CountingLookup {
            identity: Some(alice()),
            ..Default::default()
        });
        let ctx = authenticate(&caps(lookup.clone()), &meta("git"), "ssh-ed25519 AAAA")
            .await
            .unwrap();
        assert_eq!(ctx.identity, alice());
        assert_eq!(ctx.user, "git");
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_identity_is_a_failure() {
        let lookup = Arc::new(CountingLookup::default());
        let err = authenticate(&caps(lookup), &meta("git"), "ssh-ed25519 AAAA")
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::NoIdentity);
        assert_eq!(err.to_string(), "lookup returned no identity");
    }
}
