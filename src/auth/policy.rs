//! The extension points of the SSH front door.
//!
//! A server is constructed with a [`Capabilities`] bundle.  Each capability
//! is a trait object so deployments can swap in their own user directory or
//! permission model; the defaults here are driven by [`Config`].

use std::path::Component;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use super::authorized_keys::AuthorizedKeys;
use super::identity::{ConnectionMeta, Identity, SessionContext};
use crate::banner::{BannerRenderer, TemplateBanner};
use crate::config::Config;
use crate::error::{AuthError, AuthorizationError};
use crate::git::GitCommand;

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Approves or rejects a connection before any key material is examined.
#[async_trait]
pub trait PreLogin: Send + Sync {
    async fn check(&self, meta: &ConnectionMeta) -> Result<(), AuthError>;
}

/// Maps the authorized-key line a client presented to an [`Identity`].
///
/// `Ok(None)` means the key is unknown.
#[async_trait]
pub trait KeyLookup: Send + Sync {
    async fn lookup(&self, authorized_key: &str) -> Result<Option<Identity>, AuthError>;
}

/// Approves or denies one git operation for an authenticated session.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        command: &GitCommand,
        context: &SessionContext,
    ) -> Result<(), AuthorizationError>;
}

/// Everything the connection handler delegates to.
#[derive(Clone)]
pub struct Capabilities {
    pub pre_login: Arc<dyn PreLogin>,
    pub key_lookup: Arc<dyn KeyLookup>,
    pub authorizer: Arc<dyn Authorizer>,
    pub banner: Arc<dyn BannerRenderer>,
}

impl Capabilities {
    /// The default capability set for a configuration.
    pub fn from_config(config: &Config) -> Self {
        let required = (config.auth && !config.git_user.is_empty()).then(|| config.git_user.clone());
        Self {
            pre_login: Arc::new(RequiredUser::new(required)),
            key_lookup: Arc::new(AuthorizedKeys::new(
                config.authorized_keys.clone().unwrap_or_default(),
            )),
            authorizer: Arc::new(PushPolicy::new(config.allow_push)),
            banner: Arc::new(TemplateBanner::new(config.banner_template.as_deref())),
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Rejects logins under any user name other than the configured one.
#[derive(Debug, Clone, Default)]
pub struct RequiredUser {
    required: Option<String>,
}

impl RequiredUser {
    pub fn new(required: Option<String>) -> Self {
        Self { required }
    }
}

#[async_trait]
impl PreLogin for RequiredUser {
    async fn check(&self, meta: &ConnectionMeta) -> Result<(), AuthError> {
        match self.required {
            Some(ref required) if *required != meta.user => {
                Err(AuthError::IncorrectUser(meta.user.clone()))
            }
            _ => Ok(()),
        }
    }
}

/// Allows reads of any repository inside the root; allows pushes only when
/// enabled.
#[derive(Debug, Clone, Copy)]
pub struct PushPolicy {
    allow_push: bool,
}

impl PushPolicy {
    pub fn new(allow_push: bool) -> Self {
        Self { allow_push }
    }
}

#[async_trait]
impl Authorizer for PushPolicy {
    async fn authorize(
        &self,
        command: &GitCommand,
        _context: &SessionContext,
    ) -> Result<(), AuthorizationError> {
        let deny = |reason: &str| AuthorizationError::Denied {
            verb: command.verb.subcommand(),
            repo: command.repo.clone(),
            reason: reason.to_string(),
        };

        if !is_contained(&command.repo) {
            return Err(deny("repository path leaves the repository root"));
        }
        if command.verb.is_write() && !self.allow_push {
            return Err(deny("push is disabled"));
        }
        Ok(())
    }
}

/// A relative path made only of normal components.
fn is_contained(repo: &str) -> bool {
    !repo.is_empty()
        && Path::new(repo)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::parse_git_command;

    fn meta(user: &str) -> ConnectionMeta {
        ConnectionMeta {
            user: user.to_string(),
            peer_addr: None,
        }
    }

    fn context() -> SessionContext {
        SessionContext {
            identity: Identity::anonymous(),
            user: "git".into(),
        }
    }

    #[tokio::test]
    async fn required_user_matches_exactly() {
        let check = RequiredUser::new(Some("git".into()));
        assert!(check.check(&meta("git")).await.is_ok());
        assert_eq!(
            check.check(&meta("root")).await,
            Err(AuthError::IncorrectUser("root".into()))
        );
    }

    #[tokio::test]
    async fn no_required_user_accepts_anyone() {
        let check = RequiredUser::default();
        assert!(check.check(&meta("anyone")).await.is_ok());
    }

    #[tokio::test]
    async fn push_policy_allows_reads() {
        let policy = PushPolicy::new(false);
        let cmd = parse_git_command("git-upload-pack 'org/repo.git'").unwrap();
        assert!(policy.authorize(&cmd, &context()).await.is_ok());
    }

    #[tokio::test]
    async fn push_policy_denies_writes_when_disabled() {
        let cmd = parse_git_command("git-receive-pack 'org/repo.git'").unwrap();
        assert!(PushPolicy::new(true).authorize(&cmd, &context()).await.is_ok());
        let err = PushPolicy::new(false)
            .authorize(&cmd, &context())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("push is disabled"));
    }

    #[tokio::test]
    async fn push_policy_denies_escaping_paths() {
        let policy = PushPolicy::new(true);
        for cmd in [
            "git-upload-pack '../etc.git'",
            "git-upload-pack 'org/../../x'",
            "git-upload-pack '//etc/passwd'",
            "git-upload-pack ''",
            "git-upload-pack './repo'",
        ] {
            let cmd = parse_git_command(cmd).unwrap();
            assert!(
                policy.authorize(&cmd, &context()).await.is_err(),
                "{} should be denied",
                cmd.original
            );
        }
    }

    #[test]
    fn from_config_requires_user_only_with_auth() {
        let config: Config =
            serde_yaml::from_str("key_dir: /k\nrepo_dir: /r\nauth: false\ngit_user: git\n")
                .unwrap();
        let caps = Capabilities::from_config(&config);
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        assert!(rt.block_on(caps.pre_login.check(&meta("other"))).is_ok());
    }
}
