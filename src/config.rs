use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Socket address for the SSH listener (e.g. `0.0.0.0:2222`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory holding the server host key.
    pub key_dir: PathBuf,
    /// Root directory that contains the served repositories.
    pub repo_dir: PathBuf,
    /// Path to the `git` binary; resolved through `PATH` when relative.
    #[serde(default = "default_git_path")]
    pub git_path: String,
    /// SSH user name clients must log in as.  Empty accepts any name.
    #[serde(default)]
    pub git_user: String,
    /// Require public-key authentication.
    #[serde(default = "bool_true")]
    pub auth: bool,
    /// OpenSSH `authorized_keys` file backing the default key lookup.
    #[serde(default)]
    pub authorized_keys: Option<PathBuf>,
    /// Initialise a bare repository when a client addresses a missing one.
    #[serde(default)]
    pub auto_create: bool,
    /// Manage the `hooks/` directory of every repository.
    #[serde(default)]
    pub auto_hooks: bool,
    #[serde(default)]
    pub hooks: HookScripts,
    /// Template shown to clients that open an interactive shell.
    #[serde(default)]
    pub banner_template: Option<String>,
    /// Whether the default authorizer lets clients push.
    #[serde(default = "bool_true")]
    pub allow_push: bool,
    /// Report the subprocess's real exit code in `exit-status`.  When false
    /// the status is always 0.
    #[serde(default = "bool_true")]
    pub propagate_exit_status: bool,
    /// Environment variable names clients may set through `env` requests.
    #[serde(default = "default_accept_env")]
    pub accept_env: Vec<String>,
    /// Idle connection timeout in seconds.
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout: u64,
}

fn default_listen() -> String {
    "0.0.0.0:2222".to_string()
}

fn default_git_path() -> String {
    "git".to_string()
}

fn bool_true() -> bool {
    true
}

fn default_accept_env() -> Vec<String> {
    vec!["GIT_PROTOCOL".to_string()]
}

fn default_inactivity_timeout() -> u64 {
    600
}

impl Config {
    /// Location of the server's private host key.
    pub fn host_key_path(&self) -> PathBuf {
        self.key_dir.join("gitgate_ed25519")
    }

    pub fn accepts_env(&self, name: &str) -> bool {
        self.accept_env.iter().any(|n| n == name)
    }

    /// Create the repository root if needed and, when hooks are managed,
    /// install them into every existing repository.
    pub async fn setup(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.repo_dir)
            .await
            .with_context(|| {
                format!("failed to create repository root: {}", self.repo_dir.display())
            })?;

        if self.auto_hooks {
            crate::git::repo::install_hooks_in_all(&self.repo_dir, &self.hooks).await?;
        }

        info!(repo_dir = %self.repo_dir.display(), "repository root ready");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Server-side hook scripts written into each repository's `hooks/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HookScripts {
    #[serde(default)]
    pub pre_receive: String,
    #[serde(default)]
    pub update: String,
    #[serde(default)]
    pub post_receive: String,
}

impl HookScripts {
    /// `(file name, script)` pairs in the order git runs them.
    pub fn scripts(&self) -> [(&'static str, &str); 3] {
        [
            ("pre-receive", self.pre_receive.as_str()),
            ("update", self.update.as_str()),
            ("post-receive", self.post_receive.as_str()),
        ]
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.key_dir.as_os_str().is_empty(),
        "key_dir must not be empty"
    );
    anyhow::ensure!(
        !config.repo_dir.as_os_str().is_empty(),
        "repo_dir must not be empty"
    );
    anyhow::ensure!(!config.git_path.is_empty(), "git_path must not be empty");
    config
        .listen
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid listen address: {:?}", config.listen))?;
    anyhow::ensure!(
        !config.auth || config.authorized_keys.is_some(),
        "authorized_keys is required when auth is enabled"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse("key_dir: /var/lib/gitgate/keys\nrepo_dir: /srv/git\nauth: false\n");
        assert_eq!(config.listen, "0.0.0.0:2222");
        assert_eq!(config.git_path, "git");
        assert!(config.git_user.is_empty());
        assert!(!config.auto_create);
        assert!(!config.auto_hooks);
        assert!(config.allow_push);
        assert!(config.propagate_exit_status);
        assert_eq!(config.accept_env, vec!["GIT_PROTOCOL"]);
        assert_eq!(config.inactivity_timeout, 600);
        assert_eq!(config.hooks, HookScripts::default());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn full_config_parses() {
        let config = parse(
            r##"
listen: 127.0.0.1:2022
key_dir: /keys
repo_dir: /repos
git_path: /usr/bin/git
git_user: git
authorized_keys: /etc/gitgate/authorized_keys
auto_create: true
auto_hooks: true
hooks:
  pre_receive: "#!/bin/sh\nexit 0\n"
banner_template: "Hi {{ .Name }}"
allow_push: false
propagate_exit_status: false
accept_env: [GIT_PROTOCOL, LANG]
"##,
        );
        assert_eq!(config.git_user, "git");
        assert_eq!(config.hooks.pre_receive, "#!/bin/sh\nexit 0\n");
        assert!(config.hooks.update.is_empty());
        assert_eq!(config.banner_template.as_deref(), Some("Hi {{ .Name }}"));
        assert!(!config.allow_push);
        assert!(config.accepts_env("LANG"));
        assert!(!config.accepts_env("LD_PRELOAD"));
        assert_eq!(config.host_key_path(), PathBuf::from("/keys/gitgate_ed25519"));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn auth_requires_authorized_keys() {
        let config = parse("key_dir: /k\nrepo_dir: /r\n");
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("authorized_keys"));
    }

    #[test]
    fn rejects_bad_listen_address() {
        let config = parse("key_dir: /k\nrepo_dir: /r\nauth: false\nlisten: nowhere\n");
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn load_config_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "key_dir: /k\nrepo_dir: /r\nauth: false\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.repo_dir, PathBuf::from("/r"));

        assert!(load_config(tmp.path().join("missing.yaml")).is_err());
    }

    #[tokio::test]
    async fn setup_creates_root_and_installs_hooks() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("repos");
        std::fs::create_dir_all(root.join("existing")).unwrap();
        let mut config = parse("key_dir: /k\nrepo_dir: /r\nauth: false\nauto_hooks: true\n");
        config.repo_dir = root.clone();
        config.hooks.update = "#!/bin/sh\n".into();

        config.setup().await.unwrap();
        assert!(root.join("existing/hooks/update").is_file());

        let mut config = config.clone();
        config.repo_dir = tmp.path().join("fresh");
        config.setup().await.unwrap();
        assert!(tmp.path().join("fresh").is_dir());
    }
}
