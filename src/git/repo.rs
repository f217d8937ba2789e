//! Repository bookkeeping under the repository root.
//!
//! Provides existence checks, `git init --bare` for auto-created
//! repositories, and installation of the configured server-side hook
//! scripts.  All file-system operations go through Tokio.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::config::{Config, HookScripts};

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// The repositories served from one root directory.
#[derive(Debug, Clone)]
pub struct RepoStore {
    root: PathBuf,
    git_path: String,
    hooks: Option<HookScripts>,
}

impl RepoStore {
    pub fn from_config(config: &Config) -> Self {
        Self {
            root: config.repo_dir.clone(),
            git_path: config.git_path.clone(),
            hooks: config.auto_hooks.then(|| config.hooks.clone()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk location of a normalized repository path.
    pub fn repo_path(&self, repo: &str) -> PathBuf {
        self.root.join(repo)
    }

    /// A repository exists when its directory holds a `HEAD` file.
    pub async fn exists(&self, repo: &str) -> bool {
        tokio::fs::metadata(self.repo_path(repo).join("HEAD"))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Create a bare repository and, when hooks are managed, install them.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn init(&self, repo: &str) -> Result<()> {
        let path = self.repo_path(repo);
        init_bare_repo(&self.git_path, &path).await?;

        if let Some(ref hooks) = self.hooks {
            install_hooks(&path, hooks).await?;
        }

        info!(repo, path = %path.display(), "repository created");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Run `git init --bare` at `path`, creating missing parents.  An existing
/// repository is left untouched.
#[instrument(fields(path = %path.display()))]
pub async fn init_bare_repo(git_path: &str, path: &Path) -> Result<()> {
    if path.join("HEAD").is_file() {
        debug!("bare repo already exists; skipping init");
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create parent directory: {}", parent.display()))?;
    }

    let output = Command::new(git_path)
        .arg("init")
        .arg("--bare")
        .arg(path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output()
        .await
        .with_context(|| format!("failed to spawn {git_path} init --bare"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git init --bare failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("bare repo initialised");
    Ok(())
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Replace the contents of `<repo>/hooks` with the configured scripts.
///
/// Every existing file in the hooks directory is removed first; scripts with
/// empty content are not written.
#[instrument(skip(hooks), fields(repo = %repo_path.display()))]
pub async fn install_hooks(repo_path: &Path, hooks: &HookScripts) -> Result<()> {
    let hooks_dir = repo_path.join("hooks");

    if let Ok(mut entries) = tokio::fs::read_dir(&hooks_dir).await {
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                tokio::fs::remove_file(entry.path())
                    .await
                    .with_context(|| format!("failed to remove hook {}", entry.path().display()))?;
            }
        }
    } else {
        tokio::fs::create_dir_all(&hooks_dir)
            .await
            .with_context(|| format!("failed to create {}", hooks_dir.display()))?;
    }

    for (name, script) in hooks.scripts() {
        if script.is_empty() {
            continue;
        }
        let path = hooks_dir.join(name);
        tokio::fs::write(&path, script)
            .await
            .with_context(|| format!("failed to write hook {}", path.display()))?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .await
            .with_context(|| format!("failed to mark hook executable: {}", path.display()))?;
        debug!(hook = name, "hook installed");
    }

    Ok(())
}

/// Install hooks into every directory directly below `root`.
#[instrument(skip(hooks), fields(root = %root.display()))]
pub async fn install_hooks_in_all(root: &Path, hooks: &HookScripts) -> Result<()> {
    let mut entries = tokio::fs::read_dir(root)
        .await
        .with_context(|| format!("failed to list {}", root.display()))?;

    let mut count = 0usize;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            install_hooks(&entry.path(), hooks).await?;
            count += 1;
        }
    }

    info!(repositories = count, "hooks installed");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
