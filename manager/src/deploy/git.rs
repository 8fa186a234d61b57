//! Source fetching: local copies and git clones with protocol and branch fallback

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use crate::cmd::{CommandRunner, CommandSpec};
use crate::errors::ManagerError;
use crate::filesys::dir::Dir;
use crate::models::deployment::{ResolvedSource, SourceProtocol};
use crate::utils::shell_quote;

/// Branches tried after the requested one
pub const FALLBACK_BRANCHES: [&str; 4] = ["main", "master", "develop", "dev"];

/// Where an application's source lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    /// scp-like `user@host:path`
    ScpLike { user: String, host: String, path: String },

    /// `ssh://`, `https://`, `http://` or `git://` URL
    Url(Url),

    /// Directory on this host
    Local(PathBuf),
}

impl SourceLocator {
    pub fn parse(source: &str) -> Result<Self, ManagerError> {
        let source = source.trim();
        let invalid = |why: String| ManagerError::ValidationError(format!("Invalid source '{}': {}", source, why));

        if source.is_empty() {
            return Err(invalid("empty".to_string()));
        }

        if source.contains("://") {
            let url = Url::parse(source).map_err(|e| invalid(e.to_string()))?;
            if !matches!(url.scheme(), "https" | "http" | "ssh" | "git") {
                return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
            }
            if url.host_str().map_or(true, str::is_empty) {
                return Err(invalid("missing host".to_string()));
            }
            return Ok(SourceLocator::Url(url));
        }

        if let Some((user_host, path)) = source.split_once(':') {
            if let Some((user, host)) = user_host.split_once('@') {
                if user.is_empty() || host.is_empty() || path.is_empty() || host.contains('/') {
                    return Err(invalid("expected user@host:path".to_string()));
                }
                return Ok(SourceLocator::ScpLike {
                    user: user.to_string(),
                    host: host.to_string(),
                    path: path.trim_start_matches('/').to_string(),
                });
            }
        }

        if source.chars().any(|c| c == '\n' || c == '\0') {
            return Err(invalid("contains control characters".to_string()));
        }
        Ok(SourceLocator::Local(PathBuf::from(source)))
    }

    pub fn protocol(&self) -> SourceProtocol {
        match self {
            SourceLocator::ScpLike { .. } => SourceProtocol::Ssh,
            SourceLocator::Url(url) if url.scheme() == "ssh" => SourceProtocol::Ssh,
            SourceLocator::Url(_) => SourceProtocol::Https,
            SourceLocator::Local(_) => SourceProtocol::Local,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, SourceLocator::Local(_))
    }

    /// The locator as passed to git
    pub fn remote(&self) -> String {
        match self {
            SourceLocator::ScpLike { user, host, path } => format!("{}@{}:{}", user, host, path),
            SourceLocator::Url(url) => url.to_string(),
            SourceLocator::Local(path) => path.display().to_string(),
        }
    }

    /// HTTPS rewrite of an SSH locator
    pub fn https_fallback(&self) -> Option<String> {
        match self {
            SourceLocator::ScpLike { host, path, .. } => Some(format!("https://{}/{}", host, path)),
            SourceLocator::Url(url) if url.scheme() == "ssh" => {
                let host = url.host_str()?;
                Some(format!("https://{}{}", host, url.path()))
            }
            _ => None,
        }
    }
}

/// Requested branch first, then the defaults, without duplicates
pub fn branch_candidates(requested: &str) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::with_capacity(FALLBACK_BRANCHES.len() + 1);
    for branch in std::iter::once(requested).chain(FALLBACK_BRANCHES) {
        if !branch.is_empty() && !candidates.iter().any(|c| c == branch) {
            candidates.push(branch.to_string());
        }
    }
    candidates
}

/// Clones and refreshes application sources
#[derive(Clone)]
pub struct SourceFetcher {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl SourceFetcher {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    fn git(&self, args: &str) -> CommandSpec {
        CommandSpec::new(format!("git {}", args))
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_SSH_COMMAND", "ssh -o BatchMode=yes -o ConnectTimeout=15")
            .timeout(self.timeout)
            .unchecked()
    }

    /// Materialize `locator` at `dest`, which must not hold anything worth keeping.
    ///
    /// A failed fetch never leaves a partial destination behind.
    pub async fn fetch(
        &self,
        locator: &SourceLocator,
        branch: &str,
        dest: &Dir,
    ) -> Result<ResolvedSource, ManagerError> {
        dest.delete().await?;

        if let SourceLocator::Local(path) = locator {
            return self.copy_local(path, dest).await;
        }

        let mut remotes = vec![(locator.protocol(), locator.remote())];
        if let Some(https) = locator.https_fallback() {
            remotes.push((SourceProtocol::Https, https));
        }

        let candidates = branch_candidates(branch);
        let mut attempts = Vec::new();

        for (hop, (protocol, remote)) in remotes.iter().enumerate() {
            if hop > 0 {
                warn!("SSH clone of {} failed, retrying over HTTPS: {}", locator.remote(), remote);
            }
            for candidate in &candidates {
                attempts.push(format!("{}:{}", protocol, candidate));
                if self.clone_branch(remote, candidate, dest).await {
                    info!("Cloned {} ({}) over {}", remote, candidate, protocol);
                    self.trust(dest).await;
                    return Ok(ResolvedSource {
                        protocol: *protocol,
                        protocol_substituted: hop > 0,
                        branch: Some(candidate.clone()),
                        branch_substituted: candidate != branch,
                        commit: self.head_commit(dest).await,
                        attempts,
                    });
                }
                dest.delete().await?;
            }
        }

        Err(ManagerError::SourceUnavailable { attempts })
    }

    /// Move an existing clone at `dir` to the newest commit of the first
    /// candidate branch that exists on its origin.
    ///
    /// All remote heads are fetched in one round trip; candidates are then
    /// checked against the local remote-tracking refs.
    pub async fn refresh(&self, dir: &Dir, branch: &str) -> Result<ResolvedSource, ManagerError> {
        let path = shell_quote(&dir.path().display().to_string());
        let protocol = self.origin_protocol(dir).await;
        let candidates = branch_candidates(branch);

        let fetch = format!(
            "-C {} fetch --depth 1 --prune origin '+refs/heads/*:refs/remotes/origin/*'",
            path
        );
        let output = self.runner.run(&self.git(&fetch)).await?;
        if !output.success() {
            warn!("Fetching origin of {} failed: {}", dir.path().display(), output.tail());
            return Err(ManagerError::SourceUnavailable {
                attempts: candidates.iter().map(|c| format!("{}:{}", protocol, c)).collect(),
            });
        }

        let mut attempts = Vec::new();
        for candidate in candidates {
            attempts.push(format!("{}:{}", protocol, candidate));

            let verify = format!(
                "-C {} rev-parse --verify --quiet refs/remotes/origin/{}",
                path, candidate
            );
            if !self.runner.run(&self.git(&verify)).await?.success() {
                debug!("origin has no branch {}", candidate);
                continue;
            }

            let reset = format!("-C {} reset --hard origin/{}", path, candidate);
            let output = self.runner.run(&self.git(&reset)).await?;
            if !output.success() {
                warn!("git {} failed: {}", reset, output.tail());
                return Err(ManagerError::SourceUnavailable { attempts });
            }

            info!("Refreshed {} to origin/{}", dir.path().display(), candidate);
            return Ok(ResolvedSource {
                protocol,
                protocol_substituted: false,
                branch_substituted: candidate != branch,
                branch: Some(candidate),
                commit: self.head_commit(dir).await,
                attempts,
            });
        }

        Err(ManagerError::SourceUnavailable { attempts })
    }

    async fn copy_local(&self, path: &Path, dest: &Dir) -> Result<ResolvedSource, ManagerError> {
        let source = Dir::new(path);
        let location = path.display().to_string();
        if !source.exists().await {
            return Err(ManagerError::SourceUnavailable {
                attempts: vec![format!("local:{}", location)],
            });
        }
        if let Err(e) = source.copy_to(dest.path()).await {
            warn!("Copying {} failed: {}", location, e);
            dest.delete().await?;
            return Err(ManagerError::SourceUnavailable {
                attempts: vec![format!("local:{}", location)],
            });
        }
        info!("Copied local source {}", location);
        Ok(ResolvedSource::local(&location))
    }

    async fn clone_branch(&self, remote: &str, branch: &str, dest: &Dir) -> bool {
        let args = format!(
            "clone --depth 1 --branch {} {} {}",
            branch,
            shell_quote(remote),
            shell_quote(&dest.path().display().to_string())
        );
        match self.runner.run(&self.git(&args)).await {
            Ok(output) if output.success() => dest.is_populated().await,
            Ok(output) => {
                debug!("Clone of {} ({}) failed: {}", remote, branch, output.tail());
                false
            }
            Err(e) => {
                debug!("Clone of {} ({}) failed: {}", remote, branch, e);
                false
            }
        }
    }

    async fn trust(&self, dir: &Dir) {
        let args = format!(
            "config --global --add safe.directory {}",
            shell_quote(&dir.path().display().to_string())
        );
        match self.runner.run(&self.git(&args)).await {
            Ok(output) if output.success() => {}
            Ok(output) => debug!("Could not mark {} as safe: {}", dir.path().display(), output.tail()),
            Err(e) => debug!("Could not mark {} as safe: {}", dir.path().display(), e),
        }
    }

    async fn head_commit(&self, dir: &Dir) -> Option<String> {
        let args = format!("-C {} rev-parse --short HEAD", shell_quote(&dir.path().display().to_string()));
        match self.runner.run(&self.git(&args)).await {
            Ok(output) if output.success() => {
                Some(output.stdout.trim().to_string()).filter(|s| !s.is_empty())
            }
            _ => None,
        }
    }

    async fn origin_protocol(&self, dir: &Dir) -> SourceProtocol {
        let args = format!("-C {} remote get-url origin", shell_quote(&dir.path().display().to_string()));
        match self.runner.run(&self.git(&args)).await {
            Ok(output) if output.success() => SourceLocator::parse(output.stdout.trim())
                .map(|l| l.protocol())
                .unwrap_or(SourceProtocol::Https),
            _ => SourceProtocol::Https,
        }
    }
}
