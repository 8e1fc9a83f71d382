//! Source retrieval

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use url::Url;

use crate::deploy::process::{CommandSpec, ProcessRunner};
use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::models::deployment::DeploymentRequest;
use crate::utils::{calc_exp_backoff, CooldownOptions};

const FETCH_ATTEMPTS: u32 = 3;

/// Materializes application source into a directory
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, request: &DeploymentRequest, dest: &Dir) -> Result<(), AgentError>;
}

/// Shallow single-revision fetch with the git CLI
pub struct GitSourceFetcher {
    runner: Arc<dyn ProcessRunner>,
    git_bin: String,
    timeout: Duration,
    backoff: CooldownOptions,
}

impl GitSourceFetcher {
    pub fn new(runner: Arc<dyn ProcessRunner>, git_bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            git_bin: git_bin.into(),
            timeout,
            backoff: CooldownOptions {
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(20),
                multiplier: 2.0,
            },
        }
    }

    pub fn with_backoff(mut self, backoff: CooldownOptions) -> Self {
        self.backoff = backoff;
        self
    }

    fn git<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(&self.git_bin)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .timeout(self.timeout)
    }

    /// Commands for one attempt, in order
    fn plan(&self, request: &DeploymentRequest, remote: &str, dest: &Dir) -> Vec<CommandSpec> {
        let dest_path = dest.path().display().to_string();
        match &request.commit_sha {
            Some(sha) => vec![
                self.git(["init", "-q", dest_path.as_str()]),
                self.git(["remote", "add", "origin", remote]).cwd(dest.path()),
                self.git(["fetch", "--depth", "1", "origin", sha.as_str()])
                    .cwd(dest.path()),
                self.git(["checkout", "-q", "FETCH_HEAD"]).cwd(dest.path()),
            ],
            None => vec![self.git([
                "clone",
                "-q",
                "--depth",
                "1",
                "--single-branch",
                "--branch",
                request.branch.as_str(),
                remote,
                dest_path.as_str(),
            ])],
        }
    }

    async fn attempt(
        &self,
        request: &DeploymentRequest,
        remote: &str,
        dest: &Dir,
        secret: Option<&str>,
    ) -> Result<(), AgentError> {
        if request.commit_sha.is_some() {
            dest.reset().await?;
        } else {
            // git clone wants to create the directory itself
            dest.delete().await?;
        }

        for spec in self.plan(request, remote, dest) {
            let output = self.runner.run(&spec).await.map_err(|e| redacted(e, secret))?;
            if !output.success() {
                let stderr = output.stderr_excerpt();
                return Err(AgentError::SourceError(scrub(
                    &format!("git {} failed: {}", spec.args[0], stderr),
                    secret,
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceFetcher for GitSourceFetcher {
    async fn fetch(&self, request: &DeploymentRequest, dest: &Dir) -> Result<(), AgentError> {
        let secret = request.git_token.as_ref().map(|t| t.expose());
        let remote = with_credential(&request.repo_url, secret);
        let revision = request.commit_sha.as_deref().unwrap_or(&request.branch);
        info!("Fetching {} at {}", request.repo_url, revision);

        let mut last_error = None;
        for attempt in 0..FETCH_ATTEMPTS {
            match self.attempt(request, &remote, dest, secret).await {
                Ok(()) => {
                    debug!("Fetched source into {}", dest.path().display());
                    return Ok(());
                }
                Err(e) => {
                    warn!("Source fetch attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
            if attempt + 1 < FETCH_ATTEMPTS {
                tokio::time::sleep(calc_exp_backoff(&self.backoff, attempt)).await;
            }
        }

        Err(AgentError::SourceError(format!(
            "{} unavailable after {} attempts: {}",
            request.repo_url,
            FETCH_ATTEMPTS,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

/// Embed a token as URL userinfo for HTTP(S) remotes
pub fn with_credential(repo_url: &str, token: Option<&str>) -> String {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return repo_url.to_string();
    };
    match Url::parse(repo_url) {
        Ok(mut url) if url.scheme() == "https" || url.scheme() == "http" => {
            if url.set_username("x-access-token").is_err() || url.set_password(Some(token)).is_err()
            {
                return repo_url.to_string();
            }
            url.to_string()
        }
        _ => repo_url.to_string(),
    }
}

fn scrub(message: &str, secret: Option<&str>) -> String {
    match secret.filter(|s| !s.is_empty()) {
        Some(secret) => message.replace(secret, "***"),
        None => message.to_string(),
    }
}

fn redacted(err: AgentError, secret: Option<&str>) -> AgentError {
    match err {
        AgentError::TimeoutError(m) => AgentError::TimeoutError(scrub(&m, secret)),
        AgentError::ProcessError(m) => AgentError::SourceError(scrub(&m, secret)),
        other => other,
    }
}
