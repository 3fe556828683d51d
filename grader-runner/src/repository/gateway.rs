//! Repository gateway
//!
//! Fetches submitted trees from, and publishes results into, the bare
//! repositories under the git root. Repositories are laid out as
//! `{root}/{lecture}/{assignment}/{kind}/{owner}`.

use async_trait::async_trait;
use grader_core::domain::job::RepoKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::GatewayError;

const COMMITTER_NAME: &str = "grader";
const COMMITTER_EMAIL: &str = "grader@localhost";

/// Identifies one repository in the layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLocator {
    pub lecture_code: String,
    pub assignment_id: i64,
    pub kind: RepoKind,
    pub owner: String,
}

impl RepoLocator {
    pub fn path_under(&self, root: &Path) -> PathBuf {
        root.join(&self.lecture_code)
            .join(self.assignment_id.to_string())
            .join(self.kind.as_str())
            .join(&self.owner)
    }
}

/// Service trait for fetching and publishing directory trees
#[async_trait]
pub trait RepositoryGateway: Send + Sync {
    /// Materializes `source` at `git_ref` into `dest`
    ///
    /// An existing `dest` is replaced. The resulting tree holds the files
    /// only, without repository metadata.
    ///
    /// # Arguments
    /// * `source` - Repository to read from
    /// * `git_ref` - Commit hash or branch name
    /// * `dest` - Directory to create
    async fn fetch_at_ref(
        &self,
        source: &RepoLocator,
        git_ref: &str,
        dest: &Path,
    ) -> Result<(), GatewayError>;

    /// Commits `source_dir` and pushes it as `branch` into `target`
    ///
    /// The target repository is created when missing and an existing branch
    /// of the same name is overwritten.
    async fn publish_branch(
        &self,
        target: &RepoLocator,
        branch: &str,
        source_dir: &Path,
    ) -> Result<(), GatewayError>;
}

/// [`RepositoryGateway`] shelling out to the git executable
#[derive(Debug, Clone)]
pub struct GitGateway {
    root: PathBuf,
    git: PathBuf,
}

impl GitGateway {
    pub fn new(root: impl Into<PathBuf>, git: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            git: git.into(),
        }
    }

    pub fn repo_path(&self, locator: &RepoLocator) -> PathBuf {
        locator.path_under(&self.root)
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String, GatewayError> {
        debug!("git {} (in {})", args.join(" "), cwd.display());

        let output = Command::new(&self.git)
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(GatewayError::Command {
                command: args.join(" "),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl RepositoryGateway for GitGateway {
    async fn fetch_at_ref(
        &self,
        source: &RepoLocator,
        git_ref: &str,
        dest: &Path,
    ) -> Result<(), GatewayError> {
        let repo = self.repo_path(source);
        if !repo.is_dir() {
            return Err(GatewayError::NotFound(repo));
        }

        let parent = dest.parent().unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(parent).await?;
        if dest.exists() {
            tokio::fs::remove_dir_all(dest).await?;
        }

        let repo_arg = repo.to_string_lossy();
        let dest_arg = dest.to_string_lossy();
        self.git(parent, &["clone", "--quiet", &repo_arg, &dest_arg])
            .await?;
        self.git(
            dest,
            &["-c", "advice.detachedHead=false", "checkout", "--quiet", git_ref],
        )
        .await?;

        tokio::fs::remove_dir_all(dest.join(".git")).await?;
        info!("Fetched {} at {} into {}", repo.display(), git_ref, dest.display());
        Ok(())
    }

    async fn publish_branch(
        &self,
        target: &RepoLocator,
        branch: &str,
        source_dir: &Path,
    ) -> Result<(), GatewayError> {
        let repo = self.repo_path(target);
        if !repo.is_dir() {
            tokio::fs::create_dir_all(&repo).await?;
            self.git(&repo, &["init", "--bare", "--quiet"]).await?;
            info!("Initialised repository {}", repo.display());
        }

        let head = format!("refs/heads/{}", branch);
        let name = format!("user.name={}", COMMITTER_NAME);
        let email = format!("user.email={}", COMMITTER_EMAIL);
        let message = format!("Publish {}", branch);

        self.git(source_dir, &["init", "--quiet"]).await?;
        self.git(source_dir, &["symbolic-ref", "HEAD", &head]).await?;
        self.git(source_dir, &["add", "--all"]).await?;
        self.git(
            source_dir,
            &[
                "-c", &name, "-c", &email, "commit", "--quiet", "--allow-empty", "-m", &message,
            ],
        )
        .await?;

        let repo_arg = repo.to_string_lossy();
        let refspec = format!("HEAD:{}", head);
        self.git(
            source_dir,
            &["push", "--force", "--quiet", &repo_arg, &refspec],
        )
        .await?;

        tokio::fs::remove_dir_all(source_dir.join(".git")).await?;
        info!("Published {} to {}", branch, repo.display());
        Ok(())
    }
}
