//! Git branch preparation through `git2`, pull requests through `gh`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use git2::{
    BranchType, IndexAddOption, IndexMatchedPath, Repository, Signature, build::CheckoutBuilder,
};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::execution::scheduler::{GitCollaborator, RollbackPoint};

#[derive(Debug, Clone)]
pub struct GitRepo {
    path: PathBuf,
    /// Paths never committed on behalf of agents (the data directory).
    excluded: Vec<PathBuf>,
}

impl GitRepo {
    pub fn new(project_dir: &Path) -> Result<Self> {
        Repository::discover(project_dir).context("Failed to open git repository")?;
        Ok(Self {
            path: project_dir.to_path_buf(),
            excluded: Vec::new(),
        })
    }

    pub fn with_excluded(mut self, path: &str) -> Self {
        self.excluded.push(PathBuf::from(path.trim_end_matches('/')));
        self
    }

    fn open(&self) -> Result<Repository> {
        Repository::discover(&self.path).context("Failed to open git repository")
    }

    /// Create the backup branch at HEAD and switch to `work_branch`.
    fn prepare_blocking(&self, work_branch: &str) -> Result<RollbackPoint> {
        let repo = self.open()?;
        let head = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .context("Repository has no commits; commit something before executing")?;
        let original_head = head.id().to_string();

        let backup_branch = format!("mason-backup/{}", Utc::now().format("%Y%m%d-%H%M%S"));
        repo.branch(&backup_branch, &head, false)
            .with_context(|| format!("Failed to create backup branch {backup_branch}"))?;

        if repo.find_branch(work_branch, BranchType::Local).is_err() {
            repo.branch(work_branch, &head, false)
                .with_context(|| format!("Failed to create branch {work_branch}"))?;
        }
        repo.set_head(&format!("refs/heads/{work_branch}"))
            .with_context(|| format!("Failed to switch to {work_branch}"))?;
        repo.checkout_head(Some(CheckoutBuilder::new().safe()))
            .with_context(|| format!("Failed to check out {work_branch}"))?;

        tracing::info!(%original_head, %backup_branch, work_branch, "prepared git branches");
        Ok(RollbackPoint {
            original_head,
            backup_branch,
        })
    }

    /// Commit any uncommitted agent changes on the current branch.
    /// Returns the new commit id, or `None` when the tree is clean.
    fn commit_pending(&self, message: &str) -> Result<Option<String>> {
        let repo = self.open()?;
        let mut index = repo.index()?;
        let excluded = &self.excluded;
        let skip: &mut IndexMatchedPath = &mut |path, _spec| {
            if excluded.iter().any(|e| path.starts_with(e)) {
                1
            } else {
                0
            }
        };
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, Some(skip))?;
        index.write()?;
        let tree_id = index.write_tree()?;

        let parent = repo.head()?.peel_to_commit()?;
        if parent.tree_id() == tree_id {
            return Ok(None);
        }
        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("mason", "mason@localhost"))?;
        let id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
        Ok(Some(id.to_string()))
    }

    async fn run_tool(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .current_dir(&self.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run {program}"))?;
        if !output.status.success() {
            anyhow::bail!(
                "{} {} failed: {}",
                program,
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl GitCollaborator for GitRepo {
    async fn prepare_run(&self, work_branch: &str) -> Result<RollbackPoint> {
        let repo = self.clone();
        let branch = work_branch.to_string();
        tokio::task::spawn_blocking(move || repo.prepare_blocking(&branch))
            .await
            .context("git task panicked")?
    }

    async fn open_pull_request(
        &self,
        work_branch: &str,
        title: &str,
        body: &str,
    ) -> Result<String> {
        let repo = self.clone();
        let message = title.to_string();
        if let Some(commit) = tokio::task::spawn_blocking(move || repo.commit_pending(&message))
            .await
            .context("git task panicked")??
        {
            tracing::debug!(%commit, "committed pending changes");
        }

        self.run_tool("git", &["push", "-u", "origin", work_branch])
            .await?;
        let stdout = self
            .run_tool(
                "gh",
                &["pr", "create", "--head", work_branch, "--title", title, "--body", body],
            )
            .await?;
        stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| l.starts_with("http"))
            .map(str::to_string)
            .context("gh did not print a pull request URL")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);

        fs::write(dir.path().join("README.md"), "hello").unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = repo.signature().unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
            .unwrap();
        dir
    }

    #[tokio::test]
    async fn test_prepare_run_creates_backup_and_switches() {
        let dir = setup_repo();
        let git = GitRepo::new(dir.path()).unwrap();
        let point = git.prepare_run("mason/add-limiter").await.unwrap();

        let repo = Repository::open(dir.path()).unwrap();
        let head = repo.head().unwrap();
        assert_eq!(head.shorthand(), Some("mason/add-limiter"));
        assert_eq!(head.peel_to_commit().unwrap().id().to_string(), point.original_head);
        assert!(
            repo.find_branch(&point.backup_branch, BranchType::Local)
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_prepare_run_fails_without_commits() {
        let dir = TempDir::new().unwrap();
        Repository::init(dir.path()).unwrap();
        let git = GitRepo::new(dir.path()).unwrap();
        let err = git.prepare_run("mason/x").await.unwrap_err();
        assert!(format!("{err:#}").contains("no commits"));
    }

    #[test]
    fn test_commit_pending_only_when_dirty() {
        let dir = setup_repo();
        let git = GitRepo::new(dir.path()).unwrap().with_excluded(".mason/");
        assert!(git.commit_pending("nothing").unwrap().is_none());

        fs::create_dir_all(dir.path().join(".mason")).unwrap();
        fs::write(dir.path().join(".mason/mason.db"), "state").unwrap();
        assert!(git.commit_pending("only data dir").unwrap().is_none());

        fs::write(dir.path().join("src.rs"), "fn main() {}").unwrap();
        let id = git.commit_pending("mason: add src").unwrap();
        assert!(id.is_some());
        let repo = Repository::open(dir.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.message(), Some("mason: add src"));
    }

    #[test]
    fn test_new_outside_repository_fails() {
        let dir = TempDir::new().unwrap();
        assert!(GitRepo::new(dir.path()).is_err());
    }
}
