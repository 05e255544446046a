mod dry_run;
mod github;

pub use dry_run::DryRunProvider;
pub use github::GithubProvider;

use async_trait::async_trait;

use crate::error::Result;
use crate::repo_url::RepoUrl;

/// Fixed name under which the deploy key is registered on the git host.
pub const DEPLOY_KEY_NAME: &str = "wego-deploy-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
    Internal,
}

/// One file of a pull-request commit. `content: None` marks a deletion.
#[derive(Debug, Clone)]
pub struct CommitFile {
    pub path: String,
    pub content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PullRequestInfo {
    pub title: String,
    pub description: String,
    pub commit_message: String,
    pub target_branch: String,
    /// Branch the PR is opened from. When `files` is empty the branch is
    /// assumed to have been pushed already and is left untouched.
    pub new_branch: String,
    pub files: Vec<CommitFile>,
}

#[derive(Debug, Clone)]
pub struct PullRequestRef {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author: String,
}

/// Provider-agnostic operations against a hosted git service. Every call
/// blocks on one network round-trip; there are no retries at this layer.
#[async_trait]
pub trait GitProvider: Send + Sync {
    async fn repository_exists(&self, repo: &RepoUrl) -> Result<bool>;

    async fn default_branch(&self, repo: &RepoUrl) -> Result<String>;

    async fn repo_visibility(&self, repo: &RepoUrl) -> Result<Visibility>;

    /// Whether the repository already carries the tool's deploy key. A
    /// provider-side "key is already in use" is folded into `true`.
    async fn deploy_key_exists(&self, repo: &RepoUrl) -> Result<bool>;

    /// Registers the public half of a deploy key, then polls until a
    /// readback returns it. A missing repository surfaces as a
    /// no-permissions-or-missing error.
    async fn upload_deploy_key(&self, repo: &RepoUrl, public_key: &str) -> Result<()>;

    async fn create_pull_request(
        &self,
        repo: &RepoUrl,
        info: PullRequestInfo,
    ) -> Result<PullRequestRef>;

    async fn merge_pull_request(&self, repo: &RepoUrl, number: u64, message: &str) -> Result<()>;

    /// Lists the files directly under `dir` on `branch`, with content.
    async fn repo_dir_files(
        &self,
        repo: &RepoUrl,
        dir: &str,
        branch: &str,
    ) -> Result<Vec<CommitFile>>;

    /// Lists commits on a branch, newest first. An empty repository yields
    /// an empty list rather than an error.
    async fn commits(
        &self,
        repo: &RepoUrl,
        branch: &str,
        page_size: u8,
        page: u32,
    ) -> Result<Vec<CommitInfo>>;
}
