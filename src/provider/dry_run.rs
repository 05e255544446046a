use async_trait::async_trait;
use log::info;

use crate::error::Result;
use crate::provider::{
    CommitFile, CommitInfo, GitProvider, PullRequestInfo, PullRequestRef, Visibility,
};
use crate::repo_url::RepoUrl;

/// Placeholder provider returning benign fixed values, so the pipeline can
/// be exercised without network contact. Mutations log and succeed.
#[derive(Debug, Default)]
pub struct DryRunProvider;

#[async_trait]
impl GitProvider for DryRunProvider {
    async fn repository_exists(&self, _repo: &RepoUrl) -> Result<bool> {
        Ok(true)
    }

    async fn default_branch(&self, _repo: &RepoUrl) -> Result<String> {
        Ok("<default-branch>".to_string())
    }

    async fn repo_visibility(&self, _repo: &RepoUrl) -> Result<Visibility> {
        Ok(Visibility::Private)
    }

    async fn deploy_key_exists(&self, _repo: &RepoUrl) -> Result<bool> {
        Ok(false)
    }

    async fn upload_deploy_key(&self, repo: &RepoUrl, _public_key: &str) -> Result<()> {
        info!("dry-run: would upload deploy key to {repo}");
        Ok(())
    }

    async fn create_pull_request(
        &self,
        repo: &RepoUrl,
        info: PullRequestInfo,
    ) -> Result<PullRequestRef> {
        log::info!(
            "dry-run: would open pull request {:?} from {} onto {} at {repo}",
            info.title,
            info.new_branch,
            info.target_branch
        );

        Ok(PullRequestRef {
            number: 0,
            url: String::new(),
        })
    }

    async fn merge_pull_request(&self, repo: &RepoUrl, number: u64, _message: &str) -> Result<()> {
        info!("dry-run: would merge pull request #{number} at {repo}");
        Ok(())
    }

    async fn repo_dir_files(
        &self,
        _repo: &RepoUrl,
        _dir: &str,
        _branch: &str,
    ) -> Result<Vec<CommitFile>> {
        Ok(vec![])
    }

    async fn commits(
        &self,
        _repo: &RepoUrl,
        _branch: &str,
        _page_size: u8,
        _page: u32,
    ) -> Result<Vec<CommitInfo>> {
        Ok(vec![])
    }
}
