use std::collections::HashSet;
use std::fs;

use log::info;
use tempfile::TempDir;

use crate::app::Application;
use crate::error::{Error, OpContext, Result};
use crate::manifests::{
    parse_kustomize_file, render_kustomize_file, user_kustomization_path, Manifest,
};
use crate::provider::{CommitFile, GitProvider, PullRequestInfo, PullRequestRef};
use crate::repo_url::RepoUrl;
use crate::worktree::{GitAuth, Worktree};

pub const ADD_COMMIT_MESSAGE: &str = "Add application manifests";
pub const REMOVE_COMMIT_MESSAGE: &str = "Remove application manifests";

/// How changes reach the configuration repository. `Push` commits straight
/// onto the working branch; the pull-request modes hand the file set to the
/// provider, with `MergedPullRequest` merging immediately after opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Push,
    PullRequest,
    MergedPullRequest,
}

/// Writes manifest sets into a configuration repository. The clone url is
/// separate from the repo identity so local paths work in place of a
/// hosted remote.
pub struct RepoWriter<'a> {
    provider: &'a dyn GitProvider,
    mode: WriteMode,
    auth: GitAuth,
}

impl<'a> RepoWriter<'a> {
    pub fn new(provider: &'a dyn GitProvider, mode: WriteMode, auth: GitAuth) -> Self {
        Self {
            provider,
            mode,
            auth,
        }
    }

    /// Writes an application's manifests and registers it in the user
    /// aggregator. Returns the pull request when one was opened.
    pub async fn add_application(
        &self,
        repo: &RepoUrl,
        clone_url: &str,
        branch: &str,
        cluster_name: &str,
        app: &Application,
        manifests: &[Manifest],
    ) -> Result<Option<PullRequestRef>> {
        let tmp = TempDir::new().op("clone")?;
        let tree = Worktree::clone(clone_url, branch, tmp.path(), &self.auth).op("clone")?;

        let aggregator = self
            .updated_aggregator(&tree, cluster_name, app, true)
            .op("update-aggregator")?;

        let mut changes: Vec<CommitFile> = manifests
            .iter()
            .map(|m| CommitFile {
                path: m.path.clone(),
                content: Some(m.content.clone()),
            })
            .collect();
        changes.push(aggregator);

        self.deliver(
            &tree,
            repo,
            branch,
            changes,
            ADD_COMMIT_MESSAGE,
            &app.app_hash(),
            &format!("Gitops add {}", app.name()),
            &format!("Added yamls for {app}"),
        )
        .await
    }

    /// Removes everything under the application's directory (one level,
    /// directory order) and drops its aggregator entry.
    pub async fn remove_application(
        &self,
        repo: &RepoUrl,
        clone_url: &str,
        branch: &str,
        cluster_name: &str,
        app: &Application,
    ) -> Result<Option<PullRequestRef>> {
        let tmp = TempDir::new().op("clone")?;
        let tree = Worktree::clone(clone_url, branch, tmp.path(), &self.auth).op("clone")?;

        let app_dir = app.app_dir();
        let mut changes: Vec<CommitFile> = Vec::new();

        let entries = fs::read_dir(tree.path().join(&app_dir)).map_err(|e| {
            Error::precondition(format!(
                "no manifests for application {app} found under {app_dir}"
            ))
            .with_source(e)
        })?;

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();

        for name in names {
            changes.push(CommitFile {
                path: format!("{app_dir}/{name}"),
                content: None,
            });
        }

        let aggregator = self
            .updated_aggregator(&tree, cluster_name, app, false)
            .op("update-aggregator")?;
        changes.push(aggregator);

        self.deliver(
            &tree,
            repo,
            branch,
            changes,
            REMOVE_COMMIT_MESSAGE,
            &app.app_hash(),
            &format!("Gitops remove {}", app.name()),
            &format!("Removed yamls for {app}"),
        )
        .await
    }

    /// Writes an arbitrary manifest set, for the installer and the profile
    /// installer.
    #[allow(clippy::too_many_arguments)]
    pub async fn write_manifests(
        &self,
        repo: &RepoUrl,
        clone_url: &str,
        branch: &str,
        manifests: &[Manifest],
        commit_message: &str,
        pr_branch: &str,
        pr_title: &str,
        pr_description: &str,
    ) -> Result<Option<PullRequestRef>> {
        let changes: Vec<CommitFile> = manifests
            .iter()
            .map(|m| CommitFile {
                path: m.path.clone(),
                content: Some(m.content.clone()),
            })
            .collect();

        // A pull request carries the whole file set; only a direct push
        // needs the working copy.
        if self.mode == WriteMode::Push {
            let tmp = TempDir::new().op("clone")?;
            let tree = Worktree::clone(clone_url, branch, tmp.path(), &self.auth).op("clone")?;
            self.push_changes(&tree, repo, branch, changes, commit_message)
                .await?;
            return Ok(None);
        }

        self.open_pull_request(
            repo,
            branch,
            changes,
            commit_message,
            pr_branch,
            pr_title,
            pr_description,
        )
        .await
        .map(Some)
    }

    /// Reads the cloned repository's aggregator file without mutating it.
    pub fn read_aggregator(tree: &Worktree, cluster_name: &str) -> Result<Vec<String>> {
        let existing = tree.read_file(&user_kustomization_path(cluster_name))?;
        let aggregator = parse_kustomize_file(existing.as_deref())?;
        Ok(aggregator.resources)
    }

    fn updated_aggregator(
        &self,
        tree: &Worktree,
        cluster_name: &str,
        app: &Application,
        add: bool,
    ) -> Result<CommitFile> {
        let path = user_kustomization_path(cluster_name);
        let existing = tree.read_file(&path)?;
        let mut aggregator = parse_kustomize_file(existing.as_deref())?;

        let entry = app.aggregator_entry();
        if add {
            aggregator.add_resource(&entry);
        } else {
            aggregator.remove_resource(&entry);
        }

        Ok(CommitFile {
            path,
            content: Some(render_kustomize_file(&aggregator)?),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn deliver(
        &self,
        tree: &Worktree,
        repo: &RepoUrl,
        target_branch: &str,
        changes: Vec<CommitFile>,
        commit_message: &str,
        pr_branch: &str,
        pr_title: &str,
        pr_description: &str,
    ) -> Result<Option<PullRequestRef>> {
        match self.mode {
            WriteMode::Push => {
                self.push_changes(tree, repo, target_branch, changes, commit_message)
                    .await?;
                Ok(None)
            }
            WriteMode::PullRequest | WriteMode::MergedPullRequest => self
                .open_pull_request(
                    repo,
                    target_branch,
                    changes,
                    commit_message,
                    pr_branch,
                    pr_title,
                    pr_description,
                )
                .await
                .map(Some),
        }
    }

    async fn push_changes(
        &self,
        tree: &Worktree,
        repo: &RepoUrl,
        target_branch: &str,
        changes: Vec<CommitFile>,
        commit_message: &str,
    ) -> Result<()> {
        for change in &changes {
            match &change.content {
                Some(content) => tree.write_file(&change.path, content).op("write")?,
                None => tree.remove_file(&change.path).op("remove")?,
            }
        }

        // Only the files this operation touched go into the commit; any
        // stray worktree content stays out.
        let touched: HashSet<&str> = changes.iter().map(|c| c.path.as_str()).collect();
        tree.commit(commit_message, Some(&|path: &str| touched.contains(path)))
            .op("commit")?;
        tree.push(target_branch, &self.auth).op("push")?;

        info!("pushed {commit_message:?} to {repo} on {target_branch}");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn open_pull_request(
        &self,
        repo: &RepoUrl,
        target_branch: &str,
        changes: Vec<CommitFile>,
        commit_message: &str,
        pr_branch: &str,
        pr_title: &str,
        pr_description: &str,
    ) -> Result<PullRequestRef> {
        let pr = self
            .provider
            .create_pull_request(
                repo,
                PullRequestInfo {
                    title: pr_title.to_string(),
                    description: pr_description.to_string(),
                    commit_message: commit_message.to_string(),
                    target_branch: target_branch.to_string(),
                    new_branch: pr_branch.to_string(),
                    files: changes,
                },
            )
            .await
            .op("open-pull-request")?;

        if self.mode == WriteMode::MergedPullRequest {
            self.provider
                .merge_pull_request(repo, pr.number, commit_message)
                .await
                .op("merge-pull-request")?;
        }

        Ok(pr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use git2::Repository;
    use tempfile::TempDir;

    use crate::app::{AutomationType, ConfigMode, SourceType};
    use crate::manifests::generate;
    use crate::provider::{CommitInfo, Visibility};

    fn test_app(name: &str) -> Application {
        Application::new(
            name,
            "wego-system",
            SourceType::Git,
            AutomationType::Kustomize,
            Some(RepoUrl::parse("git@github.com:foo/bar.git").unwrap()),
            None,
            ConfigMode::InSourceRepo,
            "main",
            "./deploy",
            None,
        )
        .unwrap()
    }

    fn bare_remote() -> (TempDir, String) {
        let dir = TempDir::new().unwrap();
        Repository::init_bare(dir.path()).unwrap();
        let url = dir.path().to_str().unwrap().to_string();
        (dir, url)
    }

    #[derive(Default)]
    struct RecordingProvider {
        pull_requests: Mutex<Vec<PullRequestInfo>>,
        merges: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl GitProvider for RecordingProvider {
        async fn repository_exists(&self, _repo: &RepoUrl) -> Result<bool> {
            Ok(true)
        }
        async fn default_branch(&self, _repo: &RepoUrl) -> Result<String> {
            Ok("main".to_string())
        }
        async fn repo_visibility(&self, _repo: &RepoUrl) -> Result<Visibility> {
            Ok(Visibility::Private)
        }
        async fn deploy_key_exists(&self, _repo: &RepoUrl) -> Result<bool> {
            Ok(false)
        }
        async fn upload_deploy_key(&self, _repo: &RepoUrl, _key: &str) -> Result<()> {
            Ok(())
        }
        async fn create_pull_request(
            &self,
            _repo: &RepoUrl,
            info: PullRequestInfo,
        ) -> Result<PullRequestRef> {
            self.pull_requests.lock().unwrap().push(info);
            Ok(PullRequestRef {
                number: 7,
                url: "https://example.invalid/pr/7".to_string(),
            })
        }
        async fn merge_pull_request(
            &self,
            _repo: &RepoUrl,
            number: u64,
            _message: &str,
        ) -> Result<()> {
            self.merges.lock().unwrap().push(number);
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

    #[tokio::test]
    async fn push_mode_writes_all_paths_and_the_aggregator() {
        let (_remote, url) = bare_remote();
        let provider = RecordingProvider::default();
        let writer = RepoWriter::new(&provider, WriteMode::Push, GitAuth::None);

        let app = test_app("myapp");
        let repo = RepoUrl::parse("git@github.com:foo/bar.git").unwrap();
        let manifests = generate(&app, Some("wego-github-bar")).unwrap();

        let pr = writer
            .add_application(&repo, &url, "main", "test-cluster", &app, &manifests)
            .await
            .unwrap();
        assert!(pr.is_none());

        let check = TempDir::new().unwrap();
        let tree = Worktree::clone(&url, "main", check.path(), &GitAuth::None).unwrap();

        for path in [
            ".weave-gitops/apps/myapp/app.yaml",
            ".weave-gitops/apps/myapp/myapp-gitops-source.yaml",
            ".weave-gitops/apps/myapp/myapp-gitops-deploy.yaml",
            ".weave-gitops/apps/myapp/kustomization.yaml",
        ] {
            assert!(tree.read_file(path).unwrap().is_some(), "{path} missing");
        }

        let aggregator = RepoWriter::read_aggregator(&tree, "test-cluster").unwrap();
        assert_eq!(aggregator, vec!["../../../apps/myapp"]);
    }

    #[tokio::test]
    async fn remove_undoes_add_and_preserves_other_entries() {
        let (_remote, url) = bare_remote();
        let provider = RecordingProvider::default();
        let writer = RepoWriter::new(&provider, WriteMode::Push, GitAuth::None);
        let repo = RepoUrl::parse("git@github.com:foo/bar.git").unwrap();

        for name in ["first", "second"] {
            let app = test_app(name);
            let manifests = generate(&app, None).unwrap();
            writer
                .add_application(&repo, &url, "main", "test-cluster", &app, &manifests)
                .await
                .unwrap();
        }

        writer
            .remove_application(&repo, &url, "main", "test-cluster", &test_app("first"))
            .await
            .unwrap();

        let check = TempDir::new().unwrap();
        let tree = Worktree::clone(&url, "main", check.path(), &GitAuth::None).unwrap();

        assert!(tree
            .read_file(".weave-gitops/apps/first/app.yaml")
            .unwrap()
            .is_none());
        assert!(tree
            .read_file(".weave-gitops/apps/second/app.yaml")
            .unwrap()
            .is_some());

        let aggregator = RepoWriter::read_aggregator(&tree, "test-cluster").unwrap();
        assert_eq!(aggregator, vec!["../../../apps/second"]);

        let remote = Repository::open_bare(&url).unwrap();
        let head = remote
            .find_branch("main", git2::BranchType::Local)
            .unwrap()
            .get()
            .peel_to_commit()
            .unwrap();
        assert_eq!(head.message(), Some(REMOVE_COMMIT_MESSAGE));
    }

    #[tokio::test]
    async fn removing_an_unknown_application_is_a_precondition_error() {
        let (_remote, url) = bare_remote();
        let provider = RecordingProvider::default();
        let writer = RepoWriter::new(&provider, WriteMode::Push, GitAuth::None);
        let repo = RepoUrl::parse("git@github.com:foo/bar.git").unwrap();

        let err = writer
            .remove_application(&repo, &url, "main", "test-cluster", &test_app("ghost"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Precondition);
    }

    #[tokio::test]
    async fn pull_request_mode_hands_the_file_set_to_the_provider() {
        let (_remote, url) = bare_remote();
        let provider = RecordingProvider::default();
        let writer = RepoWriter::new(&provider, WriteMode::PullRequest, GitAuth::None);

        let app = test_app("myapp");
        let repo = RepoUrl::parse("git@github.com:foo/bar.git").unwrap();
        let manifests = generate(&app, None).unwrap();

        let pr = writer
            .add_application(&repo, &url, "main", "test-cluster", &app, &manifests)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pr.number, 7);

        let recorded = provider.pull_requests.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].title, "Gitops add myapp");
        assert_eq!(recorded[0].new_branch, app.app_hash());
        assert_eq!(recorded[0].target_branch, "main");
        assert_eq!(recorded[0].commit_message, ADD_COMMIT_MESSAGE);
        assert_eq!(recorded[0].files.len(), 5);
        assert!(provider.merges.lock().unwrap().is_empty());

        // Nothing may land on the branch itself in this mode.
        let check = TempDir::new().unwrap();
        let tree = Worktree::clone(&url, "main", check.path(), &GitAuth::None).unwrap();
        assert!(tree
            .read_file(".weave-gitops/apps/myapp/app.yaml")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn merged_pull_request_mode_merges_after_opening() {
        let (_remote, url) = bare_remote();
        let provider = RecordingProvider::default();
        let writer = RepoWriter::new(&provider, WriteMode::MergedPullRequest, GitAuth::None);

        let app = test_app("myapp");
        let repo = RepoUrl::parse("git@github.com:foo/bar.git").unwrap();
        let manifests = generate(&app, None).unwrap();

        writer
            .add_application(&repo, &url, "main", "test-cluster", &app, &manifests)
            .await
            .unwrap();

        assert_eq!(*provider.merges.lock().unwrap(), vec![7]);
    }
}
