use std::fs;
use std::path::{Path, PathBuf};

use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    BranchType, Cred, FetchOptions, IndexAddOption, PushOptions, RemoteCallbacks, Repository,
    Signature,
};
use log::debug;
use thiserror::Error as ThisError;

use crate::error::Error;

const COMMIT_AUTHOR_NAME: &str = "Weave Gitops";
const COMMIT_AUTHOR_EMAIL: &str = "weave-gitops@weave.works";

#[derive(Debug, ThisError)]
pub enum WorktreeError {
    /// Nothing to commit. Carries the commit the branch already points at,
    /// if any, so callers can report where the branch stands.
    #[error("no staged changes to commit")]
    NoStagedChanges { head: Option<String> },
    #[error("git {op} failed")]
    Git {
        op: &'static str,
        #[source]
        source: git2::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<WorktreeError> for Error {
    fn from(e: WorktreeError) -> Self {
        match e {
            WorktreeError::NoStagedChanges { .. } => Error::precondition(e.to_string()),
            other => Error::network("repository worktree operation failed").with_source(other),
        }
    }
}

/// How to authenticate against the remote. Local paths and public https
/// remotes use `None`.
pub enum GitAuth {
    None,
    SshKey(String),
}

/// A checked-out working copy with a single `origin` remote. All paths are
/// relative to the worktree root.
pub struct Worktree {
    repo: Repository,
    dir: PathBuf,
}

impl Worktree {
    /// Clones `url` into `dir` and checks out `branch`. An entirely empty
    /// remote clones to an unborn HEAD; that HEAD is aimed at `branch` so
    /// the first commit can still be pushed.
    pub fn clone(url: &str, branch: &str, dir: &Path, auth: &GitAuth) -> Result<Self, WorktreeError> {
        let mut fetch = FetchOptions::new();
        fetch.remote_callbacks(callbacks(auth));

        let repo = RepoBuilder::new()
            .fetch_options(fetch)
            .clone(url, dir)
            .map_err(git_op("clone"))?;

        match repo.find_reference(&format!("refs/remotes/origin/{branch}")) {
            Ok(remote_ref) => {
                let commit = remote_ref.peel_to_commit().map_err(git_op("resolve-branch"))?;
                if repo.find_branch(branch, BranchType::Local).is_err() {
                    repo.branch(branch, &commit, true).map_err(git_op("branch"))?;
                }
                repo.set_head(&format!("refs/heads/{branch}"))
                    .map_err(git_op("set-head"))?;
                repo.checkout_head(Some(CheckoutBuilder::new().force()))
                    .map_err(git_op("checkout"))?;
            }
            Err(_) if repo.head().is_err() => {
                debug!("remote {url} is empty, starting {branch} from scratch");
                repo.set_head(&format!("refs/heads/{branch}"))
                    .map_err(git_op("set-head"))?;
            }
            Err(e) => {
                return Err(WorktreeError::Git {
                    op: "resolve-branch",
                    source: e,
                })
            }
        }

        Ok(Self {
            repo,
            dir: dir.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn write_file(&self, rel: &str, content: &str) -> Result<(), WorktreeError> {
        let path = self.dir.join(rel);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, content)?;
        Ok(())
    }

    pub fn read_file(&self, rel: &str) -> Result<Option<String>, WorktreeError> {
        match fs::read_to_string(self.dir.join(rel)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes one file. Absent is fine.
    pub fn remove_file(&self, rel: &str) -> Result<(), WorktreeError> {
        match fs::remove_file(self.dir.join(rel)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes a directory and everything under it. Absent is fine.
    pub fn remove_dir(&self, rel: &str) -> Result<(), WorktreeError> {
        match fs::remove_dir_all(self.dir.join(rel)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates `name` at the current HEAD and switches to it. On an unborn
    /// HEAD the branch is simply made the commit target.
    pub fn switch_to_new_branch(&self, name: &str) -> Result<(), WorktreeError> {
        if let Ok(head) = self.repo.head() {
            let commit = head.peel_to_commit().map_err(git_op("resolve-head"))?;
            self.repo
                .branch(name, &commit, true)
                .map_err(git_op("branch"))?;
        }

        self.repo
            .set_head(&format!("refs/heads/{name}"))
            .map_err(git_op("set-head"))?;

        Ok(())
    }

    /// Stages changes in the worktree, deletions included, and commits.
    /// `keep` restricts what gets staged; paths it rejects stay untouched
    /// in the worktree. Fails with `NoStagedChanges`, carrying the current
    /// HEAD, when nothing kept actually changed.
    pub fn commit(
        &self,
        message: &str,
        keep: Option<&dyn Fn(&str) -> bool>,
    ) -> Result<String, WorktreeError> {
        let mut index = self.repo.index().map_err(git_op("index"))?;

        let root = self.dir.clone();
        let mut staging = |path: &Path, _spec: &[u8]| {
            if let Some(keep) = keep {
                if !path.to_str().map(keep).unwrap_or(false) {
                    return 1;
                }
            }

            // A dangling absolute symlink cannot be hashed; leave it out
            // rather than fail the whole commit.
            if is_broken_absolute_symlink(&root.join(path)) {
                1
            } else {
                0
            }
        };

        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, Some(&mut staging))
            .map_err(git_op("stage"))?;
        index
            .update_all(["*"].iter(), Some(&mut staging))
            .map_err(git_op("stage-deletions"))?;
        index.write().map_err(git_op("write-index"))?;

        let tree_id = index.write_tree().map_err(git_op("write-tree"))?;

        let parent = self
            .repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok());

        match &parent {
            Some(commit) if commit.tree_id() == tree_id => {
                return Err(WorktreeError::NoStagedChanges {
                    head: Some(commit.id().to_string()),
                })
            }
            None if index.is_empty() => {
                return Err(WorktreeError::NoStagedChanges { head: None })
            }
            _ => {}
        }

        let signature = Signature::now(COMMIT_AUTHOR_NAME, COMMIT_AUTHOR_EMAIL)
            .map_err(git_op("signature"))?;
        let tree = self.repo.find_tree(tree_id).map_err(git_op("find-tree"))?;
        let parents: Vec<_> = parent.iter().collect();

        let oid = self
            .repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
            .map_err(git_op("commit"))?;

        Ok(oid.to_string())
    }

    pub fn push(&self, branch: &str, auth: &GitAuth) -> Result<(), WorktreeError> {
        let mut remote = self
            .repo
            .find_remote("origin")
            .map_err(git_op("find-remote"))?;

        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks(auth));

        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote
            .push(&[refspec.as_str()], Some(&mut options))
            .map_err(git_op("push"))?;

        Ok(())
    }
}

fn git_op(op: &'static str) -> impl FnOnce(git2::Error) -> WorktreeError {
    move |source| WorktreeError::Git { op, source }
}

fn is_broken_absolute_symlink(path: &Path) -> bool {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return false;
    };

    if !metadata.file_type().is_symlink() {
        return false;
    }

    match fs::read_link(path) {
        Ok(target) => target.is_absolute() && !target.exists(),
        Err(_) => false,
    }
}

fn callbacks(auth: &GitAuth) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();

    match auth {
        GitAuth::SshKey(private_key) => {
            callbacks.credentials(move |_url, username, _allowed| {
                Cred::ssh_key_from_memory(username.unwrap_or("git"), None, private_key, None)
            });
        }
        GitAuth::None => {
            callbacks.credentials(|_url, username, _allowed| match username {
                Some(user) => Cred::ssh_key_from_agent(user),
                None => Cred::default(),
            });
        }
    }

    callbacks
}
