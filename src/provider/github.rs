use std::time::Duration;

use async_trait::async_trait;
use http::Uri;
use log::debug;
use octocrab::{
    map_github_error,
    models::repos::{Object, Ref},
    params::repos::Reference,
    Octocrab,
};
use serde_json::{json, Value};

use crate::error::{Error, OpContext, Result};
use crate::provider::{
    CommitFile, CommitInfo, GitProvider, PullRequestInfo, PullRequestRef, Visibility,
    DEPLOY_KEY_NAME,
};
use crate::repo_url::RepoUrl;

const KEY_READBACK_ATTEMPTS: u32 = 5;
const KEY_READBACK_DELAY: Duration = Duration::from_secs(1);

pub struct GithubProvider {
    client: Octocrab,
}

impl std::ops::Deref for GithubProvider {
    type Target = Octocrab;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl GithubProvider {
    pub fn new(token: String) -> Result<Self> {
        let client = Octocrab::builder()
            .personal_token(token)
            .build()
            .map_err(|e| Error::network("could not build github client").with_source(e))?;

        Ok(Self { client })
    }

    async fn get_sha_for_ref(&self, owner: &str, repo: &str, reference: &Reference) -> Result<String> {
        let ref_object = self.repos(owner, repo).get_ref(reference).await?;

        match ref_object.object {
            Object::Commit { sha, url: _ } => Ok(sha),
            _ => Err(Error::network(format!("could not get sha for ref {reference}"))),
        }
    }

    async fn branch_from_ref(
        &self,
        owner: &str,
        repo: &str,
        branch_name: &str,
        reference: &Reference,
    ) -> Result<Ref> {
        self.repos(owner, repo)
            .create_ref(
                &Reference::Branch(branch_name.to_string()),
                self.get_sha_for_ref(owner, repo, reference).await?,
            )
            .await
            .map_err(Error::from)
    }

    async fn delete_ref_if_exists(
        &self,
        owner: &str,
        repo: &str,
        reference: &Reference,
    ) -> Result<()> {
        match self.repos(owner, repo).get_ref(reference).await {
            Ok(_) => self.delete_ref(owner, repo, reference).await,
            Err(_) => Ok(()),
        }
    }

    async fn delete_ref(&self, owner: &str, repo: &str, reference: &Reference) -> Result<()> {
        let route = format!("/repos/{owner}/{repo}/git/refs/{}", reference.ref_url());
        let uri = Uri::builder()
            .path_and_query(&route)
            .build()
            .map_err(|e| Error::network(format!("building route {route}")).with_source(e))?;

        map_github_error(self._delete(uri, None::<&()>).await?)
            .await
            .map(drop)
            .map_err(|e| Error::network(format!("error deleting ref {route}")).with_source(e))
    }

    async fn file_sha(&self, owner: &str, repo: &str, path: &str, branch: &str) -> Option<String> {
        self.repos(owner, repo)
            .get_content()
            .path(path)
            .r#ref(branch)
            .send()
            .await
            .ok()
            .and_then(|mut contents| contents.items.pop())
            .map(|content| content.sha)
    }

    async fn list_deploy_keys(&self, repo: &RepoUrl) -> Result<Vec<Value>> {
        let route = format!("/repos/{}/{}/keys", repo.owner(), repo.name());
        let keys: Vec<Value> = self
            .client
            .get(route, None::<&()>)
            .await
            .map_err(map_not_found(repo))?;

        Ok(keys)
    }
}

#[async_trait]
impl GitProvider for GithubProvider {
    async fn repository_exists(&self, repo: &RepoUrl) -> Result<bool> {
        match self.repos(repo.owner(), repo.name()).get().await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn default_branch(&self, repo: &RepoUrl) -> Result<String> {
        let repository = self
            .repos(repo.owner(), repo.name())
            .get()
            .await
            .map_err(map_not_found(repo))?;

        repository
            .default_branch
            .ok_or_else(|| Error::network(format!("no default branch reported for {repo}")))
    }

    async fn repo_visibility(&self, repo: &RepoUrl) -> Result<Visibility> {
        let repository = self
            .repos(repo.owner(), repo.name())
            .get()
            .await
            .map_err(map_not_found(repo))?;

        match repository.visibility.as_deref() {
            Some("public") => Ok(Visibility::Public),
            Some("internal") => Ok(Visibility::Internal),
            Some(_) => Ok(Visibility::Private),
            None => Ok(if repository.private.unwrap_or(true) {
                Visibility::Private
            } else {
                Visibility::Public
            }),
        }
    }

    async fn deploy_key_exists(&self, repo: &RepoUrl) -> Result<bool> {
        let keys = self.list_deploy_keys(repo).await.op("deploy-key-exists")?;

        Ok(keys
            .iter()
            .any(|key| key["title"].as_str() == Some(DEPLOY_KEY_NAME)))
    }

    async fn upload_deploy_key(&self, repo: &RepoUrl, public_key: &str) -> Result<()> {
        let route = format!("/repos/{}/{}/keys", repo.owner(), repo.name());
        let body = json!({
            "title": DEPLOY_KEY_NAME,
            "key": public_key.trim_end(),
            "read_only": true,
        });

        let uploaded: std::result::Result<Value, octocrab::Error> =
            self.client.post(&route, Some(&body)).await;

        match uploaded {
            Ok(_) => {}
            // Identical keys register as already-in-use; that is success.
            Err(e) if error_message(&e).contains("key is already in use") => {
                debug!("deploy key for {repo} already registered upstream");
            }
            Err(e) if is_not_found(&e) => {
                return Err(Error::precondition(format!(
                    "repository {repo} is missing or the token has no permissions on it"
                ))
                .with_source(e));
            }
            Err(e) => {
                return Err(Error::network(format!("error uploading deploy key to {repo}"))
                    .with_source(e));
            }
        }

        // The keys collection is eventually consistent; wait for readback.
        for _ in 0..KEY_READBACK_ATTEMPTS {
            if self.deploy_key_exists(repo).await? {
                return Ok(());
            }

            tokio::time::sleep(KEY_READBACK_DELAY).await;
        }

        Err(Error::network(format!(
            "deploy key for {repo} was accepted but never became readable"
        )))
    }

    async fn create_pull_request(
        &self,
        repo: &RepoUrl,
        info: PullRequestInfo,
    ) -> Result<PullRequestRef> {
        let owner = repo.owner();
        let name = repo.name();

        if !info.files.is_empty() {
            self.delete_ref_if_exists(owner, name, &Reference::Branch(info.new_branch.clone()))
                .await?;

            self.branch_from_ref(
                owner,
                name,
                &info.new_branch,
                &Reference::Branch(info.target_branch.clone()),
            )
            .await
            .op("create-branch")?;

            for file in &info.files {
                let existing = self.file_sha(owner, name, &file.path, &info.new_branch).await;

                match (&file.content, existing) {
                    (Some(content), Some(sha)) => {
                        self.repos(owner, name)
                            .update_file(&file.path, &info.commit_message, content, &sha)
                            .branch(&info.new_branch)
                            .send()
                            .await?;
                    }
                    (Some(content), None) => {
                        self.repos(owner, name)
                            .create_file(&file.path, &info.commit_message, content)
                            .branch(&info.new_branch)
                            .send()
                            .await?;
                    }
                    (None, Some(sha)) => {
                        self.repos(owner, name)
                            .delete_file(&file.path, &info.commit_message, &sha)
                            .branch(&info.new_branch)
                            .send()
                            .await?;
                    }
                    (None, None) => {}
                }
            }
        }

        let pr = self
            .pulls(owner, name)
            .create(&info.title, &info.new_branch, &info.target_branch)
            .body(&info.description)
            .send()
            .await
            .map_err(|e| Error::network(format!("error opening pull request on {repo}")).with_source(e))?;

        Ok(PullRequestRef {
            number: pr.number,
            url: pr
                .html_url
                .map(|u| u.to_string())
                .unwrap_or_default(),
        })
    }

    async fn merge_pull_request(&self, repo: &RepoUrl, number: u64, message: &str) -> Result<()> {
        let route = format!("/repos/{}/{}/pulls/{number}/merge", repo.owner(), repo.name());
        let body = json!({ "commit_message": message });

        let merged: std::result::Result<Value, octocrab::Error> =
            self.client.put(route, Some(&body)).await;

        merged.map(drop).map_err(|e| {
                Error::network(format!("error merging pull request #{number} on {repo}"))
                    .with_source(e)
            })
    }

    async fn repo_dir_files(
        &self,
        repo: &RepoUrl,
        dir: &str,
        branch: &str,
    ) -> Result<Vec<CommitFile>> {
        let listing = self
            .repos(repo.owner(), repo.name())
            .get_content()
            .path(dir)
            .r#ref(branch)
            .send()
            .await
            .map_err(map_not_found(repo))?;

        let mut files = Vec::new();

        for item in listing.items {
            // Directory entries carry no download url.
            if item.download_url.is_none() {
                continue;
            }

            let fetched = self
                .repos(repo.owner(), repo.name())
                .get_content()
                .path(&item.path)
                .r#ref(branch)
                .send()
                .await?;

            let content = fetched
                .items
                .into_iter()
                .next()
                .and_then(|c| c.decoded_content());

            files.push(CommitFile {
                path: item.path,
                content,
            });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(files)
    }

    async fn commits(
        &self,
        repo: &RepoUrl,
        branch: &str,
        page_size: u8,
        page: u32,
    ) -> Result<Vec<CommitInfo>> {
        let route = format!(
            "/repos/{}/{}/commits?sha={branch}&per_page={page_size}&page={page}",
            repo.owner(),
            repo.name()
        );

        let listed: std::result::Result<Vec<Value>, octocrab::Error> =
            self.client.get(route, None::<&()>).await;

        let raw = match listed {
            Ok(raw) => raw,
            // A freshly created repository has no commits to list.
            Err(e) if error_message(&e).contains("Git Repository is empty") => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        Ok(raw
            .into_iter()
            .map(|c| CommitInfo {
                sha: c["sha"].as_str().unwrap_or_default().to_string(),
                message: c["commit"]["message"]
                    .as_str()
                    .unwrap_or_default()
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .to_string(),
                author: c["commit"]["author"]["name"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect())
    }
}

fn error_message(e: &octocrab::Error) -> String {
    match e {
        octocrab::Error::GitHub { source, .. } => source.message.clone(),
        other => other.to_string(),
    }
}

fn is_not_found(e: &octocrab::Error) -> bool {
    error_message(e).contains("Not Found")
}

fn map_not_found(repo: &RepoUrl) -> impl FnOnce(octocrab::Error) -> Error + '_ {
    move |e| {
        if is_not_found(&e) {
            Error::precondition(format!("repository {repo} not found")).with_source(e)
        } else {
            e.into()
        }
    }
}
