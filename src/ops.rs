mod add;
mod install;
mod profile;
mod remove;
mod status;
mod sync;

pub use add::{add, AddArgs};
pub use install::{install, InstallArgs};
pub use profile::{add_profile, AddProfileArgs, CatalogProfile, HelmRepositoryRef, HttpCatalog, ProfileCatalog};
pub use remove::{remove, RemoveArgs};
pub use status::{status, StatusReport};
pub use sync::{sync, RECONCILE_ANNOTATION};

use crate::cluster::Cluster;
use crate::error::{Error, OpContext, Result};
use crate::provider::GitProvider;

/// Everything a pipeline operation needs, threaded explicitly so test
/// doubles are plain constructor arguments.
pub struct Deps<'a> {
    pub provider: &'a dyn GitProvider,
    pub cluster: &'a dyn Cluster,
}

/// Verifies the reconciler is serving and resolves the cluster name.
pub(crate) async fn cluster_prelude(deps: &Deps<'_>) -> Result<String> {
    if !deps.cluster.is_ready().await.op("cluster-ready")? {
        return Err(Error::precondition(
            "cluster is not ready: reconciler controllers are not running; run `gitopsctl install` first",
        ));
    }

    deps.cluster.cluster_name().await.op("cluster-name")
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::app::ApplicationManifest;
    use crate::cluster::{split_documents, Cluster, ResourceKind};
    use crate::error::Result;
    use crate::provider::{
        CommitFile, CommitInfo, GitProvider, PullRequestInfo, PullRequestRef, Visibility,
    };
    use crate::repo_url::RepoUrl;

    /// In-memory cluster. `apply` stores raw documents and also indexes
    /// Applications and Secrets so state round-trips like the real thing.
    pub struct FakeCluster {
        pub name: String,
        pub ready: bool,
        pub namespaces: Mutex<Vec<String>>,
        pub applications: Mutex<HashMap<(String, String), ApplicationManifest>>,
        pub secrets: Mutex<HashMap<(String, String), HashMap<String, String>>>,
        pub applied: Mutex<Vec<String>>,
        pub annotations: Mutex<Vec<(ResourceKind, String, String, String, String)>>,
        pub raw: Mutex<HashMap<(ResourceKind, String, String), Value>>,
        pub deleted: Mutex<Vec<(ResourceKind, String, String)>>,
        /// When set, touching the reconcile annotation also bumps
        /// `status.lastHandledReconcileRequest`, like a live reconciler.
        pub reconcile_on_touch: bool,
    }

    impl Default for FakeCluster {
        fn default() -> Self {
            Self {
                name: "test-cluster".to_string(),
                ready: true,
                namespaces: Mutex::new(vec!["wego-system".to_string(), "default".to_string()]),
                applications: Mutex::new(HashMap::new()),
                secrets: Mutex::new(HashMap::new()),
                applied: Mutex::new(Vec::new()),
                annotations: Mutex::new(Vec::new()),
                raw: Mutex::new(HashMap::new()),
                deleted: Mutex::new(Vec::new()),
                reconcile_on_touch: false,
            }
        }
    }

    #[async_trait]
    impl Cluster for FakeCluster {
        async fn cluster_name(&self) -> Result<String> {
            Ok(self.name.clone())
        }

        async fn is_ready(&self) -> Result<bool> {
            Ok(self.ready)
        }

        async fn apply(&self, manifests: &str, namespace: &str) -> Result<()> {
            for doc in split_documents(manifests) {
                self.applied.lock().unwrap().push(doc.to_string());

                let value: Value = serde_yaml::from_str(doc)?;
                let kind = value["kind"].as_str().unwrap_or_default().to_string();
                let name = value["metadata"]["name"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let ns = value["metadata"]["namespace"]
                    .as_str()
                    .unwrap_or(namespace)
                    .to_string();

                match kind.as_str() {
                    "Application" => {
                        let manifest: ApplicationManifest = serde_yaml::from_str(doc)?;
                        self.applications
                            .lock()
                            .unwrap()
                            .insert((ns, name), manifest);
                    }
                    "Secret" => {
                        let mut data = HashMap::new();
                        if let Some(map) = value["stringData"].as_object() {
                            for (k, v) in map {
                                data.insert(
                                    k.clone(),
                                    v.as_str().unwrap_or_default().to_string(),
                                );
                            }
                        }
                        self.secrets.lock().unwrap().insert((ns, name), data);
                    }
                    _ => {}
                }
            }

            Ok(())
        }

        async fn get_application(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<ApplicationManifest>> {
            Ok(self
                .applications
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }

        async fn list_applications(&self, namespace: &str) -> Result<Vec<ApplicationManifest>> {
            Ok(self
                .applications
                .lock()
                .unwrap()
                .iter()
                .filter(|((ns, _), _)| ns == namespace)
                .map(|(_, m)| m.clone())
                .collect())
        }

        async fn delete_application(&self, namespace: &str, name: &str) -> Result<()> {
            self.applications
                .lock()
                .unwrap()
                .remove(&(namespace.to_string(), name.to_string()));
            self.deleted.lock().unwrap().push((
                ResourceKind::Application,
                namespace.to_string(),
                name.to_string(),
            ));
            Ok(())
        }

        async fn namespace_exists(&self, name: &str) -> Result<bool> {
            Ok(self.namespaces.lock().unwrap().iter().any(|n| n == name))
        }

        async fn delete_resource(
            &self,
            kind: ResourceKind,
            namespace: &str,
            name: &str,
        ) -> Result<()> {
            self.deleted
                .lock()
                .unwrap()
                .push((kind, namespace.to_string(), name.to_string()));
            Ok(())
        }

        async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool> {
            Ok(self
                .secrets
                .lock()
                .unwrap()
                .contains_key(&(namespace.to_string(), name.to_string())))
        }

        async fn get_secret_value(
            &self,
            namespace: &str,
            name: &str,
            key: &str,
        ) -> Result<Option<String>> {
            Ok(self
                .secrets
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .and_then(|data| data.get(key).cloned()))
        }

        async fn annotate(
            &self,
            kind: ResourceKind,
            namespace: &str,
            name: &str,
            key: &str,
            value: &str,
        ) -> Result<()> {
            self.annotations.lock().unwrap().push((
                kind,
                namespace.to_string(),
                name.to_string(),
                key.to_string(),
                value.to_string(),
            ));

            if self.reconcile_on_touch {
                let mut raw = self.raw.lock().unwrap();
                let entry = raw
                    .entry((kind, namespace.to_string(), name.to_string()))
                    .or_insert_with(|| serde_json::json!({}));
                entry["status"]["lastHandledReconcileRequest"] = Value::String(value.to_string());
            }

            Ok(())
        }

        async fn get_raw(
            &self,
            kind: ResourceKind,
            namespace: &str,
            name: &str,
        ) -> Result<Option<Value>> {
            Ok(self
                .raw
                .lock()
                .unwrap()
                .get(&(kind, namespace.to_string(), name.to_string()))
                .cloned())
        }
    }

    /// Recording provider with scriptable probe answers.
    pub struct FakeProvider {
        pub default_branch: String,
        pub visibility: Visibility,
        pub has_deploy_key: Mutex<bool>,
        pub uploaded_keys: Mutex<Vec<String>>,
        pub pull_requests: Mutex<Vec<PullRequestInfo>>,
        pub merges: Mutex<Vec<u64>>,
        pub dir_files: Mutex<Vec<CommitFile>>,
        pub commit_log: Vec<CommitInfo>,
    }

    impl Default for FakeProvider {
        fn default() -> Self {
            Self {
                default_branch: "main".to_string(),
                visibility: Visibility::Private,
                has_deploy_key: Mutex::new(false),
                uploaded_keys: Mutex::new(Vec::new()),
                pull_requests: Mutex::new(Vec::new()),
                merges: Mutex::new(Vec::new()),
                dir_files: Mutex::new(Vec::new()),
                commit_log: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl GitProvider for FakeProvider {
        async fn repository_exists(&self, _repo: &RepoUrl) -> Result<bool> {
            Ok(true)
        }

        async fn default_branch(&self, _repo: &RepoUrl) -> Result<String> {
            Ok(self.default_branch.clone())
        }

        async fn repo_visibility(&self, _repo: &RepoUrl) -> Result<Visibility> {
            Ok(self.visibility)
        }

        async fn deploy_key_exists(&self, _repo: &RepoUrl) -> Result<bool> {
            Ok(*self.has_deploy_key.lock().unwrap())
        }

        async fn upload_deploy_key(&self, _repo: &RepoUrl, public_key: &str) -> Result<()> {
            self.uploaded_keys
                .lock()
                .unwrap()
                .push(public_key.to_string());
            *self.has_deploy_key.lock().unwrap() = true;
            Ok(())
        }

        async fn create_pull_request(
            &self,
            _repo: &RepoUrl,
            info: PullRequestInfo,
        ) -> Result<PullRequestRef> {
            self.pull_requests.lock().unwrap().push(info);
            Ok(PullRequestRef {
                number: 1,
                url: "https://example.invalid/pr/1".to_string(),
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
            Ok(self.dir_files.lock().unwrap().clone())
        }

        async fn commits(
            &self,
            _repo: &RepoUrl,
            _branch: &str,
            _page_size: u8,
            _page: u32,
        ) -> Result<Vec<CommitInfo>> {
            Ok(self.commit_log.clone())
        }
    }
}
