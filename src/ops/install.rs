use std::collections::BTreeMap;

use log::info;
use serde::Serialize;

use crate::app::hash_if_too_long;
use crate::deploy_key::{ensure_deploy_key, requires_deploy_key};
use crate::error::{OpContext, Result};
use crate::manifests::{
    cluster_scan_kustomization, config_repo_source, sanitize, system_dir, user_dir, Manifest,
};
use crate::ops::Deps;
use crate::repo_url::RepoUrl;
use crate::worktree::GitAuth;
use crate::writer::{RepoWriter, WriteMode};

const APP_CRD: &str = include_str!("../../manifests/app-crd.yaml");
const RUNTIME: &str = include_str!("../../manifests/gitops-runtime.yaml");
const WEGO_APP: &str = include_str!("../../manifests/wego-app.yaml");

const NAMESPACE_PLACEHOLDER: &str = "${NAMESPACE}";

pub struct InstallArgs {
    pub namespace: String,
    pub config_repo: RepoUrl,
    pub mode: WriteMode,
    pub dry_run: bool,
}

/// Installs the reconciler runtime and associates the cluster with its
/// configuration repository.
pub async fn install(deps: &Deps<'_>, args: InstallArgs) -> Result<()> {
    run(deps, args).await.op("install")
}

async fn run(deps: &Deps<'_>, args: InstallArgs) -> Result<()> {
    let namespace = &args.namespace;
    let runtime = RUNTIME.replace(NAMESPACE_PLACEHOLDER, namespace);
    let wego_app = WEGO_APP.replace(NAMESPACE_PLACEHOLDER, namespace);

    if args.dry_run {
        println!("dry-run: would install the gitops runtime into {namespace}");
        println!("dry-run: would associate the cluster with {}", args.config_repo);
        return Ok(());
    }

    // Controllers first: the committed bundle is useless until something
    // can reconcile it.
    deps.cluster.apply(APP_CRD, namespace).await.op("install-crd")?;
    deps.cluster
        .apply(&runtime, namespace)
        .await
        .op("install-runtime")?;

    let cluster_name = deps.cluster.cluster_name().await.op("cluster-name")?;
    let branch = deps
        .provider
        .default_branch(&args.config_repo)
        .await
        .op("default-branch")?;

    let (auth, secret) = if requires_deploy_key(deps.provider, &args.config_repo).await? {
        let key = ensure_deploy_key(deps.provider, deps.cluster, namespace, &args.config_repo)
            .await
            .op("setup-deploy-key")?;
        (GitAuth::SshKey(key.private_key), Some(key.secret_name))
    } else {
        (GitAuth::None, None)
    };

    let system = system_dir(&cluster_name);
    let source_name = hash_if_too_long(&format!("wego-{cluster_name}"));

    let bundle = vec![
        Manifest {
            path: format!("{system}/app-crd.yaml"),
            content: APP_CRD.to_string(),
        },
        Manifest {
            path: format!("{system}/gitops-runtime.yaml"),
            content: runtime,
        },
        Manifest {
            path: format!("{system}/flux-source-resource.yaml"),
            content: config_repo_source(
                &source_name,
                namespace,
                &args.config_repo.to_string(),
                &branch,
                secret.as_deref(),
            )?,
        },
        Manifest {
            path: format!("{system}/flux-system-kustomization-resource.yaml"),
            content: cluster_scan_kustomization(
                &hash_if_too_long(&format!("{cluster_name}-system")),
                namespace,
                &system,
                &source_name,
            )?,
        },
        Manifest {
            path: format!("{system}/flux-user-kustomization-resource.yaml"),
            content: cluster_scan_kustomization(
                &hash_if_too_long(&format!("{cluster_name}-user")),
                namespace,
                &user_dir(&cluster_name),
                &source_name,
            )?,
        },
        Manifest {
            path: format!("{system}/wego-app.yaml"),
            content: wego_app,
        },
        Manifest {
            path: format!("{system}/wego-config.yaml"),
            content: config_map(namespace, &cluster_name, &args.config_repo)?,
        },
        Manifest {
            path: format!("{}/.keep", user_dir(&cluster_name)),
            content: String::new(),
        },
    ];

    // Direct apply bootstraps the cluster even when the repository is
    // freshly provisioned and the reconciler has nothing to pull yet.
    for manifest in &bundle {
        deps.cluster
            .apply(&manifest.content, namespace)
            .await
            .op("apply-bundle")?;
    }

    let writer = RepoWriter::new(deps.provider, args.mode, auth);
    let pr = writer
        .write_manifests(
            &args.config_repo,
            &args.config_repo.to_string(),
            &branch,
            &bundle,
            &format!("Associate cluster {cluster_name}"),
            &hash_if_too_long(&format!("wego-associate-{cluster_name}")),
            &format!("Gitops associate {cluster_name}"),
            &format!("Add gitops automation manifests for cluster {cluster_name}"),
        )
        .await?;

    if let Some(pr) = pr {
        println!("Pull request created: {}", pr.url);
    }

    info!("installed gitops runtime for cluster {cluster_name}");
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigMapManifest<'a> {
    api_version: &'a str,
    kind: &'a str,
    metadata: ConfigMapMetadata<'a>,
    data: BTreeMap<&'a str, String>,
}

#[derive(Serialize)]
struct ConfigMapMetadata<'a> {
    name: &'a str,
    namespace: &'a str,
}

fn config_map(namespace: &str, cluster_name: &str, config_repo: &RepoUrl) -> Result<String> {
    let mut data = BTreeMap::new();
    data.insert("cluster-name", cluster_name.to_string());
    data.insert("config-repo", config_repo.to_string());
    data.insert("namespace", namespace.to_string());

    let manifest = ConfigMapManifest {
        api_version: "v1",
        kind: "ConfigMap",
        metadata: ConfigMapMetadata {
            name: "wego-config",
            namespace,
        },
        data,
    };

    Ok(sanitize(&serde_yaml::to_string(&manifest)?))
}
