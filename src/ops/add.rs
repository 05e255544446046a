use log::info;

use crate::app::{
    deploy_key_secret_name, sanitize_resource_name, Application, AutomationType, ConfigMode,
    SourceType,
};
use crate::deploy_key::{ensure_deploy_key, requires_deploy_key};
use crate::error::{Error, OpContext, Result};
use crate::manifests;
use crate::ops::{cluster_prelude, Deps};
use crate::repo_url::RepoUrl;
use crate::worktree::GitAuth;
use crate::writer::{RepoWriter, WriteMode};

pub struct AddArgs {
    pub name: Option<String>,
    pub git_source: Option<RepoUrl>,
    pub chart: Option<String>,
    pub helm_url: Option<String>,
    pub path: String,
    pub branch: Option<String>,
    pub automation: Option<AutomationType>,
    pub config: ConfigMode,
    pub helm_target_namespace: Option<String>,
    pub namespace: String,
    pub mode: WriteMode,
    pub dry_run: bool,
}

pub async fn add(deps: &Deps<'_>, args: AddArgs) -> Result<()> {
    run(deps, args).await.op("add")
}

async fn run(deps: &Deps<'_>, args: AddArgs) -> Result<()> {
    let app = finalize(deps, &args).await?;
    let cluster_name = cluster_prelude(deps).await?;

    if let Some(target) = app.helm_target_namespace() {
        if !deps
            .cluster
            .namespace_exists(target)
            .await
            .op("probe-namespace")?
        {
            return Err(Error::precondition(format!(
                "helm target namespace {target} does not exist on the cluster"
            )));
        }
    }

    let hash = app.app_hash();
    let existing = deps
        .cluster
        .list_applications(&args.namespace)
        .await
        .op("list-applications")?;
    if let Some(duplicate) = existing
        .iter()
        .find(|m| m.app_hash_label() == Some(hash.as_str()))
    {
        return Err(Error::precondition(format!(
            "application {} already manages this url, path and branch",
            duplicate.metadata.name
        )));
    }

    if args.dry_run {
        describe_plan(deps, &app, &cluster_name).await?;
        return Ok(());
    }

    // Key first: a pushed manifest referencing a Secret the provider does
    // not know yet is rejected by the reconciler.
    let mut auth = GitAuth::None;
    let mut source_secret = None;

    if let Some(repo) = app.git_source() {
        if requires_deploy_key(deps.provider, repo).await? {
            let key = ensure_deploy_key(deps.provider, deps.cluster, &args.namespace, repo)
                .await
                .op("setup-deploy-key")?;
            source_secret = Some(key.secret_name.clone());

            if app.config_mode() == &ConfigMode::InSourceRepo {
                auth = GitAuth::SshKey(key.private_key);
            }
        }
    }

    let generated = manifests::generate(&app, source_secret.as_deref())?;

    if app.config_mode() == &ConfigMode::InCluster {
        // No repository of record: the intent, source and deployment CRs
        // go straight to the cluster. The kustomize index has no cluster
        // counterpart.
        for manifest in &generated[..3] {
            deps.cluster
                .apply(&manifest.content, &args.namespace)
                .await
                .op("apply")?;
        }

        info!("added {app} (cluster only)");
        return Ok(());
    }

    let config_repo = app
        .config_repo()
        .cloned()
        .ok_or_else(|| Error::validation("a configuration repository is required"))?;

    if !deps
        .provider
        .repository_exists(&config_repo)
        .await
        .op("probe-config-repo")?
    {
        return Err(Error::precondition(format!(
            "configuration repository {config_repo} not found"
        )));
    }

    let config_branch = match app.config_mode() {
        ConfigMode::InSourceRepo => app.branch().to_string(),
        _ => deps
            .provider
            .default_branch(&config_repo)
            .await
            .op("default-branch")?,
    };

    if let ConfigMode::InExternalRepo(url) = app.config_mode() {
        if requires_deploy_key(deps.provider, url).await? {
            let key = ensure_deploy_key(deps.provider, deps.cluster, &args.namespace, url)
                .await
                .op("setup-deploy-key")?;
            auth = GitAuth::SshKey(key.private_key);
        }
    }

    let writer = RepoWriter::new(deps.provider, args.mode, auth);
    let pr = writer
        .add_application(
            &config_repo,
            &config_repo.to_string(),
            &config_branch,
            &cluster_name,
            &app,
            &generated,
        )
        .await?;

    if let Some(pr) = pr {
        println!("Pull request created: {}", pr.url);
    }

    // The intent CR is applied last so it never exists without its
    // manifests being at least in flight.
    deps.cluster
        .apply(&generated[0].content, &args.namespace)
        .await
        .op("apply-intent")?;

    info!("added {app}");
    Ok(())
}

async fn finalize(deps: &Deps<'_>, args: &AddArgs) -> Result<Application> {
    if let Some(chart) = &args.chart {
        if args.automation == Some(AutomationType::Kustomize) {
            return Err(Error::validation(
                "helm repository sources can only use helm automation",
            ));
        }

        let url = args.helm_url.clone().ok_or_else(|| {
            Error::validation("a chart repository url is required for helm chart sources")
        })?;
        let name = args.name.clone().unwrap_or_else(|| chart.clone());

        Application::new(
            name,
            &args.namespace,
            SourceType::Helm,
            AutomationType::Helm,
            None,
            Some(url),
            args.config.clone(),
            "",
            chart.clone(),
            args.helm_target_namespace.clone(),
        )
    } else {
        let repo = args
            .git_source
            .clone()
            .ok_or_else(|| Error::validation("a git repository url is required"))?;

        let branch = match &args.branch {
            Some(branch) => branch.clone(),
            None => deps
                .provider
                .default_branch(&repo)
                .await
                .op("default-branch")?,
        };
        let name = args
            .name
            .clone()
            .unwrap_or_else(|| sanitize_resource_name(repo.name()));

        Application::new(
            name,
            &args.namespace,
            SourceType::Git,
            args.automation.unwrap_or(AutomationType::Kustomize),
            Some(repo),
            None,
            args.config.clone(),
            branch,
            args.path.clone(),
            args.helm_target_namespace.clone(),
        )
    }
}

/// Prints what a real run would do, without touching provider or cluster.
async fn describe_plan(deps: &Deps<'_>, app: &Application, cluster_name: &str) -> Result<()> {
    let secret = match app.git_source() {
        Some(repo) if requires_deploy_key(deps.provider, repo).await? => {
            Some(deploy_key_secret_name(repo))
        }
        _ => None,
    };

    println!("dry-run: adding {app} to cluster {cluster_name}");
    if let Some(secret) = &secret {
        println!("  would provision deploy key secret {secret}");
    }

    let generated = manifests::generate(app, secret.as_deref())?;
    match app.config_mode() {
        ConfigMode::InCluster => println!("  would apply manifests directly to the cluster:"),
        ConfigMode::InSourceRepo => println!("  would write to the application repository:"),
        ConfigMode::InExternalRepo(url) => println!("  would write to {url}:"),
    }
    for manifest in &generated {
        println!("    {}", manifest.path);
    }
    println!("    {}", manifests::user_kustomization_path(cluster_name));

    Ok(())
}
