use log::info;

use crate::app::{Application, ConfigMode};
use crate::deploy_key::{ensure_deploy_key, requires_deploy_key};
use crate::error::{Error, OpContext, Result};
use crate::manifests::{deploy_kind, source_kind};
use crate::ops::{cluster_prelude, Deps};
use crate::worktree::GitAuth;
use crate::writer::{RepoWriter, WriteMode};

pub struct RemoveArgs {
    pub name: String,
    pub namespace: String,
    pub mode: WriteMode,
    pub dry_run: bool,
}

pub async fn remove(deps: &Deps<'_>, args: RemoveArgs) -> Result<()> {
    run(deps, args).await.op("remove")
}

async fn run(deps: &Deps<'_>, args: RemoveArgs) -> Result<()> {
    let manifest = deps
        .cluster
        .get_application(&args.namespace, &args.name)
        .await
        .op("get-application")?
        .ok_or_else(|| {
            Error::precondition(format!(
                "application {} not found in namespace {}",
                args.name, args.namespace
            ))
        })?;
    let app = Application::from_manifest(&manifest)?;

    let cluster_name = cluster_prelude(deps).await?;

    if args.dry_run {
        println!("dry-run: removing {app} from cluster {cluster_name}");
        return Ok(());
    }

    match app.config_mode() {
        ConfigMode::InCluster => {
            deps.cluster
                .delete_resource(deploy_kind(&app), &args.namespace, app.name())
                .await
                .op("delete-deployment")?;
            deps.cluster
                .delete_resource(source_kind(&app), &args.namespace, app.name())
                .await
                .op("delete-source")?;
        }
        _ => {
            let config_repo = app
                .config_repo()
                .cloned()
                .ok_or_else(|| Error::validation("a configuration repository is required"))?;

            let config_branch = match app.config_mode() {
                ConfigMode::InSourceRepo => app.branch().to_string(),
                _ => deps
                    .provider
                    .default_branch(&config_repo)
                    .await
                    .op("default-branch")?,
            };

            // Reuses the stored key when both halves survive; otherwise
            // this re-provisions exactly like Add would.
            let auth = if requires_deploy_key(deps.provider, &config_repo).await? {
                let key =
                    ensure_deploy_key(deps.provider, deps.cluster, &args.namespace, &config_repo)
                        .await
                        .op("setup-deploy-key")?;
                GitAuth::SshKey(key.private_key)
            } else {
                GitAuth::None
            };

            let writer = RepoWriter::new(deps.provider, args.mode, auth);
            let pr = writer
                .remove_application(
                    &config_repo,
                    &config_repo.to_string(),
                    &config_branch,
                    &cluster_name,
                    &app,
                )
                .await?;

            if let Some(pr) = pr {
                println!("Pull request created: {}", pr.url);
            }
        }
    }

    // The intent CR goes last so a failed repository write leaves the
    // application discoverable for a retry.
    deps.cluster
        .delete_application(&args.namespace, &args.name)
        .await
        .op("delete-intent")?;

    info!("removed {app}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AutomationType, SourceType};
    use crate::cluster::ResourceKind;
    use crate::error::ErrorKind;
    use crate::ops::testutil::{FakeCluster, FakeProvider};
    use crate::repo_url::RepoUrl;

    fn cluster_with_app(config: ConfigMode) -> FakeCluster {
        let app = Application::new(
            "myapp",
            "wego-system",
            SourceType::Git,
            AutomationType::Kustomize,
            Some(RepoUrl::parse("git@github.com:foo/bar.git").unwrap()),
            None,
            config,
            "main",
            "./deploy",
            None,
        )
        .unwrap();

        let cluster = FakeCluster::default();
        cluster.applications.lock().unwrap().insert(
            ("wego-system".to_string(), "myapp".to_string()),
            app.to_manifest(),
        );
        cluster
    }

    #[tokio::test]
    async fn cluster_only_remove_deletes_the_intent_last() {
        let provider = FakeProvider::default();
        let cluster = cluster_with_app(ConfigMode::InCluster);
        let deps = Deps {
            provider: &provider,
            cluster: &cluster,
        };

        remove(
            &deps,
            RemoveArgs {
                name: "myapp".to_string(),
                namespace: "wego-system".to_string(),
                mode: WriteMode::Push,
                dry_run: false,
            },
        )
        .await
        .unwrap();

        let deleted = cluster.deleted.lock().unwrap();
        assert_eq!(
            deleted
                .iter()
                .map(|(kind, _, _)| *kind)
                .collect::<Vec<_>>(),
            vec![
                ResourceKind::Kustomization,
                ResourceKind::GitRepository,
                ResourceKind::Application
            ]
        );
        assert!(cluster.applications.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_application_is_a_precondition_error() {
        let provider = FakeProvider::default();
        let cluster = FakeCluster::default();
        let deps = Deps {
            provider: &provider,
            cluster: &cluster,
        };

        let err = remove(
            &deps,
            RemoveArgs {
                name: "ghost".to_string(),
                namespace: "wego-system".to_string(),
                mode: WriteMode::Push,
                dry_run: false,
            },
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn dry_run_deletes_nothing() {
        let provider = FakeProvider::default();
        let cluster = cluster_with_app(ConfigMode::InCluster);
        let deps = Deps {
            provider: &provider,
            cluster: &cluster,
        };

        remove(
            &deps,
            RemoveArgs {
                name: "myapp".to_string(),
                namespace: "wego-system".to_string(),
                mode: WriteMode::Push,
                dry_run: true,
            },
        )
        .await
        .unwrap();

        assert!(cluster.deleted.lock().unwrap().is_empty());
        assert_eq!(cluster.applications.lock().unwrap().len(), 1);
    }
}
