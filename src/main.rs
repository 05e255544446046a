use std::env;
use std::process::ExitCode;

use clap::Parser;

mod app;
mod cli;
mod cluster;
mod deploy_key;
mod error;
mod manifests;
mod ops;
mod provider;
mod repo_url;
mod worktree;
mod writer;

use crate::app::{AutomationType, ConfigMode};
use crate::cli::{Command, GlobalOpts};
use crate::cluster::{Cluster, KubeCluster};
use crate::error::{Error, ErrorKind, Result};
use crate::ops::{Deps, HttpCatalog};
use crate::provider::{DryRunProvider, GitProvider, GithubProvider};
use crate::repo_url::{Provider, ProviderTable, RepoUrl};
use crate::writer::WriteMode;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = cli::App::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            match err.kind() {
                ErrorKind::Validation => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}

async fn run(args: cli::App) -> Result<()> {
    let opts = &args.global_opts;
    let table = provider_table(opts)?;
    let cluster = KubeCluster::connect().await?;

    match args.command {
        Command::Add(add) => {
            let git_source = match &add.url {
                Some(url) => Some(RepoUrl::parse_with(url, &table)?),
                None => None,
            };
            let config = config_mode(add.app_config_url.as_deref(), &table)?;
            let automation = match add.deployment_type.as_deref() {
                None => None,
                Some("kustomize") => Some(AutomationType::Kustomize),
                Some("helm") => Some(AutomationType::Helm),
                Some(other) => {
                    return Err(Error::validation(format!(
                        "unknown deployment type {other:?}, expected kustomize or helm"
                    )))
                }
            };

            let repo_of_record = match &config {
                ConfigMode::InExternalRepo(repo) => Some(repo),
                _ => git_source.as_ref(),
            };
            let provider = make_provider(repo_of_record, opts.dry_run)?;
            let deps = Deps {
                provider: provider.as_ref(),
                cluster: &cluster,
            };

            ops::add(
                &deps,
                ops::AddArgs {
                    name: add.name,
                    git_source,
                    chart: add.chart,
                    helm_url: add.helm_repo_url,
                    path: add.path,
                    branch: add.branch,
                    automation,
                    config,
                    helm_target_namespace: add.helm_release_target_namespace,
                    namespace: opts.namespace.clone(),
                    mode: write_mode(add.auto_merge),
                    dry_run: opts.dry_run,
                },
            )
            .await
        }
        Command::Remove(remove) => {
            let app = stored_app(&cluster, &opts.namespace, &remove.name).await?;
            let provider = make_provider(app.config_repo(), opts.dry_run)?;
            let deps = Deps {
                provider: provider.as_ref(),
                cluster: &cluster,
            };

            ops::remove(
                &deps,
                ops::RemoveArgs {
                    name: remove.name,
                    namespace: opts.namespace.clone(),
                    mode: write_mode(remove.auto_merge),
                    dry_run: opts.dry_run,
                },
            )
            .await
        }
        Command::Status(status) => {
            let app = stored_app(&cluster, &opts.namespace, &status.name).await?;
            let provider = make_provider(app.git_source(), opts.dry_run)?;
            let deps = Deps {
                provider: provider.as_ref(),
                cluster: &cluster,
            };

            let report = ops::status(&deps, &opts.namespace, &status.name).await?;
            print_status(&report);
            Ok(())
        }
        Command::Sync(sync) => {
            let provider = make_provider(None, opts.dry_run)?;
            let deps = Deps {
                provider: provider.as_ref(),
                cluster: &cluster,
            };

            ops::sync(&deps, &opts.namespace, &sync.name).await?;
            println!("Sync of {} complete", sync.name);
            Ok(())
        }
        Command::Install(install) => {
            let config_repo = RepoUrl::parse_with(&install.app_config_url, &table)?;
            let provider = make_provider(Some(&config_repo), opts.dry_run)?;
            let deps = Deps {
                provider: provider.as_ref(),
                cluster: &cluster,
            };

            ops::install(
                &deps,
                ops::InstallArgs {
                    namespace: opts.namespace.clone(),
                    config_repo,
                    mode: write_mode(install.auto_merge),
                    dry_run: opts.dry_run,
                },
            )
            .await
        }
        Command::AddProfile(profile) => {
            let config_repo = RepoUrl::parse_with(&profile.app_config_url, &table)?;
            let provider = make_provider(Some(&config_repo), opts.dry_run)?;
            let deps = Deps {
                provider: provider.as_ref(),
                cluster: &cluster,
            };
            let catalog = HttpCatalog::new(profile.catalog_url);

            ops::add_profile(
                &deps,
                &catalog,
                ops::AddProfileArgs {
                    name: profile.name,
                    version: profile.version,
                    namespace: opts.namespace.clone(),
                    config_repo,
                    auto_merge: profile.auto_merge,
                },
            )
            .await
        }
    }
}

fn provider_table(opts: &GlobalOpts) -> Result<ProviderTable> {
    let mut table = ProviderTable::default();
    for host in &opts.github_hosts {
        table.insert(host.clone(), Provider::Github);
    }
    for host in &opts.gitlab_hosts {
        table.insert(host.clone(), Provider::Gitlab);
    }

    // Escape hatch for hosts the table cannot classify.
    match env::var("GIT_PROVIDER").ok().as_deref() {
        None => {}
        Some("github") => table.force(Provider::Github),
        Some("gitlab") => table.force(Provider::Gitlab),
        Some(other) => {
            return Err(Error::validation(format!(
                "unknown GIT_PROVIDER {other:?}, expected github or gitlab"
            )))
        }
    }

    Ok(table)
}

fn config_mode(app_config_url: Option<&str>, table: &ProviderTable) -> Result<ConfigMode> {
    match app_config_url {
        None => Ok(ConfigMode::InSourceRepo),
        Some("") => Ok(ConfigMode::InSourceRepo),
        Some(raw) if raw.eq_ignore_ascii_case("none") => Ok(ConfigMode::InCluster),
        Some(url) => Ok(ConfigMode::InExternalRepo(RepoUrl::parse_with(url, table)?)),
    }
}

fn write_mode(auto_merge: bool) -> WriteMode {
    if auto_merge {
        WriteMode::Push
    } else {
        WriteMode::PullRequest
    }
}

/// Fetches the stored intent for commands that discover their repositories
/// from the cluster rather than from a flag.
async fn stored_app(
    cluster: &dyn Cluster,
    namespace: &str,
    name: &str,
) -> Result<app::Application> {
    let manifest = cluster.get_application(namespace, name).await?.ok_or_else(|| {
        Error::precondition(format!(
            "application {name} not found in namespace {namespace}"
        ))
    })?;

    app::Application::from_manifest(&manifest)
}

/// Picks the hosting driver from the repository of record. With no
/// repository involved no token is needed and the inert driver serves.
fn make_provider(repo: Option<&RepoUrl>, dry_run: bool) -> Result<Box<dyn GitProvider>> {
    let Some(repo) = repo else {
        return Ok(Box::new(DryRunProvider));
    };

    if repo.provider() == Provider::Gitlab {
        if env::var("GITLAB_TOKEN").is_err() {
            return Err(Error::precondition("GITLAB_TOKEN not set"));
        }
        return Err(Error::validation(
            "gitlab-hosted repositories are not supported",
        ));
    }

    match env::var("GITHUB_TOKEN") {
        Ok(token) => Ok(Box::new(GithubProvider::new(token)?)),
        Err(_) if dry_run => Ok(Box::new(DryRunProvider)),
        Err(_) => Err(Error::precondition("GITHUB_TOKEN not set")),
    }
}


fn print_status(report: &ops::StatusReport) {
    println!("Status of {}", report.app);

    match &report.last_successful_reconciliation {
        Some(time) => println!("Last successful reconciliation: {time}"),
        None => println!("No successful reconciliation yet"),
    }

    if !report.commits.is_empty() {
        println!();
        println!("Recent commits:");
        for commit in &report.commits {
            let short = commit.sha.get(..7).unwrap_or(&commit.sha);
            println!("  {short}  {}  {}", commit.author, commit.message);
        }
    }
}
