use async_trait::async_trait;
use semver::Version;
use serde::Deserialize;

use crate::app::{hash_if_too_long, validate_resource_name, RESERVED_PREFIX};
use crate::cluster::split_documents;
use crate::error::{Error, OpContext, Result};
use crate::manifests::{helm_release, sanitize, system_dir, HelmRelease, Manifest};
use crate::ops::Deps;
use crate::repo_url::RepoUrl;
use crate::worktree::GitAuth;
use crate::writer::{RepoWriter, WriteMode};

pub const PROFILES_FILE: &str = "profiles.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogProfile {
    pub name: String,
    #[serde(default)]
    pub available_versions: Vec<String>,
    pub helm_repository: HelmRepositoryRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelmRepositoryRef {
    pub name: String,
    pub namespace: String,
}

/// Where profiles come from. The live implementation talks to the
/// in-cluster catalog service.
#[async_trait]
pub trait ProfileCatalog: Send + Sync {
    async fn list(&self) -> Result<Vec<CatalogProfile>>;
}

pub struct HttpCatalog {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCatalog {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    profiles: Vec<CatalogProfile>,
}

#[async_trait]
impl ProfileCatalog for HttpCatalog {
    async fn list(&self) -> Result<Vec<CatalogProfile>> {
        let url = format!("{}/v1/profiles", self.base_url.trim_end_matches('/'));

        let response = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| {
                Error::network(format!("profile catalog at {url} refused the request"))
                    .with_source(e)
            })?;

        let catalog: CatalogResponse = response.json().await?;
        Ok(catalog.profiles)
    }
}

pub struct AddProfileArgs {
    pub name: String,
    /// An exact version from the catalog, or `latest`.
    pub version: String,
    pub namespace: String,
    pub config_repo: RepoUrl,
    pub auto_merge: bool,
}

pub async fn add_profile(
    deps: &Deps<'_>,
    catalog: &dyn ProfileCatalog,
    args: AddProfileArgs,
) -> Result<()> {
    run(deps, catalog, args).await.op("add-profile")
}

async fn run(
    deps: &Deps<'_>,
    catalog: &dyn ProfileCatalog,
    args: AddProfileArgs,
) -> Result<()> {
    validate_resource_name(&args.name)?;
    if args.name.starts_with(RESERVED_PREFIX) {
        return Err(Error::validation(format!(
            "profile name {:?} may not start with the reserved prefix {RESERVED_PREFIX:?}",
            args.name
        )));
    }

    let profiles = catalog.list().await.op("fetch-catalog")?;
    let profile = profiles
        .into_iter()
        .find(|p| p.name == args.name)
        .ok_or_else(|| {
            Error::precondition(format!("profile {} is not in the catalog", args.name))
        })?;

    let version = resolve_version(&profile, &args.version)?;

    let cluster_name = deps.cluster.cluster_name().await.op("cluster-name")?;
    let branch = deps
        .provider
        .default_branch(&args.config_repo)
        .await
        .op("default-branch")?;

    let system = system_dir(&cluster_name);
    let path = format!("{system}/{PROFILES_FILE}");

    let existing = deps
        .provider
        .repo_dir_files(&args.config_repo, &system, &branch)
        .await
        .op("read-profiles")?
        .into_iter()
        .find(|f| f.path == path)
        .and_then(|f| f.content);

    let mut releases = parse_profiles(existing.as_deref())?;

    if releases.iter().any(|r| {
        r.metadata.name == args.name
            && r.metadata.namespace == args.namespace
            && r.spec.chart.spec.version.as_deref() == Some(version.as_str())
    }) {
        return Err(Error::precondition(format!(
            "profile {} version {version} is already installed in {}",
            args.name, args.namespace
        )));
    }

    // A different installed version is an upgrade: replace its entry.
    releases.retain(|r| !(r.metadata.name == args.name && r.metadata.namespace == args.namespace));
    releases.push(helm_release(
        &args.name,
        &args.namespace,
        args.name.clone(),
        Some(version.clone()),
        "HelmRepository",
        &profile.helm_repository.name,
        None,
    ));

    let content = render_profiles(&releases)?;

    let mode = if args.auto_merge {
        WriteMode::MergedPullRequest
    } else {
        WriteMode::PullRequest
    };
    let writer = RepoWriter::new(deps.provider, mode, GitAuth::None);

    let pr = writer
        .write_manifests(
            &args.config_repo,
            &args.config_repo.to_string(),
            &branch,
            &[Manifest { path, content }],
            &format!("Add profile {} {version}", args.name),
            &hash_if_too_long(&format!("wego-add-profile-{}", args.name)),
            &format!("Gitops add profile {}", args.name),
            &format!(
                "Add profile {} version {version} to cluster {cluster_name}",
                args.name
            ),
        )
        .await?;

    if let Some(pr) = pr {
        println!("Pull request created: {}", pr.url);
    }

    Ok(())
}

fn parse_profiles(content: Option<&str>) -> Result<Vec<HelmRelease>> {
    let Some(raw) = content else {
        return Ok(Vec::new());
    };

    split_documents(raw)
        .into_iter()
        .map(|doc| serde_yaml::from_str(doc).map_err(Error::from))
        .collect()
}

fn render_profiles(releases: &[HelmRelease]) -> Result<String> {
    let mut out = String::new();
    for release in releases {
        out.push_str(&sanitize(&serde_yaml::to_string(release)?));
    }
    Ok(out)
}

fn resolve_version(profile: &CatalogProfile, requested: &str) -> Result<String> {
    if requested == "latest" {
        return profile
            .available_versions
            .iter()
            .filter_map(|raw| {
                Version::parse(raw.trim_start_matches('v'))
                    .ok()
                    .map(|parsed| (parsed, raw.clone()))
            })
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, raw)| raw)
            .ok_or_else(|| {
                Error::precondition(format!(
                    "profile {} has no parseable versions in the catalog",
                    profile.name
                ))
            });
    }

    if profile.available_versions.iter().any(|v| v == requested) {
        Ok(requested.to_string())
    } else {
        Err(Error::precondition(format!(
            "version {requested} of profile {} is not available",
            profile.name
        )))
    }
}
