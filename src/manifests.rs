use serde::{Deserialize, Serialize};

use crate::app::{Application, AutomationType, SourceType, AUTOMATION_ROOT};
use crate::cluster::ResourceKind;
use crate::error::Result;

const SOURCE_INTERVAL: &str = "30s";
const DEPLOY_INTERVAL: &str = "1m";
const HELM_RELEASE_INTERVAL: &str = "5m";

pub const SOURCE_API_VERSION: &str = "source.toolkit.fluxcd.io/v1beta1";
pub const KUSTOMIZE_API_VERSION: &str = "kustomize.toolkit.fluxcd.io/v1beta1";
pub const HELM_API_VERSION: &str = "helm.toolkit.fluxcd.io/v2beta1";
pub const KUSTOMIZE_FILE_API_VERSION: &str = "kustomize.config.k8s.io/v1beta1";

// Paths the source reconciler must never react to. The standard exclusion
// lists, plus this tool's own bookkeeping directory.
const EXCLUDE_VCS: &str = ".git/,.gitignore,.gitmodules,.gitattributes";
const EXCLUDE_EXT: &str = "*.jpg,*.jpeg,*.gif,*.png,*.wmv,*.flv,*.tar.gz,*.zip";
const EXCLUDE_CI: &str = ".github/,.circleci/,.travis.yml,.gitlab-ci.yml,appveyor.yml,.drone.yml,cloudbuild.yaml,codeship-services.yml,codeship-steps.yml";
const EXCLUDE_EXTRA: &str = "**/.goreleaser.yml,**/.sops.yaml,**/.flux.yaml";

pub fn source_ignore_spec() -> String {
    format!("{EXCLUDE_VCS},{EXCLUDE_EXT},{EXCLUDE_CI},{EXCLUDE_EXTRA},/{AUTOMATION_ROOT}/")
}

/// One file destined for the configuration repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub path: String,
    pub content: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct NamedRef {
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SourceRef {
    pub kind: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GitRepository {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: GitRepositorySpec,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositorySpec {
    pub interval: String,
    pub url: String,
    #[serde(rename = "ref")]
    pub reference: GitRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<NamedRef>,
    pub ignore: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct GitRef {
    pub branch: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepository {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: HelmRepositorySpec,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct HelmRepositorySpec {
    pub interval: String,
    pub url: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FluxKustomization {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: FluxKustomizationSpec,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FluxKustomizationSpec {
    pub interval: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    pub prune: bool,
    pub source_ref: SourceRef,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub validation: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HelmRelease {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: HelmReleaseSpec,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseSpec {
    pub interval: String,
    pub chart: HelmChartTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct HelmChartTemplate {
    pub spec: HelmChartSpec,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartSpec {
    pub chart: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub source_ref: SourceRef,
}

/// A kustomize tool file (not the reconciler kind): the per-app index and
/// the cluster user aggregator both have this shape.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KustomizeFile {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
}

impl KustomizeFile {
    fn new() -> Self {
        Self {
            api_version: KUSTOMIZE_FILE_API_VERSION.to_string(),
            kind: "Kustomization".to_string(),
            metadata: None,
            namespace: None,
            resources: Vec::new(),
        }
    }

    /// Appends an entry unless it is already listed. Returns whether the
    /// file changed.
    pub fn add_resource(&mut self, entry: &str) -> bool {
        if self.resources.iter().any(|r| r == entry) {
            return false;
        }

        self.resources.push(entry.to_string());
        true
    }

    /// Filters an entry out, preserving the order of everything else.
    pub fn remove_resource(&mut self, entry: &str) -> bool {
        let before = self.resources.len();
        self.resources.retain(|r| r != entry);
        self.resources.len() != before
    }
}

/// Path of the user aggregator for a cluster.
pub fn user_kustomization_path(cluster_name: &str) -> String {
    format!("{AUTOMATION_ROOT}/clusters/{cluster_name}/user/kustomization.yaml")
}

pub fn system_dir(cluster_name: &str) -> String {
    format!("{AUTOMATION_ROOT}/clusters/{cluster_name}/system")
}

pub fn user_dir(cluster_name: &str) -> String {
    format!("{AUTOMATION_ROOT}/clusters/{cluster_name}/user")
}

/// Parses an existing aggregator, or starts an empty one.
pub fn parse_kustomize_file(content: Option<&str>) -> Result<KustomizeFile> {
    match content {
        Some(raw) => Ok(serde_yaml::from_str(raw)?),
        None => Ok(KustomizeFile::new()),
    }
}

pub fn render_kustomize_file(file: &KustomizeFile) -> Result<String> {
    Ok(sanitize(&serde_yaml::to_string(file)?))
}

/// Prefixes the document marker and drops the serialization noise the
/// cluster would reject on re-apply.
pub fn sanitize(yaml: &str) -> String {
    let mut out = String::with_capacity(yaml.len() + 4);
    out.push_str("---\n");

    for line in yaml.lines() {
        if line.trim_start() == "creationTimestamp: null" || line == "status: {}" {
            continue;
        }

        out.push_str(line);
        out.push('\n');
    }

    out
}

/// The reconciler kind of the source CR for an application.
pub fn source_kind(app: &Application) -> ResourceKind {
    match app.source_type() {
        SourceType::Git => ResourceKind::GitRepository,
        SourceType::Helm => ResourceKind::HelmRepository,
    }
}

/// The reconciler kind of the deployment CR for an application.
pub fn deploy_kind(app: &Application) -> ResourceKind {
    match app.automation_type() {
        AutomationType::Kustomize => ResourceKind::Kustomization,
        AutomationType::Helm => ResourceKind::HelmRelease,
    }
}

/// Emits the four per-application manifests in their write order: the
/// intent CR, the source, the deployment, and the per-app kustomize index.
/// Output depends only on the arguments; repeated calls are byte-identical.
pub fn generate(
    app: &Application,
    deploy_key_secret: Option<&str>,
) -> Result<Vec<Manifest>> {
    let intent = Manifest {
        path: app.app_yaml_path(),
        content: sanitize(&serde_yaml::to_string(&app.to_manifest())?),
    };

    let source = Manifest {
        path: app.source_manifest_path(),
        content: source_manifest(app, deploy_key_secret)?,
    };

    let deploy = Manifest {
        path: app.deploy_manifest_path(),
        content: deploy_manifest(app)?,
    };

    let mut index = KustomizeFile::new();
    index.namespace = Some(app.namespace().to_string());
    for manifest in [&intent, &source, &deploy] {
        // Basenames only; the index sits in the same directory.
        let basename = manifest
            .path
            .rsplit('/')
            .next()
            .unwrap_or(manifest.path.as_str());
        index.add_resource(basename);
    }

    let kustomization = Manifest {
        path: app.kustomization_path(),
        content: render_kustomize_file(&index)?,
    };

    Ok(vec![intent, source, deploy, kustomization])
}

fn source_manifest(app: &Application, deploy_key_secret: Option<&str>) -> Result<String> {
    let yaml = match app.source_type() {
        SourceType::Git => serde_yaml::to_string(&GitRepository {
            api_version: SOURCE_API_VERSION.to_string(),
            kind: "GitRepository".to_string(),
            metadata: ObjectMeta {
                name: app.name().to_string(),
                namespace: app.namespace().to_string(),
            },
            spec: GitRepositorySpec {
                interval: SOURCE_INTERVAL.to_string(),
                url: app.source_url(),
                reference: GitRef {
                    branch: app.branch().to_string(),
                },
                secret_ref: deploy_key_secret.map(|name| NamedRef {
                    name: name.to_string(),
                }),
                ignore: source_ignore_spec(),
            },
        })?,
        SourceType::Helm => serde_yaml::to_string(&HelmRepository {
            api_version: SOURCE_API_VERSION.to_string(),
            kind: "HelmRepository".to_string(),
            metadata: ObjectMeta {
                name: app.name().to_string(),
                namespace: app.namespace().to_string(),
            },
            spec: HelmRepositorySpec {
                interval: SOURCE_INTERVAL.to_string(),
                url: app.source_url(),
            },
        })?,
    };

    Ok(sanitize(&yaml))
}

fn deploy_manifest(app: &Application) -> Result<String> {
    let yaml = match app.automation_type() {
        AutomationType::Kustomize => serde_yaml::to_string(&FluxKustomization {
            api_version: KUSTOMIZE_API_VERSION.to_string(),
            kind: "Kustomization".to_string(),
            metadata: ObjectMeta {
                name: app.name().to_string(),
                namespace: app.namespace().to_string(),
            },
            spec: FluxKustomizationSpec {
                interval: DEPLOY_INTERVAL.to_string(),
                path: app.path().to_string(),
                prune: true,
                source_ref: SourceRef {
                    kind: "GitRepository".to_string(),
                    name: app.name().to_string(),
                },
                validation: "client".to_string(),
            },
        })?,
        AutomationType::Helm => {
            let (source_kind, chart) = match app.source_type() {
                SourceType::Git => ("GitRepository", app.path().to_string()),
                SourceType::Helm => ("HelmRepository", app.name().to_string()),
            };

            serde_yaml::to_string(&helm_release(
                app.name(),
                app.namespace(),
                chart,
                None,
                source_kind,
                app.name(),
                app.helm_target_namespace(),
            ))?
        }
    };

    Ok(sanitize(&yaml))
}

/// A HelmRelease shape shared with the profile installer.
pub fn helm_release(
    name: &str,
    namespace: &str,
    chart: String,
    version: Option<String>,
    source_kind: &str,
    source_name: &str,
    target_namespace: Option<&str>,
) -> HelmRelease {
    HelmRelease {
        api_version: HELM_API_VERSION.to_string(),
        kind: "HelmRelease".to_string(),
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: namespace.to_string(),
        },
        spec: HelmReleaseSpec {
            interval: HELM_RELEASE_INTERVAL.to_string(),
            chart: HelmChartTemplate {
                spec: HelmChartSpec {
                    chart,
                    version,
                    source_ref: SourceRef {
                        kind: source_kind.to_string(),
                        name: source_name.to_string(),
                    },
                },
            },
            target_namespace: target_namespace.map(str::to_string),
        },
    }
}

/// The root GitRepository the installer points at the configuration repo.
pub fn config_repo_source(
    name: &str,
    namespace: &str,
    url: &str,
    branch: &str,
    deploy_key_secret: Option<&str>,
) -> Result<String> {
    let yaml = serde_yaml::to_string(&GitRepository {
        api_version: SOURCE_API_VERSION.to_string(),
        kind: "GitRepository".to_string(),
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: namespace.to_string(),
        },
        spec: GitRepositorySpec {
            interval: SOURCE_INTERVAL.to_string(),
            url: url.to_string(),
            reference: GitRef {
                branch: branch.to_string(),
            },
            secret_ref: deploy_key_secret.map(|name| NamedRef {
                name: name.to_string(),
            }),
            ignore: source_ignore_spec(),
        },
    })?;

    Ok(sanitize(&yaml))
}

/// A cluster Kustomization scanning one of the cluster directories.
pub fn cluster_scan_kustomization(
    name: &str,
    namespace: &str,
    scan_path: &str,
    source_name: &str,
) -> Result<String> {
    let yaml = serde_yaml::to_string(&FluxKustomization {
        api_version: KUSTOMIZE_API_VERSION.to_string(),
        kind: "Kustomization".to_string(),
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: namespace.to_string(),
        },
        spec: FluxKustomizationSpec {
            interval: DEPLOY_INTERVAL.to_string(),
            path: format!("./{scan_path}"),
            prune: true,
            source_ref: SourceRef {
                kind: "GitRepository".to_string(),
                name: source_name.to_string(),
            },
            validation: "client".to_string(),
        },
    })?;

    Ok(sanitize(&yaml))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ConfigMode;
    use crate::repo_url::RepoUrl;

    fn kustomize_app() -> Application {
        Application::new(
            "myapp",
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

    #[test]
    fn kustomize_app_produces_four_manifests_in_write_order() {
        let app = kustomize_app();
        let manifests = generate(&app, Some("wego-github-bar")).unwrap();

        let paths: Vec<&str> = manifests.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                ".weave-gitops/apps/myapp/app.yaml",
                ".weave-gitops/apps/myapp/myapp-gitops-source.yaml",
                ".weave-gitops/apps/myapp/myapp-gitops-deploy.yaml",
                ".weave-gitops/apps/myapp/kustomization.yaml",
            ]
        );

        for manifest in &manifests {
            assert!(manifest.content.starts_with("---\n"), "{}", manifest.path);
            assert!(!manifest.content.contains("creationTimestamp"));
        }

        let source = &manifests[1].content;
        assert!(source.contains("kind: GitRepository"));
        assert!(source.contains("name: wego-github-bar"));
        assert!(source.contains("/.weave-gitops/"));
        assert!(source.contains("interval: 30s"));

        let deploy = &manifests[2].content;
        assert!(deploy.contains("kind: Kustomization"));
        assert!(deploy.contains("prune: true"));
        assert!(deploy.contains("validation: client"));
        assert!(deploy.contains("interval: 1m"));
    }

    #[test]
    fn public_repo_source_has_no_secret_ref() {
        let manifests = generate(&kustomize_app(), None).unwrap();
        assert!(!manifests[1].content.contains("secretRef"));
    }

    #[test]
    fn helm_chart_release_targets_the_requested_namespace() {
        let app = Application::new(
            "loki",
            "wego-system",
            SourceType::Helm,
            AutomationType::Helm,
            None,
            Some("https://charts.kube-ops.io".to_string()),
            ConfigMode::InExternalRepo(
                RepoUrl::parse("ssh://git@github.com/owner/config.git").unwrap(),
            ),
            "",
            "loki",
            Some("sock-shop".to_string()),
        )
        .unwrap();

        let manifests = generate(&app, None).unwrap();

        let source = &manifests[1].content;
        assert!(source.contains("kind: HelmRepository"));
        assert!(source.contains("url: https://charts.kube-ops.io"));

        let deploy = &manifests[2].content;
        assert!(deploy.contains("kind: HelmRelease"));
        assert!(deploy.contains("kind: HelmRepository"));
        assert!(deploy.contains("name: loki"));
        assert!(deploy.contains("chart: loki"));
        assert!(deploy.contains("targetNamespace: sock-shop"));
        assert!(deploy.contains("interval: 5m"));
    }

    #[test]
    fn generator_output_is_byte_identical_across_calls() {
        let app = kustomize_app();
        let first = generate(&app, Some("wego-github-bar")).unwrap();
        let second = generate(&app, Some("wego-github-bar")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn per_app_index_lists_basenames_in_namespace() {
        let manifests = generate(&kustomize_app(), None).unwrap();
        let index: KustomizeFile =
            serde_yaml::from_str(manifests[3].content.trim_start_matches("---\n")).unwrap();

        assert_eq!(index.namespace.as_deref(), Some("wego-system"));
        assert_eq!(
            index.resources,
            vec![
                "app.yaml",
                "myapp-gitops-source.yaml",
                "myapp-gitops-deploy.yaml"
            ]
        );
    }

    #[test]
    fn aggregator_edits_are_idempotent_and_order_preserving() {
        let mut aggregator = parse_kustomize_file(None).unwrap();
        assert!(aggregator.add_resource("../../../apps/first"));
        assert!(aggregator.add_resource("../../../apps/second"));
        assert!(!aggregator.add_resource("../../../apps/first"));

        let rendered = render_kustomize_file(&aggregator).unwrap();
        let mut reparsed = parse_kustomize_file(Some(rendered.trim_start_matches("---\n"))).unwrap();
        assert_eq!(reparsed, aggregator);

        assert!(reparsed.remove_resource("../../../apps/first"));
        assert!(!reparsed.remove_resource("../../../apps/first"));
        assert_eq!(reparsed.resources, vec!["../../../apps/second"]);
    }

    #[test]
    fn kustomize_files_with_metadata_compare_by_value() {
        let raw = "apiVersion: kustomize.config.k8s.io/v1beta1\nkind: Kustomization\nmetadata:\n  name: idx\nresources:\n  - app.yaml\n";
        let parsed = parse_kustomize_file(Some(raw)).unwrap();
        let reparsed =
            parse_kustomize_file(Some(render_kustomize_file(&parsed).unwrap().trim_start_matches("---\n")))
                .unwrap();

        assert_eq!(reparsed, parsed);
        assert_eq!(
            reparsed.metadata.as_ref().map(|m| m.name.as_str()),
            Some("idx")
        );
    }

    #[test]
    fn sanitize_strips_serialization_noise() {
        let raw = "metadata:\n  name: x\n  creationTimestamp: null\nstatus: {}\nspec:\n  a: 1\n";
        assert_eq!(sanitize(raw), "---\nmetadata:\n  name: x\nspec:\n  a: 1\n");
    }
}
