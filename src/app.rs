use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::repo_url::RepoUrl;

/// Root directory for everything this tool writes into a configuration repo.
pub const AUTOMATION_ROOT: &str = ".weave-gitops";

/// Label carrying the AppHash on the Application CR.
pub const APP_IDENTIFIER_LABEL: &str = "wego.weave.works/app-identifier";

/// Application names starting with this prefix are reserved for generated
/// resources (secret names, hash fallbacks, the install namespace).
pub const RESERVED_PREFIX: &str = "wego";

pub const MAX_RESOURCE_NAME_LENGTH: usize = 63;

pub const API_VERSION: &str = "wego.weave.works/v1alpha1";
pub const APPLICATION_KIND: &str = "Application";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Git,
    Helm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutomationType {
    Kustomize,
    Helm,
}

/// Where the generated manifests live. Chosen at construction; there is no
/// string sentinel anywhere past the CLI boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigMode {
    /// Manifests are applied to the cluster only and never persisted to git.
    InCluster,
    /// Manifests are committed to the workload's own repository.
    InSourceRepo,
    /// Manifests are committed to a separate configuration repository.
    InExternalRepo(RepoUrl),
}

/// A user's intent to manage one workload via GitOps. Immutable once
/// constructed; `Add` creates it, `Remove` destroys it.
#[derive(Debug, Clone, PartialEq)]
pub struct Application {
    name: String,
    namespace: String,
    source_type: SourceType,
    automation_type: AutomationType,
    git_source: Option<RepoUrl>,
    helm_source: Option<String>,
    config: ConfigMode,
    branch: String,
    path: String,
    helm_target_namespace: Option<String>,
}

impl Application {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        source_type: SourceType,
        automation_type: AutomationType,
        git_source: Option<RepoUrl>,
        helm_source: Option<String>,
        config: ConfigMode,
        branch: impl Into<String>,
        path: impl Into<String>,
        helm_target_namespace: Option<String>,
    ) -> Result<Self> {
        let name = name.into();
        validate_resource_name(&name)?;

        if name.starts_with(RESERVED_PREFIX) {
            return Err(Error::validation(format!(
                "application name {name:?} may not start with the reserved prefix {RESERVED_PREFIX:?}"
            )));
        }

        if source_type == SourceType::Helm {
            if automation_type != AutomationType::Helm {
                return Err(Error::validation(
                    "helm repository sources can only use helm automation",
                ));
            }

            if helm_source.as_deref().unwrap_or("").is_empty() {
                return Err(Error::validation(
                    "a url must be specified for helm repository sources",
                ));
            }
        } else if git_source.is_none() {
            return Err(Error::validation("a git source url is required"));
        }

        Ok(Self {
            name,
            namespace: namespace.into(),
            source_type,
            automation_type,
            git_source,
            helm_source,
            config,
            branch: branch.into(),
            path: path.into(),
            helm_target_namespace,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn automation_type(&self) -> AutomationType {
        self.automation_type
    }

    pub fn git_source(&self) -> Option<&RepoUrl> {
        self.git_source.as_ref()
    }

    pub fn helm_source(&self) -> Option<&str> {
        self.helm_source.as_deref()
    }

    pub fn config_mode(&self) -> &ConfigMode {
        &self.config
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn helm_target_namespace(&self) -> Option<&str> {
        self.helm_target_namespace.as_deref()
    }

    /// The URL recorded in the intent CR: the git source for git
    /// applications, the chart repository otherwise.
    pub fn source_url(&self) -> String {
        match self.source_type {
            SourceType::Git => self
                .git_source
                .as_ref()
                .map(|u| u.to_string())
                .unwrap_or_default(),
            SourceType::Helm => self.helm_source.clone().unwrap_or_default(),
        }
    }

    /// The repository manifests are written to, if any.
    pub fn config_repo(&self) -> Option<&RepoUrl> {
        match &self.config {
            ConfigMode::InCluster => None,
            ConfigMode::InSourceRepo => self.git_source.as_ref(),
            ConfigMode::InExternalRepo(url) => Some(url),
        }
    }

    /// Stable fingerprint used for idempotence checks and PR branch names.
    /// Depends only on source url, path-or-name and branch, never on the
    /// namespace.
    pub fn app_hash(&self) -> String {
        let digest = match (self.automation_type, self.source_type) {
            (AutomationType::Kustomize, _) => {
                md5::compute(format!("{}{}{}", self.source_url(), self.path, self.branch))
            }
            (AutomationType::Helm, SourceType::Git) | (AutomationType::Helm, SourceType::Helm) => {
                md5::compute(format!("{}{}{}", self.source_url(), self.name, self.branch))
            }
        };

        format!("wego-{digest:x}")
    }

    pub fn app_dir(&self) -> String {
        format!("{AUTOMATION_ROOT}/apps/{}", self.name)
    }

    pub fn app_yaml_path(&self) -> String {
        format!("{}/app.yaml", self.app_dir())
    }

    pub fn source_manifest_path(&self) -> String {
        format!("{}/{}-gitops-source.yaml", self.app_dir(), self.name)
    }

    pub fn deploy_manifest_path(&self) -> String {
        format!("{}/{}-gitops-deploy.yaml", self.app_dir(), self.name)
    }

    pub fn kustomization_path(&self) -> String {
        format!("{}/kustomization.yaml", self.app_dir())
    }

    /// Entry recorded for this application in the user aggregator.
    pub fn aggregator_entry(&self) -> String {
        format!("../../../apps/{}", self.name)
    }

    pub fn to_manifest(&self) -> ApplicationManifest {
        let mut labels = BTreeMap::new();
        labels.insert(APP_IDENTIFIER_LABEL.to_string(), self.app_hash());

        ApplicationManifest {
            api_version: API_VERSION.to_string(),
            kind: APPLICATION_KIND.to_string(),
            metadata: ApplicationMetadata {
                name: self.name.clone(),
                namespace: self.namespace.clone(),
                labels,
            },
            spec: ApplicationSpec {
                branch: self.branch.clone(),
                config_url: match &self.config {
                    // The `NONE` sentinel survives only on the wire, for
                    // compatibility with existing intent CRs.
                    ConfigMode::InCluster => "NONE".to_string(),
                    ConfigMode::InSourceRepo => String::new(),
                    ConfigMode::InExternalRepo(url) => url.to_string(),
                },
                deployment_type: self.automation_type,
                helm_target_namespace: self.helm_target_namespace.clone().unwrap_or_default(),
                path: self.path.clone(),
                source_type: self.source_type,
                url: self.source_url(),
            },
        }
    }

    pub fn from_manifest(manifest: &ApplicationManifest) -> Result<Self> {
        let spec = &manifest.spec;

        let (git_source, helm_source) = match spec.source_type {
            SourceType::Git => (Some(RepoUrl::parse(&spec.url)?), None),
            SourceType::Helm => (None, Some(spec.url.clone())),
        };

        let config = match spec.config_url.to_uppercase().as_str() {
            "NONE" => ConfigMode::InCluster,
            "" => ConfigMode::InSourceRepo,
            _ => {
                if Some(&spec.config_url) == git_source.as_ref().map(|u| u.to_string()).as_ref() {
                    ConfigMode::InSourceRepo
                } else {
                    ConfigMode::InExternalRepo(RepoUrl::parse(&spec.config_url)?)
                }
            }
        };

        Ok(Self {
            name: manifest.metadata.name.clone(),
            namespace: manifest.metadata.namespace.clone(),
            source_type: spec.source_type,
            automation_type: spec.deployment_type,
            git_source,
            helm_source,
            config,
            branch: spec.branch.clone(),
            path: spec.path.clone(),
            helm_target_namespace: if spec.helm_target_namespace.is_empty() {
                None
            } else {
                Some(spec.helm_target_namespace.clone())
            },
        })
    }
}

impl fmt::Display for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Serialized form of the Application CR.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ApplicationMetadata,
    pub spec: ApplicationSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationMetadata {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSpec {
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub config_url: String,
    pub deployment_type: AutomationType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub helm_target_namespace: String,
    #[serde(default)]
    pub path: String,
    pub source_type: SourceType,
    pub url: String,
}

impl ApplicationManifest {
    pub fn app_hash_label(&self) -> Option<&str> {
        self.metadata.labels.get(APP_IDENTIFIER_LABEL).map(|s| s.as_str())
    }
}

/// The canonical name sanitizer: underscores become hyphens, and anything
/// longer than the DNS-1123 ceiling is replaced wholesale with a hash.
pub fn sanitize_resource_name(name: &str) -> String {
    hash_if_too_long(&name.replace('_', "-"))
}

pub fn hash_if_too_long(name: &str) -> String {
    if name.len() <= MAX_RESOURCE_NAME_LENGTH {
        return name.to_string();
    }

    format!("wego-{:x}", md5::compute(name))
}

/// Name of the Secret holding the deploy key for a repository.
pub fn deploy_key_secret_name(repo: &RepoUrl) -> String {
    hash_if_too_long(&format!(
        "wego-{}-{}",
        repo.provider().as_str(),
        repo.name().replace('_', "-")
    ))
}

pub fn validate_resource_name(name: &str) -> Result<()> {
    if name.len() > MAX_RESOURCE_NAME_LENGTH {
        return Err(Error::validation(format!(
            "name {name:?} exceeds {MAX_RESOURCE_NAME_LENGTH} characters"
        )));
    }

    // DNS-1123 label.
    let pattern = Regex::new("^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex");
    if !pattern.is_match(name) {
        return Err(Error::validation(format!(
            "name {name:?} is not a valid DNS-1123 label"
        )));
    }

    Ok(())
}
