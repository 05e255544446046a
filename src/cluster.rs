use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::{
    api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams},
    config::Kubeconfig,
    Client,
};
use serde_json::{json, Value};

use crate::app::{sanitize_resource_name, ApplicationManifest};
use crate::error::{Error, Result};

/// Namespace the runtime controllers and the intent CRs live in.
pub const INSTALL_NAMESPACE: &str = "wego-system";

/// Field manager recorded on server-side applies.
const FIELD_MANAGER: &str = "gitopsctl";

/// The resource kinds this tool reads or writes. Each maps to an exact
/// group/version/plural; nothing is guessed from the kind string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Application,
    GitRepository,
    HelmRepository,
    Kustomization,
    HelmRelease,
    Secret,
    ConfigMap,
    Namespace,
    ServiceAccount,
    ClusterRole,
    ClusterRoleBinding,
    Role,
    RoleBinding,
    Deployment,
    Service,
    CustomResourceDefinition,
}

impl ResourceKind {
    fn lookup(api_version: &str, kind: &str) -> Option<Self> {
        let found = match (api_version, kind) {
            ("wego.weave.works/v1alpha1", "Application") => Self::Application,
            ("source.toolkit.fluxcd.io/v1beta1", "GitRepository") => Self::GitRepository,
            ("source.toolkit.fluxcd.io/v1beta1", "HelmRepository") => Self::HelmRepository,
            ("kustomize.toolkit.fluxcd.io/v1beta1", "Kustomization") => Self::Kustomization,
            ("helm.toolkit.fluxcd.io/v2beta1", "HelmRelease") => Self::HelmRelease,
            ("v1", "Secret") => Self::Secret,
            ("v1", "ConfigMap") => Self::ConfigMap,
            ("v1", "Namespace") => Self::Namespace,
            ("v1", "ServiceAccount") => Self::ServiceAccount,
            ("v1", "Service") => Self::Service,
            ("rbac.authorization.k8s.io/v1", "ClusterRole") => Self::ClusterRole,
            ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding") => Self::ClusterRoleBinding,
            ("rbac.authorization.k8s.io/v1", "Role") => Self::Role,
            ("rbac.authorization.k8s.io/v1", "RoleBinding") => Self::RoleBinding,
            ("apps/v1", "Deployment") => Self::Deployment,
            ("apiextensions.k8s.io/v1", "CustomResourceDefinition") => {
                Self::CustomResourceDefinition
            }
            _ => return None,
        };

        Some(found)
    }

    /// The kind string, for messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Application => "Application",
            Self::GitRepository => "GitRepository",
            Self::HelmRepository => "HelmRepository",
            Self::Kustomization => "Kustomization",
            Self::HelmRelease => "HelmRelease",
            Self::Secret => "Secret",
            Self::ConfigMap => "ConfigMap",
            Self::Namespace => "Namespace",
            Self::ServiceAccount => "ServiceAccount",
            Self::ClusterRole => "ClusterRole",
            Self::ClusterRoleBinding => "ClusterRoleBinding",
            Self::Role => "Role",
            Self::RoleBinding => "RoleBinding",
            Self::Deployment => "Deployment",
            Self::Service => "Service",
            Self::CustomResourceDefinition => "CustomResourceDefinition",
        }
    }

    fn cluster_scoped(&self) -> bool {
        matches!(
            self,
            Self::Namespace | Self::ClusterRole | Self::ClusterRoleBinding | Self::CustomResourceDefinition
        )
    }

    fn api_resource(&self) -> ApiResource {
        let (group, version, kind, plural) = match self {
            Self::Application => ("wego.weave.works", "v1alpha1", "Application", "apps"),
            Self::GitRepository => (
                "source.toolkit.fluxcd.io",
                "v1beta1",
                "GitRepository",
                "gitrepositories",
            ),
            Self::HelmRepository => (
                "source.toolkit.fluxcd.io",
                "v1beta1",
                "HelmRepository",
                "helmrepositories",
            ),
            Self::Kustomization => (
                "kustomize.toolkit.fluxcd.io",
                "v1beta1",
                "Kustomization",
                "kustomizations",
            ),
            Self::HelmRelease => ("helm.toolkit.fluxcd.io", "v2beta1", "HelmRelease", "helmreleases"),
            Self::Secret => ("", "v1", "Secret", "secrets"),
            Self::ConfigMap => ("", "v1", "ConfigMap", "configmaps"),
            Self::Namespace => ("", "v1", "Namespace", "namespaces"),
            Self::ServiceAccount => ("", "v1", "ServiceAccount", "serviceaccounts"),
            Self::Service => ("", "v1", "Service", "services"),
            Self::ClusterRole => ("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles"),
            Self::ClusterRoleBinding => (
                "rbac.authorization.k8s.io",
                "v1",
                "ClusterRoleBinding",
                "clusterrolebindings",
            ),
            Self::Role => ("rbac.authorization.k8s.io", "v1", "Role", "roles"),
            Self::RoleBinding => ("rbac.authorization.k8s.io", "v1", "RoleBinding", "rolebindings"),
            Self::Deployment => ("apps", "v1", "Deployment", "deployments"),
            Self::CustomResourceDefinition => (
                "apiextensions.k8s.io",
                "v1",
                "CustomResourceDefinition",
                "customresourcedefinitions",
            ),
        };

        ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            api_version: if group.is_empty() {
                version.to_string()
            } else {
                format!("{group}/{version}")
            },
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }
}

/// Operations against the target cluster. `KubeCluster` is the live
/// implementation; tests use in-memory fakes.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Name of the cluster the kubeconfig currently points at, sanitized
    /// into a DNS-1123 label.
    async fn cluster_name(&self) -> Result<String>;

    /// Whether the runtime controllers are installed and serving.
    async fn is_ready(&self) -> Result<bool>;

    /// Applies a multi-document YAML stream with server-side apply.
    /// Documents without their own namespace land in `namespace`.
    async fn apply(&self, manifests: &str, namespace: &str) -> Result<()>;

    async fn get_application(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ApplicationManifest>>;

    async fn list_applications(&self, namespace: &str) -> Result<Vec<ApplicationManifest>>;

    /// Deletes the intent CR. Deleting an absent CR is not an error.
    async fn delete_application(&self, namespace: &str, name: &str) -> Result<()>;

    async fn namespace_exists(&self, name: &str) -> Result<bool>;

    /// Deletes one resource by kind and name. Absent is not an error.
    async fn delete_resource(&self, kind: ResourceKind, namespace: &str, name: &str)
        -> Result<()>;

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool>;

    /// One decoded value out of a Secret, or None when the secret or the
    /// key is absent.
    async fn get_secret_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>>;

    /// Merge-patches one metadata annotation onto a resource.
    async fn annotate(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()>;

    /// The raw object, for status inspection. None when absent.
    async fn get_raw(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>>;
}

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::network("could not connect to the cluster").with_source(e))?;

        Ok(Self { client })
    }

    fn dynamic_api(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        let ar = kind.api_resource();

        if kind.cluster_scoped() {
            Api::all_with(self.client.clone(), &ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        }
    }

    async fn deployment_ready(&self, name: &str) -> Result<bool> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), INSTALL_NAMESPACE);

        let ready = match api.get_opt(name).await? {
            Some(deployment) => deployment
                .status
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0)
                > 0,
            None => false,
        };

        Ok(ready)
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn cluster_name(&self) -> Result<String> {
        let kubeconfig = Kubeconfig::read()
            .map_err(|e| Error::network("could not read kubeconfig").with_source(e))?;

        let context = kubeconfig
            .current_context
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::precondition("kubeconfig has no current context"))?;

        Ok(sanitize_resource_name(&context))
    }

    async fn is_ready(&self) -> Result<bool> {
        for controller in ["source-controller", "kustomize-controller", "helm-controller"] {
            if !self.deployment_ready(controller).await? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn apply(&self, manifests: &str, namespace: &str) -> Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();

        for (position, (kind, name, object)) in parse_objects(manifests)?.into_iter().enumerate() {
            let target_namespace = object
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| namespace.to_string());

            self.dynamic_api(kind, &target_namespace)
                .patch(&name, &params, &Patch::Apply(&object))
                .await
                .map_err(|e| {
                    Error::network(format!(
                        "apply of document {} ({} {name}) failed",
                        position + 1,
                        kind.kind_name()
                    ))
                    .with_source(e)
                })?;
        }

        Ok(())
    }

    async fn get_application(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ApplicationManifest>> {
        let api = self.dynamic_api(ResourceKind::Application, namespace);

        match api.get_opt(name).await? {
            Some(object) => Ok(Some(manifest_from_object(&object)?)),
            None => Ok(None),
        }
    }

    async fn list_applications(&self, namespace: &str) -> Result<Vec<ApplicationManifest>> {
        let api = self.dynamic_api(ResourceKind::Application, namespace);
        let objects = api.list(&ListParams::default()).await?;

        objects.items.iter().map(manifest_from_object).collect()
    }

    async fn delete_application(&self, namespace: &str, name: &str) -> Result<()> {
        let api = self.dynamic_api(ResourceKind::Application, namespace);

        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn delete_resource(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let api = self.dynamic_api(kind, namespace);

        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn get_secret_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        let Some(secret) = api.get_opt(name).await? else {
            return Ok(None);
        };

        let Some(bytes) = secret.data.and_then(|mut data| data.remove(key)) else {
            return Ok(None);
        };

        let value = String::from_utf8(bytes.0).map_err(|e| {
            Error::validation(format!("secret {namespace}/{name} key {key} is not utf-8"))
                .with_source(e)
        })?;

        Ok(Some(value))
    }

    async fn annotate(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let patch = json!({ "metadata": { "annotations": { key: value } } });

        self.dynamic_api(kind, namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }

    async fn get_raw(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>> {
        let api = self.dynamic_api(kind, namespace);

        match api.get_opt(name).await? {
            Some(object) => {
                let raw = serde_json::to_value(&object).map_err(|e| {
                    Error::network(format!("could not decode {name}")).with_source(e)
                })?;
                Ok(Some(raw))
            }
            None => Ok(None),
        }
    }
}

fn manifest_from_object(object: &DynamicObject) -> Result<ApplicationManifest> {
    let raw = serde_json::to_value(object)
        .map_err(|e| Error::network("could not decode application").with_source(e))?;

    serde_json::from_value(raw)
        .map_err(|e| Error::validation("malformed application resource").with_source(e))
}

/// Splits a YAML stream on document markers, dropping empty documents.
pub fn split_documents(manifests: &str) -> Vec<&str> {
    manifests
        .split("\n---\n")
        .map(|doc| doc.trim_start_matches("---\n"))
        .filter(|doc| !doc.trim().is_empty())
        .collect()
}

/// Parses a YAML stream into typed objects, rejecting the whole stream on
/// the first bad document. Errors name the document's position so a
/// multi-file bundle points back at its source.
fn parse_objects(manifests: &str) -> Result<Vec<(ResourceKind, String, DynamicObject)>> {
    let mut objects = Vec::new();

    for (position, doc) in split_documents(manifests).into_iter().enumerate() {
        let position = position + 1;

        let object: DynamicObject = serde_yaml::from_str(doc).map_err(|e| {
            Error::validation(format!("document {position} is not a valid manifest"))
                .with_source(e)
        })?;

        let api_version = object
            .types
            .as_ref()
            .map(|t| t.api_version.clone())
            .unwrap_or_default();
        let kind_name = object
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_default();

        let kind = ResourceKind::lookup(&api_version, &kind_name).ok_or_else(|| {
            Error::validation(format!(
                "document {position}: unsupported resource {api_version}/{kind_name}"
            ))
        })?;

        let name = object.metadata.name.clone().ok_or_else(|| {
            Error::validation(format!("document {position} ({kind_name}) has no name"))
        })?;

        objects.push((kind, name, object));
    }

    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_documents_are_reported_by_position() {
        let manifests = "---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: ok\n---\napiVersion: example.com/v1\nkind: Widget\nmetadata:\n  name: bad\n";
        let err = parse_objects(manifests).unwrap_err();
        assert!(err.to_string().contains("document 2"));
        assert!(err.to_string().contains("example.com/v1/Widget"));

        let nameless = "---\napiVersion: v1\nkind: ConfigMap\nmetadata: {}\n";
        let err = parse_objects(nameless).unwrap_err();
        assert!(err.to_string().contains("document 1"));
        assert!(err.to_string().contains("has no name"));
    }

    #[test]
    fn kind_lookup_uses_exact_plurals() {
        let ar = ResourceKind::GitRepository.api_resource();
        assert_eq!(ar.plural, "gitrepositories");
        assert_eq!(ar.api_version, "source.toolkit.fluxcd.io/v1beta1");

        let ar = ResourceKind::Application.api_resource();
        assert_eq!(ar.plural, "apps");
        assert_eq!(ar.api_version, "wego.weave.works/v1alpha1");

        let ar = ResourceKind::Secret.api_resource();
        assert_eq!(ar.api_version, "v1");
    }

    #[test]
    fn unknown_kinds_are_rejected_not_guessed() {
        assert!(ResourceKind::lookup("source.toolkit.fluxcd.io/v1beta1", "GitRepository").is_some());
        assert!(ResourceKind::lookup("example.com/v1", "Widget").is_none());
        assert!(ResourceKind::lookup("v1", "GitRepository").is_none());
    }

    #[test]
    fn cluster_scope_covers_non_namespaced_kinds() {
        assert!(ResourceKind::Namespace.cluster_scoped());
        assert!(ResourceKind::CustomResourceDefinition.cluster_scoped());
        assert!(!ResourceKind::Kustomization.cluster_scoped());
    }

    #[test]
    fn document_splitting_handles_leading_markers_and_blanks() {
        let stream = "---\nkind: A\n---\nkind: B\n---\n\n---\nkind: C\n";
        let docs = split_documents(stream);
        assert_eq!(docs, vec!["kind: A", "kind: B", "kind: C\n"]);
    }
}
