use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use log::debug;

use crate::app::Application;
use crate::cluster::ResourceKind;
use crate::error::{Error, OpContext, Result};
use crate::manifests::{deploy_kind, source_kind};
use crate::ops::Deps;

pub const RECONCILE_ANNOTATION: &str = "reconcile.fluxcd.io/requestedAt";

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Forces a reconciliation of an application's source and deployment CRs
/// and waits for the reconciler to acknowledge it.
pub async fn sync(deps: &Deps<'_>, namespace: &str, name: &str) -> Result<()> {
    sync_with(deps, namespace, name, POLL_INTERVAL, POLL_TIMEOUT)
        .await
        .op("sync")
}

pub(crate) async fn sync_with(
    deps: &Deps<'_>,
    namespace: &str,
    name: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let manifest = deps
        .cluster
        .get_application(namespace, name)
        .await
        .op("get-application")?
        .ok_or_else(|| {
            Error::precondition(format!(
                "application {name} not found in namespace {namespace}"
            ))
        })?;
    let app = Application::from_manifest(&manifest)?;

    let targets = [source_kind(&app), deploy_kind(&app)];

    let mut before = Vec::with_capacity(targets.len());
    for kind in targets {
        before.push(last_handled(deps, kind, namespace, name).await?);
    }

    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
    for kind in targets {
        deps.cluster
            .annotate(kind, namespace, name, RECONCILE_ANNOTATION, &stamp)
            .await
            .op("request-reconcile")?;
    }

    let deadline = tokio::time::Instant::now() + timeout;
    let mut pending: Vec<(ResourceKind, String)> = targets
        .iter()
        .zip(before)
        .map(|(kind, seen)| (*kind, seen))
        .collect();

    loop {
        let mut remaining = Vec::new();
        for (kind, seen) in pending {
            let now = last_handled(deps, kind, namespace, name).await?;
            if now == seen {
                remaining.push((kind, seen));
            } else {
                debug!("{} {name} reconciled at {now}", kind.kind_name());
            }
        }

        if remaining.is_empty() {
            return Ok(());
        }

        if tokio::time::Instant::now() + interval > deadline {
            let (kind, _) = &remaining[0];
            return Err(Error::timeout(format!(
                "timed out waiting for {} {name} to reconcile",
                kind.kind_name()
            )));
        }

        tokio::time::sleep(interval).await;
        pending = remaining;
    }
}

async fn last_handled(
    deps: &Deps<'_>,
    kind: ResourceKind,
    namespace: &str,
    name: &str,
) -> Result<String> {
    let raw = deps.cluster.get_raw(kind, namespace, name).await?;

    Ok(raw
        .as_ref()
        .and_then(|v| v["status"]["lastHandledReconcileRequest"].as_str())
        .unwrap_or_default()
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AutomationType, ConfigMode, SourceType};
    use crate::error::ErrorKind;
    use crate::ops::testutil::{FakeCluster, FakeProvider};
    use crate::repo_url::RepoUrl;

    fn cluster_with_app(reconcile_on_touch: bool) -> FakeCluster {
        let app = Application::new(
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
        .unwrap();

        let cluster = FakeCluster {
            reconcile_on_touch,
            ..Default::default()
        };
        cluster.applications.lock().unwrap().insert(
            ("wego-system".to_string(), "myapp".to_string()),
            app.to_manifest(),
        );
        cluster
    }

    #[tokio::test]
    async fn sync_touches_both_crs_once_and_returns_on_acknowledgement() {
        let provider = FakeProvider::default();
        let cluster = cluster_with_app(true);
        let deps = Deps {
            provider: &provider,
            cluster: &cluster,
        };

        sync_with(
            &deps,
            "wego-system",
            "myapp",
            Duration::from_millis(5),
            Duration::from_millis(500),
        )
        .await
        .unwrap();

        let annotations = cluster.annotations.lock().unwrap();
        assert_eq!(annotations.len(), 2);

        let kinds: Vec<ResourceKind> = annotations.iter().map(|(kind, ..)| *kind).collect();
        assert_eq!(
            kinds,
            vec![ResourceKind::GitRepository, ResourceKind::Kustomization]
        );

        for (_, _, _, key, value) in annotations.iter() {
            assert_eq!(key, RECONCILE_ANNOTATION);
            // RFC-3339 with nanosecond precision, UTC.
            assert!(value.ends_with('Z'));
            assert!(value.contains('.'));
        }
    }

    #[tokio::test]
    async fn unacknowledged_sync_times_out_naming_the_resource() {
        let provider = FakeProvider::default();
        let cluster = cluster_with_app(false);
        let deps = Deps {
            provider: &provider,
            cluster: &cluster,
        };

        let err = sync_with(
            &deps,
            "wego-system",
            "myapp",
            Duration::from_millis(5),
            Duration::from_millis(30),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("GitRepository"));
        assert!(err.to_string().contains("myapp"));
    }
}
