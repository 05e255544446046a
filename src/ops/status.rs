use serde_json::Value;

use crate::app::Application;
use crate::error::{Error, OpContext, Result};
use crate::manifests::deploy_kind;
use crate::ops::Deps;
use crate::provider::CommitInfo;

const COMMIT_PAGE_SIZE: u8 = 10;

/// What `gitopsctl status` reports: the last successful reconciliation (if
/// any) and the newest commits on a git source.
pub struct StatusReport {
    pub app: Application,
    pub last_successful_reconciliation: Option<String>,
    pub commits: Vec<CommitInfo>,
}

pub async fn status(deps: &Deps<'_>, namespace: &str, name: &str) -> Result<StatusReport> {
    run(deps, namespace, name).await.op("status")
}

async fn run(deps: &Deps<'_>, namespace: &str, name: &str) -> Result<StatusReport> {
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

    let raw = deps
        .cluster
        .get_raw(deploy_kind(&app), namespace, name)
        .await
        .op("get-deployment")?;

    let last_successful_reconciliation = raw.as_ref().and_then(ready_transition_time);

    let commits = match app.git_source() {
        Some(repo) => deps
            .provider
            .commits(repo, app.branch(), COMMIT_PAGE_SIZE, 1)
            .await
            .op("list-commits")?,
        None => Vec::new(),
    };

    Ok(StatusReport {
        app,
        last_successful_reconciliation,
        commits,
    })
}

/// The transition time of the `Ready=True` condition, if present.
fn ready_transition_time(raw: &Value) -> Option<String> {
    raw["status"]["conditions"]
        .as_array()?
        .iter()
        .find(|c| c["type"].as_str() == Some("Ready") && c["status"].as_str() == Some("True"))
        .and_then(|c| c["lastTransitionTime"].as_str())
        .map(str::to_string)
}
