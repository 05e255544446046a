use clap::{Args, Parser, Subcommand};

/// GitOps onboarding for Kubernetes clusters
#[derive(Debug, Parser)]
#[clap(name = "gitopsctl", version)]
pub(crate) struct App {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub(crate) struct GlobalOpts {
    /// The kubernetes namespace the gitops runtime is installed in
    #[arg(long, default_value = "wego-system")]
    pub namespace: String,

    /// Print what would be done without writing to the cluster or any repository
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Extra hostname to treat as a github instance, repeatable
    #[arg(long = "github-host")]
    pub github_hosts: Vec<String>,

    /// Extra hostname to treat as a gitlab instance, repeatable
    #[arg(long = "gitlab-host")]
    pub gitlab_hosts: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Start managing an application with gitops automation
    Add(AddArgs),
    /// Stop managing an application and delete its manifests
    Remove(RemoveArgs),
    /// Show the reconciliation state and recent commits of an application
    Status(StatusArgs),
    /// Trigger an immediate reconciliation of an application
    Sync(SyncArgs),
    /// Install the gitops runtime and associate the cluster with a repository
    Install(InstallArgs),
    /// Install a profile from a catalog onto the cluster
    AddProfile(AddProfileArgs),
}

#[derive(Debug, Args)]
pub(crate) struct AddArgs {
    /// Name of the application, defaults to the repository or chart name
    #[arg(long)]
    pub name: Option<String>,

    /// Git repository url of the application source
    #[arg(long)]
    pub url: Option<String>,

    /// Name of a helm chart to deploy instead of a git source
    #[arg(long)]
    pub chart: Option<String>,

    /// Url of the helm repository serving --chart
    #[arg(long)]
    pub helm_repo_url: Option<String>,

    /// Path within the source repository holding the deployable manifests
    #[arg(long, default_value = "./")]
    pub path: String,

    /// Branch to track, defaults to the repository default branch
    #[arg(long)]
    pub branch: Option<String>,

    /// How the application is deployed: kustomize or helm
    #[arg(long)]
    pub deployment_type: Option<String>,

    /// Where automation manifests are stored: a repository url, or NONE to
    /// keep them in the cluster only. Defaults to the source repository.
    #[arg(long)]
    pub app_config_url: Option<String>,

    /// Namespace helm releases deploy their workload into
    #[arg(long)]
    pub helm_release_target_namespace: Option<String>,

    /// Push directly to the branch instead of opening a pull request
    #[arg(long, default_value_t = false)]
    pub auto_merge: bool,
}

#[derive(Debug, Args)]
pub(crate) struct RemoveArgs {
    /// Name of the application to remove
    pub name: String,

    /// Push directly to the branch instead of opening a pull request
    #[arg(long, default_value_t = false)]
    pub auto_merge: bool,
}

#[derive(Debug, Args)]
pub(crate) struct StatusArgs {
    /// Name of the application
    pub name: String,
}

#[derive(Debug, Args)]
pub(crate) struct SyncArgs {
    /// Name of the application
    pub name: String,
}

#[derive(Debug, Args)]
pub(crate) struct InstallArgs {
    /// Repository that records what is deployed to this cluster
    #[arg(long)]
    pub app_config_url: String,

    /// Push directly to the branch instead of opening a pull request
    #[arg(long, default_value_t = false)]
    pub auto_merge: bool,
}

#[derive(Debug, Args)]
pub(crate) struct AddProfileArgs {
    /// Name of the profile in the catalog
    pub name: String,

    /// Profile version to install, or latest
    #[arg(long, default_value = "latest")]
    pub version: String,

    /// Base url of the profile catalog
    #[arg(long)]
    pub catalog_url: String,

    /// Repository that records what is deployed to this cluster
    #[arg(long)]
    pub app_config_url: String,

    /// Merge the pull request as soon as it is opened
    #[arg(long, default_value_t = false)]
    pub auto_merge: bool,
}
