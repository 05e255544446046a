use std::collections::HashMap;
use std::fmt;

use url::Url;

use crate::error::{Error, Result};

/// Hosted git service a repository lives on. Secret names and token lookup
/// key off this, so custom hosts must resolve to one of the known drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Github,
    Gitlab,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Github => "github",
            Provider::Gitlab => "gitlab",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "github" => Ok(Provider::Github),
            "gitlab" => Ok(Provider::Gitlab),
            other => Err(Error::validation(format!("unknown git provider {other:?}"))),
        }
    }
}

/// Host-to-provider lookup. Defaults cover the hosted services; self-hosted
/// domains are added via `--provider-host`, and `force` pins every host to
/// one provider (the `GIT_PROVIDER` escape hatch).
#[derive(Debug, Clone)]
pub struct ProviderTable {
    hosts: HashMap<String, Provider>,
    forced: Option<Provider>,
}

impl Default for ProviderTable {
    fn default() -> Self {
        let mut hosts = HashMap::new();
        hosts.insert("github.com".to_string(), Provider::Github);
        hosts.insert("gitlab.com".to_string(), Provider::Gitlab);
        Self { hosts, forced: None }
    }
}

impl ProviderTable {
    pub fn insert(&mut self, host: impl Into<String>, provider: Provider) {
        self.hosts.insert(host.into(), provider);
    }

    pub fn force(&mut self, provider: Provider) {
        self.forced = Some(provider);
    }

    fn lookup(&self, host: &str) -> Option<Provider> {
        self.forced.or_else(|| self.hosts.get(host).copied())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Ssh,
    Https,
}

/// Canonical form of a repository URL. The git-clone shape
/// (`git@host:owner/name.git`), plain ssh URLs and https URLs all converge
/// on `ssh://git@host/owner/name.git`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoUrl {
    normalized: String,
    host: String,
    owner: String,
    name: String,
    provider: Provider,
    protocol: Protocol,
}

impl RepoUrl {
    pub fn parse(input: &str) -> Result<Self> {
        Self::parse_with(input, &ProviderTable::default())
    }

    pub fn parse_with(input: &str, table: &ProviderTable) -> Result<Self> {
        let protocol = if input.starts_with("https://") {
            Protocol::Https
        } else {
            Protocol::Ssh
        };

        let normalized = normalize(input)?;
        let parsed = Url::parse(&normalized)
            .map_err(|e| Error::validation(format!("could not parse {input:?}")).with_source(e))?;

        let host = parsed
            .host_str()
            .ok_or_else(|| Error::validation(format!("no host in url {input:?}")))?
            .to_string();

        let provider = table
            .lookup(&host)
            .ok_or_else(|| Error::validation(format!("no git provider found for {input:?}")))?;

        let (owner, name) = split_owner(parsed.path(), provider)?;

        Ok(Self {
            normalized,
            host,
            owner,
            name,
            provider,
            protocol,
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Repository name without the `.git` suffix.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

impl fmt::Display for RepoUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized)
    }
}

/// Rewrites the scp-style `git@host:owner/name` shape into a parseable ssh
/// URL. The first `:` is the host/path delimiter.
fn rewrite_scp(raw: &str) -> String {
    if let Some(rest) = raw.strip_prefix("git@") {
        format!("ssh://git@{}", rest.replacen(':', "/", 1))
    } else {
        raw.to_string()
    }
}

fn normalize(input: &str) -> Result<String> {
    // A trailing slash would leak into secret names downstream.
    let mut cleaned = input.trim_end_matches('/').to_string();

    if !cleaned.ends_with(".git") {
        cleaned.push_str(".git");
    }

    let parsed = Url::parse(&rewrite_scp(&cleaned))
        .map_err(|e| Error::validation(format!("could not parse git url {input:?}")).with_source(e))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| Error::validation(format!("no host in url {input:?}")))?;

    Ok(format!("ssh://git@{}{}", host, parsed.path()))
}

fn split_owner(path: &str, provider: Provider) -> Result<(String, String)> {
    let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();

    if parts.len() < 2 {
        return Err(Error::validation(format!("could not get owner from path {path:?}")));
    }

    let name = parts
        .last()
        .map(|n| n.trim_end_matches(".git").to_string())
        .unwrap_or_default();

    let owner = if provider == Provider::Gitlab {
        if parts.len() > 3 {
            return Err(Error::validation(
                "a subgroup in a subgroup is not currently supported",
            ));
        }

        if parts.len() > 2 {
            format!("{}/{}", parts[0], parts[1])
        } else {
            parts[0].to_string()
        }
    } else {
        parts[0].to_string()
    };

    Ok((owner, name))
}
