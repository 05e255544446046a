use std::fmt;

/// Classification of a pipeline failure. The CLI maps `Validation` to exit
/// code 2 and everything else to 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, rejected before any side effect.
    Validation,
    /// A probe failed before any write happened.
    Precondition,
    /// A git host, git transport or cluster call failed.
    Network,
    /// A bounded poll ran out of time.
    Timeout,
}

/// Error carried through the pipeline. Each boundary an error crosses adds a
/// breadcrumb, so a failure deep in deploy-key upload renders as
/// `add: setup-deploy-key: upload-deploy-key: <message>`.
pub struct Error {
    kind: ErrorKind,
    message: String,
    breadcrumbs: Vec<&'static str>,
    source: Option<anyhow::Error>,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            breadcrumbs: Vec::new(),
            source: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Precondition, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn breadcrumbs(&self) -> &[&'static str] {
        &self.breadcrumbs
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for op in &self.breadcrumbs {
            write!(f, "{op}: ")?;
        }
        write!(f, "{}", self.message)?;
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {self}", self.kind)
    }
}

impl std::error::Error for Error {}

/// Appends an operation breadcrumb to a failing result.
pub trait OpContext<T> {
    fn op(self, name: &'static str) -> Result<T>;
}

impl<T, E: Into<Error>> OpContext<T> for std::result::Result<T, E> {
    fn op(self, name: &'static str) -> Result<T> {
        self.map_err(|e| {
            let mut err = e.into();
            err.breadcrumbs.insert(0, name);
            err
        })
    }
}

impl From<octocrab::Error> for Error {
    fn from(e: octocrab::Error) -> Self {
        Error::network("git provider request failed").with_source(e)
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::network("cluster request failed").with_source(e)
    }
}

impl From<git2::Error> for Error {
    fn from(e: git2::Error) -> Self {
        Error::network("git operation failed").with_source(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::network("i/o failure").with_source(e)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::validation("invalid yaml document").with_source(e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::validation("invalid url").with_source(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::network("http request failed").with_source(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breadcrumbs_render_outermost_first() {
        let err: Error = Err::<(), _>(Error::network("connection refused"))
            .op("upload-deploy-key")
            .and_then(|_| Ok(()))
            .op("setup-deploy-key")
            .op("add")
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "add: setup-deploy-key: upload-deploy-key: connection refused"
        );
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[test]
    fn source_is_appended_to_display() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = Error::network("failed writing manifest").with_source(inner);
        assert_eq!(err.to_string(), "failed writing manifest: disk full");
    }

    #[test]
    fn validation_kind_is_preserved_through_ops() {
        let err: Error = Err::<(), _>(Error::validation("bad name")).op("add").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
