//! Error taxonomy shared by the indexing pipeline and the retrieval service.
//!
//! Every [`Error`] maps to one [`ErrorKind`]:
//!
//! - **InvalidInput**: malformed request fields or configuration
//! - **UpstreamUnavailable**: scraper target, embedding provider or database failing
//! - **NotReady**: no index generation has been deployed yet
//! - **ConsistencyViolation**: data that does not line up (embedding counts, missing
//!   embeddings, dimension or model drift, out-of-order lifecycle calls)
//! - **Internal**: background task failures
//!
//! Build failures are reported as [`BuildError`], which adds the failing
//! [`BuildStage`] and how many items the stage completed before it failed.

use docrag_embed::EmbedError;
use serde::Serialize;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by callers to decide how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    UpstreamUnavailable,
    NotReady,
    ConsistencyViolation,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidInput => "invalid_input",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::NotReady => "not_ready",
            Self::ConsistencyViolation => "consistency_violation",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// External collaborators whose failures surface as upstream errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Upstream {
    Scraper,
    Embedding,
    Database,
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Scraper => "scraper",
            Self::Embedding => "embedding provider",
            Self::Database => "database",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("{service} unavailable: {source}")]
    Upstream {
        service: Upstream,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("index not ready: {message}")]
    NotReady { message: String },

    #[error("consistency violation: {message}")]
    Consistency { message: String },

    #[error("{missing} of {total} chunks have no embedding")]
    MissingEmbedding { missing: usize, total: usize },

    #[error("cannot {operation} while the build is {state}")]
    InvalidTransition {
        operation: &'static str,
        state: String,
    },

    #[error("stopped after {completed} of {total}: {source}")]
    Interrupted {
        completed: usize,
        total: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("background task failed: {source}")]
    Internal {
        #[from]
        source: tokio::task::JoinError,
    },
}

impl Error {
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn not_ready<S: Into<String>>(message: S) -> Self {
        Self::NotReady {
            message: message.into(),
        }
    }

    pub fn consistency<S: Into<String>>(message: S) -> Self {
        Self::Consistency {
            message: message.into(),
        }
    }

    pub fn upstream<E>(service: Upstream, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Upstream {
            service,
            source: Box::new(source),
        }
    }

    /// Wraps an error with the progress made before it happened.
    pub fn interrupted(completed: usize, total: usize, source: Error) -> Self {
        Self::Interrupted {
            completed,
            total,
            source: Box::new(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput { .. } | Self::InvalidConfig { .. } => ErrorKind::InvalidInput,
            Self::Upstream { .. } => ErrorKind::UpstreamUnavailable,
            Self::NotReady { .. } => ErrorKind::NotReady,
            Self::Consistency { .. }
            | Self::MissingEmbedding { .. }
            | Self::InvalidTransition { .. } => ErrorKind::ConsistencyViolation,
            Self::Interrupted { source, .. } => source.kind(),
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Progress recorded by [`Error::Interrupted`], if any.
    pub fn progress(&self) -> Option<(usize, usize)> {
        match self {
            Self::Interrupted {
                completed, total, ..
            } => Some((*completed, *total)),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::upstream(Upstream::Database, source)
    }
}

impl From<EmbedError> for Error {
    fn from(source: EmbedError) -> Self {
        match source {
            EmbedError::InvalidConfig { message } => Self::InvalidConfig { message },
            mismatch if mismatch.is_mismatch() => Self::consistency(mismatch.to_string()),
            other => Self::upstream(Upstream::Embedding, other),
        }
    }
}

/// Stages of one index build, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    Prepare,
    Scrape,
    Embed,
    Populate,
    Index,
    Deploy,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Prepare => "prepare",
            Self::Scrape => "scrape",
            Self::Embed => "embed",
            Self::Populate => "populate",
            Self::Index => "index",
            Self::Deploy => "deploy",
        };
        f.write_str(name)
    }
}

/// A failed build: which stage stopped it and how far that stage got.
#[derive(Debug, thiserror::Error)]
pub struct BuildError {
    pub stage: BuildStage,
    pub completed: Option<usize>,
    pub total: Option<usize>,
    #[source]
    pub source: Error,
}

impl BuildError {
    pub fn new(stage: BuildStage, source: Error) -> Self {
        let (completed, total) = match source.progress() {
            Some((completed, total)) => (Some(completed), Some(total)),
            None => (None, None),
        };
        Self {
            stage,
            completed,
            total,
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "build failed during {}", self.stage)?;
        if let (Some(completed), Some(total)) = (self.completed, self.total) {
            write!(f, " ({completed} of {total} items succeeded)")?;
        }
        write!(f, ": {}", self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(Error::invalid_input("x").kind(), ErrorKind::InvalidInput);
        assert_eq!(Error::not_ready("x").kind(), ErrorKind::NotReady);
        assert_eq!(
            Error::MissingEmbedding {
                missing: 1,
                total: 2
            }
            .kind(),
            ErrorKind::ConsistencyViolation
        );
        let db: Error = sqlx::Error::PoolTimedOut.into();
        assert_eq!(db.kind(), ErrorKind::UpstreamUnavailable);
    }

    #[test]
    fn test_embed_error_mapping() {
        let mismatch: Error = EmbedError::ResponseMismatch {
            expected: 4,
            actual: 3,
        }
        .into();
        assert_eq!(mismatch.kind(), ErrorKind::ConsistencyViolation);

        let outage: Error = EmbedError::provider(503, "overloaded").into();
        assert_eq!(outage.kind(), ErrorKind::UpstreamUnavailable);
        assert!(outage.to_string().starts_with("embedding provider unavailable"));

        let config: Error = EmbedError::invalid_config("missing token").into();
        assert_eq!(config.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_interrupted_keeps_source_kind() {
        let err = Error::interrupted(200, 450, EmbedError::provider(500, "boom").into());
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
        assert_eq!(err.progress(), Some((200, 450)));
    }

    #[test]
    fn test_build_error_display() {
        let err = BuildError::new(
            BuildStage::Populate,
            Error::interrupted(1000, 2500, sqlx::Error::PoolTimedOut.into()),
        );
        assert_eq!(err.stage, BuildStage::Populate);
        assert_eq!(err.completed, Some(1000));
        let message = err.to_string();
        assert!(message.starts_with("build failed during populate (1000 of 2500 items succeeded)"));

        let err = BuildError::new(BuildStage::Deploy, Error::consistency("no staging table"));
        assert_eq!(
            err.to_string(),
            "build failed during deploy: consistency violation: no staging table"
        );
    }
}
