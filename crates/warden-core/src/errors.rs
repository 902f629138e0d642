use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Outcome classification surfaced to operation callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Ok,
    NotConnected,
    ConnectionLoss,
    Timeout,
    BadArguments,
    NodeNotFound,
    NodeAlreadyExists,
    NodeHasChildren,
    VersionsMismatch,
    ChildrenForEphemeralAreNotAllowed,
    SessionExpired,
    SessionMoved,
    NotReadonlyOperation,
    NoAuth,
    InvalidAcl,
    Died,
    UnknownError,
}

impl ResultCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NotConnected => "not_connected",
            Self::ConnectionLoss => "connection_loss",
            Self::Timeout => "timeout",
            Self::BadArguments => "bad_arguments",
            Self::NodeNotFound => "node_not_found",
            Self::NodeAlreadyExists => "node_already_exists",
            Self::NodeHasChildren => "node_has_children",
            Self::VersionsMismatch => "versions_mismatch",
            Self::ChildrenForEphemeralAreNotAllowed => "children_for_ephemeral_are_not_allowed",
            Self::SessionExpired => "session_expired",
            Self::SessionMoved => "session_moved",
            Self::NotReadonlyOperation => "not_readonly_operation",
            Self::NoAuth => "no_auth",
            Self::InvalidAcl => "invalid_acl",
            Self::Died => "died",
            Self::UnknownError => "unknown_error",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure raised by a session handle. Translated into [`OpError`] before it
/// reaches operation callers.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("connection loss")]
    ConnectionLoss,
    #[error("operation timed out")]
    OperationTimeout,
    #[error("bad arguments: {0}")]
    BadArguments(String),
    #[error("no node")]
    NoNode,
    #[error("node exists")]
    NodeExists,
    #[error("node not empty")]
    NotEmpty,
    #[error("bad version")]
    BadVersion,
    #[error("ephemeral nodes may not have children")]
    NoChildrenForEphemerals,
    #[error("session expired")]
    SessionExpired,
    #[error("session moved")]
    SessionMoved,
    #[error("not a read-only operation")]
    NotReadOnly,
    #[error("not authenticated")]
    NoAuth,
    #[error("invalid ACL")]
    InvalidAcl,
    #[error("session closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// Typed failure of a coordination operation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum OpError {
    #[error("no usable session within {0:?}")]
    NotConnected(Duration),
    #[error("connection lost")]
    ConnectionLoss,
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("bad arguments: {0}")]
    BadArguments(String),
    #[error("node not found: {path}")]
    NodeNotFound { path: String },
    #[error("node already exists: {path}")]
    NodeAlreadyExists { path: String },
    #[error("node has children: {path}")]
    NodeHasChildren { path: String },
    #[error("version mismatch: {path}")]
    VersionsMismatch { path: String },
    #[error("ephemeral node may not have children: {path}")]
    ChildrenForEphemeralAreNotAllowed { path: String },
    #[error("session expired")]
    SessionExpired,
    #[error("session moved")]
    SessionMoved,
    #[error("operation not allowed on a read-only connection")]
    NotReadonlyOperation,
    #[error("not authorized: {path}")]
    NoAuth { path: String },
    #[error("invalid ACL: {path}")]
    InvalidAcl { path: String },
    #[error("connection manager has shut down")]
    Died,
    #[error("unexpected failure on {path}: {source}")]
    UnknownError {
        path: String,
        #[source]
        source: SessionError,
    },
}

impl OpError {
    /// Translate a session handle failure for an operation on `path`.
    pub fn from_session(path: &str, err: SessionError) -> Self {
        let path = path.to_string();
        match err {
            SessionError::ConnectionLoss | SessionError::Closed => Self::ConnectionLoss,
            SessionError::OperationTimeout => Self::Timeout(Duration::ZERO),
            SessionError::BadArguments(msg) => Self::BadArguments(msg),
            SessionError::NoNode => Self::NodeNotFound { path },
            SessionError::NodeExists => Self::NodeAlreadyExists { path },
            SessionError::NotEmpty => Self::NodeHasChildren { path },
            SessionError::BadVersion => Self::VersionsMismatch { path },
            SessionError::NoChildrenForEphemerals => {
                Self::ChildrenForEphemeralAreNotAllowed { path }
            }
            SessionError::SessionExpired => Self::SessionExpired,
            SessionError::SessionMoved => Self::SessionMoved,
            SessionError::NotReadOnly => Self::NotReadonlyOperation,
            SessionError::NoAuth => Self::NoAuth { path },
            SessionError::InvalidAcl => Self::InvalidAcl { path },
            source @ SessionError::Other(_) => Self::UnknownError { path, source },
        }
    }

    pub fn code(&self) -> ResultCode {
        match self {
            Self::NotConnected(_) => ResultCode::NotConnected,
            Self::ConnectionLoss => ResultCode::ConnectionLoss,
            Self::Timeout(_) => ResultCode::Timeout,
            Self::BadArguments(_) => ResultCode::BadArguments,
            Self::NodeNotFound { .. } => ResultCode::NodeNotFound,
            Self::NodeAlreadyExists { .. } => ResultCode::NodeAlreadyExists,
            Self::NodeHasChildren { .. } => ResultCode::NodeHasChildren,
            Self::VersionsMismatch { .. } => ResultCode::VersionsMismatch,
            Self::ChildrenForEphemeralAreNotAllowed { .. } => {
                ResultCode::ChildrenForEphemeralAreNotAllowed
            }
            Self::SessionExpired => ResultCode::SessionExpired,
            Self::SessionMoved => ResultCode::SessionMoved,
            Self::NotReadonlyOperation => ResultCode::NotReadonlyOperation,
            Self::NoAuth { .. } => ResultCode::NoAuth,
            Self::InvalidAcl { .. } => ResultCode::InvalidAcl,
            Self::Died => ResultCode::Died,
            Self::UnknownError { .. } => ResultCode::UnknownError,
        }
    }

    /// Failures caused by session churn; the same call may succeed once a
    /// fresh session is available.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotConnected(_)
                | Self::ConnectionLoss
                | Self::Timeout(_)
                | Self::SessionExpired
                | Self::SessionMoved
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        self.code().as_str()
    }
}

/// Convenience for callers that branch on the code of a whole result.
pub fn result_code<T>(result: &Result<T, OpError>) -> ResultCode {
    match result {
        Ok(_) => ResultCode::Ok,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_errors_translate_to_codes() {
        let cases = [
            (SessionError::ConnectionLoss, ResultCode::ConnectionLoss),
            (SessionError::Closed, ResultCode::ConnectionLoss),
            (SessionError::OperationTimeout, ResultCode::Timeout),
            (SessionError::NoNode, ResultCode::NodeNotFound),
            (SessionError::NodeExists, ResultCode::NodeAlreadyExists),
            (SessionError::NotEmpty, ResultCode::NodeHasChildren),
            (SessionError::BadVersion, ResultCode::VersionsMismatch),
            (
                SessionError::NoChildrenForEphemerals,
                ResultCode::ChildrenForEphemeralAreNotAllowed,
            ),
            (SessionError::SessionExpired, ResultCode::SessionExpired),
            (SessionError::SessionMoved, ResultCode::SessionMoved),
            (SessionError::NotReadOnly, ResultCode::NotReadonlyOperation),
            (SessionError::NoAuth, ResultCode::NoAuth),
            (SessionError::InvalidAcl, ResultCode::InvalidAcl),
            (SessionError::Other("boom".into()), ResultCode::UnknownError),
        ];
        for (err, code) in cases {
            assert_eq!(OpError::from_session("/a", err).code(), code);
        }
    }

    #[test]
    fn unknown_error_keeps_original() {
        let err = OpError::from_session("/a/b", SessionError::Other("disk on fire".into()));
        match &err {
            OpError::UnknownError { path, source } => {
                assert_eq!(path, "/a/b");
                assert_eq!(source, &SessionError::Other("disk on fire".into()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(err.to_string().contains("disk on fire"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn path_is_carried_for_node_errors() {
        let err = OpError::from_session("/locks/x", SessionError::NoNode);
        assert_eq!(err.to_string(), "node not found: /locks/x");
    }

    #[test]
    fn retryable_classification() {
        assert!(OpError::ConnectionLoss.is_retryable());
        assert!(OpError::NotConnected(Duration::from_secs(1)).is_retryable());
        assert!(OpError::SessionExpired.is_retryable());
        assert!(!OpError::Died.is_retryable());
        assert!(!OpError::BadArguments("x".into()).is_retryable());
        assert!(!OpError::NodeNotFound { path: "/".into() }.is_retryable());
    }

    #[test]
    fn result_code_of_results() {
        let ok: Result<(), OpError> = Ok(());
        assert_eq!(result_code(&ok), ResultCode::Ok);
        let err: Result<(), OpError> = Err(OpError::Died);
        assert_eq!(result_code(&err), ResultCode::Died);
        assert_eq!(OpError::Died.error_kind(), "died");
    }
}
