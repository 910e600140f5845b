use crate::backup::result_error::{AddDebugObjectAndFnName, AddFunctionName, AddMsg};
use derive_more::Display;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::mpsc::SendError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    LiblzmaStream(#[from] liblzma::stream::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    Globset(#[from] globset::Error),
    #[error(transparent)]
    AgeEncrypt(#[from] age::EncryptError),
    #[error(transparent)]
    AgeDecrypt(#[from] age::DecryptError),
    #[error(transparent)]
    Lz4(#[from] lz4_flex::frame::Error),
    #[error("{0}")]
    ChannelSendError(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("job {0:?} not found")]
    JobNotFound(String),
    #[error("object {0:?} not found at destination")]
    ObjectNotFound(String),
    #[error("illegal run state transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },
    #[error("source {path:?} unreadable:\n{}", indent::indent_all_with("  ", error.to_string()))]
    SourceUnreadable {
        path: PathBuf,
        /// Where the item or subtree sits in the archive, when known
        item: Option<PathBuf>,
        error: Box<Error>,
    },
    #[error("archive pipeline failed:\n{}", indent::indent_all_with("  ", .0.to_string()))]
    Archive(Box<Error>),
    #[error("destination unavailable: {0}")]
    DestinationUnavailable(String),
    #[error("destination rejected request: {0}")]
    DestinationRejected(String),
    #[error("verification of {key:?} failed: {reason}")]
    VerificationFailed { key: String, reason: String },
    #[error("run cancelled")]
    Cancelled,
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{} failed:\n{}", fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithFnName { fn_name: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", obj_debug, fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send + Sync>,
        fn_name: String,
    },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

/// Classification of a run failure, recorded verbatim in the run history.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SourceUnreadable,
    ArchiveError,
    DestinationUnavailable,
    DestinationRejected,
    VerificationFailed,
    Cancelled,
    Other,
}

impl<S: Into<String>, O: Debug + Send + Sync + 'static> AddDebugObjectAndFnName<S, O> for Error {
    fn add_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> AddMsg<S> for Error {
    fn add_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl<S: Into<String>> AddFunctionName<S> for Error {
    fn add_fn_name(self, fn_name: S) -> Self {
        Self::WithFnName {
            fn_name: fn_name.into(),
            error: Box::new(self),
        }
    }
}

impl<D: Debug> From<SendError<D>> for Error {
    fn from(value: SendError<D>) -> Self {
        Self::ChannelSendError(format!("Failed to send {:?}", value.0))
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        Self::LotsOfError(errors.into_iter().flat_map(|e| e.into_iter()).collect_vec())
    }
}

impl From<object_store::Error> for Error {
    fn from(value: object_store::Error) -> Self {
        match value {
            object_store::Error::NotFound { path, .. } => Error::ObjectNotFound(path),
            e @ (object_store::Error::PermissionDenied { .. }
            | object_store::Error::Unauthenticated { .. }
            | object_store::Error::InvalidPath { .. }
            | object_store::Error::NotSupported { .. }
            | object_store::Error::NotImplemented
            | object_store::Error::UnknownConfigurationKey { .. }) => {
                Error::DestinationRejected(e.to_string())
            }
            e => Error::DestinationUnavailable(e.to_string()),
        }
    }
}

impl Error {
    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }

    pub fn archive(error: Error) -> Error {
        match error {
            e @ (Error::Archive(_) | Error::Cancelled) => e,
            e => Error::Archive(Box::new(e)),
        }
    }

    pub fn source_unreadable<P: Into<PathBuf>>(path: P, error: Error) -> Error {
        Error::SourceUnreadable {
            path: path.into(),
            item: None,
            error: Box::new(error),
        }
    }

    pub fn item_unreadable<P: Into<PathBuf>, A: Into<PathBuf>>(
        path: P,
        item: A,
        error: Error,
    ) -> Error {
        Error::SourceUnreadable {
            path: path.into(),
            item: Some(item.into()),
            error: Box::new(error),
        }
    }

    /// Archive path of the item an unreadable-source error is about
    pub fn unreadable_item(&self) -> Option<&Path> {
        match self.root() {
            Error::SourceUnreadable { item, .. } => item.as_deref(),
            _ => None,
        }
    }

    /// The innermost error once message and function context is removed.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithMsg { error, .. }
            | Error::WithFnName { error, .. }
            | Error::WithDebugObjAndFnName { error, .. } => error.root(),
            e => e,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self.root() {
            Error::SourceUnreadable { .. } | Error::WalkDir(_) => FailureKind::SourceUnreadable,
            Error::Archive(_) => FailureKind::ArchiveError,
            Error::DestinationUnavailable(_) => FailureKind::DestinationUnavailable,
            Error::DestinationRejected(_) | Error::ObjectNotFound(_) => {
                FailureKind::DestinationRejected
            }
            Error::VerificationFailed { .. } => FailureKind::VerificationFailed,
            Error::Cancelled => FailureKind::Cancelled,
            Error::LotsOfError(v) => v.first().map(Error::kind).unwrap_or(FailureKind::Other),
            _ => FailureKind::Other,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == FailureKind::DestinationUnavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_error_from_io_error() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error = Error::from(io_error);

        match error {
            Error::Io(_) => (),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_error_add_msg() {
        let error = Error::Cancelled.add_msg("Custom message");

        match error {
            Error::WithMsg { msg, .. } => assert_eq!(msg, "Custom message"),
            _ => panic!("Expected WithMsg error"),
        }
    }

    #[test]
    fn test_error_add_debug_object_and_fn_name() {
        let error = Error::Cancelled.add_debug_object_and_fn_name("test_object", "test_function");

        match &error {
            Error::WithDebugObjAndFnName { fn_name, .. } => assert_eq!(fn_name, "test_function"),
            _ => panic!("Expected WithDebugObjAndFnName error"),
        }
        let error_str = error.to_string();
        assert!(error_str.contains("test_function"));
        assert!(error_str.contains("run cancelled"));
    }

    #[test]
    fn test_error_from_send_error() {
        let (tx, rx) = mpsc::channel();
        drop(rx);

        match tx.send("test") {
            Err(send_error) => match Error::from(send_error) {
                Error::ChannelSendError(_) => (),
                _ => panic!("Expected ChannelSendError"),
            },
            Ok(_) => panic!("Expected send error"),
        }
    }

    #[test]
    fn test_error_chain_flattens() {
        let error1 = Error::DestinationUnavailable("a".into());
        let error2 = Error::from(vec![Error::Cancelled, Error::Cancelled]);

        match error1.chain(error2) {
            Error::LotsOfError(errors) => assert_eq!(errors.len(), 3),
            _ => panic!("Expected LotsOfError"),
        }
    }

    #[test]
    fn test_kind_peels_context() {
        let error = Error::DestinationUnavailable("timeout".into())
            .add_fn_name("put")
            .add_msg("upload failed");
        assert_eq!(error.kind(), FailureKind::DestinationUnavailable);
        assert!(error.is_transient());

        let error = Error::DestinationRejected("quota".into()).add_msg("upload failed");
        assert_eq!(error.kind(), FailureKind::DestinationRejected);
        assert!(!error.is_transient());
    }

    #[test]
    fn test_archive_wraps_once() {
        let error = Error::archive(Error::archive(Error::Io(std::io::Error::other("x"))));
        match error {
            Error::Archive(inner) => assert!(matches!(*inner, Error::Io(_))),
            _ => panic!("Expected Archive error"),
        }
        assert_eq!(Error::archive(Error::Cancelled).kind(), FailureKind::Cancelled);
    }

    #[test]
    fn test_object_store_error_mapping() {
        let not_found = object_store::Error::NotFound {
            path: "a/b".into(),
            source: "missing".into(),
        };
        assert!(matches!(Error::from(not_found), Error::ObjectNotFound(p) if p == "a/b"));

        let denied = object_store::Error::PermissionDenied {
            path: "a/b".into(),
            source: "nope".into(),
        };
        assert_eq!(Error::from(denied).kind(), FailureKind::DestinationRejected);

        let generic = object_store::Error::Generic {
            store: "S3",
            source: "connection reset".into(),
        };
        assert!(Error::from(generic).is_transient());
    }
}
