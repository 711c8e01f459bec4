//! Error types shared by the ledger, selector, invoker and dispatcher.

use std::any::Any;
use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced to callers.
///
/// Rate-limit exhaustion is deliberately absent: the invoker turns it into a
/// degraded [`Outcome`](crate::api::invoker::Outcome) instead of an error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or missing configuration, reported at construction time.
    #[error("configuration error: {0}")]
    Config(String),

    /// A cost lookup for a model that is not in the table, with no fallback rate.
    #[error("unknown model '{0}' and no fallback rate configured")]
    UnknownModel(String),

    /// The budget record could not be read or written.
    #[error("budget store {}: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The budget record exists but does not hold a valid record. Writes refuse
    /// to overwrite it; [`BudgetLedger::reset`](crate::budget::BudgetLedger::reset)
    /// clears it explicitly.
    #[error("budget store {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// The call succeeded but its usage could not be charged. The call's value
    /// is carried along so it is not lost; see [`Error::into_unrecorded_value`].
    #[error("call on {model} succeeded but {tokens_used} tokens were not recorded: {source}")]
    Unrecorded {
        model: String,
        tokens_used: u64,
        value: Box<dyn Any + Send + Sync>,
        #[source]
        source: Box<Error>,
    },

    /// The budget record or configuration could not be (de)serialized.
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A non-rate-limit failure from the wrapped call. Never retried.
    #[error("call failed: {0}")]
    Call(String),
}

impl Error {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }

    /// Take back the value of a call whose usage was not recorded.
    ///
    /// Returns `None` for every other variant, or when `T` is not the type the
    /// call produced.
    pub fn into_unrecorded_value<T: 'static>(self) -> Option<T> {
        match self {
            Self::Unrecorded { value, .. } => value.downcast::<T>().ok().map(|v| *v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_message_names_path() {
        let err = Error::persistence(
            "/tmp/budget.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/budget.json"), "got: {msg}");
        assert!(msg.contains("read-only"), "got: {msg}");
    }

    #[test]
    fn unrecorded_hands_back_value() {
        let err = Error::Unrecorded {
            model: "gpt-4o".into(),
            tokens_used: 1200,
            value: Box::new(String::from("the answer")),
            source: Box::new(Error::persistence(
                "/tmp/budget.json",
                std::io::Error::new(std::io::ErrorKind::StorageFull, "disk full"),
            )),
        };
        let msg = err.to_string();
        assert!(msg.contains("1200 tokens"), "got: {msg}");
        assert!(msg.contains("disk full"), "got: {msg}");
        assert_eq!(err.into_unrecorded_value::<String>().as_deref(), Some("the answer"));
    }

    #[test]
    fn unrecorded_value_wrong_type_is_none() {
        let err = Error::Unrecorded {
            model: "gpt-4o".into(),
            tokens_used: 1,
            value: Box::new(7u32),
            source: Box::new(Error::Config("x".into())),
        };
        assert_eq!(err.into_unrecorded_value::<String>(), None);
        assert_eq!(Error::Call("boom".into()).into_unrecorded_value::<u32>(), None);
    }

    #[test]
    fn unknown_model_message() {
        let err = Error::UnknownModel("mystery-1".into());
        assert!(err.to_string().contains("mystery-1"));
    }
}
