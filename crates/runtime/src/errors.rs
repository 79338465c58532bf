//! Handler error plumbing: the ignore sentinel and aggregate errors.

use std::fmt;

use rudder_store::StoreError;

/// Sentinel error: a handler result carrying this anywhere in its chain is
/// dropped by the shared handler chain instead of aggregated.
#[derive(Debug, Clone, Copy, Default, thiserror::Error)]
#[error("ignore handler error")]
pub struct Ignore;

pub fn is_ignore(err: &anyhow::Error) -> bool {
    err.chain().any(|c| c.downcast_ref::<Ignore>().is_some())
}

pub fn is_conflict(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|c| c.downcast_ref::<StoreError>().is_some_and(|s| s.is_conflict()))
}

/// A single handler failure, tagged with the handler's registered name.
#[derive(Debug)]
pub struct HandlerError {
    pub handler: String,
    pub source: anyhow::Error,
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler {}: {:#}", self.handler, self.source)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(AsRef::<dyn std::error::Error>::as_ref(&self.source))
    }
}

/// Errors accumulated across one pass through a handler chain.
#[derive(Debug, Default)]
pub struct ErrorList(pub Vec<HandlerError>);

impl ErrorList {
    pub fn push(&mut self, err: HandlerError) {
        self.0.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_result<T>(self, ok: T) -> anyhow::Result<T> {
        if self.0.is_empty() {
            Ok(ok)
        } else {
            Err(self.into())
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.first().map(|e| e as &(dyn std::error::Error + 'static))
    }
}
