//! Error taxonomy shared by every persistor.
//!
//! Backend-native failures never leave an adapter as-is: they are wrapped in
//! one of the four [`PersistorError`] variants, with a fixed set of native
//! "object is missing" signals always classified as [`PersistorError::NotFound`].

use std::{error::Error as StdError, fmt, io};
use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync>;

pub type PersistorResult<T> = Result<T, PersistorError>;

#[derive(Debug, Error)]
pub enum PersistorError {
    #[error("{message} ({location})")]
    NotFound {
        message: String,
        location: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("{message} ({location})")]
    Read {
        message: String,
        location: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("{message} ({location})")]
    Write {
        message: String,
        location: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("{message}")]
    Settings {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

/// Class assigned to a wrapped error when it carries no not-found signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Read,
    Write,
}

impl PersistorError {
    pub fn not_found(message: impl Into<String>, location: impl fmt::Display) -> Self {
        Self::NotFound {
            message: message.into(),
            location: location.to_string(),
            source: None,
        }
    }

    pub fn read(message: impl Into<String>, location: impl fmt::Display) -> Self {
        Self::Read {
            message: message.into(),
            location: location.to_string(),
            source: None,
        }
    }

    pub fn write(message: impl Into<String>, location: impl fmt::Display) -> Self {
        Self::Write {
            message: message.into(),
            location: location.to_string(),
            source: None,
        }
    }

    pub fn settings(message: impl Into<String>) -> Self {
        Self::Settings {
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying cause.
    pub fn with_source(mut self, err: impl Into<BoxError>) -> Self {
        let slot = match &mut self {
            Self::NotFound { source, .. }
            | Self::Read { source, .. }
            | Self::Write { source, .. }
            | Self::Settings { source, .. } => source,
        };
        *slot = Some(err.into());
        self
    }

    /// Classify a backend-native error.
    ///
    /// Not-found signals win over `class`; everything else becomes a read or
    /// write error carrying `message` and the location.
    pub fn wrap(
        err: impl Into<BoxError>,
        message: impl Into<String>,
        location: impl fmt::Display,
        class: ErrorClass,
    ) -> Self {
        let err = err.into();
        let base = if is_not_found(err.as_ref()) {
            Self::not_found(message, location)
        } else {
            match class {
                ErrorClass::Read => Self::read(message, location),
                ErrorClass::Write => Self::write(message, location),
            }
        };
        base.with_source(err)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Walk the cause chain looking for any native "missing object" signal.
///
/// Permission-denied counts as missing: S3 answers 403 rather than 404 for
/// absent keys when the caller lacks list rights.
pub fn is_not_found(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(err) = current {
        if let Some(persistor) = err.downcast_ref::<PersistorError>() {
            if persistor.is_not_found() {
                return true;
            }
        }
        if let Some(store) = err.downcast_ref::<object_store::Error>() {
            if matches!(
                store,
                object_store::Error::NotFound { .. } | object_store::Error::PermissionDenied { .. }
            ) {
                return true;
            }
        }
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::NotFound {
                return true;
            }
            if let Some(inner) = io_err.get_ref() {
                if is_not_found(inner) {
                    return true;
                }
            }
        }
        let text = err.to_string();
        if text == "not found" || text.contains("NoSuchKey") {
            return true;
        }
        current = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_not_found() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let wrapped = PersistorError::wrap(err, "error reading file", "b/k", ErrorClass::Read);
        assert!(wrapped.is_not_found());
    }

    #[test]
    fn object_store_signals_are_not_found() {
        let missing = object_store::Error::NotFound {
            path: "k".into(),
            source: "404".into(),
        };
        let denied = object_store::Error::PermissionDenied {
            path: "k".into(),
            source: "AccessDenied".into(),
        };
        for err in [missing, denied] {
            let wrapped = PersistorError::wrap(err, "head failed", "b/k", ErrorClass::Read);
            assert!(wrapped.is_not_found(), "{wrapped}");
        }
    }

    #[test]
    fn no_such_key_text_is_not_found() {
        let err: BoxError = "The specified key does not exist (NoSuchKey)".into();
        let wrapped = PersistorError::wrap(err, "get failed", "b/k", ErrorClass::Read);
        assert!(wrapped.is_not_found());
    }

    #[test]
    fn other_failures_keep_their_class() {
        let err = io::Error::new(io::ErrorKind::StorageFull, "disk full");
        let wrapped = PersistorError::wrap(err, "upload failed", "b/k", ErrorClass::Write);
        assert!(matches!(wrapped, PersistorError::Write { .. }));
        assert!(wrapped.to_string().contains("upload failed"));
    }

    #[test]
    fn object_store_errors_wrapped_in_io_are_inspected() {
        let inner = object_store::Error::NotFound {
            path: "k".into(),
            source: "404".into(),
        };
        let err = io::Error::other(inner);
        let wrapped = PersistorError::wrap(err, "stream failed", "b/k", ErrorClass::Read);
        assert!(wrapped.is_not_found());
    }
}
