//! Errors surfaced by the counter library.

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::event_list::Target;

/// Library error types.
#[derive(Debug)]
pub enum Error {
    /// An event token could not be parsed or resolved.
    InvalidEventSpec { token: String, reason: String },
    /// A CPU list such as `0,2-3` is malformed or names a CPU that does not
    /// exist.
    InvalidCpuList { list: String, reason: String },
    /// Opening a counter failed for a reason other than the CPU being absent.
    Attach {
        event: String,
        target: Target,
        source: io::Error,
    },
    /// A previously opened counter could not be read.
    Read {
        event: String,
        target: Target,
        reason: String,
    },
    /// Events cannot be added to, or attached from, a list that already owns
    /// open counters.
    AlreadyAttached,
    /// Reading sysfs or an event list file failed.
    Io { path: PathBuf, source: io::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn spec(token: &str, reason: impl Into<String>) -> Self {
        Error::InvalidEventSpec {
            token: token.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn cpu_list(list: &str, reason: impl Into<String>) -> Self {
        Error::InvalidCpuList {
            list: list.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidEventSpec { token, reason } => {
                write!(f, "invalid event '{token}': {reason}")
            }
            Error::InvalidCpuList { list, reason } => {
                write!(f, "invalid cpu list '{list}': {reason}")
            }
            Error::Attach {
                event,
                target,
                source,
            } => {
                write!(f, "cannot open event {event} on {target}: {source}")
            }
            Error::Read {
                event,
                target,
                reason,
            } => {
                write!(f, "cannot read event {event} on {target}: {reason}")
            }
            Error::AlreadyAttached => write!(f, "event list is already attached"),
            Error::Io { path, source } => write!(f, "{}: {}", path.display(), source),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Attach { source, .. } | Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_invalid_spec() {
        let err = Error::spec("bogus_event_xyz", "unknown event");
        assert_eq!(
            err.to_string(),
            "invalid event 'bogus_event_xyz': unknown event"
        );
    }

    #[test]
    fn test_display_attach_names_target() {
        let err = Error::Attach {
            event: "instructions".to_string(),
            target: Target::Cpu(3),
            source: io::Error::from_raw_os_error(libc::EACCES),
        };
        let text = err.to_string();
        assert!(text.starts_with("cannot open event instructions on cpu 3: "));
        assert!(std::error::Error::source(&err).is_some());
    }
}
