use crate::hw::Direction;
use nix::errno::Errno;
use thiserror::Error;

/// Negative return code reported by the audio hardware subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{}", describe(*.0))]
pub struct HwError(pub i32);

impl HwError {
    pub fn code(&self) -> i32 {
        self.0
    }

    /// Broken pipe, the code the driver uses for an xrun.
    pub fn is_xrun(&self) -> bool {
        self.0 == -(Errno::EPIPE as i32)
    }

    pub fn from_errno(errno: Errno) -> Self {
        Self(-(errno as i32))
    }
}

fn describe(code: i32) -> String {
    let errno = Errno::from_raw(code.saturating_abs());
    if errno == Errno::UnknownErrno {
        format!("error code {code}")
    } else {
        errno.desc().to_string()
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{direction} configuration: {reason}")]
    Config { direction: Direction, reason: String },

    #[error("{direction} {op}: {source}")]
    Hardware {
        direction: Direction,
        op: &'static str,
        #[source]
        source: HwError,
    },

    #[error("cannot allocate {0}")]
    Resource(&'static str),

    #[error("no capture and no playback device")]
    NoDevices,

    #[error("full playback buffer not available at start ({available} of {expected} frames)")]
    RingNotFull { available: usize, expected: usize },

    #[error("recovery failed after {attempts} attempt(s): {last}")]
    Recovery { attempts: u32, last: Box<Error> },

    #[error("{count} recoveries within {window_ms} ms, giving up")]
    XrunStorm { count: usize, window_ms: u128 },

    #[error("cannot create realtime process thread: {0}")]
    Scheduling(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(direction: Direction, reason: impl Into<String>) -> Self {
        Self::Config {
            direction,
            reason: reason.into(),
        }
    }

    pub fn hw(direction: Direction, op: &'static str, source: HwError) -> Self {
        Self::Hardware {
            direction,
            op,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epipe_is_reported_as_xrun() {
        let err = HwError::from_errno(Errno::EPIPE);
        assert!(err.is_xrun());
        assert_eq!(err.code(), -32);
        assert!(!HwError::from_errno(Errno::EINVAL).is_xrun());
    }

    #[test]
    fn hardware_error_names_direction_and_operation() {
        let err = Error::hw(
            Direction::Capture,
            "pcm_start",
            HwError::from_errno(Errno::EBADFD),
        );
        let text = err.to_string();
        assert!(text.starts_with("capture pcm_start: "), "{text}");
    }
}
