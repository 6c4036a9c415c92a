//! Error types used by stream supervisors, the manager and audio collaborators.
//!
//! This module defines three error enums:
//!
//! - [`StreamError`] errors raised while running one decoder process.
//! - [`ManagerError`] errors raised by registry operations and shutdown.
//! - [`SinkError`] errors returned by the downstream audio collaborators.
//!
//! All provide `as_label` for logs. [`StreamError::is_fatal`] and
//! [`SinkError::is_fatal`] separate conditions that end a supervisor from
//! those that are absorbed by the restart loop.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::process::DecoderFailure;

/// # Errors produced while supervising one decoder process.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StreamError {
    /// Decoder path or source settings are unusable; no retry until configuration changes.
    #[error("invalid configuration: {reason}")]
    Config {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// The decoder process could not be spawned. Retried under backoff.
    #[error("failed to spawn decoder: {source}")]
    Spawn {
        #[source]
        source: io::Error,
    },

    /// The spawned process did not expose a requested pipe.
    #[error("decoder {pipe} pipe unavailable")]
    MissingPipe {
        /// `"stdout"` or `"stderr"`.
        pipe: &'static str,
    },

    /// Reading the decoder's output failed for a reason other than shutdown.
    #[error("read from decoder failed: {source}")]
    Read {
        #[source]
        source: io::Error,
    },

    /// The decoder's output closed.
    #[error("decoder exited after {ran_for:?}")]
    Exited {
        /// Time between spawn and end of output.
        ran_for: Duration,
    },

    /// A downstream collaborator reported a condition that ends the stream.
    #[error("audio sink: {source}")]
    Sink {
        #[source]
        source: SinkError,
    },

    /// The decoder reported a recognised failure on stderr.
    #[error("decoder failed: {failure}")]
    Decoder {
        /// Classified stderr output.
        failure: DecoderFailure,
    },

    /// The decoder kept failing for a reason retries cannot fix.
    #[error("giving up after {attempts} permanent decoder failures: {failure}")]
    PermanentFailure {
        /// The last classified failure.
        failure: DecoderFailure,
        /// Consecutive permanent failures observed.
        attempts: u32,
    },
}

impl StreamError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use streamvisor::StreamError;
    ///
    /// let err = StreamError::Config { reason: "empty decoder path".into() };
    /// assert_eq!(err.as_label(), "stream_config");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            StreamError::Config { .. } => "stream_config",
            StreamError::Spawn { .. } => "stream_spawn",
            StreamError::MissingPipe { .. } => "stream_missing_pipe",
            StreamError::Read { .. } => "stream_read",
            StreamError::Exited { .. } => "stream_exited",
            StreamError::Sink { .. } => "stream_sink",
            StreamError::Decoder { .. } => "stream_decoder",
            StreamError::PermanentFailure { .. } => "stream_permanent_failure",
        }
    }

    /// Whether this error ends the supervisor instead of driving a restart.
    ///
    /// # Example
    /// ```
    /// use streamvisor::StreamError;
    ///
    /// let spawn = StreamError::Spawn { source: std::io::ErrorKind::NotFound.into() };
    /// assert!(!spawn.is_fatal());
    ///
    /// let config = StreamError::Config { reason: "no url".into() };
    /// assert!(config.is_fatal());
    /// ```
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::Config { .. }
                | StreamError::Sink { .. }
                | StreamError::PermanentFailure { .. }
        )
    }
}

/// # Errors produced by the supervisor manager.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ManagerError {
    /// A supervisor is already registered for this source.
    #[error("stream already exists: {source_id}")]
    AlreadyExists {
        /// Source identity, credentials stripped.
        source_id: String,
    },

    /// No supervisor is registered for this source.
    #[error("no stream found: {source_id}")]
    NotFound {
        /// Source identity, credentials stripped.
        source_id: String,
    },

    /// Shutdown grace period was exceeded; some supervisors did not finish cleanup.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Sources whose supervisors were still running.
        stuck: Vec<String>,
    },
}

impl ManagerError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ManagerError::AlreadyExists { .. } => "manager_already_exists",
            ManagerError::NotFound { .. } => "manager_not_found",
            ManagerError::GraceExceeded { .. } => "manager_grace_exceeded",
        }
    }
}

/// # Errors reported by downstream audio collaborators.
///
/// Only [`SinkError::SourceRemoved`] ends the supervisor; every other variant is
/// logged and the read loop continues.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SinkError {
    /// The target buffer for this source does not exist (yet).
    #[error("buffer unavailable")]
    BufferUnavailable,

    /// The source was removed from the system; no more data should be produced.
    #[error("source removed")]
    SourceRemoved,

    /// The sound-level interval has not accumulated enough audio yet.
    #[error("sound level interval incomplete")]
    IntervalIncomplete,

    /// The chunk carried no usable audio.
    #[error("no audio data")]
    NoAudioData,

    /// No sound-level processor is registered for this source.
    #[error("sound level processor not registered")]
    ProcessorNotRegistered,

    /// Any other collaborator failure.
    #[error("{0}")]
    Other(String),
}

impl SinkError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            SinkError::BufferUnavailable => "sink_buffer_unavailable",
            SinkError::SourceRemoved => "sink_source_removed",
            SinkError::IntervalIncomplete => "sink_interval_incomplete",
            SinkError::NoAudioData => "sink_no_audio_data",
            SinkError::ProcessorNotRegistered => "sink_processor_not_registered",
            SinkError::Other(_) => "sink_other",
        }
    }

    /// Whether this condition ends the supervisor.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SinkError::SourceRemoved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_error_messages() {
        let err = ManagerError::AlreadyExists {
            source_id: "rtsp://cam".into(),
        };
        assert_eq!(err.to_string(), "stream already exists: rtsp://cam");

        let err = ManagerError::NotFound {
            source_id: "rtsp://cam".into(),
        };
        assert_eq!(err.to_string(), "no stream found: rtsp://cam");
        assert_eq!(err.as_label(), "manager_not_found");
    }

    #[test]
    fn test_only_source_removed_is_fatal_sink_error() {
        assert!(SinkError::SourceRemoved.is_fatal());
        assert!(!SinkError::BufferUnavailable.is_fatal());
        assert!(!SinkError::Other("disk full".into()).is_fatal());
    }

    #[test]
    fn test_transient_stream_errors() {
        assert!(!StreamError::MissingPipe { pipe: "stdout" }.is_fatal());
        assert!(!StreamError::Exited {
            ran_for: Duration::from_secs(1)
        }
        .is_fatal());
        assert!(StreamError::Sink {
            source: SinkError::SourceRemoved
        }
        .is_fatal());
    }

    #[test]
    fn test_only_repeated_permanent_decoder_failure_is_fatal() {
        let failure = crate::process::classify("401 Unauthorized").unwrap();
        let once = StreamError::Decoder {
            failure: failure.clone(),
        };
        assert!(!once.is_fatal());
        assert_eq!(once.as_label(), "stream_decoder");

        let repeated = StreamError::PermanentFailure {
            failure,
            attempts: 3,
        };
        assert!(repeated.is_fatal());
        assert!(repeated.to_string().starts_with("giving up after 3 permanent"));
    }
}
