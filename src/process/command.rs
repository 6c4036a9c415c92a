//! # Decoder command construction.
//!
//! [`DecoderCommand`] turns a [`SourceDescriptor`] into a ready-to-spawn
//! [`tokio::process::Command`]. [`FfmpegCommand`] is the production implementation:
//!
//! ```text
//! ffmpeg -rtsp_transport <t> [-timeout 10000000] [params..] -i <url>
//!        -loglevel error -vn -f s16le -ar 48000 -ac 1 -hide_banner pipe:1
//! ```
//!
//! Pipes, process group and kill-on-drop are configured by the spawner
//! ([`DecoderProcess::spawn`](crate::process::DecoderProcess::spawn)), not here.

use std::path::PathBuf;

use tokio::process::Command;

use crate::error::StreamError;
use crate::source::SourceDescriptor;

/// Default socket I/O timeout passed to the decoder, in microseconds.
const DEFAULT_TIMEOUT_MICROS: u64 = 10_000_000;
/// Smallest user-supplied `-timeout` accepted, in microseconds.
const MIN_TIMEOUT_MICROS: u64 = 1_000_000;

/// Builds the decoder command for one source.
pub trait DecoderCommand: Send + Sync + 'static {
    /// Returns the command to spawn, or [`StreamError::Config`] if the
    /// configuration can never produce a working process.
    fn command(&self, source: &SourceDescriptor) -> Result<Command, StreamError>;
}

/// ffmpeg invocation producing raw PCM on stdout.
#[derive(Clone, Debug)]
pub struct FfmpegCommand {
    /// Path to the ffmpeg binary (absolute, or a name resolved through `PATH`).
    pub path: PathBuf,
    pub sample_rate: u32,
    pub channels: u8,
    /// Raw sample format (`-f`).
    pub format: String,
    /// Extra user parameters, inserted before `-i`.
    pub params: Vec<String>,
}

impl Default for FfmpegCommand {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ffmpeg"),
            sample_rate: 48_000,
            channels: 1,
            format: "s16le".to_string(),
            params: Vec::new(),
        }
    }
}

impl FfmpegCommand {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Adds extra user parameters.
    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    /// Full argument list for `source`.
    pub fn args(&self, source: &SourceDescriptor) -> Result<Vec<String>, StreamError> {
        if source.url().trim().is_empty() {
            return Err(StreamError::Config {
                reason: "source url is empty".to_string(),
            });
        }

        let mut args = vec![
            "-rtsp_transport".to_string(),
            source.transport().as_str().to_string(),
        ];

        match user_timeout(&self.params) {
            None => push_default_timeout(&mut args),
            Some(value) if !valid_timeout(value) => {
                tracing::warn!(
                    source = %source.safe_display(),
                    user_timeout = value,
                    "invalid user timeout, using default"
                );
                push_default_timeout(&mut args);
            }
            Some(_) => {}
        }
        args.extend(self.params.iter().cloned());

        args.extend([
            "-i".to_string(),
            source.url().to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-vn".to_string(),
            "-f".to_string(),
            self.format.clone(),
            "-ar".to_string(),
            self.sample_rate.to_string(),
            "-ac".to_string(),
            self.channels.to_string(),
            "-hide_banner".to_string(),
            "pipe:1".to_string(),
        ]);
        Ok(args)
    }

    fn validate_path(&self) -> Result<(), StreamError> {
        if self.path.as_os_str().is_empty() {
            return Err(StreamError::Config {
                reason: "decoder path is empty".to_string(),
            });
        }
        if self.path.is_absolute() && !self.path.is_file() {
            return Err(StreamError::Config {
                reason: format!("decoder not found at {}", self.path.display()),
            });
        }
        Ok(())
    }
}

impl DecoderCommand for FfmpegCommand {
    fn command(&self, source: &SourceDescriptor) -> Result<Command, StreamError> {
        self.validate_path()?;
        let mut cmd = Command::new(&self.path);
        cmd.args(self.args(source)?);
        Ok(cmd)
    }
}

fn push_default_timeout(args: &mut Vec<String>) {
    args.push("-timeout".to_string());
    args.push(DEFAULT_TIMEOUT_MICROS.to_string());
}

fn user_timeout(params: &[String]) -> Option<&str> {
    params
        .windows(2)
        .find(|w| w[0] == "-timeout")
        .map(|w| w[1].as_str())
}

fn valid_timeout(value: &str) -> bool {
    value
        .parse::<u64>()
        .map(|micros| micros >= MIN_TIMEOUT_MICROS)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Transport;

    fn source() -> SourceDescriptor {
        SourceDescriptor::new("rtsp://user:pw@cam.local/live", Transport::Udp)
    }

    #[test]
    fn test_default_args() {
        let args = FfmpegCommand::default().args(&source()).unwrap();
        assert_eq!(
            args,
            [
                "-rtsp_transport", "udp", "-timeout", "10000000", "-i",
                "rtsp://user:pw@cam.local/live", "-loglevel", "error", "-vn", "-f", "s16le",
                "-ar", "48000", "-ac", "1", "-hide_banner", "pipe:1",
            ]
        );
    }

    #[test]
    fn test_user_timeout_replaces_default() {
        let cmd = FfmpegCommand::default().with_params(["-timeout", "5000000"]);
        let args = cmd.args(&source()).unwrap();
        assert_eq!(args.iter().filter(|a| *a == "-timeout").count(), 1);
        assert_eq!(&args[2..4], ["-timeout", "5000000"]);
    }

    #[test]
    fn test_invalid_user_timeout_keeps_default_first() {
        let cmd = FfmpegCommand::default().with_params(["-timeout", "10"]);
        let args = cmd.args(&source()).unwrap();
        assert_eq!(&args[2..6], ["-timeout", "10000000", "-timeout", "10"]);
    }

    #[test]
    fn test_empty_url_is_config_error() {
        let src = SourceDescriptor::new("  ", Transport::Tcp);
        let err = FfmpegCommand::default().args(&src).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_decoder_path_is_config_error() {
        let err = FfmpegCommand::new("").command(&source()).unwrap_err();
        assert_eq!(err.as_label(), "stream_config");

        let err = FfmpegCommand::new("/nonexistent/bin/ffmpeg")
            .command(&source())
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
