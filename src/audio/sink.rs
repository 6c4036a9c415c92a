use crate::audio::{AudioLevel, SoundLevel};
use crate::error::SinkError;

/// Collaborators invoked for every chunk a decoder produces.
///
/// Implementations must be cheap and must not block for long: they run on the
/// read loop of the supervisor. Errors are logged by the caller and never stop the
/// stream, except [`SinkError::SourceRemoved`].
pub trait AudioSink: Send + Sync + 'static {
    /// Appends raw PCM to the analysis buffer of `source_id`.
    fn write_analysis(&self, source_id: &str, data: &[u8]) -> Result<(), SinkError>;

    /// Appends raw PCM to the capture (recording) buffer of `source_id`.
    fn write_capture(&self, source_id: &str, data: &[u8]) -> Result<(), SinkError>;

    /// Fans the chunk out to live listeners. Best effort.
    fn broadcast(&self, source_id: &str, data: &[u8]);

    /// Computes the level of one chunk.
    fn audio_level(&self, data: &[u8], source_id: &str) -> AudioLevel;

    fn sound_level_enabled(&self) -> bool {
        false
    }

    /// Feeds the chunk into the sound-level processor of `source_id`.
    ///
    /// Returns [`SinkError::IntervalIncomplete`] until an interval has been filled.
    fn process_sound_level(&self, _source_id: &str, _data: &[u8]) -> Result<SoundLevel, SinkError> {
        Err(SinkError::ProcessorNotRegistered)
    }
}

/// Sink that discards audio and reports silence.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn write_analysis(&self, _source_id: &str, _data: &[u8]) -> Result<(), SinkError> {
        Ok(())
    }

    fn write_capture(&self, _source_id: &str, _data: &[u8]) -> Result<(), SinkError> {
        Ok(())
    }

    fn broadcast(&self, _source_id: &str, _data: &[u8]) {}

    fn audio_level(&self, _data: &[u8], _source_id: &str) -> AudioLevel {
        AudioLevel::default()
    }
}
