use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Instantaneous level of one chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AudioLevel {
    /// Level on a 0..=100 scale.
    pub level: u8,
    /// Whether the chunk contained clipped samples.
    pub clipping: bool,
}

/// Summary statistics of one octave band over a sound-level interval.
#[derive(Clone, Debug, PartialEq)]
pub struct OctaveBand {
    pub center_hz: f64,
    pub min_db: f64,
    pub max_db: f64,
    pub mean_db: f64,
}

/// Sound-level measurement covering a completed interval.
#[derive(Clone, Debug, PartialEq)]
pub struct SoundLevel {
    pub started_at: SystemTime,
    pub duration: Duration,
    pub bands: Vec<OctaveBand>,
}

/// Unified per-chunk event delivered to consumers.
#[derive(Clone, Debug)]
pub struct AudioEvent {
    /// Source id the chunk came from.
    pub source: Arc<str>,
    pub level: AudioLevel,
    /// Present only when sound-level processing is enabled and an interval completed.
    pub sound_level: Option<SoundLevel>,
    pub timestamp: SystemTime,
}
