//! Downstream audio collaborators.
//!
//! Supervisors never convert, store or analyse audio themselves. Every chunk read
//! from a decoder is handed to an [`AudioSink`] and summarized into an
//! [`AudioEvent`] delivered on the stream's bounded output channel.
//!
//! ## Contents
//! - [`AudioSink`] narrow interface to buffers, broadcast and level computation
//! - [`AudioEvent`], [`AudioLevel`], [`SoundLevel`], [`OctaveBand`] per-chunk summary
//! - [`NullSink`] sink that accepts everything and reports silence

mod event;
mod sink;

pub use event::{AudioEvent, AudioLevel, OctaveBand, SoundLevel};
pub use sink::{AudioSink, NullSink};
