use std::sync::Arc;

use crate::audio::{AudioSink, NullSink};
use crate::core::config::ManagerConfig;
use crate::process::{DecoderCommand, FfmpegCommand};

use super::manager::SupervisorManager;

/// Builder for constructing a [`SupervisorManager`].
pub struct ManagerBuilder {
    cfg: ManagerConfig,
    decoder: Option<Arc<dyn DecoderCommand>>,
    sink: Option<Arc<dyn AudioSink>>,
}

impl ManagerBuilder {
    /// Creates a new builder with the given configuration.
    pub fn new(cfg: ManagerConfig) -> Self {
        Self {
            cfg,
            decoder: None,
            sink: None,
        }
    }

    /// Sets the command used to launch decoders. Defaults to [`FfmpegCommand::default`].
    pub fn with_decoder(mut self, decoder: Arc<dyn DecoderCommand>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Sets the audio sink. Defaults to [`NullSink`].
    pub fn with_sink(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Builds the manager and starts its health monitor.
    ///
    /// Must be called from within a Tokio runtime when the monitor is enabled.
    pub fn build(self) -> Arc<SupervisorManager> {
        let decoder = self
            .decoder
            .unwrap_or_else(|| Arc::new(FfmpegCommand::default()));
        let sink = self.sink.unwrap_or_else(|| Arc::new(NullSink));

        let manager = SupervisorManager::new_internal(self.cfg, decoder, sink);
        manager.spawn_monitor();
        manager
    }
}
