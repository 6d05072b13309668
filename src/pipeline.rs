//! Pipeline assembly and startup.
//!
//! [`Pipeline::start`] recovers the flash ring, seeds the RAM ring one index
//! past whatever flash holds, spawns the flusher and (when the configuration
//! allows it) the poster, and logs the startup event.  Producers get
//! [`EventWriter`] handles from the running pipeline.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use snafu::Snafu;
use tokio::task::JoinHandle;

use crate::{
    clock::Clock,
    codec::{BLOCK_INDEX_LEN, MAX_HEADER_LEN},
    flash::{FlashConfig, FlashMedia, FlashRing},
    poster::{self, PosterConfig, WallClockHint},
    ring::{EventFlags, EventWriter, RamRing, RingConfig},
    EVENT_STARTUP,
};

/// Everything the pipeline needs to run.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub ring: RingConfig,
    pub flash: FlashConfig,
    /// Collector endpoint; absent or unusable means the poster is not
    /// started and data accumulates on flash.
    pub poster: Option<PosterConfig>,
}

#[derive(Debug, Snafu)]
pub enum ConfigBuildError {
    #[snafu(display("parameter '{}' was invalid: {}", param_name, reason))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Builder for [`PipelineConfig`].
#[derive(Clone, Debug, Default)]
pub struct PipelineConfigBuilder {
    buffer_size: Option<usize>,
    num_buffers: Option<usize>,
    save_hold_ticks: Option<u32>,
    flush_interval: Option<std::time::Duration>,
    poster: Option<PosterConfig>,
}

impl PipelineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the buffer size; must match the flash sector size.
    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = Some(bytes);
        self
    }

    /// Sets the number of RAM buffers in the FIFO.
    pub fn num_buffers(mut self, buffers: usize) -> Self {
        self.num_buffers = Some(buffers);
        self
    }

    /// Sets how long a partially filled head buffer may age before being
    /// saved, in clock ticks.
    pub fn save_hold_ticks(mut self, ticks: u32) -> Self {
        self.save_hold_ticks = Some(ticks);
        self
    }

    /// Sets the flusher's wait between unsignaled drain passes.
    pub fn flush_interval(mut self, interval: std::time::Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    /// Sets the collector endpoint.
    pub fn poster(mut self, poster: PosterConfig) -> Self {
        self.poster = Some(poster);
        self
    }

    /// Consumes this builder and constructs a `PipelineConfig`.
    pub fn build(self) -> Result<PipelineConfig, ConfigBuildError> {
        let defaults = RingConfig::default();
        let buffer_size = self.buffer_size.unwrap_or(defaults.buffer_size);
        let num_buffers = self.num_buffers.unwrap_or(defaults.num_buffers);
        let save_hold_ticks = self.save_hold_ticks.unwrap_or(defaults.save_hold_ticks);

        if buffer_size <= BLOCK_INDEX_LEN + MAX_HEADER_LEN {
            return Err(ConfigBuildError::InvalidParameter {
                param_name: "buffer_size",
                reason: format!(
                    "must exceed {} bytes of per-buffer overhead",
                    BLOCK_INDEX_LEN + MAX_HEADER_LEN
                ),
            });
        }
        if buffer_size % 4 != 0 {
            return Err(ConfigBuildError::InvalidParameter {
                param_name: "buffer_size",
                reason: "must be a multiple of the four-byte program word".to_string(),
            });
        }
        if num_buffers < 2 {
            return Err(ConfigBuildError::InvalidParameter {
                param_name: "num_buffers",
                reason: "at least two buffers are required".to_string(),
            });
        }

        Ok(PipelineConfig {
            ring: RingConfig {
                buffer_size,
                num_buffers,
                save_hold_ticks,
            },
            flash: FlashConfig {
                flush_interval: self
                    .flush_interval
                    .unwrap_or(crate::flash::DEFAULT_FLUSH_INTERVAL),
            },
            poster: self.poster,
        })
    }
}

/// Error that occurred when starting the pipeline.
#[derive(Debug, Snafu)]
pub enum StartError {
    #[snafu(display(
        "ring buffers are {} bytes but flash sectors are {}",
        buffer_size,
        sector_size
    ))]
    GeometryMismatch {
        buffer_size: usize,
        sector_size: usize,
    },

    #[snafu(display("ring must have at least two buffers, got {}", num_buffers))]
    TooFewBuffers { num_buffers: usize },

    #[snafu(display("flash region must have at least two sectors, got {}", sector_count))]
    TooFewSectors { sector_count: u32 },
}

/// What to log as the per-boot startup event.
#[derive(Clone, Debug, Default)]
pub struct StartupInfo {
    /// Platform reset information, opaque to the pipeline.
    pub reset_info: Vec<u8>,
    /// Clock calibration sampled at boot.
    pub rtc_calibration: u32,
}

/// A running pipeline: RAM ring, flusher, and optionally the poster.
pub struct Pipeline<M: FlashMedia> {
    ram: Arc<RamRing>,
    flash: Arc<FlashRing<M>>,
    wall_clock: Arc<Mutex<Option<WallClockHint>>>,
    flusher: JoinHandle<()>,
    poster: Option<JoinHandle<()>>,
}

impl<M: FlashMedia> Pipeline<M> {
    /// Recovers the flash ring from `media` and brings the tasks up.
    ///
    /// The startup event is the first event of the new boot's first buffer.
    /// An unusable poster configuration is logged and skipped rather than
    /// failing startup: the node keeps logging locally.
    pub async fn start(
        media: M,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
        startup: StartupInfo,
    ) -> Result<Self, StartError> {
        snafu::ensure!(
            config.ring.buffer_size == media.sector_size(),
            GeometryMismatchSnafu {
                buffer_size: config.ring.buffer_size,
                sector_size: media.sector_size(),
            }
        );
        snafu::ensure!(
            config.ring.num_buffers >= 2,
            TooFewBuffersSnafu {
                num_buffers: config.ring.num_buffers
            }
        );
        snafu::ensure!(
            media.sector_count() >= 2,
            TooFewSectorsSnafu {
                sector_count: media.sector_count()
            }
        );

        let (flash, next_index) = FlashRing::open(media, &config.flash).await;
        let flash = Arc::new(flash);
        info!(next_index, "Flash ring recovered.");

        let ram = Arc::new(RamRing::new(&config.ring, Arc::clone(&clock), next_index));
        let flusher = tokio::spawn(Arc::clone(&flash).run_flusher(Arc::clone(&ram)));

        let mut writer = EventWriter::new(Arc::clone(&ram));
        let mut payload = startup.reset_info.clone();
        payload.extend_from_slice(&startup.rtc_calibration.to_le_bytes());
        writer.append(
            EVENT_STARTUP,
            &payload,
            EventFlags {
                low_res_time: true,
                no_repeat: false,
            },
        );

        let wall_clock = Arc::new(Mutex::new(None));
        let poster = match config.poster {
            Some(poster_config) => match poster_config.validate() {
                Ok(()) => Some(tokio::spawn(poster::run_poster(
                    poster_config,
                    clock,
                    Arc::clone(&ram),
                    Arc::clone(&flash),
                    Arc::clone(&wall_clock),
                ))),
                Err(error) => {
                    warn!(%error, "Poster configuration unusable; not posting.");
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            ram,
            flash,
            wall_clock,
            flusher,
            poster,
        })
    }

    /// Creates a producer handle.
    pub fn writer(&self) -> EventWriter {
        EventWriter::new(Arc::clone(&self.ram))
    }

    /// The RAM ring, for producers managed outside the pipeline.
    pub fn ram_ring(&self) -> &Arc<RamRing> {
        &self.ram
    }

    /// The flash ring, for the status UI's read-only queries.
    pub fn flash_ring(&self) -> &Arc<FlashRing<M>> {
        &self.flash
    }

    /// Whether the poster task was started.
    pub fn poster_running(&self) -> bool {
        self.poster.is_some()
    }

    /// The collector's wall clock as of the last acknowledged post.
    pub fn wall_clock_hint(&self) -> Option<WallClockHint> {
        *self.wall_clock.lock()
    }

    /// Stops the tasks.  Buffered data stays in RAM and on flash; a later
    /// [`Pipeline::start`] on the same media picks the flash contents up.
    pub async fn shutdown(self) {
        self.flusher.abort();
        let _ = self.flusher.await;
        if let Some(poster) = self.poster {
            poster.abort();
            let _ = poster.await;
        }
    }
}
