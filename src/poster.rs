//! The outbound poster.
//!
//! One task drains flash blocks to the collector.  Each POST carries a
//! signed record: the sensor identity, the node's monotonic time, the
//! block's index, the slice's start offset, and the slice itself, followed
//! by a SHA3-224 tag over the pre-shared key and the record.  The collector
//! echoes `sensor_id XOR time` back as a magic word, which authenticates the
//! round trip in both directions without TLS; confidentiality is explicitly
//! not a goal.
//!
//! The response body also carries the collector's wall-clock time and its
//! acknowledged `(index, size)` cursor.  The wall clock is logged back into
//! the event stream as a POST_TIME event so sector records can be correlated
//! with real time on their own, and the cursor drives which block is sent
//! next.
//!
//! Failures of any kind close the connection and grow a hold-off delay;
//! success resets it.

use std::{io, sync::Arc, time::Duration};

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use serde::Deserialize;
use sha3::{Digest, Sha3_224};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{lookup_host, TcpStream},
    time::timeout,
};

use crate::{
    clock::{Clock, TICKS_PER_SECOND},
    flash::{FlashMedia, FlashRing},
    ring::{EventFlags, EventWriter, RamRing},
    EVENT_POST_TIME,
};

/// Length of the pre-shared key, in bytes.
pub const KEY_LEN: usize = 287;

/// Length of the SHA3-224 tag appended to the signed record.
pub const TAG_LEN: usize = 28;

/// Fixed part of the signed record before the block slice.
const SIGNED_PREFIX_LEN: usize = 16;

/// Required response body: magic, seconds, microseconds, index, size.
const RESPONSE_BODY_LEN: usize = 20;

/// Upper bound on a response we are willing to buffer.
const MAX_RESPONSE_LEN: usize = 16 * 1024;

/// Default wait between unsignaled posting passes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(120);

/// Default ceiling for the failure hold-off.
pub const DEFAULT_HOLDOFF_CAP: Duration = Duration::from_secs(30 * 60);

/// Default minimum spacing of POST_TIME events, in clock ticks.
pub const DEFAULT_POST_TIME_GAP_TICKS: u32 = 60 * TICKS_PER_SECOND;

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_holdoff_cap() -> Duration {
    DEFAULT_HOLDOFF_CAP
}

fn default_post_time_gap() -> u32 {
    DEFAULT_POST_TIME_GAP_TICKS
}

/// Collector endpoint and identity, from the external configuration store.
///
/// If any of this is missing or malformed the poster task is simply not
/// started; the RAM-to-flash half of the pipeline runs regardless.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PosterConfig {
    /// Collector host name or address.
    pub server: String,
    /// Collector TCP port.
    pub port: u16,
    /// Request path, e.g. `/sensors/<id>/data`.
    pub path: String,
    /// Node identity included in every signed record.
    pub sensor_id: u32,
    /// Pre-shared key; must be exactly [`KEY_LEN`] bytes.
    pub key: Vec<u8>,
    /// Wait between unsignaled posting passes.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Ceiling for the failure hold-off.
    #[serde(default = "default_holdoff_cap")]
    pub holdoff_cap: Duration,
    /// Minimum spacing of POST_TIME events, in clock ticks.
    #[serde(default = "default_post_time_gap")]
    pub post_time_gap_ticks: u32,
}

impl std::fmt::Debug for PosterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PosterConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("sensor_id", &self.sensor_id)
            .field("key", &"<redacted>")
            .field("poll_interval", &self.poll_interval)
            .field("holdoff_cap", &self.holdoff_cap)
            .field("post_time_gap_ticks", &self.post_time_gap_ticks)
            .finish()
    }
}

/// Reasons a poster configuration is unusable.
#[derive(Debug, Snafu)]
pub enum PosterConfigError {
    #[snafu(display("server must not be empty"))]
    EmptyServer,

    #[snafu(display("path must start with '/'"))]
    BadPath,

    #[snafu(display("key must be exactly {} bytes, got {}", KEY_LEN, actual))]
    KeyLength { actual: usize },
}

impl PosterConfig {
    /// Checks the configuration is complete enough to start the poster.
    pub fn validate(&self) -> Result<(), PosterConfigError> {
        snafu::ensure!(!self.server.is_empty(), EmptyServerSnafu);
        snafu::ensure!(self.path.starts_with('/'), BadPathSnafu);
        snafu::ensure!(
            self.key.len() == KEY_LEN,
            KeyLengthSnafu {
                actual: self.key.len()
            }
        );
        Ok(())
    }
}

/// The collector's wall clock, as last observed in a response.
///
/// Pairs the collector's time with the monotonic counter value it was
/// received at, so consumers can project it forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WallClockHint {
    /// Collector seconds.
    pub seconds: u32,
    /// Collector microseconds within the second.
    pub micros: u32,
    /// Monotonic counter value when the response arrived.
    pub sampled_at: u32,
}

#[derive(Debug, Snafu)]
enum PostError {
    #[snafu(display("failed to resolve collector address: {}", source))]
    Resolve { source: io::Error },

    #[snafu(display("collector host resolved to no addresses"))]
    NoAddress,

    #[snafu(display("failed to connect to collector: {}", source))]
    Connect { source: io::Error },

    #[snafu(display("failed to send request: {}", source))]
    Send { source: io::Error },

    #[snafu(display("failed to read response: {}", source))]
    Receive { source: io::Error },

    #[snafu(display("malformed response: {}", reason))]
    Protocol { reason: &'static str },

    #[snafu(display("response magic mismatch"))]
    BadMagic,
}

/// Computes the keyed tag over a signed record.
///
/// Plain `SHA3-224(key ‖ message)`: the sponge construction is not subject
/// to the length-extension weakness that forces the nested HMAC shape on
/// Merkle-Damgard hashes.
fn compute_tag(key: &[u8], signed: &[u8]) -> [u8; TAG_LEN] {
    let mut digest = Sha3_224::new();
    digest.update(key);
    digest.update(signed);
    digest.finalize().into()
}

/// Grows the hold-off after a failure: a quarter more, plus a second, up to
/// the cap.
fn next_holdoff(current: Duration, cap: Duration) -> Duration {
    (current + current / 4 + Duration::from_secs(1)).min(cap)
}

fn find_headers_end(response: &[u8]) -> Option<usize> {
    response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|at| at + 4)
}

fn read_u32_le(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().expect("length checked"))
}

struct Poster<M: FlashMedia> {
    config: PosterConfig,
    clock: Arc<dyn Clock>,
    flash: Arc<FlashRing<M>>,
    writer: EventWriter,
    wall_clock: Arc<Mutex<Option<WallClockHint>>>,
    /// Single-owner staging buffer the candidate block is fetched into.
    block: Vec<u8>,
    /// When the last POST_TIME event was appended, if any.
    last_time_event: Option<u32>,
}

impl<M: FlashMedia> Poster<M> {
    /// Posts one block, if the flash ring offers one.
    ///
    /// Returns `Ok(true)` after a confirmed post, `Ok(false)` when there was
    /// nothing to send.  The socket is dropped on every path.
    async fn post_once(&mut self) -> Result<bool, PostError> {
        // Connect before fetching the candidate: connecting can take a
        // while, more data may accumulate meanwhile, and the signed time
        // should be sampled as close to the send as possible.
        let address = lookup_host((self.config.server.as_str(), self.config.port))
            .await
            .context(ResolveSnafu)?
            .next()
            .context(NoAddressSnafu)?;
        let mut stream = TcpStream::connect(address).await.context(ConnectSnafu)?;

        let Some(candidate) = self.flash.get_block_to_post(&mut self.block).await else {
            return Ok(false);
        };

        let time = self.clock.now();
        let mut body = BytesMut::with_capacity(SIGNED_PREFIX_LEN + candidate.size + TAG_LEN);
        body.put_u32_le(self.config.sensor_id);
        body.put_u32_le(time);
        body.put_u32_le(candidate.index);
        body.put_u32_le(candidate.start);
        body.put_slice(&self.block[..candidate.size]);
        let tag = compute_tag(&self.config.key, &body);
        body.put_slice(&tag);

        let request_head = format!(
            "POST {} HTTP/1.1\r\n\
             Host: {}:{}\r\n\
             Connection: close\r\n\
             Content-Type: application/octet-stream\r\n\
             Content-Length: {}\r\n\
             \r\n",
            self.config.path,
            self.config.server,
            self.config.port,
            SIGNED_PREFIX_LEN + candidate.size + TAG_LEN,
        );
        stream
            .write_all(request_head.as_bytes())
            .await
            .context(SendSnafu)?;
        stream.write_all(&body).await.context(SendSnafu)?;

        let mut response = Vec::with_capacity(256);
        let mut chunk = [0u8; 512];
        let headers_end = loop {
            if let Some(at) = find_headers_end(&response) {
                break at;
            }
            snafu::ensure!(
                response.len() <= MAX_RESPONSE_LEN,
                ProtocolSnafu {
                    reason: "response headers too large"
                }
            );
            let received = stream.read(&mut chunk).await.context(ReceiveSnafu)?;
            snafu::ensure!(
                received != 0,
                ProtocolSnafu {
                    reason: "connection closed before end of headers"
                }
            );
            response.extend_from_slice(&chunk[..received]);
        };
        while response.len() < headers_end + RESPONSE_BODY_LEN {
            let received = stream.read(&mut chunk).await.context(ReceiveSnafu)?;
            snafu::ensure!(
                received != 0,
                ProtocolSnafu {
                    reason: "response body too short"
                }
            );
            response.extend_from_slice(&chunk[..received]);
        }

        let reply = &response[headers_end..];
        let magic = read_u32_le(reply, 0);
        let seconds = read_u32_le(reply, 4);
        let micros = read_u32_le(reply, 8);
        let ack_index = read_u32_le(reply, 12);
        let ack_size = read_u32_le(reply, 16);

        // The echoed XOR proves the collector verified the tag for this
        // exact request, not a replayed one.
        snafu::ensure!(magic == self.config.sensor_id ^ time, BadMagicSnafu);

        let now = self.clock.now();
        let gap_elapsed = match self.last_time_event {
            Some(at) => now.wrapping_sub(at) >= self.config.post_time_gap_ticks,
            None => true,
        };
        if gap_elapsed {
            // Log the collector's wall clock into the stream, with the sent
            // time alongside so the round trip bounds its accuracy.  Full
            // time precision, and suppressed when the immediately prior
            // event is already a POST_TIME, so an otherwise idle node does
            // not log only its own posting.
            let mut payload = [0u8; 12];
            payload[0..4].copy_from_slice(&time.to_le_bytes());
            payload[4..8].copy_from_slice(&seconds.to_le_bytes());
            payload[8..12].copy_from_slice(&micros.to_le_bytes());
            self.writer.append(
                EVENT_POST_TIME,
                &payload,
                EventFlags {
                    low_res_time: false,
                    no_repeat: true,
                },
            );
            self.last_time_event = Some(now);
        }

        *self.wall_clock.lock() = Some(WallClockHint {
            seconds,
            micros,
            sampled_at: now,
        });

        debug!(
            index = candidate.index,
            start = candidate.start,
            size = candidate.size,
            ack_index,
            ack_size,
            "Block posted and acknowledged."
        );
        self.flash.note_block_posted(ack_index, ack_size).await;
        Ok(true)
    }
}

/// Runs the poster task.
///
/// Waits for the flusher's signal (or the poll interval), then drains every
/// pending block.  Any failure backs off exponentially before the next
/// attempt; a success resets the hold-off.
pub(crate) async fn run_poster<M: FlashMedia>(
    config: PosterConfig,
    clock: Arc<dyn Clock>,
    ring: Arc<RamRing>,
    flash: Arc<FlashRing<M>>,
    wall_clock: Arc<Mutex<Option<WallClockHint>>>,
) {
    let block = vec![0u8; flash.sector_size()];
    let mut poster = Poster {
        config,
        clock,
        flash,
        writer: EventWriter::new(ring),
        wall_clock,
        block,
        last_time_event: None,
    };
    let mut holdoff = Duration::ZERO;

    loop {
        if !holdoff.is_zero() {
            tokio::time::sleep(holdoff).await;
        }
        let _ = timeout(poster.config.poll_interval, poster.flash.post_ready()).await;

        loop {
            if !poster.flash.maybe_block_to_post().await {
                break;
            }
            match poster.post_once().await {
                Ok(true) => {
                    holdoff = Duration::ZERO;
                }
                Ok(false) => break,
                Err(error) => {
                    holdoff = next_holdoff(holdoff, poster.config.holdoff_cap);
                    warn!(%error, holdoff_secs = holdoff.as_secs(), "Post failed; holding off.");
                    break;
                }
            }
        }
    }
}
