//! The sector storage seam.
//!
//! [`FlashMedia`] is the interface the flash ring drives: erase-block
//! granularity, in-place programming that only clears bits, and reads at
//! arbitrary offsets.  Parameterizing the media keeps the ring logic
//! independent of where the sectors actually live: a file on the host, or
//! plain memory with fault injection for tests.

use std::{collections::VecDeque, io, path::Path, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use snafu::{IntoError, ResultExt, Snafu};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Error from a media operation.
#[derive(Debug, Snafu)]
pub enum MediaError {
    /// The request addressed bytes outside the sector region.
    #[snafu(display("sector {} out of bounds for operation '{}'", sector, op))]
    OutOfBounds { sector: u32, op: &'static str },

    /// The underlying storage failed.
    #[snafu(display("media I/O failed on sector {}: {}", sector, source))]
    Io { sector: u32, source: io::Error },
}

/// Erase-block storage for the flash ring.
///
/// Implementations must honor the single-program-per-cell discipline of NOR
/// flash: programming can only flip bits from one to zero, and only an erase
/// returns a sector to all-ones.  The flash ring relies on this to rewrite a
/// partially filled sector in place.
#[async_trait]
pub trait FlashMedia: Send + Sync + 'static {
    /// Size of one erase block, in bytes.
    fn sector_size(&self) -> usize;

    /// Number of erase blocks in the region.
    fn sector_count(&self) -> u32;

    /// Reads `out.len()` bytes starting at `offset` within `sector`.
    async fn read(&self, sector: u32, offset: usize, out: &mut [u8]) -> Result<(), MediaError>;

    /// Programs `data` starting at `offset` within `sector`.
    ///
    /// Bits already at zero stay at zero regardless of `data`.
    async fn program(&self, sector: u32, offset: usize, data: &[u8]) -> Result<(), MediaError>;

    /// Erases `sector` back to all-ones.
    async fn erase(&self, sector: u32) -> Result<(), MediaError>;
}

#[async_trait]
impl<M> FlashMedia for Arc<M>
where
    M: FlashMedia + ?Sized,
{
    fn sector_size(&self) -> usize {
        (**self).sector_size()
    }

    fn sector_count(&self) -> u32 {
        (**self).sector_count()
    }

    async fn read(&self, sector: u32, offset: usize, out: &mut [u8]) -> Result<(), MediaError> {
        (**self).read(sector, offset, out).await
    }

    async fn program(&self, sector: u32, offset: usize, data: &[u8]) -> Result<(), MediaError> {
        (**self).program(sector, offset, data).await
    }

    async fn erase(&self, sector: u32) -> Result<(), MediaError> {
        (**self).erase(sector).await
    }
}

fn check_bounds(
    sector: u32,
    offset: usize,
    len: usize,
    sector_size: usize,
    sector_count: u32,
    op: &'static str,
) -> Result<(), MediaError> {
    if sector >= sector_count || offset + len > sector_size {
        return OutOfBoundsSnafu { sector, op }.fail();
    }
    Ok(())
}

/// File-backed sector storage.
///
/// The whole region lives in one file, one sector after another.  Programming
/// preserves NOR semantics by AND-ing the new bytes over what is already
/// stored, so the file behaves exactly like the part it stands in for.
#[derive(Debug)]
pub struct FileFlash {
    file: tokio::sync::Mutex<tokio::fs::File>,
    sector_size: usize,
    sector_count: u32,
}

impl FileFlash {
    /// Opens (or creates) the backing file, extending it with erased sectors
    /// to the full region size.
    pub async fn open<P: AsRef<Path>>(
        path: P,
        sector_size: usize,
        sector_count: u32,
    ) -> Result<Self, MediaError> {
        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())
            .await
            .context(IoSnafu { sector: 0u32 })?;

        let total = sector_size as u64 * u64::from(sector_count);
        let len = file
            .metadata()
            .await
            .context(IoSnafu { sector: 0u32 })?
            .len();
        if len < total {
            file.seek(io::SeekFrom::Start(len))
                .await
                .context(IoSnafu { sector: 0u32 })?;
            let blank = vec![0xffu8; sector_size];
            let mut remaining = total - len;
            while remaining > 0 {
                let chunk = remaining.min(blank.len() as u64) as usize;
                file.write_all(&blank[..chunk])
                    .await
                    .context(IoSnafu { sector: 0u32 })?;
                remaining -= chunk as u64;
            }
            file.sync_all().await.context(IoSnafu { sector: 0u32 })?;
        }

        Ok(Self {
            file: tokio::sync::Mutex::new(file),
            sector_size,
            sector_count,
        })
    }

    fn position(&self, sector: u32, offset: usize) -> u64 {
        u64::from(sector) * self.sector_size as u64 + offset as u64
    }
}

#[async_trait]
impl FlashMedia for FileFlash {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u32 {
        self.sector_count
    }

    async fn read(&self, sector: u32, offset: usize, out: &mut [u8]) -> Result<(), MediaError> {
        check_bounds(
            sector,
            offset,
            out.len(),
            self.sector_size,
            self.sector_count,
            "read",
        )?;
        let mut file = self.file.lock().await;
        file.seek(io::SeekFrom::Start(self.position(sector, offset)))
            .await
            .context(IoSnafu { sector })?;
        file.read_exact(out).await.context(IoSnafu { sector })?;
        Ok(())
    }

    async fn program(&self, sector: u32, offset: usize, data: &[u8]) -> Result<(), MediaError> {
        check_bounds(
            sector,
            offset,
            data.len(),
            self.sector_size,
            self.sector_count,
            "program",
        )?;
        let mut file = self.file.lock().await;
        let position = self.position(sector, offset);

        let mut current = vec![0u8; data.len()];
        file.seek(io::SeekFrom::Start(position))
            .await
            .context(IoSnafu { sector })?;
        file.read_exact(&mut current)
            .await
            .context(IoSnafu { sector })?;
        for (stored, new) in current.iter_mut().zip(data) {
            *stored &= new;
        }

        file.seek(io::SeekFrom::Start(position))
            .await
            .context(IoSnafu { sector })?;
        file.write_all(&current).await.context(IoSnafu { sector })?;
        file.sync_data().await.context(IoSnafu { sector })?;
        Ok(())
    }

    async fn erase(&self, sector: u32) -> Result<(), MediaError> {
        check_bounds(sector, 0, 0, self.sector_size, self.sector_count, "erase")?;
        let mut file = self.file.lock().await;
        file.seek(io::SeekFrom::Start(self.position(sector, 0)))
            .await
            .context(IoSnafu { sector })?;
        let blank = vec![0xffu8; self.sector_size];
        file.write_all(&blank).await.context(IoSnafu { sector })?;
        file.sync_data().await.context(IoSnafu { sector })?;
        Ok(())
    }
}

/// Which media operation a fault should hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOp {
    Read,
    Program,
    Erase,
}

/// How an injected fault manifests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// The operation reports failure.
    Error,
    /// The operation reports success but changes nothing, the way a worn
    /// sector fails a later verify.
    SilentDrop,
}

#[derive(Debug)]
struct Fault {
    op: FaultOp,
    sector: u32,
    kind: FaultKind,
    remaining: u32,
    /// Only trips for operations touching at least this many bytes, so a
    /// test can fail a full-sector read while the short index probe at the
    /// front still succeeds.
    min_len: usize,
}

#[derive(Debug)]
struct MemoryInner {
    sectors: Vec<Vec<u8>>,
    faults: VecDeque<Fault>,
}

impl MemoryInner {
    /// Consumes a matching fault, if armed.
    fn take_fault(&mut self, op: FaultOp, sector: u32, len: usize) -> Option<FaultKind> {
        let slot = self
            .faults
            .iter()
            .position(|f| f.op == op && f.sector == sector && f.remaining > 0 && len >= f.min_len)?;
        let fault = &mut self.faults[slot];
        fault.remaining -= 1;
        let kind = fault.kind;
        if fault.remaining == 0 {
            self.faults.remove(slot);
        }
        Some(kind)
    }
}

/// In-memory sector storage with NOR semantics and fault injection.
///
/// This is the media used throughout the test suite: it behaves exactly like
/// the real part (programming ANDs bits, erase restores all-ones) and can be
/// told to fail specific operations on specific sectors to drive the
/// recovery paths.
#[derive(Debug)]
pub struct MemoryFlash {
    sector_size: usize,
    inner: Mutex<MemoryInner>,
}

impl MemoryFlash {
    pub fn new(sector_size: usize, sector_count: u32) -> Self {
        Self {
            sector_size,
            inner: Mutex::new(MemoryInner {
                sectors: (0..sector_count)
                    .map(|_| vec![0xff; sector_size])
                    .collect(),
                faults: VecDeque::new(),
            }),
        }
    }

    /// Arms a fault: the next `count` matching operations misbehave.
    pub fn inject_fault(&self, op: FaultOp, sector: u32, kind: FaultKind, count: u32) {
        self.inject_fault_min_len(op, sector, kind, count, 0);
    }

    /// Arms a fault that only trips for operations of at least `min_len`
    /// bytes.
    pub fn inject_fault_min_len(
        &self,
        op: FaultOp,
        sector: u32,
        kind: FaultKind,
        count: u32,
        min_len: usize,
    ) {
        self.inner.lock().faults.push_back(Fault {
            op,
            sector,
            kind,
            remaining: count,
            min_len,
        });
    }

    /// Copies a sector's raw contents out, bypassing fault injection.
    pub fn raw_sector(&self, sector: u32) -> Vec<u8> {
        self.inner.lock().sectors[sector as usize].clone()
    }

    /// Overwrites raw bytes directly, bypassing NOR semantics and faults.
    ///
    /// Test setup only: lets a test lay down arbitrary sector contents,
    /// including patterns a real program cycle could not produce.
    pub fn write_raw(&self, sector: u32, offset: usize, data: &[u8]) {
        let mut inner = self.inner.lock();
        inner.sectors[sector as usize][offset..offset + data.len()].copy_from_slice(data);
    }
}

#[async_trait]
impl FlashMedia for MemoryFlash {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u32 {
        self.inner.lock().sectors.len() as u32
    }

    async fn read(&self, sector: u32, offset: usize, out: &mut [u8]) -> Result<(), MediaError> {
        let mut inner = self.inner.lock();
        check_bounds(
            sector,
            offset,
            out.len(),
            self.sector_size,
            inner.sectors.len() as u32,
            "read",
        )?;
        match inner.take_fault(FaultOp::Read, sector, out.len()) {
            Some(FaultKind::Error) => {
                return Err(IoSnafu { sector }
                    .into_error(io::Error::new(io::ErrorKind::Other, "injected read fault")));
            }
            Some(FaultKind::SilentDrop) | None => {}
        }
        out.copy_from_slice(&inner.sectors[sector as usize][offset..offset + out.len()]);
        Ok(())
    }

    async fn program(&self, sector: u32, offset: usize, data: &[u8]) -> Result<(), MediaError> {
        let mut inner = self.inner.lock();
        check_bounds(
            sector,
            offset,
            data.len(),
            self.sector_size,
            inner.sectors.len() as u32,
            "program",
        )?;
        match inner.take_fault(FaultOp::Program, sector, data.len()) {
            Some(FaultKind::Error) => {
                return Err(IoSnafu { sector }
                    .into_error(io::Error::new(io::ErrorKind::Other, "injected program fault")));
            }
            Some(FaultKind::SilentDrop) => return Ok(()),
            None => {}
        }
        let stored = &mut inner.sectors[sector as usize][offset..offset + data.len()];
        for (cell, new) in stored.iter_mut().zip(data) {
            *cell &= new;
        }
        Ok(())
    }

    async fn erase(&self, sector: u32) -> Result<(), MediaError> {
        let mut inner = self.inner.lock();
        check_bounds(
            sector,
            0,
            0,
            self.sector_size,
            inner.sectors.len() as u32,
            "erase",
        )?;
        match inner.take_fault(FaultOp::Erase, sector, self.sector_size) {
            Some(FaultKind::Error) => {
                return Err(IoSnafu { sector }
                    .into_error(io::Error::new(io::ErrorKind::Other, "injected erase fault")));
            }
            Some(FaultKind::SilentDrop) => return Ok(()),
            None => {}
        }
        inner.sectors[sector as usize].fill(0xff);
        Ok(())
    }
}
