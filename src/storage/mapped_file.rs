//! Memory-mapped segment files
//!
//! A [`MappedFile`] is one fixed-size, append-only segment of the commit
//! log, named by the 20-digit physical offset it starts at. Appends go
//! either straight into the mapped region or, when the transient pool is
//! enabled, into a pooled heap buffer that the commit service later moves
//! into the mapped region.
//!
//! Position invariants: `flushed <= committed <= wrote <= file_size`, and
//! readers only ever observe bytes below the read position (committed in
//! transient mode, wrote otherwise), published with release/acquire
//! ordering.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use memmap2::MmapRaw;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::OS_PAGE_SIZE;
use crate::error::{FlowlineError, Result};
use crate::storage::result::{AppendMessageResult, AppendMessageStatus};

/// Pool of pre-zeroed heap buffers for transient-mode appends
pub struct TransientStorePool {
    buffer_size: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl TransientStorePool {
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let buffers = (0..count).map(|_| vec![0u8; buffer_size]).collect();
        Self {
            buffer_size,
            buffers: Mutex::new(buffers),
        }
    }

    /// Lease a buffer; `None` when the pool is exhausted
    pub fn borrow_buffer(&self) -> Option<Vec<u8>> {
        self.buffers.lock().pop()
    }

    pub fn return_buffer(&self, mut buffer: Vec<u8>) {
        buffer.iter_mut().for_each(|b| *b = 0);
        self.buffers.lock().push(buffer);
    }

    pub fn available_buffers(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// Render a segment file name from its starting physical offset
pub fn offset_to_file_name(offset: i64) -> String {
    format!("{offset:020}")
}

/// Parse a segment file name back into its starting physical offset
pub fn file_name_to_offset(name: &str) -> Option<i64> {
    if name.len() != 20 {
        return None;
    }
    name.parse().ok()
}

/// One fixed-size mmap-backed segment
pub struct MappedFile {
    path: PathBuf,
    file_from_offset: i64,
    file_size: usize,
    mmap: MmapRaw,
    /// Staging buffer for transient-mode appends; returned to the pool once
    /// the segment is fully committed
    write_buffer: Mutex<Option<Vec<u8>>>,
    has_write_buffer: AtomicBool,
    pool: Option<Arc<TransientStorePool>>,
    wrote_position: AtomicUsize,
    committed_position: AtomicUsize,
    flushed_position: AtomicUsize,
    /// Store timestamp of the last appended record
    store_timestamp: AtomicI64,
    available: AtomicBool,
}

impl MappedFile {
    /// Open or create the segment at `path`, sized to exactly `file_size`
    pub fn open(
        path: impl Into<PathBuf>,
        file_from_offset: i64,
        file_size: usize,
        pool: Option<&Arc<TransientStorePool>>,
    ) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(file_size as u64)?;

        // SAFETY: the file length was just set to cover the whole mapping,
        // and the mapping stays valid after the handle drops.
        let mmap = MmapRaw::map_raw(&file)?;

        let write_buffer = match pool {
            Some(pool) => {
                let buffer = pool.borrow_buffer().ok_or_else(|| {
                    FlowlineError::storage_op(
                        "borrow transient buffer",
                        "pool exhausted",
                    )
                })?;
                if buffer.len() < file_size {
                    return Err(FlowlineError::storage_op(
                        "borrow transient buffer",
                        "buffer smaller than segment",
                    ));
                }
                Some(buffer)
            }
            None => None,
        };

        Ok(Self {
            path,
            file_from_offset,
            file_size,
            mmap,
            has_write_buffer: AtomicBool::new(write_buffer.is_some()),
            write_buffer: Mutex::new(write_buffer),
            pool: pool.cloned(),
            wrote_position: AtomicUsize::new(0),
            committed_position: AtomicUsize::new(0),
            flushed_position: AtomicUsize::new(0),
            store_timestamp: AtomicI64::new(0),
            available: AtomicBool::new(true),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_from_offset(&self) -> i64 {
        self.file_from_offset
    }

    pub fn file_size(&self) -> usize {
        self.file_size
    }

    pub fn wrote_position(&self) -> usize {
        self.wrote_position.load(Ordering::Acquire)
    }

    pub fn committed_position(&self) -> usize {
        self.committed_position.load(Ordering::Acquire)
    }

    pub fn flushed_position(&self) -> usize {
        self.flushed_position.load(Ordering::Acquire)
    }

    pub fn store_timestamp(&self) -> i64 {
        self.store_timestamp.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.wrote_position() == self.file_size
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn mark_unavailable(&self) {
        self.available.store(false, Ordering::Release);
    }

    /// Position up to which readers may observe bytes
    pub fn read_position(&self) -> usize {
        if self.has_write_buffer.load(Ordering::Acquire) {
            self.committed_position()
        } else {
            self.wrote_position()
        }
    }

    /// Force all positions, used by load and truncation
    pub fn set_positions(&self, pos: usize) {
        self.wrote_position.store(pos, Ordering::Release);
        self.committed_position.store(pos, Ordering::Release);
        self.flushed_position.store(pos, Ordering::Release);
    }

    /// Append one record (or a pre-encoded batch) through a serializer
    /// callback
    ///
    /// The callback receives the segment's starting physical offset, the
    /// current write position and the free tail region, and returns how
    /// many bytes it wrote. Must only be called while holding the append
    /// lock.
    pub fn append_message<F>(&self, serialize: F) -> AppendMessageResult
    where
        F: FnOnce(i64, usize, &mut [u8]) -> AppendMessageResult,
    {
        let current_pos = self.wrote_position();
        if current_pos >= self.file_size {
            warn!(
                pos = current_pos,
                file = %self.path.display(),
                "append past segment end"
            );
            return AppendMessageResult::status_only(AppendMessageStatus::UnknownError);
        }

        let result =
            self.with_free_region(current_pos, |region| {
                serialize(self.file_from_offset, current_pos, region)
            });

        if result.store_timestamp > 0 {
            self.store_timestamp
                .store(result.store_timestamp, Ordering::Release);
        }
        self.wrote_position
            .store(current_pos + result.wrote_bytes as usize, Ordering::Release);
        result
    }

    /// Append raw pre-formatted bytes (replication ingress); false when the
    /// data does not fit
    pub fn append_raw(&self, data: &[u8]) -> bool {
        let current_pos = self.wrote_position();
        if current_pos + data.len() > self.file_size {
            return false;
        }
        self.with_free_region(current_pos, |region| {
            region[..data.len()].copy_from_slice(data);
        });
        self.wrote_position
            .store(current_pos + data.len(), Ordering::Release);
        true
    }

    fn with_free_region<R>(&self, pos: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.write_buffer.lock();
        if let Some(buffer) = guard.as_mut() {
            return f(&mut buffer[pos..self.file_size]);
        }
        drop(guard);

        // SAFETY: the append lock serializes all writers, the range is in
        // bounds, and readers never dereference bytes at or past the write
        // position until it is published with Release ordering.
        let region = unsafe {
            std::slice::from_raw_parts_mut(self.mmap.as_mut_ptr().add(pos), self.file_size - pos)
        };
        f(region)
    }

    fn is_able_to_flush(&self, least_pages: usize) -> bool {
        let flushed = self.flushed_position();
        let write = self.read_position();
        if self.is_full() {
            return write > flushed;
        }
        if least_pages > 0 {
            (write / OS_PAGE_SIZE).saturating_sub(flushed / OS_PAGE_SIZE) >= least_pages
        } else {
            write > flushed
        }
    }

    /// Sync readable bytes to disk; returns the new flushed position
    pub fn flush(&self, least_pages: usize) -> usize {
        if self.is_able_to_flush(least_pages) {
            let value = self.read_position();
            let flushed = self.flushed_position();
            if value > flushed {
                // msync wants a page-aligned start
                let aligned = flushed - (flushed % OS_PAGE_SIZE);
                if let Err(e) = self.mmap.flush_range(aligned, value - aligned) {
                    warn!(error = %e, file = %self.path.display(), "flush failed");
                    return flushed;
                }
            }
            self.flushed_position.store(value, Ordering::Release);
            return value;
        }
        self.flushed_position()
    }

    fn is_able_to_commit(&self, least_pages: usize) -> bool {
        let committed = self.committed_position();
        let wrote = self.wrote_position();
        if self.is_full() {
            return wrote > committed;
        }
        if least_pages > 0 {
            (wrote / OS_PAGE_SIZE).saturating_sub(committed / OS_PAGE_SIZE) >= least_pages
        } else {
            wrote > committed
        }
    }

    /// Move transient-buffer bytes into the mapped region; returns the new
    /// committed position. Without a transient buffer this is a no-op that
    /// tracks the write position.
    pub fn commit(&self, least_pages: usize) -> usize {
        let mut guard = self.write_buffer.lock();
        let Some(buffer) = guard.as_ref() else {
            return self.wrote_position();
        };

        if self.is_able_to_commit(least_pages) {
            let wrote = self.wrote_position();
            let committed = self.committed_position();
            if wrote > committed {
                // SAFETY: range is in bounds; the commit service is the
                // only writer into the mapped region in transient mode.
                unsafe {
                    ptr::copy_nonoverlapping(
                        buffer.as_ptr().add(committed),
                        self.mmap.as_mut_ptr().add(committed),
                        wrote - committed,
                    );
                }
                self.committed_position.store(wrote, Ordering::Release);
            }
        }

        let committed = self.committed_position();
        if committed == self.file_size {
            // segment fully committed; hand the buffer back to the pool
            if let Some(buffer) = guard.take() {
                self.has_write_buffer.store(false, Ordering::Release);
                if let Some(pool) = &self.pool {
                    pool.return_buffer(buffer);
                }
            }
        }
        committed
    }

    /// Borrow the readable bytes from `pos` to the current read position
    pub fn slice_from(self: &Arc<Self>, pos: usize) -> Option<MappedBuffer> {
        let read_pos = self.read_position();
        if pos < read_pos {
            Some(MappedBuffer {
                mapped_file: Arc::clone(self),
                pos,
                size: read_pos - pos,
            })
        } else {
            None
        }
    }

    /// Borrow exactly `size` readable bytes starting at `pos`
    pub fn slice_from_size(self: &Arc<Self>, pos: usize, size: usize) -> Option<MappedBuffer> {
        if pos + size <= self.read_position() {
            Some(MappedBuffer {
                mapped_file: Arc::clone(self),
                pos,
                size,
            })
        } else {
            None
        }
    }

    /// Delete the backing file; outstanding slices keep the mapping alive
    /// until dropped
    pub fn destroy(&self) -> Result<()> {
        self.mark_unavailable();
        std::fs::remove_file(&self.path)?;
        info!(file = %self.path.display(), "destroyed segment file");
        Ok(())
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("file_from_offset", &self.file_from_offset)
            .field("file_size", &self.file_size)
            .field("wrote_position", &self.wrote_position())
            .field("committed_position", &self.committed_position())
            .field("flushed_position", &self.flushed_position())
            .finish()
    }
}

/// Reference-counted zero-copy view into a segment
///
/// The view keeps its segment alive; dropping it releases the reference.
pub struct MappedBuffer {
    mapped_file: Arc<MappedFile>,
    pos: usize,
    size: usize,
}

impl MappedBuffer {
    /// Physical offset of the first byte of this view
    pub fn start_offset(&self) -> i64 {
        self.mapped_file.file_from_offset + self.pos as i64
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the range was validated against the read position when
        // this view was created, bytes below the read position are never
        // rewritten, and the Arc keeps the mapping alive.
        unsafe {
            std::slice::from_raw_parts(self.mapped_file.mmap.as_ptr().add(self.pos), self.size)
        }
    }
}
