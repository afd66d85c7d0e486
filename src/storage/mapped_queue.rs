//! Ordered queue of mapped segment files
//!
//! The queue owns the segment list: loading existing files at startup,
//! growing the tail on demand, locating a segment by physical offset,
//! fanning flush/commit calls into the right segment and tracking the
//! global `flushed_where` / `committed_where` watermarks.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::storage::mapped_file::{
    file_name_to_offset, offset_to_file_name, MappedFile, TransientStorePool,
};

pub struct MappedFileQueue {
    store_path: PathBuf,
    mapped_file_size: usize,
    mapped_files: RwLock<Vec<Arc<MappedFile>>>,
    flushed_where: AtomicI64,
    committed_where: AtomicI64,
    /// Store timestamp of the newest record known flushed
    store_timestamp: AtomicI64,
    transient_pool: Option<Arc<TransientStorePool>>,
}

impl MappedFileQueue {
    pub fn new(
        store_path: impl Into<PathBuf>,
        mapped_file_size: usize,
        transient_pool: Option<Arc<TransientStorePool>>,
    ) -> Self {
        Self {
            store_path: store_path.into(),
            mapped_file_size,
            mapped_files: RwLock::new(Vec::new()),
            flushed_where: AtomicI64::new(0),
            committed_where: AtomicI64::new(0),
            store_timestamp: AtomicI64::new(0),
            transient_pool,
        }
    }

    pub fn mapped_file_size(&self) -> usize {
        self.mapped_file_size
    }

    pub fn flushed_where(&self) -> i64 {
        self.flushed_where.load(Ordering::Acquire)
    }

    pub fn set_flushed_where(&self, offset: i64) {
        self.flushed_where.store(offset, Ordering::Release);
    }

    pub fn committed_where(&self) -> i64 {
        self.committed_where.load(Ordering::Acquire)
    }

    pub fn set_committed_where(&self, offset: i64) {
        self.committed_where.store(offset, Ordering::Release);
    }

    pub fn store_timestamp(&self) -> i64 {
        self.store_timestamp.load(Ordering::Acquire)
    }

    /// Map every segment file already on disk
    ///
    /// Positions are set write-complete; recovery decides the real
    /// truncation point afterwards.
    pub fn load(&self) -> bool {
        let entries = match std::fs::read_dir(&self.store_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
            Err(e) => {
                error!(path = %self.store_path.display(), error = %e, "read store dir failed");
                return false;
            }
        };

        let mut names: Vec<(i64, PathBuf)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            match name.to_str().and_then(file_name_to_offset) {
                Some(offset) => names.push((offset, path)),
                None => {
                    warn!(file = %path.display(), "skipping non-segment file in store dir");
                }
            }
        }
        names.sort_by_key(|(offset, _)| *offset);

        let mut files = self.mapped_files.write();
        for (offset, path) in names {
            match std::fs::metadata(&path) {
                Ok(meta) if meta.len() as usize != self.mapped_file_size => {
                    warn!(
                        file = %path.display(),
                        len = meta.len(),
                        expected = self.mapped_file_size,
                        "segment length does not match configured size"
                    );
                    return false;
                }
                Err(e) => {
                    error!(file = %path.display(), error = %e, "stat segment failed");
                    return false;
                }
                _ => {}
            }

            match MappedFile::open(
                &path,
                offset,
                self.mapped_file_size,
                self.transient_pool.as_ref(),
            ) {
                Ok(file) => {
                    file.set_positions(self.mapped_file_size);
                    info!(file = %path.display(), "loaded segment");
                    files.push(Arc::new(file));
                }
                Err(e) => {
                    error!(file = %path.display(), error = %e, "map segment failed");
                    return false;
                }
            }
        }
        true
    }

    pub fn get_first_mapped_file(&self) -> Option<Arc<MappedFile>> {
        self.mapped_files.read().first().cloned()
    }

    pub fn get_last_mapped_file(&self) -> Option<Arc<MappedFile>> {
        self.mapped_files.read().last().cloned()
    }

    /// Tail segment with room, creating one starting at `start_offset`
    /// rounded down to a segment boundary when the queue is empty or full.
    /// `None` when allocation fails.
    pub fn get_last_mapped_file_or_create(&self, start_offset: i64) -> Option<Arc<MappedFile>> {
        let mut create_offset = -1i64;
        {
            let files = self.mapped_files.read();
            match files.last() {
                None => {
                    create_offset = start_offset - (start_offset % self.mapped_file_size as i64);
                }
                Some(last) if last.is_full() => {
                    create_offset = last.file_from_offset() + self.mapped_file_size as i64;
                }
                Some(last) => return Some(Arc::clone(last)),
            }
        }

        if create_offset < 0 {
            return None;
        }
        self.create_mapped_file(create_offset)
    }

    fn create_mapped_file(&self, create_offset: i64) -> Option<Arc<MappedFile>> {
        if let Err(e) = std::fs::create_dir_all(&self.store_path) {
            error!(path = %self.store_path.display(), error = %e, "create store dir failed");
            return None;
        }
        let path = self.store_path.join(offset_to_file_name(create_offset));
        match MappedFile::open(
            &path,
            create_offset,
            self.mapped_file_size,
            self.transient_pool.as_ref(),
        ) {
            Ok(file) => {
                let file = Arc::new(file);
                self.mapped_files.write().push(Arc::clone(&file));
                info!(file = %path.display(), "created segment");
                Some(file)
            }
            Err(e) => {
                error!(file = %path.display(), error = %e, "create segment failed");
                None
            }
        }
    }

    /// Locate the segment containing `offset`
    ///
    /// Out-of-range offsets return the first segment when
    /// `return_first_on_not_found` is set (the caller is resynchronizing
    /// from the log start), otherwise `None`.
    pub fn find_mapped_file_by_offset(
        &self,
        offset: i64,
        return_first_on_not_found: bool,
    ) -> Option<Arc<MappedFile>> {
        let files = self.mapped_files.read();
        let first = files.first()?;

        let index = (offset / self.mapped_file_size as i64)
            - (first.file_from_offset() / self.mapped_file_size as i64);
        if index >= 0 {
            if let Some(file) = files.get(index as usize) {
                if offset >= file.file_from_offset()
                    && offset < file.file_from_offset() + self.mapped_file_size as i64
                {
                    return Some(Arc::clone(file));
                }
            }
        }

        // deleted-segment holes make the index math miss; fall back to a scan
        for file in files.iter() {
            if offset >= file.file_from_offset()
                && offset < file.file_from_offset() + self.mapped_file_size as i64
            {
                return Some(Arc::clone(file));
            }
        }

        if return_first_on_not_found {
            return Some(Arc::clone(first));
        }
        None
    }

    /// First physical offset still present in the queue, -1 when empty
    pub fn min_offset(&self) -> i64 {
        self.get_first_mapped_file()
            .map(|f| f.file_from_offset())
            .unwrap_or(-1)
    }

    /// Physical offset one past the last readable byte
    pub fn max_offset(&self) -> i64 {
        self.get_last_mapped_file()
            .map(|f| f.file_from_offset() + f.read_position() as i64)
            .unwrap_or(0)
    }

    /// Physical offset one past the last written byte
    pub fn max_wrote_position(&self) -> i64 {
        self.get_last_mapped_file()
            .map(|f| f.file_from_offset() + f.wrote_position() as i64)
            .unwrap_or(0)
    }

    pub fn remain_how_many_data_to_commit(&self) -> i64 {
        self.max_wrote_position() - self.committed_where()
    }

    pub fn remain_how_many_data_to_flush(&self) -> i64 {
        self.max_offset() - self.flushed_where()
    }

    /// Flush the segment holding the flush watermark; true when the
    /// watermark advanced
    pub fn flush(&self, least_pages: usize) -> bool {
        let flushed_where = self.flushed_where();
        let Some(file) = self.find_mapped_file_by_offset(flushed_where, flushed_where == 0)
        else {
            return false;
        };

        let timestamp = file.store_timestamp();
        let position = file.flush(least_pages);
        let where_ = file.file_from_offset() + position as i64;
        let progressed = where_ != flushed_where;
        self.set_flushed_where(where_);
        if progressed && timestamp > 0 {
            self.store_timestamp.store(timestamp, Ordering::Release);
        }
        progressed
    }

    /// Commit the segment holding the commit watermark; true when the
    /// watermark advanced
    pub fn commit(&self, least_pages: usize) -> bool {
        let committed_where = self.committed_where();
        let Some(file) = self.find_mapped_file_by_offset(committed_where, committed_where == 0)
        else {
            return false;
        };

        let position = file.commit(least_pages);
        let where_ = file.file_from_offset() + position as i64;
        let progressed = where_ != committed_where;
        self.set_committed_where(where_);
        progressed
    }

    /// Drop or rewind segments holding bytes past `offset`
    pub fn truncate_dirty_files(&self, offset: i64) {
        let mut files = self.mapped_files.write();
        files.retain(|file| {
            let tail = file.file_from_offset() + self.mapped_file_size as i64;
            if tail <= offset {
                return true;
            }
            if offset >= file.file_from_offset() {
                file.set_positions((offset % self.mapped_file_size as i64) as usize);
                true
            } else {
                if let Err(e) = file.destroy() {
                    warn!(error = %e, "destroy truncated segment failed");
                }
                false
            }
        });
    }

    /// Rewind the queue so the next append lands at `offset`; refuses
    /// rewinds further back than two segments from the tail
    pub fn reset_offset(&self, offset: i64) -> bool {
        let mut files = self.mapped_files.write();
        let Some(last) = files.last() else {
            return false;
        };

        let last_offset = last.file_from_offset() + last.wrote_position() as i64;
        let diff = last_offset - offset;
        if diff < 0 || diff > 2 * self.mapped_file_size as i64 {
            return false;
        }

        while let Some(file) = files.last() {
            if file.file_from_offset() <= offset {
                file.set_positions((offset % self.mapped_file_size as i64) as usize);
                break;
            }
            if let Err(e) = file.destroy() {
                warn!(error = %e, "destroy reset segment failed");
            }
            files.pop();
        }
        self.set_flushed_where(offset);
        self.set_committed_where(offset);
        true
    }

    /// Delete whole segments whose backing file has not been modified for
    /// `expired_ms`, oldest first, never the active tail. Returns how many
    /// were removed.
    pub fn delete_expired_files_by_time(
        &self,
        expired_ms: i64,
        delete_files_interval_ms: u64,
        clean_immediately: bool,
    ) -> usize {
        let snapshot: Vec<Arc<MappedFile>> = {
            let files = self.mapped_files.read();
            if files.len() <= 1 {
                return 0;
            }
            files[..files.len() - 1].to_vec()
        };

        let now = crate::storage::now_millis();
        let mut deleted = Vec::new();
        for file in snapshot {
            let modified = file
                .path()
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);

            if now >= modified + expired_ms || clean_immediately {
                if let Err(e) = file.destroy() {
                    warn!(error = %e, "destroy expired segment failed");
                    break;
                }
                deleted.push(file.file_from_offset());
                if delete_files_interval_ms > 0 {
                    std::thread::sleep(Duration::from_millis(delete_files_interval_ms));
                }
            } else {
                break;
            }
        }

        if !deleted.is_empty() {
            let mut files = self.mapped_files.write();
            files.retain(|f| !deleted.contains(&f.file_from_offset()));
        }
        deleted.len()
    }

    /// Remove the first segment once readers have let go of it
    pub fn retry_delete_first_file(&self) -> bool {
        let Some(first) = self.get_first_mapped_file() else {
            return false;
        };
        if first.is_available() {
            return false;
        }
        match first.destroy() {
            Ok(()) => {
                let mut files = self.mapped_files.write();
                if !files.is_empty() {
                    files.remove(0);
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "retry delete first segment failed");
                false
            }
        }
    }

    /// Delete every segment
    pub fn destroy(&self) {
        let mut files = self.mapped_files.write();
        for file in files.iter() {
            if let Err(e) = file.destroy() {
                warn!(error = %e, "destroy segment failed");
            }
        }
        files.clear();
        self.set_flushed_where(0);
        self.set_committed_where(0);
    }

    /// Snapshot of the current segment list
    pub fn mapped_files(&self) -> Vec<Arc<MappedFile>> {
        self.mapped_files.read().clone()
    }
}
