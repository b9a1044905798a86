//! Append-only framed files.
//!
//! Every durable file in a store is a journal: a 5-byte header (magic +
//! version) followed by frames of `[len: u32][msgpack body][crc32: u32]`.
//! Opening a journal replays all frames. A frame cut short by a crash at the
//! tail is truncated away; a frame whose checksum passes but whose body does
//! not decode is real corruption and fails the open.

use crate::error::{Result, StoreError};
use memmap2::Mmap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Header size (magic + version).
const HEADER_SIZE: usize = 5;

/// Frame overhead (length prefix + checksum).
const FRAME_OVERHEAD: usize = 8;

/// Sanity limit on one frame (bulk batches are a single frame).
const MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

struct JournalFile {
    writer: BufWriter<File>,
    /// End of the last complete frame.
    size: u64,
    writes_since_sync: u64,
    /// Set when a failed append could not be rolled back.
    broken: bool,
}

/// Append-only file of typed entries.
pub struct Journal<T> {
    path: PathBuf,
    magic: [u8; 4],
    file: Mutex<JournalFile>,
    /// Sync every N appends (1 = every append).
    sync_interval: u64,
    _marker: PhantomData<fn() -> T>,
}

/// What `open` found on disk.
pub struct Recovered<T> {
    pub entries: Vec<T>,
    /// Bytes cut from a torn tail, if any.
    pub truncated_bytes: u64,
}

impl<T: Serialize + DeserializeOwned> Journal<T> {
    /// Open or create a journal, replaying existing entries.
    pub fn open(
        path: impl AsRef<Path>,
        magic: &[u8; 4],
        sync_interval: u64,
    ) -> Result<(Self, Recovered<T>)> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let recovered = if len == 0 {
            file.write_all(magic)?;
            file.write_all(&[JOURNAL_VERSION])?;
            file.sync_all()?;
            Recovered {
                entries: Vec::new(),
                truncated_bytes: 0,
            }
        } else {
            // SAFETY: the store holds an exclusive lock on its directory, so no
            // other process mutates this file while the map is alive, and the
            // map is dropped before we write.
            let map = unsafe { Mmap::map(&file)? };
            let (entries, valid_len) = Self::decode(&map, magic)?;
            drop(map);

            let truncated_bytes = len - valid_len as u64;
            if truncated_bytes > 0 {
                warn!(
                    path = %path.display(),
                    truncated_bytes,
                    "Truncating torn tail of journal"
                );
                file.set_len(valid_len as u64)?;
                file.sync_all()?;
            }
            Recovered {
                entries,
                truncated_bytes,
            }
        };

        let size = file.seek(SeekFrom::End(0))?;
        debug!(path = %path.display(), entries = recovered.entries.len(), size, "Opened journal");

        Ok((
            Self {
                path,
                magic: *magic,
                file: Mutex::new(JournalFile {
                    writer: BufWriter::new(file),
                    size,
                    writes_since_sync: 0,
                    broken: false,
                }),
                sync_interval: sync_interval.max(1),
                _marker: PhantomData,
            },
            recovered,
        ))
    }

    /// Append one entry. Returns the offset it was written at.
    ///
    /// On failure the file is cut back to where the entry started, so a
    /// failed append leaves nothing behind.
    pub fn append(&self, entry: &T) -> Result<u64> {
        let frame = Self::encode(entry)?;
        let mut file = self.file.lock();
        if file.broken {
            return Err(StoreError::Corruption(format!(
                "journal {} has an unrecovered partial write",
                self.path.display()
            )));
        }

        let offset = file.size;
        if let Err(e) = self.write_frame(&mut file, &frame) {
            self.roll_back(&mut file, offset);
            return Err(e);
        }
        Ok(offset)
    }

    fn write_frame(&self, file: &mut JournalFile, frame: &[u8]) -> Result<()> {
        file.writer.write_all(frame)?;
        file.writer.flush()?;
        file.size += frame.len() as u64;

        file.writes_since_sync += 1;
        if file.writes_since_sync >= self.sync_interval {
            file.writer.get_ref().sync_data()?;
            file.writes_since_sync = 0;
        }
        Ok(())
    }

    /// Discard everything past `offset`, on disk or still buffered.
    fn roll_back(&self, file: &mut JournalFile, offset: u64) {
        match self.truncate_to(file, offset) {
            Ok(()) => warn!(path = %self.path.display(), offset, "Rolled back failed journal append"),
            Err(e) => {
                error!(path = %self.path.display(), offset, error = %e, "Failed to roll back journal append");
                file.broken = true;
            }
        }
    }

    fn truncate_to(&self, file: &mut JournalFile, offset: u64) -> Result<()> {
        let mut reopened = OpenOptions::new().write(true).open(&self.path)?;
        reopened.set_len(offset)?;
        reopened.seek(SeekFrom::Start(offset))?;

        let stale = std::mem::replace(&mut file.writer, BufWriter::new(reopened));
        // Unflushed bytes are dropped here rather than written on drop.
        let _ = stale.into_parts();
        file.size = offset;
        Ok(())
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut file = self.file.lock();
        file.writer.flush()?;
        file.writer.get_ref().sync_all()?;
        file.writes_since_sync = 0;
        Ok(())
    }

    /// Atomically replace the journal's contents with `entries`.
    ///
    /// Writes a sibling file, syncs it, then renames it over the journal.
    pub fn rewrite<'a, I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a T>,
        T: 'a,
    {
        let mut file = self.file.lock();
        file.writer.flush()?;

        let tmp_path = self.path.with_extension("compact");
        let mut tmp = BufWriter::new(
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?,
        );
        tmp.write_all(&self.magic)?;
        tmp.write_all(&[JOURNAL_VERSION])?;
        for entry in entries {
            tmp.write_all(&Self::encode(entry)?)?;
        }
        tmp.flush()?;
        tmp.get_ref().sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path)?;

        let mut reopened = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let size = reopened.seek(SeekFrom::End(0))?;
        file.writer = BufWriter::new(reopened);
        file.size = size;
        file.writes_since_sync = 0;
        file.broken = false;

        debug!(path = %self.path.display(), size, "Rewrote journal");
        Ok(())
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        self.file.lock().size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(entry: &T) -> Result<Vec<u8>> {
        let body = rmp_serde::to_vec(entry)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(StoreError::Serialization(format!(
                "Journal entry too large: {} bytes",
                body.len()
            )));
        }

        let mut frame = Vec::with_capacity(body.len() + FRAME_OVERHEAD);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        Ok(frame)
    }

    /// Decode all complete frames. Returns the entries and the length of the
    /// valid prefix of `bytes`.
    fn decode(bytes: &[u8], magic: &[u8; 4]) -> Result<(Vec<T>, usize)> {
        if bytes.len() < HEADER_SIZE {
            return Err(StoreError::InvalidFormat("Journal header too short".into()));
        }
        if &bytes[0..4] != magic {
            return Err(StoreError::InvalidFormat("Invalid journal magic".into()));
        }
        if bytes[4] != JOURNAL_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                bytes[4]
            )));
        }

        let mut entries = Vec::new();
        let mut offset = HEADER_SIZE;

        while offset + FRAME_OVERHEAD <= bytes.len() {
            let len_bytes: [u8; 4] = bytes[offset..offset + 4]
                .try_into()
                .map_err(|_| StoreError::Corruption("Bad frame length".into()))?;
            let len = u32::from_le_bytes(len_bytes) as usize;
            if len > MAX_FRAME_SIZE || offset + FRAME_OVERHEAD + len > bytes.len() {
                break;
            }

            let body = &bytes[offset + 4..offset + 4 + len];
            let crc_bytes: [u8; 4] = bytes[offset + 4 + len..offset + 8 + len]
                .try_into()
                .map_err(|_| StoreError::Corruption("Bad frame checksum".into()))?;
            let stored = u32::from_le_bytes(crc_bytes);
            let computed = crc32fast::hash(body);
            if stored != computed {
                // Only the final frame can be half-written.
                if offset + FRAME_OVERHEAD + len == bytes.len() {
                    warn!(offset, expected = stored, got = computed, "Journal checksum mismatch at tail");
                    break;
                }
                return Err(StoreError::ChecksumMismatch {
                    expected: stored,
                    got: computed,
                });
            }

            entries.push(rmp_serde::from_slice(body)?);
            offset += FRAME_OVERHEAD + len;
        }

        Ok((entries, offset))
    }
}
