//! File-backed block device
//!
//! Serves bios from a regular file with positional reads and writes, so any
//! number of bio queue threads can use it at once without a shared cursor.
//! Completions run inline on the submitting thread.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{BlockDevice, DeviceError, IoStatus, SubmittedBio};
use crate::bio::{Bio, BioOp, Sector, SECTOR_SIZE};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct FileDevice {
    name: String,
    path: PathBuf,
    file: File,
    capacity: Sector,
}

impl FileDevice {
    /// Open (creating if needed) `path` as a device of `capacity` sectors.
    /// The file is extended to the full size but never truncated.
    pub fn open(path: impl AsRef<Path>, capacity: Sector) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let bytes = capacity
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or_else(|| Error::Config(format!("device capacity {} sectors overflows", capacity)))?;
        if file.metadata()?.len() < bytes {
            file.set_len(bytes)?;
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        info!(device = %name, path = %path.display(), capacity, "file device opened");
        Ok(Self {
            name,
            path,
            file,
            capacity,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> Sector {
        self.capacity
    }

    fn execute(&self, bio: &mut Bio) -> IoStatus {
        if bio.op() == BioOp::Flush {
            return self.file.sync_data().map_err(DeviceError::from);
        }
        if bio.flags().preflush {
            self.file.sync_data()?;
        }

        let end = bio.sector().checked_add(u64::from(bio.sectors()));
        if !matches!(end, Some(end) if end <= self.capacity) {
            return Err(DeviceError::OutOfRange {
                sector: bio.sector(),
                sectors: bio.sectors(),
                capacity: self.capacity,
            });
        }

        let offset = bio.sector() * SECTOR_SIZE as u64;
        match bio.op() {
            BioOp::Read => self.file.read_exact_at(bio.data_mut(), offset)?,
            BioOp::Write => self.file.write_all_at(bio.data(), offset)?,
            BioOp::Discard => {
                let zeroes = vec![0u8; bio.len_bytes()];
                self.file.write_all_at(&zeroes, offset)?;
            }
            BioOp::Flush => {}
        }

        if bio.flags().fua {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

impl BlockDevice for FileDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, mut bio: SubmittedBio) {
        let status = self.execute(bio.bio_mut());
        if let Err(err) = &status {
            debug!(device = %self.name, sector = bio.bio().sector(), error = %err, "bio failed");
        }
        bio.complete(status);
    }
}
