// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    os::unix::fs::FileExt,
    path::Path,
};

use log::debug;
use myfatfs_ds::{check_bounds, DataStorage, BLOCK_SIZE, TOTAL_BYTES};
use myfatfs_err::Result;

/// A [`DataStorage`] backed by a plain file, opened read-write.
///
/// No caching: every `read`/`write` goes straight to the file via positional
/// I/O, so concurrent handles to the same path observe each other's writes
/// immediately (there is, deliberately, no guarantee about concurrent
/// *callers* of this engine — see the crate-level Non-goals).
pub struct FileDataStorage {
    file: File,
}

impl FileDataStorage {
    /// Opens an existing image file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        debug!("opened image");
        Ok(Self { file })
    }

    /// Creates a new, exactly `TOTAL_BYTES`-sized, zero-filled image file.
    ///
    /// Truncates and overwrites any existing file at `path`.
    pub fn create_image(path: impl AsRef<Path>) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let zeros = [0u8; BLOCK_SIZE as usize];
        let blocks = TOTAL_BYTES / BLOCK_SIZE;
        for _ in 0..blocks {
            file.write_all(&zeros)?;
        }
        file.sync_all()?;
        debug!("created {TOTAL_BYTES}-byte image");
        Ok(())
    }
}

impl DataStorage for FileDataStorage {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        check_bounds(offset, buffer.len())?;
        self.file.read_exact_at(buffer, offset)?;
        Ok(())
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        check_bounds(offset, buffer.len())?;
        self.file.write_all_at(buffer, offset)?;
        Ok(())
    }
}
