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

pub use myfatfs_err::*;

/// Supplies the current time to a file system engine. Kept as a trait rather
/// than calling `SystemTime::now()` directly so tests can pin the clock and
/// so the engine has no opinion on where time comes from.
pub trait Clock {
    /// Seconds since the Unix epoch.
    fn now(&self) -> u32;
}

/// What kind of thing a directory entry names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// An owned, borrow-free view of one occupied directory slot, as returned by
/// [`FileSystem::ls`]. The on-disk directory entry this is read from stays
/// private to the engine; callers never see FAT sentinels or raw byte
/// layouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryView {
    pub name: String,
    pub kind: EntryKind,
    pub size: u32,
    pub created_time: u32,
    pub modified_time: u32,
}

/// The public operation surface of a mounted MYFATFS file system.
///
/// All operations act on the current directory, which starts at the root on
/// mount and moves only via [`FileSystem::cd`]. There is no multi-segment
/// path traversal in a single call — names are single path components.
pub trait FileSystem {
    fn create_file(&mut self, name: &str) -> Result<()>;

    fn delete_file(&mut self, name: &str) -> Result<()>;

    fn read_file(&mut self, name: &str) -> Result<Vec<u8>>;

    fn write_file(&mut self, name: &str, data: &[u8]) -> Result<()>;

    fn truncate_file(&mut self, name: &str, new_size: u32) -> Result<()>;

    fn mkdir(&mut self, name: &str) -> Result<()>;

    fn rmdir(&mut self, name: &str) -> Result<()>;

    /// Moves the current directory to the named child (or `.`/`..`).
    fn cd(&mut self, name: &str) -> Result<()>;

    /// Lists the occupied entries of the current directory, in slot order.
    fn ls(&mut self) -> Result<Vec<DirEntryView>>;

    /// The current directory path, e.g. `/` or `/docs`.
    fn current_path(&self) -> &str;
}
