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

/**
 * MYFATFS: a fixed-geometry FAT file system over a single 64 MiB image.
 *
 * A block is a fixed 1024-byte unit. The FAT is a dense array of one 16-bit
 * entry per block, used both as a sentinel (FREE/EOF/BAD) and, for any other
 * value, as the "next block in chain" pointer for the block it belongs to.
 *
 * General layout:
 *
 * .                      | offs (blocks)     | length (blocks)
 * boot sector             | 0                 | 1
 * FAT                     | 1                 | fat_blocks (128)
 * root directory chain    | 1 + fat_blocks    | dir_blocks
 * data region              | data_start_block  | remainder
 *
 * Every file and every non-root directory is a chain of blocks threaded
 * through the FAT, rooted at the `first_block` of its directory entry and
 * terminated by the EOF sentinel. The root directory is the one chain that
 * isn't referenced by any directory entry: its head is the boot sector's
 * `root_dir_block` field.
 *
 * Directory entries name either a file (a chain of data blocks, total length
 * `file_size`) or a directory (a fixed-length chain holding a directory
 * image: `MAX_FILES_IN_DIR` entries plus a trailing counter). A block never
 * belongs to more than one chain.
 */
use std::mem::size_of;

use log::{debug, error, warn};
use myfatfs_ds::{DataStorage, BLOCK_SIZE as DS_BLOCK_SIZE};
use myfatfs_err::BootSectorError;
use myfatfs_fs::{Clock, DirEntryView, EntryKind, Error, FileSystem, Result};
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout,
};

/// Bytes per block. Mirrors [`myfatfs_ds::BLOCK_SIZE`]; kept as its own
/// constant because everything below talks about it in `u32`/`usize` terms.
pub const BLOCK_SIZE: u32 = DS_BLOCK_SIZE as u32;
/// Total number of addressable blocks in an image.
pub const TOTAL_BLOCKS: u32 = myfatfs_ds::TOTAL_BLOCKS as u32;
/// Directory slots per directory.
pub const MAX_FILES_IN_DIR: usize = 128;
/// Maximum filename length, including the NUL terminator.
pub const MAX_FILENAME: usize = 64;
/// Maximum number of data blocks a single file may occupy (128 KiB).
pub const MAX_FILE_BLOCKS: u32 = 128;

const FAT_FREE: u16 = 0xFFFF;
const FAT_EOF: u16 = 0xFFFE;
const FAT_BAD: u16 = 0xFFFD;

const TYPE_FILE: u8 = 0;
const TYPE_DIRECTORY: u8 = 1;

const SIGNATURE: &[u8; 8] = b"MYFATFS\0";
const VOLUME_LABEL: &[u8; 16] = b"MYVOLUME\0\0\0\0\0\0\0\0";

const FAT_BLOCKS: u32 = ((TOTAL_BLOCKS as u64 * 2).div_ceil(BLOCK_SIZE as u64)) as u32;
const ROOT_DIR_BLOCK: u32 = 1 + FAT_BLOCKS;

/// Blocks needed to hold one [`DirImage`]. `MAX_FILES_IN_DIR` 64-byte-named
/// entries do not fit in a single 1024-byte block (128 entries alone need
/// 8 KiB just for names), so unlike the boot sector and FAT, a directory's
/// backing store is a short fixed-length chain rather than one block. See
/// `DESIGN.md` for the reasoning; every other directory invariant from the
/// spec (128 slots, 64-byte names, occupancy-by-first-byte, `.`/`..`) is
/// unaffected.
const DIR_BLOCKS: u32 = (size_of::<DirImage>() as u64).div_ceil(BLOCK_SIZE as u64) as u32;

/// First block of the data region: right after the root directory's chain.
pub const DATA_START_BLOCK: u32 = ROOT_DIR_BLOCK + DIR_BLOCKS;

fn is_power_of_two(value: u32) -> bool {
    value != 0 && value & (value - 1) == 0
}

/// The 1-block superblock at block 0.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BootSector {
    signature: [u8; 8],
    total_blocks: U32,
    fat_blocks: U32,
    root_dir_block: U32,
    data_start_block: U32,
    block_size: U16,
    fat_copies: u8,
    volume_label: [u8; 16],
    created_time: U32,
    reserved: [u8; BLOCK_SIZE as usize - 47],
}

impl BootSector {
    fn format_layout(now: u32) -> Self {
        let mut sector = Self::new_zeroed();
        sector.signature = *SIGNATURE;
        sector.total_blocks = TOTAL_BLOCKS.into();
        sector.fat_blocks = FAT_BLOCKS.into();
        sector.root_dir_block = ROOT_DIR_BLOCK.into();
        sector.data_start_block = DATA_START_BLOCK.into();
        sector.block_size = (BLOCK_SIZE as u16).into();
        sector.fat_copies = 1;
        sector.volume_label = *VOLUME_LABEL;
        sector.created_time = now.into();
        sector
    }

    fn validate(&self) -> std::result::Result<(), BootSectorError> {
        if &self.signature != SIGNATURE {
            return Err(BootSectorError::BadSignature(self.signature));
        }
        Ok(())
    }
}

/// On-disk directory entry. 80 bytes: no implicit padding, since every
/// multi-byte field uses zerocopy's byte-aligned little-endian wrappers.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct DirEntry {
    filename: [u8; MAX_FILENAME],
    file_size: U32,
    first_block: U16,
    kind: u8,
    created_time: U32,
    modified_time: U32,
    attributes: u8,
}

impl DirEntry {
    fn is_occupied(&self) -> bool {
        self.filename[0] != 0
    }

    fn name(&self) -> &str {
        let len = self
            .filename
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.filename.len());
        // format()/create_file() never store anything but valid UTF-8 ASCII
        // names, so a corrupt image is the only way this could fail.
        std::str::from_utf8(&self.filename[..len]).unwrap_or("")
    }

    fn set_name(&mut self, name: &str) {
        self.filename = [0; MAX_FILENAME];
        self.filename[..name.len()].copy_from_slice(name.as_bytes());
    }

    fn clear(&mut self) {
        *self = DirEntry::new_zeroed();
    }

    fn kind(&self) -> EntryKind {
        if self.kind == TYPE_DIRECTORY {
            EntryKind::Directory
        } else {
            EntryKind::File
        }
    }

    fn view(&self) -> DirEntryView {
        DirEntryView {
            name: self.name().to_string(),
            kind: self.kind(),
            size: self.file_size.get(),
            created_time: self.created_time.get(),
            modified_time: self.modified_time.get(),
        }
    }
}

/// The full contents of one directory: `MAX_FILES_IN_DIR` fixed slots plus an
/// advisory counter. `entry_count` is maintained on insert/delete but, per
/// spec, never trusted for reads — every scan tests `filename[0] != 0`.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct DirImage {
    entries: [DirEntry; MAX_FILES_IN_DIR],
    entry_count: U16,
}

impl DirImage {
    fn empty() -> Self {
        Self::new_zeroed()
    }

    fn find_by_name(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.is_occupied() && e.name() == name)
    }

    fn find_free(&self) -> Option<usize> {
        self.entries.iter().position(|e| !e.is_occupied())
    }

    fn list(&self) -> Vec<DirEntryView> {
        self.entries
            .iter()
            .filter(|e| e.is_occupied())
            .map(DirEntry::view)
            .collect()
    }
}

/// In-memory mirror of the on-disk FAT: one 16-bit entry per block.
struct FatTable {
    entries: Vec<U16>,
}

impl FatTable {
    fn formatted() -> Self {
        let mut entries = vec![U16::from(FAT_FREE); TOTAL_BLOCKS as usize];
        for entry in entries.iter_mut().take(ROOT_DIR_BLOCK as usize) {
            *entry = FAT_BAD.into();
        }
        let mut table = Self { entries };
        // The root directory is a real chain, not a reserved span, so that
        // reading/writing it shares the same machinery as any other
        // directory's chain.
        table.link_fresh_chain(ROOT_DIR_BLOCK as u16, DIR_BLOCKS);
        table
    }

    fn load(storage: &impl DataStorage) -> Result<Self> {
        let mut bytes = vec![0u8; FAT_BLOCKS as usize * BLOCK_SIZE as usize];
        storage.read((1 * BLOCK_SIZE) as u64, &mut bytes)?;
        let entries = <[U16]>::ref_from_bytes(&bytes)
            .map_err(|_| Error::ChainCorrupt)?
            .to_vec();
        Ok(Self { entries })
    }

    fn flush(&self, storage: &impl DataStorage) -> Result<()> {
        storage.write((1 * BLOCK_SIZE) as u64, self.entries.as_bytes())?;
        Ok(())
    }

    fn next(&self, block: u16) -> u16 {
        self.entries[block as usize].get()
    }

    fn set_next(&mut self, block: u16, next: u16) {
        self.entries[block as usize] = next.into();
    }

    /// First-fit linear scan over the data region. `0xFFFF` is numerically a
    /// valid block index (`TOTAL_BLOCKS - 1`) but collides with the `FREE`
    /// sentinel, so it is permanently excluded from allocation — see the
    /// bit-width note in `DESIGN.md`.
    fn allocate(&mut self, storage: &impl DataStorage) -> Result<u16> {
        for block in DATA_START_BLOCK..TOTAL_BLOCKS {
            if block == FAT_FREE as u32 {
                continue;
            }
            let block = block as u16;
            if self.next(block) == FAT_FREE {
                self.set_next(block, FAT_EOF);
                self.flush(storage)?;
                return Ok(block);
            }
        }
        Err(Error::OutOfSpace)
    }

    fn free_chain(&mut self, storage: &impl DataStorage, head: u16) -> Result<()> {
        let mut current = head;
        let mut steps = 0u32;
        while current != FAT_EOF && current != FAT_FREE {
            if current == FAT_BAD {
                error!("attempted to free a reserved block");
                return Err(Error::ChainCorrupt);
            }
            steps += 1;
            if steps > TOTAL_BLOCKS {
                error!("FAT chain does not terminate (cycle)");
                return Err(Error::ChainCorrupt);
            }
            let next = self.next(current);
            self.set_next(current, FAT_FREE);
            current = next;
        }
        self.flush(storage)
    }

    /// Walks the whole chain rooted at `head`, returning every visited block
    /// in order. Fails `ChainCorrupt` on `BAD`, an out-of-range link, or a
    /// cycle.
    fn walk(&self, head: u16) -> Result<Vec<u16>> {
        let mut blocks = Vec::new();
        let mut current = head;
        while current != FAT_EOF {
            if current == FAT_FREE || current == FAT_BAD || current as u32 >= TOTAL_BLOCKS {
                error!("FAT chain references an unusable block ({current:#06x})");
                return Err(Error::ChainCorrupt);
            }
            blocks.push(current);
            if blocks.len() as u32 > TOTAL_BLOCKS {
                error!("FAT chain does not terminate (cycle)");
                return Err(Error::ChainCorrupt);
            }
            current = self.next(current);
        }
        Ok(blocks)
    }

    /// Links `len` freshly-allocated-but-unlinked blocks, starting at `head`
    /// (inclusive), into one chain ending in `EOF`. Used only at format time
    /// to lay out the root directory's fixed chain.
    fn link_fresh_chain(&mut self, head: u16, len: u32) {
        for i in 0..len {
            let block = head + i as u16;
            let next = if i + 1 == len {
                FAT_EOF
            } else {
                block + 1
            };
            self.set_next(block, next);
        }
    }

    /// Allocates a brand new `len`-block chain and returns its head.
    /// On `OutOfSpace` partway through, frees whatever was allocated so far.
    fn allocate_chain(&mut self, storage: &impl DataStorage, len: u32) -> Result<u16> {
        let mut head = None;
        let mut prev = None;
        for _ in 0..len {
            let block = match self.allocate(storage) {
                Ok(block) => block,
                Err(err) => {
                    if let Some(head) = head {
                        warn!("out of space mid-chain, freeing partial allocation");
                        self.free_chain(storage, head)?;
                    }
                    return Err(err);
                }
            };
            if let Some(prev) = prev {
                self.set_next(prev, block);
            }
            head.get_or_insert(block);
            prev = Some(block);
        }
        self.flush(storage)?;
        Ok(head.expect("len is always >= 1 for every caller"))
    }
}

fn read_block(storage: &impl DataStorage, block: u16, buf: &mut [u8]) -> Result<()> {
    storage.read(block as u64 * BLOCK_SIZE as u64, buf)?;
    Ok(())
}

fn write_block(storage: &impl DataStorage, block: u16, buf: &[u8]) -> Result<()> {
    storage.write(block as u64 * BLOCK_SIZE as u64, buf)?;
    Ok(())
}

fn read_dir_image(storage: &impl DataStorage, fat: &FatTable, head: u16) -> Result<DirImage> {
    let blocks = fat.walk(head)?;
    if blocks.len() as u32 != DIR_BLOCKS {
        error!("directory chain at {head} has {} blocks, expected {DIR_BLOCKS}", blocks.len());
        return Err(Error::ChainCorrupt);
    }
    let mut raw = vec![0u8; DIR_BLOCKS as usize * BLOCK_SIZE as usize];
    for (i, block) in blocks.iter().enumerate() {
        read_block(storage, *block, &mut raw[i * BLOCK_SIZE as usize..(i + 1) * BLOCK_SIZE as usize])?;
    }
    Ok(DirImage::read_from_bytes(&raw[..size_of::<DirImage>()]).map_err(|_| Error::ChainCorrupt)?)
}

fn write_dir_image(
    storage: &impl DataStorage,
    fat: &FatTable,
    head: u16,
    image: &DirImage,
) -> Result<()> {
    let blocks = fat.walk(head)?;
    if blocks.len() as u32 != DIR_BLOCKS {
        return Err(Error::ChainCorrupt);
    }
    let mut raw = vec![0u8; DIR_BLOCKS as usize * BLOCK_SIZE as usize];
    raw[..size_of::<DirImage>()].copy_from_slice(image.as_bytes());
    for (i, block) in blocks.iter().enumerate() {
        write_block(storage, *block, &raw[i * BLOCK_SIZE as usize..(i + 1) * BLOCK_SIZE as usize])?;
    }
    Ok(())
}

/// Creates a fresh MYFATFS file system on `storage`. The image is assumed to
/// already be `TOTAL_BLOCKS * BLOCK_SIZE` bytes (see
/// `myfatfs_ds_std::FileDataStorage::create_image`); `format` never resizes
/// anything. Destroys any prior content — re-formatting is idempotent.
pub fn format(storage: &impl DataStorage, clock: &impl Clock) -> Result<()> {
    let boot_sector = BootSector::format_layout(clock.now());
    write_block(storage, 0, boot_sector.as_bytes())?;

    let fat = FatTable::formatted();
    fat.flush(storage)?;

    write_dir_image(storage, &fat, ROOT_DIR_BLOCK as u16, &DirImage::empty())?;

    debug!(
        "formatted image: fat_blocks={FAT_BLOCKS} root_dir_block={ROOT_DIR_BLOCK} data_start_block={DATA_START_BLOCK}"
    );
    Ok(())
}

/// A mounted MYFATFS file system. Owns its backing storage and its in-memory
/// FAT; dropping (or [`Mounted::unmount`]-ing) this releases both. Every
/// mutation is flushed eagerly, so there is nothing to flush on unmount.
pub struct Mounted<DS: DataStorage, C: Clock> {
    storage: DS,
    clock: C,
    fat: FatTable,
    current_dir_block: u16,
    current_path: String,
}

impl<DS: DataStorage, C: Clock> Mounted<DS, C> {
    /// Mounts the image on `storage`. Replaces the boot sector's geometry
    /// assertions with this crate's fixed constants rather than trusting
    /// arbitrary on-disk values, since this engine (unlike a general FAT12/16
    /// driver) only ever formats one geometry.
    pub fn mount(storage: DS, clock: C) -> Result<Self> {
        let mut raw = [0u8; BLOCK_SIZE as usize];
        storage.read(0, &mut raw)?;
        let boot_sector =
            BootSector::read_from_bytes(&raw).map_err(|_| Error::ChainCorrupt)?;
        boot_sector.validate()?;

        if boot_sector.total_blocks.get() != TOTAL_BLOCKS
            || boot_sector.block_size.get() as u32 != BLOCK_SIZE
        {
            error!("image geometry does not match this engine's fixed layout");
            return Err(BootSectorError::BadSignature(boot_sector.signature).into());
        }

        let fat = FatTable::load(&storage)?;

        Ok(Self {
            storage,
            clock,
            fat,
            current_dir_block: ROOT_DIR_BLOCK as u16,
            current_path: "/".to_string(),
        })
    }

    /// Consumes the mounted handle, releasing the storage and the FAT.
    pub fn unmount(self) -> (DS, C) {
        (self.storage, self.clock)
    }

    fn current_dir(&self) -> Result<DirImage> {
        read_dir_image(&self.storage, &self.fat, self.current_dir_block)
    }

    fn write_current_dir(&self, image: &DirImage) -> Result<()> {
        write_dir_image(&self.storage, &self.fat, self.current_dir_block, image)
    }

    fn find_entry(&self, name: &str) -> Result<(DirImage, usize)> {
        let dir = self.current_dir()?;
        let index = dir.find_by_name(name).ok_or(Error::NotFound)?;
        Ok((dir, index))
    }
}

impl<DS: DataStorage, C: Clock> FileSystem for Mounted<DS, C> {
    fn create_file(&mut self, name: &str) -> Result<()> {
        if name.len() >= MAX_FILENAME {
            return Err(Error::NameTooLong);
        }

        let mut dir = self.current_dir()?;
        if dir.find_by_name(name).is_some() {
            return Err(Error::Exists);
        }
        let index = dir.find_free().ok_or(Error::DirFull)?;

        let now = self.clock.now();
        let entry = &mut dir.entries[index];
        entry.set_name(name);
        entry.file_size = 0.into();
        entry.first_block = FAT_EOF.into();
        entry.kind = TYPE_FILE;
        entry.created_time = now.into();
        entry.modified_time = now.into();
        entry.attributes = 0;
        dir.entry_count = (dir.entry_count.get() + 1).into();

        self.write_current_dir(&dir)
    }

    fn delete_file(&mut self, name: &str) -> Result<()> {
        let (mut dir, index) = self.find_entry(name)?;
        let entry = dir.entries[index];
        if entry.kind() != EntryKind::File {
            return Err(Error::NotAFile);
        }

        let first_block = entry.first_block.get();
        if first_block != FAT_EOF {
            self.fat.free_chain(&self.storage, first_block)?;
        }

        dir.entries[index].clear();
        dir.entry_count = dir.entry_count.get().saturating_sub(1).into();
        self.write_current_dir(&dir)
    }

    fn read_file(&mut self, name: &str) -> Result<Vec<u8>> {
        let (dir, index) = self.find_entry(name)?;
        let entry = dir.entries[index];
        if entry.kind() != EntryKind::File {
            return Err(Error::NotAFile);
        }

        let file_size = entry.file_size.get();
        if file_size == 0 {
            return Ok(Vec::new());
        }

        let blocks = self.fat.walk(entry.first_block.get())?;
        let expected = (file_size as u64).div_ceil(BLOCK_SIZE as u64);
        if blocks.len() as u64 != expected {
            error!("file '{name}' chain length {} does not match file_size {file_size}", blocks.len());
            return Err(Error::ChainCorrupt);
        }

        let mut data = Vec::with_capacity(file_size as usize);
        let mut remaining = file_size as usize;
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        for block in blocks {
            read_block(&self.storage, block, &mut buf)?;
            let take = remaining.min(BLOCK_SIZE as usize);
            data.extend_from_slice(&buf[..take]);
            remaining -= take;
        }
        Ok(data)
    }

    fn write_file(&mut self, name: &str, data: &[u8]) -> Result<()> {
        if data.len() as u64 > MAX_FILE_BLOCKS as u64 * BLOCK_SIZE as u64 {
            return Err(Error::TooLarge);
        }

        let (mut dir, index) = self.find_entry(name)?;
        let entry = dir.entries[index];
        if entry.kind() != EntryKind::File {
            return Err(Error::NotAFile);
        }

        let old_first_block = entry.first_block.get();
        if old_first_block != FAT_EOF {
            self.fat.free_chain(&self.storage, old_first_block)?;
        }

        let mut first_block = FAT_EOF;
        let mut prev_block: Option<u16> = None;
        let mut offset = 0usize;
        while offset < data.len() {
            let block = match self.fat.allocate(&self.storage) {
                Ok(block) => block,
                Err(err) => {
                    if first_block != FAT_EOF {
                        self.fat.free_chain(&self.storage, first_block)?;
                    }
                    return Err(err);
                }
            };
            if first_block == FAT_EOF {
                first_block = block;
            }
            if let Some(prev) = prev_block {
                self.fat.set_next(prev, block);
            }

            let take = (data.len() - offset).min(BLOCK_SIZE as usize);
            let mut buf = vec![0u8; BLOCK_SIZE as usize];
            buf[..take].copy_from_slice(&data[offset..offset + take]);
            write_block(&self.storage, block, &buf)?;

            offset += take;
            prev_block = Some(block);
        }
        if let Some(prev) = prev_block {
            self.fat.set_next(prev, FAT_EOF);
        }
        self.fat.flush(&self.storage)?;

        let now = self.clock.now();
        let entry = &mut dir.entries[index];
        entry.first_block = first_block.into();
        entry.file_size = (data.len() as u32).into();
        entry.modified_time = now.into();

        self.write_current_dir(&dir)
    }

    fn truncate_file(&mut self, name: &str, new_size: u32) -> Result<()> {
        let (mut dir, index) = self.find_entry(name)?;
        let entry = dir.entries[index];
        if entry.kind() != EntryKind::File {
            return Err(Error::NotAFile);
        }
        let file_size = entry.file_size.get();
        if new_size > file_size {
            return Err(Error::Grow);
        }
        if new_size == file_size {
            return Ok(());
        }

        if new_size == 0 {
            if entry.first_block.get() != FAT_EOF {
                self.fat.free_chain(&self.storage, entry.first_block.get())?;
            }
            dir.entries[index].first_block = FAT_EOF.into();
        } else {
            let blocks_needed = (new_size as u64).div_ceil(BLOCK_SIZE as u64) as usize;
            let blocks = self.fat.walk(entry.first_block.get())?;
            let retained = &blocks[..blocks_needed];
            if let Some(&tail) = blocks.get(blocks_needed) {
                self.fat.free_chain(&self.storage, tail)?;
                let last_retained = *retained.last().expect("blocks_needed >= 1 here");
                self.fat.set_next(last_retained, FAT_EOF);
                self.fat.flush(&self.storage)?;
            }
        }

        let now = self.clock.now();
        let entry = &mut dir.entries[index];
        entry.file_size = new_size.into();
        entry.modified_time = now.into();

        self.write_current_dir(&dir)
    }

    fn mkdir(&mut self, name: &str) -> Result<()> {
        if name.len() >= MAX_FILENAME {
            return Err(Error::NameTooLong);
        }

        let mut dir = self.current_dir()?;
        if dir.find_by_name(name).is_some() {
            return Err(Error::Exists);
        }
        let index = dir.find_free().ok_or(Error::DirFull)?;

        let new_block = self.fat.allocate_chain(&self.storage, DIR_BLOCKS)?;

        let now = self.clock.now();
        let result = (|| -> Result<()> {
            let mut new_dir = DirImage::empty();
            let dot = &mut new_dir.entries[0];
            dot.set_name(".");
            dot.first_block = new_block.into();
            dot.kind = TYPE_DIRECTORY;
            dot.created_time = now.into();
            dot.modified_time = now.into();

            let dotdot = &mut new_dir.entries[1];
            dotdot.set_name("..");
            dotdot.first_block = self.current_dir_block.into();
            dotdot.kind = TYPE_DIRECTORY;
            dotdot.created_time = now.into();
            dotdot.modified_time = now.into();

            new_dir.entry_count = 2.into();
            write_dir_image(&self.storage, &self.fat, new_block, &new_dir)?;

            let entry = &mut dir.entries[index];
            entry.set_name(name);
            entry.first_block = new_block.into();
            entry.kind = TYPE_DIRECTORY;
            entry.created_time = now.into();
            entry.modified_time = now.into();
            dir.entry_count = (dir.entry_count.get() + 1).into();
            self.write_current_dir(&dir)
        })();

        if result.is_err() {
            warn!("mkdir failed after allocating its chain, freeing it back");
            self.fat.free_chain(&self.storage, new_block)?;
        }
        result
    }

    fn rmdir(&mut self, name: &str) -> Result<()> {
        let (mut dir, index) = self.find_entry(name)?;
        let entry = dir.entries[index];
        if entry.kind() != EntryKind::Directory {
            return Err(Error::NotADirectory);
        }

        let target_block = entry.first_block.get();
        let target = read_dir_image(&self.storage, &self.fat, target_block)?;
        if target.list().len() > 2 {
            return Err(Error::DirNotEmpty);
        }

        self.fat.free_chain(&self.storage, target_block)?;
        dir.entries[index].clear();
        dir.entry_count = dir.entry_count.get().saturating_sub(1).into();
        self.write_current_dir(&dir)
    }

    fn cd(&mut self, name: &str) -> Result<()> {
        if name == "." {
            return Ok(());
        }

        let (dir, index) = self.find_entry(name)?;
        let entry = dir.entries[index];
        if entry.kind() != EntryKind::Directory {
            return Err(Error::NotADirectory);
        }

        self.current_dir_block = entry.first_block.get();
        if name == ".." {
            if let Some(pos) = self.current_path.trim_end_matches('/').rfind('/') {
                self.current_path.truncate(pos.max(1));
            }
        } else if self.current_path == "/" {
            self.current_path.push_str(name);
        } else {
            self.current_path.push('/');
            self.current_path.push_str(name);
        }
        Ok(())
    }

    fn ls(&mut self) -> Result<Vec<DirEntryView>> {
        Ok(self.current_dir()?.list())
    }

    fn current_path(&self) -> &str {
        &self.current_path
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::HashMap};

    use myfatfs_ds::{check_bounds, BLOCK_SIZE, TOTAL_BYTES};

    use super::*;

    /// An in-memory [`DataStorage`] test double: a flat zero-filled byte
    /// array kept behind a `RefCell` so `read`/`write` can stay `&self`,
    /// matching the real (file-backed) implementation's shared-reference
    /// shape. Never shipped outside tests — production images go through
    /// `myfatfs_ds_std::FileDataStorage`.
    struct MemoryStorage {
        bytes: RefCell<Vec<u8>>,
    }

    impl MemoryStorage {
        fn new() -> Self {
            Self {
                bytes: RefCell::new(vec![0u8; TOTAL_BYTES as usize]),
            }
        }
    }

    impl DataStorage for MemoryStorage {
        fn read(&self, offset: u64, buffer: &mut [u8]) -> myfatfs_err::Result<()> {
            check_bounds(offset, buffer.len())?;
            let bytes = self.bytes.borrow();
            buffer.copy_from_slice(&bytes[offset as usize..offset as usize + buffer.len()]);
            Ok(())
        }

        fn write(&self, offset: u64, buffer: &[u8]) -> myfatfs_err::Result<()> {
            check_bounds(offset, buffer.len())?;
            let mut bytes = self.bytes.borrow_mut();
            bytes[offset as usize..offset as usize + buffer.len()].copy_from_slice(buffer);
            Ok(())
        }
    }

    /// A clock pinned to a fixed value, with an optional per-name override
    /// table for tests that care about distinct timestamps.
    struct FixedClock {
        now: RefCell<u32>,
    }

    impl FixedClock {
        fn new(now: u32) -> Self {
            Self {
                now: RefCell::new(now),
            }
        }

        fn tick(&self) {
            *self.now.borrow_mut() += 1;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> u32 {
            let now = *self.now.borrow();
            now
        }
    }

    fn formatted() -> (MemoryStorage, FixedClock) {
        let storage = MemoryStorage::new();
        let clock = FixedClock::new(1_700_000_000);
        format(&storage, &clock).unwrap();
        (storage, clock)
    }

    fn mount(storage: MemoryStorage, clock: FixedClock) -> Mounted<MemoryStorage, FixedClock> {
        Mounted::mount(storage, clock).unwrap()
    }

    #[test]
    fn format_then_mount_has_empty_root_and_all_data_blocks_free() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);

        assert_eq!(fs.ls().unwrap(), Vec::new());
        for block in DATA_START_BLOCK..TOTAL_BLOCKS {
            if block == FAT_FREE as u32 {
                continue;
            }
            assert_eq!(fs.fat.next(block as u16), FAT_FREE, "block {block} not free");
        }
    }

    #[test]
    fn create_file_then_round_trips_through_write_and_read() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);

        fs.create_file("a.txt").unwrap();
        let listed = fs.ls().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "a.txt");
        assert_eq!(listed[0].size, 0);

        fs.write_file("a.txt", b"hello").unwrap();
        assert_eq!(fs.read_file("a.txt").unwrap(), b"hello");

        let listed = fs.ls().unwrap();
        assert_eq!(listed[0].size, 5);
    }

    #[test]
    fn write_file_spanning_three_blocks_round_trips() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);
        fs.create_file("a.txt").unwrap();

        let data = vec![b'x'; 2049];
        fs.write_file("a.txt", &data).unwrap();
        assert_eq!(fs.read_file("a.txt").unwrap(), data);

        let entry_block = {
            let dir = fs.current_dir().unwrap();
            dir.entries[dir.find_by_name("a.txt").unwrap()]
                .first_block
                .get()
        };
        assert_eq!(fs.fat.walk(entry_block).unwrap().len(), 3);
    }

    #[test]
    fn truncate_shrinks_chain_and_frees_tail_blocks() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);
        fs.create_file("a.txt").unwrap();
        fs.write_file("a.txt", &vec![b'x'; 2049]).unwrap();

        fs.truncate_file("a.txt", 1024).unwrap();
        let listed = fs.ls().unwrap();
        assert_eq!(listed[0].size, 1024);

        let entry_block = {
            let dir = fs.current_dir().unwrap();
            dir.entries[dir.find_by_name("a.txt").unwrap()]
                .first_block
                .get()
        };
        assert_eq!(fs.fat.walk(entry_block).unwrap().len(), 1);
    }

    #[test]
    fn truncate_to_same_size_is_a_no_op() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);
        fs.create_file("a.txt").unwrap();
        fs.write_file("a.txt", b"hello").unwrap();
        fs.truncate_file("a.txt", 5).unwrap();
        assert_eq!(fs.read_file("a.txt").unwrap(), b"hello");
    }

    #[test]
    fn truncate_larger_than_current_size_fails() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);
        fs.create_file("a.txt").unwrap();
        fs.write_file("a.txt", b"hi").unwrap();
        assert!(matches!(fs.truncate_file("a.txt", 100), Err(Error::Grow)));
    }

    #[test]
    fn truncate_to_zero_frees_the_whole_chain() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);
        fs.create_file("a.txt").unwrap();
        fs.write_file("a.txt", &vec![b'x'; 2049]).unwrap();
        fs.truncate_file("a.txt", 0).unwrap();

        let dir = fs.current_dir().unwrap();
        let entry = dir.entries[dir.find_by_name("a.txt").unwrap()];
        assert_eq!(entry.first_block.get(), FAT_EOF);
        assert_eq!(entry.file_size.get(), 0);
    }

    #[test]
    fn delete_file_frees_its_blocks_and_clears_the_slot() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);
        fs.create_file("a.txt").unwrap();
        fs.write_file("a.txt", &vec![b'x'; 2049]).unwrap();

        let first_block = {
            let dir = fs.current_dir().unwrap();
            dir.entries[dir.find_by_name("a.txt").unwrap()]
                .first_block
                .get()
        };
        let chain = fs.fat.walk(first_block).unwrap();

        fs.delete_file("a.txt").unwrap();
        assert!(fs.ls().unwrap().is_empty());
        for block in chain {
            assert_eq!(fs.fat.next(block), FAT_FREE);
        }
    }

    #[test]
    fn delete_on_directory_fails_not_a_file() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);
        fs.mkdir("d").unwrap();
        assert!(matches!(fs.delete_file("d"), Err(Error::NotAFile)));
    }

    #[test]
    fn delete_missing_name_fails_not_found() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);
        assert!(matches!(fs.delete_file("nope"), Err(Error::NotFound)));
    }

    #[test]
    fn name_of_63_bytes_is_accepted_64_is_rejected() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);
        let ok_name = "a".repeat(63);
        let too_long = "a".repeat(64);
        fs.create_file(&ok_name).unwrap();
        assert!(matches!(
            fs.create_file(&too_long),
            Err(Error::NameTooLong)
        ));
    }

    #[test]
    fn directory_becomes_full_after_max_files_in_dir_entries() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);
        for i in 0..MAX_FILES_IN_DIR {
            fs.create_file(&format!("f{i}")).unwrap();
        }
        assert!(matches!(
            fs.create_file("one_too_many"),
            Err(Error::DirFull)
        ));
    }

    #[test]
    fn file_exactly_at_cap_succeeds_one_byte_more_fails() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);
        fs.create_file("a.txt").unwrap();

        let max = vec![b'x'; (MAX_FILE_BLOCKS * BLOCK_SIZE) as usize];
        fs.write_file("a.txt", &max).unwrap();

        let mut too_big = max;
        too_big.push(b'x');
        assert!(matches!(
            fs.write_file("a.txt", &too_big),
            Err(Error::TooLarge)
        ));
    }

    #[test]
    fn mkdir_initializes_dot_and_dotdot_and_cd_navigates() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);
        fs.mkdir("d").unwrap();

        let root_block = fs.current_dir_block;
        fs.cd("d").unwrap();
        assert_eq!(fs.current_path(), "/d");

        let dir = fs.current_dir().unwrap();
        assert_eq!(dir.entries[0].name(), ".");
        assert_eq!(dir.entries[0].first_block.get(), fs.current_dir_block);
        assert_eq!(dir.entries[1].name(), "..");
        assert_eq!(dir.entries[1].first_block.get(), root_block);

        fs.cd("..").unwrap();
        assert_eq!(fs.current_dir_block, root_block);
        assert_eq!(fs.current_path(), "/");
    }

    #[test]
    fn rmdir_on_non_empty_directory_fails() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);
        fs.mkdir("d").unwrap();
        fs.cd("d").unwrap();
        fs.create_file("a.txt").unwrap();
        fs.cd("..").unwrap();

        assert!(matches!(fs.rmdir("d"), Err(Error::DirNotEmpty)));
    }

    #[test]
    fn rmdir_on_empty_directory_frees_its_chain() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);
        fs.mkdir("d").unwrap();
        let dir_block = {
            let dir = fs.current_dir().unwrap();
            dir.entries[dir.find_by_name("d").unwrap()].first_block.get()
        };

        fs.rmdir("d").unwrap();
        assert!(fs.ls().unwrap().is_empty());
        assert_eq!(fs.fat.next(dir_block), FAT_FREE);
    }

    /// Drives [`FatTable::allocate`] to genuine exhaustion: the data region
    /// holds `TOTAL_BLOCKS - DATA_START_BLOCK - 1` allocatable blocks (`0xFFFF`
    /// excluded per the bit-width note), so the last one must succeed and the
    /// one right after it must fail `OutOfSpace`.
    #[test]
    fn allocating_every_data_block_then_one_more_fails_out_of_space() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);

        let total_data_blocks = TOTAL_BLOCKS - DATA_START_BLOCK - 1; // 0xFFFF excluded

        let mut allocated = 0u32;
        while fs.fat.allocate(&fs.storage).is_ok() {
            allocated += 1;
        }
        assert_eq!(allocated, total_data_blocks);
        assert!(matches!(
            fs.fat.allocate(&fs.storage),
            Err(Error::OutOfSpace)
        ));
    }

    /// Leaves exactly 5 data blocks free, then asks for a 10-block write.
    /// `write_file` must allocate into the shortfall, hit `OutOfSpace`
    /// mid-chain, free back everything it had allocated for this write, and
    /// leave the directory entry exactly as it was before the call.
    #[test]
    fn write_file_frees_its_partial_chain_on_out_of_space() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);
        fs.create_file("big.bin").unwrap();

        let total_data_blocks = TOTAL_BLOCKS - DATA_START_BLOCK - 1;
        for _ in 0..total_data_blocks - 5 {
            fs.fat.allocate(&fs.storage).unwrap();
        }

        let data = vec![b'x'; 10 * BLOCK_SIZE as usize];
        assert!(matches!(
            fs.write_file("big.bin", &data),
            Err(Error::OutOfSpace)
        ));

        let dir = fs.current_dir().unwrap();
        let entry = dir.entries[dir.find_by_name("big.bin").unwrap()];
        assert_eq!(entry.first_block.get(), FAT_EOF);
        assert_eq!(entry.file_size.get(), 0);

        let free_blocks = (DATA_START_BLOCK..TOTAL_BLOCKS)
            .filter(|&block| block != FAT_FREE as u32)
            .filter(|&block| fs.fat.next(block as u16) == FAT_FREE)
            .count();
        assert_eq!(free_blocks, 5);
    }

    /// Same shortfall as above, but against `mkdir`'s `DIR_BLOCKS`-long chain
    /// allocation: only 5 blocks are free for an 11-block directory, so
    /// `allocate_chain` must fail `OutOfSpace` and free the partial chain it
    /// had built, leaving the parent directory untouched.
    #[test]
    fn mkdir_frees_its_partial_chain_on_out_of_space() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);

        let total_data_blocks = TOTAL_BLOCKS - DATA_START_BLOCK - 1;
        for _ in 0..total_data_blocks - 5 {
            fs.fat.allocate(&fs.storage).unwrap();
        }

        assert!(matches!(fs.mkdir("d"), Err(Error::OutOfSpace)));
        assert!(fs.ls().unwrap().is_empty());

        let free_blocks = (DATA_START_BLOCK..TOTAL_BLOCKS)
            .filter(|&block| block != FAT_FREE as u32)
            .filter(|&block| fs.fat.next(block as u16) == FAT_FREE)
            .count();
        assert_eq!(free_blocks, 5);
    }

    #[test]
    fn unmount_then_mount_recovers_committed_state() {
        let (storage, clock) = formatted();
        let mut fs = mount(storage, clock);
        fs.create_file("a.txt").unwrap();
        fs.write_file("a.txt", b"hello").unwrap();

        let (storage, clock) = fs.unmount();
        let mut fs = mount(storage, clock);
        assert_eq!(fs.read_file("a.txt").unwrap(), b"hello");
    }

    #[test]
    fn mount_rejects_a_bad_signature() {
        let storage = MemoryStorage::new();
        let clock = FixedClock::new(0);
        assert!(matches!(
            Mounted::mount(storage, clock),
            Err(Error::NotAFilesystem(_))
        ));
    }

    #[test]
    fn clock_advances_modified_time_across_writes() {
        let (storage, clock) = formatted();
        clock.tick();
        let mut fs = mount(storage, clock);
        fs.create_file("a.txt").unwrap();
        let created = fs.ls().unwrap()[0].created_time;
        fs.clock.tick();
        fs.write_file("a.txt", b"hi").unwrap();
        let modified = fs.ls().unwrap()[0].modified_time;
        assert!(modified > created);
    }
}
