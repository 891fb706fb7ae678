//! Error types shared by every MYFATFS crate.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no file system is mounted")]
    NotMounted,
    #[error("not a MYFATFS file system: {0}")]
    NotAFilesystem(#[from] BootSectorError),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("block {0} is out of range")]
    OutOfRangeBlock(u32),
    #[error("name too long")]
    NameTooLong,
    #[error("already exists")]
    Exists,
    #[error("not found")]
    NotFound,
    #[error("not a file")]
    NotAFile,
    #[error("not a directory")]
    NotADirectory,
    #[error("directory is full")]
    DirFull,
    #[error("directory is not empty")]
    DirNotEmpty,
    #[error("out of space")]
    OutOfSpace,
    #[error("file too large")]
    TooLarge,
    #[error("new size is larger than the current size")]
    Grow,
    #[error("FAT chain is corrupt")]
    ChainCorrupt,
}

/// The specific reason a boot sector failed validation. Kept distinct from
/// [`Error::NotAFilesystem`] so `mount` can log the precise cause while
/// callers still see one stable error variant.
#[derive(thiserror::Error, Debug)]
pub enum BootSectorError {
    #[error("signature {0:?} does not match \"MYFATFS\"")]
    BadSignature([u8; 8]),
}

pub type Result<T> = core::result::Result<T, Error>;
