//! Storage I/O primitives
//!
//! Thin, synchronous building blocks shared by the tiered log:
//!
//! - positional reads and writes that never move a shared file cursor
//! - bounded retry with exponential backoff ([`RetryPolicy`])
//! - batched cold reads executed on the blocking pool ([`ReadBatch`])
//!
//! ```text
//!   HybridLog ──► MutableRegion ──► write_all_at (write-through)
//!             ──► DiskSegment   ──► read_exact_at / ReadBatch
//!             ──► checkpoints   ──► sync_dir after rename
//! ```

mod batch;
mod retry;

pub use batch::{complete, BlockSource, ReadBatch};
pub use retry::{classify, RetryPolicy};

use std::fs::File;
use std::io;
use std::path::Path;

/// Write all of `buf` at `offset` without touching the file cursor
#[cfg(unix)]
pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

/// Write all of `buf` at `offset`
#[cfg(windows)]
pub fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Fill `buf` from `offset` without touching the file cursor
#[cfg(unix)]
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

/// Fill `buf` from `offset`
#[cfg(windows)]
pub fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Make renames and unlinks inside `dir` durable
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}
