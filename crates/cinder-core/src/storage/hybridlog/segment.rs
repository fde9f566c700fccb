//! Segment file naming
//!
//! Every segment file is named after the logical address of its first byte,
//! so the data directory alone describes the log layout:
//! `segment-<start as 16 hex digits>.<hot|warm|cold>`.

use std::path::{Path, PathBuf};

use super::address::LogAddress;

/// Which tier a segment file belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SegmentKind {
    /// Write-through file of the mutable region
    Hot,
    /// Memory-mapped read-only segment
    Warm,
    /// On-disk segment
    Cold,
}

impl SegmentKind {
    /// File extension for this kind
    pub fn extension(&self) -> &'static str {
        match self {
            SegmentKind::Hot => "hot",
            SegmentKind::Warm => "warm",
            SegmentKind::Cold => "cold",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "hot" => Some(SegmentKind::Hot),
            "warm" => Some(SegmentKind::Warm),
            "cold" => Some(SegmentKind::Cold),
            _ => None,
        }
    }
}

/// Path of the segment starting at `start`
pub fn segment_path(dir: &Path, start: LogAddress, kind: SegmentKind) -> PathBuf {
    dir.join(format!(
        "segment-{:016x}.{}",
        start.as_u64(),
        kind.extension()
    ))
}

/// Parse a segment file name
pub fn parse_segment_name(name: &str) -> Option<(LogAddress, SegmentKind)> {
    let rest = name.strip_prefix("segment-")?;
    let (hex, ext) = rest.split_once('.')?;
    if hex.len() != 16 {
        return None;
    }
    let start = u64::from_str_radix(hex, 16).ok()?;
    Some((LogAddress::new(start), SegmentKind::from_extension(ext)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_names() {
        let dir = Path::new("/data");
        let path = segment_path(dir, LogAddress::new(0x1000), SegmentKind::Warm);
        assert_eq!(path, Path::new("/data/segment-0000000000001000.warm"));

        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(
            parse_segment_name(name),
            Some((LogAddress::new(0x1000), SegmentKind::Warm))
        );
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        assert_eq!(parse_segment_name("segment-0000000000001000.cold.tmp"), None);
        assert_eq!(parse_segment_name("segment-1000.cold"), None);
        assert_eq!(parse_segment_name("checkpoint-1.meta"), None);
        assert_eq!(parse_segment_name("segment-zzzzzzzzzzzzzzzz.hot"), None);
    }
}
