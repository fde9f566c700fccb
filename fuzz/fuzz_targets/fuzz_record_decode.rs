#![no_main]

use libfuzzer_sys::fuzz_target;

use cinder_core::storage::hybridlog::record::{decode, Decoded, RecordIter};

fuzz_target!(|data: &[u8]| {
    // Segment files are read back after crashes and must decode torn or
    // garbage bytes without panicking.
    if let Ok(Decoded::Record(record)) = decode(data) {
        assert!(record.size <= data.len() + 7);
        assert_eq!(record.size % 8, 0);
    }

    let mut last = None;
    for item in RecordIter::new(data) {
        match item {
            Ok((offset, record)) => {
                assert!(last.map_or(true, |prev| offset > prev));
                assert!(offset + record.key.len() + record.value.len() <= data.len());
                last = Some(offset);
            }
            Err((offset, _)) => {
                assert!(offset <= data.len());
                break;
            }
        }
    }
});
