#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use std::path::Path;

    use tempfile::TempDir;

    use crate::crypt::PlaintextRegistry;
    use crate::wal::tests::helpers::{
        append_all, collect_replay, init_tracing, open_log, plain_entry,
    };

    /// Overwrites `bytes` at `offset` in the raw file, bypassing the log.
    fn corrupt(path: &Path, offset: u64, bytes: &[u8]) {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .unwrap();
        f.seek(SeekFrom::Start(offset)).unwrap();
        f.write_all(bytes).unwrap();
        f.sync_all().unwrap();
    }

    #[test]
    fn test_corrupt_record_body_stops_replay_before_it() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("00001.mem");
        let (lf, _) = open_log(&path, &PlaintextRegistry);

        let offsets = append_all(
            &lf,
            &[
                plain_entry(b"a", 1, b"AAAA"),
                plain_entry(b"b", 2, b"BBBB"),
                plain_entry(b"c", 3, b"CCCC"),
            ],
        );
        lf.sync().unwrap();
        drop(lf);

        // Flip one byte inside the second record's value.
        corrupt(&path, u64::from(offsets[1]) + 6, &[0xFF]);

        let (lf, _) = open_log(&path, &PlaintextRegistry);
        let (replayed, valid_end) = collect_replay(&lf);
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].0.value, b"AAAA");
        assert_eq!(valid_end, offsets[1]);
    }

    #[test]
    fn test_corrupt_crc_trailer_stops_replay() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("00001.mem");
        let (lf, _) = open_log(&path, &PlaintextRegistry);

        append_all(&lf, &[plain_entry(b"a", 1, b"AAAA")]);
        let end = lf.write_at();
        lf.sync().unwrap();
        drop(lf);

        // Clobber the last two CRC bytes.
        corrupt(&path, u64::from(end) - 2, &[0x99, 0x77]);

        let (lf, _) = open_log(&path, &PlaintextRegistry);
        let (replayed, valid_end) = collect_replay(&lf);
        assert!(replayed.is_empty());
        assert_eq!(valid_end, crate::wal::LOG_HEADER_SIZE);
    }

    #[test]
    fn test_oversized_length_field_is_truncation() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("00001.mem");
        let (lf, _) = open_log(&path, &PlaintextRegistry);

        let offsets = append_all(&lf, &[plain_entry(b"a", 1, b"AAAA")]);
        lf.sync().unwrap();
        drop(lf);

        // Overwrite the header's key-length varint with a huge value whose
        // bytes claim more data than the file holds.
        corrupt(&path, u64::from(offsets[0]), &[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);

        let (lf, _) = open_log(&path, &PlaintextRegistry);
        let (replayed, valid_end) = collect_replay(&lf);
        assert!(replayed.is_empty());
        assert_eq!(valid_end, crate::wal::LOG_HEADER_SIZE);
    }

    #[test]
    fn test_replay_then_truncate_drops_corrupt_suffix() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("00001.mem");
        let (lf, _) = open_log(&path, &PlaintextRegistry);

        let offsets = append_all(
            &lf,
            &[plain_entry(b"a", 1, b"AAAA"), plain_entry(b"b", 2, b"BBBB")],
        );
        lf.sync().unwrap();
        drop(lf);

        corrupt(&path, u64::from(offsets[1]) + 3, &[0xAB]);

        // Replay, then truncate the corrupt suffix away for good.
        let (lf, _) = open_log(&path, &PlaintextRegistry);
        let (_, valid_end) = collect_replay(&lf);
        assert_eq!(valid_end, offsets[1]);
        lf.done_writing(valid_end).unwrap();
        drop(lf);

        let (lf, _) = open_log(&path, &PlaintextRegistry);
        let (replayed, valid_end) = collect_replay(&lf);
        assert_eq!(replayed.len(), 1);
        assert_eq!(valid_end, offsets[1]);
    }
}
