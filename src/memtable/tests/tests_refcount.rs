#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use tempfile::TempDir;

    use crate::memtable::tests::helpers::{init_tracing, open_memtable, put_plain, test_opts};

    #[test]
    fn test_last_reference_deletes_log_file() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let opts = test_opts(&tmp);
        let (mt, _) = open_memtable(&opts, 1);

        put_plain(&mt, b"k", 1, b"v");
        let path = mt.wal().path().to_path_buf();
        assert!(path.exists());

        mt.decr_ref().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_extra_references_defer_deletion() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let opts = test_opts(&tmp);
        let (mt, _) = open_memtable(&opts, 1);
        let path = mt.wal().path().to_path_buf();

        // Count 1 → 3.
        mt.incr_ref();
        mt.incr_ref();

        mt.decr_ref().unwrap();
        assert!(path.exists());
        mt.decr_ref().unwrap();
        assert!(path.exists());
        mt.decr_ref().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_concurrent_decr_releases_once() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let opts = test_opts(&tmp);
        let (mt, _) = open_memtable(&opts, 1);
        let path = mt.wal().path().to_path_buf();

        const EXTRA: usize = 8;
        for _ in 0..EXTRA {
            mt.incr_ref();
        }

        // 9 references, 9 concurrent drops: exactly one thread observes
        // the zero transition and unlinks the file.
        let handles: Vec<_> = (0..=EXTRA)
            .map(|_| {
                let mt = Arc::clone(&mt);
                thread::spawn(move || mt.decr_ref())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_readers_keep_flushing_table_alive() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let opts = test_opts(&tmp);
        let (mt, _) = open_memtable(&opts, 1);
        put_plain(&mt, b"k", 1, b"v");
        let path = mt.wal().path().to_path_buf();

        // The flusher takes its own reference before the writer lets go.
        mt.incr_ref();
        mt.decr_ref().unwrap(); // writer done
        assert!(path.exists(), "flusher's reference must keep the log");

        mt.decr_ref().unwrap(); // flusher done
        assert!(!path.exists());
    }
}
