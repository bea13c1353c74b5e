// Integration tests for the storage core: resources, transactions,
// the committer, and the garbage collector working together.

#[cfg(test)]
mod store_integration_tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use stowdb::{Config, Database, StoreError};

    fn open_db(dir: &tempfile::TempDir) -> Database {
        let mut config = Config::new(dir.path().join("db"));
        // Passes are driven explicitly so the tests are deterministic.
        config.gc_enabled = false;
        Database::open(config).unwrap()
    }

    #[test]
    fn test_stow_load_round_trip_and_reclaim() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);

        // Stow through a transaction and load while it is live.
        let h = {
            let mut tx = db.begin();
            let h = tx.stow_resource(b"hello").unwrap();
            assert_eq!(db.load_resource(&h).unwrap(), b"hello");
            h
        };

        // The owning transaction dropped without writing a reference,
        // so after the next commit cycle and one collection pass the
        // resource is gone.
        assert!(db.sync().unwrap().wait().unwrap());
        db.run_gc_once().unwrap();
        assert_eq!(db.try_load_resource(&h).unwrap(), None);
        assert!(matches!(
            db.load_resource(&h),
            Err(StoreError::MissingResource(missing)) if missing == h
        ));
    }

    #[test]
    fn test_transactional_cas_first_wins() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);

        let mut a = db.begin();
        assert!(a.read_key(b"k").unwrap().is_empty());
        a.write_key(b"k", b"1").unwrap();

        let mut b = db.begin();
        assert!(b.read_key(b"k").unwrap().is_empty());
        b.write_key(b"k", b"2").unwrap();

        let a_commit = a.commit().unwrap();
        let b_commit = b.commit().unwrap();
        assert!(a_commit.wait().unwrap());
        assert!(!b_commit.wait().unwrap());
        assert_eq!(db.read_key(b"k").unwrap(), b"1");
    }

    #[test]
    fn test_on_disk_reference_prevents_collection() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);

        // Write a value embedding the hash in plain text.
        let h = {
            let mut tx = db.begin();
            let h = tx.stow_resource(b"small binary").unwrap();
            let mut value = b"prefix ".to_vec();
            value.extend_from_slice(h.as_bytes());
            value.extend_from_slice(b" suffix");
            tx.write_key(b"root", &value).unwrap();
            assert!(tx.commit().unwrap().wait().unwrap());
            h
        };

        // Conservative scanning of the stored value keeps it alive.
        db.run_gc_once().unwrap();
        assert_eq!(db.load_resource(&h).unwrap(), b"small binary");

        // Unbinding the key makes it garbage.
        assert!(db.write_key(b"root", b"").unwrap().wait().unwrap());
        db.run_gc_once().unwrap();
        assert_eq!(db.try_load_resource(&h).unwrap(), None);
    }

    #[test]
    fn test_ephemeral_root_prevents_collection() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);

        // Stow, commit the write that persists the resource, and keep
        // the transaction (and so its roots) alive across the pass.
        let mut holder = db.begin();
        let h = holder.stow_resource(b"held payload").unwrap();
        let mut tx = db.begin();
        tx.write_key(b"unrelated", b"x").unwrap();
        assert!(tx.commit().unwrap().wait().unwrap());

        db.run_gc_once().unwrap();
        assert_eq!(db.load_resource(&h).unwrap(), b"held payload");

        // Dropping the holder releases the only root.
        drop(holder);
        assert!(db.sync().unwrap().wait().unwrap());
        db.run_gc_once().unwrap();
        assert_eq!(db.try_load_resource(&h).unwrap(), None);
    }

    #[test]
    fn test_transitive_references_survive() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);

        // inner <- outer <- key: only the outer hash appears in the
        // stored value, the inner one is reachable through tracing.
        let (inner, outer) = {
            let mut tx = db.begin();
            let inner = tx.stow_resource(b"inner payload").unwrap();
            let mut outer_bytes = b"wraps ".to_vec();
            outer_bytes.extend_from_slice(inner.as_bytes());
            let outer = tx.stow_resource(&outer_bytes).unwrap();
            tx.write_key(b"root", outer.as_bytes()).unwrap();
            assert!(tx.commit().unwrap().wait().unwrap());
            (inner, outer)
        };

        db.run_gc_once().unwrap();
        assert!(db.has_resource(&outer).unwrap());
        assert!(db.has_resource(&inner).unwrap());

        assert!(db.write_key(b"root", b"").unwrap().wait().unwrap());
        db.run_gc_once().unwrap();
        assert_eq!(db.try_load_resource(&outer).unwrap(), None);
        assert_eq!(db.try_load_resource(&inner).unwrap(), None);
    }

    #[test]
    fn test_read_keys_snapshot_consistency() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        assert!(db.write_key(b"a", b"0").unwrap().wait().unwrap());
        assert!(db.write_key(b"b", b"0").unwrap().wait().unwrap());

        let stop = Arc::new(AtomicBool::new(false));
        let writer = {
            let db = db.clone();
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut round: u32 = 1;
                while !stop.load(Ordering::SeqCst) {
                    let value = round.to_string();
                    let mut writes = BTreeMap::new();
                    writes.insert(b"a".to_vec(), value.as_bytes().to_vec());
                    writes.insert(b"b".to_vec(), value.as_bytes().to_vec());
                    let commit = db.atomic_update(BTreeMap::new(), writes).unwrap();
                    assert!(commit.wait().unwrap());
                    round += 1;
                }
            })
        };

        // Both keys always move together: a mixed slice means the
        // snapshot leaked a half-applied batch.
        for _ in 0..500 {
            let slice = db.read_keys(&[&b"a"[..], &b"b"[..]]).unwrap();
            assert_eq!(slice[0], slice[1], "torn read of a committed batch");
        }

        stop.store(true, Ordering::SeqCst);
        writer.join().unwrap();
    }

    #[test]
    fn test_contended_counter_converges() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        assert!(db.write_key(b"counter", b"0").unwrap().wait().unwrap());

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        // Optimistic retry loop around a CAS increment.
                        loop {
                            let mut tx = db.begin();
                            let current = tx.read_key(b"counter").unwrap();
                            let n: u64 =
                                String::from_utf8(current).unwrap().parse().unwrap();
                            tx.write_key(b"counter", (n + 1).to_string().as_bytes())
                                .unwrap();
                            if tx.commit().unwrap().wait().unwrap() {
                                break;
                            }
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(db.read_key(b"counter").unwrap(), b"100");
    }

    #[test]
    fn test_reopen_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let h;
        {
            let db = open_db(&dir);
            let mut tx = db.begin();
            h = tx.stow_resource(b"durable payload").unwrap();
            tx.write_key(b"name", h.as_bytes()).unwrap();
            assert!(tx.commit().unwrap().wait().unwrap());
        }
        {
            let db = open_db(&dir);
            assert_eq!(db.read_key(b"name").unwrap(), h.as_bytes());
            assert_eq!(db.load_resource(&h).unwrap(), b"durable payload");
        }
    }

    #[test]
    fn test_background_collector_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(dir.path().join("db"));
        config.gc_interval = std::time::Duration::from_millis(20);
        let db = Database::open(config).unwrap();

        let h = {
            let mut tx = db.begin();
            tx.stow_resource(b"short lived").unwrap()
        };
        assert!(db.sync().unwrap().wait().unwrap());

        // The background worker reclaims the unreferenced resource.
        let mut reclaimed = false;
        for _ in 0..100 {
            if db.try_load_resource(&h).unwrap().is_none() {
                reclaimed = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(reclaimed, "collector never reclaimed the resource");
        assert!(db.gc_stats().passes >= 1);
    }
}
