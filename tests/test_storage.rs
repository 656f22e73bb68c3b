use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;

use lumodbx::constants::DATA_FILENAME;
use lumodbx::page::{large_pages_needed, max_inline_data_size};
use lumodbx::{Database, EnvFlags, Environment, Error, Geometry, Transaction, WriteFlags};
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::new().open(temp_dir.path()).unwrap();
    (temp_dir, env)
}

fn put_one(env: &Environment, key: &[u8], value: &[u8]) {
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    db.put(&mut txn, key, value, WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_large_value_boundary() {
    let (_dir, env) = setup_test_env();
    let page_size = 4096;
    let inline = max_inline_data_size(page_size, 1);
    let mut rng = thread_rng();
    let small: Vec<u8> = (0..inline).map(|_| rng.gen()).collect();
    let big: Vec<u8> = (0..inline + 1).map(|_| rng.gen()).collect();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    db.put(&mut txn, b"s", &small, WriteFlags::empty()).unwrap();
    assert_eq!(db.stat(&txn).unwrap().overflow_pages, 0);

    db.put(&mut txn, b"b", &big, WriteFlags::empty()).unwrap();
    let expected_pages = large_pages_needed(page_size, big.len());
    assert_eq!(db.stat(&txn).unwrap().overflow_pages, expected_pages);
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"s").unwrap(), Some(&small[..]));
    assert_eq!(db.get(&txn, b"b").unwrap(), Some(&big[..]));
    drop(txn);

    // Replacing a large value with a short one frees its pages
    put_one(&env, b"b", b"short");
    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.stat(&txn).unwrap().overflow_pages, 0);
    assert_eq!(db.get(&txn, b"b").unwrap(), Some(&b"short"[..]));
}

#[test]
fn test_many_keys_build_a_deep_tree() {
    let (_dir, env) = setup_test_env();
    let mut keys: Vec<u64> = (0..100_000).collect();
    keys.shuffle(&mut thread_rng());

    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    for k in &keys {
        db.put(&mut txn, &k.to_be_bytes(), &k.to_le_bytes(), WriteFlags::empty())
            .unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let stat = db.stat(&txn).unwrap();
    assert_eq!(stat.entries, 100_000);
    assert_eq!(stat.depth, 3);
    assert!(stat.branch_pages > 1);
    for k in keys.iter().take(1000) {
        assert_eq!(db.get(&txn, &k.to_be_bytes()).unwrap(), Some(&k.to_le_bytes()[..]));
    }
    drop(txn);

    // Deleting everything collapses the tree again
    let mut txn = env.begin_rw_txn().unwrap();
    for k in &keys {
        db.del(&mut txn, &k.to_be_bytes(), None).unwrap();
    }
    let stat = db.stat(&txn).unwrap();
    assert_eq!(stat.entries, 0);
    assert_eq!(stat.depth, 0);
    assert_eq!(stat.leaf_pages + stat.branch_pages, 0);
    txn.commit().unwrap();
}

#[test]
fn test_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let env = Environment::new().open(dir.path()).unwrap();
        let mut txn = env.begin_rw_txn().unwrap();
        let db = Database::open(&txn, None).unwrap();
        for i in 0..1000u32 {
            db.put(&mut txn, &i.to_be_bytes(), format!("v{}", i).as_bytes(), WriteFlags::empty())
                .unwrap();
        }
        txn.commit().unwrap();
    }

    let env = Environment::new().open(dir.path()).unwrap();
    let txn = env.begin_ro_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    assert_eq!(db.stat(&txn).unwrap().entries, 1000);
    assert_eq!(db.get(&txn, &999u32.to_be_bytes()).unwrap(), Some(&b"v999"[..]));
    assert_eq!(txn.id(), 2);
}

#[test]
fn test_torn_meta_falls_back_to_previous_commit() {
    let dir = TempDir::new().unwrap();
    let torn_slot = {
        let env = Environment::new().open(dir.path()).unwrap();
        put_one(&env, b"first", b"1");
        put_one(&env, b"second", b"2");
        env.info().unwrap().head_slot
    };

    // Break txnid_b of the newest meta, as a write cut short would
    let page_size = 4096u64;
    let file = OpenOptions::new()
        .write(true)
        .open(dir.path().join(DATA_FILENAME))
        .unwrap();
    file.write_all_at(&[0xFF; 8], torn_slot as u64 * page_size + 20 + 176)
        .unwrap();
    drop(file);

    let env = Environment::new().open(dir.path()).unwrap();
    let info = env.info().unwrap();
    assert_eq!(info.last_txnid, 2);
    assert_ne!(info.head_slot, torn_slot);

    let txn = env.begin_ro_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    assert_eq!(db.get(&txn, b"first").unwrap(), Some(&b"1"[..]));
    assert!(db.get(&txn, b"second").unwrap().is_none());
    drop(txn);

    // The next commit reuses the torn slot
    put_one(&env, b"third", b"3");
    let info = env.info().unwrap();
    assert_eq!(info.last_txnid, 3);
    assert_eq!(info.head_slot, torn_slot);
}

#[test]
fn test_weak_commits_fall_back_to_the_steady_snapshot() {
    let dir = TempDir::new().unwrap();
    {
        let env = Environment::new().open(dir.path()).unwrap();
        let mut txn = env.begin_rw_txn().unwrap();
        let db = Database::open(&txn, None).unwrap();
        for i in 0..300u32 {
            db.put(&mut txn, &i.to_be_bytes(), &[1u8; 40], WriteFlags::empty())
                .unwrap();
        }
        txn.commit().unwrap();

        // Each round rewrites every page of the steady snapshot
        env.set_flags(EnvFlags::NOSYNC, true).unwrap();
        for round in 2..8u8 {
            let mut txn = env.begin_rw_txn().unwrap();
            for i in 0..300u32 {
                db.put(&mut txn, &i.to_be_bytes(), &[round; 40], WriteFlags::empty())
                    .unwrap();
            }
            db.del(&mut txn, &(round as u32).to_be_bytes(), None).unwrap();
            txn.commit().unwrap();
        }
        assert_eq!(env.info().unwrap().last_txnid, 8);
    }

    // Metas written before a reboot carry another boot id
    let page_size = 4096u64;
    let file = OpenOptions::new()
        .write(true)
        .open(dir.path().join(DATA_FILENAME))
        .unwrap();
    for slot in 0..3u64 {
        file.write_all_at(&[0x5A; 16], slot * page_size + 20 + 192)
            .unwrap();
    }
    drop(file);

    let env = Environment::new().open(dir.path()).unwrap();
    assert_eq!(env.info().unwrap().last_txnid, 2);
    {
        let txn = env.begin_ro_txn().unwrap();
        let db = Database::open(&txn, None).unwrap();
        assert_eq!(db.stat(&txn).unwrap().entries, 300);
        let mut cursor = db.cursor(&txn).unwrap();
        let mut expected = 0u32;
        for item in cursor.iter() {
            let (key, value) = item.unwrap();
            assert_eq!(key, &expected.to_be_bytes()[..]);
            assert_eq!(value, &[1u8; 40][..]);
            expected += 1;
        }
        assert_eq!(expected, 300);
    }

    put_one(&env, b"after", b"reboot");
    assert_eq!(env.info().unwrap().last_txnid, 3);
}

#[test]
fn test_sequential_keys_all_come_back() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    for k in 0..100_000u64 {
        db.put(&mut txn, &k.to_be_bytes(), &k.to_le_bytes(), WriteFlags::empty())
            .unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let stat = db.stat(&txn).unwrap();
    assert_eq!(stat.entries, 100_000);
    assert!(stat.depth >= 2);
    for k in 0..100_000u64 {
        assert_eq!(
            db.get(&txn, &k.to_be_bytes()).unwrap(),
            Some(&k.to_le_bytes()[..]),
            "key {}",
            k
        );
    }

    let mut cursor = db.cursor(&txn).unwrap();
    let mut expected = 0u64;
    for item in cursor.iter() {
        let (key, value) = item.unwrap();
        assert_eq!(key, &expected.to_be_bytes()[..]);
        assert_eq!(value, &expected.to_le_bytes()[..]);
        expected += 1;
    }
    assert_eq!(expected, 100_000);
}

#[test]
fn test_freed_pages_are_reused_newest_first() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    for i in 0..400u32 {
        db.put(&mut txn, &i.to_be_bytes(), &[7u8; 32], WriteFlags::empty())
            .unwrap();
    }
    txn.commit().unwrap();

    // Rewriting one key retires the committed pages on its path
    let mut txn = env.begin_rw_txn().unwrap();
    db.put(&mut txn, &5u32.to_be_bytes(), &[8u8; 32], WriteFlags::empty())
        .unwrap();
    let retired = txn.retired_pages();
    let freeing_txn = txn.id();
    assert!(!retired.is_empty());
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let entries = txn.gc_entries().unwrap();
    let (txnid, reusable) = entries.last().cloned().unwrap();
    assert_eq!(txnid, freeing_txn);
    for pgno in &retired {
        assert!(reusable.contains(pgno));
    }
    drop(txn);

    // With no reader on the old snapshot, the next writer takes those pages
    let mut txn = env.begin_rw_txn().unwrap();
    db.put(&mut txn, &6u32.to_be_bytes(), &[9u8; 32], WriteFlags::empty())
        .unwrap();
    let dirty = txn.dirty_pgnos();
    assert!(!dirty.is_empty());
    for pgno in &dirty {
        assert!(reusable.contains(pgno), "page {} was not reused", pgno);
    }
    txn.commit().unwrap();
}

#[test]
fn test_reader_pins_freed_pages() {
    let (_dir, env) = setup_test_env();
    put_one(&env, b"a", &[1u8; 100]);
    put_one(&env, b"a", &[2u8; 100]);

    // This reader keeps the snapshot of txn 3 alive
    let reader = env.begin_ro_txn().unwrap();
    assert_eq!(reader.id(), 3);
    put_one(&env, b"a", &[3u8; 100]);

    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    db.put(&mut txn, b"a", &[4u8; 100], WriteFlags::empty()).unwrap();
    let entries = txn.gc_entries().unwrap();
    let (_, pinned) = entries.iter().find(|(txnid, _)| *txnid == 4).unwrap();
    for pgno in txn.dirty_pgnos() {
        assert!(!pinned.contains(&pgno), "page {} is still visible to a reader", pgno);
    }
    txn.commit().unwrap();

    assert_eq!(db.get(&reader, b"a").unwrap(), Some(&[2u8; 100][..]));
    assert_eq!(env.reader_list().len(), 1);
    drop(reader);
    assert!(env.reader_list().is_empty());
}

#[test]
fn test_reserve_fills_in_place() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();

    let buf = txn.reserve(db, b"small", 10, WriteFlags::empty()).unwrap();
    assert_eq!(buf, &[0u8; 10][..]);
    buf.copy_from_slice(b"0123456789");

    let big = txn.reserve(db, b"big", 20_000, WriteFlags::empty()).unwrap();
    for (i, byte) in big.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"small").unwrap(), Some(&b"0123456789"[..]));
    let big = db.get(&txn, b"big").unwrap().unwrap();
    assert_eq!(big.len(), 20_000);
    assert!(big.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
}

#[test]
fn test_map_full_poisons_the_transaction() {
    let dir = TempDir::new().unwrap();
    let env = Environment::new()
        .set_geometry(Geometry {
            size_lower: 0,
            size_now: 0,
            size_upper: 16 * 4096,
            growth_step: 4096,
        })
        .open(dir.path())
        .unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    let mut hit = None;
    for i in 0..20u32 {
        if let Err(e) = db.put(&mut txn, &i.to_be_bytes(), &[1u8; 8000], WriteFlags::empty()) {
            hit = Some(e);
            break;
        }
    }
    assert!(matches!(hit, Some(Error::MapFull)));
    assert!(matches!(
        db.put(&mut txn, b"x", b"y", WriteFlags::empty()),
        Err(Error::BadTxn)
    ));
    assert!(matches!(txn.commit(), Err(Error::BadTxn)));

    // Nothing of the failed transaction reached the file
    put_one(&env, b"ok", b"1");
    let txn = env.begin_ro_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    assert_eq!(db.stat(&txn).unwrap().entries, 1);
    assert!(env.info().unwrap().file_size <= 16 * 4096);
}

#[test]
fn test_writemap_and_nosync_modes() {
    for flags in [EnvFlags::WRITEMAP, EnvFlags::NOSYNC, EnvFlags::WRITEMAP | EnvFlags::NOMETASYNC] {
        let dir = TempDir::new().unwrap();
        {
            let env = Environment::new().set_flags(flags).open(dir.path()).unwrap();
            for i in 0..50u32 {
                put_one(&env, &i.to_be_bytes(), &[i as u8; 300]);
            }
            env.sync(true).unwrap();
        }
        let env = Environment::new().open(dir.path()).unwrap();
        let txn = env.begin_ro_txn().unwrap();
        let db = Database::open(&txn, None).unwrap();
        assert_eq!(db.stat(&txn).unwrap().entries, 50);
        assert_eq!(
            db.get(&txn, &49u32.to_be_bytes()).unwrap(),
            Some(&[49u8; 300][..])
        );
        assert_eq!(txn.id(), 51);
    }
}
