use lumodbx::{Database, DbFlags, Environment, Error, WriteFlags};
use rand::seq::SliceRandom;
use rand::thread_rng;
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::new().set_max_dbs(8).open(temp_dir.path()).unwrap();
    (temp_dir, env)
}

fn owned(item: Option<(&[u8], &[u8])>) -> Option<(Vec<u8>, Vec<u8>)> {
    item.map(|(k, v)| (k.to_vec(), v.to_vec()))
}

#[test]
fn test_cursor_walks_in_key_order() {
    let (_dir, env) = setup_test_env();
    let mut keys: Vec<String> = (0..2000).map(|i| format!("key{:05}", i)).collect();
    keys.shuffle(&mut thread_rng());

    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    for key in &keys {
        db.put(&mut txn, key.as_bytes(), key.as_bytes(), WriteFlags::empty())
            .unwrap();
    }
    txn.commit().unwrap();
    keys.sort();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = db.cursor(&txn).unwrap();
    let forward: Vec<Vec<u8>> = cursor
        .iter()
        .map(|item| item.unwrap().0.to_vec())
        .collect();
    let expected: Vec<Vec<u8>> = keys.iter().map(|k| k.as_bytes().to_vec()).collect();
    assert_eq!(forward, expected);

    // Walking backwards from the end yields the reverse order
    let mut backward = Vec::new();
    let mut item = cursor.last().unwrap();
    while let Some((k, _)) = item {
        backward.push(k.to_vec());
        item = cursor.prev().unwrap();
    }
    backward.reverse();
    assert_eq!(backward, expected);
}

#[test]
fn test_cursor_does_not_wrap() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    for key in [b"a", b"b", b"c"] {
        db.put(&mut txn, key, b"v", WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = db.cursor(&txn).unwrap();
    assert_eq!(cursor.last().unwrap().unwrap().0, b"c");
    assert!(cursor.next().unwrap().is_none());
    assert!(cursor.next().unwrap().is_none());
    assert_eq!(cursor.prev().unwrap().unwrap().0, b"b");

    assert_eq!(cursor.first().unwrap().unwrap().0, b"a");
    assert!(cursor.prev().unwrap().is_none());
    assert_eq!(cursor.get_current().unwrap().unwrap().0, b"a");
    assert_eq!(cursor.next().unwrap().unwrap().0, b"b");
}

#[test]
fn test_cursor_set_and_range() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    for i in (0..100u32).step_by(10) {
        db.put(&mut txn, &i.to_be_bytes(), &i.to_le_bytes(), WriteFlags::empty())
            .unwrap();
    }

    let mut cursor = db.cursor(&txn).unwrap();
    assert!(cursor.set(&15u32.to_be_bytes()).unwrap().is_none());
    assert_eq!(
        owned(cursor.set(&30u32.to_be_bytes()).unwrap()),
        Some((30u32.to_be_bytes().to_vec(), 30u32.to_le_bytes().to_vec()))
    );
    assert_eq!(
        cursor.set_range(&15u32.to_be_bytes()).unwrap().unwrap().0,
        &20u32.to_be_bytes()[..]
    );
    assert!(cursor.set_range(&95u32.to_be_bytes()).unwrap().is_none());
    assert_eq!(
        cursor.prev().unwrap().unwrap().0,
        &90u32.to_be_bytes()[..]
    );

    let from: Vec<u32> = cursor
        .iter_from(&55u32.to_be_bytes())
        .map(|item| u32::from_be_bytes(item.unwrap().0.try_into().unwrap()))
        .collect();
    assert_eq!(from, vec![60, 70, 80, 90]);
}

#[test]
fn test_dupsort_values_come_back_sorted() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.create_db(Some("dups"), DbFlags::DUPSORT).unwrap();
    for value in [b"delta", b"alpha", b"echo!", b"charl", b"bravo"] {
        db.put(&mut txn, b"key", value, WriteFlags::empty()).unwrap();
    }
    db.put(&mut txn, b"other", b"x", WriteFlags::empty()).unwrap();

    // Re-adding a duplicate is a no-op unless NODUPDATA is given
    db.put(&mut txn, b"key", b"alpha", WriteFlags::empty()).unwrap();
    assert!(matches!(
        db.put(&mut txn, b"key", b"alpha", WriteFlags::NODUPDATA),
        Err(Error::KeyExist)
    ));
    assert_eq!(db.stat(&txn).unwrap().entries, 6);
    assert_eq!(db.get(&txn, b"key").unwrap(), Some(&b"alpha"[..]));
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = db.cursor(&txn).unwrap();
    let dups: Vec<Vec<u8>> = cursor
        .iter_dup_of(b"key")
        .map(|item| item.unwrap().1.to_vec())
        .collect();
    assert_eq!(
        dups,
        vec![
            b"alpha".to_vec(),
            b"bravo".to_vec(),
            b"charl".to_vec(),
            b"delta".to_vec(),
            b"echo!".to_vec()
        ]
    );

    cursor.set(b"key").unwrap();
    assert_eq!(cursor.count().unwrap(), 5);
    assert_eq!(cursor.last_dup().unwrap().unwrap().1, b"echo!");
    assert_eq!(cursor.first_dup().unwrap().unwrap().1, b"alpha");
    assert_eq!(
        cursor.get_both_range(b"key", b"c").unwrap().unwrap().1,
        b"charl"
    );
    assert!(cursor.get_both(b"key", b"zulu").unwrap().is_none());
    assert_eq!(cursor.set(b"key").unwrap().unwrap().1, b"alpha");
    assert_eq!(cursor.next_nodup().unwrap().unwrap().0, b"other");
    assert!(cursor.next_dup().unwrap().is_none());
}

#[test]
fn test_dupsort_grows_into_a_subtree() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.create_db(Some("many"), DbFlags::DUPSORT).unwrap();
    let mut values: Vec<u32> = (0..3000).collect();
    values.shuffle(&mut thread_rng());
    for v in &values {
        db.put(&mut txn, b"k", &v.to_be_bytes(), WriteFlags::empty())
            .unwrap();
    }
    db.del(&mut txn, b"k", Some(&17u32.to_be_bytes())).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.stat(&txn).unwrap().entries, 2999);
    let mut cursor = db.cursor(&txn).unwrap();
    cursor.set(b"k").unwrap();
    assert_eq!(cursor.count().unwrap(), 2999);
    let seen: Vec<u32> = cursor
        .iter_dup_of(b"k")
        .map(|item| u32::from_be_bytes(item.unwrap().1.try_into().unwrap()))
        .collect();
    let expected: Vec<u32> = (0..3000).filter(|&v| v != 17).collect();
    assert_eq!(seen, expected);
}

#[test]
fn test_integer_and_reverse_keys() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let ints = txn.create_db(Some("ints"), DbFlags::INTEGERKEY).unwrap();
    let rev = txn.create_db(Some("rev"), DbFlags::REVERSEKEY).unwrap();
    for v in [300u64, 2, 70000, 1, 45] {
        ints.put(&mut txn, &v.to_le_bytes(), b"", WriteFlags::empty())
            .unwrap();
    }
    for key in [&b"ab"[..], b"ba", b"ca"] {
        rev.put(&mut txn, key, b"", WriteFlags::empty()).unwrap();
    }

    let mut cursor = ints.cursor(&txn).unwrap();
    let order: Vec<u64> = cursor
        .iter()
        .map(|item| u64::from_le_bytes(item.unwrap().0.try_into().unwrap()))
        .collect();
    assert_eq!(order, vec![1, 2, 45, 300, 70000]);

    let mut cursor = rev.cursor(&txn).unwrap();
    let order: Vec<Vec<u8>> = cursor
        .iter()
        .map(|item| item.unwrap().0.to_vec())
        .collect();
    assert_eq!(order, vec![b"ba".to_vec(), b"ca".to_vec(), b"ab".to_vec()]);
}

#[test]
fn test_rw_cursor_delete_while_walking() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();
    for i in 0..500u32 {
        db.put(&mut txn, &i.to_be_bytes(), b"value", WriteFlags::empty())
            .unwrap();
    }

    {
        let mut cursor = db.rw_cursor(&mut txn).unwrap();
        let mut item = cursor.first().unwrap().map(|(k, _)| k.to_vec());
        while let Some(key) = item {
            let n = u32::from_be_bytes(key.as_slice().try_into().unwrap());
            if n % 2 == 0 {
                cursor.del(WriteFlags::empty()).unwrap();
            }
            item = cursor.next().unwrap().map(|(k, _)| k.to_vec());
        }
        // The cursor rests on the last key once the walk ends
        assert_eq!(cursor.get_current().unwrap().unwrap().0, &499u32.to_be_bytes()[..]);
    }

    assert_eq!(db.stat(&txn).unwrap().entries, 250);
    let mut cursor = db.cursor(&txn).unwrap();
    let left: Vec<u32> = cursor
        .iter()
        .map(|item| u32::from_be_bytes(item.unwrap().0.try_into().unwrap()))
        .collect();
    let expected: Vec<u32> = (0..500).filter(|n| n % 2 == 1).collect();
    assert_eq!(left, expected);
    txn.commit().unwrap();
}

#[test]
fn test_rw_cursor_put_current() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.create_db(Some("d"), DbFlags::DUPSORT).unwrap();

    {
        let mut cursor = db.rw_cursor(&mut txn).unwrap();
        cursor.put(b"a", b"1", WriteFlags::empty()).unwrap();
        cursor.put(b"a", b"3", WriteFlags::empty()).unwrap();
        cursor.put(b"b", b"9", WriteFlags::empty()).unwrap();
        assert_eq!(cursor.get_current().unwrap().unwrap(), (&b"b"[..], &b"9"[..]));

        cursor.get_both(b"a", b"3").unwrap();
        cursor.put(b"a", b"2", WriteFlags::CURRENT).unwrap();
        assert_eq!(cursor.get_current().unwrap().unwrap(), (&b"a"[..], &b"2"[..]));
        assert!(matches!(
            cursor.put(b"b", b"0", WriteFlags::CURRENT),
            Err(Error::NotFound)
        ));

        cursor.set(b"a").unwrap();
        cursor.del(WriteFlags::ALLDUPS).unwrap();
        assert_eq!(cursor.next().unwrap().unwrap(), (&b"b"[..], &b"9"[..]));
    }

    assert!(db.get(&txn, b"a").unwrap().is_none());
    assert_eq!(db.stat(&txn).unwrap().entries, 1);
    txn.commit().unwrap();
}
