use lumodbx::{Database, DbFlags, Environment, Error, Transaction, WriteFlags};
use tempfile::TempDir;

// Common test setup
fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::new().set_max_dbs(4).open(temp_dir.path()).unwrap();
    (temp_dir, env)
}

#[test]
fn test_database_open_close() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();

    // Test opening default database
    let db = Database::open(&txn, None).unwrap();
    assert_eq!(db.flags(&txn).unwrap(), DbFlags::empty());

    // Named databases must be created before they can be opened
    assert!(matches!(Database::open(&txn, Some("testdb")), Err(Error::NotFound)));
    let named = Database::create(&mut txn, Some("testdb"), DbFlags::DUPSORT).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let reopened = Database::open(&txn, Some("testdb")).unwrap();
    assert_eq!(reopened, named);
    assert_eq!(reopened.flags(&txn).unwrap(), DbFlags::DUPSORT);
}

#[test]
fn test_basic_put_get() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();

    // Test putting and getting data
    let key = b"test_key";
    let value = b"test_value";

    db.put(&mut txn, key, value, WriteFlags::empty()).unwrap();
    assert_eq!(db.get(&txn, key).unwrap(), Some(&value[..]));
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, key).unwrap(), Some(&value[..]));
}

#[test]
fn test_delete_operations() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();

    // Insert and then delete data
    let key = b"delete_key";
    let value = b"delete_value";

    db.put(&mut txn, key, value, WriteFlags::empty()).unwrap();
    assert!(db.get(&txn, key).unwrap().is_some());

    db.del(&mut txn, key, None).unwrap();
    assert!(db.get(&txn, key).unwrap().is_none());
    assert!(matches!(db.del(&mut txn, key, None), Err(Error::NotFound)));

    // A missing key does not poison the transaction
    db.put(&mut txn, b"after", b"miss", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_database_stats() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();

    // Get initial stats
    let stats = db.stat(&txn).unwrap();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.depth, 0);

    // Add some entries and check stats
    for i in 0..5 {
        let key = format!("key_{}", i);
        let value = format!("value_{}", i);
        db.put(&mut txn, key.as_bytes(), value.as_bytes(), WriteFlags::empty())
            .unwrap();
    }

    let stats = db.stat(&txn).unwrap();
    assert_eq!(stats.entries, 5);
    assert_eq!(stats.depth, 1);
    assert_eq!(stats.leaf_pages, 1);
    assert_eq!(stats.page_size, 4096);
    txn.commit().unwrap();

    assert_eq!(env.stat().unwrap().entries, 5);
}

#[test]
fn test_error_handling() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None).unwrap();

    // Test key not found
    let result = db.get(&txn, b"nonexistent_key").unwrap();
    assert!(result.is_none());

    // Test duplicate key with NOOVERWRITE flag
    let key = b"unique_key";
    let value1 = b"value1";
    let value2 = b"value2";

    db.put(&mut txn, key, value1, WriteFlags::empty()).unwrap();
    let result = db.put(&mut txn, key, value2, WriteFlags::NOOVERWRITE);
    assert!(matches!(result, Err(Error::KeyExist)));
    assert_eq!(db.get(&txn, key).unwrap(), Some(&value1[..]));

    // Keys past the page-size limit are rejected up front
    let long_key = vec![b'k'; env.get_max_key_size() as usize + 1];
    assert!(matches!(
        db.put(&mut txn, &long_key, b"v", WriteFlags::empty()),
        Err(Error::KeyTooLarge { .. })
    ));
    assert!(matches!(
        db.put(&mut txn, b"", b"v", WriteFlags::empty()),
        Ok(())
    ));

    // A second writer cannot start while this one runs
    assert!(matches!(env.try_begin_rw_txn(), Err(Error::Busy)));
    txn.commit().unwrap();
    assert!(env.try_begin_rw_txn().is_ok());
}

#[test]
fn test_transaction_isolation() {
    let (_dir, env) = setup_test_env();

    // Write transaction
    let mut write_txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&write_txn, None).unwrap();
    db.put(&mut write_txn, b"key", b"value", WriteFlags::empty())
        .unwrap();

    // Read transaction shouldn't see uncommitted changes
    let read_txn = env.begin_ro_txn().unwrap();
    let result = db.get(&read_txn, b"key").unwrap();
    assert!(result.is_none());

    // After commit, changes should be visible to new readers only
    write_txn.commit().unwrap();
    assert!(db.get(&read_txn, b"key").unwrap().is_none());
    let read_txn = env.begin_ro_txn().unwrap();
    let result = db.get(&read_txn, b"key").unwrap();
    assert_eq!(result.unwrap(), b"value");
    assert_eq!(read_txn.id(), 2);
}
