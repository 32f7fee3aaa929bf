use tailstore::bufferpool::BufferPool;
use tailstore::errors::DatabaseError;

fn pool_with_capacity(dir: &tempfile::TempDir, capacity: usize) -> BufferPool {
    BufferPool::new(dir.path(), capacity).unwrap()
}

#[test]
fn test_simple_write() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool_with_capacity(&dir, 8);

    let page_id = "grades_1_0_0".to_string();
    pool.write_value(&page_id, 0, 42).unwrap();

    assert_eq!(pool.read_value(&page_id, 0).unwrap(), 42);
    // Fresh pages are zero-filled.
    assert_eq!(pool.read_value(&page_id, 5).unwrap(), 0);
}

#[test]
fn test_read_of_unknown_page_fails() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool_with_capacity(&dir, 8);

    assert!(matches!(
        pool.read_value(&"nowhere_1_0_0".to_string(), 0),
        Err(DatabaseError::PageNotFound(_))
    ));
}

#[test]
fn test_eviction_writes_dirty_pages_through() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool_with_capacity(&dir, 2);

    // Three pages through a two-frame pool forces an eviction.
    for (index, page_id) in ["t_1_0_0", "t_1_1_0", "t_1_2_0"].iter().enumerate() {
        pool.write_value(&page_id.to_string(), 3, index as i64).unwrap();
    }

    assert_eq!(pool.resident_pages(), 2);

    // The evicted page faults back in with its last written value.
    for (index, page_id) in ["t_1_0_0", "t_1_1_0", "t_1_2_0"].iter().enumerate() {
        assert_eq!(pool.read_value(&page_id.to_string(), 3).unwrap(), index as i64);
    }
}

#[test]
fn test_pinned_pages_are_not_evicted() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool_with_capacity(&dir, 1);

    let pinned = "t_1_0_0".to_string();
    pool.write_value(&pinned, 0, 7).unwrap();
    pool.pin_page(&pinned).unwrap();

    // The only frame is pinned, so the pool grows past capacity instead of
    // evicting it.
    pool.write_value(&"t_1_1_0".to_string(), 0, 8).unwrap();
    assert_eq!(pool.resident_pages(), 2);

    pool.unpin_page(&pinned).unwrap();
    pool.write_value(&"t_1_2_0".to_string(), 0, 9).unwrap();
    assert!(pool.resident_pages() <= 2);
}

#[test]
fn test_copy_page_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool_with_capacity(&dir, 8);

    let source = "t_1_0_0".to_string();
    let dest = "t_1_0_1".to_string();
    pool.write_value(&source, 2, 99).unwrap();

    pool.copy_page(&source, &dest).unwrap();
    assert_eq!(pool.read_value(&dest, 2).unwrap(), 99);

    // Copies diverge from their source after the fact.
    pool.write_value(&dest, 2, 100).unwrap();
    assert_eq!(pool.read_value(&source, 2).unwrap(), 99);
    assert_eq!(pool.read_value(&dest, 2).unwrap(), 100);

    // A second copy under the same identity is rejected.
    assert!(matches!(
        pool.copy_page(&source, &dest),
        Err(DatabaseError::PageExists(_))
    ));
}

#[test]
fn test_copy_rejects_on_disk_destination() {
    let dir = tempfile::tempdir().unwrap();

    {
        let pool = pool_with_capacity(&dir, 8);
        pool.write_value(&"t_1_0_1".to_string(), 0, 1).unwrap();
        pool.evict_all().unwrap();
    }

    // Destination exists only on disk now; still rejected.
    let pool = pool_with_capacity(&dir, 8);
    pool.write_value(&"t_1_0_0".to_string(), 0, 2).unwrap();
    assert!(matches!(
        pool.copy_page(&"t_1_0_0".to_string(), &"t_1_0_1".to_string()),
        Err(DatabaseError::PageExists(_))
    ));
}

#[test]
fn test_evict_all_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool_with_capacity(&dir, 16);

    for slot in 0..10 {
        pool.write_value(&"t_1_0_0".to_string(), slot, slot as i64 * 11).unwrap();
    }
    pool.write_value(&"t_1_1_0".to_string(), 0, i64::MIN).unwrap();

    pool.evict_all().unwrap();
    assert_eq!(pool.resident_pages(), 0);

    for slot in 0..10 {
        assert_eq!(
            pool.read_value(&"t_1_0_0".to_string(), slot).unwrap(),
            slot as i64 * 11
        );
    }
    assert_eq!(pool.read_value(&"t_1_1_0".to_string(), 0).unwrap(), i64::MIN);
}

#[test]
fn test_values_survive_pool_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let pool = pool_with_capacity(&dir, 4);
        pool.write_value(&"t_1_0_0".to_string(), 8, -12345).unwrap();
        pool.evict_all().unwrap();
    }

    let pool = pool_with_capacity(&dir, 4);
    assert_eq!(pool.read_value(&"t_1_0_0".to_string(), 8).unwrap(), -12345);
}
