use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use tailstore::bufferpool::BufferPool;
use tailstore::constants::{MERGE_TAIL_THRESHOLD, SLOTS_PER_PAGE};
use tailstore::rid::RID;
use tailstore::table::{Table, TableOptions};

const NUM_COLS: usize = 5;
const ALL: [usize; 5] = [1, 1, 1, 1, 1];

struct Fixture {
    _dir: tempfile::TempDir,
    table: Arc<Table>,
}

fn fixture(options: TableOptions) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(BufferPool::new(dir.path(), 64).unwrap());
    let table = Table::create("ledger", NUM_COLS, 0, options, pool, dir.path()).unwrap();

    Fixture { _dir: dir, table }
}

fn select(table: &Table, key: i64) -> Vec<i64> {
    let rid = table.rid_for_key(key).unwrap();
    table.get_latest_column_values(&[rid], &ALL).unwrap().remove(0)
}

/// Block until the background merger advances the range watermark.
fn wait_for_watermark(table: &Table, range: usize, expected: RID) {
    for _ in 0..1000 {
        if table.range_watermark(range) == Some(expected) {
            return;
        }
        sleep(Duration::from_millis(5));
    }
    panic!(
        "merge watermark never reached {} (currently {:?})",
        expected,
        table.range_watermark(range)
    );
}

#[test]
fn merge_consolidates_sealed_tail_history_into_the_base_image() {
    let fixture = fixture(TableOptions {
        secondary: None,
        ..TableOptions::default()
    });

    fixture.table.insert_record(&[1, 0, 0, 0, 0]).unwrap();

    // One zeroth row plus these updates crosses the merge threshold of
    // sealed tail pages.
    let sealed_rows = (MERGE_TAIL_THRESHOLD * SLOTS_PER_PAGE) as i64;
    let updates = sealed_rows + 100;
    for value in 1..=updates {
        fixture
            .table
            .update_record(1, &[None, Some(value), None, None, None])
            .unwrap();
    }

    // The newest tail RID inside the sealed pages bounds the watermark.
    wait_for_watermark(&fixture.table, 0, -sealed_rows);

    // Reads remain correct: updates past the watermark live in the chain.
    assert_eq!(select(&fixture.table, 1), vec![1, updates, 0, 0, 0]);

    // The base image itself now carries the newest merged update. Row 1 of
    // the sealed pages was the zeroth copy, so the last sealed row holds
    // update number `sealed_rows - 1`.
    let chain = fixture.table.tail_chain(1).unwrap();
    let base_row = &chain[0].1;
    assert_eq!(base_row[1], sealed_rows - 1);
}

#[test]
fn updates_after_a_merge_stay_visible() {
    let fixture = fixture(TableOptions {
        secondary: None,
        ..TableOptions::default()
    });

    fixture.table.insert_record(&[7, 0, 0, 0, 0]).unwrap();

    let sealed_rows = (MERGE_TAIL_THRESHOLD * SLOTS_PER_PAGE) as i64;
    for value in 1..=sealed_rows {
        fixture
            .table
            .update_record(7, &[None, None, Some(value), None, None])
            .unwrap();
    }
    wait_for_watermark(&fixture.table, 0, -sealed_rows);

    fixture
        .table
        .update_record(7, &[None, None, Some(-1), None, None])
        .unwrap();
    assert_eq!(select(&fixture.table, 7), vec![7, 0, -1, 0, 0]);
}

#[test]
fn merge_handles_many_records_across_base_pages() {
    let fixture = fixture(TableOptions {
        secondary: None,
        ..TableOptions::default()
    });

    // Two base pages worth of records.
    let record_count = (SLOTS_PER_PAGE + 50) as i64;
    for key in 0..record_count {
        fixture.table.insert_record(&[key, 0, 0, 0, 0]).unwrap();
    }

    // Three rounds of updates: every record's chain grows, tail pages seal,
    // and at least one merge pass runs.
    for round in 1..=3i64 {
        for key in 0..record_count {
            fixture
                .table
                .update_record(key, &[None, Some(key * 10 + round), None, None, None])
                .unwrap();
        }
    }

    // Wait until some merge pass has published a watermark.
    for _ in 0..1000 {
        if fixture.table.range_watermark(0).unwrap_or(0) != 0 {
            break;
        }
        sleep(Duration::from_millis(5));
    }
    assert_ne!(fixture.table.range_watermark(0), Some(0));

    for key in 0..record_count {
        assert_eq!(select(&fixture.table, key), vec![key, key * 10 + 3, 0, 0, 0]);
    }
}

#[test]
fn inserts_racing_a_merge_are_not_lost() {
    let fixture = fixture(TableOptions {
        secondary: None,
        ..TableOptions::default()
    });

    fixture.table.insert_record(&[1, 11, 0, 0, 0]).unwrap();

    let sealed_rows = (MERGE_TAIL_THRESHOLD * SLOTS_PER_PAGE) as i64;
    for value in 1..=sealed_rows {
        fixture
            .table
            .update_record(1, &[None, Some(value), None, None, None])
            .unwrap();
    }

    // Insert into the same base page while the merge pass may be running,
    // then again after it finished.
    fixture.table.insert_record(&[2, 22, 0, 0, 0]).unwrap();
    wait_for_watermark(&fixture.table, 0, -sealed_rows);
    fixture.table.insert_record(&[3, 33, 0, 0, 0]).unwrap();

    assert_eq!(select(&fixture.table, 1), vec![1, sealed_rows, 0, 0, 0]);
    assert_eq!(select(&fixture.table, 2), vec![2, 22, 0, 0, 0]);
    assert_eq!(select(&fixture.table, 3), vec![3, 33, 0, 0, 0]);
}

#[test]
fn non_cumulative_merge_consolidates_per_column() {
    let fixture = fixture(TableOptions {
        cumulative: false,
        secondary: None,
        ..TableOptions::default()
    });

    fixture.table.insert_record(&[1, 10, 20, 30, 40]).unwrap();
    fixture.table.insert_record(&[2, 0, 0, 0, 0]).unwrap();

    // Alternate single-column updates; no tail row carries the full record.
    // A few extra rows past the threshold make sure the third page seals.
    let sealed_rows = (MERGE_TAIL_THRESHOLD * SLOTS_PER_PAGE) as i64;
    let updates = sealed_rows + 10;
    for value in 1..=updates {
        let key = 1 + (value % 2);
        let mut update = [None; NUM_COLS];
        update[(value as usize % 3) + 1] = Some(value);
        fixture.table.update_record(key, &update).unwrap();
    }

    // Wait for a merge pass, then verify stitched reads agree with a chain
    // walk done before and after.
    for _ in 0..1000 {
        if fixture.table.range_watermark(0).unwrap_or(0) != 0 {
            break;
        }
        sleep(Duration::from_millis(5));
    }
    assert_ne!(fixture.table.range_watermark(0), Some(0));

    // Recompute the expected latest value per column per key.
    let mut expected = [[0i64; NUM_COLS]; 2];
    expected[0] = [1, 10, 20, 30, 40];
    expected[1] = [2, 0, 0, 0, 0];
    for value in 1..=updates {
        let key_index = (value % 2) as usize;
        expected[key_index][(value as usize % 3) + 1] = value;
    }

    assert_eq!(select(&fixture.table, 1), expected[0].to_vec());
    assert_eq!(select(&fixture.table, 2), expected[1].to_vec());
}
