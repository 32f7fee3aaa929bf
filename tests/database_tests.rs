use tailstore::database::Database;
use tailstore::errors::DatabaseError;
use tailstore::secondary::SecondaryStructure;
use tailstore::table::{Table, TableOptions};

const ALL: [usize; 5] = [1, 1, 1, 1, 1];

fn select(table: &Table, key: i64) -> Vec<i64> {
    let rid = table.rid_for_key(key).unwrap();
    table.get_latest_column_values(&[rid], &ALL).unwrap().remove(0)
}

#[test]
fn operations_require_an_open_database() {
    let mut database = Database::new();
    assert!(matches!(
        database.create_table("grades", 5, 0),
        Err(DatabaseError::DatabaseNotOpen)
    ));
    assert!(matches!(database.close(), Err(DatabaseError::DatabaseNotOpen)));
}

#[test]
fn close_then_reopen_preserves_every_record() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut database = Database::new();
        database.open(dir.path()).unwrap();
        let table = database.create_table("grades", 5, 0).unwrap();

        for key in 0..300i64 {
            table.insert_record(&[key, key, key, key, key]).unwrap();
        }
        // Update each record twice; the post-update values must survive.
        for key in 0..300i64 {
            table.update_record(key, &[None, Some(key + 1), None, None, None]).unwrap();
            table.update_record(key, &[None, None, None, None, Some(key * 2)]).unwrap();
        }

        database.close().unwrap();
    }

    let mut database = Database::new();
    database.open(dir.path()).unwrap();
    let table = database.get_table("grades").expect("catalog remembers the table");

    for key in 0..300i64 {
        assert_eq!(select(&table, key), vec![key, key + 1, key, key, key * 2]);
    }

    database.close().unwrap();
}

#[test]
fn secondary_indexes_reload_from_their_files() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut database = Database::new();
        database.open(dir.path()).unwrap();
        let table = database.create_table("grades", 5, 0).unwrap();

        table.insert_record(&[1, 5, 0, 0, 0]).unwrap();
        table.insert_record(&[2, 5, 0, 0, 0]).unwrap();
        table.insert_record(&[3, 6, 0, 0, 0]).unwrap();
        database.close().unwrap();
    }

    assert!(dir.path().join("grades_attr_attribute_1").is_file());

    let mut database = Database::new();
    database.open(dir.path()).unwrap();
    let table = database.get_table("grades").unwrap();

    let mut rids = table.locate(1, 5).unwrap();
    rids.sort();
    assert_eq!(rids.len(), 2);
    assert_eq!(table.locate(1, 6).unwrap().len(), 1);

    database.close().unwrap();
}

#[test]
fn rid_allocation_resumes_after_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut database = Database::new();
        database.open(dir.path()).unwrap();
        let table = database.create_table("grades", 5, 0).unwrap();
        table.insert_record(&[1, 0, 0, 0, 0]).unwrap();
        table.update_record(1, &[None, Some(7), None, None, None]).unwrap();
        database.close().unwrap();
    }

    let mut database = Database::new();
    database.open(dir.path()).unwrap();
    let table = database.get_table("grades").unwrap();

    let first = table.rid_for_key(1).unwrap();
    table.insert_record(&[2, 0, 0, 0, 0]).unwrap();
    let second = table.rid_for_key(2).unwrap();
    assert!(second > first, "fresh RIDs continue past persisted ones");

    // Updates keep extending the old chain.
    table.update_record(1, &[None, None, Some(8), None, None]).unwrap();
    assert_eq!(select(&table, 1), vec![1, 7, 8, 0, 0]);

    database.close().unwrap();
}

#[test]
fn deletes_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut database = Database::new();
        database.open(dir.path()).unwrap();
        let table = database.create_table("grades", 5, 0).unwrap();
        table.insert_record(&[1, 1, 1, 1, 1]).unwrap();
        table.insert_record(&[2, 2, 2, 2, 2]).unwrap();
        table.delete_record(1).unwrap();
        database.close().unwrap();
    }

    let mut database = Database::new();
    database.open(dir.path()).unwrap();
    let table = database.get_table("grades").unwrap();

    assert!(matches!(table.rid_for_key(1), Err(DatabaseError::KeyNotFound(1))));
    assert_eq!(select(&table, 2), vec![2, 2, 2, 2, 2]);

    // The key is free for reuse after the restart.
    table.insert_record(&[1, 9, 9, 9, 9]).unwrap();
    assert_eq!(select(&table, 1), vec![1, 9, 9, 9, 9]);

    database.close().unwrap();
}

#[test]
fn non_cumulative_tables_round_trip_through_the_catalog() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut database = Database::new();
        database.open(dir.path()).unwrap();
        let table = database
            .create_table_with_options(
                "grades",
                5,
                0,
                TableOptions {
                    cumulative: false,
                    secondary: Some(SecondaryStructure::Sorted),
                    seeded_secondary: true,
                    ..TableOptions::default()
                },
            )
            .unwrap();

        table.insert_record(&[1, 10, 20, 30, 40]).unwrap();
        table.update_record(1, &[None, Some(11), None, None, None]).unwrap();
        database.close().unwrap();
    }

    let mut database = Database::new();
    database.open(dir.path()).unwrap();
    let table = database.get_table("grades").unwrap();

    assert!(!table.is_cumulative());
    assert_eq!(select(&table, 1), vec![1, 11, 20, 30, 40]);
    table.update_record(1, &[None, None, None, Some(31), None]).unwrap();
    assert_eq!(select(&table, 1), vec![1, 11, 20, 31, 40]);

    database.close().unwrap();
}

#[test]
fn multiple_tables_share_one_pool_and_catalog() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut database = Database::new();
        database.open(dir.path()).unwrap();
        let grades = database.create_table("grades", 5, 0).unwrap();
        let users = database.create_table("users", 3, 1).unwrap();

        grades.insert_record(&[1, 2, 3, 4, 5]).unwrap();
        users.insert_record(&[77, 1, 0]).unwrap();
        database.close().unwrap();
    }

    let mut database = Database::new();
    database.open(dir.path()).unwrap();

    let grades = database.get_table("grades").unwrap();
    assert_eq!(select(&grades, 1), vec![1, 2, 3, 4, 5]);

    let users = database.get_table("users").unwrap();
    let rid = users.rid_for_key(1).unwrap();
    assert_eq!(
        users.get_latest_column_values(&[rid], &[1, 1, 1]).unwrap(),
        vec![vec![77, 1, 0]]
    );

    database.close().unwrap();
}

#[test]
fn worker_backed_indexes_save_through_the_protocol_at_close() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut database = Database::new();
        database.open(dir.path()).unwrap();
        let table = database
            .create_table_with_options(
                "grades",
                5,
                0,
                TableOptions {
                    multiprocess_secondary: true,
                    ..TableOptions::default()
                },
            )
            .unwrap();

        table.insert_record(&[1, 5, 0, 0, 0]).unwrap();
        table.insert_record(&[2, 5, 0, 0, 0]).unwrap();
        database.close().unwrap();
    }

    let mut database = Database::new();
    database.open(dir.path()).unwrap();
    let table = database.get_table("grades").unwrap();

    assert_eq!(table.locate(1, 5).unwrap().len(), 2);
    database.close().unwrap();
}
