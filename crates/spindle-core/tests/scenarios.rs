//! End-to-end scenarios: DDL, DML, recovery, checkpointing and the
//! WAL failure paths, driven through the fiber runtime the way a
//! request would arrive.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use spindle_core::db::{Db, DbOptions};
use spindle_core::schema::{SC_INDEX_ID, SC_PRIV_ID, SC_SPACE_ID, SC_USER_ID};
use spindle_core::wal::{FaultInjectingWal, Wal, XlogWal};
use spindle_error::SpindleError;
use spindle_fiber as fiber;
use spindle_index::IteratorType;
use spindle_types::Value;
use uuid::Uuid;

const SPACE: u32 = 512;

fn options(dir: &Path) -> DbOptions {
    DbOptions {
        dir: dir.to_path_buf(),
        ..DbOptions::default()
    }
}

fn u(v: u64) -> Value {
    Value::Unsigned(v)
}

fn s(v: &str) -> Value {
    Value::Str(v.to_owned())
}

/// Create a user space with a TREE primary key on field 0.
fn create_space(db: &Db, id: u32) {
    db.insert(
        SC_SPACE_ID,
        vec![u(id.into()), u(1), s("t"), s("memtx"), u(0)],
    )
    .expect("create space");
    db.insert(
        SC_INDEX_ID,
        vec![
            u(id.into()),
            u(0),
            s("primary"),
            s("TREE"),
            u(1),
            u(1),
            u(0),
            s("unsigned"),
        ],
    )
    .expect("create primary key");
}

fn keys_of(tuples: &[spindle_types::TupleRef]) -> Vec<u64> {
    tuples
        .iter()
        .map(|t| t.field(0).unwrap().as_unsigned().unwrap())
        .collect()
}

#[test]
fn create_and_populate() {
    fiber::run_main("t", || {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(options(dir.path())).unwrap();
        create_space(&db, SPACE);

        db.replace(SPACE, vec![u(1), s("a")]).unwrap();
        db.replace(SPACE, vec![u(3), s("c")]).unwrap();
        db.replace(SPACE, vec![u(2), s("b")]).unwrap();

        let rows = db
            .select(SPACE, 0, IteratorType::All, &[], 0, usize::MAX)
            .unwrap();
        assert_eq!(keys_of(&rows), vec![1, 2, 3]);

        let updated = db
            .update(SPACE, vec![u(2)], vec![u(2), s("B")])
            .unwrap()
            .expect("row 2 exists");
        assert_eq!(updated.field_str(1).unwrap(), "B");
        assert!(db
            .update(SPACE, vec![u(99)], vec![u(99), s("?")])
            .unwrap()
            .is_none());
        let removed = db.delete(SPACE, vec![u(3)]).unwrap().expect("row 3 exists");
        assert_eq!(removed.field_str(1).unwrap(), "c");
        assert_eq!(
            db.select(SPACE, 0, IteratorType::All, &[], 0, usize::MAX)
                .unwrap()
                .len(),
            2
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn select_honors_offset_and_limit() {
    fiber::run_main("t", || {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(options(dir.path())).unwrap();
        create_space(&db, SPACE);
        for i in 1..=5 {
            db.replace(SPACE, vec![u(i), s("x")]).unwrap();
        }
        let rows = db
            .select(SPACE, 0, IteratorType::All, &[], 1, 2)
            .unwrap();
        assert_eq!(keys_of(&rows), vec![2, 3]);
        let rows = db
            .select(SPACE, 0, IteratorType::Ge, &[u(4)], 0, usize::MAX)
            .unwrap();
        assert_eq!(keys_of(&rows), vec![4, 5]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn index_rename_does_not_rebuild() {
    fiber::run_main("t", || {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(options(dir.path())).unwrap();
        create_space(&db, SPACE);
        for i in 1..=3 {
            db.replace(SPACE, vec![u(i), s("x")]).unwrap();
        }

        let before = db.index_stats(SPACE, 0).unwrap();
        // Same type, uniqueness and parts; only the name changes.
        db.replace(
            SC_INDEX_ID,
            vec![
                u(SPACE.into()),
                u(0),
                s("pk_renamed"),
                s("TREE"),
                u(1),
                u(1),
                u(0),
                s("unsigned"),
            ],
        )
        .unwrap();
        // The drop+add merged into a rename: the very same index moved
        // into the new space, and not one tuple was re-inserted.
        let after = db.index_stats(SPACE, 0).unwrap();
        assert_eq!(before.total(), after.total());

        // The space still serves queries, with all tuples in place.
        let rows = db
            .select(SPACE, 0, IteratorType::All, &[], 0, usize::MAX)
            .unwrap();
        assert_eq!(keys_of(&rows), vec![1, 2, 3]);
        let index_row = db
            .select(
                SC_INDEX_ID,
                0,
                IteratorType::Eq,
                &[u(SPACE.into()), u(0)],
                0,
                1,
            )
            .unwrap();
        assert_eq!(index_row[0].field_str(2).unwrap(), "pk_renamed");
        Ok(())
    })
    .unwrap();
}

#[test]
fn failed_secondary_add_rolls_back() {
    fiber::run_main("t", || {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(options(dir.path())).unwrap();
        create_space(&db, SPACE);
        db.replace(SPACE, vec![u(1), s("a")]).unwrap();
        db.replace(SPACE, vec![u(2), s("a")]).unwrap();
        db.replace(SPACE, vec![u(3), s("b")]).unwrap();

        // Field 1 holds a duplicate: the unique build must abort.
        let err = db
            .insert(
                SC_INDEX_ID,
                vec![
                    u(SPACE.into()),
                    u(1),
                    s("by_val"),
                    s("TREE"),
                    u(1),
                    u(1),
                    u(1),
                    s("string"),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, SpindleError::TupleFound { .. }));

        // No trace of the index: neither in the catalog nor the space.
        let index_rows = db
            .select(
                SC_INDEX_ID,
                0,
                IteratorType::Eq,
                &[u(SPACE.into())],
                0,
                usize::MAX,
            )
            .unwrap();
        assert_eq!(index_rows.len(), 1, "only the primary remains");
        assert!(matches!(
            db.select(SPACE, 1, IteratorType::All, &[], 0, usize::MAX),
            Err(SpindleError::NoSuchIndex { .. })
        ));
        let rows = db
            .select(SPACE, 0, IteratorType::All, &[], 0, usize::MAX)
            .unwrap();
        assert_eq!(keys_of(&rows), vec![1, 2, 3]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn transaction_rolls_back_on_yield() {
    fiber::run_main("t", || {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(options(dir.path())).unwrap();
        create_space(&db, SPACE);
        db.replace(SPACE, vec![u(1), s("a")]).unwrap();

        db.begin().unwrap();
        db.replace(SPACE, vec![u(1), s("changed")]).unwrap();
        // Yielding inside a transaction is forbidden; the engine's
        // fiber triggers roll it back.
        fiber::sleep(Duration::ZERO);

        assert!(matches!(
            db.commit(),
            Err(SpindleError::IllegalParams { .. })
        ));
        let rows = db
            .select(SPACE, 0, IteratorType::Eq, &[u(1)], 0, 1)
            .unwrap();
        assert_eq!(rows[0].field_str(1).unwrap(), "a");
        Ok(())
    })
    .unwrap();
}

#[test]
fn committed_transaction_survives() {
    fiber::run_main("t", || {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(options(dir.path())).unwrap();
        create_space(&db, SPACE);

        db.begin().unwrap();
        db.replace(SPACE, vec![u(1), s("a")]).unwrap();
        db.replace(SPACE, vec![u(2), s("b")]).unwrap();
        db.commit().unwrap();

        let rows = db
            .select(SPACE, 0, IteratorType::All, &[], 0, usize::MAX)
            .unwrap();
        assert_eq!(keys_of(&rows), vec![1, 2]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn checkpoint_reflects_the_begin_moment() {
    fiber::run_main("t", || {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(options(dir.path())).unwrap();
        create_space(&db, SPACE);
        for i in 1..=10 {
            db.replace(SPACE, vec![u(i), s("orig")]).unwrap();
        }

        // A fiber that mutates the space while the snapshot cord runs.
        let mutator = {
            let db = db.clone();
            fiber::new("mutator", move || {
                for i in 0..5u64 {
                    db.replace(SPACE, vec![u(100 + i), s("new")])?;
                    db.delete(SPACE, vec![u(1 + i)])?;
                    fiber::sleep(Duration::ZERO);
                }
                Ok(())
            })?
        };
        mutator.set_joinable(true);
        mutator.wakeup();

        db.checkpoint().unwrap();
        mutator.join().unwrap();

        // In-memory state has all post-begin mutations.
        let rows = db
            .select(SPACE, 0, IteratorType::All, &[], 0, usize::MAX)
            .unwrap();
        assert_eq!(keys_of(&rows), vec![6, 7, 8, 9, 10, 100, 101, 102, 103, 104]);

        // The snapshot alone recovers to the begin-moment image.
        let image_dir = tempfile::tempdir().unwrap();
        let snap = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.extension().is_some_and(|ext| ext == "snap"))
            .expect("snapshot written");
        std::fs::copy(&snap, image_dir.path().join(snap.file_name().unwrap())).unwrap();
        let image = Db::open(options(image_dir.path())).unwrap();
        let rows = image
            .select(SPACE, 0, IteratorType::All, &[], 0, usize::MAX)
            .unwrap();
        assert_eq!(keys_of(&rows), (1..=10).collect::<Vec<u64>>());
        for row in &rows {
            assert_eq!(row.field_str(1).unwrap(), "orig");
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn user_lifecycle() {
    fiber::run_main("t", || {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(options(dir.path())).unwrap();
        create_space(&db, SPACE);

        // Create user "u" owned by admin.
        db.insert(SC_USER_ID, vec![u(5), u(1), s("u"), s("user")])
            .unwrap();

        // Grant SPACE read on 512 to "u".
        db.insert(
            SC_PRIV_ID,
            vec![u(1), u(5), s("space"), u(SPACE.into()), u(1)],
        )
        .unwrap();

        // Dropping a user that holds privileges is refused.
        let err = db.delete(SC_USER_ID, vec![u(5)]).unwrap_err();
        assert!(matches!(err, SpindleError::DropUser { .. }));
        assert!(err.to_string().contains("objects"));

        // Revoke, then the drop goes through.
        db.delete(SC_PRIV_ID, vec![u(5), s("space"), u(SPACE.into())])
            .unwrap();
        db.delete(SC_USER_ID, vec![u(5)]).unwrap();

        // Reserved users cannot be dropped.
        let err = db.delete(SC_USER_ID, vec![u(0)]).unwrap_err();
        assert!(matches!(err, SpindleError::DropUser { .. }));
        assert!(err.to_string().contains("system user"));
        Ok(())
    })
    .unwrap();
}

#[test]
fn snapshot_then_recover_is_identity() {
    let dir = tempfile::tempdir().unwrap();
    fiber::run_main("t", {
        let path = dir.path().to_path_buf();
        move || {
            let db = Db::open(options(&path)).unwrap();
            create_space(&db, SPACE);
            for i in 1..=4 {
                db.replace(SPACE, vec![u(i), s("v")]).unwrap();
            }
            db.checkpoint().unwrap();
            Ok(())
        }
    })
    .unwrap();

    let db = Db::open(options(dir.path())).unwrap();
    let rows = db
        .select(SPACE, 0, IteratorType::All, &[], 0, usize::MAX)
        .unwrap();
    assert_eq!(keys_of(&rows), vec![1, 2, 3, 4]);
    assert!(db.cluster_uuid().is_some());
}

#[test]
fn wal_replay_restores_post_checkpoint_writes() {
    let dir = tempfile::tempdir().unwrap();
    fiber::run_main("t", {
        let path = dir.path().to_path_buf();
        move || {
            let db = Db::open(options(&path)).unwrap();
            create_space(&db, SPACE);
            db.replace(SPACE, vec![u(1), s("snapshotted")]).unwrap();
            db.checkpoint().unwrap();
            // Past the checkpoint: these live only in the WAL.
            db.replace(SPACE, vec![u(2), s("walled")]).unwrap();
            db.delete(SPACE, vec![u(1)]).unwrap();
            Ok(())
        }
    })
    .unwrap();

    // Strict and loose recovery agree on an undamaged log.
    for strict in [true, false] {
        let mut opts = options(dir.path());
        opts.panic_on_snap_error = strict;
        opts.panic_on_wal_error = strict;
        let db = Db::open(opts).unwrap();
        let rows = db
            .select(SPACE, 0, IteratorType::All, &[], 0, usize::MAX)
            .unwrap();
        assert_eq!(keys_of(&rows), vec![2]);
        assert_eq!(rows[0].field_str(1).unwrap(), "walled");
    }
}

#[test]
fn wal_only_restart_replays_over_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    fiber::run_main("t", {
        let path = dir.path().to_path_buf();
        move || {
            let db = Db::open(options(&path)).unwrap();
            create_space(&db, SPACE);
            db.replace(SPACE, vec![u(7), s("persisted")]).unwrap();
            Ok(())
        }
    })
    .unwrap();

    let db = Db::open(options(dir.path())).unwrap();
    let rows = db
        .select(SPACE, 0, IteratorType::All, &[], 0, usize::MAX)
        .unwrap();
    assert_eq!(keys_of(&rows), vec![7]);
}

#[test]
fn ddl_wal_failure_leaves_the_space_untouched() {
    fiber::run_main("t", || {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(FaultInjectingWal::new(XlogWal::new(
            dir.path().to_path_buf(),
            Uuid::new_v4(),
        )));
        let db = Db::open_with_wal(options(dir.path()), Box::new(Arc::clone(&wal)) as Box<dyn Wal>)
            .unwrap();
        create_space(&db, SPACE);
        db.replace(SPACE, vec![u(1), s("a")]).unwrap();
        db.replace(SPACE, vec![u(2), s("b")]).unwrap();

        wal.fail_next();
        let err = db
            .insert(
                SC_INDEX_ID,
                vec![
                    u(SPACE.into()),
                    u(1),
                    s("by_val"),
                    s("TREE"),
                    u(1),
                    u(1),
                    u(1),
                    s("string"),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, SpindleError::System(_)));

        // The failed DDL left no residue: catalog, indexes and data
        // all read as before.
        let index_rows = db
            .select(
                SC_INDEX_ID,
                0,
                IteratorType::Eq,
                &[u(SPACE.into())],
                0,
                usize::MAX,
            )
            .unwrap();
        assert_eq!(index_rows.len(), 1);
        assert!(db.select(SPACE, 1, IteratorType::All, &[], 0, 1).is_err());
        let rows = db
            .select(SPACE, 0, IteratorType::All, &[], 0, usize::MAX)
            .unwrap();
        assert_eq!(keys_of(&rows), vec![1, 2]);

        // And the space still takes writes: the sync trigger is gone.
        db.replace(SPACE, vec![u(3), s("c")]).unwrap();
        assert_eq!(
            db.select(SPACE, 0, IteratorType::All, &[], 0, usize::MAX)
                .unwrap()
                .len(),
            3
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn dml_wal_failure_rolls_the_statement_back() {
    fiber::run_main("t", || {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(FaultInjectingWal::new(XlogWal::new(
            dir.path().to_path_buf(),
            Uuid::new_v4(),
        )));
        let db = Db::open_with_wal(options(dir.path()), Box::new(Arc::clone(&wal)) as Box<dyn Wal>)
            .unwrap();
        create_space(&db, SPACE);
        db.replace(SPACE, vec![u(1), s("a")]).unwrap();

        wal.fail_next();
        assert!(db.replace(SPACE, vec![u(1), s("mutated")]).is_err());
        let rows = db
            .select(SPACE, 0, IteratorType::Eq, &[u(1)], 0, 1)
            .unwrap();
        assert_eq!(rows[0].field_str(1).unwrap(), "a");
        Ok(())
    })
    .unwrap();
}

#[test]
fn in_flight_index_build_sees_concurrent_writes() {
    fiber::run_main("t", || {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(FaultInjectingWal::new(XlogWal::new(
            dir.path().to_path_buf(),
            Uuid::new_v4(),
        )));
        let db = Db::open_with_wal(options(dir.path()), Box::new(Arc::clone(&wal)) as Box<dyn Wal>)
            .unwrap();
        create_space(&db, SPACE);
        db.replace(SPACE, vec![u(1), s("a")]).unwrap();
        db.replace(SPACE, vec![u(2), s("b")]).unwrap();

        // While the DDL's WAL write is in flight, another fiber lands
        // a write on the old, still-live space. The synchronization
        // trigger must mirror it into the index under construction.
        wal.set_yield_before_append(true);
        let writer = {
            let db = db.clone();
            fiber::new("writer", move || {
                db.replace(SPACE, vec![u(3), s("z")])?;
                Ok(())
            })?
        };
        writer.set_joinable(true);
        writer.wakeup();

        db.insert(
            SC_INDEX_ID,
            vec![
                u(SPACE.into()),
                u(1),
                s("by_val"),
                s("TREE"),
                u(1),
                u(1),
                u(1),
                s("string"),
            ],
        )
        .unwrap();
        wal.set_yield_before_append(false);
        writer.join().unwrap();

        let hit = db
            .select(SPACE, 1, IteratorType::Eq, &[s("z")], 0, 1)
            .unwrap();
        assert_eq!(keys_of(&hit), vec![3]);
        assert_eq!(
            db.select(SPACE, 1, IteratorType::All, &[], 0, usize::MAX)
                .unwrap()
                .len(),
            3
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn primary_key_drop_rules() {
    fiber::run_main("t", || {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(options(dir.path())).unwrap();
        create_space(&db, SPACE);
        db.insert(
            SC_INDEX_ID,
            vec![
                u(SPACE.into()),
                u(1),
                s("by_val"),
                s("TREE"),
                u(0),
                u(1),
                u(1),
                s("string"),
            ],
        )
        .unwrap();

        // The primary cannot go while a secondary exists.
        let err = db
            .delete(SC_INDEX_ID, vec![u(SPACE.into()), u(0)])
            .unwrap_err();
        assert!(matches!(err, SpindleError::DropPrimaryKey { .. }));

        // A system space never loses its primary key.
        let err = db
            .delete(SC_INDEX_ID, vec![u(SC_SPACE_ID.into()), u(0)])
            .unwrap_err();
        assert!(matches!(err, SpindleError::LastDrop { .. }));

        // Secondary first, then the primary, then the space itself.
        db.delete(SC_INDEX_ID, vec![u(SPACE.into()), u(1)]).unwrap();
        db.delete(SC_INDEX_ID, vec![u(SPACE.into()), u(0)]).unwrap();
        // With no keys left, DML gets a clear error instead of a crash.
        assert!(matches!(
            db.replace(SPACE, vec![u(1), s("a")]),
            Err(SpindleError::NoSuchIndex { .. })
        ));
        db.delete(SC_SPACE_ID, vec![u(SPACE.into())]).unwrap();
        assert!(matches!(
            db.select(SPACE, 0, IteratorType::All, &[], 0, 1),
            Err(SpindleError::NoSuchSpace { .. })
        ));
        Ok(())
    })
    .unwrap();
}

#[test]
fn space_drop_requires_an_empty_index_list() {
    fiber::run_main("t", || {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(options(dir.path())).unwrap();
        create_space(&db, SPACE);
        let err = db.delete(SC_SPACE_ID, vec![u(SPACE.into())]).unwrap_err();
        assert!(matches!(err, SpindleError::DropSpace { .. }));
        assert!(err.to_string().contains("indexes"));
        Ok(())
    })
    .unwrap();
}

#[test]
fn non_unique_hash_index_is_refused() {
    fiber::run_main("t", || {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(options(dir.path())).unwrap();
        create_space(&db, SPACE);
        let err = db
            .insert(
                SC_INDEX_ID,
                vec![
                    u(SPACE.into()),
                    u(1),
                    s("h"),
                    s("HASH"),
                    u(0),
                    u(1),
                    u(1),
                    s("string"),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, SpindleError::ModifyIndex { .. }));
        assert!(err.to_string().contains("unique"));
        Ok(())
    })
    .unwrap();
}

#[test]
fn temporary_spaces_keep_structure_but_not_data() {
    let dir = tempfile::tempdir().unwrap();
    fiber::run_main("t", {
        let path = dir.path().to_path_buf();
        move || {
            let db = Db::open(options(&path)).unwrap();
            db.insert(
                SC_SPACE_ID,
                vec![
                    u(600),
                    u(1),
                    s("scratch"),
                    s("memtx"),
                    u(0),
                    s("temporary"),
                ],
            )
            .unwrap();
            db.insert(
                SC_INDEX_ID,
                vec![u(600), u(0), s("primary"), s("TREE"), u(1), u(1), u(0), s("unsigned")],
            )
            .unwrap();
            db.replace(600, vec![u(1), s("gone after restart")]).unwrap();
            db.checkpoint().unwrap();
            Ok(())
        }
    })
    .unwrap();

    let db = Db::open(options(dir.path())).unwrap();
    // The definition survives (it lives in _space), the data does not.
    let rows = db.select(600, 0, IteratorType::All, &[], 0, usize::MAX).unwrap();
    assert!(rows.is_empty());
}

#[test]
fn cluster_uuid_is_write_once_after_recovery() {
    fiber::run_main("t", || {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(options(dir.path())).unwrap();
        let assigned = db.cluster_uuid().expect("bootstrap assigns a cluster id");

        let err = db
            .replace(
                spindle_core::schema::SC_SCHEMA_ID,
                vec![s("cluster"), s(&Uuid::new_v4().to_string())],
            )
            .unwrap_err();
        assert!(matches!(err, SpindleError::ClusterIdIsRo));
        assert_eq!(db.cluster_uuid(), Some(assigned));

        // Reserved server ids are refused in _cluster.
        let err = db
            .insert(
                spindle_core::schema::SC_CLUSTER_ID,
                vec![u(0), s(&Uuid::new_v4().to_string())],
            )
            .unwrap_err();
        assert!(matches!(err, SpindleError::ServerIdIsReserved { .. }));
        Ok(())
    })
    .unwrap();
}

#[test]
fn concurrent_alter_is_refused() {
    fiber::run_main("t", || {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(FaultInjectingWal::new(XlogWal::new(
            dir.path().to_path_buf(),
            Uuid::new_v4(),
        )));
        let db = Db::open_with_wal(options(dir.path()), Box::new(Arc::clone(&wal)) as Box<dyn Wal>)
            .unwrap();
        create_space(&db, SPACE);
        db.replace(SPACE, vec![u(1), s("a")]).unwrap();

        // A second alter racing into the in-flight window is refused
        // by the metadata-lock placeholder.
        wal.set_yield_before_append(true);
        let rival = {
            let db = db.clone();
            fiber::new("rival", move || {
                let err = db
                    .insert(
                        SC_INDEX_ID,
                        vec![
                            u(SPACE.into()),
                            u(2),
                            s("another"),
                            s("TREE"),
                            u(0),
                            u(1),
                            u(1),
                            s("string"),
                        ],
                    )
                    .unwrap_err();
                assert!(matches!(err, SpindleError::AlterSpace { .. }));
                Ok(())
            })?
        };
        rival.set_joinable(true);
        rival.wakeup();

        db.insert(
            SC_INDEX_ID,
            vec![
                u(SPACE.into()),
                u(1),
                s("by_val"),
                s("TREE"),
                u(0),
                u(1),
                u(1),
                s("string"),
            ],
        )
        .unwrap();
        wal.set_yield_before_append(false);
        rival.join().unwrap();
        Ok(())
    })
    .unwrap();
}
