//! The assembled database.
//!
//! [`Db`] ties the schema, the memtx engine, the cluster state and the
//! WAL together and drives the request path:
//!
//! ```text
//! request → fiber → transaction statement → engine replace
//!        → data-dictionary trigger (system spaces)
//!        → WAL append → commit triggers → result
//! ```
//!
//! Opening a database either bootstraps an empty directory (system
//! spaces plus the seed tuples) or recovers: snapshot load, WAL
//! replay, secondary-key build, moving the engine through its
//! recovery states along the way.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use spindle_error::{Result, SpindleError};
use spindle_index::{DupMode, IteratorType};
use spindle_types::codec::decode_tuple;
use spindle_types::{
    FieldType, IndexType, KeyDef, KeyPart, Tuple, TupleRef, Value,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alter;
use crate::cluster::Cluster;
use crate::memtx::{self, MemtxEngine};
use crate::schema::{
    Schema, ACCESS_FULL, ADMIN, SC_CLUSTER_ID, SC_FUNC_ID, SC_INDEX_ID, SC_PRIV_ID,
    SC_SCHEMA_ID, SC_SPACE_ID, SC_USER_ID,
};
use crate::space::{is_system_space, IndexRef, Space, SpaceDef};
use crate::txn::{self, TxnStmt};
use crate::wal::{Wal, XlogWal};
use crate::xlog::{scan_dir, FileKind, Row, RowOp, VClock, XlogReader};

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbOptions {
    /// Directory holding snapshots and WAL files.
    pub dir: PathBuf,
    /// Snapshot writer budget in bytes per second; `None` disables
    /// throttling.
    pub snap_io_rate_limit: Option<u64>,
    /// Strict snapshot recovery: refuse damaged rows instead of
    /// skipping them.
    pub panic_on_snap_error: bool,
    /// Strict WAL recovery.
    pub panic_on_wal_error: bool,
    /// This instance's id in the vector clock.
    pub server_id: u32,
    /// Index extent quota, in extents.
    pub extent_quota: usize,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            snap_io_rate_limit: None,
            panic_on_snap_error: true,
            panic_on_wal_error: true,
            server_id: 1,
            extent_quota: usize::MAX,
        }
    }
}

/// A request against one space.
pub enum Dml {
    Insert { fields: Vec<Value> },
    Replace { fields: Vec<Value> },
    Update { key: Vec<Value>, fields: Vec<Value> },
    Delete { key: Vec<Value> },
}

struct DbCore {
    schema: Mutex<Schema>,
    memtx: MemtxEngine,
    cluster: Mutex<Cluster>,
    wal: Box<dyn Wal>,
    vclock: Mutex<VClock>,
    server_uuid: Mutex<Uuid>,
    recovering: AtomicBool,
    options: DbOptions,
}

/// Shared handle to the database. Cheap to clone; commit and rollback
/// triggers, fibers and the checkpoint cord all hold one.
#[derive(Clone)]
pub struct Db {
    core: Arc<DbCore>,
}

impl Db {
    /// Open (bootstrap or recover) a database with the on-disk WAL.
    pub fn open(options: DbOptions) -> Result<Self> {
        std::fs::create_dir_all(&options.dir)?;
        let server_uuid = Uuid::new_v4();
        let wal = Box::new(XlogWal::new(options.dir.clone(), server_uuid));
        Self::open_with_wal(options, wal)
    }

    /// Open with a caller-provided WAL implementation.
    pub fn open_with_wal(options: DbOptions, wal: Box<dyn Wal>) -> Result<Self> {
        std::fs::create_dir_all(&options.dir)?;
        let memtx = MemtxEngine::new(
            options.dir.clone(),
            options.snap_io_rate_limit,
            options.panic_on_snap_error,
            options.panic_on_wal_error,
            options.extent_quota,
        );
        let db = Self {
            core: Arc::new(DbCore {
                schema: Mutex::new(Schema::default()),
                memtx,
                cluster: Mutex::new(Cluster::default()),
                wal,
                vclock: Mutex::new(VClock::new()),
                server_uuid: Mutex::new(Uuid::new_v4()),
                recovering: AtomicBool::new(true),
                options,
            }),
        };
        db.create_system_spaces()?;

        let snaps = scan_dir(&db.core.options.dir, FileKind::Snap)?;
        if let Some((signature, path)) = snaps.last() {
            info!(snapshot = %path.display(), "recovery start");
            db.core.memtx.begin_initial_recovery();
            db.recover_snapshot(path)?;
            {
                let mut schema = db.core.schema.lock();
                db.core.memtx.begin_final_recovery(&mut schema)?;
            }
            db.replay_wals(*signature)?;
            {
                let mut schema = db.core.schema.lock();
                db.core.memtx.end_recovery(&mut schema)?;
            }
            info!("recovery complete");
        } else {
            info!("initializing an empty data directory");
            db.core.memtx.bootstrap();
            db.bootstrap_rows()?;
            // A restart before the first checkpoint: the WAL replays
            // over the deterministic bootstrap image.
            db.replay_wals(0)?;
        }
        db.core.recovering.store(false, Ordering::Release);
        Ok(db)
    }

    // -- shared state accessors (crate-internal) --------------------------

    pub(crate) fn schema_lock(&self) -> MutexGuard<'_, Schema> {
        self.core.schema.lock()
    }

    pub(crate) fn cluster_lock(&self) -> MutexGuard<'_, Cluster> {
        self.core.cluster.lock()
    }

    pub(crate) fn engine(&self) -> &MemtxEngine {
        &self.core.memtx
    }

    pub(crate) fn is_recovering(&self) -> bool {
        self.core.recovering.load(Ordering::Acquire)
    }

    /// Assign LSNs to the rows and hand them to the WAL. Skipped while
    /// recovery replays existing logs.
    pub(crate) fn wal_append(&self, mut rows: Vec<Row>) -> Result<()> {
        if rows.is_empty() || self.is_recovering() {
            return Ok(());
        }
        let vclock_before = {
            let mut vclock = self.core.vclock.lock();
            let before = vclock.clone();
            for row in &mut rows {
                row.server_id = self.core.options.server_id;
                row.lsn = vclock.advance(row.server_id);
            }
            before
        };
        match self.core.wal.append(&rows, &vclock_before) {
            Ok(()) => Ok(()),
            Err(e) => {
                // The rows never became durable; give their LSNs back.
                let mut vclock = self.core.vclock.lock();
                *vclock = vclock_before;
                Err(e)
            }
        }
    }

    /// The instance UUID, as recorded in snapshot headers.
    pub fn server_uuid(&self) -> Uuid {
        *self.core.server_uuid.lock()
    }

    /// The cluster UUID, once `_schema["cluster"]` has been read.
    pub fn cluster_uuid(&self) -> Option<Uuid> {
        self.core.cluster.lock().cluster_id()
    }

    pub fn vclock(&self) -> VClock {
        self.core.vclock.lock().clone()
    }

    pub fn set_snap_io_rate_limit(&self, limit: Option<u64>) {
        self.core.memtx.set_snap_io_rate_limit(limit);
    }

    // -- request execution -------------------------------------------------

    /// Insert; fails on a duplicate primary or unique-secondary key.
    pub fn insert(&self, space_id: u32, fields: Vec<Value>) -> Result<TupleRef> {
        let result = self.exec_dml(space_id, Dml::Insert { fields })?;
        result.ok_or_else(|| SpindleError::illegal_params("insert produced no tuple"))
    }

    /// Insert-or-replace by primary key.
    pub fn replace(&self, space_id: u32, fields: Vec<Value>) -> Result<TupleRef> {
        let result = self.exec_dml(space_id, Dml::Replace { fields })?;
        result.ok_or_else(|| SpindleError::illegal_params("replace produced no tuple"))
    }

    /// Full-tuple update of the row matching `key`; `None` when no row
    /// matches.
    pub fn update(
        &self,
        space_id: u32,
        key: Vec<Value>,
        fields: Vec<Value>,
    ) -> Result<Option<TupleRef>> {
        self.exec_dml(space_id, Dml::Update { key, fields })
    }

    /// Delete by primary key; returns the removed tuple, if any.
    pub fn delete(&self, space_id: u32, key: Vec<Value>) -> Result<Option<TupleRef>> {
        self.exec_dml(space_id, Dml::Delete { key })
    }

    /// Mutation counters of one index. Observable proof that an alter
    /// moved an index instead of rebuilding it.
    pub fn index_stats(&self, space_id: u32, index_id: u32) -> Result<spindle_index::IndexStats> {
        let schema = self.core.schema.lock();
        let space = schema.space(space_id)?;
        let index = space.index(index_id)?;
        let stats = index.lock().stats();
        Ok(stats)
    }

    /// Range query with offset and limit.
    pub fn select(
        &self,
        space_id: u32,
        index_id: u32,
        iterator: IteratorType,
        key: &[Value],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TupleRef>> {
        let schema = self.core.schema.lock();
        let space = schema.space(space_id)?;
        let index = space.index(index_id)?;
        let tuples = index.lock().iterate(iterator, key)?;
        Ok(tuples.into_iter().skip(offset).take(limit).collect())
    }

    /// Begin a multi-statement transaction on the current fiber. The
    /// engine forbids yields until commit.
    pub fn begin(&self) -> Result<()> {
        txn::begin(self, false)
    }

    /// Commit the current fiber's transaction.
    pub fn commit(&self) -> Result<()> {
        txn::commit(self)
    }

    /// Roll back the current fiber's transaction.
    pub fn rollback(&self) {
        txn::rollback(self);
    }

    fn exec_dml(&self, space_id: u32, dml: Dml) -> Result<Option<TupleRef>> {
        let autocommit = !txn::is_active();
        if autocommit {
            txn::begin(self, true)?;
        }
        match self.execute_stmt(space_id, dml) {
            Ok(result) => {
                if autocommit {
                    txn::commit(self)?;
                }
                Ok(result)
            }
            Err(e) => {
                if autocommit {
                    txn::rollback(self);
                }
                Err(e)
            }
        }
    }

    /// Apply one statement in memory: the engine replace, the
    /// build-sync mirrors, and the data-dictionary trigger. Any
    /// failure undoes the statement completely before returning.
    fn execute_stmt(&self, space_id: u32, dml: Dml) -> Result<Option<TupleRef>> {
        let mut schema_guard = self.core.schema.lock();
        let schema = &mut *schema_guard;

        let (old, new, mode, returns_new) = {
            let space = schema.space(space_id)?;
            match dml {
                Dml::Insert { fields } => (
                    None,
                    Some(Tuple::from_values(&space.format, fields)?),
                    DupMode::Insert,
                    true,
                ),
                Dml::Replace { fields } => (
                    None,
                    Some(Tuple::from_values(&space.format, fields)?),
                    DupMode::ReplaceOrInsert,
                    true,
                ),
                Dml::Update { key, fields } => {
                    let Some(old) = Self::lookup_unique(space, &key)? else {
                        return Ok(None);
                    };
                    (
                        Some(old),
                        Some(Tuple::from_values(&space.format, fields)?),
                        DupMode::Replace,
                        true,
                    )
                }
                Dml::Delete { key } => {
                    let Some(old) = Self::lookup_unique(space, &key)? else {
                        return Ok(None);
                    };
                    (Some(old), None, DupMode::ReplaceOrInsert, false)
                }
            }
        };

        let space = schema.space(space_id)?;
        let displaced =
            memtx::space_replace(&self.core.memtx, space, old.as_ref(), new.as_ref(), mode)?;

        // Mirror the change into any index being built against this
        // space while its DDL record is in flight.
        let sync_targets: Vec<IndexRef> = space
            .on_replace
            .iter()
            .map(|t| Arc::clone(&t.new_index))
            .collect();
        let mut synced: Vec<IndexRef> = Vec::new();
        let mut failure: Option<SpindleError> = None;
        for target in sync_targets {
            let result = target
                .lock()
                .replace(displaced.as_ref(), new.as_ref(), DupMode::Insert);
            match result {
                Ok(_) => synced.push(target),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        // The data-dictionary trigger observes the mutation before the
        // WAL write; its refusal aborts the statement.
        if failure.is_none() && is_system_space(space_id) {
            if let Err(e) = alter::on_replace_dd(
                self,
                schema,
                space_id,
                displaced.as_ref(),
                new.as_ref(),
            ) {
                failure = Some(e);
            }
        }

        if let Some(e) = failure {
            for target in synced.iter().rev() {
                let _ = target
                    .lock()
                    .replace(new.as_ref(), displaced.as_ref(), DupMode::Insert);
            }
            let space = schema.space(space_id)?;
            memtx::undo_stmt(space, displaced.as_ref(), new.as_ref());
            return Err(e);
        }

        // If the enclosing transaction rolls back, the in-flight index
        // must shed this statement's effect too.
        for target in synced {
            let undo_old = displaced.clone();
            let undo_new = new.clone();
            txn::on_rollback(move |_db| {
                let _ = target
                    .lock()
                    .replace(undo_new.as_ref(), undo_old.as_ref(), DupMode::Insert);
            });
        }

        let result = if returns_new {
            new.clone()
        } else {
            displaced.clone()
        };
        txn::add_stmt(TxnStmt {
            space_id,
            old: displaced,
            new,
        });
        Ok(result)
    }

    /// Point lookup by exact primary key, with full part-count
    /// validation.
    fn lookup_unique(space: &Space, key: &[Value]) -> Result<Option<TupleRef>> {
        let pk = space.primary_key()?;
        let pk = pk.lock();
        let key_def = pk.key_def();
        key_def.validate_key(key)?;
        if key.len() != key_def.parts.len() {
            return Err(SpindleError::KeyPartCount {
                expected: key_def.part_count(),
                actual: key.len() as u32,
            });
        }
        pk.get(key)
    }

    // -- checkpointing -----------------------------------------------------

    /// Write a consistent snapshot of every non-temporary space: open
    /// read views, stream them from a dedicated cord, and rename the
    /// file into place. The image reflects the moment this call
    /// started; writes that land while the writer runs do not appear
    /// in it.
    pub fn checkpoint(&self) -> Result<()> {
        {
            let schema = self.core.schema.lock();
            self.core.memtx.begin_checkpoint(&schema)?;
        }
        let vclock = self.core.vclock.lock().clone();
        match self.core.memtx.wait_checkpoint(vclock, self.server_uuid()) {
            Ok(()) => self.core.memtx.commit_checkpoint(),
            Err(e) => {
                self.core.memtx.abort_checkpoint();
                Err(e)
            }
        }
    }

    /// The vclock of the last completed checkpoint.
    pub fn last_checkpoint(&self) -> Option<VClock> {
        self.core.memtx.last_checkpoint()
    }

    // -- bootstrap ---------------------------------------------------------

    fn create_system_spaces(&self) -> Result<()> {
        let mut schema = self.core.schema.lock();
        for (id, name, keys) in system_space_defs() {
            let def = SpaceDef {
                id,
                uid: ADMIN,
                name: name.to_owned(),
                engine: "memtx".to_owned(),
                field_count: 0,
                temporary: false,
            };
            let mut space = Space::new(def, &keys)?;
            // Data-dictionary spaces are fully enabled at all times.
            memtx::init_system_space(&mut space)?;
            schema.cache_replace(space);
        }
        Ok(())
    }

    /// Seed an empty database the way a bootstrap snapshot would: the
    /// self-describing rows of every system space, the reserved users,
    /// the admin's universe grant and the cluster identity.
    fn bootstrap_rows(&self) -> Result<()> {
        let cluster_uuid = Uuid::new_v4();
        self.insert(
            SC_SCHEMA_ID,
            vec![Value::from("cluster"), Value::from(cluster_uuid.to_string())],
        )?;
        for (id, name, _) in system_space_defs() {
            self.insert(
                SC_SPACE_ID,
                vec![
                    Value::from(id),
                    Value::from(ADMIN),
                    Value::from(name),
                    Value::from("memtx"),
                    Value::from(0u32),
                ],
            )?;
        }
        for (space_id, _, keys) in system_space_defs() {
            for key in keys {
                let mut fields = vec![
                    Value::from(space_id),
                    Value::from(key.iid),
                    Value::from(key.name.as_str()),
                    Value::from(key.index_type.as_str()),
                    Value::from(u32::from(key.unique)),
                    Value::from(key.part_count()),
                ];
                for part in &key.parts {
                    fields.push(Value::from(part.field_no));
                    fields.push(Value::from(part.field_type.as_str()));
                }
                self.insert(SC_INDEX_ID, fields)?;
            }
        }
        for (uid, name, user_type) in [
            (crate::schema::GUEST, "guest", "user"),
            (ADMIN, "admin", "user"),
            (crate::schema::PUBLIC, "public", "role"),
        ] {
            self.insert(
                SC_USER_ID,
                vec![
                    Value::from(uid),
                    Value::from(ADMIN),
                    Value::from(name),
                    Value::from(user_type),
                ],
            )?;
        }
        self.insert(
            SC_PRIV_ID,
            vec![
                Value::from(ADMIN),
                Value::from(ADMIN),
                Value::from("universe"),
                Value::from(0u32),
                Value::from(u32::from(ACCESS_FULL)),
            ],
        )?;
        self.insert(
            SC_CLUSTER_ID,
            vec![
                Value::from(self.core.options.server_id),
                Value::from(self.server_uuid().to_string()),
            ],
        )?;
        info!(cluster_uuid = %cluster_uuid, "bootstrap complete");
        Ok(())
    }

    // -- recovery ----------------------------------------------------------

    fn recover_snapshot(&self, path: &std::path::Path) -> Result<()> {
        let mut reader = XlogReader::open(path)?;
        if reader.kind() != FileKind::Snap {
            return Err(SpindleError::xlog("not a snapshot file"));
        }
        *self.core.server_uuid.lock() = reader.server_uuid();
        *self.core.vclock.lock() = reader.vclock().clone();
        let strict = self.core.memtx.panic_on_snap_error();
        loop {
            let row = match reader.next_row() {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) if strict => return Err(e),
                Err(e) => {
                    error!(error = %e, "can't read snapshot row, skipping");
                    break;
                }
            };
            if row.op != RowOp::Insert {
                let err = SpindleError::UnknownRequestType {
                    ty: row.op as u32,
                };
                if strict {
                    return Err(err);
                }
                error!(error = %err, "can't apply snapshot row");
                continue;
            }
            if let Err(e) = self.apply_row(&row) {
                if strict || !e.is_recoverable() {
                    return Err(e);
                }
                error!(error = %e, "can't apply snapshot row");
            }
        }
        if !reader.eof_read() {
            let err = SpindleError::xlog(format!(
                "snapshot '{}' has no EOF marker",
                path.display()
            ));
            if strict {
                return Err(err);
            }
            warn!(error = %err, "recovering from a truncated snapshot");
        }
        Ok(())
    }

    fn replay_wals(&self, snap_signature: i64) -> Result<()> {
        let strict = self.core.memtx.panic_on_wal_error();
        let wals = scan_dir(&self.core.options.dir, FileKind::Xlog)?;
        let mut replayed_any = false;
        for (signature, path) in &wals {
            // A log that ends before the snapshot carries nothing new.
            let mut reader = XlogReader::open(path)?;
            if reader.kind() != FileKind::Xlog {
                continue;
            }
            let mut saw_relevant_rows = false;
            loop {
                let row = match reader.next_row() {
                    Ok(Some(row)) => row,
                    Ok(None) => break,
                    Err(e) if strict => return Err(e),
                    Err(e) => {
                        error!(error = %e, file = %path.display(), "skipping damaged WAL tail");
                        break;
                    }
                };
                let seen = self.core.vclock.lock().get(row.server_id);
                if row.lsn <= seen {
                    continue;
                }
                if row.lsn > seen + 1 {
                    let gap = SpindleError::XlogGap {
                        detail: format!(
                            "missing rows ({}, {}] for server {} in '{}'",
                            seen,
                            row.lsn - 1,
                            row.server_id,
                            path.display()
                        ),
                    };
                    if strict {
                        return Err(gap);
                    }
                    warn!(error = %gap, "continuing in loose recovery mode");
                }
                saw_relevant_rows = true;
                if let Err(e) = self.apply_row(&row) {
                    if strict || !e.is_recoverable() {
                        return Err(e);
                    }
                    error!(error = %e, "can't apply WAL row");
                }
                self.core.vclock.lock().follow(row.server_id, row.lsn);
            }
            if !reader.eof_read() && strict && Some(signature) != wals.last().map(|(s, _)| s) {
                return Err(SpindleError::xlog(format!(
                    "WAL '{}' has no EOF marker",
                    path.display()
                )));
            }
            replayed_any = replayed_any || saw_relevant_rows;
        }
        if !replayed_any && wals.is_empty() && snap_signature > 0 {
            // Nothing to replay: the snapshot is the recovery point.
            info!(signature = snap_signature, "no WAL files to replay");
        }
        Ok(())
    }

    fn apply_row(&self, row: &Row) -> Result<()> {
        let fields = decode_tuple(&row.body)?;
        match row.op {
            RowOp::Insert => {
                self.exec_dml(row.space_id, Dml::Insert { fields })?;
            }
            RowOp::Replace => {
                self.exec_dml(row.space_id, Dml::Replace { fields })?;
            }
            RowOp::Delete => {
                self.exec_dml(row.space_id, Dml::Delete { key: fields })?;
            }
        }
        Ok(())
    }
}

/// The data dictionary's own shape: ids, names and key definitions of
/// every system space.
fn system_space_defs() -> Vec<(u32, &'static str, Vec<KeyDef>)> {
    fn key(
        space_id: u32,
        iid: u32,
        name: &str,
        index_type: IndexType,
        unique: bool,
        parts: &[(u32, FieldType)],
    ) -> KeyDef {
        let parts = parts
            .iter()
            .map(|&(field_no, field_type)| KeyPart {
                field_no,
                field_type,
            })
            .collect();
        KeyDef::new(space_id, iid, name, index_type, unique, parts)
            .expect("static system key definition")
    }

    vec![
        (
            SC_SCHEMA_ID,
            "_schema",
            vec![key(
                SC_SCHEMA_ID,
                0,
                "primary",
                IndexType::Tree,
                true,
                &[(0, FieldType::Str)],
            )],
        ),
        (
            SC_SPACE_ID,
            "_space",
            vec![
                key(
                    SC_SPACE_ID,
                    0,
                    "primary",
                    IndexType::Tree,
                    true,
                    &[(0, FieldType::Unsigned)],
                ),
                key(
                    SC_SPACE_ID,
                    1,
                    "owner",
                    IndexType::Tree,
                    false,
                    &[(1, FieldType::Unsigned)],
                ),
            ],
        ),
        (
            SC_INDEX_ID,
            "_index",
            vec![key(
                SC_INDEX_ID,
                0,
                "primary",
                IndexType::Tree,
                true,
                &[(0, FieldType::Unsigned), (1, FieldType::Unsigned)],
            )],
        ),
        (
            SC_FUNC_ID,
            "_func",
            vec![
                key(
                    SC_FUNC_ID,
                    0,
                    "primary",
                    IndexType::Tree,
                    true,
                    &[(0, FieldType::Unsigned)],
                ),
                key(
                    SC_FUNC_ID,
                    1,
                    "owner",
                    IndexType::Tree,
                    false,
                    &[(1, FieldType::Unsigned)],
                ),
            ],
        ),
        (
            SC_USER_ID,
            "_user",
            vec![key(
                SC_USER_ID,
                0,
                "primary",
                IndexType::Tree,
                true,
                &[(0, FieldType::Unsigned)],
            )],
        ),
        (
            SC_PRIV_ID,
            "_priv",
            vec![
                key(
                    SC_PRIV_ID,
                    0,
                    "primary",
                    IndexType::Tree,
                    true,
                    &[
                        (1, FieldType::Unsigned),
                        (2, FieldType::Str),
                        (3, FieldType::Unsigned),
                    ],
                ),
                key(
                    SC_PRIV_ID,
                    1,
                    "owner",
                    IndexType::Tree,
                    false,
                    &[(1, FieldType::Unsigned)],
                ),
            ],
        ),
        (
            SC_CLUSTER_ID,
            "_cluster",
            vec![key(
                SC_CLUSTER_ID,
                0,
                "primary",
                IndexType::Tree,
                true,
                &[(0, FieldType::Unsigned)],
            )],
        ),
    ]
}
