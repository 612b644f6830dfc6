//! The memtx storage engine: recovery state machine, per-space replace
//! dispatch, statement rollback, and checkpointing.
//!
//! A space's replace behavior depends on the engine's recovery phase:
//!
//! | state            | dispatch      | effect                              |
//! |------------------|---------------|-------------------------------------|
//! | INITIALIZED      | `NoKeys`      | DML refused                         |
//! | INITIAL_RECOVERY | `BuildNext`   | append to the primary's bulk build  |
//! | FINAL_RECOVERY   | `PrimaryKey`  | insert into the primary only        |
//! | OK               | `AllKeys`     | primary + secondaries with rollback |
//!
//! `AllKeys` reserves extent slack before touching any index so that
//! statement rollback can never fail on OOM, applies the primary first,
//! then every secondary with `DUP_INSERT`; a secondary failure unwinds
//! everything already applied and re-raises.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use spindle_error::{Result, SpindleError};
use spindle_fiber as fiber;
use spindle_index::DupMode;
use spindle_types::{IndexType, KeyDef, TupleRef};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::extent::{
    ExtentPool, RESERVE_EXTENTS_BEFORE_DELETE, RESERVE_EXTENTS_BEFORE_REPLACE,
};
use crate::schema::Schema;
use crate::space::{IndexRef, Space};
use crate::txn::TxnStmt;
use crate::xlog::{
    format_filename, FileKind, Row, RowOp, SnapIoRateLimiter, VClock, XlogWriter,
};
use crate::db::Db;

/// Engine recovery phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Initialized,
    InitialRecovery,
    FinalRecovery,
    Ok,
}

/// Per-space replace dispatch, matching the current recovery phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceFn {
    /// The space has no functional keys; DML is refused.
    NoKeys,
    /// Bulk load from a snapshot: append to the primary's builder.
    BuildNext,
    /// WAL replay: maintain the primary only.
    PrimaryKey,
    /// Online: maintain every index, with statement-level rollback.
    AllKeys,
}

pub struct MemtxEngine {
    state: Mutex<RecoveryState>,
    snap_dir: PathBuf,
    snap_io_rate_limit: AtomicU64,
    panic_on_snap_error: bool,
    panic_on_wal_error: bool,
    pub extents: ExtentPool,
    last_checkpoint: Mutex<Option<VClock>>,
    checkpoint: Mutex<Option<Checkpoint>>,
}

impl MemtxEngine {
    pub fn new(
        snap_dir: PathBuf,
        snap_io_rate_limit: Option<u64>,
        panic_on_snap_error: bool,
        panic_on_wal_error: bool,
        extent_quota: usize,
    ) -> Self {
        Self {
            state: Mutex::new(RecoveryState::Initialized),
            snap_dir,
            snap_io_rate_limit: AtomicU64::new(snap_io_rate_limit.unwrap_or(u64::MAX)),
            panic_on_snap_error,
            panic_on_wal_error,
            extents: ExtentPool::new(extent_quota),
            last_checkpoint: Mutex::new(None),
            checkpoint: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RecoveryState {
        *self.state.lock()
    }

    pub fn snap_dir(&self) -> &std::path::Path {
        &self.snap_dir
    }

    pub const fn panic_on_snap_error(&self) -> bool {
        self.panic_on_snap_error
    }

    pub const fn panic_on_wal_error(&self) -> bool {
        self.panic_on_wal_error
    }

    pub fn set_snap_io_rate_limit(&self, limit: Option<u64>) {
        self.snap_io_rate_limit
            .store(limit.unwrap_or(u64::MAX), Ordering::Release);
    }

    pub fn last_checkpoint(&self) -> Option<VClock> {
        self.last_checkpoint.lock().clone()
    }

    pub(crate) fn set_last_checkpoint(&self, vclock: VClock) {
        *self.last_checkpoint.lock() = Some(vclock);
    }

    /// An empty data directory: no recovery, keys enabled from the
    /// start.
    pub fn bootstrap(&self) {
        let mut state = self.state.lock();
        assert_eq!(*state, RecoveryState::Initialized);
        *state = RecoveryState::Ok;
    }

    /// Entering snapshot load. In loose mode (`panic_on_snap_error`
    /// off) all keys are enabled immediately so duplicate rows are
    /// detected and discarded instead of corrupting the bulk build.
    pub fn begin_initial_recovery(&self) {
        let mut state = self.state.lock();
        assert_eq!(*state, RecoveryState::Initialized);
        *state = if self.panic_on_snap_error {
            RecoveryState::InitialRecovery
        } else {
            RecoveryState::Ok
        };
    }

    /// The snapshot is fully read: seal every primary's bulk build and
    /// move to WAL replay (or straight online in loose mode).
    pub fn begin_final_recovery(&self, schema: &mut Schema) -> Result<()> {
        {
            let state = self.state.lock();
            if *state == RecoveryState::Ok {
                return Ok(());
            }
            assert_eq!(*state, RecoveryState::InitialRecovery);
        }
        for id in schema.space_ids() {
            let space = schema.space_mut(id)?;
            end_build_primary_key(space);
        }
        if self.panic_on_wal_error {
            *self.state.lock() = RecoveryState::FinalRecovery;
        } else {
            *self.state.lock() = RecoveryState::Ok;
            for id in schema.space_ids() {
                build_secondary_keys(schema.space_mut(id)?)?;
            }
        }
        Ok(())
    }

    /// WAL replay is done: build every secondary key in bulk and go
    /// online.
    pub fn end_recovery(&self, schema: &mut Schema) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != RecoveryState::Ok {
                assert_eq!(*state, RecoveryState::FinalRecovery);
                *state = RecoveryState::Ok;
            }
        }
        for id in schema.space_ids() {
            let space = schema.space_mut(id)?;
            if space.index_count() == 0 {
                if self.panic_on_snap_error {
                    return Err(SpindleError::xlog(format!(
                        "space '{}' has no indexes after recovery",
                        space.name()
                    )));
                }
                warn!(space = space.name(), "space has no indexes after recovery");
                continue;
            }
            build_secondary_keys(space)?;
        }
        Ok(())
    }
}

/// Engine constraints on a key definition.
pub fn key_def_check(space_name: &str, key_def: &KeyDef) -> Result<()> {
    let refuse = |detail: &str| {
        Err(SpindleError::modify_index(
            &key_def.name,
            space_name,
            detail,
        ))
    };
    match key_def.index_type {
        IndexType::Hash => {
            if !key_def.unique {
                return refuse("HASH index must be unique");
            }
        }
        IndexType::Tree => {}
        IndexType::Rtree => {
            if key_def.parts.len() != 1 {
                return refuse("RTREE index key can not be multipart");
            }
            if key_def.unique {
                return refuse("RTREE index can not be unique");
            }
            if key_def.parts[0].field_type != spindle_types::FieldType::Array {
                return refuse("RTREE index field type must be ARRAY");
            }
            return Ok(());
        }
        IndexType::Bitset => {
            if key_def.parts.len() != 1 {
                return refuse("BITSET index key can not be multipart");
            }
            if key_def.unique {
                return refuse("BITSET can not be unique");
            }
            let ft = key_def.parts[0].field_type;
            if ft != spindle_types::FieldType::Unsigned && ft != spindle_types::FieldType::Str {
                return refuse("BITSET index field type must be UNSIGNED or STR");
            }
            return Ok(());
        }
    }
    // HASH and TREE: no ARRAY parts.
    for part in &key_def.parts {
        if part.field_type == spindle_types::FieldType::Array {
            return refuse("ARRAY field type is not supported");
        }
    }
    Ok(())
}

/// Bring a space's fresh primary key up to speed with the engine's
/// recovery phase.
pub fn add_primary_key(space: &mut Space, state: RecoveryState) -> Result<()> {
    let pk = space.primary_key()?;
    match state {
        RecoveryState::Initialized => {
            panic!("can't create a new space before snapshot recovery")
        }
        RecoveryState::InitialRecovery => {
            pk.lock().begin_build();
            space.replace_fn = ReplaceFn::BuildNext;
        }
        RecoveryState::FinalRecovery => {
            let mut pk = pk.lock();
            pk.begin_build();
            pk.end_build();
            space.replace_fn = ReplaceFn::PrimaryKey;
        }
        RecoveryState::Ok => {
            let mut pk = pk.lock();
            pk.begin_build();
            pk.end_build();
            space.replace_fn = ReplaceFn::AllKeys;
        }
    }
    Ok(())
}

/// The primary key is gone: refuse DML until a new one is added.
pub fn drop_primary_key(space: &mut Space) {
    space.replace_fn = ReplaceFn::NoKeys;
}

/// System spaces are fully enabled at all times, whatever the phase.
pub fn init_system_space(space: &mut Space) -> Result<()> {
    add_primary_key(space, RecoveryState::Ok)
}

/// Seal the primary's bulk build when initial recovery ends. Spaces
/// already online (system spaces) are left alone.
pub fn end_build_primary_key(space: &mut Space) {
    if space.replace_fn == ReplaceFn::AllKeys {
        return;
    }
    let Some(pk) = space.index_opt(0) else { return };
    pk.lock().end_build();
    space.replace_fn = ReplaceFn::PrimaryKey;
}

/// Populate an index from a set of tuples without duplicate checks.
pub fn index_build(index: &IndexRef, tuples: &[TupleRef]) -> Result<()> {
    let mut index = index.lock();
    index.begin_build();
    for tuple in tuples {
        index.build_next(tuple)?;
    }
    index.end_build();
    Ok(())
}

/// Build every secondary key of a space in bulk from the primary and
/// switch the space online. Spaces already online are left alone.
pub fn build_secondary_keys(space: &mut Space) -> Result<()> {
    if space.index_opt(0).is_none() || space.replace_fn == ReplaceFn::AllKeys {
        return Ok(());
    }
    if space.index_count() > 1 {
        let tuples = space.primary_key()?.lock().read_view();
        if !tuples.is_empty() {
            info!(space = space.name(), "building secondary indexes");
        }
        for index in space.indexes().iter().skip(1) {
            index_build(index, &tuples)?;
        }
        if !tuples.is_empty() {
            info!(space = space.name(), "done building secondary indexes");
        }
    }
    space.replace_fn = ReplaceFn::AllKeys;
    Ok(())
}

/// The engine's unified mutation primitive, dispatched on the space's
/// recovery phase. Returns the displaced tuple, if any.
pub fn space_replace(
    engine: &MemtxEngine,
    space: &Space,
    old: Option<&TupleRef>,
    new: Option<&TupleRef>,
    mode: DupMode,
) -> Result<Option<TupleRef>> {
    match space.replace_fn {
        ReplaceFn::NoKeys => Err(SpindleError::NoSuchIndex {
            index: 0,
            space: space.name().to_owned(),
        }),
        ReplaceFn::BuildNext => {
            debug_assert!(old.is_none() && mode == DupMode::Insert);
            let new = new.ok_or_else(|| {
                SpindleError::illegal_params("bulk load requires a new tuple")
            })?;
            space.primary_key()?.lock().build_next(new)?;
            Ok(None)
        }
        ReplaceFn::PrimaryKey => space.primary_key()?.lock().replace(old, new, mode),
        ReplaceFn::AllKeys => replace_all_keys(engine, space, old, new, mode),
    }
}

fn replace_all_keys(
    engine: &MemtxEngine,
    space: &Space,
    old: Option<&TupleRef>,
    new: Option<&TupleRef>,
    mode: DupMode,
) -> Result<Option<TupleRef>> {
    // Slack so that neither the secondaries nor a later statement
    // rollback can hit OOM mid-flight.
    engine.extents.reserve(if new.is_some() {
        RESERVE_EXTENTS_BEFORE_REPLACE
    } else {
        RESERVE_EXTENTS_BEFORE_DELETE
    })?;

    let indexes = space.indexes();
    let old_tuple = indexes[0].lock().replace(old, new, mode)?;
    debug_assert!(old_tuple.is_some() || new.is_some());
    let mut applied = 1;
    for index in indexes.iter().skip(1) {
        match index
            .lock()
            .replace(old_tuple.as_ref(), new, DupMode::Insert)
        {
            Ok(_) => applied += 1,
            Err(e) => {
                for index in indexes.iter().take(applied).rev() {
                    if let Err(undo_err) =
                        index.lock().replace(new, old_tuple.as_ref(), DupMode::Insert)
                    {
                        // Extents were reserved; this cannot happen.
                        panic!("statement rollback failed: {undo_err}");
                    }
                }
                return Err(e);
            }
        }
    }
    Ok(old_tuple)
}

/// Undo a transaction's statements in reverse order. Infallible by
/// contract: index memory was reserved before each statement.
pub fn rollback_statements(db: &Db, stmts: &[TxnStmt]) {
    let mut schema = db.schema_lock();
    for stmt in stmts.iter().rev() {
        if stmt.old.is_none() && stmt.new.is_none() {
            continue;
        }
        let Ok(space) = schema.space_mut(stmt.space_id) else {
            continue;
        };
        let index_count = match space.replace_fn {
            ReplaceFn::AllKeys => space.index_count(),
            ReplaceFn::PrimaryKey => 1,
            ReplaceFn::NoKeys | ReplaceFn::BuildNext => {
                panic!("transaction rolled back during snapshot recovery")
            }
        };
        for index in space.indexes().iter().take(index_count) {
            if let Err(e) = index
                .lock()
                .replace(stmt.new.as_ref(), stmt.old.as_ref(), DupMode::Insert)
            {
                panic!("statement rollback failed: {e}");
            }
        }
    }
}

/// Undo a single applied statement against its space. Used when a
/// later step of the same statement (a data-dictionary trigger, a
/// build-sync mirror) fails before the statement is recorded.
pub fn undo_stmt(space: &Space, old: Option<&TupleRef>, new: Option<&TupleRef>) {
    let index_count = match space.replace_fn {
        ReplaceFn::AllKeys => space.index_count(),
        ReplaceFn::PrimaryKey => 1,
        ReplaceFn::BuildNext | ReplaceFn::NoKeys => {
            panic!("statement undone during snapshot recovery")
        }
    };
    for index in space.indexes().iter().take(index_count) {
        if let Err(e) = index.lock().replace(new, old, DupMode::Insert) {
            panic!("statement rollback failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpointing
// ---------------------------------------------------------------------------

struct CheckpointEntry {
    space_id: u32,
    tuples: Vec<TupleRef>,
}

struct Checkpoint {
    /// Read views over every snapshotted space, taken at begin time.
    entries: Option<Vec<CheckpointEntry>>,
    vclock: VClock,
}

impl MemtxEngine {
    /// Open read views on every non-temporary space. The views pin
    /// their tuples, so later deletes do not disturb the image.
    pub fn begin_checkpoint(&self, schema: &Schema) -> Result<()> {
        let mut slot = self.checkpoint.lock();
        if slot.is_some() {
            return Err(SpindleError::illegal_params("checkpoint in progress"));
        }
        let mut entries = Vec::new();
        for id in schema.space_ids() {
            let space = schema.space(id)?;
            if space.def.temporary {
                continue;
            }
            let Some(pk) = space.index_opt(0) else {
                continue;
            };
            entries.push(CheckpointEntry {
                space_id: id,
                tuples: pk.lock().read_view(),
            });
        }
        info!(spaces = entries.len(), "checkpoint started");
        *slot = Some(Checkpoint {
            entries: Some(entries),
            vclock: VClock::new(),
        });
        Ok(())
    }

    /// Stream the read views to a `.snap.inprogress` file on a
    /// dedicated cord; the calling fiber yields until the writer cord
    /// exits.
    pub fn wait_checkpoint(&self, vclock: VClock, server_uuid: Uuid) -> Result<()> {
        let (entries, path) = {
            let mut slot = self.checkpoint.lock();
            let ck = slot
                .as_mut()
                .ok_or_else(|| SpindleError::illegal_params("no checkpoint in progress"))?;
            ck.vclock = vclock.clone();
            let entries = ck
                .entries
                .take()
                .ok_or_else(|| SpindleError::illegal_params("checkpoint already written"))?;
            let path = format_filename(&self.snap_dir, vclock.sum(), FileKind::Snap, true);
            (entries, path)
        };
        let rate_limit = match self.snap_io_rate_limit.load(Ordering::Acquire) {
            u64::MAX => None,
            limit => Some(limit),
        };
        let writer_path = path.clone();
        let handle = fiber::cord_costart("snapshot", move || {
            write_snapshot(&writer_path, server_uuid, &vclock, &entries, rate_limit)
        })?;
        let result = fiber::cord_cojoin(handle);
        if let Err(e) = &result {
            error!(error = %e, "snapshot writer failed");
        }
        result
    }

    /// Rename the in-progress file into place and remember the new
    /// checkpoint.
    pub fn commit_checkpoint(&self) -> Result<()> {
        let ck = self
            .checkpoint
            .lock()
            .take()
            .expect("commit without a checkpoint");
        let from = format_filename(&self.snap_dir, ck.vclock.sum(), FileKind::Snap, true);
        let to = format_filename(&self.snap_dir, ck.vclock.sum(), FileKind::Snap, false);
        std::fs::rename(&from, &to)?;
        info!(file = %to.display(), "checkpoint committed");
        self.set_last_checkpoint(ck.vclock);
        Ok(())
    }

    /// Drop the in-progress file and the read views.
    pub fn abort_checkpoint(&self) {
        if let Some(ck) = self.checkpoint.lock().take() {
            let path = format_filename(&self.snap_dir, ck.vclock.sum(), FileKind::Snap, true);
            let _ = std::fs::remove_file(&path);
            warn!("checkpoint aborted");
        }
    }
}

/// The snapshot cord's fiber: stream every read view into the file,
/// honoring the byte-per-second budget.
fn write_snapshot(
    path: &std::path::Path,
    server_uuid: Uuid,
    vclock: &VClock,
    entries: &[CheckpointEntry],
    rate_limit: Option<u64>,
) -> Result<()> {
    info!(file = %path.display(), "saving snapshot");
    let mut writer = XlogWriter::create(path, FileKind::Snap, server_uuid, vclock)?;
    let mut limiter = SnapIoRateLimiter::new(rate_limit);
    for entry in entries {
        for tuple in &entry.tuples {
            // Snapshot rows are numbered 1..=n under the anonymous
            // server id, like a WAL being streamed from the start.
            let row = Row {
                op: RowOp::Insert,
                space_id: entry.space_id,
                body: tuple.data().to_vec(),
                lsn: writer.rows() as i64 + 1,
                server_id: 0,
            };
            let written = writer.write_row(&row)?;
            if writer.rows() % 100_000 == 0 {
                info!(rows = writer.rows(), "snapshot progress");
                fiber::gc();
            }
            limiter.account(written, &mut writer)?;
        }
    }
    writer.finalize()?;
    fiber::gc();
    info!("snapshot done");
    Ok(())
}
