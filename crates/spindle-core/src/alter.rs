//! The alter-space planner and the data-dictionary triggers.
//!
//! Every schema change arrives as a mutation of a system space. The
//! trigger for that space assembles a plan (a list of [`AlterOp`]s)
//! and runs it through a fixed pipeline *before* the WAL write:
//!
//! 1. `prepare`: validation and op merging. A `DropIndex` immediately
//!    followed by an `AddIndex` with the same type, uniqueness and
//!    parts collapses into a `ModifyIndex` (or into nothing when the
//!    definitions are identical), which turns a cosmetic change into a
//!    handle move instead of a full rebuild.
//! 2. `alter_def`: derive the new space definition and key list from a
//!    clone of the old ones. No side effects on the old space.
//! 3. Construct the new, empty space and copy the old space's recovery
//!    phase and access map onto it.
//! 4. `alter`: the only phase that may build indexes or scan data. An
//!    index built during normal operation gets a synchronization
//!    trigger on the old space so concurrent writes keep it current
//!    while the WAL write is in flight.
//! 5. Install commit/rollback triggers on the enclosing transaction.
//!
//! Everything that can fail happens before the WAL write; the commit
//! trigger is infallible. On commit, unchanged indexes move into the
//! new space by handle swap and the new space atomically replaces the
//! old one in the cache; no request is ever dispatched against a
//! transitional state, because the trigger runs to completion without
//! yielding. On rollback the new space is dropped and the old space is
//! untouched.

use std::sync::Arc;

use parking_lot::Mutex;
use spindle_error::{Result, SpindleError};
use spindle_index::DupMode;
use spindle_types::{FieldType, IndexType, KeyDef, KeyPart, TupleRef};
use tracing::info;

use crate::cluster::server_id_is_reserved;
use crate::db::Db;
use crate::memtx::{self, RecoveryState, ReplaceFn};
use crate::schema::{
    access_check_ddl, func_from_tuple, user_from_tuple, PrivDef, Schema, SchemaObjectType,
    ADMIN, GUEST, PUBLIC, SC_CLUSTER_ID, SC_FUNC_ID, SC_INDEX_ID, SC_PRIV_ID, SC_SCHEMA_ID,
    SC_SPACE_ID, SC_USER_ID,
};
use crate::space::{Space, SpaceDef};
use crate::txn;

/// Build a key definition from a `_index` tuple:
/// `(space_id, iid, name, type, unique, part_count, (field_no, field_type)*)`.
pub fn key_def_new_from_tuple(tuple: &TupleRef) -> Result<KeyDef> {
    let space_id = tuple.field_u32(0)?;
    let iid = tuple.field_u32(1)?;
    let name = tuple.field_str(2)?.to_owned();
    let type_name = tuple.field_str(3)?;
    let index_type =
        IndexType::from_name(type_name).map_err(|_| SpindleError::IndexType {
            index: name.clone(),
            space: space_id.to_string(),
        })?;
    let unique = tuple.field_u32(4)? > 0;
    let part_count = tuple.field_u32(5)?;
    let mut parts = Vec::with_capacity(part_count as usize);
    for i in 0..part_count {
        let field_no = tuple.field_u32(6 + i * 2)?;
        let field_type = FieldType::from_name(tuple.field_str(7 + i * 2)?)?;
        parts.push(KeyPart {
            field_no,
            field_type,
        });
    }
    KeyDef::new(space_id, iid, name, index_type, unique, parts)
}

// ---------------------------------------------------------------------------
// The plan
// ---------------------------------------------------------------------------

/// One staged sub-operation of a space alter.
enum AlterOp {
    /// Change non-essential properties of the space.
    ModifySpace { def: SpaceDef },
    /// Remove an index.
    DropIndex { old_key_def: KeyDef },
    /// Change non-essential properties of an index: the data moves, it
    /// is not rebuilt.
    ModifyIndex {
        new_key_def: KeyDef,
        old_key_def: KeyDef,
    },
    /// Add (and populate) a new index.
    AddIndex {
        new_key_def: KeyDef,
        /// Id of the synchronization trigger installed on the old
        /// space while the WAL write is in flight.
        sync_trigger: Option<u64>,
    },
}

/// A staged, reversible description of one space alter. Lives from the
/// data-dictionary trigger to the matching commit or rollback trigger.
struct AlterSpace {
    ops: Vec<AlterOp>,
    space_def: SpaceDef,
    key_list: Vec<KeyDef>,
    old_space_id: u32,
    new_space: Option<Space>,
}

/// The template method: run the plan through its phases and leave the
/// decision to the transaction's WAL outcome.
fn alter_space_do(db: &Db, schema: &mut Schema, ops: Vec<AlterOp>, old_space_id: u32) -> Result<()> {
    let (space_def, key_list) = {
        let old_space = schema.space(old_space_id)?;
        if old_space.being_altered {
            return Err(SpindleError::alter_space(
                old_space_id,
                "the space is already being altered",
            ));
        }
        (old_space.def.clone(), old_space.dump_def())
    };
    let mut alter = AlterSpace {
        ops,
        space_def,
        key_list,
        old_space_id,
        new_space: None,
    };

    prepare(&mut alter, schema)?;

    let ops = std::mem::take(&mut alter.ops);
    for op in &ops {
        op.alter_def(&mut alter);
    }
    alter.ops = ops;

    let mut new_space = Space::new(alter.space_def.clone(), &alter.key_list)?;
    {
        // The new space is at the same recovery phase as the old one,
        // and inherits its access map.
        let old_space = schema.space(old_space_id)?;
        new_space.replace_fn = old_space.replace_fn;
        new_space.access = old_space.access.clone();
    }
    alter.new_space = Some(new_space);

    let mut ops = std::mem::take(&mut alter.ops);
    let mut alter_err = None;
    for op in &mut ops {
        if let Err(e) = op.alter(db, schema, &mut alter) {
            alter_err = Some(e);
            break;
        }
    }
    if let Some(e) = alter_err {
        // Unwind whatever the completed ops left on the old space; the
        // plan and the half-built new space drop here.
        for op in &ops {
            op.undo_alter(schema, old_space_id);
        }
        return Err(e);
    }
    alter.ops = ops;

    schema.space_mut(old_space_id)?.being_altered = true;

    let plan = Arc::new(Mutex::new(Some(alter)));
    let commit_plan = Arc::clone(&plan);
    txn::on_commit(move |db| {
        if let Some(alter) = commit_plan.lock().take() {
            alter_space_commit(db, alter);
        }
    });
    txn::on_rollback(move |db| {
        if let Some(alter) = plan.lock().take() {
            alter_space_rollback(db, alter);
        }
    });
    Ok(())
}

/// Validation and op merging.
fn prepare(alter: &mut AlterSpace, schema: &Schema) -> Result<()> {
    let old_space = schema.space(alter.old_space_id)?;
    let ops = std::mem::take(&mut alter.ops);
    let mut out: Vec<AlterOp> = Vec::with_capacity(ops.len());
    for op in ops {
        match op {
            AlterOp::AddIndex {
                new_key_def,
                sync_trigger,
            } => {
                let mergeable = matches!(
                    out.last(),
                    Some(AlterOp::DropIndex { old_key_def })
                        if old_key_def.iid == new_key_def.iid
                            && old_key_def.same_parts(&new_key_def)
                );
                if mergeable {
                    let Some(AlterOp::DropIndex { old_key_def }) = out.pop() else {
                        unreachable!("mergeable implies a preceding drop");
                    };
                    // The index is too similar to rebuild. If only the
                    // cosmetic attributes changed, keep the data and
                    // move it; if nothing changed, both ops dissolve.
                    if !old_key_def.same_def(&new_key_def) {
                        out.push(AlterOp::ModifyIndex {
                            new_key_def,
                            old_key_def,
                        });
                    }
                } else {
                    out.push(AlterOp::AddIndex {
                        new_key_def,
                        sync_trigger,
                    });
                }
            }
            AlterOp::ModifySpace { def } => {
                modify_space_prepare(&def, old_space)?;
                out.push(AlterOp::ModifySpace { def });
            }
            other => out.push(other),
        }
    }
    alter.ops = out;
    Ok(())
}

fn modify_space_prepare(def: &SpaceDef, old_space: &Space) -> Result<()> {
    let id = old_space.id();
    if def.id != id {
        return Err(SpindleError::alter_space(id, "space id is immutable"));
    }
    if def.engine != old_space.def.engine {
        return Err(SpindleError::alter_space(id, "can not change space engine"));
    }
    let live = old_space.replace_fn != ReplaceFn::NoKeys && old_space.size() > 0;
    if def.field_count != 0 && def.field_count != old_space.def.field_count && live {
        return Err(SpindleError::alter_space(
            id,
            "can not change field count on a non-empty space",
        ));
    }
    if def.temporary != old_space.def.temporary && live {
        return Err(SpindleError::alter_space(
            id,
            "can not switch temporary flag on a non-empty space",
        ));
    }
    Ok(())
}

impl AlterOp {
    /// Amend the new definition; no side effects on the old space.
    fn alter_def(&self, alter: &mut AlterSpace) {
        match self {
            Self::ModifySpace { def } => alter.space_def = def.clone(),
            Self::DropIndex { old_key_def } => {
                alter.key_list.retain(|k| k.iid != old_key_def.iid);
            }
            Self::ModifyIndex {
                new_key_def,
                old_key_def,
            } => {
                alter.key_list.retain(|k| k.iid != old_key_def.iid);
                alter.key_list.push(new_key_def.clone());
            }
            Self::AddIndex { new_key_def, .. } => alter.key_list.push(new_key_def.clone()),
        }
    }

    /// The build phase: the only one that may scan data.
    fn alter(&mut self, db: &Db, schema: &mut Schema, alter: &mut AlterSpace) -> Result<()> {
        match self {
            Self::ModifySpace { .. } | Self::ModifyIndex { .. } => Ok(()),
            Self::DropIndex { .. } => {
                let new_space = alter.new_space.as_mut().expect("new space staged");
                if new_space.index_opt(0).is_some() {
                    // Not the primary: the dropped index simply does
                    // not exist in the new space.
                    return Ok(());
                }
                if new_space.is_system() {
                    return Err(SpindleError::LastDrop { id: new_space.id() });
                }
                if new_space.index_count() > 0 {
                    return Err(SpindleError::DropPrimaryKey { id: new_space.id() });
                }
                // Dropping the primary key puts the space back into the
                // no-keys state so DML gets a clear error.
                memtx::drop_primary_key(new_space);
                Ok(())
            }
            Self::AddIndex {
                new_key_def,
                sync_trigger,
            } => add_index_alter(db, schema, alter, new_key_def, sync_trigger),
        }
    }

    /// Undo the build phase's side effects on the old space after a
    /// later op failed.
    fn undo_alter(&self, schema: &mut Schema, old_space_id: u32) {
        if let Self::AddIndex {
            sync_trigger: Some(id),
            ..
        } = self
        {
            if let Ok(old_space) = schema.space_mut(old_space_id) {
                old_space.remove_build_sync(*id);
            }
        }
    }
}

fn add_index_alter(
    db: &Db,
    schema: &mut Schema,
    alter: &mut AlterSpace,
    new_key_def: &KeyDef,
    sync_trigger: &mut Option<u64>,
) -> Result<()> {
    let state = db.engine().state();
    {
        let new_space = alter.new_space.as_mut().expect("new space staged");
        if new_space.replace_fn == ReplaceFn::NoKeys {
            if new_key_def.iid == 0 {
                // Bring the space up to speed with the current recovery
                // phase: prepare the primary for bulk build during
                // snapshot load, build it during WAL replay, or enable
                // all keys online.
                memtx::add_primary_key(new_space, state)?;
            }
            // A secondary on a keyless space: nothing to build.
            return Ok(());
        }
    }
    if state == RecoveryState::InitialRecovery {
        // Secondary keys are deferred to the end of recovery.
        return Ok(());
    }

    let pk_tuples = {
        let old_space = schema.space(alter.old_space_id)?;
        let pk = old_space.primary_key()?;
        let view = pk.lock().read_view();
        view
    };
    let new_space = alter.new_space.as_ref().expect("new space staged");
    let new_index = new_space.index(new_key_def.iid)?;

    if state == RecoveryState::FinalRecovery {
        if new_key_def.iid == 0 {
            // Bulk rebuild from the old primary: safe without
            // tuple-by-tuple verification, every tuple was validated
            // before shutdown.
            memtx::index_build(&new_index, &pk_tuples)?;
        }
        return Ok(());
    }

    // Normal operation: build tuple by tuple. There is no guarantee
    // the data satisfies the new index's constraints; any conflict or
    // format violation aborts the whole alter.
    {
        let new_format = Arc::clone(&new_space.format);
        let mut index = new_index.lock();
        index.begin_build();
        index.end_build();
        for tuple in &pk_tuples {
            tuple.check_format(&new_format)?;
            index.replace(None, Some(tuple), DupMode::Insert)?;
        }
    }

    // The old space stays live until the WAL write completes: mirror
    // every subsequent replace into the new index.
    let trigger_id = schema
        .space_mut(alter.old_space_id)?
        .add_build_sync(Arc::clone(&new_index));
    *sync_trigger = Some(trigger_id);
    Ok(())
}

/// WAL accepted the DDL record: coalesce the new space with the old
/// one. Infallible by contract.
fn alter_space_commit(db: &Db, mut alter: AlterSpace) {
    let mut schema = db.schema_lock();
    let mut new_space = alter.new_space.take().expect("new space staged");
    {
        let old_space = schema
            .space_mut(alter.old_space_id)
            .expect("altered space vanished from the cache");
        // An unchanged index keeps all its properties; move it into
        // the new space by handle swap. A changed index has an op
        // below that knows where it goes.
        for def in new_space.dump_def() {
            if let Some(old_index) = old_space.index_opt(def.iid) {
                if old_index.lock().key_def().same_def(&def) {
                    new_space.set_index(def.iid, Arc::clone(&old_index));
                }
            }
        }
        for op in &alter.ops {
            match op {
                AlterOp::ModifyIndex {
                    new_key_def,
                    old_key_def,
                } => {
                    // Move the populated index into its new place,
                    // with the amended definition.
                    let old_index = old_space
                        .index_opt(old_key_def.iid)
                        .expect("modified index exists in the old space");
                    old_index.lock().set_key_def(new_key_def.clone());
                    new_space.set_index(new_key_def.iid, old_index);
                }
                AlterOp::ModifySpace { .. }
                | AlterOp::DropIndex { .. }
                | AlterOp::AddIndex { .. } => {
                    // Dropped indexes die with the old space; added
                    // ones are already in place.
                }
            }
        }
        old_space.rebuild_index_map();
        new_space.rebuild_index_map();
        // The space triggers move with the space.
        std::mem::swap(&mut old_space.on_replace, &mut new_space.on_replace);
    }
    // The build-sync triggers rode over with the trigger list; the
    // indexes they fed are now served by the space itself.
    for op in &alter.ops {
        if let AlterOp::AddIndex {
            sync_trigger: Some(id),
            ..
        } = op
        {
            new_space.remove_build_sync(*id);
        }
    }
    new_space.being_altered = false;
    let old = schema.cache_replace(new_space);
    debug_assert!(old.is_some(), "the old space must have been cached");
    drop(old);
    info!(space_id = alter.old_space_id, "space alter committed");
}

/// The WAL write failed: drop the new space, leave the old one alone.
fn alter_space_rollback(db: &Db, alter: AlterSpace) {
    let mut schema = db.schema_lock();
    if let Ok(old_space) = schema.space_mut(alter.old_space_id) {
        for op in &alter.ops {
            if let AlterOp::AddIndex {
                sync_trigger: Some(id),
                ..
            } = op
            {
                old_space.remove_build_sync(*id);
            }
        }
        old_space.being_altered = false;
    }
    info!(space_id = alter.old_space_id, "space alter rolled back");
}

// ---------------------------------------------------------------------------
// Data-dictionary triggers
// ---------------------------------------------------------------------------

/// Dispatch a system-space mutation to its trigger. Runs after the
/// statement applied in memory, before the WAL write; an error here
/// aborts the statement.
pub(crate) fn on_replace_dd(
    db: &Db,
    schema: &mut Schema,
    space_id: u32,
    old_tuple: Option<&TupleRef>,
    new_tuple: Option<&TupleRef>,
) -> Result<()> {
    match space_id {
        SC_SPACE_ID => on_replace_dd_space(db, schema, old_tuple, new_tuple),
        SC_INDEX_ID => on_replace_dd_index(db, schema, old_tuple, new_tuple),
        SC_USER_ID => on_replace_dd_user(schema, old_tuple, new_tuple),
        SC_FUNC_ID => on_replace_dd_func(schema, old_tuple, new_tuple),
        SC_PRIV_ID => on_replace_dd_priv(schema, old_tuple, new_tuple),
        SC_SCHEMA_ID => on_replace_dd_schema(db, old_tuple, new_tuple),
        SC_CLUSTER_ID => on_replace_dd_cluster(new_tuple),
        _ => Ok(()),
    }
}

fn subject(old_tuple: Option<&TupleRef>, new_tuple: Option<&TupleRef>) -> Result<TupleRef> {
    old_tuple
        .or(new_tuple)
        .cloned()
        .ok_or_else(|| SpindleError::illegal_params("empty data-dictionary statement"))
}

/// `_space`: INSERT creates a space, DELETE drops one, UPDATE alters
/// its non-essential properties in WAL-error-safe mode.
fn on_replace_dd_space(
    db: &Db,
    schema: &mut Schema,
    old_tuple: Option<&TupleRef>,
    new_tuple: Option<&TupleRef>,
) -> Result<()> {
    // Use the old tuple's id when present: an UPDATE may not change it.
    let old_id = subject(old_tuple, new_tuple)?.field_u32(0)?;
    let old_space_exists = schema.space_by_id(old_id).is_some();
    match (new_tuple, old_space_exists) {
        (Some(new_tuple), false) => {
            // INSERT: stage the space in the cache now. Until the WAL
            // write lands the space may serve DML; those statements are
            // rolled back by the pipelined rollback, so dropping the
            // space on rollback is safe.
            let def = SpaceDef::from_tuple(new_tuple, true)?;
            access_check_ddl(schema, def.uid)?;
            let space = Space::new(def, &[])?;
            schema.cache_replace(space);
            txn::on_rollback(move |db| {
                db.schema_lock().cache_delete(old_id);
            });
            Ok(())
        }
        (None, _) => {
            // DELETE: a space can go only when nothing references it.
            let space = schema.space(old_id)?;
            access_check_ddl(schema, space.def.uid)?;
            if space.index_count() != 0 {
                return Err(SpindleError::DropSpace {
                    id: old_id,
                    detail: "the space has indexes".to_owned(),
                });
            }
            if schema.find_grants(SchemaObjectType::Space, old_id)? {
                return Err(SpindleError::DropSpace {
                    id: old_id,
                    detail: "the space has grants".to_owned(),
                });
            }
            txn::on_commit(move |db| {
                db.schema_lock().cache_delete(old_id);
            });
            Ok(())
        }
        (Some(new_tuple), true) => {
            let def = SpaceDef::from_tuple(new_tuple, false)?;
            access_check_ddl(schema, def.uid)?;
            alter_space_do(db, schema, vec![AlterOp::ModifySpace { def }], old_id)
        }
    }
}

/// `_index`: INSERT adds an index, DELETE drops one, UPDATE stages a
/// drop and an add, in that order, so `prepare` can merge them into a
/// `ModifyIndex` when only cosmetic attributes changed.
fn on_replace_dd_index(
    db: &Db,
    schema: &mut Schema,
    old_tuple: Option<&TupleRef>,
    new_tuple: Option<&TupleRef>,
) -> Result<()> {
    let target = subject(old_tuple, new_tuple)?;
    let space_id = target.field_u32(0)?;
    let iid = target.field_u32(1)?;
    {
        let old_space = schema.space(space_id)?;
        access_check_ddl(schema, old_space.def.uid)?;
    }
    let old_key_def = schema
        .space(space_id)?
        .index_opt(iid)
        .map(|index| index.lock().key_def().clone());
    let mut ops = Vec::new();
    if let Some(old_key_def) = old_key_def {
        ops.push(AlterOp::DropIndex { old_key_def });
    }
    if let Some(new_tuple) = new_tuple {
        ops.push(AlterOp::AddIndex {
            new_key_def: key_def_new_from_tuple(new_tuple)?,
            sync_trigger: None,
        });
    }
    alter_space_do(db, schema, ops, space_id)
}

/// `_user`: cache maintenance with commit/rollback symmetry, plus the
/// reserved-user and has-objects drop refusals.
fn on_replace_dd_user(
    schema: &mut Schema,
    old_tuple: Option<&TupleRef>,
    new_tuple: Option<&TupleRef>,
) -> Result<()> {
    let uid = subject(old_tuple, new_tuple)?.field_u32(0)?;
    let cached = schema.users.contains_key(&uid);
    match (new_tuple, cached) {
        (Some(new_tuple), false) => {
            let user = user_from_tuple(schema, new_tuple)?;
            schema.users.insert(uid, user);
            txn::on_rollback(move |db| {
                db.schema_lock().users.remove(&uid);
            });
            Ok(())
        }
        (None, _) => {
            let old_user = schema
                .users
                .get(&uid)
                .cloned()
                .ok_or_else(|| SpindleError::NoSuchUser {
                    user: uid.to_string(),
                })?;
            access_check_ddl(schema, old_user.owner)?;
            if uid == GUEST || uid == ADMIN || uid == PUBLIC {
                return Err(SpindleError::DropUser {
                    user: old_user.name,
                    detail: "the user is a system user".to_owned(),
                });
            }
            if schema.user_has_data(uid)? {
                return Err(SpindleError::DropUser {
                    user: old_user.name,
                    detail: "the user has objects".to_owned(),
                });
            }
            txn::on_commit(move |db| {
                db.schema_lock().users.remove(&uid);
            });
            Ok(())
        }
        (Some(new_tuple), true) => {
            // Check the change now, install it only once the WAL
            // accepts it.
            let user = user_from_tuple(schema, new_tuple)?;
            txn::on_commit(move |db| {
                db.schema_lock().users.insert(uid, user);
            });
            Ok(())
        }
    }
}

/// `_func`: same shape as `_user`.
fn on_replace_dd_func(
    schema: &mut Schema,
    old_tuple: Option<&TupleRef>,
    new_tuple: Option<&TupleRef>,
) -> Result<()> {
    let fid = subject(old_tuple, new_tuple)?.field_u32(0)?;
    let cached = schema.funcs.contains_key(&fid);
    match (new_tuple, cached) {
        (Some(new_tuple), false) => {
            let func = func_from_tuple(new_tuple)?;
            access_check_ddl(schema, func.uid)?;
            schema.funcs.insert(fid, func);
            txn::on_rollback(move |db| {
                db.schema_lock().funcs.remove(&fid);
            });
            Ok(())
        }
        (None, _) => {
            let old_tuple = old_tuple.ok_or_else(|| SpindleError::NoSuchFunction {
                name: fid.to_string(),
            })?;
            let func = func_from_tuple(old_tuple)?;
            access_check_ddl(schema, func.uid)?;
            if schema.find_grants(SchemaObjectType::Function, fid)? {
                return Err(SpindleError::DropFunction {
                    fid,
                    detail: "function has grants".to_owned(),
                });
            }
            txn::on_commit(move |db| {
                db.schema_lock().funcs.remove(&fid);
            });
            Ok(())
        }
        (Some(new_tuple), true) => {
            let func = func_from_tuple(new_tuple)?;
            access_check_ddl(schema, func.uid)?;
            txn::on_commit(move |db| {
                db.schema_lock().funcs.insert(fid, func);
            });
            Ok(())
        }
    }
}

/// `_priv`: grants apply to the caches immediately with a revoke on
/// rollback; revokes and modifications wait for the commit.
fn on_replace_dd_priv(
    schema: &mut Schema,
    old_tuple: Option<&TupleRef>,
    new_tuple: Option<&TupleRef>,
) -> Result<()> {
    match (old_tuple, new_tuple) {
        (None, Some(new_tuple)) => {
            let priv_def = PrivDef::from_tuple(new_tuple)?;
            schema.priv_def_check(&priv_def)?;
            schema.grant_or_revoke(&priv_def);
            let mut revoke = priv_def;
            revoke.access = 0;
            txn::on_rollback(move |db| {
                db.schema_lock().grant_or_revoke(&revoke);
            });
            Ok(())
        }
        (Some(old_tuple), None) => {
            let mut revoke = PrivDef::from_tuple(old_tuple)?;
            access_check_ddl(schema, revoke.grantor_id)?;
            revoke.access = 0;
            txn::on_commit(move |db| {
                db.schema_lock().grant_or_revoke(&revoke);
            });
            Ok(())
        }
        (Some(_), Some(new_tuple)) => {
            let priv_def = PrivDef::from_tuple(new_tuple)?;
            schema.priv_def_check(&priv_def)?;
            txn::on_commit(move |db| {
                db.schema_lock().grant_or_revoke(&priv_def);
            });
            Ok(())
        }
        (None, None) => Err(SpindleError::illegal_params("empty _priv statement")),
    }
}

/// `_schema`: the only recognized key is `cluster`, which assigns the
/// cluster UUID during early recovery and is read-only afterwards.
fn on_replace_dd_schema(
    db: &Db,
    old_tuple: Option<&TupleRef>,
    new_tuple: Option<&TupleRef>,
) -> Result<()> {
    let key_tuple = subject(old_tuple, new_tuple)?;
    let key = key_tuple.field_str(0)?;
    if key != "cluster" {
        return Ok(());
    }
    let new_tuple = new_tuple.ok_or(SpindleError::ClusterIdIsRo)?;
    let uuid = new_tuple.field_uuid(1)?;
    let mut cluster = db.cluster_lock();
    if !db.is_recovering() && cluster.cluster_id().is_some() {
        return Err(SpindleError::ClusterIdIsRo);
    }
    cluster.set_cluster_id(uuid);
    Ok(())
}

/// `_cluster`: appends `(server_id, uuid)` to the roster. Deletes are
/// refused; the id must lie outside the reserved band.
fn on_replace_dd_cluster(new_tuple: Option<&TupleRef>) -> Result<()> {
    let new_tuple = new_tuple.ok_or(SpindleError::ServerIdIsRo)?;
    let server_id = new_tuple.field_u32(0)?;
    if server_id_is_reserved(server_id) {
        return Err(SpindleError::ServerIdIsReserved { id: server_id });
    }
    let uuid = new_tuple.field_uuid(1)?;
    if uuid.is_nil() {
        return Err(SpindleError::InvalidUuid {
            value: uuid.to_string(),
        });
    }
    txn::on_commit(move |db| {
        db.cluster_lock()
            .add_server(server_id, uuid)
            .expect("server id validated before commit");
    });
    Ok(())
}
