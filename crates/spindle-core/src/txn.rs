//! Transaction manager.
//!
//! A transaction is an ordered list of statements bound to exactly one
//! fiber, with `on_commit` and `on_rollback` trigger lists. The memtx
//! engine forbids yielding inside a non-autocommit transaction: at
//! `begin` it installs on-yield and on-stop triggers on the current
//! fiber that roll the transaction back, and clears them right before
//! the WAL write. Rollback is infallible once issued: the engine
//! reserves index memory before every statement.

use std::cell::RefCell;

use spindle_error::{Result, SpindleError};
use spindle_fiber as fiber;
use spindle_types::TupleRef;
use tracing::debug;

use crate::db::Db;
use crate::memtx;
use crate::wal::Row;

/// One applied statement: what was removed and what was inserted.
pub struct TxnStmt {
    pub space_id: u32,
    pub old: Option<TupleRef>,
    pub new: Option<TupleRef>,
}

type TxnTrigger = Box<dyn FnOnce(&Db) + Send + 'static>;

/// The transaction bound to the current fiber.
pub struct Txn {
    pub(crate) stmts: Vec<TxnStmt>,
    on_commit: Vec<TxnTrigger>,
    on_rollback: Vec<TxnTrigger>,
    autocommit: bool,
    fiber_triggers: Option<(fiber::Fiber, fiber::TriggerId, fiber::TriggerId)>,
}

thread_local! {
    static CURRENT: RefCell<Option<Txn>> = const { RefCell::new(None) };
}

/// Whether the current fiber has an open transaction.
pub fn is_active() -> bool {
    CURRENT.with(|t| t.borrow().is_some())
}

/// Open a transaction on the current fiber.
///
/// For a non-autocommit transaction the engine's yield discipline is
/// armed: any yield or fiber stop before commit rolls the transaction
/// back.
pub fn begin(db: &Db, autocommit: bool) -> Result<()> {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return Err(SpindleError::illegal_params(
                "operation is not permitted when there is an active transaction",
            ));
        }
        let mut txn = Txn {
            stmts: Vec::new(),
            on_commit: Vec::new(),
            on_rollback: Vec::new(),
            autocommit,
            fiber_triggers: None,
        };
        if !autocommit {
            if let Some(f) = fiber::try_current() {
                let on_yield_db = db.clone();
                let yield_id = f.add_on_yield(move || rollback(&on_yield_db));
                let on_stop_db = db.clone();
                let stop_id = f.add_on_stop(move || rollback(&on_stop_db));
                txn.fiber_triggers = Some((f, yield_id, stop_id));
            }
        }
        *slot = Some(txn);
        Ok(())
    })
}

/// Record an applied statement in the current transaction.
pub(crate) fn add_stmt(stmt: TxnStmt) {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let txn = slot.as_mut().expect("statement outside a transaction");
        txn.stmts.push(stmt);
    });
}

/// Register a commit trigger on the current transaction.
pub fn on_commit(f: impl FnOnce(&Db) + Send + 'static) {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let txn = slot.as_mut().expect("trigger outside a transaction");
        txn.on_commit.push(Box::new(f));
    });
}

/// Register a rollback trigger on the current transaction.
pub fn on_rollback(f: impl FnOnce(&Db) + Send + 'static) {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let txn = slot.as_mut().expect("trigger outside a transaction");
        txn.on_rollback.push(Box::new(f));
    });
}

/// Clear the yield-discipline triggers. Done before the WAL write on
/// commit, and first thing on rollback.
fn clear_fiber_triggers(txn: &mut Txn) {
    if let Some((f, yield_id, stop_id)) = txn.fiber_triggers.take() {
        f.remove_on_yield(yield_id);
        f.remove_on_stop(stop_id);
    }
}

/// Commit the current transaction: write its statements to the WAL,
/// then run the commit triggers. A WAL failure rolls everything back
/// and resurfaces the error.
pub fn commit(db: &Db) -> Result<()> {
    let Some(mut txn) = CURRENT.with(|slot| slot.borrow_mut().take()) else {
        return Err(SpindleError::illegal_params("no active transaction"));
    };
    clear_fiber_triggers(&mut txn);

    let rows = match wal_rows(db, &txn) {
        Ok(rows) => rows,
        Err(e) => {
            rollback_txn(db, txn);
            return Err(e);
        }
    };
    if let Err(e) = db.wal_append(rows) {
        rollback_txn(db, txn);
        return Err(e);
    }

    // The WAL accepted the transaction; from here on every step is
    // infallible by contract.
    for trigger in txn.on_commit.drain(..) {
        trigger(db);
    }
    // Old tuples are released as the statements drop.
    debug!(statements = txn.stmts.len(), autocommit = txn.autocommit, "transaction committed");
    Ok(())
}

/// Roll back the current transaction, if any. Infallible.
pub fn rollback(db: &Db) {
    if let Some(txn) = CURRENT.with(|slot| slot.borrow_mut().take()) {
        rollback_txn(db, txn);
    }
}

fn rollback_txn(db: &Db, mut txn: Txn) {
    clear_fiber_triggers(&mut txn);
    memtx::rollback_statements(db, &txn.stmts);
    for trigger in txn.on_rollback.drain(..) {
        trigger(db);
    }
    debug!(statements = txn.stmts.len(), "transaction rolled back");
}

/// Build the WAL image of a transaction. Statements against temporary
/// spaces are not logged.
fn wal_rows(db: &Db, txn: &Txn) -> Result<Vec<Row>> {
    let schema = db.schema_lock();
    let mut rows = Vec::new();
    for stmt in &txn.stmts {
        let Some(space) = schema.space_by_id(stmt.space_id) else {
            continue;
        };
        if space.def.temporary {
            continue;
        }
        rows.push(Row::from_stmt(space, stmt.old.as_ref(), stmt.new.as_ref())?);
    }
    Ok(rows)
}
