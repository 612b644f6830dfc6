//! Write-ahead-log collaborator contract.
//!
//! The engine applies a transaction's statements in memory first, then
//! hands their rows to the WAL. The WAL persists and fsyncs them; the
//! append result is the commit/rollback decision point. Appends happen
//! in commit order on the main cord, so wakeup ordering downstream of
//! the append preserves WAL order.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use spindle_error::{Result, SpindleError};
use spindle_fiber as fiber;
use tracing::debug;
use uuid::Uuid;

use crate::xlog::{format_filename, FileKind, VClock, XlogWriter};

pub use crate::xlog::{Row, RowOp};

/// The WAL the engine commits through.
///
/// `rows` arrive with their LSNs already assigned from the database
/// vclock; `vclock` is the clock as of just before those rows, used to
/// name and stamp a freshly created log file.
pub trait Wal: Send + Sync {
    fn append(&self, rows: &[Row], vclock: &VClock) -> Result<()>;
}

impl<W: Wal + ?Sized> Wal for std::sync::Arc<W> {
    fn append(&self, rows: &[Row], vclock: &VClock) -> Result<()> {
        (**self).append(rows, vclock)
    }
}

/// A WAL that persists rows into xlog-container files, one file per
/// engine lifetime, fsynced per transaction.
pub struct XlogWal {
    dir: PathBuf,
    server_uuid: Uuid,
    writer: Mutex<Option<XlogWriter>>,
}

impl XlogWal {
    pub fn new(dir: PathBuf, server_uuid: Uuid) -> Self {
        Self {
            dir,
            server_uuid,
            writer: Mutex::new(None),
        }
    }
}

impl Wal for XlogWal {
    fn append(&self, rows: &[Row], vclock: &VClock) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer.lock();
        if writer.is_none() {
            let path = format_filename(&self.dir, vclock.sum(), FileKind::Xlog, false);
            *writer = Some(XlogWriter::create(
                &path,
                FileKind::Xlog,
                self.server_uuid,
                vclock,
            )?);
        }
        let writer = writer.as_mut().expect("writer just created");
        for row in rows {
            writer.write_row(row)?;
        }
        writer.sync_data()?;
        debug!(rows = rows.len(), "wal append");
        Ok(())
    }
}

/// A WAL that accepts everything and persists nothing. Used while
/// recovery replays existing logs.
pub struct NullWal;

impl Wal for NullWal {
    fn append(&self, _rows: &[Row], _vclock: &VClock) -> Result<()> {
        Ok(())
    }
}

/// Fault-injection wrapper for recovery and rollback tests, in the
/// spirit of the engine's error-injection hooks: fail the next append
/// on request, and optionally yield before appending so that other
/// fibers run inside the WAL-write window.
pub struct FaultInjectingWal<W: Wal> {
    inner: W,
    fail_next: AtomicBool,
    yield_before_append: AtomicBool,
}

impl<W: Wal> FaultInjectingWal<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            fail_next: AtomicBool::new(false),
            yield_before_append: AtomicBool::new(false),
        }
    }

    /// Make the next append fail with a system error.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::Release);
    }

    /// Yield to the scheduler at the start of every append, widening
    /// the in-flight window other fibers can run in.
    pub fn set_yield_before_append(&self, yesno: bool) {
        self.yield_before_append.store(yesno, Ordering::Release);
    }
}

impl<W: Wal> Wal for FaultInjectingWal<W> {
    fn append(&self, rows: &[Row], vclock: &VClock) -> Result<()> {
        if self.yield_before_append.load(Ordering::Acquire) && fiber::try_current().is_some() {
            fiber::reschedule();
        }
        if self.fail_next.swap(false, Ordering::AcqRel) {
            return Err(SpindleError::System(std::io::Error::other(
                "injected WAL failure",
            )));
        }
        self.inner.append(rows, vclock)
    }
}
