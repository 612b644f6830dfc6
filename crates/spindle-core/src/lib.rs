//! SpindleDB core.
//!
//! An in-memory storage engine with write-ahead logging, snapshotting
//! and an online schema-alter protocol, built on the cooperative fiber
//! runtime in `spindle-fiber`. The pieces:
//!
//! - [`space`]: spaces (named indexed tuple collections) and their
//!   definitions.
//! - [`txn`]: the per-fiber transaction manager and its trigger lists.
//! - [`memtx`]: the engine proper: recovery state machine, replace
//!   dispatch, checkpointing.
//! - [`xlog`]: the snapshot/WAL file container and vector clocks.
//! - [`wal`]: the write-ahead-log collaborator contract.
//! - [`schema`]: the data dictionary (system spaces, users, functions,
//!   privileges).
//! - [`alter`]: the alter-space planner and the data-dictionary
//!   triggers.
//! - [`cluster`]: cluster identity (UUID and the replica roster).
//! - [`db`]: the assembled database: bootstrap, request execution,
//!   recovery and checkpoint drivers.

pub mod alter;
pub mod cluster;
pub mod db;
pub mod extent;
pub mod memtx;
pub mod schema;
pub mod space;
pub mod txn;
pub mod wal;
pub mod xlog;

pub use db::{Db, DbOptions};
pub use schema::{ADMIN, GUEST, PUBLIC};
