//! Cooperative fiber runtime for SpindleDB.
//!
//! The concurrency substrate the storage engine runs on: stackful
//! fibers multiplexed on cords (one event loop per cord), cross-thread
//! cord spawning with cojoin, fiber pools, and per-fiber scratch
//! regions. Scheduling is strictly cooperative: a fiber runs until it
//! yields, and the ready list preserves wakeup order.

mod fiber;
mod pool;
mod region;

pub use fiber::{
    cord_cojoin, cord_costart, cord_join, current, each, find, gc, new, reschedule, run_main,
    set_cancellable, sleep, testcancel, try_current, with_region, yield_now, yield_timeout,
    CordHandle, Fiber, TriggerId, FIBER_ID_RESERVED_MAX, FIBER_ID_SCHED, FIBER_IS_CANCELLABLE,
    FIBER_IS_CANCELLED, FIBER_IS_DEAD, FIBER_IS_JOINABLE,
};
pub use pool::FiberPool;
pub use region::{Region, REGION_GC_THRESHOLD};
