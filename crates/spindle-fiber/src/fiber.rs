//! Fibers and cords.
//!
//! A fiber is a cooperative coroutine: it runs until it voluntarily
//! yields, and is scheduled by the cord (thread) that created it. A cord
//! hosts one event loop, a fiber registry, a ready list and a dead
//! (recycle) list.
//!
//! Fibers are realized as strictly serialized OS threads. Control moves
//! between them by baton hand-off: a fiber signals the target's baton
//! and then parks on its own. At most one fiber of a cord executes at
//! any moment, switches are O(1), and user code can yield from
//! arbitrarily deep call stacks, which is what the storage engine's
//! checkpoint writer and index builders rely on. The cord's own thread
//! doubles as the scheduler fiber (fid 1).
//!
//! Ordering contract: [`Fiber::wakeup`] appends to the tail of the
//! ready list, so if A is woken before B, A runs before B. Transaction
//! commit ordering after a WAL write depends on this.

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use spindle_error::{Result, SpindleError};
use tracing::{debug, error};

/// Fiber flag: cancellation was requested.
pub const FIBER_IS_CANCELLED: u8 = 0x01;
/// Fiber flag: the fiber observes cancellation requests.
pub const FIBER_IS_CANCELLABLE: u8 = 0x02;
/// Fiber flag: the fiber must be reaped with [`Fiber::join`].
pub const FIBER_IS_JOINABLE: u8 = 0x04;
/// Fiber flag: the fiber function has returned.
pub const FIBER_IS_DEAD: u8 = 0x08;

const FIBER_DEFAULT_FLAGS: u8 = FIBER_IS_CANCELLABLE;

/// Fids 0..=100 are reserved; the scheduler is fid 1.
pub const FIBER_ID_RESERVED_MAX: u64 = 100;
/// The scheduler fiber's fid on every cord.
pub const FIBER_ID_SCHED: u64 = 1;

const FIBER_STACK_SIZE: usize = 512 * 1024;

type FiberTask = Box<dyn FnOnce() -> Result<()> + Send + 'static>;
type TriggerFn = Box<dyn FnMut() + Send + 'static>;

/// Handle for removing a trigger installed with `add_on_yield` /
/// `add_on_stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerId(u64);

#[derive(Default)]
struct TriggerList {
    next_id: u64,
    items: Vec<(u64, TriggerFn)>,
    /// Ids removed while their closure was temporarily out of the list
    /// (removal requested from inside a running trigger).
    tombstones: HashSet<u64>,
}

impl TriggerList {
    fn add(&mut self, f: TriggerFn) -> TriggerId {
        self.next_id += 1;
        let id = self.next_id;
        self.items.push((id, f));
        TriggerId(id)
    }

    fn remove(&mut self, id: TriggerId) {
        if let Some(pos) = self.items.iter().position(|(i, _)| *i == id.0) {
            self.items.remove(pos);
        } else {
            self.tombstones.insert(id.0);
        }
    }
}

/// Run every trigger in the list. A trigger may add or remove triggers
/// (including itself) while running; the list is unlocked during each
/// call.
fn run_triggers(list: &Mutex<TriggerList>) {
    let mut pos = 0;
    loop {
        let taken = {
            let mut l = list.lock();
            if pos >= l.items.len() {
                break;
            }
            l.items.remove(pos)
        };
        let (id, mut f) = taken;
        f();
        let mut l = list.lock();
        if !l.tombstones.remove(&id) {
            l.items.insert(pos, (id, f));
            pos += 1;
        }
    }
}

struct Baton {
    run: Mutex<bool>,
    cond: Condvar,
}

impl Baton {
    fn new() -> Self {
        Self {
            run: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut run = self.run.lock();
        *run = true;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut run = self.run.lock();
        while !*run {
            self.cond.wait(&mut run);
        }
        *run = false;
    }
}

struct FiberInner {
    cord: Weak<CordInner>,
    fid: AtomicU64,
    name: Mutex<String>,
    flags: AtomicU8,
    csw: AtomicU64,
    baton: Baton,
    caller: Mutex<Option<Arc<FiberInner>>>,
    /// Fibers waiting in `join` for this one to die.
    wake: Mutex<Vec<Arc<FiberInner>>>,
    on_yield: Mutex<TriggerList>,
    on_stop: Mutex<TriggerList>,
    diag: Mutex<Option<SpindleError>>,
    task: Mutex<Option<FiberTask>>,
}

impl FiberInner {
    fn flags(&self) -> u8 {
        self.flags.load(Ordering::Acquire)
    }

    fn set_flag(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    fn clear_flag(&self, flag: u8) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    fn is_dead(&self) -> bool {
        self.flags() & FIBER_IS_DEAD != 0
    }
}

/// Shared handle to a fiber.
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<FiberInner>,
}

struct TimerShared {
    fiber: Arc<FiberInner>,
    fired: AtomicBool,
    cancelled: AtomicBool,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    shared: Arc<TimerShared>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

enum OnExitSlot {
    /// Nobody is waiting yet.
    Unset,
    /// A joiner installed a completion handler.
    Handler(Box<dyn FnOnce() + Send + 'static>),
    /// The cord exited before a handler was installed.
    WontRun,
}

#[derive(Default)]
struct LoopState {
    ready: VecDeque<Arc<FiberInner>>,
    timers: BinaryHeap<TimerEntry>,
    posted: Vec<Box<dyn FnOnce() + Send + 'static>>,
    timer_seq: u64,
    break_loop: bool,
    /// Panic payload carried out of a fiber thread, re-raised by the
    /// scheduler.
    panic: Option<Box<dyn std::any::Any + Send + 'static>>,
}

pub(crate) struct CordInner {
    name: String,
    state: Mutex<LoopState>,
    /// Wakes the event loop out of its timed sleep.
    cond: Condvar,
    registry: Mutex<HashMap<u64, Arc<FiberInner>>>,
    dead: Mutex<Vec<Arc<FiberInner>>>,
    max_fid: AtomicU64,
    sched: Mutex<Option<Arc<FiberInner>>>,
    on_exit: Mutex<OnExitSlot>,
    shutdown: AtomicBool,
}

impl CordInner {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            state: Mutex::new(LoopState::default()),
            cond: Condvar::new(),
            registry: Mutex::new(HashMap::new()),
            dead: Mutex::new(Vec::new()),
            max_fid: AtomicU64::new(FIBER_ID_RESERVED_MAX),
            sched: Mutex::new(None),
            on_exit: Mutex::new(OnExitSlot::Unset),
            shutdown: AtomicBool::new(false),
        })
    }

    fn sched_fiber(&self) -> Arc<FiberInner> {
        self.sched
            .lock()
            .clone()
            .expect("cord has no scheduler fiber")
    }

    fn next_fid(&self) -> u64 {
        let fid = self.max_fid.fetch_add(1, Ordering::AcqRel) + 1;
        if fid <= FIBER_ID_RESERVED_MAX {
            self.max_fid
                .store(FIBER_ID_RESERVED_MAX + 1, Ordering::Release);
            return FIBER_ID_RESERVED_MAX + 1;
        }
        fid
    }

    /// Run `f` on this cord's loop thread at the next iteration.
    pub(crate) fn post(&self, f: Box<dyn FnOnce() + Send + 'static>) {
        let mut st = self.state.lock();
        st.posted.push(f);
        self.cond.notify_one();
    }
}

thread_local! {
    static CURRENT_CORD: std::cell::RefCell<Option<Arc<CordInner>>> =
        const { std::cell::RefCell::new(None) };
    static CURRENT_FIBER: std::cell::RefCell<Option<Arc<FiberInner>>> =
        const { std::cell::RefCell::new(None) };
    static REGION: std::cell::RefCell<crate::region::Region> =
        const { std::cell::RefCell::new(crate::region::Region::new()) };
}

pub(crate) fn current_cord() -> Arc<CordInner> {
    CURRENT_CORD
        .with(|c| c.borrow().clone())
        .expect("not running inside a cord")
}

fn current_inner() -> Arc<FiberInner> {
    CURRENT_FIBER
        .with(|f| f.borrow().clone())
        .expect("not running inside a fiber")
}

/// The currently running fiber.
pub fn current() -> Fiber {
    Fiber {
        inner: current_inner(),
    }
}

/// The currently running fiber, or `None` outside the runtime.
pub fn try_current() -> Option<Fiber> {
    CURRENT_FIBER
        .with(|f| f.borrow().clone())
        .map(|inner| Fiber { inner })
}

/// Look up a live fiber of the current cord by id.
pub fn find(fid: u64) -> Option<Fiber> {
    let cord = current_cord();
    let registry = cord.registry.lock();
    registry.get(&fid).map(|inner| Fiber {
        inner: Arc::clone(inner),
    })
}

/// Visit every registered fiber of the current cord.
pub fn each<F: FnMut(&Fiber)>(mut f: F) {
    let cord = current_cord();
    let fibers: Vec<_> = cord.registry.lock().values().cloned().collect();
    for inner in fibers {
        f(&Fiber { inner });
    }
}

/// Access the current fiber's region allocator.
pub fn with_region<R>(f: impl FnOnce(&mut crate::region::Region) -> R) -> R {
    REGION.with(|r| f(&mut r.borrow_mut()))
}

/// Collect the current fiber's region garbage: reset below the usage
/// threshold, free everything above it.
pub fn gc() {
    REGION.with(|r| r.borrow_mut().gc());
}

fn switch_to(target: &Arc<FiberInner>, me: &Arc<FiberInner>) {
    target.csw.fetch_add(1, Ordering::Relaxed);
    target.baton.signal();
    me.baton.wait();
}

/// Hand control back to the caller (the scheduler by default). Fires the
/// current fiber's on-yield triggers before the switch; by convention
/// they must not panic.
pub fn yield_now() {
    let me = current_inner();
    let cord = current_cord();
    run_triggers(&me.on_yield);
    let target = me
        .caller
        .lock()
        .take()
        .unwrap_or_else(|| cord.sched_fiber());
    switch_to(&target, &me);
}

/// Move the current fiber to the tail of the ready list and run other
/// ready fibers first.
pub fn reschedule() {
    wakeup_inner(&current_inner());
    yield_now();
}

/// Yield with a one-shot timer armed. Returns `true` if the timer fired
/// and `false` if the fiber was woken earlier by someone else.
pub fn yield_timeout(delay: Duration) -> bool {
    let me = current_inner();
    let cord = current_cord();
    let shared = Arc::new(TimerShared {
        fiber: Arc::clone(&me),
        fired: AtomicBool::new(false),
        cancelled: AtomicBool::new(false),
    });
    {
        let mut st = cord.state.lock();
        let seq = st.timer_seq;
        st.timer_seq += 1;
        st.timers.push(TimerEntry {
            deadline: Instant::now() + delay,
            seq,
            shared: Arc::clone(&shared),
        });
        // The loop may be sleeping past the new deadline.
        cord.cond.notify_one();
    }
    yield_now();
    shared.cancelled.store(true, Ordering::Release);
    shared.fired.load(Ordering::Acquire)
}

/// Suspend the current fiber for `delay`.
///
/// A zero delay still gives every fiber already on the ready list a
/// chance to run before this one resumes.
pub fn sleep(delay: Duration) {
    if delay.is_zero() {
        reschedule();
    } else {
        let _ = yield_timeout(delay);
    }
}

/// Return an error if the current fiber has been cancelled. The error
/// must be re-raised by any caller that catches it.
pub fn testcancel() -> Result<()> {
    if current_inner().flags() & FIBER_IS_CANCELLED != 0 {
        return Err(SpindleError::FiberIsCancelled);
    }
    Ok(())
}

/// Change whether the current fiber observes cancellation. Returns the
/// previous setting. Not a cancellation point.
pub fn set_cancellable(yesno: bool) -> bool {
    let me = current_inner();
    let prev = me.flags() & FIBER_IS_CANCELLABLE != 0;
    if yesno {
        me.set_flag(FIBER_IS_CANCELLABLE);
    } else {
        me.clear_flag(FIBER_IS_CANCELLABLE);
    }
    prev
}

fn wakeup_inner(f: &Arc<FiberInner>) {
    // Dead and recycled fibers stay down; scheduling one would hand
    // control to a fiber with nothing to run.
    if f.is_dead() || f.fid.load(Ordering::Acquire) == 0 {
        return;
    }
    let Some(cord) = f.cord.upgrade() else {
        return;
    };
    let mut st = cord.state.lock();
    if st.ready.is_empty() {
        // The loop may be sleeping with no other work pending.
        cord.cond.notify_one();
    }
    // A repeated wakeup moves the fiber to the tail rather than
    // duplicating it.
    if let Some(pos) = st.ready.iter().position(|g| Arc::ptr_eq(g, f)) {
        st.ready.remove(pos);
    }
    st.ready.push_back(Arc::clone(f));
}

/// Create a fiber on the current cord. Pops a parked fiber from the dead
/// list when one is available; otherwise spawns a backing thread.
pub fn new<F>(name: &str, f: F) -> Result<Fiber>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let cord = current_cord();
    let inner = match cord.dead.lock().pop() {
        Some(inner) => inner,
        None => spawn_fiber_thread(&cord)?,
    };
    *inner.task.lock() = Some(Box::new(f));
    let fid = cord.next_fid();
    inner.fid.store(fid, Ordering::Release);
    *inner.name.lock() = name.to_owned();
    cord.registry.lock().insert(fid, Arc::clone(&inner));
    debug!(fid, name, cord = %cord.name, "fiber created");
    Ok(Fiber { inner })
}

fn spawn_fiber_thread(cord: &Arc<CordInner>) -> Result<Arc<FiberInner>> {
    let inner = Arc::new(FiberInner {
        cord: Arc::downgrade(cord),
        fid: AtomicU64::new(0),
        name: Mutex::new(String::new()),
        flags: AtomicU8::new(FIBER_DEFAULT_FLAGS),
        csw: AtomicU64::new(0),
        baton: Baton::new(),
        caller: Mutex::new(None),
        wake: Mutex::new(Vec::new()),
        on_yield: Mutex::new(TriggerList::default()),
        on_stop: Mutex::new(TriggerList::default()),
        diag: Mutex::new(None),
        task: Mutex::new(None),
    });
    let thread_inner = Arc::clone(&inner);
    let thread_cord = Arc::clone(cord);
    std::thread::Builder::new()
        .name(format!("{}/fiber", cord.name))
        .stack_size(FIBER_STACK_SIZE)
        .spawn(move || fiber_thread_main(thread_inner, thread_cord))
        .map_err(|_| SpindleError::OutOfMemory {
            amount: FIBER_STACK_SIZE,
            allocator: "fiber pool",
            object: "fiber",
        })?;
    Ok(inner)
}

/// The perpetual loop every fiber thread runs: wait for a start, invoke
/// the task, run the death sequence, park again. Parking doubles as the
/// dead-list recycle state, so short-lived fibers do not churn threads.
fn fiber_thread_main(inner: Arc<FiberInner>, cord: Arc<CordInner>) {
    CURRENT_CORD.with(|c| *c.borrow_mut() = Some(Arc::clone(&cord)));
    CURRENT_FIBER.with(|f| *f.borrow_mut() = Some(Arc::clone(&inner)));
    loop {
        inner.baton.wait();
        if cord.shutdown.load(Ordering::Acquire) {
            return;
        }
        let Some(task) = inner.task.lock().take() else {
            // A spurious start of a parked fiber: hand control straight
            // back instead of running stale state.
            let target = inner
                .caller
                .lock()
                .take()
                .unwrap_or_else(|| cord.sched_fiber());
            target.baton.signal();
            continue;
        };
        let result = panic::catch_unwind(AssertUnwindSafe(task));
        let result = match result {
            Ok(res) => res,
            Err(payload) => {
                cord.state.lock().panic = Some(payload);
                Err(SpindleError::FiberIsCancelled)
            }
        };
        finish(&inner, &cord, result);
        REGION.with(|r| r.borrow_mut().free_all());
        // Give control back to the caller or the scheduler without
        // expecting it back until the next start.
        let target = inner
            .caller
            .lock()
            .take()
            .unwrap_or_else(|| cord.sched_fiber());
        target.csw.fetch_add(1, Ordering::Relaxed);
        target.baton.signal();
    }
}

fn finish(inner: &Arc<FiberInner>, cord: &Arc<CordInner>, result: Result<()>) {
    let joinable = inner.flags() & FIBER_IS_JOINABLE != 0;
    let cancelled = inner.flags() & FIBER_IS_CANCELLED != 0;
    if let Err(e) = result {
        if joinable {
            // The joiner adopts the diagnostic.
            *inner.diag.lock() = Some(e);
        } else if !cancelled {
            let name = inner.name.lock().clone();
            error!(
                fid = inner.fid.load(Ordering::Acquire),
                name = %name,
                error = %e,
                "fiber terminated with an error"
            );
        }
    }
    inner.set_flag(FIBER_IS_DEAD);
    let waiters: Vec<_> = inner.wake.lock().drain(..).collect();
    for w in waiters {
        wakeup_inner(&w);
    }
    run_triggers(&inner.on_stop);
    if !joinable {
        recycle(inner, cord);
    }
}

/// Reset a dead fiber and return it to the cord's dead list for reuse.
fn recycle(inner: &Arc<FiberInner>, cord: &Arc<CordInner>) {
    let fid = inner.fid.swap(0, Ordering::AcqRel);
    if fid != 0 {
        cord.registry.lock().remove(&fid);
    }
    inner
        .flags
        .store(FIBER_DEFAULT_FLAGS, Ordering::Release);
    inner.name.lock().clear();
    *inner.diag.lock() = None;
    *inner.on_yield.lock() = TriggerList::default();
    *inner.on_stop.lock() = TriggerList::default();
    cord.dead.lock().push(Arc::clone(inner));
}

impl Fiber {
    pub fn fid(&self) -> u64 {
        self.inner.fid.load(Ordering::Acquire)
    }

    pub fn name(&self) -> String {
        self.inner.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.inner.name.lock() = name.to_owned();
    }

    /// Context switches into this fiber so far.
    pub fn csw(&self) -> u64 {
        self.inner.csw.load(Ordering::Relaxed)
    }

    pub fn is_dead(&self) -> bool {
        self.inner.is_dead()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flags() & FIBER_IS_CANCELLED != 0
    }

    pub fn set_joinable(&self, yesno: bool) {
        if yesno {
            self.inner.set_flag(FIBER_IS_JOINABLE);
        } else {
            self.inner.clear_flag(FIBER_IS_JOINABLE);
        }
    }

    /// Start a fiber created with [`new`]: transfer control to it
    /// immediately.
    pub fn start(&self) {
        self.call();
    }

    /// Synchronous transfer: the current fiber becomes the callee's
    /// caller and control moves now.
    pub fn call(&self) {
        let me = current_inner();
        assert!(
            !Arc::ptr_eq(&me, &self.inner),
            "a fiber cannot call itself"
        );
        *self.inner.caller.lock() = Some(Arc::clone(&me));
        switch_to(&self.inner, &me);
    }

    /// Schedule the fiber at the tail of its cord's ready list. Safe to
    /// call from any thread.
    pub fn wakeup(&self) {
        wakeup_inner(&self.inner);
    }

    /// Request cancellation. Asynchronous and cooperative: the target
    /// observes the flag at its next [`testcancel`]. A no-op on dead
    /// fibers and on self.
    pub fn cancel(&self) {
        self.inner.set_flag(FIBER_IS_CANCELLED);
        let is_self = try_current().is_some_and(|me| Arc::ptr_eq(&me.inner, &self.inner));
        if !is_self
            && !self.inner.is_dead()
            && self.inner.flags() & FIBER_IS_CANCELLABLE != 0
        {
            wakeup_inner(&self.inner);
        }
    }

    /// Wait for a joinable fiber to die, adopt its diagnostic, and
    /// recycle it. A cancelled fiber's `FiberIsCancelled` is not
    /// propagated.
    pub fn join(&self) -> Result<()> {
        assert!(
            self.inner.flags() & FIBER_IS_JOINABLE != 0,
            "fiber '{}' is not joinable",
            self.name()
        );
        if !self.inner.is_dead() {
            self.inner.wake.lock().push(current_inner());
            while !self.inner.is_dead() {
                yield_now();
            }
        }
        let was_cancelled = self.is_cancelled();
        let diag = self.inner.diag.lock().take();
        let cord = self
            .inner
            .cord
            .upgrade()
            .expect("joining a fiber of a destroyed cord");
        recycle(&self.inner, &cord);
        match diag {
            Some(e) if !was_cancelled => Err(e),
            _ => Ok(()),
        }
    }

    /// Install an on-yield trigger. By convention the trigger must not
    /// panic.
    pub fn add_on_yield(&self, f: impl FnMut() + Send + 'static) -> TriggerId {
        self.inner.on_yield.lock().add(Box::new(f))
    }

    pub fn remove_on_yield(&self, id: TriggerId) {
        self.inner.on_yield.lock().remove(id);
    }

    /// Install an on-stop trigger, fired when the fiber function
    /// returns.
    pub fn add_on_stop(&self, f: impl FnMut() + Send + 'static) -> TriggerId {
        self.inner.on_stop.lock().add(Box::new(f))
    }

    pub fn remove_on_stop(&self, id: TriggerId) {
        self.inner.on_stop.lock().remove(id);
    }

    /// Store an error in the fiber's diagnostic area.
    pub fn set_diag(&self, err: SpindleError) {
        *self.inner.diag.lock() = Some(err);
    }

    /// Take the error out of the fiber's diagnostic area.
    pub fn take_diag(&self) -> Option<SpindleError> {
        self.inner.diag.lock().take()
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("fid", &self.fid())
            .field("name", &self.name())
            .field("flags", &self.inner.flags())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Cord lifecycle
// ---------------------------------------------------------------------------

/// Handle to a cord started with [`cord_costart`].
pub struct CordHandle {
    cord: Arc<CordInner>,
    thread: Option<std::thread::JoinHandle<Result<()>>>,
}

fn bind_cord(cord: &Arc<CordInner>) {
    CURRENT_CORD.with(|c| *c.borrow_mut() = Some(Arc::clone(cord)));
    let sched = Arc::new(FiberInner {
        cord: Arc::downgrade(cord),
        fid: AtomicU64::new(FIBER_ID_SCHED),
        name: Mutex::new("sched".to_owned()),
        flags: AtomicU8::new(FIBER_DEFAULT_FLAGS),
        csw: AtomicU64::new(0),
        baton: Baton::new(),
        caller: Mutex::new(None),
        wake: Mutex::new(Vec::new()),
        on_yield: Mutex::new(TriggerList::default()),
        on_stop: Mutex::new(TriggerList::default()),
        diag: Mutex::new(None),
        task: Mutex::new(None),
    });
    *cord.sched.lock() = Some(Arc::clone(&sched));
    CURRENT_FIBER.with(|f| *f.borrow_mut() = Some(sched));
}

/// Drive the cord's event loop: expire timers, run posted events, call
/// ready fibers in FIFO order, sleep until the next deadline.
fn run_loop(cord: &Arc<CordInner>) {
    let sched = cord.sched_fiber();
    loop {
        let mut due: Vec<Arc<TimerShared>> = Vec::new();
        let mut events: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
        {
            let mut st = cord.state.lock();
            let now = Instant::now();
            while let Some(top) = st.timers.peek() {
                if top.deadline > now {
                    break;
                }
                let entry = st.timers.pop().expect("peeked timer");
                if !entry.shared.cancelled.load(Ordering::Acquire) {
                    due.push(entry.shared);
                }
            }
            events.append(&mut st.posted);
        }
        for timer in due {
            timer.fired.store(true, Ordering::Release);
            wakeup_inner(&timer.fiber);
        }
        for event in events {
            event();
        }
        loop {
            let next = cord.state.lock().ready.pop_front();
            let Some(fiber) = next else { break };
            *fiber.caller.lock() = Some(Arc::clone(&sched));
            switch_to(&fiber, &sched);
            if let Some(payload) = cord.state.lock().panic.take() {
                panic::resume_unwind(payload);
            }
        }
        {
            let mut st = cord.state.lock();
            if let Some(payload) = st.panic.take() {
                panic::resume_unwind(payload);
            }
            if st.break_loop {
                return;
            }
            if !st.ready.is_empty() || !st.posted.is_empty() {
                continue;
            }
            match st.timers.peek().map(|t| t.deadline) {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    let _ = cord.cond.wait_for(&mut st, timeout);
                }
                None => cord.cond.wait(&mut st),
            }
        }
    }
}

fn shutdown_parked(cord: &Arc<CordInner>) {
    cord.shutdown.store(true, Ordering::Release);
    for inner in cord.dead.lock().drain(..) {
        inner.baton.signal();
    }
}

/// Turn the current thread into a cord, run `main_fn` as its main
/// fiber, and drive the event loop until the main fiber dies. Returns
/// the main fiber's result.
pub fn run_main<F>(name: &str, main_fn: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let cord = CordInner::new(name);
    bind_cord(&cord);
    debug!(cord = %cord.name, "cord started");
    let main = new("main", main_fn)?;
    main.set_joinable(true);
    {
        let cord = Arc::clone(&cord);
        main.add_on_stop(move || {
            let mut st = cord.state.lock();
            st.break_loop = true;
            cord.cond.notify_one();
        });
    }
    main.start();
    if !main.is_dead() {
        run_loop(&cord);
    }
    assert!(main.is_dead(), "event loop exited before the main fiber");
    let result = main.join();
    shutdown_parked(&cord);
    debug!(cord = %cord.name, "cord stopped");
    result
}

/// Start a new cord whose thread runs `main_fn` inside a main fiber
/// with a live event loop.
pub fn cord_costart<F>(name: &str, main_fn: F) -> Result<CordHandle>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let cord = CordInner::new(name);
    let thread_cord = Arc::clone(&cord);
    let name_owned = name.to_owned();
    let thread = std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            bind_cord(&thread_cord);
            debug!(cord = %name_owned, "cord started");
            let result = (|| {
                let main = new("main", main_fn)?;
                main.set_joinable(true);
                {
                    let cord = Arc::clone(&thread_cord);
                    main.add_on_stop(move || {
                        let mut st = cord.state.lock();
                        st.break_loop = true;
                        cord.cond.notify_one();
                    });
                }
                main.start();
                if !main.is_dead() {
                    run_loop(&thread_cord);
                }
                let result = main.join();
                shutdown_parked(&thread_cord);
                result
            })();
            // The on-exit slot is change-once: either a joiner installed
            // a handler before we got here, or we mark it as never going
            // to run so a late joiner does not wait.
            let handler = {
                let mut slot = thread_cord.on_exit.lock();
                match std::mem::replace(&mut *slot, OnExitSlot::WontRun) {
                    OnExitSlot::Handler(h) => Some(h),
                    OnExitSlot::Unset | OnExitSlot::WontRun => None,
                }
            };
            if let Some(h) = handler {
                h();
            }
            debug!(cord = %name_owned, "cord stopped");
            result
        })
        .map_err(SpindleError::System)?;
    Ok(CordHandle {
        cord,
        thread: Some(thread),
    })
}

/// Join a cord's thread, propagating its result.
pub fn cord_join(mut handle: CordHandle) -> Result<()> {
    let thread = handle.thread.take().expect("cord already joined");
    match thread.join() {
        Ok(result) => result,
        Err(payload) => panic::resume_unwind(payload),
    }
}

/// Let the current *fiber* wait for a cord to finish, yielding instead
/// of blocking the whole thread. The joining fiber is made
/// non-cancellable for the duration of the wait.
pub fn cord_cojoin(handle: CordHandle) -> Result<()> {
    let me = current_inner();
    let done = Arc::new(AtomicBool::new(false));
    let installed = {
        let mut slot = handle.cord.on_exit.lock();
        match *slot {
            OnExitSlot::Unset => {
                let me = Arc::clone(&me);
                let done = Arc::clone(&done);
                *slot = OnExitSlot::Handler(Box::new(move || {
                    done.store(true, Ordering::Release);
                    wakeup_inner(&me);
                }));
                true
            }
            // The cord raced ahead and already exited.
            OnExitSlot::WontRun => false,
            OnExitSlot::Handler(_) => panic!("cord is already being joined"),
        }
    };
    if installed {
        let prev = set_cancellable(false);
        yield_now();
        assert!(
            done.load(Ordering::Acquire),
            "wrong fiber woken while waiting for a cord"
        );
        set_cancellable(prev);
    }
    cord_join(handle)
}
