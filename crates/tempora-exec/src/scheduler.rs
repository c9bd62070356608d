//! Event-time scheduler.
//!
//! Each registered operator owns a task entry: a queue of pending units keyed
//! by `(event time, arrival seq)` and a status. Entries with pending work sit
//! in the ready set ordered by `(priority, id)`, where the priority is the
//! time of their earliest unit. A worker takes the lowest entry, marks it
//! `Processing` and drains a wave of its units; units enqueued meanwhile wait
//! in the queue, so an operator never runs on two threads at once.
//!
//! The ready set and every entry live behind one mutex; workers sleep on a
//! condition variable until the ready set is non-empty.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, trace, warn};

use tempora_core::config::EngineConfig;
use tempora_core::error::Error;
use tempora_core::id::{IdGen, OperatorId};
use tempora_core::time::{Timestamp, INFINITY};

use crate::error::{ExecError, Result};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};

pub(crate) type Work = Box<dyn FnOnce() + Send>;
pub(crate) type FaultFn = Arc<dyn Fn(Error) + Send + Sync>;
pub(crate) type CompleteFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnitKind {
    Data,
    /// Flush or error; ordered after everything already queued.
    Control,
    /// Completion of one input; runs after all data.
    Completed,
    /// Completion forced by `dispose`; the entry retires once it has run.
    Disposed,
}

pub(crate) struct Unit {
    time: Timestamp,
    kind: UnitKind,
    work: Work,
}

impl Unit {
    pub(crate) fn data(time: Timestamp, work: Work) -> Self {
        Self {
            time,
            kind: UnitKind::Data,
            work,
        }
    }

    pub(crate) fn control(work: Work) -> Self {
        Self {
            time: Timestamp::MIN,
            kind: UnitKind::Control,
            work,
        }
    }

    pub(crate) fn completed(work: Work) -> Self {
        Self {
            time: INFINITY,
            kind: UnitKind::Completed,
            work,
        }
    }

    fn disposal(work: Work) -> Self {
        Self {
            time: INFINITY,
            kind: UnitKind::Disposed,
            work,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Inactive,
    Ready(Timestamp),
    Processing,
}

struct Entry {
    name: String,
    queue: BTreeMap<(Timestamp, u64), Unit>,
    status: Status,
    /// Completed units still expected before the entry retires.
    open_inputs: usize,
    /// Latest time queued so far; control units are placed here.
    horizon: Timestamp,
    disposed: bool,
    fault: FaultFn,
    complete: CompleteFn,
}

#[derive(Default)]
struct State {
    entries: HashMap<OperatorId, Entry>,
    ready: BTreeSet<(Timestamp, OperatorId)>,
    seq: u64,
    /// Entries currently being drained by a worker.
    busy: usize,
    stopping: bool,
}

impl State {
    /// Queue `unit` on `id`; returns true when a worker should be woken.
    fn push(&mut self, id: OperatorId, unit: Unit) -> bool {
        self.seq += 1;
        let seq = self.seq;
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        let time = match unit.kind {
            UnitKind::Data => unit.time,
            UnitKind::Control => entry.horizon,
            UnitKind::Completed | UnitKind::Disposed => INFINITY,
        };
        entry.horizon = entry.horizon.max(time);
        entry.queue.insert((time, seq), unit);
        match entry.status {
            Status::Inactive => {
                entry.status = Status::Ready(time);
                self.ready.insert((time, id));
                true
            }
            Status::Ready(p) if time < p => {
                self.ready.remove(&(p, id));
                self.ready.insert((time, id));
                entry.status = Status::Ready(time);
                false
            }
            _ => false,
        }
    }

    fn retire(&mut self, id: OperatorId, metrics: &SchedulerMetrics) {
        if self.entries.remove(&id).is_some() {
            metrics.retire();
            debug!(operator = %id, "task entry retired");
        }
    }
}

struct Shared {
    state: Mutex<State>,
    work_ready: Condvar,
    idle: Condvar,
    metrics: SchedulerMetrics,
    ids: IdGen,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    /// Callbacks run synchronously on the thread that enqueues them.
    Inline,
    /// A fixed pool of owned worker threads.
    Threaded { workers: usize },
}

/// Handle to a scheduler. Clones share the same entries and workers.
#[derive(Clone)]
pub struct Scheduler {
    kind: SchedulerKind,
    shared: Arc<Shared>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn inline() -> Self {
        Self::with_kind(SchedulerKind::Inline)
    }

    pub fn threaded(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(ExecError::Config(
                "a threaded scheduler needs at least one worker".into(),
            ));
        }
        let scheduler = Self::with_kind(SchedulerKind::Threaded { workers });
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let shared = Arc::clone(&scheduler.shared);
            let spawned = thread::Builder::new()
                .name(format!("tempora-worker-{index}"))
                .spawn(move || worker_loop(&shared, index));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    *scheduler.workers.lock().unwrap_or_else(PoisonError::into_inner) = handles;
                    scheduler.stop();
                    return Err(ExecError::Spawn(e.to_string()));
                }
            }
        }
        *scheduler.workers.lock().unwrap_or_else(PoisonError::into_inner) = handles;
        Ok(scheduler)
    }

    /// `worker_threads == 0` selects the inline scheduler.
    pub fn from_config(cfg: &EngineConfig) -> Result<Self> {
        match cfg.worker_threads {
            0 => Ok(Self::inline()),
            n => Self::threaded(n),
        }
    }

    fn with_kind(kind: SchedulerKind) -> Self {
        Self {
            kind,
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                work_ready: Condvar::new(),
                idle: Condvar::new(),
                metrics: SchedulerMetrics::default(),
                ids: IdGen::new(),
            }),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn kind(&self) -> SchedulerKind {
        self.kind
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Registered entries not yet retired.
    pub fn live_entries(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_retired(&self, id: OperatorId) -> bool {
        self.shared
            .lock()
            .entries
            .get(&id)
            .map_or(true, |e| e.disposed)
    }

    pub(crate) fn add_entry(
        &self,
        name: &str,
        inputs: usize,
        fault: FaultFn,
        complete: CompleteFn,
    ) -> OperatorId {
        let id = self.shared.ids.next();
        self.shared.lock().entries.insert(
            id,
            Entry {
                name: name.to_string(),
                queue: BTreeMap::new(),
                status: Status::Inactive,
                open_inputs: inputs,
                horizon: Timestamp::MIN,
                disposed: false,
                fault,
                complete,
            },
        );
        debug!(operator = %id, name, inputs, "registered task entry");
        id
    }

    /// Hand a unit to operator `id`.
    pub(crate) fn submit(&self, id: OperatorId, unit: Unit) -> Result<()> {
        let mut guard = self.shared.lock();
        if guard.stopping {
            return Err(ExecError::ShutDown);
        }
        match guard.entries.get(&id) {
            Some(e) if !e.disposed => {}
            _ => {
                warn!(operator = %id, "unit enqueued on a retired entry");
                return Err(ExecError::Retired(id));
            }
        }
        self.shared.metrics.enqueued();
        match self.kind {
            SchedulerKind::Inline => {
                drop(guard);
                let kind = unit.kind;
                (unit.work)();
                self.shared.metrics.ran(1);
                if kind == UnitKind::Completed {
                    self.note_completion(id);
                }
            }
            SchedulerKind::Threaded { .. } => {
                if guard.push(id, unit) {
                    self.shared.work_ready.notify_one();
                }
            }
        }
        Ok(())
    }

    fn note_completion(&self, id: OperatorId) {
        let mut st = self.shared.lock();
        let retire = match st.entries.get_mut(&id) {
            // a disposed entry retires when its disposal has run
            Some(entry) if !entry.disposed => {
                entry.open_inputs = entry.open_inputs.saturating_sub(1);
                entry.open_inputs == 0
            }
            _ => false,
        };
        if retire {
            st.retire(id, &self.shared.metrics);
        }
    }

    /// Cancel operator `id`: queued data is freed unprocessed and every
    /// input not yet completed is completed exactly once. A completion
    /// already running on a worker does not retire the entry early.
    pub fn dispose(&self, id: OperatorId) {
        let mut guard = self.shared.lock();
        let st = &mut *guard;
        let Some(entry) = st.entries.get_mut(&id) else {
            return;
        };
        if entry.disposed {
            return;
        }
        entry.disposed = true;
        let dropped = entry
            .queue
            .values()
            .filter(|u| u.kind == UnitKind::Data)
            .count() as u64;
        entry.queue.retain(|_, u| u.kind == UnitKind::Control);
        self.shared.metrics.dropped(dropped);
        let complete = Arc::clone(&entry.complete);
        debug!(operator = %id, dropped, "disposing task entry");

        match self.kind {
            SchedulerKind::Inline => {
                drop(guard);
                complete();
                self.shared.metrics.ran(1);
                self.shared.lock().retire(id, &self.shared.metrics);
            }
            SchedulerKind::Threaded { .. } => {
                let unit = Unit::disposal(Box::new(move || complete()));
                if st.push(id, unit) {
                    self.shared.work_ready.notify_one();
                }
            }
        }
    }

    /// Block until no entry is ready or being processed.
    pub fn wait_idle(&self) {
        if self.kind == SchedulerKind::Inline {
            return;
        }
        let mut st = self.shared.lock();
        while !(st.ready.is_empty() && st.busy == 0) && !st.stopping {
            st = self
                .shared
                .idle
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Signal the workers and join them. Queued units are dropped.
    ///
    /// Also joins the workers after a fatal callback error has already put
    /// the scheduler into the stopping state.
    pub fn stop(&self) {
        let already = std::mem::replace(&mut self.shared.lock().stopping, true);
        self.shared.work_ready.notify_all();
        self.shared.idle.notify_all();
        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if handle.join().is_err() {
                error!("scheduler worker exited by panic");
            }
        }
        if !already {
            debug!("scheduler stopped");
        }
    }

    /// Whether `stop` was called or a worker hit a fatal error.
    pub fn is_stopped(&self) -> bool {
        self.shared.lock().stopping
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("kind", &self.kind)
            .field("metrics", &self.metrics())
            .finish()
    }
}

struct Wave {
    id: OperatorId,
    name: String,
    units: Vec<Unit>,
    fault: FaultFn,
}

/// Take the lowest ready entry and the units it runs now.
fn next_wave(shared: &Shared) -> Option<Wave> {
    let mut guard = shared.lock();
    loop {
        if guard.stopping {
            return None;
        }
        let Some((_, id)) = guard.ready.pop_first() else {
            guard = shared
                .work_ready
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
            continue;
        };
        let st = &mut *guard;
        let Some(entry) = st.entries.get_mut(&id) else {
            continue;
        };
        entry.status = Status::Processing;
        st.busy += 1;

        let mut units = Vec::new();
        let mut first_time = None;
        while let Some(next) = entry.queue.first_entry() {
            let (time, _) = *next.key();
            let wave_time = *first_time.get_or_insert(time);
            // a later unit waits if some other operator is ready
            if time > wave_time && !st.ready.is_empty() {
                break;
            }
            units.push(next.remove());
        }
        trace!(operator = %id, units = units.len(), "draining wave");
        return Some(Wave {
            id,
            name: entry.name.clone(),
            units,
            fault: Arc::clone(&entry.fault),
        });
    }
}

fn finish_wave(shared: &Shared, id: OperatorId, completions: usize, disposal_ran: bool) {
    let mut guard = shared.lock();
    let st = &mut *guard;
    st.busy -= 1;
    shared.metrics.wave();
    let mut retired = false;
    if let Some(entry) = st.entries.get_mut(&id) {
        entry.open_inputs = entry.open_inputs.saturating_sub(completions);
        retired = if entry.disposed {
            disposal_ran
        } else {
            completions > 0 && entry.open_inputs == 0
        };
        if !retired {
            if let Some((&(time, _), _)) = entry.queue.first_key_value() {
                entry.status = Status::Ready(time);
                st.ready.insert((time, id));
                shared.work_ready.notify_one();
            } else {
                entry.status = Status::Inactive;
            }
        }
    }
    if retired {
        st.retire(id, &shared.metrics);
    }
    if st.ready.is_empty() && st.busy == 0 {
        shared.idle.notify_all();
    }
}

fn worker_loop(shared: &Shared, index: usize) {
    debug!(worker = index, "scheduler worker started");
    while let Some(wave) = next_wave(shared) {
        let mut completions = 0;
        let mut disposal_ran = false;
        let ran = wave.units.len() as u64;
        for unit in wave.units {
            let kind = unit.kind;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(unit.work)) {
                let message = panic_message(payload.as_ref());
                if message.starts_with("capacity violation") {
                    error!(operator = %wave.id, %message, "fatal error in operator callback");
                    abandon(shared);
                    panic::resume_unwind(payload);
                }
                shared.metrics.fault();
                error!(operator = %wave.id, name = %wave.name, %message, "operator callback panicked");
                let fault = Arc::clone(&wave.fault);
                let err = Error::SchedulerFault {
                    operator: wave.name.clone(),
                    message,
                };
                if panic::catch_unwind(AssertUnwindSafe(move || fault(err))).is_err() {
                    error!(operator = %wave.id, "on_error panicked while handling a fault");
                }
            }
            match kind {
                UnitKind::Completed => completions += 1,
                UnitKind::Disposed => disposal_ran = true,
                UnitKind::Data | UnitKind::Control => {}
            }
        }
        shared.metrics.ran(ran);
        finish_wave(shared, wave.id, completions, disposal_ran);
    }
    debug!(worker = index, "scheduler worker stopped");
}

/// A worker is about to die mid-wave: stop the scheduler so that
/// `wait_idle` callers and the other workers are released.
fn abandon(shared: &Shared) {
    {
        let mut st = shared.lock();
        st.busy = st.busy.saturating_sub(1);
        st.stopping = true;
    }
    shared.work_ready.notify_all();
    shared.idle.notify_all();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;

    use tempora_mem::{Batch, MemoryPool};
    use tempora_operators::{BinaryObserver, Observer, Pipe, PlanNode};

    #[derive(Default, Clone)]
    struct Seen {
        times: Arc<Mutex<Vec<i64>>>,
        errors: Arc<Mutex<Vec<Error>>>,
        completions: Arc<AtomicUsize>,
    }

    struct Recorder {
        seen: Seen,
        gate: Option<mpsc::Receiver<()>>,
    }

    impl Recorder {
        fn new(seen: &Seen) -> Self {
            Self {
                seen: seen.clone(),
                gate: None,
            }
        }
    }

    impl Observer<u32, i64> for Recorder {
        fn on_next(&mut self, batch: Batch<u32, i64>) {
            if let Some(gate) = self.gate.take() {
                gate.recv().unwrap();
            }
            if batch.payloads().contains(&13) {
                panic!("boom at {:?}", batch.min_sync());
            }
            self.seen.times.lock().unwrap().push(batch.min_sync().unwrap());
        }

        fn on_flush(&mut self) {}

        fn on_completed(&mut self) {
            self.seen.completions.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&mut self, error: Error) {
            self.seen.errors.lock().unwrap().push(error);
        }
    }

    impl Pipe for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn produce_query_plan(&self, previous: Vec<PlanNode>) -> PlanNode {
            PlanNode::new(self.name()).with_inputs(previous)
        }
    }

    fn at(pool: &MemoryPool<u32, i64>, t: i64, payload: i64) -> Batch<u32, i64> {
        let mut b = pool.get();
        b.add(t, INFINITY, 0, payload);
        b
    }

    #[test]
    fn earlier_unit_runs_first_when_enqueued_late() {
        let sched = Scheduler::threaded(2).unwrap();
        let pool = MemoryPool::standalone(4);
        let seen = Seen::default();
        let (open, gate) = mpsc::channel();
        let handle = sched.register(Recorder {
            gate: Some(gate),
            ..Recorder::new(&seen)
        });
        let mut obs = handle.observer();
        obs.on_next(at(&pool, 0, 0));

        let producers: Vec<_> = [20, 10]
            .into_iter()
            .map(|t| {
                let mut o = obs.clone();
                let b = at(&pool, t, t);
                thread::spawn(move || o.on_next(b))
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        open.send(()).unwrap();
        sched.wait_idle();

        assert_eq!(*seen.times.lock().unwrap(), vec![0, 10, 20]);
        sched.stop();
    }

    #[test]
    fn operator_never_runs_on_two_threads_at_once() {
        struct Exclusive {
            inside: Arc<AtomicBool>,
            overlaps: Arc<AtomicUsize>,
            runs: Arc<AtomicUsize>,
        }
        impl Observer<u32, i64> for Exclusive {
            fn on_next(&mut self, _batch: Batch<u32, i64>) {
                if self.inside.swap(true, Ordering::SeqCst) {
                    self.overlaps.fetch_add(1, Ordering::SeqCst);
                }
                for _ in 0..100 {
                    std::hint::spin_loop();
                }
                self.runs.fetch_add(1, Ordering::SeqCst);
                self.inside.store(false, Ordering::SeqCst);
            }
            fn on_flush(&mut self) {}
            fn on_completed(&mut self) {}
            fn on_error(&mut self, _: Error) {}
        }
        impl Pipe for Exclusive {
            fn name(&self) -> &'static str {
                "exclusive"
            }
            fn produce_query_plan(&self, previous: Vec<PlanNode>) -> PlanNode {
                PlanNode::new(self.name()).with_inputs(previous)
            }
        }

        let sched = Scheduler::threaded(4).unwrap();
        let pool = MemoryPool::standalone(2);
        let overlaps = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let handle = sched.register(Exclusive {
            inside: Arc::new(AtomicBool::new(false)),
            overlaps: Arc::clone(&overlaps),
            runs: Arc::clone(&runs),
        });

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let mut o = handle.observer();
                let pool = pool.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        o.on_next(at(&pool, i * 4 + p, 1));
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        sched.wait_idle();

        assert_eq!(runs.load(Ordering::SeqCst), 200);
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(pool.batches_outstanding(), 0);
        sched.stop();
    }

    #[test]
    fn panic_becomes_scheduler_fault_for_that_operator_only() {
        let sched = Scheduler::threaded(2).unwrap();
        let pool = MemoryPool::standalone(4);
        let (faulty, healthy) = (Seen::default(), Seen::default());
        let mut a = sched.register(Recorder::new(&faulty)).observer();
        let mut b = sched.register(Recorder::new(&healthy)).observer();

        a.on_next(at(&pool, 1, 13));
        a.on_next(at(&pool, 2, 2));
        b.on_next(at(&pool, 1, 1));
        sched.wait_idle();

        let errors = faulty.errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            Error::SchedulerFault { operator, message }
                if operator == "recorder" && message.contains("boom")
        ));
        assert_eq!(*faulty.times.lock().unwrap(), vec![2], "operator keeps running");
        assert_eq!(*healthy.times.lock().unwrap(), vec![1]);
        assert!(healthy.errors.lock().unwrap().is_empty());
        assert_eq!(sched.metrics().faults, 1);
        sched.stop();
    }

    #[test]
    fn dispose_frees_queued_data_and_completes_once() {
        let sched = Scheduler::threaded(1).unwrap();
        let pool = MemoryPool::standalone(4);
        let seen = Seen::default();
        let (open, gate) = mpsc::channel();
        let handle = sched.register(Recorder {
            gate: Some(gate),
            ..Recorder::new(&seen)
        });
        let mut obs = handle.observer();
        obs.on_next(at(&pool, 0, 0));
        // wait for the worker to pick up the gated unit
        while !is_processing(&sched) {
            thread::yield_now();
        }
        obs.on_next(at(&pool, 1, 1));
        obs.on_next(at(&pool, 2, 2));
        handle.dispose();
        handle.dispose();
        assert!(handle.is_retired());
        assert_eq!(obs.try_next(at(&pool, 3, 3)), Err(ExecError::Retired(handle.id())));

        open.send(()).unwrap();
        sched.wait_idle();

        assert_eq!(*seen.times.lock().unwrap(), vec![0]);
        assert_eq!(seen.completions.load(Ordering::SeqCst), 1);
        assert_eq!(pool.batches_outstanding(), 0);
        let m = sched.metrics();
        assert_eq!(m.units_dropped, 2);
        assert_eq!(m.retired, 1);
        assert_eq!(sched.live_entries(), 0);
        sched.stop();
    }

    #[test]
    fn dispose_while_one_input_completes_still_completes_the_other() {
        struct Sides {
            left: Arc<AtomicUsize>,
            right: Arc<AtomicUsize>,
            gate: Option<mpsc::Receiver<()>>,
        }
        impl BinaryObserver<u32, i64> for Sides {
            fn on_next_left(&mut self, _: Batch<u32, i64>) {}
            fn on_next_right(&mut self, _: Batch<u32, i64>) {}
            fn on_completed_left(&mut self) {
                if let Some(gate) = self.gate.take() {
                    gate.recv().unwrap();
                }
                self.left.fetch_add(1, Ordering::SeqCst);
            }
            fn on_completed_right(&mut self) {
                self.right.fetch_add(1, Ordering::SeqCst);
            }
            fn on_flush(&mut self) {}
            fn on_error(&mut self, _: Error) {}
        }
        impl Pipe for Sides {
            fn name(&self) -> &'static str {
                "sides"
            }
            fn produce_query_plan(&self, previous: Vec<PlanNode>) -> PlanNode {
                PlanNode::new(self.name()).with_inputs(previous)
            }
        }

        let sched = Scheduler::threaded(1).unwrap();
        let (left, right) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let (open, gate) = mpsc::channel();
        let handle = sched.register_binary::<u32, i64, _>(Sides {
            left: Arc::clone(&left),
            right: Arc::clone(&right),
            gate: Some(gate),
        });
        handle.left::<u32, i64>().on_completed();
        while !is_processing(&sched) {
            thread::yield_now();
        }
        handle.dispose();
        handle.right::<u32, i64>().on_completed();
        assert!(handle.is_retired());

        open.send(()).unwrap();
        sched.wait_idle();

        assert_eq!(left.load(Ordering::SeqCst), 1);
        assert_eq!(right.load(Ordering::SeqCst), 1);
        assert_eq!(sched.live_entries(), 0);
        assert_eq!(sched.metrics().retired, 1);
        sched.stop();
    }

    #[test]
    fn inline_dispose_after_one_input_completed_finishes_the_other() {
        struct Count(Arc<AtomicUsize>, Arc<AtomicUsize>);
        impl BinaryObserver<u32, i64> for Count {
            fn on_next_left(&mut self, _: Batch<u32, i64>) {}
            fn on_next_right(&mut self, _: Batch<u32, i64>) {}
            fn on_completed_left(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            fn on_completed_right(&mut self) {
                self.1.fetch_add(1, Ordering::SeqCst);
            }
            fn on_flush(&mut self) {}
            fn on_error(&mut self, _: Error) {}
        }
        impl Pipe for Count {
            fn name(&self) -> &'static str {
                "count"
            }
            fn produce_query_plan(&self, previous: Vec<PlanNode>) -> PlanNode {
                PlanNode::new(self.name()).with_inputs(previous)
            }
        }

        let sched = Scheduler::inline();
        let (left, right) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let handle =
            sched.register_binary::<u32, i64, _>(Count(Arc::clone(&left), Arc::clone(&right)));
        handle.left::<u32, i64>().on_completed();
        assert!(!handle.is_retired());
        handle.dispose();

        assert!(handle.is_retired());
        assert_eq!(left.load(Ordering::SeqCst), 1);
        assert_eq!(right.load(Ordering::SeqCst), 1);
        assert_eq!(sched.metrics().retired, 1);
    }

    #[test]
    fn fatal_callback_error_stops_the_scheduler_and_releases_waiters() {
        struct Overfill(MemoryPool<u32, i64>);
        impl Observer<u32, i64> for Overfill {
            fn on_next(&mut self, _: Batch<u32, i64>) {
                let mut b = self.0.get();
                b.add(1, 2, 0, 0);
                b.add(2, 3, 0, 0);
            }
            fn on_flush(&mut self) {}
            fn on_completed(&mut self) {}
            fn on_error(&mut self, _: Error) {}
        }
        impl Pipe for Overfill {
            fn name(&self) -> &'static str {
                "overfill"
            }
            fn produce_query_plan(&self, previous: Vec<PlanNode>) -> PlanNode {
                PlanNode::new(self.name()).with_inputs(previous)
            }
        }

        let sched = Scheduler::threaded(2).unwrap();
        let pool = MemoryPool::standalone(1);
        let obs = sched.register(Overfill(pool.clone())).observer();
        obs.try_next(at(&pool, 1, 1)).unwrap();
        sched.wait_idle();

        assert!(sched.is_stopped());
        assert_eq!(obs.try_next(at(&pool, 2, 2)), Err(ExecError::ShutDown));
        sched.stop();
        assert_eq!(sched.metrics().faults, 0);
        assert_eq!(pool.batches_outstanding(), 0);
    }

    fn is_processing(sched: &Scheduler) -> bool {
        sched.shared.lock().busy > 0
    }

    #[test]
    fn completion_retires_the_entry() {
        let sched = Scheduler::inline();
        let pool = MemoryPool::standalone(4);
        let seen = Seen::default();
        let handle = sched.register(Recorder::new(&seen));
        let mut obs = handle.observer();
        obs.on_next(at(&pool, 5, 5));
        obs.on_completed();

        assert!(handle.is_retired());
        assert_eq!(*seen.times.lock().unwrap(), vec![5]);
        assert_eq!(obs.try_next(at(&pool, 6, 6)), Err(ExecError::Retired(handle.id())));
        assert_eq!(sched.metrics().retired, 1);
    }

    #[test]
    fn inline_runs_on_the_calling_thread() {
        struct ThreadProbe(Arc<Mutex<Option<thread::ThreadId>>>);
        impl Observer<u32, i64> for ThreadProbe {
            fn on_next(&mut self, _: Batch<u32, i64>) {
                *self.0.lock().unwrap() = Some(thread::current().id());
            }
            fn on_flush(&mut self) {}
            fn on_completed(&mut self) {}
            fn on_error(&mut self, _: Error) {}
        }
        impl Pipe for ThreadProbe {
            fn name(&self) -> &'static str {
                "probe"
            }
            fn produce_query_plan(&self, previous: Vec<PlanNode>) -> PlanNode {
                PlanNode::new(self.name()).with_inputs(previous)
            }
        }

        let sched = Scheduler::inline();
        let ran_on = Arc::new(Mutex::new(None));
        let mut obs = sched.register(ThreadProbe(Arc::clone(&ran_on))).observer();
        obs.on_next(MemoryPool::standalone(1).get());
        assert_eq!(*ran_on.lock().unwrap(), Some(thread::current().id()));
    }

    #[test]
    fn stopped_scheduler_rejects_work() {
        let sched = Scheduler::threaded(2).unwrap();
        let seen = Seen::default();
        let obs = sched.register(Recorder::new(&seen)).observer();
        sched.stop();
        sched.stop();
        let pool = MemoryPool::standalone(1);
        assert_eq!(obs.try_next(at(&pool, 1, 1)), Err(ExecError::ShutDown));
        assert_eq!(pool.batches_outstanding(), 0);
    }
}
