//! Task handles and the observer adapters that feed scheduled operators.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use tempora_core::error::Error;
use tempora_core::id::OperatorId;
use tempora_core::time::MIN_SYNC_TIME;
use tempora_core::types::{Payload, StreamKey};
use tempora_mem::Batch;
use tempora_operators::{BinaryObserver, Observer, Pipe, Side};

use crate::error::Result;
use crate::scheduler::{Scheduler, Unit};

/// A panicking callback poisons the operator's mutex; the operator still
/// receives the fault and any later units.
fn lock<O>(op: &Mutex<O>) -> MutexGuard<'_, O> {
    op.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Inputs whose completion has reached the operator. Shared by the
/// adapters and the disposal callback.
#[derive(Debug, Default)]
struct InputsDone([AtomicBool; 2]);

impl InputsDone {
    /// True only the first time `input` finishes.
    fn finish(&self, input: usize) -> bool {
        !self.0[input].swap(true, Ordering::AcqRel)
    }
}

fn input_index(side: Side) -> usize {
    match side {
        Side::Left => 0,
        Side::Right => 1,
    }
}

/// Registration of one operator with a scheduler.
pub struct TaskHandle<O> {
    id: OperatorId,
    operator: Arc<Mutex<O>>,
    done: Arc<InputsDone>,
    scheduler: Scheduler,
}

impl<O> Clone for TaskHandle<O> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            operator: Arc::clone(&self.operator),
            done: Arc::clone(&self.done),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<O: Send + 'static> TaskHandle<O> {
    pub fn id(&self) -> OperatorId {
        self.id
    }

    /// The operator itself, e.g. to checkpoint it or read its counters.
    pub fn operator(&self) -> &Arc<Mutex<O>> {
        &self.operator
    }

    pub fn is_retired(&self) -> bool {
        self.scheduler.is_retired(self.id)
    }

    /// Cancel the registration. Queued batches are freed without reaching
    /// the operator; each input still open is completed exactly once.
    pub fn dispose(&self) {
        self.scheduler.dispose(self.id);
    }

    /// Input adapter for a single-input operator.
    pub fn observer<K, P>(&self) -> ScheduledObserver<K, P, O>
    where
        K: StreamKey,
        P: Payload,
        O: Observer<K, P>,
    {
        ScheduledObserver {
            id: self.id,
            operator: Arc::clone(&self.operator),
            done: Arc::clone(&self.done),
            scheduler: self.scheduler.clone(),
            _marker: PhantomData,
        }
    }

    pub fn left<K, P>(&self) -> ScheduledInput<K, P, O>
    where
        K: StreamKey,
        P: Payload,
        O: BinaryObserver<K, P>,
    {
        self.input(Side::Left)
    }

    pub fn right<K, P>(&self) -> ScheduledInput<K, P, O>
    where
        K: StreamKey,
        P: Payload,
        O: BinaryObserver<K, P>,
    {
        self.input(Side::Right)
    }

    fn input<K, P>(&self, side: Side) -> ScheduledInput<K, P, O>
    where
        K: StreamKey,
        P: Payload,
        O: BinaryObserver<K, P>,
    {
        ScheduledInput {
            side,
            id: self.id,
            operator: Arc::clone(&self.operator),
            done: Arc::clone(&self.done),
            scheduler: self.scheduler.clone(),
            _marker: PhantomData,
        }
    }
}

impl Scheduler {
    /// Register a single-input operator.
    pub fn register<K, P, O>(&self, op: O) -> TaskHandle<O>
    where
        K: StreamKey,
        P: Payload,
        O: Observer<K, P> + Pipe + 'static,
    {
        let name = op.name();
        let operator = Arc::new(Mutex::new(op));
        let target = Arc::clone(&operator);
        let fault = Arc::new(move |e: Error| Observer::<K, P>::on_error(&mut *lock(&target), e));
        let done = Arc::new(InputsDone::default());
        let target = Arc::clone(&operator);
        let flags = Arc::clone(&done);
        let complete = Arc::new(move || {
            if flags.finish(0) {
                Observer::<K, P>::on_completed(&mut *lock(&target));
            }
        });
        let id = self.add_entry(name, 1, fault, complete);
        TaskHandle {
            id,
            operator,
            done,
            scheduler: self.clone(),
        }
    }

    /// Register a two-input operator; it retires once both inputs complete.
    pub fn register_binary<K, P, O>(&self, op: O) -> TaskHandle<O>
    where
        K: StreamKey,
        P: Payload,
        O: BinaryObserver<K, P> + Pipe + 'static,
    {
        let name = op.name();
        let operator = Arc::new(Mutex::new(op));
        let target = Arc::clone(&operator);
        let fault =
            Arc::new(move |e: Error| BinaryObserver::<K, P>::on_error(&mut *lock(&target), e));
        let done = Arc::new(InputsDone::default());
        let target = Arc::clone(&operator);
        let flags = Arc::clone(&done);
        let complete = Arc::new(move || {
            let mut op = lock(&target);
            if flags.finish(input_index(Side::Left)) {
                BinaryObserver::<K, P>::on_completed_left(&mut *op);
            }
            if flags.finish(input_index(Side::Right)) {
                BinaryObserver::<K, P>::on_completed_right(&mut *op);
            }
        });
        let id = self.add_entry(name, 2, fault, complete);
        TaskHandle {
            id,
            operator,
            done,
            scheduler: self.clone(),
        }
    }
}

fn submit_or_log(scheduler: &Scheduler, id: OperatorId, unit: Unit) {
    if let Err(e) = scheduler.submit(id, unit) {
        debug!(operator = %id, error = %e, "unit discarded");
    }
}

/// Event time a batch is scheduled at.
fn batch_time<K: StreamKey, P: Payload>(batch: &Batch<K, P>) -> i64 {
    batch.min_sync().unwrap_or(MIN_SYNC_TIME)
}

/// Feeds a scheduled single-input operator.
pub struct ScheduledObserver<K, P, O> {
    id: OperatorId,
    operator: Arc<Mutex<O>>,
    done: Arc<InputsDone>,
    scheduler: Scheduler,
    _marker: PhantomData<fn(K, P)>,
}

impl<K, P, O> Clone for ScheduledObserver<K, P, O> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            operator: Arc::clone(&self.operator),
            done: Arc::clone(&self.done),
            scheduler: self.scheduler.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K, P, O> ScheduledObserver<K, P, O>
where
    K: StreamKey,
    P: Payload,
    O: Observer<K, P> + 'static,
{
    /// Like `on_next`, but reports a retired or stopped target.
    pub fn try_next(&self, batch: Batch<K, P>) -> Result<()> {
        let op = Arc::clone(&self.operator);
        let time = batch_time(&batch);
        self.scheduler
            .submit(self.id, Unit::data(time, Box::new(move || lock(&op).on_next(batch))))
    }
}

impl<K, P, O> Observer<K, P> for ScheduledObserver<K, P, O>
where
    K: StreamKey,
    P: Payload,
    O: Observer<K, P> + 'static,
{
    fn on_next(&mut self, batch: Batch<K, P>) {
        if let Err(e) = self.try_next(batch) {
            debug!(operator = %self.id, error = %e, "batch discarded");
        }
    }

    fn on_flush(&mut self) {
        let op = Arc::clone(&self.operator);
        submit_or_log(&self.scheduler, self.id, Unit::control(Box::new(move || lock(&op).on_flush())));
    }

    fn on_completed(&mut self) {
        let op = Arc::clone(&self.operator);
        let done = Arc::clone(&self.done);
        let work = move || {
            if done.finish(0) {
                lock(&op).on_completed();
            }
        };
        submit_or_log(&self.scheduler, self.id, Unit::completed(Box::new(work)));
    }

    fn on_error(&mut self, error: Error) {
        let op = Arc::clone(&self.operator);
        submit_or_log(
            &self.scheduler,
            self.id,
            Unit::control(Box::new(move || lock(&op).on_error(error))),
        );
    }
}

/// Feeds one side of a scheduled two-input operator.
pub struct ScheduledInput<K, P, O> {
    side: Side,
    id: OperatorId,
    operator: Arc<Mutex<O>>,
    done: Arc<InputsDone>,
    scheduler: Scheduler,
    _marker: PhantomData<fn(K, P)>,
}

impl<K, P, O> ScheduledInput<K, P, O> {
    pub fn side(&self) -> Side {
        self.side
    }
}

impl<K, P, O> Observer<K, P> for ScheduledInput<K, P, O>
where
    K: StreamKey,
    P: Payload,
    O: BinaryObserver<K, P> + 'static,
{
    fn on_next(&mut self, batch: Batch<K, P>) {
        let op = Arc::clone(&self.operator);
        let time = batch_time(&batch);
        let work: Box<dyn FnOnce() + Send> = match self.side {
            Side::Left => Box::new(move || lock(&op).on_next_left(batch)),
            Side::Right => Box::new(move || lock(&op).on_next_right(batch)),
        };
        submit_or_log(&self.scheduler, self.id, Unit::data(time, work));
    }

    fn on_flush(&mut self) {
        let op = Arc::clone(&self.operator);
        submit_or_log(&self.scheduler, self.id, Unit::control(Box::new(move || lock(&op).on_flush())));
    }

    fn on_completed(&mut self) {
        let op = Arc::clone(&self.operator);
        let done = Arc::clone(&self.done);
        let side = self.side;
        let work = move || {
            if !done.finish(input_index(side)) {
                return;
            }
            match side {
                Side::Left => lock(&op).on_completed_left(),
                Side::Right => lock(&op).on_completed_right(),
            }
        };
        submit_or_log(&self.scheduler, self.id, Unit::completed(Box::new(work)));
    }

    fn on_error(&mut self, error: Error) {
        let op = Arc::clone(&self.operator);
        submit_or_log(
            &self.scheduler,
            self.id,
            Unit::control(Box::new(move || lock(&op).on_error(error))),
        );
    }
}
