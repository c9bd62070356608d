//! Operator contract.
//!
//! `Observer` is the data path every pipe implements; `Pipe` is the
//! management surface (name, checkpoint/restore, query plan). Two-input
//! operators implement `BinaryObserver` and are fed through
//! [`crate::binary::BinaryInput`] adapters or scheduler handles.
//!
//! Invariants:
//! - A batch passed to `on_next` is owned by the callee from then on.
//! - Punctuations are forwarded, never swallowed.
//! - After `on_error` or `on_completed` the upstream sends nothing more.

use std::io::{Read, Write};

use tempora_core::error::Result;
use tempora_core::types::{Payload, StreamKey};
use tempora_mem::checkpoint::{read_state, write_state};
use tempora_mem::Batch;

use crate::plan::PlanNode;

/// Push-side of a stream.
pub trait Observer<K: StreamKey, P: Payload>: Send {
    fn on_next(&mut self, batch: Batch<K, P>);

    /// Push any partially filled output downstream and propagate the flush.
    fn on_flush(&mut self);

    fn on_completed(&mut self);

    fn on_error(&mut self, error: tempora_core::error::Error);
}

impl<K: StreamKey, P: Payload, O: Observer<K, P> + ?Sized> Observer<K, P> for Box<O> {
    fn on_next(&mut self, batch: Batch<K, P>) {
        (**self).on_next(batch)
    }

    fn on_flush(&mut self) {
        (**self).on_flush()
    }

    fn on_completed(&mut self) {
        (**self).on_completed()
    }

    fn on_error(&mut self, error: tempora_core::error::Error) {
        (**self).on_error(error)
    }
}

/// Push-side of a two-input operator. Both inputs carry the same `(K, P)`.
pub trait BinaryObserver<K: StreamKey, P: Payload>: Send {
    fn on_next_left(&mut self, batch: Batch<K, P>);

    fn on_next_right(&mut self, batch: Batch<K, P>);

    fn on_completed_left(&mut self);

    fn on_completed_right(&mut self);

    fn on_flush(&mut self);

    fn on_error(&mut self, error: tempora_core::error::Error);
}

/// Management surface shared by every operator.
pub trait Pipe: Send {
    /// Human-readable operator name (stable).
    fn name(&self) -> &'static str;

    /// Serialize operator state into `sink`. Stateless operators write an
    /// empty frame so that restore stays symmetric.
    fn checkpoint(&self, sink: &mut dyn Write) -> Result<()> {
        write_state(sink, &())?;
        Ok(())
    }

    /// Replace operator state with what `checkpoint` wrote.
    fn restore(&mut self, source: &mut dyn Read) -> Result<()> {
        read_state::<()>(source)?;
        Ok(())
    }

    /// Describe this operator with `previous` as its inputs.
    fn produce_query_plan(&self, previous: Vec<PlanNode>) -> PlanNode;
}
