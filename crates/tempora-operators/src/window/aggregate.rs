//! Incremental aggregates for the window operator.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use tempora_core::types::Payload;

/// An aggregate that can both add and remove items from its running state.
///
/// `deaccumulate` must exactly undo an earlier `accumulate` of the same item.
pub trait Aggregate<P>: Send + 'static {
    type State: Clone + Default + Send + Serialize + DeserializeOwned;
    type Output: Payload;

    fn name(&self) -> &'static str;
    fn accumulate(&self, state: &mut Self::State, item: &P);
    fn deaccumulate(&self, state: &mut Self::State, item: &P);
    fn compute(&self, state: &Self::State) -> Self::Output;
}

/// Number of items in the window.
#[derive(Debug, Clone, Copy, Default)]
pub struct Count;

impl<P> Aggregate<P> for Count {
    type State = u64;
    type Output = u64;

    fn name(&self) -> &'static str {
        "count"
    }

    fn accumulate(&self, state: &mut u64, _: &P) {
        *state += 1;
    }

    fn deaccumulate(&self, state: &mut u64, _: &P) {
        *state -= 1;
    }

    fn compute(&self, state: &u64) -> u64 {
        *state
    }
}

/// Sum of integer payloads.
#[derive(Debug, Clone, Copy)]
pub struct Sum<P>(PhantomData<fn(P)>);

impl<P> Sum<P> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<P> Default for Sum<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Copy + Into<i64> + 'static> Aggregate<P> for Sum<P> {
    type State = i64;
    type Output = i64;

    fn name(&self) -> &'static str {
        "sum"
    }

    fn accumulate(&self, state: &mut i64, item: &P) {
        *state = state.wrapping_add((*item).into());
    }

    fn deaccumulate(&self, state: &mut i64, item: &P) {
        *state = state.wrapping_sub((*item).into());
    }

    fn compute(&self, state: &i64) -> i64 {
        *state
    }
}

/// Mean of integer payloads; `0.0` for an empty window.
#[derive(Debug, Clone, Copy)]
pub struct Average<P>(PhantomData<fn(P)>);

impl<P> Average<P> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<P> Default for Average<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Copy + Into<i64> + 'static> Aggregate<P> for Average<P> {
    /// `(sum, count)`
    type State = (i64, u64);
    type Output = f64;

    fn name(&self) -> &'static str {
        "average"
    }

    fn accumulate(&self, state: &mut (i64, u64), item: &P) {
        state.0 = state.0.wrapping_add((*item).into());
        state.1 += 1;
    }

    fn deaccumulate(&self, state: &mut (i64, u64), item: &P) {
        state.0 = state.0.wrapping_sub((*item).into());
        state.1 -= 1;
    }

    fn compute(&self, state: &(i64, u64)) -> f64 {
        match state.1 {
            0 => 0.0,
            n => state.0 as f64 / n as f64,
        }
    }
}
