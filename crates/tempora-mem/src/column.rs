//! Reference-counted pooled columns.
//!
//! A column is shared by every batch holding it. The reference count is the
//! `Arc` strong count: `clone()` takes another share, `drop()` releases one.
//! When the last share goes away the buffer is handed back to the pool it
//! was rented from (if that pool still exists) rather than freed.
//!
//! Shared columns are read-only. `as_mut_slice` on a shared column is a
//! capacity violation; callers use `make_writable` to obtain a private copy.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::capacity_violation;
use crate::pool::{ColumnPool, FreeList};

/// Element types a column can hold.
pub trait Element: Clone + Default + Send + Sync + 'static {}

impl<T: Clone + Default + Send + Sync + 'static> Element for T {}

struct Buffer<T> {
    data: Vec<T>,
    home: Weak<FreeList<T>>,
}

impl<T> Drop for Buffer<T> {
    fn drop(&mut self) {
        if let Some(home) = self.home.upgrade() {
            home.give_back(std::mem::take(&mut self.data));
        }
    }
}

pub struct Column<T: Element> {
    buf: Arc<Buffer<T>>,
}

impl<T: Element> Column<T> {
    pub(crate) fn from_pool(data: Vec<T>, home: Weak<FreeList<T>>) -> Self {
        Self {
            buf: Arc::new(Buffer { data, home }),
        }
    }

    /// A column not tied to any pool; its buffer is simply freed on release.
    pub fn detached(data: Vec<T>) -> Self {
        Self::from_pool(data, Weak::new())
    }

    pub fn capacity(&self) -> usize {
        self.buf.data.len()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.buf.data
    }

    /// Number of holders sharing this buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.buf)
    }

    pub fn is_shared(&self) -> bool {
        self.ref_count() > 1
    }

    /// Mutable view, or `None` if other holders share the buffer.
    pub fn try_as_mut_slice(&mut self) -> Option<&mut [T]> {
        Arc::get_mut(&mut self.buf).map(|b| b.data.as_mut_slice())
    }

    /// Mutable view of an exclusively owned column.
    ///
    /// # Panics
    /// If the column is shared. Call [`Column::make_writable`] first.
    #[track_caller]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let shares = self.ref_count();
        match Arc::get_mut(&mut self.buf) {
            Some(b) => b.data.as_mut_slice(),
            None => capacity_violation(format!(
                "attempted in-place mutation of a column shared by {shares} holders"
            )),
        }
    }

    /// Ensure this handle owns its buffer exclusively, copying into a freshly
    /// rented column from `pool` when the buffer is shared. Returns `true` if a
    /// copy was made.
    pub fn make_writable(&mut self, pool: &ColumnPool<T>) -> bool {
        if !self.is_shared() {
            return false;
        }
        *self = self.deep_copy(pool);
        true
    }

    /// Copy the contents into a freshly rented column.
    pub fn deep_copy(&self, pool: &ColumnPool<T>) -> Column<T> {
        let mut fresh = pool.rent();
        let dst = fresh.as_mut_slice();
        if dst.len() != self.capacity() {
            capacity_violation(format!(
                "cannot copy a {}-element column into a {}-element pool buffer",
                self.capacity(),
                dst.len()
            ));
        }
        dst.clone_from_slice(self.as_slice());
        fresh
    }

    pub(crate) fn is_from(&self, list: &Arc<FreeList<T>>) -> bool {
        self.buf
            .home
            .upgrade()
            .is_some_and(|home| Arc::ptr_eq(&home, list))
    }
}

impl<T: Element> Clone for Column<T> {
    /// Take another share of the same buffer (reference count + 1).
    fn clone(&self) -> Self {
        Self {
            buf: Arc::clone(&self.buf),
        }
    }
}

impl<T: Element> fmt::Debug for Column<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("type", &std::any::type_name::<T>())
            .field("capacity", &self.capacity())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
