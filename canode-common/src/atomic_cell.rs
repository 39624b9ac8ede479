//! A Copy cell guarded by a critical section
//!
//! Crossbeam's AtomicCell needs CAS instructions which thumbv6m lacks, so values shared between the
//! receive context and the processing context are wrapped in a critical_section Mutex instead.

use core::{
    cell::Cell,
    ops::{Add, Sub},
};
use critical_section::Mutex;

/// A cell which can be shared between an interrupt and a thread
///
/// Every access takes a critical section, so a load always observes a complete value.
#[derive(Debug)]
pub struct AtomicCell<T: Copy> {
    inner: Mutex<Cell<T>>,
}

impl<T: Send + Copy> AtomicCell<T> {
    /// Create a new cell holding `value`
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Cell::new(value)),
        }
    }

    /// Read the current value
    pub fn load(&self) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).get())
    }

    /// Replace the current value
    pub fn store(&self, value: T) {
        critical_section::with(|cs| self.inner.borrow(cs).set(value));
    }

    /// Replace the current value, returning the previous one
    pub fn swap(&self, value: T) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).replace(value))
    }

    /// Conditionally update the value
    ///
    /// `f` receives the current value. When it returns `Some`, the new value is stored and the old
    /// value is returned as `Ok`. When it returns `None`, nothing is stored and the current value is
    /// returned as `Err`.
    pub fn fetch_update(&self, mut f: impl FnMut(T) -> Option<T>) -> Result<T, T> {
        critical_section::with(|cs| {
            let cell = self.inner.borrow(cs);
            let old_value = cell.get();
            match f(old_value) {
                Some(new_value) => {
                    cell.set(new_value);
                    Ok(old_value)
                }
                None => Err(old_value),
            }
        })
    }
}

impl<T: Send + Copy + Default> AtomicCell<T> {
    /// Read the value and leave the default in its place
    pub fn take(&self) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).take())
    }
}

impl<T: Copy + Add<Output = T>> AtomicCell<T> {
    /// Add to the value, returning the previous value
    pub fn fetch_add(&self, value: T) -> T {
        critical_section::with(|cs| {
            let cell = self.inner.borrow(cs);
            let old_value = cell.get();
            cell.set(old_value + value);
            old_value
        })
    }
}

impl<T: Copy + Sub<Output = T>> AtomicCell<T> {
    /// Subtract from the value, returning the previous value
    pub fn fetch_sub(&self, value: T) -> T {
        critical_section::with(|cs| {
            let cell = self.inner.borrow(cs);
            let old_value = cell.get();
            cell.set(old_value - value);
            old_value
        })
    }
}

impl<T: Default + Copy + Send> Default for AtomicCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
