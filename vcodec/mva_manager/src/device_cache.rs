// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A process-wide cache of devices by name.
//!
//! This is used to single instance the ION client and the translation table in
//! a process even if they are requested by multiple
//! [`MvaManager`](crate::MvaManager) objects. The cache only holds weak
//! references: a device is opened by the first manager that needs it and
//! closed when the last one is dropped.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::Weak;

/// A device cache.
pub(crate) struct SharedCache<T>(Mutex<Vec<(String, Weak<T>)>>);

impl<T> SharedCache<T> {
    /// Returns an empty cache.
    pub const fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }

    /// Gets a live device by name, or calls `f` to open it if there is none.
    pub fn get_or_try_insert_with<E>(
        &self,
        name: &str,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<Arc<T>, E> {
        let mut objects = self.0.lock();
        // Reap old entries. This ensures T doesn't have to clear the cache on drop.
        objects.retain(|(_, weak)| weak.strong_count() != 0);

        if let Some(i) = objects.iter().position(|(n, _)| n == name) {
            if let Some(v) = objects[i].1.upgrade() {
                return Ok(v);
            }
            // The object went away after the reap above.
            objects.swap_remove(i);
        }

        let v = Arc::new(f()?);
        objects.push((name.to_owned(), Arc::downgrade(&v)));
        Ok(v)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.lock().len()
    }
}
