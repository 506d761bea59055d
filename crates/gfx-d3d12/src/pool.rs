//! Fence-gated object recycling.

use std::collections::VecDeque;

use anyhow::Result;
use parking_lot::Mutex;

/// FIFO of objects the GPU may still be using, each tagged with the fence
/// value that must complete before it can be reused.
#[derive(Debug)]
pub struct ResourcePool<T> {
    entries: Mutex<VecDeque<(u64, T)>>,
}

impl<T> Default for ResourcePool<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> ResourcePool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuse the oldest object if its fence value is at most
    /// `completed_value`, resetting it first; otherwise create a new one.
    pub fn get_object(
        &self,
        completed_value: u64,
        create: impl FnOnce() -> Result<T>,
        reset: impl FnOnce(&mut T) -> Result<()>,
    ) -> Result<T> {
        let reusable = {
            let mut entries = self.entries.lock();
            match entries.front() {
                Some((fence, _)) if *fence <= completed_value => entries.pop_front().map(|(_, object)| object),
                _ => None,
            }
        };
        match reusable {
            Some(mut object) => {
                reset(&mut object)?;
                Ok(object)
            }
            None => create(),
        }
    }

    /// Return `object`; it becomes reusable once `fence_value` completes.
    pub fn recycle_object(&self, fence_value: u64, object: T) {
        self.entries.lock().push_back((fence_value, object));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Take every pooled object, for release on device destruction.
    pub fn drain(&self) -> Vec<T> {
        self.entries.lock().drain(..).map(|(_, object)| object).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn reuses_only_completed_objects() {
        let pool = ResourcePool::new();
        let created = Cell::new(0);
        let create = || {
            created.set(created.get() + 1);
            Ok(created.get() * 10)
        };

        pool.recycle_object(5, 1);
        // Fence 5 has not completed.
        assert_eq!(pool.get_object(4, create, |_| Ok(())).unwrap(), 10);
        assert_eq!(pool.len(), 1);

        let mut resets = 0;
        let object = pool
            .get_object(5, || unreachable!(), |_| {
                resets += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(object, 1);
        assert_eq!(resets, 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn oldest_entry_gates_reuse() {
        let pool = ResourcePool::new();
        pool.recycle_object(9, "late");
        pool.recycle_object(2, "early");
        // FIFO: the early-fenced entry waits behind the late one.
        let object = pool.get_object(3, || Ok("new"), |_| Ok(())).unwrap();
        assert_eq!(object, "new");
        assert_eq!(pool.drain(), vec!["late", "early"]);
    }
}
