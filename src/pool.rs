/*!
Typed free-list pools for transport descriptors.

Behavior:
- Objects are built by a factory closure in batches (`grow` at a time, 128
  for the transport pools) the first time the free list runs dry, up to an
  optional cap on total allocations.
- `get` returns `None` once the cap is reached and the free list is empty;
  callers translate that to `NoResource`.
- `cleanup` checks that every allocated object came home. At interface
  teardown some descriptors may legitimately still be with the user, so the
  caller passes `leak_ok = true` and the discrepancy is only warn-logged.
*/

use log::{error, warn};

pub struct Pool<T> {
    name: &'static str,
    free: Vec<Box<T>>,
    factory: Box<dyn Fn() -> T + Send>,
    grow: usize,
    max_items: Option<usize>,
    allocated: usize,
}

impl<T> Pool<T> {
    pub fn new(
        name: &'static str,
        grow: usize,
        max_items: Option<usize>,
        factory: impl Fn() -> T + Send + 'static,
    ) -> Self {
        Self {
            name,
            free: Vec::new(),
            factory: Box::new(factory),
            grow,
            max_items,
            allocated: 0,
        }
    }

    /// Take an object from the pool, growing it if needed. `None` means the
    /// pool is at its cap and nothing is free.
    pub fn get(&mut self) -> Option<Box<T>> {
        if self.free.is_empty() {
            self.grow_batch();
        }
        self.free.pop()
    }

    /// Return an object to the free list.
    pub fn put(&mut self, item: Box<T>) {
        self.free.push(item);
    }

    fn grow_batch(&mut self) {
        let budget = match self.max_items {
            Some(max) => max.saturating_sub(self.allocated).min(self.grow),
            None => self.grow,
        };
        for _ in 0..budget {
            self.free.push(Box::new((self.factory)()));
            self.allocated += 1;
        }
    }

    /// Total objects ever allocated by this pool.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Objects currently on the free list.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Verify pool accounting at teardown. With `leak_ok` the mismatch is
    /// expected (descriptors still held by the user) and only warn-logged.
    pub fn cleanup(&mut self, leak_ok: bool) {
        let outstanding = self.allocated - self.free.len();
        if outstanding != 0 {
            if leak_ok {
                warn!(
                    "pool {}: {} object(s) not returned at cleanup",
                    self.name, outstanding
                );
            } else {
                error!(
                    "pool {}: {} object(s) leaked at cleanup",
                    self.name, outstanding
                );
            }
        }
        self.free.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_in_batches_and_reuses() {
        let mut pool: Pool<u32> = Pool::new("test", 4, None, || 7);
        let a = pool.get().unwrap();
        assert_eq!(*a, 7);
        assert_eq!(pool.allocated(), 4);
        assert_eq!(pool.available(), 3);

        pool.put(a);
        assert_eq!(pool.available(), 4);

        // Drain the batch plus one more: a second batch is allocated.
        let taken: Vec<_> = (0..5).map(|_| pool.get().unwrap()).collect();
        assert_eq!(pool.allocated(), 8);
        for t in taken {
            pool.put(t);
        }
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn cap_limits_total_allocation() {
        let mut pool: Pool<u8> = Pool::new("capped", 4, Some(2), || 0);
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert!(pool.get().is_none());
        assert_eq!(pool.allocated(), 2);

        pool.put(a);
        assert!(pool.get().is_some());
        pool.put(b);
    }

    #[test]
    fn cleanup_accounts_for_outstanding_objects() {
        let mut pool: Pool<u8> = Pool::new("leaky", 2, None, || 0);
        let kept = pool.get().unwrap();
        // One object is still out; leak-tolerant cleanup only logs.
        pool.cleanup(true);
        assert_eq!(pool.available(), 0);
        drop(kept);
    }
}
