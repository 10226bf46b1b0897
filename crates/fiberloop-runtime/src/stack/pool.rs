//! Bounded pool of reusable stacks
//!
//! Mapping and protecting a stack costs several syscalls. Workers hand the
//! stacks of finished coroutines back here and new coroutines take them
//! out again. Only stacks of the pool's own size and mode are accepted.

use super::StackGuard;
use crossbeam_queue::ArrayQueue;
use fiberloop_core::error::StackError;

pub struct StackPool {
    slots: Option<ArrayQueue<StackGuard>>,
    stack_size: usize,
    guarded: bool,
}

impl StackPool {
    /// Pool holding at most `capacity` idle stacks (0 disables pooling)
    pub fn new(capacity: usize, stack_size: usize, guarded: bool) -> Self {
        Self {
            slots: (capacity > 0).then(|| ArrayQueue::new(capacity)),
            stack_size,
            guarded,
        }
    }

    /// Take an idle stack or map a new one
    pub fn get(&self) -> Result<StackGuard, StackError> {
        if let Some(stack) = self.slots.as_ref().and_then(|q| q.pop()) {
            return Ok(stack);
        }
        StackGuard::new(self.stack_size, self.guarded)
    }

    /// Return a stack; dropped (unmapped) if the pool is full or it does not fit
    pub fn put(&self, stack: StackGuard) {
        if stack.is_guarded() != self.guarded || stack.size() < self.stack_size {
            return;
        }
        if let Some(q) = &self.slots {
            let _ = q.push(stack);
        }
    }

    /// Idle stacks currently held
    pub fn idle(&self) -> usize {
        self.slots.as_ref().map_or(0, |q| q.len())
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn is_guarded(&self) -> bool {
        self.guarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_returns_same_region() {
        let pool = StackPool::new(2, 32 * 1024, true);
        let a = pool.get().unwrap();
        let base = a.base();
        pool.put(a);
        assert_eq!(pool.idle(), 1);

        let b = pool.get().unwrap();
        assert_eq!(b.base(), base);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_full_pool_drops_extra() {
        let pool = StackPool::new(1, 16 * 1024, false);
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_mismatched_stack_rejected() {
        let pool = StackPool::new(4, 64 * 1024, true);
        pool.put(StackGuard::new(16 * 1024, true).unwrap());
        pool.put(StackGuard::new(64 * 1024, false).unwrap());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_disabled_pool() {
        let pool = StackPool::new(0, 16 * 1024, false);
        pool.put(pool.get().unwrap());
        assert_eq!(pool.idle(), 0);
    }
}
