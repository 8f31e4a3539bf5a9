use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Objects that can live in an `ObjectPool`. `reset` must return the object
/// to its pristine state before the slot is handed out again.
pub trait Reusable: Default {
    fn reset(&mut self);
}

/// Usage counters for a pool. `in_use + free == allocated` holds at any
/// observable point.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PoolStats {
    pub allocated: usize,
    pub in_use: usize,
    pub free: usize,
}

struct PoolCore<T> {
    free: Mutex<Vec<Box<T>>>,
    allocated: AtomicUsize,
    in_use: AtomicUsize,
}

impl<T: Reusable> PoolCore<T> {
    fn reclaim(&self, mut value: Box<T>) {
        value.reset();
        self.free.lock().expect("Pool free list poisoned").push(value);
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Recycling object pool. `obtain` hands out an existing free object or
/// allocates a new one; the returned handle brings the object back to the
/// free list when the last strong handle is released. Obtain/reclaim are
/// thread safe, the pooled objects themselves are not.
pub struct ObjectPool<T: Reusable> {
    core: Arc<PoolCore<T>>,
}

impl<T: Reusable> ObjectPool<T> {
    pub fn new() -> ObjectPool<T> {
        ObjectPool {
            core: Arc::new(PoolCore {
                free: Mutex::new(Vec::new()),
                allocated: AtomicUsize::new(0),
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    /// Provides an existing free object, or allocates a new one if the free
    /// list is empty.
    pub fn obtain(&self) -> PoolRef<T> {
        let value = match self.core.free.lock().expect("Pool free list poisoned").pop() {
            Some(value) => value,
            None => {
                self.core.allocated.fetch_add(1, Ordering::AcqRel);
                Box::new(T::default())
            }
        };

        self.core.in_use.fetch_add(1, Ordering::AcqRel);

        PoolRef {
            slot: Arc::new(Slot {
                value: Some(value),
                owner: Arc::downgrade(&self.core),
            }),
        }
    }

    /// Obtains an object and applies `init` to it before the handle is shared.
    pub fn obtain_with<F: FnOnce(&mut T)>(&self, init: F) -> PoolRef<T> {
        let mut item = self.obtain();
        init(item.try_mut().expect("Fresh pool handle must be unique"));
        item
    }

    pub fn stats(&self) -> PoolStats {
        let free = self.core.free.lock().expect("Pool free list poisoned").len();

        PoolStats {
            allocated: self.core.allocated.load(Ordering::Acquire),
            in_use: self.core.in_use.load(Ordering::Acquire),
            free,
        }
    }

    /// Panics unless every object has been returned. Called by owners at
    /// orderly shutdown and by tests.
    pub fn assert_drained(&self) {
        let stats = self.stats();

        if stats.in_use != 0 {
            panic!("Pool drained with {} objects still in use", stats.in_use);
        }
    }
}

impl<T: Reusable> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        ObjectPool { core: self.core.clone() }
    }
}

struct Slot<T: Reusable> {
    value: Option<Box<T>>,
    owner: Weak<PoolCore<T>>,
}

impl<T: Reusable> Drop for Slot<T> {
    fn drop(&mut self) {
        let value = self.value.take().expect("Pool slot already vacated");

        // Detached handles have no owner and free normally.
        if let Some(pool) = self.owner.upgrade() {
            pool.reclaim(value);
        }
    }
}

/// Strong shared handle to a pooled (or detached) object. The number of live
/// clones is the object's refcount; releasing the last one returns the object
/// to its owning pool instead of freeing it.
pub struct PoolRef<T: Reusable> {
    slot: Arc<Slot<T>>,
}

impl<T: Reusable> PoolRef<T> {
    /// Wraps a plain value in a handle with no owning pool. The value is
    /// dropped normally on the last release.
    pub fn detached(value: T) -> PoolRef<T> {
        PoolRef {
            slot: Arc::new(Slot {
                value: Some(Box::new(value)),
                owner: Weak::new(),
            }),
        }
    }

    /// Narrows the shared handle to a mutable borrow. Succeeds only while
    /// this is the sole strong handle to the object; this is the one
    /// sanctioned route from shared to mutable access.
    #[inline]
    pub fn try_mut(&mut self) -> Option<&mut T> {
        Arc::get_mut(&mut self.slot).map(|slot| {
            slot.value
                .as_mut()
                .expect("Pool slot already vacated")
                .as_mut()
        })
    }

    /// Number of live strong handles to the object.
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.slot)
    }
}

impl<T: Reusable> Deref for PoolRef<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.slot.value.as_ref().expect("Pool slot already vacated")
    }
}

impl<T: Reusable> Clone for PoolRef<T> {
    #[inline]
    fn clone(&self) -> Self {
        PoolRef { slot: self.slot.clone() }
    }
}

impl<T: Reusable + fmt::Debug> fmt::Debug for PoolRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.deref().fmt(f)
    }
}

impl<T: Reusable + PartialEq> PartialEq for PoolRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deref() == other.deref()
    }
}
