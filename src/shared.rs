//! Whole-value swappable shared state.
//!
//! Multi-field records (the control-plane assignment, the loaded settings)
//! are replaced wholesale and read as an `Arc` snapshot, so a reader always
//! sees either the old or the new value in full.

use std::sync::{Arc, RwLock};

/// A cloneable handle to a value that is replaced atomically as a unit.
#[derive(Debug)]
pub struct Shared<T> {
    cell: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Self {
            cell: Arc::new(RwLock::new(Arc::new(value))),
        }
    }

    /// Snapshot of the current value.
    pub fn load(&self) -> Arc<T> {
        let guard = self.cell.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Replace the held value.  Outstanding snapshots keep the old one alive.
    pub fn store(&self, value: T) {
        let next = Arc::new(value);
        let mut guard = self
            .cell
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_survive_replacement() {
        let shared = Shared::new((1u32, "one".to_string()));
        let before = shared.load();
        shared.store((2, "two".to_string()));
        assert_eq!(*before, (1, "one".to_string()));
        assert_eq!(*shared.load(), (2, "two".to_string()));
    }

    #[test]
    fn concurrent_readers_never_see_a_mix() {
        let shared = Shared::new((0u64, 0u64));
        let writer = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                for i in 1..=1000u64 {
                    shared.store((i, i * 2));
                }
            })
        };
        for _ in 0..1000 {
            let snapshot = shared.load();
            assert_eq!(snapshot.1, snapshot.0 * 2);
        }
        writer.join().unwrap();
        assert_eq!(*shared.load(), (1000, 2000));
    }
}
