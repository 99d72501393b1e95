//! Shared placeholder buffers
//!
//! Every not-yet-loaded cell points at one read-only buffer of default
//! elements per element type. The buffer only grows, rounded up to a power
//! of two, and is never written.

use crate::data::Element;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Pool of growth-only placeholder buffers keyed by element type
#[derive(Default)]
pub struct PlaceholderPool {
    buffers: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl PlaceholderPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared buffer holding at least `len` default elements
    pub fn buffer<T: Element>(&self, len: usize) -> Arc<[T]> {
        let mut buffers = self.buffers.lock();
        let slot = buffers
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(Arc::<[T]>::from(Vec::new())));

        if let Some(buffer) = slot.downcast_ref::<Arc<[T]>>() {
            if buffer.len() >= len {
                return Arc::clone(buffer);
            }
        }

        let size = len.next_power_of_two();
        debug!(element = T::NAME, size, "growing placeholder buffer");
        let grown: Arc<[T]> = vec![T::default(); size].into();
        *slot = Box::new(Arc::clone(&grown));
        grown
    }

    /// Current buffer length for element type `T`
    pub fn capacity<T: Element>(&self) -> usize {
        self.buffers
            .lock()
            .get(&TypeId::of::<T>())
            .and_then(|slot| slot.downcast_ref::<Arc<[T]>>())
            .map_or(0, |buffer| buffer.len())
    }
}

impl std::fmt::Debug for PlaceholderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaceholderPool")
            .field("types", &self.buffers.lock().len())
            .finish()
    }
}
