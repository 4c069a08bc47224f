use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::Connection;

/// Contract for objects kept in a [`Pool`].
pub trait Recycle {
    /// Returns the object to its freshly-constructed state.
    fn recycle(&mut self);

    /// Returns false while the object is still referenced elsewhere and must not be handed out.
    fn reusable(&self) -> bool {
        true
    }
}

impl Recycle for Vec<u8> {
    fn recycle(&mut self) {
        self.fill(0);
    }
}

impl Recycle for Arc<Connection> {
    fn recycle(&mut self) {
        self.reset();
    }

    fn reusable(&self) -> bool {
        Arc::strong_count(self) == 1
    }
}

/// Bounded free-list. Objects are recycled when returned; the pool owns them until the next
/// [`Pool::get`].
pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    capacity: usize,
    make: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Recycle> Pool<T> {
    pub fn new<F>(capacity: usize, make: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity,
            make: Box::new(make),
        }
    }

    pub fn get(&self) -> T {
        let ref mut idle = *self.idle.lock();

        while let Some(item) = idle.pop() {
            if item.reusable() {
                return item;
            }
        }

        (self.make)()
    }

    pub fn put(&self, mut item: T) {
        item.recycle();

        if !item.reusable() {
            return;
        }

        let ref mut idle = *self.idle.lock();

        if idle.len() < self.capacity {
            idle.push(item);
        }
    }

    #[cfg(test)]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}
