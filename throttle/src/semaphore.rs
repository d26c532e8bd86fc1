use std::sync::atomic::{AtomicBool, Ordering};

/// Token bucket backed by a tokio semaphore.
///
/// A bucket starts disabled: every acquisition returns immediately until `setup` is called with a
/// non-zero capacity. Tokens taken with `consume`/`consume_many` are forgotten and only come back
/// through `replenish`.
pub struct Semaphore {
    enabled: AtomicBool,
    sem: tokio::sync::Semaphore,
}

impl Semaphore {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            sem: tokio::sync::Semaphore::const_new(0),
        }
    }

    pub fn setup(&self, capacity: usize) {
        self.enabled.store(capacity > 0, Ordering::Release);
        if capacity == 0 {
            return;
        }
        self.sem.forget_permits(self.available());
        self.sem.add_permits(capacity);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    pub async fn consume(&self) {
        self.consume_many(1).await;
    }

    pub async fn consume_many(&self, tokens: u32) {
        if !self.is_enabled() || tokens == 0 {
            return;
        }
        // the semaphore is never closed, an error here would mean the bucket was torn down
        if let Ok(permit) = self.sem.acquire_many(tokens).await {
            permit.forget();
        }
    }

    /// Tops the bucket back up to `capacity` tokens.
    pub fn replenish(&self, capacity: usize) {
        let current = self.available();
        if current < capacity {
            self.sem.add_permits(capacity - current);
        }
    }

    pub async fn run_replenish_thread(&self, capacity: usize, interval: std::time::Duration) {
        if !self.is_enabled() {
            return;
        }
        loop {
            tokio::time::sleep(interval).await;
            self.replenish(capacity);
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}
