use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub struct Semaphore {
    flag: AtomicBool,
    // number of tokens a single replenish interval adds back
    capacity: AtomicUsize,
    sem: tokio::sync::Semaphore,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            capacity: AtomicUsize::new(0),
            sem: tokio::sync::Semaphore::const_new(0),
        }
    }

    pub fn setup(&self, value: usize) {
        self.flag.store(value > 0, Ordering::Release);
        self.capacity.store(value, Ordering::Release);
        if value == 0 {
            return;
        }
        self.sem.forget_permits(self.sem.available_permits());
        self.sem.add_permits(value);
    }

    pub fn is_enabled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub async fn consume(&self) {
        self.consume_many(1).await;
    }

    /// Takes `value` tokens, in pieces no larger than one interval's worth so that
    /// requests bigger than the bucket still make progress.
    pub async fn consume_many(&self, value: u64) {
        if !self.is_enabled() {
            return;
        }
        let capacity = self.capacity.load(Ordering::Acquire).max(1) as u64;
        let mut remaining = value;
        while remaining > 0 {
            let piece = remaining.min(capacity).min(u64::from(u32::MAX));
            // piece is bounded by u32::MAX above
            let piece_u32 = u32::try_from(piece).unwrap_or(u32::MAX);
            match self.sem.acquire_many(piece_u32).await {
                Ok(permit) => permit.forget(),
                Err(_) => {
                    tracing::warn!("throttle semaphore closed, no longer throttling");
                    return;
                }
            }
            remaining -= piece;
        }
    }

    pub async fn run_replenish_thread(&self, replenish: usize, interval: std::time::Duration) {
        if !self.is_enabled() {
            return;
        }
        loop {
            tokio::time::sleep(interval).await;
            let curr_permits = self.sem.available_permits();
            if curr_permits >= replenish {
                continue;
            }
            self.sem.add_permits(replenish - curr_permits);
        }
    }
}
