use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

// Time to wait before asking an exhausted allocator again.
pub const REFILL_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Bucket {

    tokens: f64,

    last: Instant,

}

// Token bucket shared between the torrent loop and the peer tasks.
// A rate of 0 means unlimited, the bucket holds at most one second of tokens.
#[derive(Debug)]
pub struct Allocator {

    rate: u64,

    bucket: Mutex<Bucket>,

}

impl Allocator {

    pub fn new(rate: u64) -> Self {
        Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: rate as f64,
                last: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        // Bucket state is always consistent, a poisoned lock is still usable.
        match self.bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // Takes up to `n` tokens, returns how many were granted.
    pub fn request(&self, n: u64) -> u64 {
        if self.is_unlimited() {
            return n;
        }

        let mut bucket = self.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        bucket.last = now;
        bucket.tokens = (bucket.tokens + elapsed * self.rate as f64).min(self.rate as f64);

        let granted = (bucket.tokens.floor() as u64).min(n);
        bucket.tokens -= granted as f64;
        granted
    }

    // Returns unused tokens.
    pub fn release(&self, n: u64) {
        if self.is_unlimited() || n == 0 {
            return;
        }
        let mut bucket = self.lock();
        bucket.tokens = (bucket.tokens + n as f64).min(self.rate as f64);
    }

    pub fn available(&self) -> u64 {
        if self.is_unlimited() {
            return u64::MAX;
        }
        self.lock().tokens as u64
    }
}

// A transfer direction limited by both the torrent's allocator and the client wide one.
#[derive(Debug, Clone)]
pub struct Throttle {

    local: Arc<Allocator>,

    global: Arc<Allocator>,

}

impl Throttle {

    pub fn new(local: Arc<Allocator>, global: Arc<Allocator>) -> Self {
        Self { local, global }
    }

    // Grants min(local, global), the shortfall goes back to the local allocator.
    pub fn request(&self, n: u64) -> u64 {
        let local = self.local.request(n);
        if local == 0 {
            return 0;
        }
        let global = self.global.request(local);
        self.local.release(local - global);
        global
    }
}

#[derive(Debug, Clone)]
pub struct Bandwidth {

    pub up: Throttle,

    pub down: Throttle,

}

impl Bandwidth {

    pub fn unlimited() -> Self {
        let unlimited = Arc::new(Allocator::unlimited());
        Self {
            up: Throttle::new(unlimited.clone(), unlimited.clone()),
            down: Throttle::new(unlimited.clone(), unlimited),
        }
    }
}
