use std::time::Duration;

/// Jittered exponential backoff between `initial` and `max`.
#[derive(Debug)]
pub(crate) struct Backoff {
    current: Duration,
    max: Duration,
    seed: u64,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration, salt: &str) -> Self {
        let mut seed = jitter_seed(salt);
        let current = apply_jitter(initial, max, &mut seed);
        Self { current, max, seed }
    }

    /// Returns the delay to wait now and advances to the next one.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = next_interval(self.current, self.max, &mut self.seed);
        delay
    }
}

fn next_interval(current: Duration, max: Duration, seed: &mut u64) -> Duration {
    let doubled = current.saturating_mul(2);
    let base = if doubled > max { max } else { doubled };
    apply_jitter(base, max, seed)
}

fn apply_jitter(base: Duration, max: Duration, seed: &mut u64) -> Duration {
    if base >= max {
        return base;
    }

    let base_us = duration_to_micros_saturating(base);
    let max_us = duration_to_micros_saturating(max);

    let amplitude = base_us / 10;
    if amplitude == 0 {
        return base;
    }

    *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    let jitter = *seed % amplitude.saturating_add(1);

    let us = std::cmp::min(base_us.saturating_add(jitter), max_us);
    Duration::from_micros(us)
}

fn duration_to_micros_saturating(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

fn jitter_seed(salt: &str) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for b in salt.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100000001b3);
    }

    let now = std::time::SystemTime::now();
    let nanos = match now.duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => u64::from(d.subsec_nanos()),
        Err(_) => 0,
    };

    hash ^ nanos ^ u64::from(std::process::id())
}
