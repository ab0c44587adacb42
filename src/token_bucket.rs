//! Token bucket used to pace download streams on the server.
//!
//! Tokens are bytes. They accrue at the configured rate up to a burst of one
//! tenth of a second, and a sender that runs short sleeps for the deficit.

use std::time::Duration;
use tokio::time::{self, Instant};

/// Smallest burst the bucket allows, so tiny rates still move whole frames.
const MIN_CAPACITY: i64 = 8192;

/// Sleeps shorter than this are skipped; the deficit carries to the next call.
const MIN_SLEEP_NANOS: u64 = 10_000;

/// Byte-rate limiter for a single sender.
///
/// # Examples
///
/// ```
/// use wsperf::token_bucket::TokenBucket;
///
/// # async fn example() {
/// // 2 MB/s
/// let mut bucket = TokenBucket::new(2_000_000);
/// bucket.consume(100_000).await;
/// # }
/// ```
#[derive(Debug)]
pub struct TokenBucket {
    bytes_per_sec: u64,
    tokens: i64,
    capacity: i64,
    nanos_per_byte: u64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    ///
    /// # Arguments
    ///
    /// * `bytes_per_sec` - Sustained rate. The burst is a tenth of it, but
    ///   never less than 8 KiB. Zero disables waiting altogether.
    pub fn new(bytes_per_sec: u64) -> Self {
        let capacity = i64::try_from(bytes_per_sec / 10)
            .unwrap_or(i64::MAX)
            .max(MIN_CAPACITY);
        Self {
            bytes_per_sec,
            tokens: capacity,
            capacity,
            nanos_per_byte: 1_000_000_000u64.checked_div(bytes_per_sec).unwrap_or(0),
            last_refill: Instant::now(),
        }
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Takes `bytes` tokens, sleeping first if the bucket cannot cover them.
    ///
    /// The balance may go negative for frames larger than the burst; later
    /// calls then wait that debt off.
    ///
    /// # Examples
    ///
    /// ```
    /// use wsperf::token_bucket::TokenBucket;
    /// use std::time::Duration;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let mut bucket = TokenBucket::new(1_000_000);
    /// let start = tokio::time::Instant::now();
    /// // The first 100 KB are the burst and go out at once
    /// bucket.consume(100_000).await;
    /// assert!(start.elapsed() < Duration::from_millis(50));
    /// # }
    /// ```
    pub async fn consume(&mut self, bytes: usize) {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        self.refill();

        if self.tokens < bytes {
            let deficit = bytes.saturating_sub(self.tokens) as u64;
            let sleep_nanos = deficit.saturating_mul(self.nanos_per_byte);
            if sleep_nanos > MIN_SLEEP_NANOS {
                time::sleep(Duration::from_nanos(sleep_nanos)).await;
                self.refill();
            }
        }

        self.tokens = self.tokens.saturating_sub(bytes);
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed_micros = now.duration_since(self.last_refill).as_micros();
        let earned = elapsed_micros.saturating_mul(self.bytes_per_sec as u128) / 1_000_000;

        if earned > 0 {
            let earned = i64::try_from(earned).unwrap_or(i64::MAX);
            self.tokens = self.tokens.saturating_add(earned).min(self.capacity);
            self.last_refill = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_is_a_tenth_of_a_second() {
        let bucket = TokenBucket::new(2_000_000);
        assert_eq!(bucket.capacity, 200_000);
        assert_eq!(bucket.tokens, bucket.capacity);
        assert_eq!(bucket.nanos_per_byte, 500);

        assert_eq!(TokenBucket::new(1_000).capacity, MIN_CAPACITY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_free() {
        let mut bucket = TokenBucket::new(1_000_000);
        let start = Instant::now();

        bucket.consume(100_000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(bucket.tokens, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paces_to_configured_rate() {
        let mut bucket = TokenBucket::new(1_000_000);
        let start = Instant::now();

        // One free burst, then ten frames at 0.1 s each
        for _ in 0..11 {
            bucket.consume(100_000).await;
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(950), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(1_100), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_rate_after_long_idle() {
        let mut bucket = TokenBucket::new(u64::MAX);
        assert_eq!(bucket.nanos_per_byte, 0);

        bucket.consume(usize::MAX / 2).await;
        time::advance(Duration::from_secs(24 * 3600)).await;
        bucket.consume(100_000).await;

        assert!(bucket.tokens <= bucket.capacity);
    }
}
