//! Transaction id generation.
//!
//! Ids pack a millisecond timestamp above an 18-bit counter:
//!
//! ```text
//! id = (millis << 18) | counter
//! ```
//!
//! Every issued id is strictly greater than the previous one. When the wall
//! clock stalls or moves backward the generator keeps counting from the last
//! id, so the logical clock runs ahead of wall time. It may run at most
//! `max_skew` ahead: beyond that, [`TransactionIdGenerator::next_id`] waits up
//! to `startup_wait` for the wall clock to catch up and then fails with
//! [`Error::ClockSkewExceeded`]. The last issued id (the high-water mark) is
//! written through a [`MarkStore`] by a background thread and once more on
//! [`TransactionIdGenerator::stop`], and is the floor a restarted generator
//! continues from.

use crate::store::OrderedByteStore;
use crate::tables::LAST_TIMESTAMP;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use lakemeta_common::{Error, Result, TransactionConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Low bits of an id holding the per-millisecond counter
pub const COUNTER_BITS: u32 = 18;

/// How often a lagging clock is re-read
const CLOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Millisecond component of a transaction id
#[must_use]
pub const fn id_millis(id: u64) -> u64 {
    id >> COUNTER_BITS
}

/// Wall clock source
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> u64;
}

/// The system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Durable home of the high-water mark
pub trait MarkStore: Send + Sync {
    fn read_mark(&self) -> Result<Option<u64>>;
    fn write_mark(&self, mark: u64) -> Result<()>;
}

impl MarkStore for OrderedByteStore {
    fn read_mark(&self) -> Result<Option<u64>> {
        load_mark(self)
    }

    fn write_mark(&self, mark: u64) -> Result<()> {
        self.put(LAST_TIMESTAMP, &mark.to_be_bytes())
    }
}

/// Read the persisted high-water mark
pub fn load_mark(store: &OrderedByteStore) -> Result<Option<u64>> {
    store
        .get(LAST_TIMESTAMP)?
        .map(|bytes| {
            let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                Error::CorruptValue(format!(
                    "transaction mark has {} bytes, expected 8",
                    bytes.len()
                ))
            })?;
            Ok(u64::from_be_bytes(raw))
        })
        .transpose()
}

/// State shared with the flusher thread
struct Shared {
    marks: Arc<dyn MarkStore>,
    /// Last id handed out
    last_issued: AtomicU64,
    /// Last id written to the store
    flushed: AtomicU64,
}

impl Shared {
    /// Persist the latest id if it moved since the previous flush
    fn flush(&self) -> Result<bool> {
        let current = self.last_issued.load(Ordering::SeqCst);
        if current == self.flushed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.marks.write_mark(current)?;
        self.flushed.store(current, Ordering::SeqCst);
        Ok(true)
    }
}

struct Flusher {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

/// Strictly increasing, clock-skew tolerant transaction ids
pub struct TransactionIdGenerator {
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    config: TransactionConfig,
    running: AtomicBool,
    flusher: Mutex<Option<Flusher>>,
}

impl TransactionIdGenerator {
    /// Create a stopped generator reading the system clock
    pub fn new(marks: Arc<dyn MarkStore>, config: TransactionConfig) -> Self {
        Self::with_clock(marks, config, Arc::new(SystemClock))
    }

    /// Create a stopped generator reading `clock`
    pub fn with_clock(
        marks: Arc<dyn MarkStore>,
        config: TransactionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                marks,
                last_issued: AtomicU64::new(0),
                flushed: AtomicU64::new(0),
            }),
            clock,
            config,
            running: AtomicBool::new(false),
            flusher: Mutex::new(None),
        }
    }

    /// Load the persisted mark and start issuing ids.
    ///
    /// Fails when the mark cannot be read, or when the wall clock is still
    /// more than `max_skew` behind the mark after waiting `startup_wait`.
    /// Calling `start` on a running generator does nothing.
    pub fn start(&self) -> Result<()> {
        let mut flusher = self.flusher.lock();
        if flusher.is_some() {
            return Ok(());
        }

        let mark = self.shared.marks.read_mark()?.unwrap_or(0);
        if mark > 0 {
            self.wait_for_clock(id_millis(mark))?;
        }
        self.shared.last_issued.fetch_max(mark, Ordering::SeqCst);
        self.shared.flushed.store(mark, Ordering::SeqCst);

        let (shutdown, signal) = bounded(1);
        let shared = Arc::clone(&self.shared);
        let interval = self.config.flush_interval();
        let handle = thread::Builder::new()
            .name("txn-id-flusher".to_string())
            .spawn(move || run_flusher(&shared, &signal, interval))?;

        *flusher = Some(Flusher { shutdown, handle });
        self.running.store(true, Ordering::SeqCst);
        info!(
            "Transaction id generator started (mark {}, flush every {:?})",
            mark, interval
        );
        Ok(())
    }

    /// Next id, strictly greater than every id issued before.
    ///
    /// Blocks while the id would run more than `max_skew` ahead of the wall
    /// clock, for at most `startup_wait`.
    pub fn next_id(&self) -> Result<u64> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::GeneratorNotRunning);
        }

        let mut last = self.shared.last_issued.load(Ordering::SeqCst);
        let id = loop {
            let now = self.clock.now_millis();
            let candidate = if now > id_millis(last) {
                now << COUNTER_BITS
            } else {
                // Counter overflow carries into the next logical millisecond
                last + 1
            };
            if id_millis(candidate) > now.saturating_add(self.config.max_skew_ms) {
                self.wait_for_clock(id_millis(candidate))?;
                last = self.shared.last_issued.load(Ordering::SeqCst);
                continue;
            }
            match self.shared.last_issued.compare_exchange_weak(
                last,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break candidate,
                Err(actual) => last = actual,
            }
        };

        // A concurrent stop() may have taken its final mark already
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::GeneratorNotRunning);
        }
        Ok(id)
    }

    /// Stop the flusher and persist the final mark.
    pub fn stop(&self) -> Result<()> {
        let mut flusher = self.flusher.lock();
        let Some(Flusher { shutdown, handle }) = flusher.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::SeqCst);

        let _ = shutdown.send(());
        if handle.join().is_err() {
            error!("Transaction id flusher thread panicked");
        }

        self.shared.flush()?;
        info!(
            "Transaction id generator stopped (mark {})",
            self.shared.last_issued.load(Ordering::SeqCst)
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Last id handed out (or the loaded mark before the first call)
    pub fn last_issued(&self) -> u64 {
        self.shared.last_issued.load(Ordering::SeqCst)
    }

    /// Wait until the wall clock is within `max_skew` of `floor_ms`, for at
    /// most `startup_wait`
    fn wait_for_clock(&self, floor_ms: u64) -> Result<()> {
        let deadline = Instant::now() + self.config.startup_wait();
        loop {
            let now = self.clock.now_millis();
            if now.saturating_add(self.config.max_skew_ms) >= floor_ms {
                if now < floor_ms {
                    warn!(
                        "Wall clock is {} ms behind transaction ids, within tolerance",
                        floor_ms - now
                    );
                }
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::ClockSkewExceeded {
                    persisted_ms: floor_ms,
                    current_ms: now,
                    max_skew_ms: self.config.max_skew_ms,
                });
            }
            debug!(
                "Wall clock {} ms behind transaction ids, waiting",
                floor_ms - now
            );
            thread::sleep(CLOCK_POLL_INTERVAL.min(remaining));
        }
    }
}

impl Drop for TransactionIdGenerator {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Failed to flush transaction mark on drop: {}", e);
        }
    }
}

fn run_flusher(shared: &Shared, signal: &Receiver<()>, interval: Duration) {
    debug!("Transaction id flusher started");
    loop {
        match signal.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                if let Err(e) = shared.flush() {
                    warn!("Failed to flush transaction mark, retrying next tick: {}", e);
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Transaction id flusher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{Durability, StoreOptions};
    use std::collections::HashSet;
    use tempfile::{TempDir, tempdir};

    /// Clock moved by hand
    struct ManualClock(AtomicU64);

    impl ManualClock {
        fn new(millis: u64) -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(millis)))
        }

        fn set(&self, millis: u64) {
            self.0.store(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn open_store() -> (TempDir, Arc<OrderedByteStore>) {
        let dir = tempdir().unwrap();
        let options = StoreOptions {
            durability: Durability::None,
            ..Default::default()
        };
        let store = Arc::new(OrderedByteStore::open(dir.path(), &options).unwrap());
        (dir, store)
    }

    fn config() -> TransactionConfig {
        TransactionConfig {
            max_skew_ms: 2000,
            flush_interval_ms: 20,
            startup_wait_ms: 0,
        }
    }

    #[test]
    fn test_ids_pack_millis_and_counter() {
        let (_dir, store) = open_store();
        let clock = ManualClock::new(1_000);
        let generator = TransactionIdGenerator::with_clock(store, config(), clock.clone());
        generator.start().unwrap();

        let first = generator.next_id().unwrap();
        assert_eq!(first, 1_000 << COUNTER_BITS);
        assert_eq!(generator.next_id().unwrap(), first + 1);
        assert_eq!(generator.next_id().unwrap(), first + 2);

        clock.set(1_001);
        assert_eq!(generator.next_id().unwrap(), 1_001 << COUNTER_BITS);

        // Clock goes backward: keep counting
        clock.set(900);
        assert_eq!(generator.next_id().unwrap(), (1_001 << COUNTER_BITS) + 1);
        generator.stop().unwrap();
    }

    #[test]
    fn test_counter_overflow_carries() {
        let (_dir, store) = open_store();
        let clock = ManualClock::new(5);
        let generator = TransactionIdGenerator::with_clock(store, config(), clock);
        generator.start().unwrap();

        let mut last = 0;
        for _ in 0..(1 << COUNTER_BITS) + 10 {
            let id = generator.next_id().unwrap();
            assert!(id > last);
            last = id;
        }
        assert_eq!(id_millis(last), 6);
    }

    #[test]
    fn test_not_running() {
        let (_dir, store) = open_store();
        let generator = TransactionIdGenerator::with_clock(store, config(), ManualClock::new(1));
        assert!(matches!(generator.next_id(), Err(Error::GeneratorNotRunning)));

        generator.start().unwrap();
        generator.start().unwrap();
        assert!(generator.is_running());
        generator.next_id().unwrap();

        generator.stop().unwrap();
        generator.stop().unwrap();
        assert!(matches!(generator.next_id(), Err(Error::GeneratorNotRunning)));
    }

    #[test]
    fn test_monotonic_across_restart_with_backward_clock() {
        let (_dir, store) = open_store();
        let clock = ManualClock::new(100_000);

        let generator =
            TransactionIdGenerator::with_clock(store.clone(), config(), clock.clone());
        generator.start().unwrap();
        let mut last = 0;
        for _ in 0..100 {
            last = generator.next_id().unwrap();
        }
        generator.stop().unwrap();
        assert_eq!(load_mark(&store).unwrap(), Some(last));

        // Restart with the clock 1.5 s behind, inside the 2 s tolerance
        clock.set(98_500);
        let restarted =
            TransactionIdGenerator::with_clock(store.clone(), config(), clock.clone());
        restarted.start().unwrap();
        assert_eq!(restarted.last_issued(), last);
        let first = restarted.next_id().unwrap();
        assert!(first > last, "{first} <= {last}");
    }

    #[test]
    fn test_clock_skew_exceeded() {
        let (_dir, store) = open_store();
        store
            .put(LAST_TIMESTAMP, &(50_000u64 << COUNTER_BITS).to_be_bytes())
            .unwrap();

        let clock = ManualClock::new(40_000);
        let generator = TransactionIdGenerator::with_clock(store, config(), clock);
        let err = generator.start().unwrap_err();
        assert!(matches!(
            err,
            Error::ClockSkewExceeded {
                persisted_ms: 50_000,
                current_ms: 40_000,
                max_skew_ms: 2000
            }
        ));
        assert!(!generator.is_running());
    }

    #[test]
    fn test_startup_waits_for_lagging_clock() {
        let (_dir, store) = open_store();
        store
            .put(LAST_TIMESTAMP, &(50_000u64 << COUNTER_BITS).to_be_bytes())
            .unwrap();

        let clock = ManualClock::new(40_000);
        let config = TransactionConfig {
            startup_wait_ms: 10_000,
            ..config()
        };
        let generator = TransactionIdGenerator::with_clock(store, config, clock.clone());

        let catch_up = {
            let clock = Arc::clone(&clock);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(250));
                clock.set(49_000);
            })
        };
        generator.start().unwrap();
        catch_up.join().unwrap();
        assert!(generator.next_id().unwrap() > 50_000 << COUNTER_BITS);
    }

    #[test]
    fn test_running_skew_exceeded() {
        let (_dir, store) = open_store();
        let clock = ManualClock::new(100_000);
        let generator = TransactionIdGenerator::with_clock(store, config(), clock.clone());
        generator.start().unwrap();
        let first = generator.next_id().unwrap();

        // 1 s back is tolerated
        clock.set(99_000);
        assert_eq!(generator.next_id().unwrap(), first + 1);

        // 10 s back is not, and nothing is handed out
        clock.set(90_000);
        let err = generator.next_id().unwrap_err();
        assert!(matches!(
            err,
            Error::ClockSkewExceeded {
                persisted_ms: 100_000,
                current_ms: 90_000,
                max_skew_ms: 2000
            }
        ));
        assert_eq!(generator.last_issued(), first + 1);

        clock.set(100_000);
        assert_eq!(generator.next_id().unwrap(), first + 2);
    }

    #[test]
    fn test_running_waits_for_lagging_clock() {
        let (_dir, store) = open_store();
        let clock = ManualClock::new(100_000);
        let config = TransactionConfig {
            startup_wait_ms: 10_000,
            ..config()
        };
        let generator = TransactionIdGenerator::with_clock(store, config, clock.clone());
        generator.start().unwrap();
        let first = generator.next_id().unwrap();
        clock.set(90_000);

        let catch_up = {
            let clock = Arc::clone(&clock);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(250));
                clock.set(99_000);
            })
        };
        let started = Instant::now();
        let next = generator.next_id().unwrap();
        catch_up.join().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(next, first + 1);
    }

    /// Marks that fail to persist a fixed number of times
    struct FlakyMarks {
        inner: Arc<OrderedByteStore>,
        failures: AtomicU64,
        attempts: AtomicU64,
    }

    impl MarkStore for FlakyMarks {
        fn read_mark(&self) -> Result<Option<u64>> {
            self.inner.read_mark()
        }

        fn write_mark(&self, mark: u64) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(Error::StorageIo("disk unavailable".to_string()));
            }
            self.inner.write_mark(mark)
        }
    }

    #[test]
    fn test_failed_flush_is_retried() {
        let (_dir, store) = open_store();
        let marks = Arc::new(FlakyMarks {
            inner: Arc::clone(&store),
            failures: AtomicU64::new(3),
            attempts: AtomicU64::new(0),
        });
        let generator = TransactionIdGenerator::new(marks.clone(), config());
        generator.start().unwrap();
        let first = generator.next_id().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while marks.failures.load(Ordering::SeqCst) > 0 {
            assert!(Instant::now() < deadline, "flush was never attempted");
            thread::sleep(Duration::from_millis(10));
        }
        let second = generator.next_id().unwrap();
        assert!(second > first);

        while load_mark(&store).unwrap() != Some(second) {
            assert!(Instant::now() < deadline, "mark was never flushed");
            thread::sleep(Duration::from_millis(10));
        }
        assert!(marks.attempts.load(Ordering::SeqCst) >= 4);
        assert!(generator.is_running());
    }

    #[test]
    fn test_corrupt_mark_is_fatal() {
        let (_dir, store) = open_store();
        store.put(LAST_TIMESTAMP, b"\x01\x02\x03").unwrap();
        let generator = TransactionIdGenerator::with_clock(store, config(), ManualClock::new(1));
        assert!(matches!(generator.start(), Err(Error::CorruptValue(_))));
    }

    #[test]
    fn test_background_flush() {
        let (_dir, store) = open_store();
        let generator = TransactionIdGenerator::new(store.clone(), config());
        generator.start().unwrap();
        let id = generator.next_id().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while load_mark(&store).unwrap() != Some(id) {
            assert!(Instant::now() < deadline, "mark was never flushed");
            thread::sleep(Duration::from_millis(10));
        }
        assert!(generator.is_running());
    }

    #[test]
    fn test_concurrent_ids_are_unique() {
        let (_dir, store) = open_store();
        let generator = Arc::new(TransactionIdGenerator::new(store, config()));
        generator.start().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let generator = Arc::clone(&generator);
                thread::spawn(move || {
                    let deadline = Instant::now() + Duration::from_millis(200);
                    let mut ids = Vec::new();
                    let mut last = 0;
                    while Instant::now() < deadline {
                        let id = generator.next_id().unwrap();
                        assert!(id > last);
                        last = id;
                        ids.push(id);
                    }
                    ids
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        let unique: HashSet<u64> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());
        assert!(generator.last_issued() >= *all.iter().max().unwrap());
    }
}
