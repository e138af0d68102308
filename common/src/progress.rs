use tracing::{Level, event, instrument};

fn lock_ignoring_poison<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Debug)]
pub struct TlsCounter {
    // mutex is used primarily from one thread, so it's not a bottleneck
    count: thread_local::ThreadLocal<std::sync::Mutex<u64>>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        let mutex = self.count.get_or(|| std::sync::Mutex::new(0));
        *lock_ignoring_poison(mutex) += value;
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count
            .iter()
            .fold(0, |x, y| x + *lock_ignoring_poison(y))
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts operations that were started and finished, the difference is what is in flight.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    started: TlsCounter,
    finished: TlsCounter,
}

pub struct ProgressGuard<'a> {
    progress: &'a ProgressCounter,
}

impl<'a> ProgressGuard<'a> {
    pub fn new(progress: &'a ProgressCounter) -> Self {
        progress.started.inc();
        Self { progress }
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.progress.finished.inc();
    }
}

pub struct Status {
    pub started: u64,
    pub finished: u64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(&self) -> ProgressGuard<'_> {
        ProgressGuard::new(self)
    }

    #[instrument(skip(self))]
    pub fn get(&self) -> Status {
        let mut status = Status {
            started: self.started.get(),
            finished: self.finished.get(),
        };
        if status.finished > status.started {
            event!(
                Level::DEBUG,
                "Progress inversion - started: {}, finished {}",
                status.started,
                status.finished
            );
            status.started = status.finished;
        }
        status
    }
}

/// Process-wide transfer counters, updated by sender and receiver workers.
#[derive(Debug)]
pub struct Progress {
    pub chunks_in_flight: ProgressCounter,
    pub chunks_verified: TlsCounter,
    pub bytes_verified: TlsCounter,
    pub chunks_resumed: TlsCounter,
    pub bytes_resumed: TlsCounter,
    pub chunks_retried: TlsCounter,
    pub chunks_rejected: TlsCounter,
    pub streams_retired: TlsCounter,
    pub reconnects: TlsCounter,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            chunks_in_flight: Default::default(),
            chunks_verified: Default::default(),
            bytes_verified: Default::default(),
            chunks_resumed: Default::default(),
            bytes_resumed: Default::default(),
            chunks_retried: Default::default(),
            chunks_rejected: Default::default(),
            streams_retired: Default::default(),
            reconnects: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_chunks: u64,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_chunks: progress.chunks_verified.get(),
            last_bytes: progress.bytes_verified.get(),
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> String {
        let time_now = std::time::Instant::now();
        let in_flight = self.progress.chunks_in_flight.get();
        let total_duration_secs = self.progress.get_duration().as_secs_f64().max(f64::EPSILON);
        let curr_duration_secs = (time_now - self.last_update)
            .as_secs_f64()
            .max(f64::EPSILON);
        let chunks = self.progress.chunks_verified.get();
        let average_chunk_rate = chunks as f64 / total_duration_secs;
        let current_chunk_rate =
            chunks.saturating_sub(self.last_chunks) as f64 / curr_duration_secs;
        let bytes = self.progress.bytes_verified.get();
        let average_bytes_rate = bytes as f64 / total_duration_secs;
        let current_bytes_rate = bytes.saturating_sub(self.last_bytes) as f64 / curr_duration_secs;
        self.last_chunks = chunks;
        self.last_bytes = bytes;
        self.last_update = time_now;
        format!(
            "---------------------\n\
            CHUNKS:\n\
            in flight: {:>10}\n\
            verified:  {:>10}\n\
            average:   {:>10.2} chunks/s\n\
            current:   {:>10.2} chunks/s\n\
            -----------------------\n\
            BYTES:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            total:   {:>10}\n\
            -----------------------\n\
            RECOVERY:\n\
            resumed chunks:  {:>10}\n\
            retried chunks:  {:>10}\n\
            rejected chunks: {:>10}\n\
            retired streams: {:>10}\n\
            reconnects:      {:>10}",
            in_flight.started - in_flight.finished,
            chunks,
            average_chunk_rate,
            current_chunk_rate,
            bytesize::ByteSize(average_bytes_rate as u64),
            bytesize::ByteSize(current_bytes_rate as u64),
            bytesize::ByteSize(bytes),
            self.progress.chunks_resumed.get(),
            self.progress.chunks_retried.get(),
            self.progress.chunks_rejected.get(),
            self.progress.streams_retired.get(),
            self.progress.reconnects.get(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn basic_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        for _ in 0..10 {
            tls_counter.inc();
        }
        assert!(tls_counter.get() == 10);
        Ok(())
    }

    #[test]
    fn threaded_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        std::thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        tls_counter.inc();
                    }
                });
            }
        });
        assert!(tls_counter.get() == 1000);
        Ok(())
    }

    #[test]
    fn guard_tracks_in_flight() -> Result<()> {
        let counter = ProgressCounter::new();
        {
            let _guard = counter.guard();
            let status = counter.get();
            assert_eq!(status.started - status.finished, 1);
        }
        let status = counter.get();
        assert_eq!(status.started, status.finished);
        Ok(())
    }

    #[test]
    fn printer_reports_verified_totals() -> Result<()> {
        let progress = Progress::new();
        progress.chunks_verified.add(3);
        progress.bytes_verified.add(3 * 1024);
        progress.streams_retired.inc();
        let mut printer = ProgressPrinter::new(&progress);
        let text = printer.print();
        let value_of = |label: &str| {
            text.lines()
                .find(|line| line.starts_with(label))
                .and_then(|line| line.split_whitespace().last())
                .map(str::to_string)
        };
        assert_eq!(value_of("verified:").as_deref(), Some("3"), "{text}");
        assert_eq!(value_of("retired streams:").as_deref(), Some("1"), "{text}");
        Ok(())
    }
}
