//! Bookkeeping for the most recent reload.
use std::time::{SystemTime, UNIX_EPOCH};

/// The record of one reload operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Wall-clock start, in milliseconds since the Unix epoch.
    pub start_epoch: i64,
    /// Wall-clock end, in milliseconds since the Unix epoch. Zero while a reload is running.
    pub end_epoch: i64,
    pub loaded_library: String,
    pub rebound_symbols: usize,
    pub successful: bool,
}

/// Holds the current [Stats] record. The lock covers each individual access, never a whole
/// reload, so readers on other threads only ever wait for a copy.
#[derive(Debug, Default)]
pub struct StatsCollector {
    current: spin::Mutex<Stats>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a new record, replacing the previous one.
    pub fn register_start(&self, epoch: i64) {
        *self.current.lock() = Stats {
            start_epoch: epoch,
            ..Default::default()
        };
    }

    pub fn register_end(&self, epoch: i64) {
        self.current.lock().end_epoch = epoch;
    }

    pub fn register_loaded_object(&self, path: &str) {
        self.current.lock().loaded_library = path.to_string();
    }

    pub fn register_rebound_symbols(&self, count: usize) {
        self.current.lock().rebound_symbols = count;
    }

    pub fn register_successful(&self, successful: bool) {
        self.current.lock().successful = successful;
    }

    /// A snapshot of the current record.
    pub fn current(&self) -> Stats {
        self.current.lock().clone()
    }
}

/// Milliseconds since the Unix epoch, as recorded in [Stats].
pub fn current_epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn start_replaces_the_record() {
        let stats = StatsCollector::new();
        stats.register_start(10);
        stats.register_loaded_object("/tmp/a.o");
        stats.register_rebound_symbols(4);
        stats.register_end(20);
        stats.register_successful(true);
        assert_eq!(
            stats.current(),
            Stats {
                start_epoch: 10,
                end_epoch: 20,
                loaded_library: "/tmp/a.o".into(),
                rebound_symbols: 4,
                successful: true,
            }
        );

        stats.register_start(30);
        let snap = stats.current();
        assert_eq!(snap.start_epoch, 30);
        assert_eq!(snap.end_epoch, 0);
        assert!(snap.loaded_library.is_empty());
        assert!(!snap.successful);
    }

    #[test]
    fn snapshots_from_other_threads() {
        let stats = Arc::new(StatsCollector::new());
        stats.register_start(1);
        let reader = {
            let stats = stats.clone();
            std::thread::spawn(move || stats.current())
        };
        assert_eq!(reader.join().unwrap().start_epoch, 1);
    }

    #[test]
    fn epoch_is_after_2020() {
        assert!(current_epoch_millis() > 1_577_836_800_000);
    }
}
