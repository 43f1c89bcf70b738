//! In-run record of seal events already assembled
//!
//! Keyed by (firm, seal date). The set lives only as long as the run: a
//! restart relies on the durable ingestion log for data, not for progress.

use chrono::NaiveDate;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::types::FirmId;

#[derive(Debug, Default)]
pub struct ProcessedFirmSet {
    keys: Mutex<HashSet<(FirmId, NaiveDate)>>,
    processed: AtomicUsize,
}

impl ProcessedFirmSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for processing
    ///
    /// Returns false if it was already claimed. The insert and the counter
    /// increment happen while the lock is held, so two workers can never both
    /// claim the same key.
    pub fn try_mark(&self, key: (FirmId, NaiveDate)) -> bool {
        let mut keys = match self.keys.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !keys.insert(key) {
            return false;
        }
        self.processed.fetch_add(1, Ordering::SeqCst);
        true
    }

    pub fn contains(&self, key: &(FirmId, NaiveDate)) -> bool {
        match self.keys.lock() {
            Ok(keys) => keys.contains(key),
            Err(poisoned) => poisoned.into_inner().contains(key),
        }
    }

    /// Number of keys claimed so far
    pub fn processed_count(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        match self.keys.lock() {
            Ok(keys) => keys.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(firm: &str) -> (FirmId, NaiveDate) {
        (firm.to_string(), NaiveDate::from_ymd_opt(2012, 6, 6).unwrap())
    }

    #[test]
    fn test_mark_once() {
        let set = ProcessedFirmSet::new();
        assert!(set.try_mark(key("shop-a")));
        assert!(!set.try_mark(key("shop-a")));
        assert!(set.try_mark(key("shop-b")));

        assert!(set.contains(&key("shop-a")));
        assert_eq!(set.len(), 2);
        assert_eq!(set.processed_count(), 2);
    }

    #[test]
    fn test_concurrent_claims_are_exclusive() {
        let set = Arc::new(ProcessedFirmSet::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let set = set.clone();
                std::thread::spawn(move || (0..50).filter(|i| set.try_mark(key(&format!("shop-{}", i)))).count())
            })
            .collect();

        let claimed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(claimed, 50);
        assert_eq!(set.processed_count(), 50);
    }
}
