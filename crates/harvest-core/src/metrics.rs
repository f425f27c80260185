use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use crate::models::MetricsSnapshot;

/// Run-scoped counters shared by every job of the run.
#[derive(Debug, Default)]
pub struct RunMetrics {
    fetched: AtomicU64,
    cache_skipped: AtomicU64,
    robots_denied: AtomicU64,
    retries: AtomicU64,
    extracted: AtomicU64,
    validated: AtomicU64,
    quarantined: AtomicU64,
    merged: AtomicU64,
    deduped: AtomicU64,
    out_of_window: AtomicU64,
    pages: AtomicU64,
    reasons: Mutex<BTreeMap<String, u64>>,
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(add_fetched, fetched, fetched);
    counter!(add_cache_skipped, cache_skipped, cache_skipped);
    counter!(add_robots_denied, robots_denied, robots_denied);
    counter!(add_retries, retries, retries);
    counter!(add_extracted, extracted, extracted);
    counter!(add_validated, validated, validated);
    counter!(add_merged, merged, merged);
    counter!(add_deduped, deduped, deduped);
    counter!(add_out_of_window, out_of_window, out_of_window);
    counter!(add_pages, pages, pages);

    /// Count one quarantined record under each of its reason codes.
    pub fn record_quarantine(&self, reasons: &[String]) {
        self.quarantined.fetch_add(1, Ordering::Relaxed);
        let mut histogram = match self.reasons.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        for reason in reasons {
            *histogram.entry(reason.clone()).or_insert(0) += 1;
        }
    }

    pub fn quarantined(&self) -> u64 {
        self.quarantined.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, run_id: &str) -> MetricsSnapshot {
        let reasons = match self.reasons.lock() {
            Ok(h) => h.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        MetricsSnapshot {
            run_id: run_id.to_string(),
            generated_at: Some(Utc::now()),
            fetched: self.fetched(),
            cache_skipped: self.cache_skipped(),
            robots_denied: self.robots_denied(),
            retries: self.retries(),
            extracted: self.extracted(),
            validated: self.validated(),
            quarantined: self.quarantined(),
            merged: self.merged(),
            deduped: self.deduped(),
            out_of_window: self.out_of_window(),
            quarantine_reasons: reasons,
        }
    }

    /// Stage counters as recorded in the manifest.
    pub fn counts_by_stage(&self) -> BTreeMap<String, u64> {
        BTreeMap::from([
            ("pages".to_string(), self.pages()),
            ("fetched".to_string(), self.fetched()),
            ("cache_skipped".to_string(), self.cache_skipped()),
            ("robots_denied".to_string(), self.robots_denied()),
            ("extracted".to_string(), self.extracted()),
            ("validated".to_string(), self.validated()),
            ("quarantined".to_string(), self.quarantined()),
            ("merged".to_string(), self.merged()),
            ("deduped".to_string(), self.deduped()),
        ])
    }
}
