use std::time::{Duration, Instant};

use interop_runs_cache::{CacheError, DayCache, RunCache};
use interop_runs_core::{
    decode_runs, format_day, FetchConfig, QuerySignature, RevisionIndex, RevisionIndexBuilder,
    RunRecord, RunsError,
};
use serde::Serialize;
use serde_json::Value;
use time::{Date, OffsetDateTime};

mod http;

pub use http::{query_pairs, HttpRunSource, SourceConfig, DEFAULT_RUNS_URL, DEFAULT_TIMEOUT_SECS};

/// Days older than this are treated as complete once cached.
pub const CACHE_TRUST_DAYS: i64 = 3;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Runs(#[from] RunsError),
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("response from {url} is not a JSON array of runs: {message}")]
    Body { url: String, message: String },
    #[error("fetch session exceeded its {0:?} deadline")]
    Deadline(Duration),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Source of raw catalog records, one calendar day at a time.
pub trait RemoteRunSource {
    /// Raw records for runs of `day` matching `signature`.
    ///
    /// # Errors
    /// Returns [`FetchError`] on any transport, status, or body failure. No
    /// retries are attempted.
    fn fetch_day(&self, signature: &QuerySignature, day: Date) -> Result<Vec<Value>, FetchError>;
}

/// Decides which cached days can be reused.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FreshnessPolicy {
    cutoff: OffsetDateTime,
}

impl FreshnessPolicy {
    #[must_use]
    pub fn from_now(now: OffsetDateTime) -> Self {
        Self { cutoff: now - time::Duration::days(CACHE_TRUST_DAYS) }
    }

    #[must_use]
    pub fn now() -> Self {
        Self::from_now(OffsetDateTime::now_utc())
    }

    #[must_use]
    pub fn cutoff(&self) -> OffsetDateTime {
        self.cutoff
    }

    /// True when `day` starts strictly before the cutoff. Such days may still
    /// be missing from the cache, but a cached copy is never refreshed.
    #[must_use]
    pub fn is_historical(&self, day: Date) -> bool {
        day.midnight().assume_utc() < self.cutoff
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Eq, PartialEq)]
pub struct FetchStats {
    pub cached_days: usize,
    pub fetched_days: usize,
    pub runs: usize,
}

#[derive(Debug, Clone)]
pub struct FetchedRuns {
    pub index: RevisionIndex,
    pub stats: FetchStats,
}

/// Walks a day range, reusing trusted cache entries and fetching the rest.
#[derive(Debug)]
pub struct FetchOrchestrator<'a, S: ?Sized> {
    source: &'a S,
    policy: FreshnessPolicy,
    deadline: Option<Duration>,
}

impl<'a, S> FetchOrchestrator<'a, S>
where
    S: RemoteRunSource + ?Sized,
{
    #[must_use]
    pub fn new(source: &'a S, policy: FreshnessPolicy) -> Self {
        Self { source, policy, deadline: None }
    }

    /// Fail the session once `deadline` has elapsed before a remote fetch.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Fetch every day of `config` and group the runs by revision. Days are
    /// processed in ascending order; each remote result replaces the cache
    /// entry for its day before the next day starts.
    ///
    /// # Errors
    /// Returns [`FetchError`] for invalid configuration, the first remote
    /// failure, a malformed fetched record, or an exceeded deadline. Days
    /// fetched before the failure stay in `cache`.
    pub fn fetch_runs(
        &self,
        config: &FetchConfig,
        cache: &mut DayCache,
    ) -> Result<FetchedRuns, FetchError> {
        config.validate()?;
        let started = Instant::now();
        let mut builder = RevisionIndexBuilder::new();
        let mut stats = FetchStats::default();

        for day in config.days() {
            let runs = if let Some(runs) = self.trusted_cached_runs(cache, day) {
                stats.cached_days += 1;
                runs
            } else {
                self.check_deadline(started)?;
                let raw = self.source.fetch_day(&config.signature, day)?;
                let runs = decode_runs(&raw)?;
                cache.set(day, raw);
                stats.fetched_days += 1;
                runs
            };
            stats.runs += runs.len();
            builder.add_runs(runs);
        }

        let index = builder.finish();
        tracing::info!(
            revisions = index.len(),
            runs = stats.runs,
            cached_days = stats.cached_days,
            fetched_days = stats.fetched_days,
            "fetched runs"
        );
        Ok(FetchedRuns { index, stats })
    }

    /// [`Self::fetch_runs`] inside a cache session for `store`. The cache file
    /// is written back whether or not the fetch succeeds.
    ///
    /// # Errors
    /// Returns the fetch error if any; otherwise [`FetchError::Cache`] when
    /// the cache cannot be written.
    pub fn fetch_with_cache(
        &self,
        config: &FetchConfig,
        store: &RunCache,
    ) -> Result<FetchedRuns, FetchError> {
        let mut session = store.open();
        let fetched = self.fetch_runs(config, &mut session)?;
        session.close()?;
        Ok(fetched)
    }

    fn trusted_cached_runs(&self, cache: &DayCache, day: Date) -> Option<Vec<RunRecord>> {
        if !self.policy.is_historical(day) {
            tracing::debug!(day = %format_day(day), "day may still receive runs, refreshing");
            return None;
        }
        let raw = cache.get(day)?;
        match decode_runs(raw) {
            Ok(runs) => {
                tracing::debug!(day = %format_day(day), "using cached runs");
                Some(runs)
            }
            Err(err) => {
                tracing::warn!(day = %format_day(day), error = %err, "cached runs unusable, refetching");
                None
            }
        }
    }

    fn check_deadline(&self, started: Instant) -> Result<(), FetchError> {
        match self.deadline {
            Some(deadline) if started.elapsed() >= deadline => Err(FetchError::Deadline(deadline)),
            _ => Ok(()),
        }
    }
}
