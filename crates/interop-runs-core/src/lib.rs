use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use time::{Date, OffsetDateTime};

pub mod config;
pub mod scoring;

pub use config::{FetchConfig, QuerySignature, KNOWN_CHANNELS, KNOWN_PRODUCTS};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RunsError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("malformed run record {record}: {message}")]
    Decode { record: String, message: String },
}

/// Format a calendar day as `YYYY-MM-DD`, the form used for cache keys and
/// remote query bounds.
#[must_use]
pub fn format_day(day: Date) -> String {
    format!("{:04}-{:02}-{:02}", day.year(), u8::from(day.month()), day.day())
}

/// Parse a `YYYY-MM-DD` calendar day.
///
/// # Errors
/// Returns [`RunsError::Config`] when `value` is not a valid calendar day.
pub fn parse_day(value: &str) -> Result<Date, RunsError> {
    Date::parse(value, time::macros::format_description!("[year]-[month]-[day]"))
        .map_err(|err| RunsError::Config(format!("invalid day `{value}`: {err}")))
}

/// One product's test execution for one revision, as published by the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    #[serde(rename = "id")]
    pub run_id: u64,
    #[serde(rename = "browser_name")]
    pub product: String,
    #[serde(rename = "browser_version")]
    pub product_version: String,
    #[serde(rename = "os_name")]
    pub platform: String,
    #[serde(rename = "os_version")]
    pub platform_version: String,
    pub revision: String,
    #[serde(rename = "full_revision_hash")]
    pub full_revision: String,
    pub results_url: String,
    pub raw_results_url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub time_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub time_end: OffsetDateTime,
    pub labels: Vec<String>,
}

impl RunRecord {
    /// Decode one raw catalog object. `position` is the record's offset in the
    /// day's array and only identifies the record when it has no usable `id`.
    ///
    /// # Errors
    /// Returns [`RunsError::Decode`] naming the offending record when a
    /// required field is missing or mistyped, or the revision is empty.
    pub fn from_raw(raw: &Value, position: usize) -> Result<Self, RunsError> {
        let record = serde_json::from_value::<Self>(raw.clone()).map_err(|err| {
            RunsError::Decode { record: describe_raw(raw, position), message: err.to_string() }
        })?;

        if record.full_revision.trim().is_empty() {
            return Err(RunsError::Decode {
                record: describe_raw(raw, position),
                message: "full_revision_hash MUST be non-empty".to_string(),
            });
        }

        Ok(record)
    }
}

fn describe_raw(raw: &Value, position: usize) -> String {
    match raw.get("id").and_then(Value::as_u64) {
        Some(run_id) => format!("id={run_id} (position {position})"),
        None => format!("at position {position}"),
    }
}

/// Decode a day's raw records, failing on the first malformed one.
///
/// # Errors
/// Returns [`RunsError::Decode`] for the first record that does not decode.
pub fn decode_runs(raw: &[Value]) -> Result<Vec<RunRecord>, RunsError> {
    raw.iter().enumerate().map(|(position, value)| RunRecord::from_raw(value, position)).collect()
}

/// All runs observed for one full revision. Never empty.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RevisionGroup {
    revision: String,
    #[serde(with = "time::serde::rfc3339")]
    earliest_start: OffsetDateTime,
    runs: Vec<RunRecord>,
}

impl RevisionGroup {
    #[must_use]
    pub fn new(first: RunRecord) -> Self {
        Self {
            revision: first.full_revision.clone(),
            earliest_start: first.time_start,
            runs: vec![first],
        }
    }

    #[must_use]
    pub fn revision(&self) -> &str {
        &self.revision
    }

    #[must_use]
    pub fn runs(&self) -> &[RunRecord] {
        &self.runs
    }

    #[must_use]
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    #[must_use]
    pub fn earliest_start(&self) -> OffsetDateTime {
        self.earliest_start
    }

    #[must_use]
    pub fn run_ids(&self) -> Vec<u64> {
        self.runs.iter().map(|run| run.run_id).collect()
    }

    #[must_use]
    pub fn products(&self) -> BTreeSet<&str> {
        self.runs.iter().map(|run| run.product.as_str()).collect()
    }

    /// Add a run observed for this revision.
    ///
    /// # Errors
    /// Returns [`RunsError::Validation`] when the run belongs to another revision.
    pub fn push(&mut self, run: RunRecord) -> Result<(), RunsError> {
        if run.full_revision != self.revision {
            return Err(RunsError::Validation(format!(
                "run {} has revision {} but group is {}",
                run.run_id, run.full_revision, self.revision
            )));
        }
        self.push_matching(run);
        Ok(())
    }

    fn push_matching(&mut self, run: RunRecord) {
        // An emptied group has no start of its own left.
        self.earliest_start = if self.runs.is_empty() {
            run.time_start
        } else {
            self.earliest_start.min(run.time_start)
        };
        self.runs.push(run);
    }

    fn absorb(&mut self, other: RevisionGroup) {
        for run in other.runs {
            self.push_matching(run);
        }
    }

    fn remove_run(&mut self, run_id: u64) {
        self.runs.retain(|run| run.run_id != run_id);
        if let Some(earliest) = self.runs.iter().map(|run| run.time_start).min() {
            self.earliest_start = earliest;
        }
    }

    /// True when the distinct products in this group are exactly `required`.
    /// Several runs of one product count once.
    pub fn is_aligned<I, S>(&self, required: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let required =
            required.into_iter().map(|product| product.as_ref().to_string()).collect::<BTreeSet<_>>();
        let present = self.runs.iter().map(|run| run.product.clone()).collect::<BTreeSet<_>>();
        present == required
    }

    /// The first run of each product, in the order of `products`, or `None`
    /// when a product has no run in this group.
    pub fn runs_by_product<S: AsRef<str>>(&self, products: &[S]) -> Option<Vec<&RunRecord>> {
        products
            .iter()
            .map(|product| self.runs.iter().find(|run| run.product == product.as_ref()))
            .collect()
    }
}

impl<'a> IntoIterator for &'a RevisionGroup {
    type Item = &'a RunRecord;
    type IntoIter = std::slice::Iter<'a, RunRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.runs.iter()
    }
}

/// Free-standing form of [`RevisionGroup::is_aligned`].
pub fn is_aligned<I, S>(group: &RevisionGroup, required: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    group.is_aligned(required)
}

/// Revision groups ordered by `earliest_start`, with a revision lookup that is
/// rebuilt whenever the order is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionIndex {
    groups: Vec<RevisionGroup>,
    lookup: HashMap<String, usize>,
}

impl RevisionIndex {
    /// Sort `groups` by `earliest_start` and index them. Ties keep their input
    /// order. Groups sharing a revision are merged into the first of them,
    /// runs in input order.
    #[must_use]
    pub fn new(groups: Vec<RevisionGroup>) -> Self {
        let mut merged: Vec<RevisionGroup> = Vec::with_capacity(groups.len());
        let mut positions: HashMap<String, usize> = HashMap::new();
        for group in groups {
            if let Some(&position) = positions.get(&group.revision) {
                merged[position].absorb(group);
            } else {
                positions.insert(group.revision.clone(), merged.len());
                merged.push(group);
            }
        }
        let mut index = Self { groups: merged, lookup: HashMap::new() };
        index.reindex();
        index
    }

    fn reindex(&mut self) {
        self.groups.sort_by_key(RevisionGroup::earliest_start);
        self.lookup = self
            .groups
            .iter()
            .enumerate()
            .map(|(position, group)| (group.revision.clone(), position))
            .collect();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RevisionGroup> {
        self.groups.iter()
    }

    #[must_use]
    pub fn groups(&self) -> &[RevisionGroup] {
        &self.groups
    }

    #[must_use]
    pub fn contains(&self, revision: &str) -> bool {
        self.lookup.contains_key(revision)
    }

    #[must_use]
    pub fn get(&self, revision: &str) -> Option<&RevisionGroup> {
        self.lookup.get(revision).and_then(|position| self.groups.get(*position))
    }

    #[must_use]
    pub fn revisions(&self) -> Vec<&str> {
        self.groups.iter().map(RevisionGroup::revision).collect()
    }

    /// A new index holding only the groups whose revision is in `revisions`,
    /// in the same chronological order.
    #[must_use]
    pub fn filter_by_revisions(&self, revisions: &BTreeSet<String>) -> Self {
        Self::new(
            self.groups.iter().filter(|group| revisions.contains(&group.revision)).cloned().collect(),
        )
    }

    pub fn aligned<'a, S: AsRef<str>>(
        &'a self,
        products: &'a [S],
    ) -> impl Iterator<Item = &'a RevisionGroup> + 'a {
        self.groups.iter().filter(move |group| group.is_aligned(products))
    }

    /// The chronologically last group aligned on `products`.
    #[must_use]
    pub fn latest_aligned<S: AsRef<str>>(&self, products: &[S]) -> Option<&RevisionGroup> {
        self.groups.iter().rev().find(|group| group.is_aligned(products))
    }

    /// Groups bucketed by the `YYYY-MM-DD` of their earliest start, each
    /// bucket in index order.
    #[must_use]
    pub fn group_by_date(&self) -> BTreeMap<String, Vec<&RevisionGroup>> {
        let mut by_date: BTreeMap<String, Vec<&RevisionGroup>> = BTreeMap::new();
        for group in &self.groups {
            by_date.entry(format_day(group.earliest_start.date())).or_default().push(group);
        }
        by_date
    }

    #[must_use]
    pub fn into_groups(self) -> Vec<RevisionGroup> {
        self.groups
    }
}

impl<'a> IntoIterator for &'a RevisionIndex {
    type Item = &'a RevisionGroup;
    type IntoIter = std::slice::Iter<'a, RevisionGroup>;

    fn into_iter(self) -> Self::IntoIter {
        self.groups.iter()
    }
}

impl Serialize for RevisionIndex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(&self.groups)
    }
}

/// Accumulates runs from successive days into revision groups. Sorting
/// happens once, in [`RevisionIndexBuilder::finish`].
#[derive(Debug, Default)]
pub struct RevisionIndexBuilder {
    groups: Vec<RevisionGroup>,
    positions: HashMap<String, usize>,
    seen_runs: HashMap<u64, String>,
}

impl RevisionIndexBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold decoded runs into their revision groups. A run id seen before is
    /// duplicate data: the earlier record is dropped and the later one kept.
    pub fn add_runs<I>(&mut self, runs: I)
    where
        I: IntoIterator<Item = RunRecord>,
    {
        for run in runs {
            if let Some(previous_revision) = self.seen_runs.get(&run.run_id) {
                tracing::warn!(
                    run_id = run.run_id,
                    previous_revision = %previous_revision,
                    revision = %run.full_revision,
                    "duplicate run id, keeping the later record"
                );
                if let Some(&position) = self.positions.get(previous_revision) {
                    self.groups[position].remove_run(run.run_id);
                }
            }
            self.seen_runs.insert(run.run_id, run.full_revision.clone());

            if let Some(&position) = self.positions.get(&run.full_revision) {
                self.groups[position].push_matching(run);
            } else {
                self.positions.insert(run.full_revision.clone(), self.groups.len());
                self.groups.push(RevisionGroup::new(run));
            }
        }
    }

    /// Decode one day's raw records and fold them in. Nothing is folded when
    /// any record is malformed.
    ///
    /// # Errors
    /// Returns [`RunsError::Decode`] for the first malformed record.
    pub fn add_raw_day(&mut self, raw: &[Value]) -> Result<usize, RunsError> {
        let runs = decode_runs(raw)?;
        let count = runs.len();
        self.add_runs(runs);
        Ok(count)
    }

    #[must_use]
    pub fn finish(self) -> RevisionIndex {
        RevisionIndex::new(self.groups.into_iter().filter(|group| !group.runs.is_empty()).collect())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{json, Value};

    pub fn raw_run(run_id: u64, product: &str, revision: &str, time_start: &str) -> Value {
        json!({
            "id": run_id,
            "browser_name": product,
            "browser_version": "120.0",
            "os_name": "linux",
            "os_version": "22.04",
            "revision": &revision[..revision.len().min(10)],
            "full_revision_hash": revision,
            "results_url": format!("https://storage.example/{run_id}/summary.json.gz"),
            "created_at": time_start,
            "time_start": time_start,
            "time_end": time_start,
            "raw_results_url": format!("https://storage.example/{run_id}/report.json"),
            "labels": ["master", "experimental", product]
        })
    }
}
