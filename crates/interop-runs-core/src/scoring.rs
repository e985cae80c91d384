//! Input shapes for the external scorer.
//!
//! The scorer itself is opaque: it receives one [`RunResults`] per run and a
//! [`CategoryTests`] mapping, and returns per-category scores per run. This
//! module is a library boundary for scoring tools; the `interop-runs` binary
//! only fetches and groups runs.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;

use serde::{Deserialize, Serialize};

use crate::RunsError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SubtestResult {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TestResults {
    pub status: String,
    #[serde(default)]
    pub subtests: Vec<SubtestResult>,
}

/// Test id to results for a single run.
pub type RunResults = BTreeMap<String, TestResults>;

/// Category name to the test ids scored in that category.
pub type CategoryTests = BTreeMap<String, BTreeSet<String>>;

/// Per-category scores, one value per input run in input order.
pub type CategoryScores = BTreeMap<String, Vec<u64>>;

/// Boundary to the scoring engine.
pub trait ScoreRuns {
    type Error;

    /// # Errors
    /// Implementation defined.
    fn score_runs(
        &self,
        runs: &[RunResults],
        categories: &CategoryTests,
    ) -> Result<CategoryScores, Self::Error>;
}

#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
pub struct Category {
    pub name: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WptReport {
    results: Vec<WptReportTest>,
}

#[derive(Debug, Deserialize)]
struct WptReportTest {
    test: String,
    status: String,
    #[serde(default)]
    subtests: Vec<WptReportSubtest>,
}

#[derive(Debug, Deserialize)]
struct WptReportSubtest {
    name: String,
    status: String,
}

/// Convert a wptreport JSON document into [`RunResults`].
///
/// # Errors
/// Returns [`RunsError::Validation`] when the document is not a wptreport.
pub fn parse_wptreport(body: &str) -> Result<RunResults, RunsError> {
    let report = serde_json::from_str::<WptReport>(body)
        .map_err(|err| RunsError::Validation(format!("invalid wptreport: {err}")))?;

    let results = report.results.into_iter().map(|item| {
        let subtests = item
            .subtests
            .into_iter()
            .map(|subtest| SubtestResult { id: subtest.name, status: subtest.status })
            .collect();
        let mut single = RunResults::new();
        single.insert(item.test, TestResults { status: item.status, subtests });
        single
    });
    Ok(merge_run_results(results))
}

/// Read a wptreport file from disk. Paths ending in `.gz` are decompressed.
///
/// # Errors
/// Returns [`RunsError::Validation`] when the file cannot be read or is not a
/// wptreport.
pub fn load_wptreport(path: &Path) -> Result<RunResults, RunsError> {
    let read_error =
        |err: std::io::Error| RunsError::Validation(format!("cannot read {}: {err}", path.display()));
    let file = File::open(path).map_err(read_error)?;
    let mut body = String::new();
    if path.extension().is_some_and(|extension| extension == "gz") {
        GzDecoder::new(BufReader::new(file)).read_to_string(&mut body).map_err(read_error)?;
    } else {
        BufReader::new(file).read_to_string(&mut body).map_err(read_error)?;
    }
    tracing::debug!(path = %path.display(), "loaded wptreport");
    parse_wptreport(&body)
}

/// Merge partial results of one run (for example one report per chunk).
/// A test reported twice is logged and the later result wins.
pub fn merge_run_results<I>(parts: I) -> RunResults
where
    I: IntoIterator<Item = RunResults>,
{
    let mut merged = RunResults::new();
    for part in parts {
        for (test, results) in part {
            if merged.contains_key(&test) {
                tracing::warn!(test = %test, "duplicate results for test, keeping the later one");
            }
            merged.insert(test, results);
        }
    }
    merged
}

/// Resolve each category's labels to the union of the tests carrying them.
#[must_use]
pub fn tests_by_category(
    categories: &[Category],
    labelled_tests: &BTreeMap<String, BTreeSet<String>>,
) -> CategoryTests {
    categories
        .iter()
        .map(|category| {
            let tests = category
                .labels
                .iter()
                .filter_map(|label| labelled_tests.get(label))
                .flatten()
                .cloned()
                .collect::<BTreeSet<_>>();
            (category.name.clone(), tests)
        })
        .collect()
}
