use std::time::Duration;

use interop_runs_core::{format_day, QuerySignature, RunsError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::Date;

use crate::{FetchError, RemoteRunSource};

pub const DEFAULT_RUNS_URL: &str = "https://wpt.fyi/api/runs";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Label every queried run must carry besides the channel.
const BRANCH_LABEL: &str = "master";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SourceConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self { base_url: DEFAULT_RUNS_URL.to_string(), timeout_secs: DEFAULT_TIMEOUT_SECS }
    }
}

/// Catalog client issuing one blocking GET per day.
#[derive(Debug, Clone)]
pub struct HttpRunSource {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpRunSource {
    #[must_use]
    pub fn new(config: &SourceConfig) -> Self {
        let agent =
            ureq::AgentBuilder::new().timeout(Duration::from_secs(config.timeout_secs)).build();
        Self { agent, base_url: config.base_url.clone() }
    }
}

/// Query parameters selecting the runs of `day` for `signature`, in the order
/// they are sent.
///
/// # Errors
/// Returns [`RunsError::Config`] when `day` has no successor.
pub fn query_pairs(
    signature: &QuerySignature,
    day: Date,
) -> Result<Vec<(&'static str, String)>, RunsError> {
    let next_day = day
        .next_day()
        .ok_or_else(|| RunsError::Config(format!("no day follows {}", format_day(day))))?;

    let mut pairs = vec![("label", BRANCH_LABEL.to_string()), ("label", signature.channel.clone())];
    pairs.extend(signature.products.iter().map(|product| ("product", product.clone())));
    if signature.aligned {
        pairs.push(("aligned", "true".to_string()));
    }
    if let Some(max_per_day) = signature.max_per_day {
        pairs.push(("max-count", max_per_day.to_string()));
    }
    pairs.push(("from", format_day(day)));
    pairs.push(("to", format_day(next_day)));
    Ok(pairs)
}

fn display_url(base_url: &str, pairs: &[(&str, String)]) -> String {
    let query =
        pairs.iter().map(|(key, value)| format!("{key}={value}")).collect::<Vec<_>>().join("&");
    format!("{base_url}?{query}")
}

impl RemoteRunSource for HttpRunSource {
    fn fetch_day(&self, signature: &QuerySignature, day: Date) -> Result<Vec<Value>, FetchError> {
        let pairs = query_pairs(signature, day)?;
        let url = display_url(&self.base_url, &pairs);
        tracing::info!(url = %url, "fetching runs");

        let request = pairs
            .iter()
            .fold(self.agent.get(&self.base_url), |request, (key, value)| request.query(key, value));
        let response = request.call().map_err(|err| match err {
            ureq::Error::Status(status, _) => FetchError::Status { url: url.clone(), status },
            ureq::Error::Transport(transport) => {
                FetchError::Transport { url: url.clone(), message: transport.to_string() }
            }
        })?;

        response
            .into_json::<Vec<Value>>()
            .map_err(|err| FetchError::Body { url, message: err.to_string() })
    }
}
