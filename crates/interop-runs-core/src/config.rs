use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, Month};

use crate::{format_day, RunsError};

/// Products the catalog publishes runs for.
pub const KNOWN_PRODUCTS: &[&str] = &[
    "android_webview",
    "chrome",
    "chrome_android",
    "chrome_ios",
    "chromium",
    "deno",
    "edge",
    "firefox",
    "firefox_android",
    "flow",
    "ladybird",
    "node.js",
    "safari",
    "servo",
    "uc",
    "webkitgtk",
    "wktr",
];

/// Release tracks accepted as a channel label.
pub const KNOWN_CHANNELS: &[&str] = &["stable", "beta", "dev", "canary", "nightly", "experimental"];

/// Everything that shapes a remote query apart from the day bounds. Two
/// sessions with equal signatures read and write the same cache file.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct QuerySignature {
    pub products: Vec<String>,
    pub channel: String,
    pub aligned: bool,
    pub max_per_day: Option<u32>,
}

impl QuerySignature {
    /// # Errors
    /// Returns [`RunsError::Config`] for an empty, unknown, or repeated
    /// product, an unknown channel, or a zero per-day cap.
    pub fn validate(&self) -> Result<(), RunsError> {
        if self.products.is_empty() {
            return Err(RunsError::Config("at least one product MUST be requested".to_string()));
        }

        let mut seen = BTreeSet::new();
        for product in &self.products {
            if !KNOWN_PRODUCTS.contains(&product.as_str()) {
                return Err(RunsError::Config(format!("unsupported product `{product}`")));
            }
            if !seen.insert(product.as_str()) {
                return Err(RunsError::Config(format!("product `{product}` requested twice")));
            }
        }

        if !KNOWN_CHANNELS.contains(&self.channel.as_str()) {
            return Err(RunsError::Config(format!("unsupported channel `{}`", self.channel)));
        }

        if self.max_per_day == Some(0) {
            return Err(RunsError::Config("max_per_day MUST be >= 1 when set".to_string()));
        }
        Ok(())
    }
}

impl Display for QuerySignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let max_per_day = self.max_per_day.map_or_else(|| "none".to_string(), |max| max.to_string());
        write!(
            f,
            "products:{}-channel:{}-aligned:{}-max_per_day:{}",
            self.products.join("-"),
            self.channel,
            self.aligned,
            max_per_day
        )
    }
}

/// A validated fetch request over the half-open day range `[from, to)`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FetchConfig {
    pub signature: QuerySignature,
    pub from: Date,
    pub to: Date,
}

impl FetchConfig {
    /// Build and validate a request. A missing `from` defaults to January 1 of
    /// `today`'s year and a missing `to` to `today`.
    ///
    /// # Errors
    /// Returns [`RunsError::Config`] for unknown or repeated products, an
    /// unknown channel, a zero per-day cap, or an empty day range.
    pub fn new(
        products: Vec<String>,
        channel: String,
        from: Option<Date>,
        to: Option<Date>,
        aligned: bool,
        max_per_day: Option<u32>,
        today: Date,
    ) -> Result<Self, RunsError> {
        let from = match from {
            Some(from) => from,
            None => start_of_year(today)?,
        };
        let config = Self {
            signature: QuerySignature { products, channel, aligned, max_per_day },
            from,
            to: to.unwrap_or(today),
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`RunsError::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<(), RunsError> {
        self.signature.validate()?;
        if self.from >= self.to {
            return Err(RunsError::Config(format!(
                "day range [{}, {}) is empty",
                format_day(self.from),
                format_day(self.to)
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn products(&self) -> &[String] {
        &self.signature.products
    }

    /// Days of the range in ascending order.
    pub fn days(&self) -> impl Iterator<Item = Date> {
        let to = self.to;
        std::iter::successors(Some(self.from), |day| day.next_day()).take_while(move |day| *day < to)
    }
}

fn start_of_year(today: Date) -> Result<Date, RunsError> {
    Date::from_calendar_date(today.year(), Month::January, 1)
        .map_err(|err| RunsError::Config(format!("cannot derive default start day: {err}")))
}
