use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_TICKER_LEN: usize = 10;

/// A normalized stock symbol (trimmed, upper-cased, 1-10 chars).
///
/// Equality and hashing use the normalized form, so `" infy.ns"` and
/// `"INFY.NS"` are the same ticker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ticker(String);

impl Ticker {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let normalized = raw.trim().to_uppercase();

        if normalized.is_empty() {
            return Err("Ticker symbol cannot be empty".to_string());
        }
        if normalized.chars().count() > MAX_TICKER_LEN {
            return Err(format!(
                "Ticker symbol '{}' exceeds {} characters",
                normalized, MAX_TICKER_LEN
            ));
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Ticker {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ticker::parse(&value)
    }
}

impl From<Ticker> for String {
    fn from(value: Ticker) -> Self {
        value.0
    }
}

/// Parse a list of raw symbols, keeping request order.
pub fn parse_tickers<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Ticker>, String> {
    raw.iter().map(|s| Ticker::parse(s.as_ref())).collect()
}

/// Deterministic fingerprint of a ticker set: sorted normalized symbols
/// serialized as a JSON array. Request order is irrelevant; repeated symbols
/// are kept.
pub fn ticker_fingerprint(tickers: &[Ticker]) -> String {
    let mut symbols: Vec<&str> = tickers.iter().map(Ticker::as_str).collect();
    symbols.sort_unstable();
    serde_json::to_string(&symbols).unwrap_or_else(|_| symbols.join(","))
}

/// Inverse of [`ticker_fingerprint`]; `None` when the stored value is malformed.
pub fn parse_fingerprint(fingerprint: &str) -> Option<Vec<String>> {
    serde_json::from_str(fingerprint).ok()
}
