use crate::errors::AnalysisError;
use crate::models::{AnalysisResult, IndicatorVote, Signal, Ticker};
use crate::services::indicator_cache::IndicatorResultCache;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

/// Indicator weights used when a request does not name a subset
pub const DEFAULT_INDICATORS: [(&str, f64); 5] = [
    ("rsi", 0.25),
    ("macd", 0.25),
    ("sma", 0.20),
    ("bollinger", 0.15),
    ("volume", 0.15),
];

const BUY_THRESHOLD: f64 = 0.2;
const SELL_THRESHOLD: f64 = -0.2;
/// Largest share of capital suggested for a single position
const MAX_POSITION_FRACTION: f64 = 0.10;

/// Per-ticker analysis consumed by the job engine.
#[async_trait]
pub trait TickerAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        ticker: &Ticker,
        indicators: Option<&[String]>,
        capital: f64,
        demo: bool,
    ) -> Result<AnalysisResult, AnalysisError>;
}

pub fn indicator_weight(name: &str) -> Option<f64> {
    DEFAULT_INDICATORS
        .iter()
        .find(|(indicator, _)| *indicator == name)
        .map(|(_, weight)| *weight)
}

/// Map a weighted score in [-1, 1] to a signal
pub fn classify(score: f64) -> Signal {
    if score > BUY_THRESHOLD {
        Signal::Buy
    } else if score < SELL_THRESHOLD {
        Signal::Sell
    } else {
        Signal::Hold
    }
}

/// Combine indicator votes into the final result for one ticker.
pub fn combine_votes(ticker: &Ticker, votes: Vec<IndicatorVote>, capital: f64, demo: bool) -> AnalysisResult {
    let total_weight: f64 = votes.iter().map(|v| v.weight).sum();
    let score = if total_weight > 0.0 {
        votes.iter().map(|v| v.vote * v.weight).sum::<f64>() / total_weight
    } else {
        0.0
    };

    let signal = classify(score);

    // Share of weight that agrees with the overall direction
    let agreeing: f64 = votes
        .iter()
        .filter(|v| v.vote.signum() == score.signum() && v.vote != 0.0)
        .map(|v| v.weight)
        .sum();
    let confidence = if total_weight > 0.0 {
        agreeing / total_weight
    } else {
        0.0
    };

    let position_size = match signal {
        Signal::Buy => capital * MAX_POSITION_FRACTION * score.abs().min(1.0) * confidence,
        Signal::Sell | Signal::Hold => 0.0,
    };

    AnalysisResult {
        ticker: ticker.to_string(),
        signal,
        score: round_to(score, 4),
        confidence: round_to(confidence, 4),
        votes,
        position_size: round_to(position_size, 2),
        demo,
        analyzed_at: Utc::now(),
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Analyzer backed by deterministic demo data. Every (ticker, indicator)
/// vote is derived from a SHA-256 digest and memoized in the shared
/// indicator cache; live market data is not available here.
pub struct DemoAnalyzer {
    cache: Arc<IndicatorResultCache>,
}

impl DemoAnalyzer {
    pub fn new(cache: Arc<IndicatorResultCache>) -> Self {
        Self { cache }
    }

    fn demo_vote(ticker: &Ticker, indicator: &str) -> f64 {
        let digest = Sha256::digest(format!("{}:{}", ticker, indicator).as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let unit = u64::from_be_bytes(bytes) as f64 / u64::MAX as f64;
        round_to(unit * 2.0 - 1.0, 3)
    }

    fn vote_for(&self, ticker: &Ticker, indicator: &str) -> f64 {
        let params = json!({ "source": "demo" });

        if let Some(cached) = self.cache.get(ticker.as_str(), indicator, &params).and_then(|v| v.as_f64()) {
            return cached;
        }

        let vote = Self::demo_vote(ticker, indicator);
        self.cache
            .set(ticker.as_str(), indicator, &params, Value::from(vote), None);
        vote
    }
}

#[async_trait]
impl TickerAnalyzer for DemoAnalyzer {
    async fn analyze(
        &self,
        ticker: &Ticker,
        indicators: Option<&[String]>,
        capital: f64,
        demo: bool,
    ) -> Result<AnalysisResult, AnalysisError> {
        if !demo {
            return Err(AnalysisError::DataUnavailable(format!(
                "no market data source configured for {}",
                ticker
            )));
        }

        let selected: Vec<(String, f64)> = match indicators {
            None => DEFAULT_INDICATORS
                .iter()
                .map(|(name, weight)| (name.to_string(), *weight))
                .collect(),
            Some(names) => names
                .iter()
                .map(|name| {
                    let name = name.trim().to_lowercase();
                    indicator_weight(&name)
                        .map(|weight| (name.clone(), weight))
                        .ok_or_else(|| AnalysisError::InvalidInput(format!("unknown indicator '{}'", name)))
                })
                .collect::<Result<_, _>>()?,
        };

        let votes: Vec<IndicatorVote> = selected
            .into_iter()
            .map(|(indicator, weight)| IndicatorVote {
                vote: self.vote_for(ticker, &indicator),
                indicator,
                weight,
            })
            .collect();

        let result = combine_votes(ticker, votes, capital, demo);
        debug!(
            "{} → {} (score {:.3}, confidence {:.2})",
            ticker, result.signal, result.score, result.confidence
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker(symbol: &str) -> Ticker {
        Ticker::parse(symbol).unwrap()
    }

    fn vote(indicator: &str, vote: f64, weight: f64) -> IndicatorVote {
        IndicatorVote {
            indicator: indicator.to_string(),
            vote,
            weight,
        }
    }

    #[test]
    fn test_classify_thresholds() {
        assert_eq!(classify(0.5), Signal::Buy);
        assert_eq!(classify(-0.5), Signal::Sell);
        assert_eq!(classify(0.2), Signal::Hold);
        assert_eq!(classify(0.0), Signal::Hold);
    }

    #[test]
    fn test_combine_votes_weighted_buy() {
        let result = combine_votes(
            &ticker("AAPL"),
            vec![vote("rsi", 1.0, 0.5), vote("macd", 0.5, 0.5)],
            100_000.0,
            true,
        );

        assert_eq!(result.signal, Signal::Buy);
        assert_eq!(result.score, 0.75);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.position_size, 7_500.0);
    }

    #[test]
    fn test_combine_votes_sell_has_no_position() {
        let result = combine_votes(
            &ticker("TSLA"),
            vec![vote("rsi", -0.9, 0.5), vote("macd", 0.1, 0.5)],
            50_000.0,
            true,
        );

        assert_eq!(result.signal, Signal::Sell);
        assert_eq!(result.confidence, 0.5);
        assert_eq!(result.position_size, 0.0);
    }

    #[tokio::test]
    async fn test_demo_analysis_is_deterministic_and_cached() {
        let cache = Arc::new(IndicatorResultCache::default());
        let analyzer = DemoAnalyzer::new(cache.clone());

        let first = analyzer.analyze(&ticker("MSFT"), None, 10_000.0, true).await.unwrap();
        let second = analyzer.analyze(&ticker("msft"), None, 10_000.0, true).await.unwrap();

        assert_eq!(first.score, second.score);
        assert_eq!(first.votes, second.votes);
        assert_eq!(first.votes.len(), DEFAULT_INDICATORS.len());
        assert!(first.votes.iter().all(|v| (-1.0..=1.0).contains(&v.vote)));

        let stats = cache.stats();
        assert_eq!(stats.size, DEFAULT_INDICATORS.len());
        assert_eq!(stats.hits, DEFAULT_INDICATORS.len() as u64);
    }

    #[tokio::test]
    async fn test_indicator_subset() {
        let analyzer = DemoAnalyzer::new(Arc::new(IndicatorResultCache::default()));
        let subset = vec!["RSI".to_string(), "macd".to_string()];

        let result = analyzer
            .analyze(&ticker("AAPL"), Some(&subset), 10_000.0, true)
            .await
            .unwrap();

        let names: Vec<&str> = result.votes.iter().map(|v| v.indicator.as_str()).collect();
        assert_eq!(names, vec!["rsi", "macd"]);
    }

    #[tokio::test]
    async fn test_unknown_indicator_and_live_data_are_errors() {
        let analyzer = DemoAnalyzer::new(Arc::new(IndicatorResultCache::default()));
        let subset = vec!["astrology".to_string()];

        assert!(matches!(
            analyzer.analyze(&ticker("AAPL"), Some(&subset), 10_000.0, true).await,
            Err(AnalysisError::InvalidInput(_))
        ));
        assert!(matches!(
            analyzer.analyze(&ticker("AAPL"), None, 10_000.0, false).await,
            Err(AnalysisError::DataUnavailable(_))
        ));
    }
}
