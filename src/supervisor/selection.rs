//! Market selection for a new session.

use crate::config::MarketSelectionConfig;
use crate::exchange::MarketInfo;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Pick the market to trade.
///
/// Keywords are tried in configured order; within a keyword the soonest
/// expiring open market whose time to expiry falls inside the window wins.
pub fn select_market(
    markets: &[MarketInfo],
    config: &MarketSelectionConfig,
    now: DateTime<Utc>,
) -> Option<MarketInfo> {
    let min_secs = config.min_minutes_to_expiry * 60;
    let max_secs = config.max_minutes_to_expiry * 60;

    let in_window = |m: &&MarketInfo| {
        let secs = m.seconds_to_expiration(now);
        m.active && !m.closed && secs >= min_secs && secs <= max_secs
    };

    let keywords: Vec<String> = if config.keywords.is_empty() {
        vec![String::new()]
    } else {
        config.keywords.iter().map(|k| k.to_uppercase()).collect()
    };

    for keyword in &keywords {
        let mut matching: Vec<&MarketInfo> = markets
            .iter()
            .filter(|m| m.question.to_uppercase().contains(keyword.as_str()))
            .filter(in_window)
            .collect();
        matching.sort_by_key(|m| m.expiration);

        if let Some(market) = matching.first() {
            info!(
                market_id = %market.market_id,
                question = %market.question,
                minutes_to_expiry = market.seconds_to_expiration(now) / 60,
                "🎯 Market selected"
            );
            return Some((*market).clone());
        }
        debug!(%keyword, "No market in the expiry window");
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::market_expiring_in;

    fn config() -> MarketSelectionConfig {
        MarketSelectionConfig {
            keywords: vec!["BTC".into(), "ETH".into()],
            min_minutes_to_expiry: 10,
            max_minutes_to_expiry: 15,
        }
    }

    fn market(id: &str, question: &str, minutes: i64) -> MarketInfo {
        MarketInfo {
            market_id: id.into(),
            question: question.into(),
            ..market_expiring_in(minutes * 60)
        }
    }

    #[test]
    fn test_soonest_market_inside_window_wins() {
        let now = Utc::now();
        let markets = vec![
            market("late", "BTC up at 12:30?", 14),
            market("soon", "BTC up at 12:15?", 11),
            market("too-soon", "BTC up at 12:05?", 3),
            market("too-late", "BTC up at 13:00?", 45),
        ];
        let selected = select_market(&markets, &config(), now).unwrap();
        assert_eq!(selected.market_id, "soon");
    }

    #[test]
    fn test_keyword_priority_and_closed_markets() {
        let now = Utc::now();
        let mut closed = market("btc-closed", "BTC up at 12:15?", 11);
        closed.closed = true;
        let markets = vec![closed, market("eth", "ETH up at 12:15?", 12)];

        let selected = select_market(&markets, &config(), now).unwrap();
        assert_eq!(selected.market_id, "eth");
    }

    #[test]
    fn test_nothing_eligible() {
        let now = Utc::now();
        let markets = vec![market("sol", "SOL up at 12:15?", 12)];
        assert!(select_market(&markets, &config(), now).is_none());
    }
}
