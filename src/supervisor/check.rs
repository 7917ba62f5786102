//! Connectivity check run before trading.

use super::selection::select_market;
use crate::config::Config;
use crate::errors::{ClientError, ControlError};
use crate::exchange::{MarketClient, MarketInfo, OrderBook};
use chrono::Utc;
use tracing::info;

/// What the venue answered.
#[derive(Debug, Clone)]
pub struct ConnectionReport {
    pub markets_listed: usize,
    /// Market the book was fetched for: the one a session would pick, else
    /// the first listed.
    pub market: Option<MarketInfo>,
    pub book: Option<OrderBook>,
    /// Whether `market` is inside the configured expiry window.
    pub tradable: bool,
}

/// List markets and fetch one book, each under the data timeout.
pub async fn check_connection(
    client: &dyn MarketClient,
    config: &Config,
) -> Result<ConnectionReport, ControlError> {
    let timeout = config.execution.data_timeout();

    let markets = tokio::time::timeout(timeout, client.list_markets(&config.market.keywords))
        .await
        .map_err(|_| ClientError::Timeout(timeout))??;

    let selected = select_market(&markets, &config.market, Utc::now());
    let tradable = selected.is_some();
    let market = selected.or_else(|| markets.first().cloned());

    let book = match &market {
        Some(market) => Some(
            tokio::time::timeout(timeout, client.get_order_book(market))
                .await
                .map_err(|_| ClientError::Timeout(timeout))??,
        ),
        None => None,
    };

    info!(markets = markets.len(), tradable, "🔌 Connectivity check passed");
    Ok(ConnectionReport {
        markets_listed: markets.len(),
        market,
        book,
        tradable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MockMarketClient, Outcome, PaperClient};
    use crate::test_support::{market_expiring_in, simple_book};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_lists_markets_and_fetches_book() {
        let paper = PaperClient::new();
        paper.set_markets(vec![market_expiring_in(12 * 60)]).await;
        paper
            .set_book(simple_book(dec!(0.45), dec!(0.47), dec!(0.48), dec!(0.50), dec!(100)))
            .await;

        let report = check_connection(&paper, &Config::default()).await.unwrap();

        assert_eq!(report.markets_listed, 1);
        assert!(report.tradable);
        assert_eq!(report.book.unwrap().best_ask(Outcome::No), Some(dec!(0.50)));
    }

    #[tokio::test]
    async fn test_market_outside_window_still_fetches_book() {
        let paper = PaperClient::new();
        paper.set_markets(vec![market_expiring_in(60 * 60)]).await;
        paper
            .set_book(simple_book(dec!(0.45), dec!(0.47), dec!(0.48), dec!(0.50), dec!(100)))
            .await;

        let report = check_connection(&paper, &Config::default()).await.unwrap();

        assert!(!report.tradable);
        assert!(report.market.is_some());
        assert!(report.book.is_some());
    }

    #[tokio::test]
    async fn test_transport_failure_surfaces() {
        let mut client = MockMarketClient::new();
        client
            .expect_list_markets()
            .returning(|_| Err(ClientError::Transport("connection refused".into())));

        let err = check_connection(&client, &Config::default()).await.unwrap_err();

        assert!(matches!(err, ControlError::Client(ClientError::Transport(_))));
    }
}
