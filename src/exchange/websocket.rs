//! CLOB WebSocket book stream.
//!
//! A single connection attempt per [`BookStream::run`] call; reconnection and
//! backoff are the caller's job.

use crate::errors::ClientError;
use crate::exchange::types::*;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Subscription request sent after connecting.
#[derive(Debug, Serialize)]
pub struct SubscribeMessage {
    pub assets_ids: Vec<String>,
    #[serde(rename = "type")]
    pub msg_type: String,
}

impl SubscribeMessage {
    pub fn for_market(market: &MarketInfo) -> Self {
        Self {
            assets_ids: vec![market.yes_token_id.clone(), market.no_token_id.clone()],
            msg_type: "market".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PriceChange {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub side: OrderSide,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
}

/// Every message the stream may deliver. Anything else is a decode error.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// Full snapshot of one token's book
    Book {
        asset_id: String,
        #[serde(default)]
        bids: Vec<BookLevel>,
        #[serde(default)]
        asks: Vec<BookLevel>,
    },
    /// Incremental level updates
    PriceChange {
        asset_id: String,
        changes: Vec<PriceChange>,
    },
    TickSizeChange {
        asset_id: String,
        #[serde(with = "rust_decimal::serde::str")]
        new_tick_size: Decimal,
    },
    LastTradePrice {
        asset_id: String,
        #[serde(with = "rust_decimal::serde::str")]
        price: Decimal,
    },
}

impl StreamMessage {
    /// Decode a text frame, which may carry one message or an array of them.
    pub fn parse_frame(text: &str) -> Result<Vec<StreamMessage>, ClientError> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Frame {
            Many(Vec<StreamMessage>),
            One(StreamMessage),
        }

        match serde_json::from_str::<Frame>(text)? {
            Frame::Many(messages) => Ok(messages),
            Frame::One(message) => Ok(vec![message]),
        }
    }

    pub fn asset_id(&self) -> &str {
        match self {
            StreamMessage::Book { asset_id, .. }
            | StreamMessage::PriceChange { asset_id, .. }
            | StreamMessage::TickSizeChange { asset_id, .. }
            | StreamMessage::LastTradePrice { asset_id, .. } => asset_id,
        }
    }
}

/// Local book for one market, maintained from stream messages.
#[derive(Debug, Clone)]
pub struct LocalBook {
    yes_token_id: String,
    no_token_id: String,
    book: OrderBook,
    last_trade: Option<Decimal>,
}

impl LocalBook {
    pub fn new(market: &MarketInfo) -> Self {
        Self {
            yes_token_id: market.yes_token_id.clone(),
            no_token_id: market.no_token_id.clone(),
            book: OrderBook::new(SideBook::default(), SideBook::default()),
            last_trade: None,
        }
    }

    fn outcome_for(&self, asset_id: &str) -> Option<Outcome> {
        if asset_id == self.yes_token_id {
            Some(Outcome::Yes)
        } else if asset_id == self.no_token_id {
            Some(Outcome::No)
        } else {
            None
        }
    }

    /// Apply one message. Returns true when the book levels changed.
    pub fn apply(&mut self, message: StreamMessage) -> bool {
        let Some(outcome) = self.outcome_for(message.asset_id()) else {
            debug!(asset_id = message.asset_id(), "Ignoring message for foreign asset");
            return false;
        };

        match message {
            StreamMessage::Book { bids, asks, .. } => {
                *self.book.side_mut(outcome) = SideBook::from_levels(bids, asks);
            }
            StreamMessage::PriceChange { changes, .. } => {
                let side = self.book.side_mut(outcome);
                for change in changes {
                    side.apply_change(change.side, change.price, change.size);
                }
            }
            StreamMessage::TickSizeChange { new_tick_size, .. } => {
                info!(%outcome, %new_tick_size, "Tick size changed");
                return false;
            }
            StreamMessage::LastTradePrice { price, .. } => {
                self.last_trade = Some(price);
                return false;
            }
        }

        self.book.timestamp = Utc::now();
        true
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    pub fn last_trade(&self) -> Option<Decimal> {
        self.last_trade
    }
}

/// WebSocket reader publishing the latest book for one market.
pub struct BookStream {
    ws_url: String,
    market: MarketInfo,
}

impl BookStream {
    pub fn new(ws_url: impl Into<String>, market: MarketInfo) -> Self {
        Self {
            ws_url: ws_url.into(),
            market,
        }
    }

    /// Connect, subscribe and publish book updates until the server closes
    /// the connection, an error occurs, or `shutdown` flips to true.
    pub async fn run(
        &self,
        books: &watch::Sender<Option<OrderBook>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ClientError> {
        info!(url = %self.ws_url, market_id = %self.market.market_id, "📡 [STREAM] Connecting");

        let (ws_stream, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = serde_json::to_string(&SubscribeMessage::for_market(&self.market))?;
        write
            .send(Message::Text(subscribe.into()))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let mut local = LocalBook::new(&self.market);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("📡 [STREAM] Shutdown requested");
                        return Ok(());
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => match StreamMessage::parse_frame(text.as_str()) {
                        Ok(messages) => {
                            let mut changed = false;
                            for message in messages {
                                changed |= local.apply(message);
                            }
                            if changed {
                                books.send_replace(Some(local.book().clone()));
                            }
                        }
                        Err(e) => warn!(error = %e, "Dropping undecodable stream frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!("📡 [STREAM] Closed by server");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(ClientError::Transport(e.to_string())),
                },
            }
        }
    }
}
