//! CLOB REST API client.

use crate::config::ClobConfig;
use crate::errors::ClientError;
use crate::exchange::traits::MarketClient;
use crate::exchange::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info, instrument, warn};

/// Authenticated client for the CLOB REST endpoints.
pub struct ClobClient {
    http: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
}

// ==================== Wire records ====================

#[derive(Debug, Deserialize)]
struct MarketDto {
    market_id: String,
    #[serde(default)]
    condition_id: String,
    #[serde(default)]
    question: String,
    end_date_iso: String,
    tokens: HashMap<String, String>,
    #[serde(default)]
    strike_price: Option<String>,
    #[serde(default = "default_true")]
    active: bool,
    #[serde(default)]
    closed: bool,
    #[serde(default)]
    min_tick_size: Option<String>,
    #[serde(default)]
    min_size: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct LevelDto {
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct BookDto {
    #[serde(default)]
    bids: Vec<LevelDto>,
    #[serde(default)]
    asks: Vec<LevelDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderRequest<'a> {
    #[serde(rename = "tokenID")]
    token_id: &'a str,
    side: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<String>,
    size: String,
    post_only: bool,
    order_type: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponseDto {
    #[serde(default)]
    success: bool,
    #[serde(rename = "orderID", default)]
    order_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    size_matched: Option<String>,
    #[serde(default)]
    avg_price: Option<String>,
    #[serde(default)]
    error_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CancelResponseDto {
    #[serde(default)]
    canceled: Vec<String>,
}

fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, ClientError> {
    Decimal::from_str(raw.trim())
        .map_err(|e| ClientError::Malformed(format!("{}={:?}: {}", field, raw, e)))
}

impl TryFrom<MarketDto> for MarketInfo {
    type Error = ClientError;

    fn try_from(dto: MarketDto) -> Result<Self, Self::Error> {
        let invalid = |reason: String| ClientError::InvalidMarket {
            market_id: dto.market_id.clone(),
            reason,
        };

        let expiration = DateTime::parse_from_rfc3339(&dto.end_date_iso)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| invalid(format!("bad end_date_iso: {}", e)))?;
        let yes_token_id = dto
            .tokens
            .get("YES")
            .cloned()
            .ok_or_else(|| invalid("missing YES token".into()))?;
        let no_token_id = dto
            .tokens
            .get("NO")
            .cloned()
            .ok_or_else(|| invalid("missing NO token".into()))?;
        let strike_price = dto
            .strike_price
            .as_deref()
            .map(|s| parse_decimal("strike_price", s))
            .transpose()?;
        let tick_size = parse_decimal("min_tick_size", dto.min_tick_size.as_deref().unwrap_or("0.01"))?;
        let min_size = parse_decimal("min_size", dto.min_size.as_deref().unwrap_or("1"))?;

        let market = MarketInfo {
            market_id: dto.market_id.clone(),
            condition_id: dto.condition_id.clone(),
            question: dto.question.clone(),
            expiration,
            yes_token_id,
            no_token_id,
            strike_price,
            tick_size,
            min_size,
            active: dto.active,
            closed: dto.closed,
        };
        market.validate()?;
        Ok(market)
    }
}

fn parse_levels(levels: Vec<LevelDto>) -> Result<Vec<BookLevel>, ClientError> {
    levels
        .into_iter()
        .map(|l| {
            Ok(BookLevel::new(
                parse_decimal("price", &l.price)?,
                parse_decimal("size", &l.size)?,
            ))
        })
        .collect()
}

impl ClobClient {
    /// Create a new client from configuration.
    pub fn new(config: &ClobConfig) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            base_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    /// Hex HMAC-SHA256 over `timestamp + method + path + body`.
    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String, ClientError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ClientError::Transport(format!("invalid signing key: {}", e)))?;
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Send an authenticated request and decode the JSON body.
    async fn signed<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<T, ClientError> {
        let timestamp = Utc::now().timestamp().to_string();
        let body = body.unwrap_or_default();
        let signature = self.sign(&timestamp, method.as_str(), path, &body)?;

        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("X-API-KEY", &self.api_key)
            .header("X-TIMESTAMP", &timestamp)
            .header("X-SIGNATURE", signature);
        if !body.is_empty() {
            request = request
                .header("Content-Type", "application/json")
                .body(body);
        }

        let response = request.send().await?;
        Self::decode(response).await
    }

    async fn decode<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn get_side_book(&self, token_id: &str) -> Result<SideBook, ClientError> {
        let url = format!(
            "{}/book?token_id={}",
            self.base_url,
            urlencoding::encode(token_id)
        );
        let response = self.http.get(&url).send().await?;
        let dto: BookDto = Self::decode(response).await?;
        Ok(SideBook::from_levels(
            parse_levels(dto.bids)?,
            parse_levels(dto.asks)?,
        ))
    }

    fn to_outcome(dto: OrderResponseDto, fallback_price: Decimal) -> Result<OrderOutcome, ClientError> {
        if !dto.success {
            return Ok(OrderOutcome::Rejected {
                reason: dto.error_msg.unwrap_or_else(|| format!("status {}", dto.status)),
            });
        }

        let matched = dto
            .size_matched
            .as_deref()
            .map(|s| parse_decimal("sizeMatched", s))
            .transpose()?
            .unwrap_or(Decimal::ZERO);
        if matched <= Decimal::ZERO {
            return Ok(OrderOutcome::Rejected {
                reason: format!("not filled (status {})", dto.status),
            });
        }

        let price = dto
            .avg_price
            .as_deref()
            .map(|s| parse_decimal("avgPrice", s))
            .transpose()?
            .unwrap_or(fallback_price);

        Ok(OrderOutcome::Filled(Fill {
            order_id: dto.order_id,
            price,
            size: matched,
        }))
    }
}

#[async_trait]
impl MarketClient for ClobClient {
    #[instrument(skip(self))]
    async fn list_markets(&self, keywords: &[String]) -> Result<Vec<MarketInfo>, ClientError> {
        let url = format!("{}/markets?active=true&closed=false", self.base_url);
        let response = self.http.get(&url).send().await?;
        let dtos: Vec<MarketDto> = Self::decode(response).await?;

        let markets: Vec<MarketInfo> = dtos
            .into_iter()
            .filter(|dto| {
                let question = dto.question.to_uppercase();
                keywords.is_empty()
                    || keywords.iter().any(|k| question.contains(&k.to_uppercase()))
            })
            .filter_map(|dto| match MarketInfo::try_from(dto) {
                Ok(market) => Some(market),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed market");
                    None
                }
            })
            .collect();

        debug!(count = markets.len(), "Retrieved markets");
        Ok(markets)
    }

    #[instrument(skip(self, market), fields(market_id = %market.market_id))]
    async fn get_order_book(&self, market: &MarketInfo) -> Result<OrderBook, ClientError> {
        let (yes, no) = tokio::try_join!(
            self.get_side_book(&market.yes_token_id),
            self.get_side_book(&market.no_token_id)
        )?;
        Ok(OrderBook::new(yes, no))
    }

    #[instrument(skip(self))]
    async fn place_limit_order(&self, order: &LimitOrder) -> Result<OrderOutcome, ClientError> {
        let request = OrderRequest {
            token_id: &order.token_id,
            side: order.side.as_str(),
            price: Some(order.price.to_string()),
            size: order.size.to_string(),
            post_only: order.post_only,
            order_type: "GTC",
        };
        let body = serde_json::to_string(&request)?;
        let dto: OrderResponseDto = self.signed(Method::POST, "/order", Some(body)).await?;

        info!(
            order_id = %dto.order_id,
            outcome = %order.outcome,
            side = order.side.as_str(),
            price = %order.price,
            size = %order.size,
            status = %dto.status,
            "Limit order acknowledged"
        );
        Self::to_outcome(dto, order.price)
    }

    #[instrument(skip(self))]
    async fn place_market_order(&self, order: &MarketOrder) -> Result<OrderOutcome, ClientError> {
        let request = OrderRequest {
            token_id: &order.token_id,
            side: order.side.as_str(),
            price: None,
            size: order.size.to_string(),
            post_only: false,
            order_type: "FOK",
        };
        let body = serde_json::to_string(&request)?;
        let dto: OrderResponseDto = self.signed(Method::POST, "/order", Some(body)).await?;

        info!(
            order_id = %dto.order_id,
            outcome = %order.outcome,
            side = order.side.as_str(),
            size = %order.size,
            status = %dto.status,
            "Market order acknowledged"
        );
        Self::to_outcome(dto, Decimal::ZERO)
    }

    #[instrument(skip(self))]
    async fn cancel_all_orders(&self) -> Result<usize, ClientError> {
        let dto: CancelResponseDto = self.signed(Method::DELETE, "/orders", None).await?;
        info!(cancelled = dto.canceled.len(), "Cancelled all open orders");
        Ok(dto.canceled.len())
    }
}
