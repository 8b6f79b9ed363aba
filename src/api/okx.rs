use crate::api::ExchangeApi;
use crate::config::OkxCredentials;
use crate::error::{BotError, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;

const REQUEST_TIMEOUT_SECS: u64 = 10;
const RATE_LIMIT_RPS: u32 = 10;
const DEFAULT_HISTORY_LIMIT: u32 = 100;

type OkxRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

type HmacSha256 = Hmac<Sha256>;

/// Signed OKX v5 REST client.
///
/// Every private call is signed with a fresh ISO-8601 UTC timestamp; the
/// exchange rejects stale timestamps, which is what makes replayed requests
/// harmless. The client performs no retries — order placement is
/// non-idempotent and retry policy belongs to the caller.
///
/// Cloneable; all clones share the same rate limiter.
#[derive(Clone)]
pub struct OkxClient {
    client: Client,
    api_key: String,
    secret_key: String,
    passphrase: String,
    base_url: String,
    rate_limiter: Arc<OkxRateLimiter>,
}

/// Response envelope used by every OKX endpoint. `code != "0"` is an
/// application-level failure even on HTTP 200.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerData {
    inst_id: String,
    last: String,
    #[serde(default)]
    bid_px: String,
    #[serde(default)]
    ask_px: String,
    #[serde(default)]
    vol24h: String,
}

/// Current market snapshot for one instrument.
#[derive(Debug, Clone)]
pub struct Ticker {
    pub symbol: String,
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume: f64,
}

#[derive(Debug, Deserialize)]
struct BalanceData {
    #[serde(default)]
    details: Vec<BalanceDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceDetail {
    ccy: String,
    #[serde(default)]
    avail_bal: String,
    #[serde(default)]
    frozen_bal: String,
}

#[derive(Debug, Clone)]
pub struct Balance {
    pub currency: String,
    pub available: f64,
    pub frozen: f64,
}

/// Acknowledgement returned by order placement and cancellation.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderReceipt {
    #[serde(rename = "ordId")]
    pub order_id: String,
    #[serde(rename = "clOrdId", default)]
    pub client_order_id: String,
}

/// An order as reported by the order-info, pending and history endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub inst_id: String,
    pub ord_id: String,
    pub side: String,
    pub ord_type: String,
    pub sz: String,
    #[serde(default)]
    pub avg_px: String,
    pub state: String,
}

/// Account-level configuration as reported by the exchange.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfig {
    pub uid: String,
    #[serde(default)]
    pub acct_lv: String,
    #[serde(default)]
    pub pos_mode: String,
}

/// Build the canonical prehash and return its base64-encoded HMAC-SHA256.
///
/// Prehash is `timestamp + METHOD + requestPath + body` with an empty body
/// for GET requests.
fn sign(secret: &str, timestamp: &str, method: &str, request_path: &str, body: &str) -> String {
    let prehash = format!("{}{}{}{}", timestamp, method, request_path, body);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(prehash.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Fresh ISO-8601 UTC timestamp with millisecond precision, generated per
/// request and never reused.
fn timestamp_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn validate_side(side: &str) -> Result<()> {
    match side {
        "buy" | "sell" => Ok(()),
        other => Err(BotError::InvalidSide(other.to_string())),
    }
}

fn parse_num(raw: &str) -> f64 {
    raw.parse().unwrap_or(0.0)
}

impl OkxClient {
    pub fn new(credentials: &OkxCredentials) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| BotError::GatewayUnavailable(e.to_string()))?;

        let quota = Quota::per_second(NonZeroU32::new(RATE_LIMIT_RPS).unwrap());

        Ok(Self {
            client,
            api_key: credentials.api_key.clone(),
            secret_key: credentials.secret_key.clone(),
            passphrase: credentials.passphrase.clone(),
            base_url: credentials.base_url.trim_end_matches('/').to_string(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    /// Public (unauthenticated) request.
    async fn public_get<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<Vec<T>> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path_and_query);
        let response = self.client.get(&url).send().await?;
        decode(response).await
    }

    /// Signed request. `path_and_query` must be exactly what goes on the wire,
    /// query string included, because it is part of the signature prehash.
    async fn private_request<T: DeserializeOwned>(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Vec<T>> {
        self.rate_limiter.until_ready().await;

        let body_str = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        let timestamp = timestamp_now();
        let signature = sign(
            &self.secret_key,
            &timestamp,
            method.as_str(),
            path_and_query,
            &body_str,
        );

        let url = format!("{}{}", self.base_url, path_and_query);
        let mut request = self
            .client
            .request(method, &url)
            .header("OK-ACCESS-KEY", &self.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json");

        if !body_str.is_empty() {
            request = request.body(body_str);
        }

        let response = request.send().await?;
        decode(response).await
    }

    /// Current price, bid/ask and 24h volume for an instrument. Public.
    pub async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        let path = format!("/api/v5/market/ticker?instId={}", symbol);
        let mut data: Vec<TickerData> = self.public_get(&path).await?;

        let ticker = data
            .drain(..)
            .next()
            .ok_or_else(|| BotError::TickerUnavailable(symbol.to_string()))?;

        let price: f64 = ticker
            .last
            .parse()
            .map_err(|_| BotError::TickerUnavailable(symbol.to_string()))?;

        Ok(Ticker {
            symbol: ticker.inst_id,
            price,
            bid: parse_num(&ticker.bid_px),
            ask: parse_num(&ticker.ask_px),
            volume: parse_num(&ticker.vol24h),
        })
    }

    /// Account balances, optionally filtered to one currency.
    pub async fn get_balance(&self, currency: Option<&str>) -> Result<Vec<Balance>> {
        let path = match currency {
            Some(ccy) => format!("/api/v5/account/balance?ccy={}", ccy),
            None => "/api/v5/account/balance".to_string(),
        };
        let data: Vec<BalanceData> = self.private_request(Method::GET, &path, None).await?;

        let balances = data
            .into_iter()
            .flat_map(|d| d.details)
            .map(|detail| Balance {
                currency: detail.ccy,
                available: parse_num(&detail.avail_bal),
                frozen: parse_num(&detail.frozen_bal),
            })
            .collect();

        Ok(balances)
    }

    /// Account-level exchange configuration (authenticated probe target).
    pub async fn get_account_config(&self) -> Result<AccountConfig> {
        let data: Vec<AccountConfig> = self
            .private_request(Method::GET, "/api/v5/account/config", None)
            .await?;
        data.into_iter()
            .next()
            .ok_or_else(|| BotError::GatewayUnavailable("empty account config".to_string()))
    }

    pub async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        size: &str,
    ) -> Result<OrderReceipt> {
        validate_side(side)?;

        let body = serde_json::json!({
            "instId": symbol,
            "tdMode": "cash",
            "side": side,
            "ordType": "market",
            "sz": size,
        });

        let mut data: Vec<OrderReceipt> = self
            .private_request(Method::POST, "/api/v5/trade/order", Some(body))
            .await?;
        let receipt = data
            .drain(..)
            .next()
            .ok_or_else(|| BotError::GatewayUnavailable("empty order response".to_string()))?;

        tracing::info!(
            "Placed market order: {} {} {} (ordId {})",
            symbol,
            side,
            size,
            receipt.order_id
        );
        Ok(receipt)
    }

    pub async fn place_limit_order(
        &self,
        symbol: &str,
        side: &str,
        size: &str,
        price: &str,
    ) -> Result<OrderReceipt> {
        validate_side(side)?;

        let body = serde_json::json!({
            "instId": symbol,
            "tdMode": "cash",
            "side": side,
            "ordType": "limit",
            "sz": size,
            "px": price,
        });

        let mut data: Vec<OrderReceipt> = self
            .private_request(Method::POST, "/api/v5/trade/order", Some(body))
            .await?;
        let receipt = data
            .drain(..)
            .next()
            .ok_or_else(|| BotError::GatewayUnavailable("empty order response".to_string()))?;

        tracing::info!(
            "Placed limit order: {} {} {} @ {} (ordId {})",
            symbol,
            side,
            size,
            price,
            receipt.order_id
        );
        Ok(receipt)
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderReceipt> {
        let body = serde_json::json!({
            "instId": symbol,
            "ordId": order_id,
        });

        let mut data: Vec<OrderReceipt> = self
            .private_request(Method::POST, "/api/v5/trade/cancel-order", Some(body))
            .await?;
        let receipt = data
            .drain(..)
            .next()
            .ok_or_else(|| BotError::GatewayUnavailable("empty cancel response".to_string()))?;

        tracing::info!("Cancelled order {}", receipt.order_id);
        Ok(receipt)
    }

    pub async fn get_order_info(&self, symbol: &str, order_id: &str) -> Result<OrderRecord> {
        let path = format!("/api/v5/trade/order?instId={}&ordId={}", symbol, order_id);
        let data: Vec<OrderRecord> = self.private_request(Method::GET, &path, None).await?;

        data.into_iter().next().ok_or_else(|| BotError::Exchange {
            code: "51603".to_string(),
            message: format!("order {} does not exist", order_id),
        })
    }

    pub async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderRecord>> {
        let path = match symbol {
            Some(s) => format!("/api/v5/trade/orders-pending?instId={}", s),
            None => "/api/v5/trade/orders-pending".to_string(),
        };
        self.private_request(Method::GET, &path, None).await
    }

    pub async fn get_order_history(
        &self,
        symbol: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<OrderRecord>> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        let path = match symbol {
            Some(s) => format!(
                "/api/v5/trade/orders-history?instType=SPOT&instId={}&limit={}",
                s, limit
            ),
            None => format!("/api/v5/trade/orders-history?instType=SPOT&limit={}", limit),
        };
        self.private_request(Method::GET, &path, None).await
    }
}

#[async_trait]
impl ExchangeApi for OkxClient {
    async fn check_connection(&self) -> Result<()> {
        // One authenticated round-trip; any failure means the gateway is not
        // usable, whatever the underlying cause.
        self.get_balance(Some("USDT"))
            .await
            .map(|_| ())
            .map_err(|e| BotError::GatewayUnavailable(e.to_string()))
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        OkxClient::get_ticker(self, symbol).await
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        size: &str,
    ) -> Result<OrderReceipt> {
        OkxClient::place_market_order(self, symbol, side, size).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<Vec<T>> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(BotError::Exchange {
            code: status.as_u16().to_string(),
            message,
        });
    }

    let envelope: ApiResponse<T> = response
        .json()
        .await
        .map_err(|e| BotError::GatewayUnavailable(format!("malformed response: {}", e)))?;

    if envelope.code != "0" {
        return Err(BotError::Exchange {
            code: envelope.code,
            message: envelope.msg,
        });
    }

    Ok(envelope.data)
}
