//! Order routing contract and the venue HTTP implementation.
//!
//! Every response is an explicit typed struct; an absent field is an
//! error case, never a silent default.

use std::time::Duration;

use async_trait::async_trait;
use mm_common::Side;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::credentials::Profile;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("venue returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("malformed response: {0}")]
    Parse(String),
}

/// An order to place.
#[derive(Debug, Clone, Serialize)]
pub struct PlaceOrder {
    pub token_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    /// Maker-only: rejected instead of crossing.
    pub post_only: bool,
}

/// Acknowledged placement.
#[derive(Debug, Clone, Deserialize)]
pub struct PlacedOrder {
    pub order_id: String,
}

/// One entry of the open-order snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub token_id: String,
    pub price: Decimal,
    pub original_size: Decimal,
    /// Size matched so far; partial fills show up here.
    pub matched_size: Decimal,
}

/// Which balance to query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceKind {
    /// Collateral (quote currency) available for new orders.
    Collateral,
    /// Held quantity of one outcome token.
    Token { token_id: String },
}

/// Order routing contract.
#[async_trait]
pub trait OrderRouter: Send + Sync {
    async fn place_order(&self, order: &PlaceOrder) -> Result<PlacedOrder, RouterError>;
    async fn cancel_order(&self, order_id: &str) -> Result<(), RouterError>;
    async fn cancel_all(&self, market_id: &str) -> Result<(), RouterError>;
    async fn open_orders(&self) -> Result<Vec<OpenOrder>, RouterError>;
    async fn balance(&self, kind: &BalanceKind) -> Result<Decimal, RouterError>;
}

/// Router over the venue's REST API, authenticated per profile.
pub struct HttpRouter {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    api_passphrase: String,
    funder_address: String,
}

impl HttpRouter {
    pub fn new(base_url: impl Into<String>, profile: &Profile, timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into(),
            api_key: profile.api_key.clone(),
            api_secret: profile.api_secret.clone(),
            api_passphrase: profile.api_passphrase.clone(),
            funder_address: profile.funder_address.clone(),
        }
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("POLY-API-KEY", &self.api_key)
            .header("POLY-SECRET", &self.api_secret)
            .header("POLY-PASSPHRASE", &self.api_passphrase)
            .header("POLY-ADDRESS", &self.funder_address)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RouterError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(RouterError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PlaceResponse {
    success: bool,
    #[serde(rename = "orderID")]
    order_id: Option<String>,
    #[serde(rename = "errorMsg")]
    error_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: Decimal,
}

#[async_trait]
impl OrderRouter for HttpRouter {
    async fn place_order(&self, order: &PlaceOrder) -> Result<PlacedOrder, RouterError> {
        let url = format!("{}/order", self.base_url);
        debug!(
            token = %order.token_id,
            side = %order.side,
            price = %order.price,
            size = %order.size,
            post_only = order.post_only,
            "placing order"
        );
        let response = self.authed(self.http.post(&url).json(order)).send().await?;
        let parsed: PlaceResponse = Self::check(response).await?.json().await?;

        if !parsed.success {
            return Err(RouterError::Rejected(
                parsed.error_msg.unwrap_or_else(|| "unknown".to_string()),
            ));
        }
        match parsed.order_id {
            Some(order_id) => Ok(PlacedOrder { order_id }),
            None => Err(RouterError::Parse(
                "placement succeeded without an order id".to_string(),
            )),
        }
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), RouterError> {
        let url = format!("{}/order/{}", self.base_url, order_id);
        let response = self.authed(self.http.delete(&url)).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn cancel_all(&self, market_id: &str) -> Result<(), RouterError> {
        let url = format!("{}/orders?market={}", self.base_url, market_id);
        let response = self.authed(self.http.delete(&url)).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn open_orders(&self) -> Result<Vec<OpenOrder>, RouterError> {
        let url = format!("{}/orders", self.base_url);
        let response = self.authed(self.http.get(&url)).send().await?;
        let orders: Vec<OpenOrder> = Self::check(response).await?.json().await?;
        Ok(orders)
    }

    async fn balance(&self, kind: &BalanceKind) -> Result<Decimal, RouterError> {
        let url = match kind {
            BalanceKind::Collateral => format!("{}/balance", self.base_url),
            BalanceKind::Token { token_id } => {
                format!("{}/balance?token_id={}", self.base_url, token_id)
            }
        };
        let response = self.authed(self.http.get(&url)).send().await?;
        let parsed: BalanceResponse = Self::check(response).await?.json().await?;
        Ok(parsed.balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_place_order_serializes_post_only() {
        let order = PlaceOrder {
            token_id: "tok1".to_string(),
            side: Side::Buy,
            price: dec!(0.505),
            size: dec!(50),
            post_only: true,
        };
        let json = serde_json::to_string(&order).unwrap();
        assert!(json.contains("\"post_only\":true"));
        assert!(json.contains("\"0.505\""));
    }

    #[test]
    fn test_place_response_variants() {
        let ok: PlaceResponse =
            serde_json::from_str(r#"{"success":true,"orderID":"o1"}"#).unwrap();
        assert!(ok.success);
        assert_eq!(ok.order_id.as_deref(), Some("o1"));

        let rejected: PlaceResponse =
            serde_json::from_str(r#"{"success":false,"errorMsg":"not enough balance"}"#).unwrap();
        assert!(!rejected.success);
        assert_eq!(rejected.error_msg.as_deref(), Some("not enough balance"));
    }

    #[test]
    fn test_open_order_parses_matched_size() {
        let order: OpenOrder = serde_json::from_str(
            r#"{"order_id":"o1","token_id":"t1","price":"0.505","original_size":"50","matched_size":"12"}"#,
        )
        .unwrap();
        assert_eq!(order.matched_size, dec!(12));
        assert_eq!(order.price, dec!(0.505));
    }
}
