//! Kite-style REST broker adapter.
//!
//! Transport-level retry (reqwest middleware) is applied only to GETs;
//! order placement goes through the engine's tag-dedup retry instead, so a
//! lost response can never turn into two live orders.

use crate::domain::errors::BrokerError;
use crate::domain::ports::{
    Broker, BrokerOrder, BrokerResult, ConvertPositionParams, ModifyParams, OrderParams,
    PositionsSnapshot, Quote, Variety,
};
use crate::infrastructure::kite::types::{
    Envelope, OrderIdData, WireLtp, WireOrder, WirePositions, WireQuote,
};
use async_trait::async_trait;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

pub struct KiteClient {
    get_client: ClientWithMiddleware,
    /// No transport retry: non-idempotent verbs.
    post_client: reqwest::Client,
    base_url: String,
    api_key: String,
    access_token: String,
    tz_offset_min: i32,
}

impl KiteClient {
    pub fn new(base_url: String, api_key: String, access_token: String, tz_offset_min: i32) -> Self {
        let inner = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client construction");
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(2);
        let get_client = ClientBuilder::new(inner.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Self {
            get_client,
            post_client: inner,
            base_url,
            api_key,
            access_token,
            tz_offset_min,
        }
    }

    fn auth_header(&self) -> String {
        format!("token {}:{}", self.api_key, self.access_token)
    }

    async fn parse_envelope<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> BrokerResult<T> {
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| BrokerError::Retryable {
            status: Some(status),
            message: format!("body read failed: {}", e),
        })?;

        let envelope: Envelope<T> = match serde_json::from_str(&body) {
            Ok(env) => env,
            Err(_) => {
                return Err(BrokerError::classify(Some(status), None, &body));
            }
        };

        if envelope.status == "success" {
            envelope.data.ok_or_else(|| BrokerError::Other {
                message: "success envelope without data".to_string(),
            })
        } else {
            Err(BrokerError::classify(
                Some(status),
                envelope.error_type.as_deref(),
                envelope.message.as_deref().unwrap_or("broker error"),
            ))
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str, query: &[(String, String)]) -> BrokerResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .get_client
            .get(&url)
            .query(query)
            .header("Authorization", self.auth_header())
            .header("X-Kite-Version", "3")
            .send()
            .await
            .map_err(|e| BrokerError::Retryable { status: None, message: e.to_string() })?;
        Self::parse_envelope(response).await
    }

    fn order_form(params: &OrderParams) -> Vec<(String, String)> {
        let mut form = vec![
            ("exchange".to_string(), params.exchange.clone()),
            ("tradingsymbol".to_string(), params.tradingsymbol.clone()),
            ("transaction_type".to_string(), params.side.to_string()),
            ("quantity".to_string(), params.quantity.to_string()),
            ("product".to_string(), params.product.to_string()),
            ("order_type".to_string(), params.kind.to_string()),
            ("validity".to_string(), params.validity.to_string()),
        ];
        if let Some(price) = params.price {
            form.push(("price".to_string(), price.to_string()));
        }
        if let Some(trigger) = params.trigger_price {
            form.push(("trigger_price".to_string(), trigger.to_string()));
        }
        if let Some(tag) = &params.tag {
            form.push(("tag".to_string(), tag.clone()));
        }
        if let Some(protection) = params.market_protection {
            form.push(("market_protection".to_string(), protection.to_string()));
        }
        form
    }
}

#[async_trait]
impl Broker for KiteClient {
    async fn place_order(&self, variety: Variety, params: OrderParams) -> BrokerResult<String> {
        let url = format!("{}/orders/{}", self.base_url, variety.as_wire());
        let form = Self::order_form(&params);
        debug!("KiteClient: placing {:?} {} x{}", params.kind, params.tradingsymbol, params.quantity);
        let response = self
            .post_client
            .post(&url)
            .form(&form)
            .header("Authorization", self.auth_header())
            .header("X-Kite-Version", "3")
            .send()
            .await
            .map_err(|e| BrokerError::Retryable { status: None, message: e.to_string() })?;
        let data: OrderIdData = Self::parse_envelope(response).await?;
        Ok(data.order_id)
    }

    async fn modify_order(
        &self,
        variety: Variety,
        order_id: &str,
        patch: ModifyParams,
    ) -> BrokerResult<String> {
        let url = format!("{}/orders/{}/{}", self.base_url, variety.as_wire(), order_id);
        let mut form: Vec<(String, String)> = Vec::new();
        if let Some(price) = patch.price {
            form.push(("price".to_string(), price.to_string()));
        }
        if let Some(trigger) = patch.trigger_price {
            form.push(("trigger_price".to_string(), trigger.to_string()));
        }
        if let Some(quantity) = patch.quantity {
            form.push(("quantity".to_string(), quantity.to_string()));
        }
        if let Some(kind) = patch.kind {
            form.push(("order_type".to_string(), kind.to_string()));
        }
        let response = self
            .post_client
            .put(&url)
            .form(&form)
            .header("Authorization", self.auth_header())
            .header("X-Kite-Version", "3")
            .send()
            .await
            .map_err(|e| BrokerError::Retryable { status: None, message: e.to_string() })?;
        let data: OrderIdData = Self::parse_envelope(response).await?;
        Ok(data.order_id)
    }

    async fn cancel_order(&self, variety: Variety, order_id: &str) -> BrokerResult<String> {
        let url = format!("{}/orders/{}/{}", self.base_url, variety.as_wire(), order_id);
        let response = self
            .post_client
            .delete(&url)
            .header("Authorization", self.auth_header())
            .header("X-Kite-Version", "3")
            .send()
            .await
            .map_err(|e| BrokerError::Retryable { status: None, message: e.to_string() })?;
        let data: OrderIdData = Self::parse_envelope(response).await?;
        Ok(data.order_id)
    }

    async fn orders(&self) -> BrokerResult<Vec<BrokerOrder>> {
        let wire: Vec<WireOrder> = self.get("/orders", &[]).await?;
        Ok(wire
            .into_iter()
            .filter_map(|o| o.into_broker_order(self.tz_offset_min))
            .collect())
    }

    async fn order_history(&self, order_id: &str) -> BrokerResult<Vec<BrokerOrder>> {
        let wire: Vec<WireOrder> = self.get(&format!("/orders/{}", order_id), &[]).await?;
        Ok(wire
            .into_iter()
            .filter_map(|o| o.into_broker_order(self.tz_offset_min))
            .collect())
    }

    async fn positions(&self) -> BrokerResult<PositionsSnapshot> {
        let wire: WirePositions = self.get("/portfolio/positions", &[]).await?;
        Ok(PositionsSnapshot {
            net: wire.net.into_iter().filter_map(|p| p.into_net_position()).collect(),
            day: wire.day.into_iter().filter_map(|p| p.into_net_position()).collect(),
        })
    }

    async fn quote(&self, keys: &[String]) -> BrokerResult<HashMap<String, Quote>> {
        let query: Vec<(String, String)> =
            keys.iter().map(|k| ("i".to_string(), k.clone())).collect();
        let wire: HashMap<String, WireQuote> = self.get("/quote", &query).await?;
        Ok(wire
            .into_iter()
            .map(|(k, q)| (k, q.into_quote(self.tz_offset_min)))
            .collect())
    }

    async fn ltp(&self, keys: &[String]) -> BrokerResult<HashMap<String, Decimal>> {
        let query: Vec<(String, String)> =
            keys.iter().map(|k| ("i".to_string(), k.clone())).collect();
        let wire: HashMap<String, WireLtp> = self.get("/quote/ltp", &query).await?;
        Ok(wire
            .into_iter()
            .map(|(k, l)| (k, Decimal::from_f64_retain(l.last_price).unwrap_or_default()))
            .collect())
    }

    async fn convert_position(&self, params: ConvertPositionParams) -> BrokerResult<()> {
        let url = format!("{}/portfolio/positions", self.base_url);
        let form = vec![
            ("exchange".to_string(), params.exchange),
            ("tradingsymbol".to_string(), params.tradingsymbol),
            ("transaction_type".to_string(), params.side.to_string()),
            ("position_type".to_string(), "day".to_string()),
            ("quantity".to_string(), params.quantity.to_string()),
            ("old_product".to_string(), params.old_product.to_string()),
            ("new_product".to_string(), params.new_product.to_string()),
        ];
        let response = self
            .post_client
            .put(&url)
            .form(&form)
            .header("Authorization", self.auth_header())
            .header("X-Kite-Version", "3")
            .send()
            .await
            .map_err(|e| BrokerError::Retryable { status: None, message: e.to_string() })?;
        let _: serde_json::Value = Self::parse_envelope(response).await?;
        Ok(())
    }
}
