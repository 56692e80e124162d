//! Order submission with bounded retry and tag dedup.
//!
//! Place and modify are not idempotent at the broker, so a retryable error
//! (rate limit, 5xx, network) must not be blindly re-sent: the first attempt
//! may have gone through. Every order carries a deterministic tag, and the
//! retry path scans recent broker orders for that tag before re-submitting.

use crate::domain::errors::BrokerError;
use crate::domain::ports::{Broker, OrderParams, Variety};
use rand::Rng;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

fn backoff_with_jitter(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy
        .base_backoff_ms
        .saturating_mul(1u64 << attempt.min(6))
        .min(policy.max_backoff_ms);
    let jitter = rand::rng().random_range(0..=exp / 2);
    Duration::from_millis(exp + jitter)
}

/// Look for an already-accepted order carrying `tag` in the recent order
/// book. Returns its order id when found.
async fn find_by_tag(broker: &Arc<dyn Broker>, tag: &str) -> Option<String> {
    match broker.orders().await {
        Ok(orders) => orders
            .into_iter()
            .rev()
            .find(|o| o.tag.as_deref() == Some(tag))
            .map(|o| o.order_id),
        Err(e) => {
            warn!("submit: tag lookback failed: {}", e);
            None
        }
    }
}

/// Place with bounded retries. Non-retryable errors return immediately;
/// retryable ones re-check by tag first so at most one broker order ever
/// carries the `(trade, role)` tag.
pub async fn place_with_retry(
    broker: &Arc<dyn Broker>,
    variety: Variety,
    params: OrderParams,
    policy: RetryPolicy,
) -> Result<String, BrokerError> {
    let tag = params.tag.clone();
    let mut attempt = 0u32;

    loop {
        match broker.place_order(variety, params.clone()).await {
            Ok(order_id) => return Ok(order_id),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                attempt += 1;
                let delay = backoff_with_jitter(&policy, attempt);
                warn!(
                    "submit: retryable place error (attempt {}): {}; backing off {:?}",
                    attempt, e, delay
                );
                sleep(delay).await;

                if let Some(tag) = &tag
                    && let Some(existing) = find_by_tag(broker, tag).await
                {
                    info!("submit: found existing order {} by tag {}, not re-placing", existing, tag);
                    return Ok(existing);
                }
            }
            Err(e) => {
                // Last-chance dedup: the failed attempt may still have landed
                if e.is_retryable()
                    && let Some(tag) = &tag
                    && let Some(existing) = find_by_tag(broker, tag).await
                {
                    info!("submit: attempts exhausted but order {} exists by tag", existing);
                    return Ok(existing);
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{
        BrokerOrder, BrokerResult, ConvertPositionParams, ModifyParams, OrderStatusWire,
        PositionsSnapshot, Quote,
    };
    use crate::domain::trading::types::{OrderKind, Product, Side, Validity};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// First `fail_times` placements fail retryably; each accepted placement
    /// lands in the order book with its tag.
    struct FlakyBroker {
        fail_times: Mutex<u32>,
        accepted: Mutex<Vec<BrokerOrder>>,
        place_calls: Mutex<u32>,
        /// Simulate "the request landed but the response was lost".
        accept_on_failure: bool,
    }

    impl FlakyBroker {
        fn new(fail_times: u32, accept_on_failure: bool) -> Self {
            Self {
                fail_times: Mutex::new(fail_times),
                accepted: Mutex::new(Vec::new()),
                place_calls: Mutex::new(0),
                accept_on_failure,
            }
        }

        fn accept(&self, id: &str, tag: Option<String>) {
            self.accepted.lock().unwrap().push(BrokerOrder {
                order_id: id.to_string(),
                status: OrderStatusWire::Open,
                status_message: None,
                status_message_raw: None,
                kind: OrderKind::Limit,
                side: Side::Buy,
                tradingsymbol: "X".into(),
                exchange: "NFO".into(),
                quantity: 50,
                filled_quantity: 0,
                average_price: Decimal::ZERO,
                price: dec!(100),
                trigger_price: Decimal::ZERO,
                tag,
                order_timestamp: None,
                exchange_timestamp: None,
            });
        }
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn place_order(&self, _v: Variety, params: OrderParams) -> BrokerResult<String> {
            *self.place_calls.lock().unwrap() += 1;
            let mut fails = self.fail_times.lock().unwrap();
            if *fails > 0 {
                *fails -= 1;
                if self.accept_on_failure {
                    self.accept("lost-1", params.tag.clone());
                }
                return Err(BrokerError::Retryable { status: Some(502), message: "gateway".into() });
            }
            let id = format!("ok-{}", self.accepted.lock().unwrap().len() + 1);
            self.accept(&id, params.tag.clone());
            Ok(id)
        }

        async fn modify_order(
            &self,
            _v: Variety,
            _id: &str,
            _p: ModifyParams,
        ) -> BrokerResult<String> {
            unimplemented!()
        }

        async fn cancel_order(&self, _v: Variety, _id: &str) -> BrokerResult<String> {
            unimplemented!()
        }

        async fn orders(&self) -> BrokerResult<Vec<BrokerOrder>> {
            Ok(self.accepted.lock().unwrap().clone())
        }

        async fn order_history(&self, _id: &str) -> BrokerResult<Vec<BrokerOrder>> {
            Ok(vec![])
        }

        async fn positions(&self) -> BrokerResult<PositionsSnapshot> {
            Ok(PositionsSnapshot::default())
        }

        async fn quote(&self, _keys: &[String]) -> BrokerResult<HashMap<String, Quote>> {
            Ok(HashMap::new())
        }

        async fn ltp(&self, _keys: &[String]) -> BrokerResult<HashMap<String, Decimal>> {
            Ok(HashMap::new())
        }

        async fn convert_position(&self, _p: ConvertPositionParams) -> BrokerResult<()> {
            Ok(())
        }
    }

    fn params(tag: &str) -> OrderParams {
        OrderParams {
            exchange: "NFO".into(),
            tradingsymbol: "X".into(),
            side: Side::Buy,
            quantity: 50,
            product: Product::Mis,
            kind: OrderKind::Limit,
            validity: Validity::Day,
            price: Some(dec!(100)),
            trigger_price: None,
            tag: Some(tag.to_string()),
            market_protection: None,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy { max_attempts: 3, base_backoff_ms: 1, max_backoff_ms: 2 }
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let broker: Arc<dyn Broker> = Arc::new(FlakyBroker::new(1, false));
        let id = place_with_retry(&broker, Variety::Regular, params("TAG1"), fast_policy())
            .await
            .unwrap();
        assert!(id.starts_with("ok-"));
    }

    #[tokio::test]
    async fn test_tag_dedup_prevents_double_order() {
        // The first attempt "fails" but actually lands at the broker.
        let flaky = Arc::new(FlakyBroker::new(1, true));
        let broker: Arc<dyn Broker> = flaky.clone();
        let id = place_with_retry(&broker, Variety::Regular, params("TAG2"), fast_policy())
            .await
            .unwrap();
        assert_eq!(id, "lost-1");
        // Exactly one placement attempt was accepted; retry found it by tag
        let with_tag = flaky
            .accepted
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.tag.as_deref() == Some("TAG2"))
            .count();
        assert_eq!(with_tag, 1);
        assert_eq!(*flaky.place_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        struct RmsBroker;
        #[async_trait]
        impl Broker for RmsBroker {
            async fn place_order(&self, _v: Variety, _p: OrderParams) -> BrokerResult<String> {
                Err(BrokerError::Rms { message: "margin".into() })
            }
            async fn modify_order(&self, _v: Variety, _i: &str, _p: ModifyParams) -> BrokerResult<String> {
                unimplemented!()
            }
            async fn cancel_order(&self, _v: Variety, _i: &str) -> BrokerResult<String> {
                unimplemented!()
            }
            async fn orders(&self) -> BrokerResult<Vec<BrokerOrder>> {
                panic!("must not scan orders for non-retryable errors")
            }
            async fn order_history(&self, _i: &str) -> BrokerResult<Vec<BrokerOrder>> {
                Ok(vec![])
            }
            async fn positions(&self) -> BrokerResult<PositionsSnapshot> {
                Ok(PositionsSnapshot::default())
            }
            async fn quote(&self, _k: &[String]) -> BrokerResult<HashMap<String, Quote>> {
                Ok(HashMap::new())
            }
            async fn ltp(&self, _k: &[String]) -> BrokerResult<HashMap<String, Decimal>> {
                Ok(HashMap::new())
            }
            async fn convert_position(&self, _p: ConvertPositionParams) -> BrokerResult<()> {
                Ok(())
            }
        }

        let broker: Arc<dyn Broker> = Arc::new(RmsBroker);
        let err = place_with_retry(&broker, Variety::Regular, params("TAG3"), fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Rms { .. }));
    }
}
