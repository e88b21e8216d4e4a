use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::gateway::{ExecutionGateway, GatewayError, OrderHandle, OrderState, SellLimitOrder};
use crate::models::Candle;

#[derive(Debug, Clone)]
struct PaperOrder {
    handle: OrderHandle,
    order: SellLimitOrder,
    placed_at: DateTime<Utc>,
}

/// Simulated execution gateway
///
/// A sell limit fills once a later candle trades at or above its price and
/// expires after its lifetime. Nothing leaves the process.
#[derive(Debug, Default)]
pub struct PaperGateway {
    orders: Mutex<Vec<PaperOrder>>,
    clock: Mutex<Option<DateTime<Utc>>>,
    submitted: AtomicUsize,
    cancelled: AtomicUsize,
    filled: AtomicUsize,
    expired: AtomicUsize,
    reject_submissions: AtomicBool,
    fail_cancellations: AtomicBool,
}

impl PaperGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following submission fail (gateway outage)
    pub fn set_reject_submissions(&self, reject: bool) {
        self.reject_submissions.store(reject, Ordering::SeqCst);
    }

    /// Make every following cancellation fail
    pub fn set_fail_cancellations(&self, fail: bool) {
        self.fail_cancellations.store(fail, Ordering::SeqCst);
    }

    /// Pin the gateway clock, e.g. to simulated market time
    pub fn set_time(&self, now: DateTime<Utc>) {
        *self.clock.lock() = Some(now);
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.lock().unwrap_or_else(Utc::now)
    }

    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn filled(&self) -> usize {
        self.filled.load(Ordering::SeqCst)
    }

    pub fn expired(&self) -> usize {
        self.expired.load(Ordering::SeqCst)
    }

    /// Orders accepted so far, oldest first
    pub fn orders(&self) -> Vec<SellLimitOrder> {
        self.orders.lock().iter().map(|o| o.order.clone()).collect()
    }

    pub fn open_orders(&self) -> usize {
        self.orders
            .lock()
            .iter()
            .filter(|o| o.handle.is_active())
            .count()
    }

    /// Fill active sells for `ticker` that this candle traded through
    pub fn on_candle(&self, ticker: &str, candle: &Candle) -> usize {
        let orders = self.orders.lock();
        let mut filled = 0;

        for paper in orders
            .iter()
            .filter(|o| o.order.ticker == ticker && o.placed_at < candle.timestamp)
        {
            if candle.close >= paper.order.price && paper.handle.complete(OrderState::Filled) {
                tracing::info!(
                    ticker = %ticker,
                    price = paper.order.price,
                    "Paper sell filled"
                );
                filled += 1;
            }
        }

        self.filled.fetch_add(filled, Ordering::SeqCst);
        filled
    }

    /// Expire active orders whose lifetime ended before `now`
    pub fn expire(&self, now: DateTime<Utc>) -> usize {
        let orders = self.orders.lock();
        let mut expired = 0;

        for paper in orders.iter() {
            let lifetime = chrono::Duration::from_std(paper.order.lifetime)
                .unwrap_or_else(|_| chrono::Duration::zero());
            if now >= paper.placed_at + lifetime && paper.handle.complete(OrderState::Expired) {
                tracing::debug!(ticker = %paper.order.ticker, "Paper order expired");
                expired += 1;
            }
        }

        self.expired.fetch_add(expired, Ordering::SeqCst);
        expired
    }
}

impl ExecutionGateway for PaperGateway {
    fn submit_sell_limit(&self, order: SellLimitOrder) -> Result<OrderHandle, GatewayError> {
        if self.reject_submissions.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected {
                ticker: order.ticker,
                reason: "paper gateway is rejecting submissions".to_string(),
            });
        }
        if order.quantity == 0 || !(order.price > 0.0) {
            return Err(GatewayError::Rejected {
                ticker: order.ticker,
                reason: format!("invalid order {} x {}", order.quantity, order.price),
            });
        }

        let handle = OrderHandle::new(&order.ticker);
        tracing::info!(
            ticker = %order.ticker,
            price = order.price,
            take_profit = order.take_profit_percent,
            "Paper sell limit placed"
        );

        self.orders.lock().push(PaperOrder {
            handle: handle.clone(),
            order,
            placed_at: self.now(),
        });
        self.submitted.fetch_add(1, Ordering::SeqCst);

        Ok(handle)
    }

    fn cancel(&self, handle: &OrderHandle) -> Result<(), GatewayError> {
        if self.fail_cancellations.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable(
                "paper gateway is failing cancellations".to_string(),
            ));
        }

        let known = self
            .orders
            .lock()
            .iter()
            .any(|o| o.handle.id() == handle.id());
        if !known {
            return Err(GatewayError::UnknownOrder(handle.id()));
        }

        if handle.complete(OrderState::Cancelled) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
