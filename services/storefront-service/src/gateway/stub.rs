use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    GatewayError, GatewayOrder, GatewayPayment, GatewayRefund, GatewayResult, PaymentGateway,
    RefundMode,
};

#[derive(Default)]
struct StubState {
    payments: HashMap<String, GatewayPayment>,
    rejected_modes: HashSet<RefundMode>,
    refund_calls: Vec<(String, i64, RefundMode)>,
    next_id: u64,
}

/// In-process gateway used when no gateway URL is configured, and by tests.
/// Unknown payments report as not found, so refunds against it are skipped.
#[derive(Default)]
pub struct StubGateway {
    state: Mutex<StubState>,
}

impl StubGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_captured_payment(self, payment_id: &str, amount_minor: i64) -> Self {
        self.put_payment(GatewayPayment {
            id: payment_id.to_string(),
            status: "captured".to_string(),
            amount: amount_minor,
            amount_refunded: 0,
            order_id: None,
            method: Some("upi".to_string()),
        });
        self
    }

    pub fn put_payment(&self, payment: GatewayPayment) {
        self.state().payments.insert(payment.id.clone(), payment);
    }

    pub fn reject_mode(&self, mode: RefundMode) {
        self.state().rejected_modes.insert(mode);
    }

    pub fn refund_calls(&self) -> Vec<(String, i64, RefundMode)> {
        self.state().refund_calls.clone()
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    async fn create_order(
        &self,
        amount_minor: i64,
        currency: &str,
        receipt: Option<&str>,
    ) -> GatewayResult<GatewayOrder> {
        let mut state = self.state();
        state.next_id += 1;
        Ok(GatewayOrder {
            id: format!("order_stub_{}", state.next_id),
            amount: amount_minor,
            currency: currency.to_string(),
            receipt: receipt.map(str::to_string),
        })
    }

    async fn fetch_payment(&self, payment_id: &str) -> GatewayResult<GatewayPayment> {
        self.state()
            .payments
            .get(payment_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(payment_id.to_string()))
    }

    async fn create_refund(
        &self,
        payment_id: &str,
        amount_minor: i64,
        mode: RefundMode,
    ) -> GatewayResult<GatewayRefund> {
        let mut state = self.state();
        state.refund_calls.push((payment_id.to_string(), amount_minor, mode));
        if state.rejected_modes.contains(&mode) {
            return Err(GatewayError::Rejected {
                status: 400,
                code: "BAD_REQUEST_ERROR".to_string(),
                description: format!("{} refunds are not supported for this payment", mode.as_str()),
            });
        }
        let Some(payment) = state.payments.get_mut(payment_id) else {
            return Err(GatewayError::NotFound(payment_id.to_string()));
        };
        if amount_minor > payment.refundable() {
            return Err(GatewayError::Rejected {
                status: 400,
                code: "BAD_REQUEST_ERROR".to_string(),
                description: "refund amount exceeds captured balance".to_string(),
            });
        }
        payment.amount_refunded += amount_minor;
        state.next_id += 1;
        Ok(GatewayRefund {
            id: format!("rfnd_stub_{}", state.next_id),
            amount: amount_minor,
            status: Some("processed".to_string()),
        })
    }
}
