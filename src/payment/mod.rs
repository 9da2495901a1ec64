//! Payment gateway boundary.
//!
//! [`PaymentGateway`] is the seam between order handling and the hosted
//! checkout provider. Notifications arrive as flat form payloads
//! ([`IpnPayload`]) and must pass [`PaymentGateway::verify_notification`]
//! before anything else looks at them.

pub mod reconcile;
pub mod sslcommerz;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::domain::aggregates::Order;

pub use reconcile::{PaymentReconciler, ReconcileOutcome, RejectReason};
pub use sslcommerz::SslCommerzGateway;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Payment gateway declined: {0}")]
    Declined(String),
    #[error("Unexpected payment gateway response: {0}")]
    Malformed(String),
    #[error("Payment gateway unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Payment gateway is not configured")]
    NotConfigured,
}

/// Callback URLs handed to the gateway when a session is opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionUrls {
    pub success_url: String,
    pub fail_url: String,
    pub cancel_url: String,
    pub ipn_url: String,
}

impl SessionUrls {
    /// Standard callback endpoints below `site_url`.
    pub fn for_site(site_url: &str) -> Self {
        let base = format!("{}/api/v1/payments", site_url.trim_end_matches('/'));
        Self {
            success_url: format!("{base}/success"),
            fail_url: format!("{base}/fail"),
            cancel_url: format!("{base}/cancel"),
            ipn_url: format!("{base}/ipn"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GatewaySession {
    pub session_key: String,
    pub gateway_url: String,
}

/// A capture the gateway confirmed server-to-server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedPayment {
    pub tran_id: String,
    pub val_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub bank_tran_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefundReceipt {
    pub refund_ref: String,
}

/// Gateway status carried by a notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotificationStatus {
    Valid,
    Failed,
    Cancelled,
    Unattempted,
    Expired,
    Other(String),
}

impl NotificationStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "VALID" | "VALIDATED" => Self::Valid,
            "FAILED" => Self::Failed,
            "CANCELLED" => Self::Cancelled,
            "UNATTEMPTED" => Self::Unattempted,
            "EXPIRED" => Self::Expired,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Valid => "VALID",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Unattempted => "UNATTEMPTED",
            Self::Expired => "EXPIRED",
            Self::Other(s) => s,
        }
    }
}

/// Raw form fields of an IPN or browser-return post.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IpnPayload(pub BTreeMap<String, String>);

impl IpnPayload {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn status(&self) -> NotificationStatus { NotificationStatus::parse(self.get("status").unwrap_or_default()) }
    pub fn tran_id(&self) -> Option<&str> { self.get("tran_id") }
    pub fn val_id(&self) -> Option<&str> { self.get("val_id") }
    pub fn session_key(&self) -> Option<&str> { self.get("sessionkey") }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.0).unwrap_or(serde_json::Value::Null)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for IpnPayload {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a hosted checkout session for the order's snapshot total.
    async fn create_session(&self, order: &Order, urls: &SessionUrls) -> Result<GatewaySession, PaymentError>;
    /// Server-to-server confirmation of a capture.
    async fn validate(&self, val_id: &str) -> Result<ValidatedPayment, PaymentError>;
    async fn refund(&self, bank_tran_id: &str, amount: Decimal, remarks: &str) -> Result<RefundReceipt, PaymentError>;
    /// Checks the notification signature.
    fn verify_notification(&self, payload: &IpnPayload) -> bool;
}

/// Stand-in when no gateway credentials are configured: every call fails
/// with [`PaymentError::NotConfigured`] and no notification verifies.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledGateway;

#[async_trait]
impl PaymentGateway for DisabledGateway {
    async fn create_session(&self, _order: &Order, _urls: &SessionUrls) -> Result<GatewaySession, PaymentError> {
        Err(PaymentError::NotConfigured)
    }

    async fn validate(&self, _val_id: &str) -> Result<ValidatedPayment, PaymentError> { Err(PaymentError::NotConfigured) }

    async fn refund(&self, _bank_tran_id: &str, _amount: Decimal, _remarks: &str) -> Result<RefundReceipt, PaymentError> {
        Err(PaymentError::NotConfigured)
    }

    fn verify_notification(&self, _payload: &IpnPayload) -> bool { false }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted gateway for service and HTTP tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub const GOOD_SIGNATURE: &str = "fake-signature";

    #[derive(Default)]
    pub struct FakeGateway {
        captures: Mutex<HashMap<String, ValidatedPayment>>,
        pub refunds: Mutex<Vec<(String, Decimal)>>,
        pub sessions: Mutex<Vec<String>>,
    }

    impl FakeGateway {
        pub fn new() -> Self { Self::default() }

        /// Makes `validate(val_id)` confirm this capture.
        pub fn confirm(&self, val_id: &str, tran_id: &str, amount: Decimal, currency: &str) {
            self.captures.lock().unwrap().insert(
                val_id.to_string(),
                ValidatedPayment {
                    tran_id: tran_id.to_string(),
                    val_id: val_id.to_string(),
                    amount,
                    currency: currency.to_string(),
                    bank_tran_id: Some(format!("BANK-{val_id}")),
                },
            );
        }

        /// A signed notification as the gateway would post it.
        pub fn notification(status: &str, tran_id: &str, val_id: Option<&str>) -> IpnPayload {
            let mut fields = vec![("status", status.to_string()), ("tran_id", tran_id.to_string()), ("verify_sign", GOOD_SIGNATURE.to_string())];
            if let Some(val_id) = val_id {
                fields.push(("val_id", val_id.to_string()));
            }
            fields.push(("sessionkey", "SESSION-1".to_string()));
            fields.into_iter().collect()
        }
    }

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        async fn create_session(&self, order: &Order, _urls: &SessionUrls) -> Result<GatewaySession, PaymentError> {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.push(order.order_number().to_string());
            Ok(GatewaySession {
                session_key: format!("SESSION-{}", sessions.len()),
                gateway_url: format!("https://gateway.test/pay/{}", order.order_number()),
            })
        }

        async fn validate(&self, val_id: &str) -> Result<ValidatedPayment, PaymentError> {
            self.captures.lock().unwrap().get(val_id).cloned().ok_or_else(|| PaymentError::Declined("INVALID_TRANSACTION".into()))
        }

        async fn refund(&self, bank_tran_id: &str, amount: Decimal, _remarks: &str) -> Result<RefundReceipt, PaymentError> {
            self.refunds.lock().unwrap().push((bank_tran_id.to_string(), amount));
            Ok(RefundReceipt { refund_ref: format!("REF-{bank_tran_id}") })
        }

        fn verify_notification(&self, payload: &IpnPayload) -> bool { payload.get("verify_sign") == Some(GOOD_SIGNATURE) }
    }
}
