//! SSLCommerz hosted checkout client.

use async_trait::async_trait;
use md5::{Digest, Md5};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, instrument, warn};

use super::{GatewaySession, IpnPayload, NotificationStatus, PaymentError, PaymentGateway, RefundReceipt, SessionUrls, ValidatedPayment};
use crate::domain::aggregates::Order;

pub const SANDBOX_URL: &str = "https://sandbox.sslcommerz.com";
pub const LIVE_URL: &str = "https://securepay.sslcommerz.com";

const PRODUCT_CATEGORY: &str = "Fashion";

fn md5_hex(input: &str) -> String { hex::encode(Md5::digest(input.as_bytes())) }

pub struct SslCommerzGateway {
    client: Client,
    base_url: String,
    store_id: String,
    store_password: String,
}

impl SslCommerzGateway {
    pub fn new(store_id: impl Into<String>, store_password: impl Into<String>, sandbox: bool) -> Result<Self, PaymentError> {
        Self::with_base_url(if sandbox { SANDBOX_URL } else { LIVE_URL }, store_id, store_password)
    }

    pub fn with_base_url(base_url: impl Into<String>, store_id: impl Into<String>, store_password: impl Into<String>) -> Result<Self, PaymentError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            store_id: store_id.into(),
            store_password: store_password.into(),
        })
    }

    /// Legacy request signature: md5 over id, transaction, amount, currency, email and password.
    fn request_signature(&self, tran_id: &str, amount: &str, currency: &str, email: &str) -> String {
        md5_hex(&format!("{}{tran_id}{amount}{currency}{email}{}", self.store_id, self.store_password))
    }

    fn session_form(&self, order: &Order, urls: &SessionUrls) -> Vec<(String, String)> {
        let totals = order.totals();
        let amount = format!("{:.2}", totals.total);
        let contact = order.contact();
        let ship = order.shipping_address();
        let state = ship.state.clone().unwrap_or_default();
        let mut form: Vec<(String, String)> = [
            ("store_id", self.store_id.clone()),
            ("store_passwd", self.store_password.clone()),
            ("total_amount", amount.clone()),
            ("currency", totals.currency.clone()),
            ("tran_id", order.order_number().to_string()),
            ("product_category", PRODUCT_CATEGORY.to_string()),
            ("product_name", format!("Order {}", order.order_number())),
            ("product_profile", "general".to_string()),
            ("num_of_item", order.items().len().to_string()),
            ("cus_name", contact.name.clone()),
            ("cus_email", contact.email.clone()),
            ("cus_phone", contact.phone.clone()),
            ("cus_add1", ship.line1.clone()),
            ("cus_city", ship.city.clone()),
            ("cus_state", state.clone()),
            ("cus_postcode", ship.zip_code.clone()),
            ("cus_country", ship.country.clone()),
            ("ship_name", ship.recipient_name.clone()),
            ("ship_add1", ship.line1.clone()),
            ("ship_city", ship.city.clone()),
            ("ship_state", state),
            ("ship_postcode", ship.zip_code.clone()),
            ("ship_country", ship.country.clone()),
            ("shipping_method", "Courier".to_string()),
            ("success_url", urls.success_url.clone()),
            ("fail_url", urls.fail_url.clone()),
            ("cancel_url", urls.cancel_url.clone()),
            ("ipn_url", urls.ipn_url.clone()),
            ("value_a", order.id().to_string()),
            ("value_b", contact.email.clone()),
            ("value_c", contact.phone.clone()),
            ("value_d", order.customer_id().map(|id| id.to_string()).unwrap_or_default()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        for (i, line) in order.items().iter().enumerate() {
            let n = i + 1;
            form.push((format!("product_name_{n}"), line.product_name.clone()));
            form.push((format!("product_category_{n}"), PRODUCT_CATEGORY.to_string()));
            form.push((format!("product_profile_{n}"), "general".to_string()));
            form.push((format!("amount_{n}"), format!("{:.2}", line.unit_price)));
            form.push((format!("quantity_{n}"), line.quantity.to_string()));
        }
        form.push(("signature".to_string(), self.request_signature(order.order_number(), &amount, &totals.currency, &contact.email)));
        form
    }
}

#[derive(Deserialize)]
struct SessionResponse {
    status: Option<String>,
    failedreason: Option<String>,
    sessionkey: Option<String>,
    #[serde(rename = "GatewayPageURL")]
    gateway_page_url: Option<String>,
}

#[derive(Deserialize)]
struct ValidationResponse {
    status: Option<String>,
    tran_id: Option<String>,
    val_id: Option<String>,
    amount: Option<serde_json::Value>,
    currency: Option<String>,
    bank_tran_id: Option<String>,
}

#[derive(Deserialize)]
struct RefundResponse {
    #[serde(rename = "APIConnect")]
    api_connect: Option<String>,
    status: Option<String>,
    refund_ref_id: Option<String>,
    #[serde(rename = "errorReason")]
    error_reason: Option<String>,
}

/// Amounts arrive either as JSON strings ("1260.00") or numbers.
fn decimal_field(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => Decimal::from_str(s.trim()).ok(),
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

#[async_trait]
impl PaymentGateway for SslCommerzGateway {
    #[instrument(skip(self, order, urls), fields(tran_id = %order.order_number()))]
    async fn create_session(&self, order: &Order, urls: &SessionUrls) -> Result<GatewaySession, PaymentError> {
        let response: SessionResponse = self
            .client
            .post(format!("{}/gwprocess/v4/api.php", self.base_url))
            .form(&self.session_form(order, urls))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        match (response.status.as_deref(), response.sessionkey, response.gateway_page_url) {
            (Some("SUCCESS"), Some(session_key), Some(gateway_url)) => Ok(GatewaySession { session_key, gateway_url }),
            (Some("SUCCESS"), _, _) => Err(PaymentError::Malformed("session response without key or URL".into())),
            _ => {
                let reason = response.failedreason.unwrap_or_else(|| "Payment session creation failed".into());
                error!(%reason, "gateway refused session");
                Err(PaymentError::Declined(reason))
            }
        }
    }

    #[instrument(skip(self))]
    async fn validate(&self, val_id: &str) -> Result<ValidatedPayment, PaymentError> {
        let response: ValidationResponse = self
            .client
            .get(format!("{}/validator/api/validationserverAPI.php", self.base_url))
            .query(&[("val_id", val_id), ("store_id", self.store_id.as_str()), ("store_passwd", self.store_password.as_str()), ("format", "json")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let status = response.status.unwrap_or_default();
        if !matches!(status.as_str(), "VALID" | "VALIDATED") {
            return Err(PaymentError::Declined(if status.is_empty() { "no status".into() } else { status }));
        }
        let amount = response
            .amount
            .as_ref()
            .and_then(decimal_field)
            .ok_or_else(|| PaymentError::Malformed("validation without amount".into()))?;
        Ok(ValidatedPayment {
            tran_id: response.tran_id.ok_or_else(|| PaymentError::Malformed("validation without tran_id".into()))?,
            val_id: response.val_id.unwrap_or_else(|| val_id.to_string()),
            amount,
            currency: response.currency.ok_or_else(|| PaymentError::Malformed("validation without currency".into()))?,
            bank_tran_id: response.bank_tran_id.filter(|s| !s.is_empty()),
        })
    }

    #[instrument(skip(self, remarks))]
    async fn refund(&self, bank_tran_id: &str, amount: Decimal, remarks: &str) -> Result<RefundReceipt, PaymentError> {
        let amount = format!("{amount:.2}");
        let response: RefundResponse = self
            .client
            .get(format!("{}/validator/api/merchantTransIDvalidationAPI.php", self.base_url))
            .query(&[
                ("bank_tran_id", bank_tran_id),
                ("refund_amount", amount.as_str()),
                ("refund_remarks", remarks),
                ("store_id", self.store_id.as_str()),
                ("store_passwd", self.store_password.as_str()),
                ("format", "json"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if response.api_connect.as_deref() != Some("DONE") {
            return Err(PaymentError::Malformed(format!("refund API said {:?}", response.api_connect)));
        }
        match (response.status.as_deref(), response.refund_ref_id) {
            (Some("success"), Some(refund_ref)) => Ok(RefundReceipt { refund_ref }),
            _ => {
                let reason = response.error_reason.unwrap_or_else(|| "Refund failed".into());
                error!(%reason, "gateway refused refund");
                Err(PaymentError::Declined(reason))
            }
        }
    }

    fn verify_notification(&self, payload: &IpnPayload) -> bool {
        let (Some(sign), Some(keys)) = (payload.get("verify_sign"), payload.get("verify_key")) else { return false };
        let keys: Vec<&str> = keys.split(',').map(str::trim).filter(|k| !k.is_empty()).collect();
        // The fields the reconciler acts on must be covered by the signature.
        let mut required = vec!["status", "tran_id"];
        if payload.status() == NotificationStatus::Valid {
            required.push("val_id");
        }
        if let Some(missing) = required.iter().find(|field| !keys.contains(*field)) {
            warn!(field = *missing, "notification signature does not cover a required field");
            return false;
        }
        let password_hash = md5_hex(&self.store_password);
        let mut signed: BTreeMap<&str, &str> = BTreeMap::new();
        for key in keys {
            match payload.0.get(key) {
                Some(value) => signed.insert(key, value),
                None => return false,
            };
        }
        signed.insert("store_passwd", &password_hash);
        let message = signed.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&");
        md5_hex(&message).eq_ignore_ascii_case(sign)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{ContactInfo, OrderLine, ShippingAddress};
    use crate::domain::pricing::PricingPolicy;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn order() -> Order {
        let line = OrderLine::new(Uuid::now_v7(), None, "Linen Shirt".into(), None, "SHIRT-1".into(), 2, Decimal::new(600, 0));
        let totals = PricingPolicy::default().totals([(line.unit_price, line.quantity)]);
        let contact = ContactInfo { name: "Rahim".into(), email: "rahim@example.com".into(), phone: "+8801712345678".into() };
        Order::place(Uuid::now_v7(), contact, ShippingAddress::default(), vec![line], totals, None).unwrap()
    }

    fn gateway(server: &MockServer) -> SslCommerzGateway {
        SslCommerzGateway::with_base_url(server.uri(), "store1", "secret").unwrap()
    }

    fn signed(fields: &[(&str, &str)]) -> IpnPayload {
        let keys = fields.iter().map(|(k, _)| *k).collect::<Vec<_>>().join(",");
        let mut sorted: Vec<(String, String)> = fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        sorted.push(("store_passwd".into(), md5_hex("secret")));
        sorted.sort();
        let message = sorted.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&");
        let mut payload: IpnPayload = fields.iter().map(|(k, v)| (*k, *v)).collect();
        payload.0.insert("verify_key".into(), keys);
        payload.0.insert("verify_sign".into(), md5_hex(&message));
        payload
    }

    #[tokio::test]
    async fn opens_session_for_order_total() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/gwprocess/v4/api.php"))
            .and(body_string_contains("total_amount=1260.00"))
            .and(body_string_contains("tran_id=ORD-"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "SUCCESS",
                "sessionkey": "ABC123",
                "GatewayPageURL": "https://sandbox.sslcommerz.com/EasyCheckOut/ABC123"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let session = gateway(&server).create_session(&order(), &SessionUrls::for_site("https://shop.test")).await.unwrap();
        assert_eq!(session.session_key, "ABC123");
        assert!(session.gateway_url.ends_with("ABC123"));
    }

    #[tokio::test]
    async fn failed_session_carries_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/gwprocess/v4/api.php"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "FAILED", "failedreason": "Store Credential Error"})))
            .mount(&server)
            .await;

        let err = gateway(&server).create_session(&order(), &SessionUrls::for_site("https://shop.test")).await.unwrap_err();
        assert!(matches!(err, PaymentError::Declined(reason) if reason == "Store Credential Error"));
    }

    #[tokio::test]
    async fn validates_capture_server_to_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/validator/api/validationserverAPI.php"))
            .and(query_param("val_id", "VAL-1"))
            .and(query_param("store_id", "store1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "VALID", "tran_id": "ORD-00000001", "val_id": "VAL-1",
                "amount": "1260.00", "currency": "BDT", "bank_tran_id": "BANK-9"
            })))
            .mount(&server)
            .await;

        let payment = gateway(&server).validate("VAL-1").await.unwrap();
        assert_eq!(payment.amount, Decimal::new(126000, 2));
        assert_eq!(payment.bank_tran_id.as_deref(), Some("BANK-9"));
    }

    #[tokio::test]
    async fn invalid_transaction_is_declined() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/validator/api/validationserverAPI.php"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "INVALID_TRANSACTION"})))
            .mount(&server)
            .await;

        assert!(matches!(gateway(&server).validate("VAL-X").await, Err(PaymentError::Declined(_))));
    }

    #[tokio::test]
    async fn refund_returns_reference() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/validator/api/merchantTransIDvalidationAPI.php"))
            .and(query_param("bank_tran_id", "BANK-9"))
            .and(query_param("refund_amount", "1260.00"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"APIConnect": "DONE", "status": "success", "refund_ref_id": "R-77"})))
            .mount(&server)
            .await;

        let receipt = gateway(&server).refund("BANK-9", Decimal::new(1260, 0), "customer request").await.unwrap();
        assert_eq!(receipt.refund_ref, "R-77");
    }

    #[test]
    fn notification_signature_round_trip() {
        let gw = SslCommerzGateway::with_base_url("http://localhost", "store1", "secret").unwrap();
        let payload = signed(&[("status", "VALID"), ("tran_id", "ORD-1"), ("val_id", "VAL-1"), ("amount", "1260.00")]);
        assert!(gw.verify_notification(&payload));

        let mut tampered = payload.clone();
        tampered.0.insert("amount".into(), "1.00".into());
        assert!(!gw.verify_notification(&tampered));

        let mut unsigned = payload;
        unsigned.0.remove("verify_sign");
        assert!(!gw.verify_notification(&unsigned));
    }

    #[test]
    fn signature_must_cover_status_and_order() {
        let gw = SslCommerzGateway::with_base_url("http://localhost", "store1", "secret").unwrap();
        let mut swapped = signed(&[("amount", "1260.00")]);
        swapped.0.insert("status".into(), "FAILED".into());
        swapped.0.insert("tran_id".into(), "ORD-VICTIM01".into());
        assert!(!gw.verify_notification(&swapped));

        let failure = signed(&[("status", "FAILED"), ("tran_id", "ORD-1")]);
        assert!(gw.verify_notification(&failure));

        let capture_without_val_id = signed(&[("status", "VALID"), ("tran_id", "ORD-1"), ("amount", "1260.00")]);
        assert!(!gw.verify_notification(&capture_without_val_id));
    }
}
