//! Gateway callbacks. The IPN answers in JSON; the browser returns redirect
//! the shopper to the storefront's order page.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Redirect;
use axum::routing::post;
use axum::{Form, Json, Router};
use serde::Serialize;
use tracing::error;

use super::AppState;
use crate::payment::{IpnPayload, ReconcileOutcome, RejectReason};
use crate::Result;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/payments/ipn", post(ipn))
        .route("/payments/success", post(success_return))
        .route("/payments/fail", post(fail_return))
        .route("/payments/cancel", post(cancel_return))
}

#[derive(Debug, Serialize)]
pub struct IpnResponse {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

fn reject_reason(reason: RejectReason) -> &'static str {
    match reason {
        RejectReason::InvalidSignature => "invalid_signature",
        RejectReason::UnknownOrder => "unknown_order",
        RejectReason::Malformed => "malformed",
        RejectReason::GatewayDeclined => "gateway_declined",
        RejectReason::AmountMismatch => "amount_mismatch",
    }
}

/// Rejections answer 400; everything else, including replays, 200.
/// Transport failures bubble up as 502 so the gateway retries.
async fn ipn(State(s): State<AppState>, Form(payload): Form<IpnPayload>) -> Result<(StatusCode, Json<IpnResponse>)> {
    let outcome = s.reconciler.handle(&payload).await?;
    let (status, reason) = match outcome {
        ReconcileOutcome::Rejected(reason) => (StatusCode::BAD_REQUEST, Some(reject_reason(reason))),
        _ => (StatusCode::OK, None),
    };
    Ok((status, Json(IpnResponse { outcome: outcome.as_str(), reason })))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReturnKind { Success, Fail, Cancel }

/// Order numbers are echoed into a URL path, so only plain ones are trusted.
fn safe_order_number(payload: &IpnPayload) -> Option<&str> {
    payload
        .tran_id()
        .filter(|t| t.len() <= 64 && t.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'))
}

fn return_label(kind: ReturnKind, outcome: &Result<ReconcileOutcome>) -> &'static str {
    match (kind, outcome) {
        (_, Err(_)) | (_, Ok(ReconcileOutcome::Rejected(_))) => "error",
        (ReturnKind::Success, Ok(ReconcileOutcome::RequiresRefund)) => "review",
        (ReturnKind::Success, Ok(ReconcileOutcome::Ignored)) => "pending",
        (ReturnKind::Success, Ok(_)) => "success",
        (ReturnKind::Fail, Ok(_)) => "failed",
        (ReturnKind::Cancel, Ok(_)) => "cancelled",
    }
}

async fn browser_return(s: &AppState, payload: IpnPayload, kind: ReturnKind) -> Redirect {
    let outcome = s.reconciler.handle(&payload).await;
    if let Err(e) = &outcome {
        error!(tran_id = payload.tran_id().unwrap_or_default(), error = %e, "payment return could not be reconciled");
    }
    let label = return_label(kind, &outcome);
    let base = s.config.frontend_url.trim_end_matches('/');
    let target = match safe_order_number(&payload) {
        Some(order_number) => format!("{base}/orders/{order_number}?payment={label}"),
        None => format!("{base}/orders?payment={label}"),
    };
    Redirect::to(&target)
}

async fn success_return(State(s): State<AppState>, Form(payload): Form<IpnPayload>) -> Redirect {
    browser_return(&s, payload, ReturnKind::Success).await
}

async fn fail_return(State(s): State<AppState>, Form(payload): Form<IpnPayload>) -> Redirect {
    browser_return(&s, payload, ReturnKind::Fail).await
}

async fn cancel_return(State(s): State<AppState>, Form(payload): Form<IpnPayload>) -> Redirect {
    browser_return(&s, payload, ReturnKind::Cancel).await
}
