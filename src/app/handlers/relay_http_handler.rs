use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use actix_web::{get, post, web, HttpResponse, Responder};
use chrono::{DateTime, Local};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::app::handlers::handler_error::ControllerError;
use crate::app::service::bypass_engine::TerminalKind;
use crate::app::service::frame_codec::extract_tlv;
use crate::app::service::policy_store::PolicyStore;
use crate::app::service::relay_core::{self, RelayError, RelayOutcome};
use crate::models::relay::{RelayRequest, StatusBody};

/// Shared state for the JSON relay path.
pub struct HttpState {
    pub store: Arc<PolicyStore>,
    pub limiter: Arc<Semaphore>,
    pub started: DateTime<Local>,
    pub requests: AtomicU64,
}

impl HttpState {
    pub fn new(store: Arc<PolicyStore>, max_concurrent: usize) -> Self {
        Self {
            store,
            limiter: Arc::new(Semaphore::new(max_concurrent)),
            started: Local::now(),
            requests: AtomicU64::new(0),
        }
    }
}

/// Stateless JSON relay: same extraction precedence and modification
/// path as the TCP pipeline, without the outer framing.
#[post("/")]
pub async fn relay(
    state: web::Data<HttpState>,
    body: web::Json<RelayRequest>,
) -> Result<HttpResponse, ControllerError> {
    let _permit = state
        .limiter
        .acquire()
        .await
        .map_err(|_| ControllerError::InternalError)?;

    let policy = state.store.read();
    if policy.block_all {
        warn!("HTTP relay rejected: block_all engaged");
        return Err(ControllerError::Blocked);
    }

    let tlv_bytes = extract_tlv(&body).map_err(|e| {
        warn!("HTTP relay envelope rejected: {}", e);
        ControllerError::BadClientData
    })?;

    let terminal = body
        .terminal_type
        .as_deref()
        .and_then(|t| t.parse().ok())
        .unwrap_or(TerminalKind::Pos);

    let signer = state.store.signer();
    let outcome =
        relay_core::process_tlv(&tlv_bytes, terminal, &policy, &signer).map_err(|e| match e {
            RelayError::Parse(parse_err) => {
                warn!("HTTP relay TLV rejected: {}", parse_err);
                ControllerError::BadClientData
            }
            other => {
                error!("HTTP relay failed: {}", other);
                ControllerError::InternalError
            }
        })?;

    match outcome {
        RelayOutcome::Blocked => Err(ControllerError::Blocked),
        RelayOutcome::Processed(processed) => {
            state.requests.fetch_add(1, Ordering::Relaxed);
            info!(
                "HTTP relay processed: {} edits={}",
                processed.card,
                processed.response.mitm.applied_edits.len()
            );
            Ok(HttpResponse::Ok().json(processed.response))
        }
    }
}

#[get("/")]
pub async fn health(state: web::Data<HttpState>) -> impl Responder {
    HttpResponse::Ok().json(StatusBody {
        status: "ok",
        uptime_secs: (Local::now() - state.started).num_seconds(),
        frames_processed: state.requests.load(Ordering::Relaxed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::security::signer::PayloadSigner;
    use crate::app::service::policy_store::PolicyState;
    use actix_web::{test, App};

    fn state(block_all: bool) -> web::Data<HttpState> {
        let policy = PolicyState {
            bypass_pin: true,
            cdcvm_enabled: true,
            block_all,
            ..Default::default()
        };
        web::Data::new(HttpState::new(
            Arc::new(PolicyStore::new(policy, PayloadSigner::unsigned())),
            4,
        ))
    }

    #[actix_web::test]
    async fn test_relay_happy_path() {
        let app =
            test::init_service(App::new().app_data(state(false)).service(relay).service(health))
                .await;

        let req = test::TestRequest::post()
            .uri("/")
            .set_json(serde_json::json!({
                "raw_tlv_hex": "5A0841111111111111119F070100",
                "terminal_type": "POS"
            }))
            .to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        let tlv_hex = resp["modified_tlv_hex"].as_str().expect("tlv hex");
        assert!(tlv_hex.contains("9F34031F0300"));
        assert_eq!(resp["mitm"]["signature_tag_present"], false);
        assert!(resp["mitm"]["success_probability"].as_f64().unwrap() > 0.0);
    }

    #[actix_web::test]
    async fn test_relay_blocked_is_403() {
        let app = test::init_service(App::new().app_data(state(true)).service(relay)).await;
        let req = test::TestRequest::post()
            .uri("/")
            .set_json(serde_json::json!({ "raw_tlv_hex": "5A084111111111111111" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn test_relay_empty_envelope_is_400() {
        let app = test::init_service(App::new().app_data(state(false)).service(relay)).await;
        let req = test::TestRequest::post()
            .uri("/")
            .set_json(serde_json::json!({}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_health_probe() {
        let app = test::init_service(App::new().app_data(state(false)).service(health)).await;
        let req = test::TestRequest::get().uri("/").to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp["status"], "ok");
    }
}
