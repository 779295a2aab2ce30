//! HTTP surface
//!
//! Minimal by design: the trust subsystem is consumed by collaborators
//! through narrow contracts, so the built-in surface is a health probe, a
//! login endpoint exercising credential validation, and a metrics text
//! endpoint. Uses hyper http1 with TokioIo for async handling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, warn};

use crate::auth::validate_credential;
use crate::config::Args;
use crate::keys::FieldCipher;
use crate::pki::CertificateProvider;
use crate::store::Store;
use crate::types::WardenError;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub store: Store,
    pub cipher: Arc<FieldCipher>,
    pub certificate_provider: Arc<dyn CertificateProvider>,
    pub started_at: Instant,
}

/// Serve one API connection (plaintext or TLS).
pub async fn serve_connection<S>(stream: S, state: Arc<AppState>, addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_request(state, req).await }
    });

    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
        debug!("Error serving connection from {}: {:?}", addr, err);
    }
}

/// Serve one metrics connection.
pub async fn serve_metrics_connection<S>(stream: S, state: Arc<AppState>, addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |_req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { Ok::<_, WardenError>(metrics_response(&state)) }
    });

    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
        debug!("Error serving metrics connection from {}: {:?}", addr, err);
    }
}

async fn handle_request(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, WardenError> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| WardenError::Http(e.to_string()))?
        .to_bytes();

    Ok(route(&state, &method, &path, body))
}

/// Dispatch a request. Separated from hyper plumbing so handlers are
/// directly testable.
pub(crate) fn route(state: &AppState, method: &Method, path: &str, body: Bytes) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/healthz") => json_response(
            StatusCode::OK,
            &json!({
                "status": "ok",
                "node_id": state.args.node_id,
            }),
        ),
        (&Method::POST, "/v1/login") => handle_login(state, &body),
        _ => json_response(StatusCode::NOT_FOUND, &json!({"error": "not found"})),
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    name: String,
    password: String,
}

fn handle_login(state: &AppState, body: &[u8]) -> Response<Full<Bytes>> {
    let payload: LoginRequest = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(_) => {
            return json_response(StatusCode::BAD_REQUEST, &json!({"error": "malformed request"}));
        }
    };

    let result = state
        .store
        .get_identity_by_name(&payload.name)
        .and_then(|identity| validate_credential(&state.store, &identity.id, &payload.password));

    match result {
        Ok(one_time_password) => json_response(
            StatusCode::OK,
            &json!({
                "ok": true,
                "one_time_password": one_time_password,
            }),
        ),
        // Credential failures collapse into one generic answer; the
        // distinct causes are only visible in our own logs.
        Err(err) if err.is_credential_failure() => {
            warn!(name = %payload.name, cause = %err, "Login rejected");
            json_response(StatusCode::UNAUTHORIZED, &json!({"error": "unauthorized"}))
        }
        Err(err) => {
            error!(name = %payload.name, error = %err, "Login failed internally");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &json!({"error": "internal error"}),
            )
        }
    }
}

fn metrics_response(state: &AppState) -> Response<Full<Bytes>> {
    let uptime = state.started_at.elapsed().as_secs();
    let active_cas = state.certificate_provider.active_cas().len();
    let body = format!(
        "warden_build_info{{commit=\"{}\"}} 1\nwarden_uptime_seconds {}\nwarden_active_ca_generations {}\n",
        option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
        uptime,
        active_cas,
    );

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_default()
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::hash_password;
    use crate::keys::{SymmetricKey, ALGORITHM_CHACHA20_POLY1305, DATA_KEY_LEN};
    use crate::pki::NativeCertificateProvider;
    use crate::store::{Credential, Identity};
    use clap::Parser;
    use rand::rngs::OsRng;
    use rand::RngCore;

    fn test_state() -> AppState {
        let store = Store::open_in_memory().unwrap();
        let mut material = [0u8; DATA_KEY_LEN];
        OsRng.fill_bytes(&mut material);
        let key = SymmetricKey::new(material, ALGORITHM_CHACHA20_POLY1305, "default", vec![])
            .with_key_id(1);
        let cipher = Arc::new(FieldCipher::new(key));
        let provider = Arc::new(
            NativeCertificateProvider::new(store.clone(), Arc::clone(&cipher), 365).unwrap(),
        );

        AppState {
            args: Args::parse_from(["warden"]),
            store,
            cipher,
            certificate_provider: provider,
            started_at: Instant::now(),
        }
    }

    fn seed_login(state: &AppState, name: &str, password: &str, one_time: bool) {
        let identity = Identity::new(name);
        state.store.create_identity(&identity).unwrap();
        let hash = hash_password(password).unwrap();
        state
            .store
            .create_credential(&Credential::new(&identity.id, hash, one_time))
            .unwrap();
    }

    #[test]
    fn test_healthz() {
        let state = test_state();
        let resp = route(&state, &Method::GET, "/healthz", Bytes::new());
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn test_unknown_route_is_404() {
        let state = test_state();
        let resp = route(&state, &Method::GET, "/v1/nope", Bytes::new());
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_login_success_and_otp_replay() {
        let state = test_state();
        seed_login(&state, "admin", "hunter2", true);

        let body = Bytes::from(r#"{"name":"admin","password":"hunter2"}"#);
        let resp = route(&state, &Method::POST, "/v1/login", body.clone());
        assert_eq!(resp.status(), StatusCode::OK);

        // Replaying the consumed one-time password: generic unauthorized
        let resp = route(&state, &Method::POST, "/v1/login", body);
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_login_failures_are_indistinguishable() {
        let state = test_state();
        seed_login(&state, "admin", "hunter2", false);

        let wrong_password = route(
            &state,
            &Method::POST,
            "/v1/login",
            Bytes::from(r#"{"name":"admin","password":"nope"}"#),
        );
        let unknown_identity = route(
            &state,
            &Method::POST,
            "/v1/login",
            Bytes::from(r#"{"name":"ghost","password":"nope"}"#),
        );

        assert_eq!(wrong_password.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(unknown_identity.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_login_malformed_body_is_400() {
        let state = test_state();
        let resp = route(&state, &Method::POST, "/v1/login", Bytes::from("not json"));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_metrics_render() {
        let state = test_state();
        let resp = metrics_response(&state);
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
