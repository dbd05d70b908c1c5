//! HTTP handlers for the secrets API
//!
//! Each handler maps a request to one dispatcher command and translates the
//! reply or failure into a response.

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use keyring_core::{ErrorCode, KeyringError, RequestId, REQUEST_ID_HEADER};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::codec::{self, WireSecretKey};
use crate::dispatcher::{
    DispatchFailure, Dispatcher, Reply, ADD_KEY, DELETE_KEY, GET_KEY, LIST_ALIASES, LIST_KEYS,
};

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Characters escaped when an alias is placed in a URL path segment
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// State for the secrets handlers
pub struct KeystoreState {
    pub dispatcher: Dispatcher,
    /// How long a request waits for its command to complete
    pub process_timeout: Duration,
}

impl KeystoreState {
    pub fn new(dispatcher: Dispatcher, process_timeout: Duration) -> Self {
        Self {
            dispatcher,
            process_timeout,
        }
    }
}

/// Routes for `/secrets/...`
pub fn secrets_router(state: Arc<KeystoreState>) -> Router {
    Router::new()
        .route("/secrets/aliases", get(list_aliases))
        .route("/secrets/keys", get(list_keys).post(add_key))
        .route("/secrets/keys/:alias", get(get_key).delete(delete_key))
        .with_state(state)
}

// === Handlers ===

/// GET /secrets/aliases
pub async fn list_aliases(State(state): State<Arc<KeystoreState>>) -> Response {
    let request_id = RequestId::new();

    match submit(&state, LIST_ALIASES, String::new()).await {
        Ok(Reply::Aliases(aliases)) if aliases.is_empty() => StatusCode::NO_CONTENT.into_response(),
        Ok(Reply::Aliases(aliases)) => {
            json_response(StatusCode::OK, &codec::sorted_alias_list(aliases), &request_id)
        }
        Ok(other) => unexpected_reply(LIST_ALIASES, &other, &request_id),
        Err(failure) => failure_response(failure, &request_id),
    }
}

/// GET /secrets/keys
pub async fn list_keys(State(state): State<Arc<KeystoreState>>) -> Response {
    let request_id = RequestId::new();

    match submit(&state, LIST_KEYS, String::new()).await {
        Ok(Reply::Keys(keys)) if keys.is_empty() => StatusCode::NO_CONTENT.into_response(),
        Ok(Reply::Keys(keys)) => {
            let wire: Result<BTreeMap<String, WireSecretKey>, _> = keys
                .iter()
                .map(|(alias, record)| codec::encode(record).map(|w| (alias.clone(), w)))
                .collect();
            match wire {
                Ok(wire) => json_response(StatusCode::OK, &wire, &request_id),
                Err(e) => failure_response(e.into(), &request_id),
            }
        }
        Ok(other) => unexpected_reply(LIST_KEYS, &other, &request_id),
        Err(failure) => failure_response(failure, &request_id),
    }
}

/// GET /secrets/keys/{alias}
pub async fn get_key(
    State(state): State<Arc<KeystoreState>>,
    Path(alias): Path<String>,
) -> Response {
    let request_id = RequestId::new();

    match submit(&state, GET_KEY, alias.clone()).await {
        Ok(Reply::Key(Some(record))) => match codec::encode(&record) {
            Ok(wire) => json_response(StatusCode::OK, &wire, &request_id),
            Err(e) => failure_response(e.into(), &request_id),
        },
        Ok(Reply::Key(None)) => error_response(
            ErrorCode::NotFound,
            format!("SecretKey '{}' not found", alias),
            &request_id,
        ),
        Ok(other) => unexpected_reply(GET_KEY, &other, &request_id),
        Err(failure) => failure_response(failure, &request_id),
    }
}

/// POST /secrets/keys
pub async fn add_key(State(state): State<Arc<KeystoreState>>, body: Bytes) -> Response {
    let request_id = RequestId::new();

    let body = match String::from_utf8(body.to_vec()) {
        Ok(body) => body,
        Err(_) => {
            return error_response(
                ErrorCode::Validation,
                "Request body is not valid UTF-8",
                &request_id,
            )
        }
    };
    if body.trim().is_empty() {
        return error_response(
            ErrorCode::Validation,
            "SecretKey is missing from the request body",
            &request_id,
        );
    }

    match submit(&state, ADD_KEY, body).await {
        Ok(Reply::Created(alias)) => {
            info!(request_id = %request_id, alias = %alias, "Secret key created");
            let location = format!(
                "/secrets/keys/{}",
                utf8_percent_encode(&alias, PATH_SEGMENT)
            );
            match HeaderValue::from_str(&location) {
                Ok(location) => {
                    (StatusCode::CREATED, [(header::LOCATION, location)]).into_response()
                }
                Err(_) => error_response(
                    ErrorCode::Applicative,
                    "Internal Server Error",
                    &request_id,
                ),
            }
        }
        Ok(other) => unexpected_reply(ADD_KEY, &other, &request_id),
        Err(failure) => failure_response(failure, &request_id),
    }
}

/// DELETE /secrets/keys/{alias}
pub async fn delete_key(
    State(state): State<Arc<KeystoreState>>,
    Path(alias): Path<String>,
) -> Response {
    let request_id = RequestId::new();

    match submit(&state, DELETE_KEY, alias).await {
        Ok(Reply::Deleted) => StatusCode::NO_CONTENT.into_response(),
        Ok(other) => unexpected_reply(DELETE_KEY, &other, &request_id),
        Err(failure) => failure_response(failure, &request_id),
    }
}

// === Helpers ===

async fn submit(
    state: &KeystoreState,
    command: &str,
    payload: String,
) -> Result<Reply, DispatchFailure> {
    state
        .dispatcher
        .submit(command, payload, state.process_timeout)
        .await
}

fn failure_response(failure: DispatchFailure, request_id: &RequestId) -> Response {
    let message = match &failure {
        DispatchFailure::Timeout(_) => "Server unavailable, retry later".to_string(),
        DispatchFailure::NoHandler(_) => "Internal Server Error".to_string(),
        DispatchFailure::Applicative { message, .. } => message.clone(),
    };
    warn!(request_id = %request_id, error = %failure, "Request failed");
    error_response(failure.code(), message, request_id)
}

fn unexpected_reply(command: &str, reply: &Reply, request_id: &RequestId) -> Response {
    warn!(request_id = %request_id, command = %command, ?reply, "Unexpected reply");
    error_response(ErrorCode::Applicative, "Internal Server Error", request_id)
}

fn json_response<T: Serialize>(status: StatusCode, body: &T, request_id: &RequestId) -> Response {
    match serde_json::to_string(body) {
        Ok(body) => (status, [(header::CONTENT_TYPE, JSON_CONTENT_TYPE)], body).into_response(),
        Err(e) => error_response(
            ErrorCode::Applicative,
            format!("Unable to encode reply: {}", e),
            request_id,
        ),
    }
}

fn error_response(
    code: ErrorCode,
    message: impl Into<String>,
    request_id: &RequestId,
) -> Response {
    let error = KeyringError::new(code, message, request_id.as_str());
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [
            (header::CONTENT_TYPE, JSON_CONTENT_TYPE.to_string()),
            (
                header::HeaderName::from_static(REQUEST_ID_HEADER),
                request_id.to_string(),
            ),
        ],
        error.to_json(),
    )
        .into_response()
}
