//! Basic authentication for prediction traffic

use crate::config::AuthConfig;
use crate::types::RouteName;
use axum::{
    Json,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

/// Why a prediction request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    MissingCredentials,
    Unauthorized,
}

impl AuthFailure {
    fn message(&self) -> &'static str {
        match self {
            AuthFailure::MissingCredentials => "No basic authentication provided",
            AuthFailure::Unauthorized => "Unauthorized",
        }
    }
}

impl IntoResponse for AuthFailure {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": self.message() })),
        )
            .into_response()
    }
}

struct Keys {
    apikey: String,
    read_only_key: Option<String>,
}

#[derive(Default)]
struct AuthTable {
    users: HashMap<String, Keys>,
    /// (owner, model, user)
    shared: HashSet<(String, String, String)>,
}

impl From<&AuthConfig> for AuthTable {
    fn from(config: &AuthConfig) -> Self {
        Self {
            users: config
                .users
                .iter()
                .map(|creds| {
                    (
                        creds.user.clone(),
                        Keys {
                            apikey: creds.apikey.clone(),
                            read_only_key: creds.read_only_key.clone(),
                        },
                    )
                })
                .collect(),
            shared: config
                .shared
                .iter()
                .map(|s| (s.owner.clone(), s.model.clone(), s.user.clone()))
                .collect(),
        }
    }
}

/// Decides whether a request may call a model.
///
/// Owners may use their api key or read-only key. Other users need the
/// model shared with them and must present their own api key.
pub struct PredictionAuth {
    table: RwLock<AuthTable>,
}

impl PredictionAuth {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            table: RwLock::new(AuthTable::from(config)),
        }
    }

    /// Replace every credential and share at once
    pub fn set_auth(&self, config: &AuthConfig) {
        let table = AuthTable::from(config);
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = table;
        tracing::info!(
            users = config.users.len(),
            shared = config.shared.len(),
            "Prediction credentials replaced"
        );
    }

    pub fn authorize(&self, headers: &HeaderMap, route: &RouteName) -> Result<(), AuthFailure> {
        let (user, key) = basic_credentials(headers).ok_or(AuthFailure::MissingCredentials)?;

        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let keys = table.users.get(&user).ok_or(AuthFailure::Unauthorized)?;

        let allowed = if user == route.user {
            constant_time_eq(&keys.apikey, &key)
                || keys
                    .read_only_key
                    .as_deref()
                    .is_some_and(|ro| constant_time_eq(ro, &key))
        } else {
            constant_time_eq(&keys.apikey, &key)
                && table
                    .shared
                    .contains(&(route.user.clone(), route.model.clone(), user.clone()))
        };

        if allowed {
            Ok(())
        } else {
            tracing::debug!(user = %user, route = %route, "Prediction refused");
            Err(AuthFailure::Unauthorized)
        }
    }
}

/// Compares keys without returning early on the first differing byte
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Username and password from an `Authorization: Basic` header
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, key) = decoded.split_once(':')?;
    Some((user.to_string(), key.to_string()))
}
