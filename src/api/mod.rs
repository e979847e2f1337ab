//! REST API module and the prediction route

pub mod auth;
pub mod handlers;
pub mod models;
pub mod routes;

pub use auth::PredictionAuth;
pub use routes::{AppState, create_router};
