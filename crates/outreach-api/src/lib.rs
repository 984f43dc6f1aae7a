//! Outreach API - Webhook intake and operator endpoints

pub mod auth;
pub mod handlers;
pub mod routes;

pub use auth::AppState;
pub use routes::create_router;
