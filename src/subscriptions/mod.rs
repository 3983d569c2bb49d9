pub mod dto;
pub mod handlers;
pub mod repo;
pub mod repo_types;
pub mod services;

use crate::rate_limit::Limits;
use crate::state::AppState;
use axum::Router;

pub fn router(limits: &Limits) -> Router<AppState> {
    Router::new()
        .merge(handlers::public_routes(limits))
        .merge(handlers::admin_routes())
}
