use crate::rate_limit::Limits;
use crate::state::AppState;
use axum::Router;

pub mod dto;
pub mod extractors;
pub mod handlers;
pub mod repo;
pub mod repo_types;
pub mod services;

pub fn router(limits: &Limits) -> Router<AppState> {
    Router::new()
        .merge(handlers::auth_routes(limits))
        .merge(handlers::me_routes())
}
