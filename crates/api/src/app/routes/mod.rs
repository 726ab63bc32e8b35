use axum::{
    Router,
    routing::{get, post},
};

pub mod consumers;
pub mod credits;
pub mod system;

/// Operational endpoints; `/health` is mounted by `build_app`.
pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(system::metrics))
        .route(
            "/consumers/:tenant",
            post(consumers::warm_start).delete(consumers::remove),
        )
        .route("/credits/:tenant/check", post(credits::check))
        .route("/credits/:tenant/deduct", post(credits::deduct))
}
