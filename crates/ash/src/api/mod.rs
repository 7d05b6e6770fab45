//! HTTP surface: REST routes, SSE streaming, auth wiring.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod runner_api;
pub mod sse;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use runner_api::{RunnerApiState, create_runner_router};
pub use state::AppState;
