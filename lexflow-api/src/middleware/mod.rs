//! Axum middleware for the gate

mod gate;

pub use gate::{gate_middleware, AdminExtractor, PrincipalExtractor, RateLimitBypassed};
