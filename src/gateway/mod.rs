//! HTTP admission gateway.
//!
//! The only layer that touches request and response types. It turns the
//! limiter's boolean into either a pass-through or a fixed 429 response.

mod middleware;
mod server;

pub use middleware::{admission_middleware, protect, rejection, API_KEY_HEADER, REJECTION_MESSAGE};
pub use server::{router, run, GatewayServer};
