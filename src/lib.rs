// Sentinel Gateway - Library Root

pub mod api;
pub mod budget;
pub mod cache;
pub mod complexity;
pub mod config;
pub mod optimizer;
pub mod providers;
pub mod request;
pub mod router;

// Re-export the types the binary and integration tests reach for.
pub use config::Config;
pub use request::{GatewayRequest, GatewayResponse, Priority};
pub use router::Router;
