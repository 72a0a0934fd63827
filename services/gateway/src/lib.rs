pub mod admin;
pub mod admission;
pub mod api;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod ratelimit;
pub mod route;
pub mod server;
pub mod session;
pub mod store;
pub mod tenant;

pub use api::{create_router, ApiState, ErrorResponse};
pub use config::GatewayConfig;
pub use error::AdmissionError;
pub use server::GatewayServer;
