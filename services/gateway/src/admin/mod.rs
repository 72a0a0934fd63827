//! Administrative write path for tenants and routes.

pub mod error;
pub mod routes;
pub mod tenants;

pub use error::AdminError;
pub use routes::RouteAdmin;
pub use tenants::{CreateTenant, TenantAdmin, UpdateTenant};
