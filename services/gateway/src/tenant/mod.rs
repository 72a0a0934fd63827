pub mod error;
pub mod metadata;
pub mod resolver;
pub mod types;

pub use error::TenantError;
pub use metadata::TenantMetadataCache;
pub use resolver::TenantResolver;
pub use types::{default_feature_flags, TenantMetadata, TenantRule, DEFAULT_THEME};

/// Tenant id reported when no request context is bound.
pub const DEFAULT_TENANT_ID: &str = "DEFAULT";
