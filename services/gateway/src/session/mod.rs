//! Concurrent session limits per (identity, tenant).

pub mod engine;
pub mod error;
pub mod policy;
pub mod registry;

pub use engine::{Authentication, SessionGrant, SessionPolicyEngine};
pub use error::SessionError;
pub use policy::{SessionLimit, SessionLimitPolicy, UNLIMITED};
pub use registry::{PrincipalKey, Registration, SessionRecord, SessionRegistry};
