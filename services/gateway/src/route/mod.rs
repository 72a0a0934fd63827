pub mod access;
pub mod error;
pub mod resolver;
pub mod table;
pub mod types;

pub use access::{check_accessible, check_read_access, AccessContext, Principal, PrincipalExtractor};
pub use error::RouteError;
pub use resolver::RouteResolver;
pub use table::RouteTable;
pub use types::{
    roles_from_csv, roles_to_csv, NewRouteRule, RouteRule, RouteType, ADMIN_ROLE, ANONYMOUS_ROLE,
};
