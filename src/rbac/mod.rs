//! Role-based access control.
//!
//! - [`models`]: permission names (`resource.action`), permission sets, roles
//! - [`catalog`]: the immutable role catalog snapshot with global, scoped,
//!   and department-override grants
//! - [`resolver`]: fail-closed permission resolution over the cache

pub mod catalog;
pub mod models;
pub mod resolver;

pub use catalog::{RoleCatalog, RoleCatalogBuilder, RoleGrant, SeedRole};
pub use models::{Permission, PermissionParseError, PermissionSet, Role};
pub use resolver::PermissionResolver;
