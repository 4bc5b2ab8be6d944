//! Request guards for academy isolation and permission enforcement.
//!
//! Guards are tower layers applied per route group. Each reads the
//! [`AuthContext`](context::AuthContext) placed by upstream authentication,
//! resolves membership or permissions through the shared cache, and either
//! denies with the fixed status taxonomy or attaches context for handlers.

pub mod context;
pub mod permission;
pub mod tenant;

pub use context::{
    extract_academy_id, AcademyContext, AuthContext, UserAcademies, UserPermissions,
    ACADEMY_HEADER,
};
pub use permission::{AttachPermissionsLayer, RequirePermissionLayer, RequireRoleLayer};
pub use tenant::{
    AcademyScopeLayer, RequireActiveMembershipLayer, RequireMembershipLayer,
    ResourceAcademyResolver, ValidateResourceAccessLayer,
};
