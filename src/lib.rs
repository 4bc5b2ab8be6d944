//! # Academy Core
//!
//! Multi-tenant access control for the academy platform.
//!
//! ## Architecture
//!
//! - **Membership**: academy membership models, store access, and write
//!   operations with read-your-writes invalidation
//! - **RBAC**: permission names, the role catalog, and fail-closed
//!   permission resolution
//! - **Cache**: short-TTL permission cache with single-flight loads and
//!   synchronous invalidation
//! - **Middleware**: tower guards for academy isolation and permission
//!   enforcement
//! - **Telemetry**: structured logging configuration
//!
//! ## Denial taxonomy
//!
//! Every guard denial is an [`error::AccessError`] with a fixed HTTP
//! status: missing principal is 401, missing academy scope is 400,
//! non-membership and insufficient permissions are 403. A failing backing
//! store never grants access; boolean checks fold failures into deny.

pub mod cache;
pub mod config;
pub mod error;
pub mod membership;
pub mod middleware;
pub mod rbac;
pub mod telemetry;

pub use error::{
    AcademyError, AccessError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{CacheStats, Clock, InvalidationEvent, PermissionCache, SystemClock};
    pub use crate::config::{CacheConfig, CoreConfig, DatabaseConfig};
    pub use crate::error::{
        AcademyError, AccessError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result,
    };
    pub use crate::membership::{
        AcademyId, DepartmentId, InMemoryMembershipStore, Membership, MembershipService,
        MembershipStatus, MembershipStore, PostgresMembershipStore, RoleId, UserId,
    };
    pub use crate::middleware::{
        AcademyContext, AcademyScopeLayer, AttachPermissionsLayer, AuthContext,
        RequireActiveMembershipLayer, RequireMembershipLayer, RequirePermissionLayer,
        RequireRoleLayer, ResourceAcademyResolver, UserAcademies, UserPermissions,
        ValidateResourceAccessLayer,
    };
    pub use crate::rbac::{
        Permission, PermissionResolver, PermissionSet, Role, RoleCatalog, RoleCatalogBuilder,
        RoleGrant, SeedRole,
    };
}
