//! Academy membership: models, store access, and write operations.
//!
//! - [`models`]: identifier newtypes, membership status, and the
//!   [`Membership`] record itself
//! - [`store`]: the [`MembershipStore`] trait with in-memory and Postgres
//!   implementations
//! - [`service`]: mutations that keep the permission cache consistent

pub mod models;
pub mod service;
pub mod store;

pub use models::{AcademyId, DepartmentId, Membership, MembershipStatus, RoleId, UserId};
pub use service::MembershipService;
pub use store::{InMemoryMembershipStore, MembershipStore, PostgresMembershipStore};
