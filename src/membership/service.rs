//! Membership write operations with read-your-writes cache invalidation.
//!
//! Every mutation goes through [`MembershipService`], which applies the
//! change to the store and then synchronously invalidates the cached
//! entries for the affected `(user, academy)` pair. A permission check
//! issued after any of these calls returns observes the new state.

use crate::cache::PermissionCache;
use crate::error::Result;
use crate::membership::models::{
    AcademyId, DepartmentId, Membership, MembershipStatus, RoleId, UserId,
};
use crate::membership::store::MembershipStore;
use std::sync::Arc;
use tracing::info;

/// Coordinates membership mutations with the permission cache.
pub struct MembershipService {
    store: Arc<dyn MembershipStore>,
    cache: Arc<PermissionCache>,
}

impl MembershipService {
    pub fn new(store: Arc<dyn MembershipStore>, cache: Arc<PermissionCache>) -> Self {
        Self { store, cache }
    }

    /// Add a member to an academy.
    pub async fn add_member(&self, membership: Membership) -> Result<Membership> {
        let added = self.store.insert(membership).await?;
        self.cache
            .invalidate_membership(&added.user_id, &added.academy_id);
        info!(
            user_id = %added.user_id,
            academy_id = %added.academy_id,
            role_id = %added.role_id,
            "member added"
        );
        Ok(added)
    }

    /// Change a member's role.
    pub async fn change_role(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        role_id: RoleId,
    ) -> Result<Membership> {
        let updated = self.store.set_role(user_id, academy_id, role_id).await?;
        self.cache.invalidate_membership(user_id, academy_id);
        info!(
            user_id = %user_id,
            academy_id = %academy_id,
            role_id = %updated.role_id,
            "member role changed"
        );
        Ok(updated)
    }

    /// Move a member into a department, or out of any department.
    pub async fn transfer_department(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        department_id: Option<DepartmentId>,
    ) -> Result<Membership> {
        let updated = self
            .store
            .set_department(user_id, academy_id, department_id)
            .await?;
        self.cache.invalidate_membership(user_id, academy_id);
        Ok(updated)
    }

    /// Suspend a membership.
    pub async fn suspend(&self, user_id: &UserId, academy_id: &AcademyId) -> Result<Membership> {
        self.set_status(user_id, academy_id, MembershipStatus::Suspended)
            .await
    }

    /// Reactivate a suspended or pending membership.
    pub async fn reactivate(&self, user_id: &UserId, academy_id: &AcademyId) -> Result<Membership> {
        self.set_status(user_id, academy_id, MembershipStatus::Active)
            .await
    }

    /// Archive a membership.
    pub async fn archive(&self, user_id: &UserId, academy_id: &AcademyId) -> Result<Membership> {
        self.set_status(user_id, academy_id, MembershipStatus::Archived)
            .await
    }

    async fn set_status(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        status: MembershipStatus,
    ) -> Result<Membership> {
        let updated = self.store.set_status(user_id, academy_id, status).await?;
        self.cache.invalidate_membership(user_id, academy_id);
        info!(
            user_id = %user_id,
            academy_id = %academy_id,
            status = %status,
            "membership status changed"
        );
        Ok(updated)
    }

    /// Grant a custom permission on top of the member's role.
    pub async fn grant_custom_permission(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        permission_name: &str,
    ) -> Result<Membership> {
        let updated = self
            .store
            .set_custom_permission(user_id, academy_id, permission_name, Some(true))
            .await?;
        self.cache.invalidate_membership(user_id, academy_id);
        Ok(updated)
    }

    /// Remove a custom permission entry.
    pub async fn revoke_custom_permission(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        permission_name: &str,
    ) -> Result<Membership> {
        let updated = self
            .store
            .set_custom_permission(user_id, academy_id, permission_name, None)
            .await?;
        self.cache.invalidate_membership(user_id, academy_id);
        Ok(updated)
    }

    /// Remove a member from an academy. Returns whether a membership existed.
    pub async fn remove_member(&self, user_id: &UserId, academy_id: &AcademyId) -> Result<bool> {
        let removed = self.store.remove(user_id, academy_id).await?;
        self.cache.invalidate_membership(user_id, academy_id);
        if removed {
            info!(user_id = %user_id, academy_id = %academy_id, "member removed");
        }
        Ok(removed)
    }
}
