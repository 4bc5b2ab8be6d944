//! Permission resolution.
//!
//! [`PermissionResolver`] answers the core access question: does this user
//! hold this permission in this academy? Resolution is fail-closed:
//!
//! - no membership, or a non-active one, denies
//! - a store or cache failure denies (folded into
//!   [`AccessError::DependencyUnavailable`], never into "allowed")
//!
//! The effective permission set is the union of the role's global grants,
//! the role's academy-scoped grants, the additive department override, and
//! the membership's custom permission grants. Batch checks resolve the set
//! once and answer every question from that one snapshot.

use crate::cache::PermissionCache;
use crate::error::AccessError;
use crate::membership::models::{AcademyId, Membership, UserId};
use crate::membership::store::MembershipStore;
use crate::rbac::catalog::RoleCatalog;
use crate::rbac::models::{Permission, PermissionSet};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves effective permissions for `(user, academy)` pairs.
pub struct PermissionResolver {
    store: Arc<dyn MembershipStore>,
    cache: Arc<PermissionCache>,
    catalog: RwLock<Arc<RoleCatalog>>,
}

impl PermissionResolver {
    pub fn new(
        store: Arc<dyn MembershipStore>,
        cache: Arc<PermissionCache>,
        catalog: RoleCatalog,
    ) -> Self {
        Self {
            store,
            cache,
            catalog: RwLock::new(Arc::new(catalog)),
        }
    }

    /// The current role catalog snapshot.
    pub fn catalog(&self) -> Arc<RoleCatalog> {
        self.catalog.read().clone()
    }

    /// Swap in a new catalog snapshot and drop all cached permission sets.
    /// Cached memberships survive: a catalog change alters what roles grant,
    /// not who is a member.
    pub fn replace_catalog(&self, catalog: RoleCatalog) {
        *self.catalog.write() = Arc::new(catalog);
        self.cache.invalidate_permissions(None);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Membership resolution
    // ─────────────────────────────────────────────────────────────────────────

    /// The user's membership in the academy, any status, through the cache.
    pub async fn membership(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
    ) -> Result<Option<Membership>, AccessError> {
        self.cache
            .membership_or_load(user_id, academy_id, || {
                self.store.get_membership(user_id, academy_id)
            })
            .await
            .map_err(AccessError::from)
    }

    /// The user's membership, required to exist and be active.
    pub async fn active_membership(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
    ) -> Result<Membership, AccessError> {
        let membership = self
            .membership(user_id, academy_id)
            .await?
            .ok_or(AccessError::NotAMember)?;
        if !membership.is_active() {
            return Err(AccessError::InactiveMembership(
                membership.status.to_string(),
            ));
        }
        Ok(membership)
    }

    /// Whether the user holds an active membership. Errors fold into `false`.
    pub async fn is_member(&self, user_id: &UserId, academy_id: &AcademyId) -> bool {
        match self.membership(user_id, academy_id).await {
            Ok(Some(membership)) => membership.is_active(),
            Ok(None) => false,
            Err(error) => {
                debug!(user_id = %user_id, academy_id = %academy_id, %error, "membership check failed closed");
                false
            }
        }
    }

    /// Academies where the user holds an active membership. Uncached; this
    /// serves enumeration, not the per-request hot path.
    pub async fn academies_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<Membership>, AccessError> {
        self.store
            .academies_for_user(user_id)
            .await
            .map_err(AccessError::from)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Permission resolution
    // ─────────────────────────────────────────────────────────────────────────

    /// Check one permission. `Ok(())` means allowed; every `Err` is a deny
    /// with its precise reason.
    pub async fn check(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        permission: &Permission,
    ) -> Result<(), AccessError> {
        let membership = self.active_membership(user_id, academy_id).await?;
        let effective = self.effective_permissions(&membership).await?;
        if effective.contains(permission) {
            Ok(())
        } else {
            Err(AccessError::PermissionDenied(format!(
                "Missing required permission: {}",
                permission
            )))
        }
    }

    /// Boolean form of [`check`](Self::check). Errors fold into `false`.
    pub async fn has_permission(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        permission: &Permission,
    ) -> bool {
        match self.check(user_id, academy_id, permission).await {
            Ok(()) => true,
            Err(error) => {
                debug!(
                    user_id = %user_id,
                    academy_id = %academy_id,
                    permission = %permission,
                    %error,
                    "permission denied"
                );
                false
            }
        }
    }

    /// Answer several permission questions from one resolved snapshot.
    ///
    /// The membership and effective set are resolved once, so the answers
    /// are mutually consistent even if an invalidation lands mid-call. Any
    /// resolution failure denies every permission in the batch.
    pub async fn check_permissions(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        permissions: &[Permission],
    ) -> BTreeMap<String, bool> {
        let effective = match self.active_membership(user_id, academy_id).await {
            Ok(membership) => match self.effective_permissions(&membership).await {
                Ok(effective) => Some(effective),
                Err(error) => {
                    debug!(user_id = %user_id, academy_id = %academy_id, %error, "batch check failed closed");
                    None
                }
            },
            Err(error) => {
                debug!(user_id = %user_id, academy_id = %academy_id, %error, "batch check failed closed");
                None
            }
        };

        permissions
            .iter()
            .map(|p| {
                let allowed = effective.as_ref().map(|e| e.contains(p)).unwrap_or(false);
                (p.name(), allowed)
            })
            .collect()
    }

    /// Whether the user's active membership carries the named role. The name
    /// matches the role id or the catalog role name, case-insensitively.
    /// Errors fold into `false`.
    pub async fn has_role(&self, user_id: &UserId, academy_id: &AcademyId, role_name: &str) -> bool {
        let membership = match self.active_membership(user_id, academy_id).await {
            Ok(membership) => membership,
            Err(error) => {
                debug!(user_id = %user_id, academy_id = %academy_id, role = role_name, %error, "role check failed closed");
                return false;
            }
        };

        if membership.role_id.as_str().eq_ignore_ascii_case(role_name) {
            return true;
        }
        let catalog = self.catalog();
        catalog
            .role(&membership.role_id)
            .map(|role| role.name.eq_ignore_ascii_case(role_name))
            .unwrap_or(false)
    }

    /// The full effective permission set for the user in the academy.
    /// Requires an active membership.
    pub async fn user_permissions(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
    ) -> Result<PermissionSet, AccessError> {
        let membership = self.active_membership(user_id, academy_id).await?;
        self.effective_permissions(&membership).await
    }

    /// The union of the user's effective permissions across every academy
    /// where they hold an active membership. A user with no memberships
    /// gets an empty set, not an error.
    ///
    /// This answers "can this user do X anywhere", not "in this academy" —
    /// enforcement decisions use the academy-scoped form.
    pub async fn user_permissions_all(
        &self,
        user_id: &UserId,
    ) -> Result<PermissionSet, AccessError> {
        let memberships = self.academies_for_user(user_id).await?;
        let mut union = PermissionSet::new();
        for membership in &memberships {
            union.extend(self.effective_permissions(membership).await?);
        }
        Ok(union)
    }

    /// Effective set for a resolved membership, through the fine cache.
    async fn effective_permissions(
        &self,
        membership: &Membership,
    ) -> Result<PermissionSet, AccessError> {
        let catalog = self.catalog();
        let snapshot = membership.clone();
        self.cache
            .permissions_or_load(
                &membership.user_id,
                &membership.academy_id,
                membership.department_id.as_ref(),
                || async move { Ok(compute_effective(&catalog, &snapshot)) },
            )
            .await
            .map_err(AccessError::from)
    }
}

/// Union of role grants, department additions, and custom grants.
fn compute_effective(catalog: &RoleCatalog, membership: &Membership) -> PermissionSet {
    let mut effective = catalog.permissions_for(&membership.role_id, &membership.academy_id);

    if let Some(department_id) = &membership.department_id {
        if let Some(additions) = catalog.department_additions(&membership.academy_id, department_id)
        {
            effective.extend(additions.iter().cloned());
        }
    }

    for name in membership.granted_custom_permissions() {
        match Permission::parse(name) {
            Ok(permission) => {
                effective.insert(permission);
            }
            Err(_) => {
                warn!(permission = name, "skipping malformed custom permission grant");
            }
        }
    }

    effective
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStats, ManualClock};
    use crate::config::CacheConfig;
    use crate::error::{AcademyError, ErrorCode, Result};
    use crate::membership::models::{DepartmentId, MembershipStatus, RoleId};
    use crate::membership::store::InMemoryMembershipStore;
    use crate::membership::MembershipService;
    use async_trait::async_trait;
    use std::time::Duration;

    fn perm(name: &str) -> Permission {
        Permission::parse(name).unwrap()
    }

    struct Fixture {
        store: Arc<InMemoryMembershipStore>,
        cache: Arc<PermissionCache>,
        resolver: PermissionResolver,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryMembershipStore::new());
            let cache = Arc::new(PermissionCache::with_defaults());
            let resolver = PermissionResolver::new(
                store.clone(),
                cache.clone(),
                RoleCatalog::with_seed_roles(),
            );
            Self {
                store,
                cache,
                resolver,
            }
        }

        fn service(&self) -> MembershipService {
            MembershipService::new(self.store.clone(), self.cache.clone())
        }

        async fn seed(&self, membership: Membership) {
            self.store.insert(membership).await.unwrap();
        }
    }

    /// A store whose every read fails, standing in for a database outage.
    struct FailingStore;

    #[async_trait]
    impl MembershipStore for FailingStore {
        async fn get_membership(
            &self,
            _: &UserId,
            _: &AcademyId,
        ) -> Result<Option<Membership>> {
            Err(AcademyError::new(
                ErrorCode::DatabaseConnectionFailed,
                "connection refused",
            ))
        }

        async fn academies_for_user(&self, _: &UserId) -> Result<Vec<Membership>> {
            Err(AcademyError::new(
                ErrorCode::DatabaseConnectionFailed,
                "connection refused",
            ))
        }

        async fn members_of_academy(&self, _: &AcademyId) -> Result<Vec<Membership>> {
            Err(AcademyError::new(
                ErrorCode::DatabaseConnectionFailed,
                "connection refused",
            ))
        }

        async fn insert(&self, _: Membership) -> Result<Membership> {
            unimplemented!("write path not under test")
        }

        async fn set_role(&self, _: &UserId, _: &AcademyId, _: RoleId) -> Result<Membership> {
            unimplemented!("write path not under test")
        }

        async fn set_department(
            &self,
            _: &UserId,
            _: &AcademyId,
            _: Option<DepartmentId>,
        ) -> Result<Membership> {
            unimplemented!("write path not under test")
        }

        async fn set_status(
            &self,
            _: &UserId,
            _: &AcademyId,
            _: MembershipStatus,
        ) -> Result<Membership> {
            unimplemented!("write path not under test")
        }

        async fn set_custom_permission(
            &self,
            _: &UserId,
            _: &AcademyId,
            _: &str,
            _: Option<bool>,
        ) -> Result<Membership> {
            unimplemented!("write path not under test")
        }

        async fn remove(&self, _: &UserId, _: &AcademyId) -> Result<bool> {
            unimplemented!("write path not under test")
        }
    }

    #[tokio::test]
    async fn test_admin_permissions_resolve() {
        let fx = Fixture::new();
        fx.seed(Membership::new("42", "9", "admin")).await;
        let user = UserId::new("42");
        let academy = AcademyId::new("9");

        let answers = fx
            .resolver
            .check_permissions(
                &user,
                &academy,
                &[
                    perm("content.create"),
                    perm("content.delete"),
                    perm("billing.manage"),
                ],
            )
            .await;

        assert_eq!(answers.get("content.create"), Some(&true));
        assert_eq!(answers.get("content.delete"), Some(&true));
        assert_eq!(answers.get("billing.manage"), Some(&false));
    }

    #[tokio::test]
    async fn test_role_change_is_visible_immediately() {
        let fx = Fixture::new();
        fx.seed(Membership::new("7", "3", "student")).await;
        let user = UserId::new("7");
        let academy = AcademyId::new("3");

        // Warm the cache with the student's (denied) answer.
        assert!(!fx.resolver.has_permission(&user, &academy, &perm("content.create")).await);

        fx.service()
            .change_role(&user, &academy, RoleId::new("instructor"))
            .await
            .unwrap();

        assert!(fx.resolver.has_permission(&user, &academy, &perm("content.create")).await);
    }

    #[tokio::test]
    async fn test_non_member_is_denied() {
        let fx = Fixture::new();
        let err = fx
            .resolver
            .check(&UserId::new("7"), &AcademyId::new("3"), &perm("content.read"))
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::NotAMember));
        assert!(!fx.resolver.is_member(&UserId::new("7"), &AcademyId::new("3")).await);
    }

    #[tokio::test]
    async fn test_inactive_membership_is_denied_with_status() {
        let fx = Fixture::new();
        fx.seed(Membership::new("7", "3", "admin").with_status(MembershipStatus::Suspended))
            .await;

        let err = fx
            .resolver
            .check(&UserId::new("7"), &AcademyId::new("3"), &perm("content.read"))
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::InactiveMembership(ref s) if s == "suspended"));
        assert!(!fx.resolver.has_role(&UserId::new("7"), &AcademyId::new("3"), "admin").await);
    }

    #[tokio::test]
    async fn test_store_failure_folds_into_deny() {
        let cache = Arc::new(PermissionCache::with_defaults());
        let resolver = PermissionResolver::new(
            Arc::new(FailingStore),
            cache,
            RoleCatalog::with_seed_roles(),
        );
        let user = UserId::new("42");
        let academy = AcademyId::new("9");

        let err = resolver.check(&user, &academy, &perm("content.read")).await.unwrap_err();
        assert!(matches!(err, AccessError::DependencyUnavailable(_)));

        assert!(!resolver.has_permission(&user, &academy, &perm("content.read")).await);
        assert!(!resolver.is_member(&user, &academy).await);

        let answers = resolver
            .check_permissions(&user, &academy, &[perm("content.read")])
            .await;
        assert_eq!(answers.get("content.read"), Some(&false));
    }

    #[tokio::test]
    async fn test_department_override_is_additive() {
        let store = Arc::new(InMemoryMembershipStore::new());
        let cache = Arc::new(PermissionCache::with_defaults());
        let catalog = RoleCatalog::builder()
            .role(crate::rbac::models::Role::new("student", "Student"))
            .grant_global("student", perm("content.read"))
            .department_override("3", "stem", [perm("lab.manage")])
            .build();
        let resolver = PermissionResolver::new(store.clone(), cache, catalog);

        store
            .insert(Membership::new("7", "3", "student").with_department("stem"))
            .await
            .unwrap();
        store.insert(Membership::new("8", "3", "student")).await.unwrap();

        // The override adds on top of the role; it never subtracts.
        let in_stem = resolver
            .user_permissions(&UserId::new("7"), &AcademyId::new("3"))
            .await
            .unwrap();
        assert!(in_stem.contains(&perm("content.read")));
        assert!(in_stem.contains(&perm("lab.manage")));

        let outside = resolver
            .user_permissions(&UserId::new("8"), &AcademyId::new("3"))
            .await
            .unwrap();
        assert!(outside.contains(&perm("content.read")));
        assert!(!outside.contains(&perm("lab.manage")));
    }

    #[tokio::test]
    async fn test_custom_grants_extend_role_permissions() {
        let fx = Fixture::new();
        fx.seed(
            Membership::new("7", "3", "student").with_custom_permission("submission.grade"),
        )
        .await;

        let effective = fx
            .resolver
            .user_permissions(&UserId::new("7"), &AcademyId::new("3"))
            .await
            .unwrap();
        assert!(effective.contains(&perm("content.read")));
        assert!(effective.contains(&perm("submission.grade")));
    }

    #[tokio::test]
    async fn test_cross_academy_permissions_union_active_memberships() {
        let fx = Fixture::new();
        fx.seed(Membership::new("7", "3", "student")).await;
        fx.seed(Membership::new("7", "9", "instructor")).await;
        fx.seed(Membership::new("7", "12", "admin").with_status(MembershipStatus::Suspended))
            .await;

        let union = fx
            .resolver
            .user_permissions_all(&UserId::new("7"))
            .await
            .unwrap();

        // Student and instructor grants are unioned; the suspended admin
        // membership contributes nothing.
        assert!(union.contains(&perm("submission.create")));
        assert!(union.contains(&perm("content.create")));
        assert!(!union.contains(&perm("academy.manage")));

        let none = fx
            .resolver
            .user_permissions_all(&UserId::new("99"))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_has_role_matches_id_and_name() {
        let fx = Fixture::new();
        fx.seed(Membership::new("7", "3", "teaching_assistant")).await;
        let user = UserId::new("7");
        let academy = AcademyId::new("3");

        assert!(fx.resolver.has_role(&user, &academy, "teaching_assistant").await);
        assert!(fx.resolver.has_role(&user, &academy, "Teaching Assistant").await);
        assert!(fx.resolver.has_role(&user, &academy, "ADMIN").await == false);
    }

    #[tokio::test]
    async fn test_replace_catalog_drops_cached_permission_sets() {
        let fx = Fixture::new();
        fx.seed(Membership::new("7", "3", "student")).await;
        let user = UserId::new("7");
        let academy = AcademyId::new("3");

        assert!(!fx.resolver.has_permission(&user, &academy, &perm("content.create")).await);

        let widened = fx
            .resolver
            .catalog()
            .with_grant(RoleId::new("student"), perm("content.create"), None);
        fx.resolver.replace_catalog(widened);

        assert!(fx.resolver.has_permission(&user, &academy, &perm("content.create")).await);
    }

    #[tokio::test]
    async fn test_repeated_checks_hit_the_cache() {
        let clock = ManualClock::new();
        let store = Arc::new(InMemoryMembershipStore::new());
        let cache = Arc::new(PermissionCache::new(
            CacheConfig {
                membership_ttl: Duration::from_secs(60),
                permissions_ttl: Duration::from_secs(120),
                event_capacity: 16,
            },
            Arc::new(clock),
        ));
        let resolver =
            PermissionResolver::new(store.clone(), cache.clone(), RoleCatalog::with_seed_roles());
        store.insert(Membership::new("7", "3", "student")).await.unwrap();
        let user = UserId::new("7");
        let academy = AcademyId::new("3");

        for _ in 0..5 {
            assert!(resolver.has_permission(&user, &academy, &perm("content.read")).await);
        }

        let CacheStats { misses, hits, .. } = cache.stats();
        assert_eq!(misses, 2); // one membership load, one permission load
        assert!(hits >= 8);
    }
}
