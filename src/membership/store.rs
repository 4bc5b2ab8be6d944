//! Membership store access.
//!
//! [`MembershipStore`] is the seam between permission resolution and the
//! backing store. It is fail-closed by construction: every operation returns
//! `Result`, and a store failure is an error, never an empty answer. The
//! resolver folds those errors into deny; they are never mistaken for
//! "not a member".

use crate::config::DatabaseConfig;
use crate::error::{AcademyError, ErrorCode, Result};
use crate::membership::models::{
    AcademyId, DepartmentId, Membership, MembershipStatus, RoleId, UserId,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::BTreeMap;

// ═══════════════════════════════════════════════════════════════════════════════
// Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Access to academy memberships.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Fetch the membership for `(user, academy)`, regardless of status.
    async fn get_membership(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
    ) -> Result<Option<Membership>>;

    /// Whether the user holds an **active** membership in the academy.
    async fn is_member(&self, user_id: &UserId, academy_id: &AcademyId) -> Result<bool> {
        Ok(self
            .get_membership(user_id, academy_id)
            .await?
            .map(|m| m.is_active())
            .unwrap_or(false))
    }

    /// All academies where the user holds an active membership.
    async fn academies_for_user(&self, user_id: &UserId) -> Result<Vec<Membership>>;

    /// All memberships in an academy, any status.
    async fn members_of_academy(&self, academy_id: &AcademyId) -> Result<Vec<Membership>>;

    /// Insert a new membership. Fails if the pair already has one.
    async fn insert(&self, membership: Membership) -> Result<Membership>;

    /// Change the member's role.
    async fn set_role(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        role_id: RoleId,
    ) -> Result<Membership>;

    /// Move the member to a department (or out of any department).
    async fn set_department(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        department_id: Option<DepartmentId>,
    ) -> Result<Membership>;

    /// Transition the membership status.
    async fn set_status(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        status: MembershipStatus,
    ) -> Result<Membership>;

    /// Grant (`Some(true)`), park (`Some(false)`), or remove (`None`) a
    /// custom permission entry.
    async fn set_custom_permission(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        permission_name: &str,
        grant: Option<bool>,
    ) -> Result<Membership>;

    /// Delete the membership. Returns whether a row was removed.
    async fn remove(&self, user_id: &UserId, academy_id: &AcademyId) -> Result<bool>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Store
// ═══════════════════════════════════════════════════════════════════════════════

/// DashMap-backed store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryMembershipStore {
    memberships: DashMap<(UserId, AcademyId), Membership>,
}

impl InMemoryMembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, user_id: &UserId, academy_id: &AcademyId, apply: F) -> Result<Membership>
    where
        F: FnOnce(&mut Membership),
    {
        let key = (user_id.clone(), academy_id.clone());
        let mut entry = self.memberships.get_mut(&key).ok_or_else(|| {
            AcademyError::membership_not_found(user_id.as_str(), academy_id.as_str())
        })?;
        apply(&mut entry);
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }
}

#[async_trait]
impl MembershipStore for InMemoryMembershipStore {
    async fn get_membership(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
    ) -> Result<Option<Membership>> {
        let key = (user_id.clone(), academy_id.clone());
        Ok(self.memberships.get(&key).map(|m| m.clone()))
    }

    async fn academies_for_user(&self, user_id: &UserId) -> Result<Vec<Membership>> {
        let mut memberships: Vec<Membership> = self
            .memberships
            .iter()
            .filter(|entry| entry.key().0 == *user_id && entry.is_active())
            .map(|entry| entry.clone())
            .collect();
        memberships.sort_by(|a, b| b.joined_at.cmp(&a.joined_at));
        Ok(memberships)
    }

    async fn members_of_academy(&self, academy_id: &AcademyId) -> Result<Vec<Membership>> {
        let mut memberships: Vec<Membership> = self
            .memberships
            .iter()
            .filter(|entry| entry.key().1 == *academy_id)
            .map(|entry| entry.clone())
            .collect();
        memberships.sort_by(|a, b| b.joined_at.cmp(&a.joined_at));
        Ok(memberships)
    }

    async fn insert(&self, membership: Membership) -> Result<Membership> {
        let key = (membership.user_id.clone(), membership.academy_id.clone());
        if self.memberships.contains_key(&key) {
            return Err(AcademyError::new(
                ErrorCode::MembershipAlreadyExists,
                "User is already a member of this academy",
            ));
        }
        self.memberships.insert(key, membership.clone());
        Ok(membership)
    }

    async fn set_role(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        role_id: RoleId,
    ) -> Result<Membership> {
        self.update(user_id, academy_id, |m| m.role_id = role_id)
    }

    async fn set_department(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        department_id: Option<DepartmentId>,
    ) -> Result<Membership> {
        self.update(user_id, academy_id, |m| m.department_id = department_id)
    }

    async fn set_status(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        status: MembershipStatus,
    ) -> Result<Membership> {
        self.update(user_id, academy_id, |m| m.status = status)
    }

    async fn set_custom_permission(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        permission_name: &str,
        grant: Option<bool>,
    ) -> Result<Membership> {
        self.update(user_id, academy_id, |m| match grant {
            Some(allowed) => {
                m.custom_permissions
                    .insert(permission_name.to_string(), allowed);
            }
            None => {
                m.custom_permissions.remove(permission_name);
            }
        })
    }

    async fn remove(&self, user_id: &UserId, academy_id: &AcademyId) -> Result<bool> {
        let key = (user_id.clone(), academy_id.clone());
        Ok(self.memberships.remove(&key).is_some())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Postgres Store
// ═══════════════════════════════════════════════════════════════════════════════

const MEMBERSHIP_COLUMNS: &str = "user_id, academy_id, role_id, department_id, status, \
     custom_permissions, joined_at, updated_at";

/// sqlx-backed store over the `academy_memberships` table.
pub struct PostgresMembershipStore {
    pool: PgPool,
}

impl PostgresMembershipStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool from configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;
        Ok(Self::new(pool))
    }

    fn row_to_membership(row: &PgRow) -> Result<Membership> {
        let status_raw: String = row.try_get("status")?;
        let status = MembershipStatus::parse(&status_raw).ok_or_else(|| {
            AcademyError::new(
                ErrorCode::InvalidMembershipStatus,
                format!("Unknown membership status '{}'", status_raw),
            )
        })?;

        let custom_raw: serde_json::Value = row.try_get("custom_permissions")?;
        let custom_permissions: BTreeMap<String, bool> = serde_json::from_value(custom_raw)?;

        Ok(Membership {
            user_id: UserId::new(row.try_get::<String, _>("user_id")?),
            academy_id: AcademyId::new(row.try_get::<String, _>("academy_id")?),
            role_id: RoleId::new(row.try_get::<String, _>("role_id")?),
            department_id: row
                .try_get::<Option<String>, _>("department_id")?
                .map(DepartmentId::new),
            status,
            custom_permissions,
            joined_at: row.try_get("joined_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn fetch_updated(&self, user_id: &UserId, academy_id: &AcademyId) -> Result<Membership> {
        self.get_membership(user_id, academy_id).await?.ok_or_else(|| {
            AcademyError::membership_not_found(user_id.as_str(), academy_id.as_str())
        })
    }
}

#[async_trait]
impl MembershipStore for PostgresMembershipStore {
    async fn get_membership(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
    ) -> Result<Option<Membership>> {
        let query = format!(
            "SELECT {} FROM academy_memberships WHERE user_id = $1 AND academy_id = $2",
            MEMBERSHIP_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(user_id.as_str())
            .bind(academy_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_membership).transpose()
    }

    async fn is_member(&self, user_id: &UserId, academy_id: &AcademyId) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM academy_memberships \
             WHERE user_id = $1 AND academy_id = $2 AND status = 'active'",
        )
        .bind(user_id.as_str())
        .bind(academy_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    async fn academies_for_user(&self, user_id: &UserId) -> Result<Vec<Membership>> {
        let query = format!(
            "SELECT {} FROM academy_memberships \
             WHERE user_id = $1 AND status = 'active' ORDER BY joined_at DESC",
            MEMBERSHIP_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(user_id.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_membership).collect()
    }

    async fn members_of_academy(&self, academy_id: &AcademyId) -> Result<Vec<Membership>> {
        let query = format!(
            "SELECT {} FROM academy_memberships \
             WHERE academy_id = $1 ORDER BY joined_at DESC",
            MEMBERSHIP_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(academy_id.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_membership).collect()
    }

    async fn insert(&self, membership: Membership) -> Result<Membership> {
        sqlx::query(
            "INSERT INTO academy_memberships \
             (user_id, academy_id, role_id, department_id, status, custom_permissions, joined_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(membership.user_id.as_str())
        .bind(membership.academy_id.as_str())
        .bind(membership.role_id.as_str())
        .bind(membership.department_id.as_ref().map(|d| d.as_str()))
        .bind(membership.status.as_str())
        .bind(serde_json::to_value(&membership.custom_permissions)?)
        .bind(membership.joined_at)
        .bind(membership.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(membership)
    }

    async fn set_role(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        role_id: RoleId,
    ) -> Result<Membership> {
        sqlx::query(
            "UPDATE academy_memberships SET role_id = $3, updated_at = NOW() \
             WHERE user_id = $1 AND academy_id = $2",
        )
        .bind(user_id.as_str())
        .bind(academy_id.as_str())
        .bind(role_id.as_str())
        .execute(&self.pool)
        .await?;

        self.fetch_updated(user_id, academy_id).await
    }

    async fn set_department(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        department_id: Option<DepartmentId>,
    ) -> Result<Membership> {
        sqlx::query(
            "UPDATE academy_memberships SET department_id = $3, updated_at = NOW() \
             WHERE user_id = $1 AND academy_id = $2",
        )
        .bind(user_id.as_str())
        .bind(academy_id.as_str())
        .bind(department_id.as_ref().map(|d| d.as_str()))
        .execute(&self.pool)
        .await?;

        self.fetch_updated(user_id, academy_id).await
    }

    async fn set_status(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        status: MembershipStatus,
    ) -> Result<Membership> {
        sqlx::query(
            "UPDATE academy_memberships SET status = $3, updated_at = NOW() \
             WHERE user_id = $1 AND academy_id = $2",
        )
        .bind(user_id.as_str())
        .bind(academy_id.as_str())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        self.fetch_updated(user_id, academy_id).await
    }

    async fn set_custom_permission(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        permission_name: &str,
        grant: Option<bool>,
    ) -> Result<Membership> {
        match grant {
            Some(allowed) => {
                sqlx::query(
                    "UPDATE academy_memberships \
                     SET custom_permissions = jsonb_set(custom_permissions, ARRAY[$3], to_jsonb($4::boolean), true), \
                         updated_at = NOW() \
                     WHERE user_id = $1 AND academy_id = $2",
                )
                .bind(user_id.as_str())
                .bind(academy_id.as_str())
                .bind(permission_name)
                .bind(allowed)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE academy_memberships \
                     SET custom_permissions = custom_permissions - $3, updated_at = NOW() \
                     WHERE user_id = $1 AND academy_id = $2",
                )
                .bind(user_id.as_str())
                .bind(academy_id.as_str())
                .bind(permission_name)
                .execute(&self.pool)
                .await?;
            }
        }

        self.fetch_updated(user_id, academy_id).await
    }

    async fn remove(&self, user_id: &UserId, academy_id: &AcademyId) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM academy_memberships WHERE user_id = $1 AND academy_id = $2",
        )
        .bind(user_id.as_str())
        .bind(academy_id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
