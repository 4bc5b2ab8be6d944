//! Request contexts shared between guards and handlers.
//!
//! Guards insert these into request extensions; handlers extract them with
//! the usual axum extractors. An [`AuthContext`] is placed by upstream
//! authentication before any guard in this crate runs.

use crate::membership::models::{AcademyId, Membership, UserId};
use crate::rbac::models::PermissionSet;
use axum::{
    body::Body,
    extract::{FromRequestParts, Request},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use uuid::Uuid;

/// Header carrying the academy scope when it is not in the path.
pub const ACADEMY_HEADER: &str = "x-academy-id";

// ═══════════════════════════════════════════════════════════════════════════════
// Auth Context
// ═══════════════════════════════════════════════════════════════════════════════

/// The authenticated principal, injected by upstream authentication.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: UserId,
    pub request_id: String,
}

impl AuthContext {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            request_id: Uuid::new_v4().to_string(),
        }
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or_else(|| crate::error::AccessError::Unauthenticated.into_response())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Academy Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Academy scope resolved by a membership guard.
///
/// Handlers behind [`RequireMembershipLayer`](crate::middleware::tenant::RequireMembershipLayer)
/// read the verified membership from here instead of re-querying the store.
#[derive(Debug, Clone)]
pub struct AcademyContext {
    pub academy_id: AcademyId,
    pub membership: Membership,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AcademyContext
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AcademyContext>()
            .cloned()
            .ok_or_else(missing_guard_response)
    }
}

/// Academies where the requesting user holds an active membership.
#[derive(Debug, Clone)]
pub struct UserAcademies(pub Vec<AcademyId>);

#[axum::async_trait]
impl<S> FromRequestParts<S> for UserAcademies
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<UserAcademies>()
            .cloned()
            .ok_or_else(missing_guard_response)
    }
}

/// The user's effective permission set in the scoped academy.
#[derive(Debug, Clone)]
pub struct UserPermissions(pub PermissionSet);

#[axum::async_trait]
impl<S> FromRequestParts<S> for UserPermissions
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<UserPermissions>()
            .cloned()
            .ok_or_else(missing_guard_response)
    }
}

/// A guard context was extracted without its guard in front. Misrouting,
/// not a client error.
fn missing_guard_response() -> Response {
    let body = serde_json::json!({
        "success": false,
        "error": {
            "code": "MISSING_GUARD_CONTEXT",
            "message": "Access context not available. Ensure the access guard is applied to this route.",
        }
    });
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Academy Scope Extraction
// ═══════════════════════════════════════════════════════════════════════════════

/// Resolve the academy scope for a request: the `x-academy-id` header if
/// present, otherwise the path segment after `academies`.
pub fn extract_academy_id(request: &Request<Body>) -> Option<AcademyId> {
    if let Some(value) = request.headers().get(ACADEMY_HEADER) {
        if let Ok(raw) = value.to_str() {
            if !raw.is_empty() {
                return Some(AcademyId::new(raw));
            }
        }
    }
    academy_id_from_path(request.uri().path())
}

fn academy_id_from_path(path: &str) -> Option<AcademyId> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    while let Some(segment) = segments.next() {
        if segment == "academies" {
            return segments.next().map(AcademyId::new);
        }
    }
    None
}

/// The trailing path segment, used as the resource id by
/// [`ValidateResourceAccessLayer`](crate::middleware::tenant::ValidateResourceAccessLayer).
pub fn extract_resource_id(request: &Request<Body>) -> Option<String> {
    request
        .uri()
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}
