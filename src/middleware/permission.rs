//! Permission and role guards.
//!
//! [`RequirePermissionLayer`] gates a route on the effective permission set,
//! resolved once per request through the cache. The three requirement forms
//! answer from that single resolution, so a mid-request invalidation can
//! never produce a half-updated verdict:
//!
//! | Constructor | Passes when |
//! |-------------|-------------|
//! | [`RequirePermissionLayer::permission`] | the set contains the permission |
//! | [`RequirePermissionLayer::any_of`] | the set contains at least one |
//! | [`RequirePermissionLayer::all_of`] | the set contains every one; the denial names the missing permissions |
//!
//! [`RequireRoleLayer`] gates on role membership and [`AttachPermissionsLayer`]
//! attaches the effective set without gating.

use crate::error::AccessError;
use crate::middleware::context::{extract_academy_id, AuthContext, UserPermissions};
use crate::rbac::models::Permission;
use crate::rbac::resolver::PermissionResolver;
use axum::{
    body::Body,
    extract::Request,
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Permission Requirements
// ═══════════════════════════════════════════════════════════════════════════════

/// What a permission-guarded route demands of the effective set.
#[derive(Debug, Clone)]
enum PermissionRequirement {
    Single(Permission),
    AnyOf(Vec<Permission>),
    AllOf(Vec<Permission>),
}

impl PermissionRequirement {
    fn check(&self, effective: &crate::rbac::models::PermissionSet) -> Result<(), AccessError> {
        match self {
            Self::Single(permission) => {
                if effective.contains(permission) {
                    Ok(())
                } else {
                    Err(AccessError::PermissionDenied(format!(
                        "Missing required permission: {}",
                        permission
                    )))
                }
            }
            Self::AnyOf(permissions) => {
                if permissions.iter().any(|p| effective.contains(p)) {
                    Ok(())
                } else {
                    Err(AccessError::PermissionDenied(format!(
                        "Missing required permission: one of {}",
                        names(permissions)
                    )))
                }
            }
            Self::AllOf(permissions) => {
                let missing: Vec<&Permission> = permissions
                    .iter()
                    .filter(|p| !effective.contains(p))
                    .collect();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(AccessError::PermissionDenied(format!(
                        "Missing required permissions: {}",
                        missing
                            .iter()
                            .map(|p| p.name())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )))
                }
            }
        }
    }
}

fn names(permissions: &[Permission]) -> String {
    permissions
        .iter()
        .map(Permission::name)
        .collect::<Vec<_>>()
        .join(", ")
}

// ═══════════════════════════════════════════════════════════════════════════════
// Permission Guard
// ═══════════════════════════════════════════════════════════════════════════════

/// Layer that gates a route on the user's effective permissions in the
/// scoped academy.
///
/// # Example
///
/// ```rust,ignore
/// let app = Router::new()
///     .route("/api/v1/academies/:id/courses", post(create_course))
///     .layer(RequirePermissionLayer::permission(resolver.clone(), "content.create")?);
/// ```
#[derive(Clone)]
pub struct RequirePermissionLayer {
    resolver: Arc<PermissionResolver>,
    requirement: PermissionRequirement,
}

impl RequirePermissionLayer {
    /// Require one permission.
    pub fn permission(
        resolver: Arc<PermissionResolver>,
        name: &str,
    ) -> Result<Self, crate::rbac::models::PermissionParseError> {
        Ok(Self {
            resolver,
            requirement: PermissionRequirement::Single(Permission::parse(name)?),
        })
    }

    /// Require at least one of several permissions.
    pub fn any_of(
        resolver: Arc<PermissionResolver>,
        names: &[&str],
    ) -> Result<Self, crate::rbac::models::PermissionParseError> {
        Ok(Self {
            resolver,
            requirement: PermissionRequirement::AnyOf(parse_all(names)?),
        })
    }

    /// Require every one of several permissions. The denial message names
    /// each missing permission.
    pub fn all_of(
        resolver: Arc<PermissionResolver>,
        names: &[&str],
    ) -> Result<Self, crate::rbac::models::PermissionParseError> {
        Ok(Self {
            resolver,
            requirement: PermissionRequirement::AllOf(parse_all(names)?),
        })
    }
}

fn parse_all(
    names: &[&str],
) -> Result<Vec<Permission>, crate::rbac::models::PermissionParseError> {
    names.iter().map(|n| Permission::parse(n)).collect()
}

impl<S> Layer<S> for RequirePermissionLayer {
    type Service = RequirePermissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequirePermissionService {
            inner,
            resolver: self.resolver.clone(),
            requirement: self.requirement.clone(),
        }
    }
}

/// Service that enforces a permission requirement per request.
#[derive(Clone)]
pub struct RequirePermissionService<S> {
    inner: S,
    resolver: Arc<PermissionResolver>,
    requirement: PermissionRequirement,
}

impl<S> Service<Request<Body>> for RequirePermissionService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let resolver = self.resolver.clone();
        let requirement = self.requirement.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let auth = match request.extensions().get::<AuthContext>().cloned() {
                Some(auth) => auth,
                None => return Ok(AccessError::Unauthenticated.into_response()),
            };

            let academy_id = match extract_academy_id(&request) {
                Some(id) => id,
                None => {
                    return Ok(AccessError::MissingContext("Academy context").into_response())
                }
            };

            // One resolution answers the whole requirement.
            let effective = match resolver.user_permissions(&auth.user_id, &academy_id).await {
                Ok(effective) => effective,
                Err(error) => return Ok(error.into_response()),
            };

            if let Err(denial) = requirement.check(&effective) {
                warn!(
                    user_id = %auth.user_id,
                    academy_id = %academy_id,
                    %denial,
                    "permission guard denied request"
                );
                return Ok(denial.into_response());
            }

            request.extensions_mut().insert(UserPermissions(effective));
            inner.call(request).await
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Role Guard
// ═══════════════════════════════════════════════════════════════════════════════

/// Layer that gates a route on the member's role in the scoped academy.
/// Passes when the member holds **any** of the named roles.
#[derive(Clone)]
pub struct RequireRoleLayer {
    resolver: Arc<PermissionResolver>,
    role_names: Vec<String>,
}

impl RequireRoleLayer {
    pub fn new<I, T>(resolver: Arc<PermissionResolver>, roles: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            resolver,
            role_names: roles.into_iter().map(Into::into).collect(),
        }
    }
}

impl<S> Layer<S> for RequireRoleLayer {
    type Service = RequireRoleService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequireRoleService {
            inner,
            resolver: self.resolver.clone(),
            role_names: self.role_names.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RequireRoleService<S> {
    inner: S,
    resolver: Arc<PermissionResolver>,
    role_names: Vec<String>,
}

impl<S> Service<Request<Body>> for RequireRoleService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let resolver = self.resolver.clone();
        let role_names = self.role_names.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let auth = match request.extensions().get::<AuthContext>().cloned() {
                Some(auth) => auth,
                None => return Ok(AccessError::Unauthenticated.into_response()),
            };

            let academy_id = match extract_academy_id(&request) {
                Some(id) => id,
                None => {
                    return Ok(AccessError::MissingContext("Academy context").into_response())
                }
            };

            for role_name in &role_names {
                if resolver.has_role(&auth.user_id, &academy_id, role_name).await {
                    return inner.call(request).await;
                }
            }

            warn!(
                user_id = %auth.user_id,
                academy_id = %academy_id,
                roles = %role_names.join(", "),
                "role guard denied request"
            );
            Ok(AccessError::PermissionDenied(format!(
                "One of the following roles required: {}",
                role_names.join(", ")
            ))
            .into_response())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Non-Gating Attachment
// ═══════════════════════════════════════════════════════════════════════════════

/// Layer that attaches [`UserPermissions`] without gating. A resolution
/// failure is logged and the request proceeds without the extension; a
/// handler that must not run without it uses a gating guard instead.
#[derive(Clone)]
pub struct AttachPermissionsLayer {
    resolver: Arc<PermissionResolver>,
}

impl AttachPermissionsLayer {
    pub fn new(resolver: Arc<PermissionResolver>) -> Self {
        Self { resolver }
    }
}

impl<S> Layer<S> for AttachPermissionsLayer {
    type Service = AttachPermissionsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AttachPermissionsService {
            inner,
            resolver: self.resolver.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AttachPermissionsService<S> {
    inner: S,
    resolver: Arc<PermissionResolver>,
}

impl<S> Service<Request<Body>> for AttachPermissionsService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let resolver = self.resolver.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let auth = request.extensions().get::<AuthContext>().cloned();
            let academy_id = extract_academy_id(&request);

            if let (Some(auth), Some(academy_id)) = (auth, academy_id) {
                match resolver.user_permissions(&auth.user_id, &academy_id).await {
                    Ok(effective) => {
                        request.extensions_mut().insert(UserPermissions(effective));
                    }
                    Err(error) => {
                        debug!(
                            user_id = %auth.user_id,
                            academy_id = %academy_id,
                            %error,
                            "permissions not attached"
                        );
                    }
                }
            }

            inner.call(request).await
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PermissionCache;
    use crate::error::{AcademyError, ErrorCode, Result};
    use crate::membership::models::{
        AcademyId, DepartmentId, Membership, MembershipStatus, RoleId, UserId,
    };
    use crate::membership::store::{InMemoryMembershipStore, MembershipStore};
    use crate::rbac::catalog::RoleCatalog;
    use async_trait::async_trait;
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    async fn handler() -> &'static str {
        "ok"
    }

    async fn permissions_handler(permissions: Option<axum::Extension<UserPermissions>>) -> String {
        permissions
            .map(|axum::Extension(UserPermissions(set))| set.names().join(","))
            .unwrap_or_else(|| "unattached".to_string())
    }

    async fn resolver_with(memberships: Vec<Membership>) -> Arc<PermissionResolver> {
        let store = Arc::new(InMemoryMembershipStore::new());
        for membership in memberships {
            store.insert(membership).await.unwrap();
        }
        Arc::new(PermissionResolver::new(
            store,
            Arc::new(PermissionCache::with_defaults()),
            RoleCatalog::with_seed_roles(),
        ))
    }

    fn authed_request(uri: &str, user_id: &str) -> Request<Body> {
        HttpRequest::builder()
            .uri(uri)
            .extension(AuthContext::new(user_id))
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// A store whose every operation fails, standing in for a database outage.
    struct FailingStore;

    fn store_down() -> AcademyError {
        AcademyError::new(
            ErrorCode::DatabaseConnectionFailed,
            "connection refused (db-host-17:5432)",
        )
    }

    #[async_trait]
    impl MembershipStore for FailingStore {
        async fn get_membership(
            &self,
            _: &UserId,
            _: &AcademyId,
        ) -> Result<Option<Membership>> {
            Err(store_down())
        }

        async fn academies_for_user(&self, _: &UserId) -> Result<Vec<Membership>> {
            Err(store_down())
        }

        async fn members_of_academy(&self, _: &AcademyId) -> Result<Vec<Membership>> {
            Err(store_down())
        }

        async fn insert(&self, _: Membership) -> Result<Membership> {
            Err(store_down())
        }

        async fn set_role(&self, _: &UserId, _: &AcademyId, _: RoleId) -> Result<Membership> {
            Err(store_down())
        }

        async fn set_department(
            &self,
            _: &UserId,
            _: &AcademyId,
            _: Option<DepartmentId>,
        ) -> Result<Membership> {
            Err(store_down())
        }

        async fn set_status(
            &self,
            _: &UserId,
            _: &AcademyId,
            _: MembershipStatus,
        ) -> Result<Membership> {
            Err(store_down())
        }

        async fn set_custom_permission(
            &self,
            _: &UserId,
            _: &AcademyId,
            _: &str,
            _: Option<bool>,
        ) -> Result<Membership> {
            Err(store_down())
        }

        async fn remove(&self, _: &UserId, _: &AcademyId) -> Result<bool> {
            Err(store_down())
        }
    }

    #[tokio::test]
    async fn test_single_permission_allows_and_denies() {
        let resolver = resolver_with(vec![
            Membership::new("42", "9", "admin"),
            Membership::new("7", "9", "student"),
        ])
        .await;
        let app = Router::new()
            .route("/academies/:id/content", get(handler))
            .layer(RequirePermissionLayer::permission(resolver, "content.create").unwrap());

        let response = app
            .clone()
            .oneshot(authed_request("/academies/9/content", "42"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(authed_request("/academies/9/content", "7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_missing_academy_context_is_bad_request() {
        let resolver = resolver_with(vec![Membership::new("42", "9", "admin")]).await;
        let app = Router::new()
            .route("/content", get(handler))
            .layer(RequirePermissionLayer::permission(resolver, "content.create").unwrap());

        let response = app.oneshot(authed_request("/content", "42")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_any_of_passes_with_one_match() {
        let resolver = resolver_with(vec![Membership::new("7", "3", "teaching_assistant")]).await;
        let app = Router::new()
            .route("/academies/:id/grading", get(handler))
            .layer(
                RequirePermissionLayer::any_of(
                    resolver,
                    &["submission.grade", "academy.manage"],
                )
                .unwrap(),
            );

        let response = app
            .oneshot(authed_request("/academies/3/grading", "7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_all_of_denial_names_missing_permissions() {
        let resolver = resolver_with(vec![Membership::new("7", "3", "instructor")]).await;
        let app = Router::new()
            .route("/academies/:id/admin", get(handler))
            .layer(
                RequirePermissionLayer::all_of(
                    resolver,
                    &["content.create", "academy.manage", "member.manage"],
                )
                .unwrap(),
            );

        let response = app
            .oneshot(authed_request("/academies/3/admin", "7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "PERMISSION_DENIED");
        let message = body["error"]["message"].as_str().unwrap();
        assert!(message.contains("academy.manage"));
        assert!(message.contains("member.manage"));
        assert!(!message.contains("content.create"));
    }

    #[tokio::test]
    async fn test_store_failure_denies_without_leaking() {
        let resolver = Arc::new(PermissionResolver::new(
            Arc::new(FailingStore),
            Arc::new(PermissionCache::with_defaults()),
            RoleCatalog::with_seed_roles(),
        ));
        let app = Router::new()
            .route("/academies/:id/content", get(handler))
            .layer(RequirePermissionLayer::permission(resolver, "content.create").unwrap());

        let response = app
            .oneshot(authed_request("/academies/9/content", "42"))
            .await
            .unwrap();

        // An outage denies like any other denial, with no distinct status
        // and no internal failure text.
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "PERMISSION_DENIED");
        let message = body["error"]["message"].as_str().unwrap();
        assert!(!message.contains("connection refused"));
        assert!(!message.contains("db-host-17"));
    }

    #[tokio::test]
    async fn test_malformed_permission_name_is_rejected_at_construction() {
        let resolver = resolver_with(vec![]).await;
        assert!(RequirePermissionLayer::permission(resolver.clone(), "content.*").is_err());
        assert!(RequirePermissionLayer::any_of(resolver, &["content:create"]).is_err());
    }

    #[tokio::test]
    async fn test_role_guard() {
        let resolver = resolver_with(vec![
            Membership::new("42", "9", "admin"),
            Membership::new("7", "9", "student"),
        ])
        .await;
        let app = Router::new()
            .route("/academies/:id/settings", get(handler))
            .layer(RequireRoleLayer::new(resolver, ["Admin"]));

        let response = app
            .clone()
            .oneshot(authed_request("/academies/9/settings", "42"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(authed_request("/academies/9/settings", "7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_role_guard_passes_on_any_of_several_roles() {
        let resolver = resolver_with(vec![
            Membership::new("11", "9", "instructor"),
            Membership::new("7", "9", "student"),
        ])
        .await;
        let app = Router::new()
            .route("/academies/:id/grading", get(handler))
            .layer(RequireRoleLayer::new(
                resolver,
                ["Admin", "Instructor", "Teaching Assistant"],
            ));

        let response = app
            .clone()
            .oneshot(authed_request("/academies/9/grading", "11"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // A student holds none of the listed roles; the denial names them all.
        let response = app
            .oneshot(authed_request("/academies/9/grading", "7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = body_json(response).await;
        assert_eq!(
            body["error"]["message"],
            "One of the following roles required: Admin, Instructor, Teaching Assistant"
        );
    }

    #[tokio::test]
    async fn test_role_guard_requires_academy_context() {
        let resolver = resolver_with(vec![Membership::new("42", "9", "admin")]).await;
        let app = Router::new()
            .route("/settings", get(handler))
            .layer(RequireRoleLayer::new(resolver, ["Admin"]));

        let response = app
            .oneshot(authed_request("/settings", "42"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "MISSING_CONTEXT");
        assert_eq!(body["error"]["message"], "Academy context is required");
    }

    #[tokio::test]
    async fn test_attach_permissions_is_non_gating() {
        let resolver = resolver_with(vec![Membership::new("7", "3", "student")]).await;
        let app = Router::new()
            .route("/academies/:id/home", get(permissions_handler))
            .route("/home", get(permissions_handler))
            .layer(AttachPermissionsLayer::new(resolver));

        // Member: permissions attached.
        let response = app
            .clone()
            .oneshot(authed_request("/academies/3/home", "7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(body.contains("content.read"));

        // Non-member in another academy: request still proceeds.
        let response = app
            .clone()
            .oneshot(authed_request("/academies/9/home", "7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(bytes.to_vec()).unwrap(), "unattached");

        // No academy scope: request still proceeds.
        let response = app.oneshot(authed_request("/home", "7")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
