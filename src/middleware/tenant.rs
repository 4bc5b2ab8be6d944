//! Academy isolation guards.
//!
//! These tower layers enforce the tenant boundary before a handler runs:
//!
//! - [`RequireMembershipLayer`]: the user must hold an active membership in
//!   the scoped academy; attaches [`AcademyContext`]
//! - [`RequireActiveMembershipLayer`]: same gate, but the denial names the
//!   membership status
//! - [`ValidateResourceAccessLayer`]: resolves the academy that owns the
//!   requested resource and requires an active membership there
//! - [`AcademyScopeLayer`]: attaches the user's academies without gating
//!   on any particular one
//!
//! Denials map to the fixed status taxonomy: missing academy scope is 400,
//! missing principal is 401, non-membership is 403.

use crate::error::{AccessError, Result};
use crate::membership::models::AcademyId;
use crate::middleware::context::{
    extract_academy_id, extract_resource_id, AcademyContext, AuthContext, UserAcademies,
};
use crate::rbac::resolver::PermissionResolver;
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Request,
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::warn;

// ═══════════════════════════════════════════════════════════════════════════════
// Membership Guard
// ═══════════════════════════════════════════════════════════════════════════════

/// Layer that requires an active membership in the scoped academy.
///
/// Membership at this boundary means **active** membership; a suspended,
/// pending, or archived member is denied exactly like a non-member, so the
/// response does not reveal that a (dormant) membership row exists.
///
/// # Example
///
/// ```rust,ignore
/// let app = Router::new()
///     .route("/api/v1/academies/:academy_id/courses", get(list_courses))
///     .layer(RequireMembershipLayer::new(resolver.clone()));
/// ```
#[derive(Clone)]
pub struct RequireMembershipLayer {
    resolver: Arc<PermissionResolver>,
    status_in_denial: bool,
}

impl RequireMembershipLayer {
    pub fn new(resolver: Arc<PermissionResolver>) -> Self {
        Self {
            resolver,
            status_in_denial: false,
        }
    }
}

/// Layer that requires an active membership and, unlike
/// [`RequireMembershipLayer`], names the membership status in the denial.
/// Routes where a suspended member should see why they lost access (their
/// own dashboard, billing) sit behind this.
#[derive(Clone)]
pub struct RequireActiveMembershipLayer {
    resolver: Arc<PermissionResolver>,
}

impl RequireActiveMembershipLayer {
    pub fn new(resolver: Arc<PermissionResolver>) -> Self {
        Self { resolver }
    }
}

impl<S> Layer<S> for RequireMembershipLayer {
    type Service = MembershipService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MembershipService {
            inner,
            resolver: self.resolver.clone(),
            status_in_denial: self.status_in_denial,
        }
    }
}

impl<S> Layer<S> for RequireActiveMembershipLayer {
    type Service = MembershipService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MembershipService {
            inner,
            resolver: self.resolver.clone(),
            status_in_denial: true,
        }
    }
}

/// Service enforcing active academy membership per request.
#[derive(Clone)]
pub struct MembershipService<S> {
    inner: S,
    resolver: Arc<PermissionResolver>,
    status_in_denial: bool,
}

impl<S> Service<Request<Body>> for MembershipService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let resolver = self.resolver.clone();
        let status_in_denial = self.status_in_denial;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let auth = match request.extensions().get::<AuthContext>().cloned() {
                Some(auth) => auth,
                None => return Ok(AccessError::Unauthenticated.into_response()),
            };

            let academy_id = match extract_academy_id(&request) {
                Some(id) => id,
                None => return Ok(AccessError::MissingContext("Academy ID").into_response()),
            };

            let membership = match resolver.membership(&auth.user_id, &academy_id).await {
                Ok(Some(membership)) => membership,
                Ok(None) => {
                    warn!(
                        user_id = %auth.user_id,
                        academy_id = %academy_id,
                        "non-member blocked at academy boundary"
                    );
                    return Ok(AccessError::NotAMember.into_response());
                }
                Err(error) => return Ok(error.into_response()),
            };

            if !membership.is_active() {
                warn!(
                    user_id = %auth.user_id,
                    academy_id = %academy_id,
                    status = %membership.status,
                    "inactive member blocked at academy boundary"
                );
                let denial = if status_in_denial {
                    AccessError::InactiveMembership(membership.status.to_string())
                } else {
                    AccessError::NotAMember
                };
                return Ok(denial.into_response());
            }

            request.extensions_mut().insert(AcademyContext {
                academy_id,
                membership,
            });
            inner.call(request).await
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resource Access Guard
// ═══════════════════════════════════════════════════════════════════════════════

/// Maps a resource id to the academy that owns it.
#[async_trait]
pub trait ResourceAcademyResolver: Send + Sync {
    /// `Ok(None)` means the resource does not exist.
    async fn academy_for(&self, resource_id: &str) -> Result<Option<AcademyId>>;
}

/// Layer that gates a resource route on active membership in the academy
/// that owns the resource. The resource id is the trailing path segment.
#[derive(Clone)]
pub struct ValidateResourceAccessLayer {
    resolver: Arc<PermissionResolver>,
    resources: Arc<dyn ResourceAcademyResolver>,
}

impl ValidateResourceAccessLayer {
    pub fn new(
        resolver: Arc<PermissionResolver>,
        resources: Arc<dyn ResourceAcademyResolver>,
    ) -> Self {
        Self {
            resolver,
            resources,
        }
    }
}

impl<S> Layer<S> for ValidateResourceAccessLayer {
    type Service = ValidateResourceAccessService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ValidateResourceAccessService {
            inner,
            resolver: self.resolver.clone(),
            resources: self.resources.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ValidateResourceAccessService<S> {
    inner: S,
    resolver: Arc<PermissionResolver>,
    resources: Arc<dyn ResourceAcademyResolver>,
}

impl<S> Service<Request<Body>> for ValidateResourceAccessService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let resolver = self.resolver.clone();
        let resources = self.resources.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let auth = match request.extensions().get::<AuthContext>().cloned() {
                Some(auth) => auth,
                None => return Ok(AccessError::Unauthenticated.into_response()),
            };

            let resource_id = match extract_resource_id(&request) {
                Some(id) => id,
                None => return Ok(AccessError::MissingContext("Resource ID").into_response()),
            };

            let academy_id = match resources.academy_for(&resource_id).await {
                Ok(Some(academy_id)) => academy_id,
                Ok(None) => return Ok(AccessError::ResourceNotFound.into_response()),
                Err(error) => return Ok(AccessError::from(error).into_response()),
            };

            let membership = match resolver.active_membership(&auth.user_id, &academy_id).await {
                Ok(membership) => membership,
                Err(error) => {
                    warn!(
                        user_id = %auth.user_id,
                        academy_id = %academy_id,
                        resource_id = %resource_id,
                        %error,
                        "resource access blocked"
                    );
                    // Resource-flavored denial: the client asked about a
                    // resource, not an academy.
                    let denial = match error {
                        AccessError::NotAMember => AccessError::PermissionDenied(
                            "You do not have access to this resource".to_string(),
                        ),
                        other => other,
                    };
                    return Ok(denial.into_response());
                }
            };

            request.extensions_mut().insert(AcademyContext {
                academy_id,
                membership,
            });
            inner.call(request).await
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Academy Scope Attachment
// ═══════════════════════════════════════════════════════════════════════════════

/// Layer that attaches the user's active academies without requiring any
/// particular one. Cross-academy listing endpoints sit behind this.
#[derive(Clone)]
pub struct AcademyScopeLayer {
    resolver: Arc<PermissionResolver>,
}

impl AcademyScopeLayer {
    pub fn new(resolver: Arc<PermissionResolver>) -> Self {
        Self { resolver }
    }
}

impl<S> Layer<S> for AcademyScopeLayer {
    type Service = AcademyScopeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AcademyScopeService {
            inner,
            resolver: self.resolver.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AcademyScopeService<S> {
    inner: S,
    resolver: Arc<PermissionResolver>,
}

impl<S> Service<Request<Body>> for AcademyScopeService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let resolver = self.resolver.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let auth = match request.extensions().get::<AuthContext>().cloned() {
                Some(auth) => auth,
                None => return Ok(AccessError::Unauthenticated.into_response()),
            };

            let academies = match resolver.academies_for_user(&auth.user_id).await {
                Ok(memberships) => memberships
                    .into_iter()
                    .map(|m| m.academy_id)
                    .collect::<Vec<_>>(),
                Err(error) => return Ok(error.into_response()),
            };

            request.extensions_mut().insert(UserAcademies(academies));
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
    use crate::membership::models::{Membership, MembershipStatus, UserId};
    use crate::membership::store::{InMemoryMembershipStore, MembershipStore};
    use crate::rbac::catalog::RoleCatalog;
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    async fn scoped_handler(context: AcademyContext) -> String {
        format!("{}:{}", context.academy_id, context.membership.role_id)
    }

    async fn listing_handler(academies: UserAcademies) -> String {
        academies
            .0
            .iter()
            .map(|a| a.as_str().to_string())
            .collect::<Vec<_>>()
            .join(",")
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

    struct StaticResources(Vec<(&'static str, &'static str)>);

    #[async_trait]
    impl ResourceAcademyResolver for StaticResources {
        async fn academy_for(&self, resource_id: &str) -> Result<Option<AcademyId>> {
            Ok(self
                .0
                .iter()
                .find(|(id, _)| *id == resource_id)
                .map(|(_, academy)| AcademyId::new(*academy)))
        }
    }

    #[tokio::test]
    async fn test_member_passes_with_context_attached() {
        let resolver = resolver_with(vec![Membership::new("7", "3", "student")]).await;
        let app = Router::new()
            .route("/academies/:id/courses", get(scoped_handler))
            .layer(RequireMembershipLayer::new(resolver));

        let response = app
            .oneshot(authed_request("/academies/3/courses", "7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_academy_scope_is_bad_request() {
        let resolver = resolver_with(vec![]).await;
        let app = Router::new()
            .route("/courses", get(scoped_handler))
            .layer(RequireMembershipLayer::new(resolver));

        let response = app.oneshot(authed_request("/courses", "7")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_principal_is_unauthorized() {
        let resolver = resolver_with(vec![]).await;
        let app = Router::new()
            .route("/academies/:id/courses", get(scoped_handler))
            .layer(RequireMembershipLayer::new(resolver));

        let request = HttpRequest::builder()
            .uri("/academies/3/courses")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_non_member_is_forbidden() {
        let resolver = resolver_with(vec![Membership::new("7", "3", "student")]).await;
        let app = Router::new()
            .route("/academies/:id/courses", get(scoped_handler))
            .layer(RequireMembershipLayer::new(resolver));

        let response = app
            .oneshot(authed_request("/academies/9/courses", "7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_suspended_member_blocked_like_a_non_member() {
        let resolver = resolver_with(vec![
            Membership::new("7", "3", "student").with_status(MembershipStatus::Suspended),
        ])
        .await;
        let app = Router::new()
            .route("/academies/:id/courses", get(scoped_handler))
            .layer(RequireMembershipLayer::new(resolver));

        let response = app
            .oneshot(authed_request("/academies/3/courses", "7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // The generic denial does not reveal that a dormant row exists.
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "NOT_A_MEMBER");
        assert_eq!(
            body["error"]["message"],
            "You are not a member of this academy"
        );
    }

    #[tokio::test]
    async fn test_suspended_member_blocked_by_active_guard() {
        let resolver = resolver_with(vec![
            Membership::new("7", "3", "student").with_status(MembershipStatus::Suspended),
        ])
        .await;
        let app = Router::new()
            .route("/academies/:id/courses", get(scoped_handler))
            .layer(RequireActiveMembershipLayer::new(resolver));

        let response = app
            .oneshot(authed_request("/academies/3/courses", "7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "MEMBERSHIP_INACTIVE");
        assert_eq!(
            body["error"]["message"],
            "Membership status is suspended. Active membership required."
        );
    }

    #[tokio::test]
    async fn test_resource_guard_resolves_owning_academy() {
        let resolver = resolver_with(vec![Membership::new("7", "3", "student")]).await;
        let resources = Arc::new(StaticResources(vec![("course-17", "3"), ("course-99", "9")]));

        let app = Router::new()
            .route("/courses/:id", get(scoped_handler))
            .layer(ValidateResourceAccessLayer::new(
                resolver.clone(),
                resources.clone(),
            ));

        let response = app
            .clone()
            .oneshot(authed_request("/courses/course-17", "7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Owned by an academy the user is not a member of.
        let response = app
            .clone()
            .oneshot(authed_request("/courses/course-99", "7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            body["error"]["message"],
            "You do not have access to this resource"
        );

        // Unknown resource.
        let response = app
            .oneshot(authed_request("/courses/course-404", "7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_academy_scope_attaches_active_academies() {
        let resolver = resolver_with(vec![
            Membership::new("7", "3", "student"),
            Membership::new("7", "9", "instructor")
                .with_status(MembershipStatus::Archived),
        ])
        .await;
        let app = Router::new()
            .route("/me/academies", get(listing_handler))
            .layer(AcademyScopeLayer::new(resolver));

        let response = app
            .oneshot(authed_request("/me/academies", "7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(bytes.to_vec()).unwrap(), "3");
    }

    #[tokio::test]
    async fn test_guard_resolves_through_cache_not_store_each_time() {
        let store = Arc::new(InMemoryMembershipStore::new());
        store.insert(Membership::new("7", "3", "student")).await.unwrap();
        let cache = Arc::new(PermissionCache::with_defaults());
        let resolver = Arc::new(PermissionResolver::new(
            store,
            cache.clone(),
            RoleCatalog::with_seed_roles(),
        ));
        let app = Router::new()
            .route("/academies/:id/courses", get(scoped_handler))
            .layer(RequireMembershipLayer::new(resolver));

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(authed_request("/academies/3/courses", "7"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hits, 2);
    }
}
