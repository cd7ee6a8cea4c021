use crate::api::{
    HandlerDeps,
    error::{ApiError, ApiResult},
    gateway::{ClientIp, require_admin},
    handlers::dto::UserBrief,
};
use crate::domain::{Permission, UserRole};
use crate::permissions::{PermissionNode, build_permission_tree};
use crate::token::TokenKind;
use axum::{
    Json,
    extract::{Extension, Path},
    http::HeaderMap,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct ImpersonateResponse {
    pub access_token: String,
    pub expires_in: i64,
    pub user: UserBrief,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PermissionTreeResponse {
    pub items: Vec<PermissionNode>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PermissionListResponse {
    pub items: Vec<Permission>,
}

#[utoipa::path(
    post,
    path = "/admin/api/v1/users/{id}/impersonate",
    params(("id" = i64, Path, description = "Target user id")),
    responses(
        (status = 200, description = "Access token acting as the user.", body = ImpersonateResponse),
        (status = 400, description = "Target is not an active user account."),
        (status = 403, description = "Admin gate failed."),
        (status = 404, description = "User not found."),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn impersonate(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    ClientIp(ip): ClientIp,
    Path(id): Path<i64>,
) -> ApiResult<Json<ImpersonateResponse>> {
    let operator = require_admin(&headers, &deps, Some("user.impersonate")).await?;
    let target = deps
        .auth
        .get_user(id)
        .await
        .map_err(|err| ApiError::or_not_found(err, "user not found"))?;
    if target.role != UserRole::User {
        return Err(ApiError::bad_request("not a user account"));
    }
    if !target.is_active() {
        return Err(ApiError::bad_request("user disabled"));
    }

    let access_token = deps
        .tokens
        .issue(target.id, target.role, TokenKind::Access, 0, Utc::now())
        .map_err(|err| {
            error!("Failed to sign impersonation token: {err}");
            ApiError::internal("token sign failed")
        })?;
    info!(
        operator_id = operator.user_id(),
        target_user_id = target.id,
        ip = %ip,
        "Admin impersonated user"
    );

    Ok(Json(ImpersonateResponse {
        access_token,
        expires_in: deps.tokens.access_ttl_seconds(),
        user: UserBrief::from(&target),
    }))
}

#[utoipa::path(
    get,
    path = "/admin/api/v1/permissions/tree",
    responses(
        (status = 200, description = "Permission forest ordered by sort order, then code.", body = PermissionTreeResponse),
        (status = 403, description = "Admin gate failed."),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn permission_tree(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
) -> ApiResult<Json<PermissionTreeResponse>> {
    require_admin(&headers, &deps, Some("permission.tree")).await?;
    let permissions = deps.permissions.list_permissions().await?;
    Ok(Json(PermissionTreeResponse {
        items: build_permission_tree(&permissions),
    }))
}

#[utoipa::path(
    get,
    path = "/admin/api/v1/permissions",
    responses(
        (status = 200, description = "Flat permission list.", body = PermissionListResponse),
        (status = 403, description = "Admin gate failed."),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn permission_list(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
) -> ApiResult<Json<PermissionListResponse>> {
    require_admin(&headers, &deps, Some("permission.list")).await?;
    let items = deps.permissions.list_permissions().await?;
    Ok(Json(PermissionListResponse { items }))
}
