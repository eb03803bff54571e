/// HTTP 接口
///
/// 认证由外部网关完成，调用者身份通过 `x-user-id` / `x-superuser` 请求头传入

pub mod vms;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::Serialize;
use validator::Validate;

use crate::app_state::AppState;
use crate::errors::CloudError;
use crate::services::UserContext;

/// 所有 API 路由（统一入口）
pub fn api_routes() -> Router<AppState> {
    Router::new().nest("/vms", vms::vm_routes())
}

/// API 错误响应
#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Cloud(CloudError),
    Validation(String),
    Unauthorized(String),
}

impl From<CloudError> for ApiError {
    fn from(err: CloudError) -> Self {
        ApiError::Cloud(err)
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        ApiError::Validation(err.to_string())
    }
}

/// 错误码对应的 HTTP 状态
fn status_of(code: &str) -> StatusCode {
    match code {
        "VM_NOT_EXIST" | "SNAP_NOT_EXIST" | "DEVICE_NOT_FOUND" | "DISK_IMAGE_MISS" => StatusCode::NOT_FOUND,
        "VM_ACCESS_DENIED" | "DEVICE_ACCESS_DENIED" => StatusCode::FORBIDDEN,
        "BAD_REQUEST" | "SYS_DISK_TOO_SMALL" | "SNAP_NOT_BELONG_TO_VM" | "UNSUPPORTED" => StatusCode::BAD_REQUEST,
        "VM_RUNNING" | "VM_ALREADY_EXIST" | "DEVICE_NOT_ACTIVE" | "ACROSS_GROUP_CONFLICT"
        | "ACROSS_CENTER_CONFLICT" | "TOO_MANY_VDISK_MOUNTED" => StatusCode::CONFLICT,
        "NO_HOST" | "NO_MAC_IP" | "NO_HOST_OR_MAC_IP" | "NO_HOST_GROUP" | "VCPU_NOT_ENOUGH"
        | "RAM_NOT_ENOUGH" => StatusCode::CONFLICT,
        "HOST_UNREACHABLE" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Cloud(e) => {
                let code = e.code();
                let status = status_of(code);
                if status.is_server_error() {
                    tracing::error!("请求处理失败: code={}, error={}", code, e);
                }
                (status, code.to_string(), e.to_string())
            }
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST".to_string(), msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED".to_string(), msg),
        };
        (status, Json(ErrorResponse { code, message })).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// 校验请求体
pub fn validated<T: Validate>(dto: T) -> Result<T, ApiError> {
    dto.validate()?;
    Ok(dto)
}

/// 调用者身份
#[derive(Debug, Clone, Copy)]
pub struct Caller(pub UserContext);

impl Caller {
    fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let id = headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("缺少 x-user-id 请求头".to_string()))?
            .trim()
            .parse::<i32>()
            .map_err(|_| ApiError::Unauthorized("x-user-id 无效".to_string()))?;
        let is_superuser = headers
            .get("x-superuser")
            .and_then(|v| v.to_str().ok())
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Ok(Caller(UserContext::new(id, is_superuser)))
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Caller::from_headers(&parts.headers)
    }
}
