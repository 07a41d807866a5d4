use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{error, warn};

use super::dto::ApiResponse;
use crate::error::StudyBuddyError;

/// ハンドラのエラー（`success: false` の封筒で返す）
#[derive(Debug)]
pub struct ApiError(pub StudyBuddyError);

impl From<StudyBuddyError> for ApiError {
    fn from(e: StudyBuddyError) -> Self {
        Self(e)
    }
}

impl From<study_buddy_common::Error> for ApiError {
    fn from(e: study_buddy_common::Error) -> Self {
        Self(StudyBuddyError::Common(e))
    }
}

pub fn status_for(err: &StudyBuddyError) -> StatusCode {
    match err {
        StudyBuddyError::AlreadyRunning | StudyBuddyError::NotRunning => StatusCode::BAD_REQUEST,
        e if e.is_config_error() => StatusCode::BAD_REQUEST,
        StudyBuddyError::Forbidden(_) => StatusCode::FORBIDDEN,
        StudyBuddyError::NotFound(_) => StatusCode::NOT_FOUND,
        StudyBuddyError::NotifyDelivery(_) | StudyBuddyError::Analysis(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(error = %self.0, "リクエスト処理に失敗");
        } else {
            warn!(status = status.as_u16(), error = %self.0, "リクエストを拒否");
        }
        (status, Json(ApiResponse::<()>::failure(self.0.to_string()))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
