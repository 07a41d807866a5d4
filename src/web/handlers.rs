use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use chrono::Local;
use serde_json::Value;
use tracing::{info, warn};

use super::dto::{
    ApiResponse, ImageQuery, PreviewStatusResponse, RecentQuery, RecordsResponse, SaveRecipientsRequest,
    SaveRecipientsResponse, StartResponse, TestRecipientRequest, TestRecipientResponse,
};
use super::error::{ApiError, ApiResult};
use super::html::INDEX_HTML;
use super::WebState;
use crate::camera::CameraService;
use crate::config::{split_recipients, RecipientsFile};
use crate::error::StudyBuddyError;
use crate::messenger::{MessengerService, Platform};
use crate::monitor::{MonitorStatus, StopReason};
use study_buddy_common::MonitorConfig;

pub const DEFAULT_RECENT_LIMIT: usize = 10;
const FRAME_INTERVAL: Duration = Duration::from_millis(100);
const FRAME_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

pub async fn status(State(state): State<WebState>) -> Json<ApiResponse<MonitorStatus>> {
    ApiResponse::ok(state.monitor.status())
}

// =============================================
// 設定
// =============================================

pub async fn get_config(State(state): State<WebState>) -> Json<ApiResponse<MonitorConfig>> {
    ApiResponse::ok(state.monitor.config())
}

pub async fn update_config(
    State(state): State<WebState>,
    Json(patch): Json<Value>,
) -> ApiResult<Json<ApiResponse<MonitorConfig>>> {
    let config = state.monitor.update_config(&patch).await?;
    info!("監視設定を更新");
    Ok(ApiResponse::ok_with_message(config, "設定を更新しました"))
}

// =============================================
// 監視
// =============================================

pub async fn start_monitor(State(state): State<WebState>) -> ApiResult<Json<ApiResponse<StartResponse>>> {
    let preview_duration = state.monitor.start().await?;
    Ok(ApiResponse::ok_with_message(
        StartResponse { preview_duration },
        "監視を開始しました",
    ))
}

pub async fn stop_monitor(State(state): State<WebState>) -> ApiResult<Json<ApiResponse<()>>> {
    state.monitor.stop(StopReason::Manual).await?;
    Ok(ApiResponse::<()>::message("監視を停止しました"))
}

// =============================================
// 通知先
// =============================================

fn parse_platform(raw: Option<&str>) -> Result<Option<Platform>, StudyBuddyError> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse::<Platform>)
        .transpose()
}

pub async fn test_recipient(
    State(state): State<WebState>,
    Json(request): Json<TestRecipientRequest>,
) -> ApiResult<Json<ApiResponse<TestRecipientResponse>>> {
    let recipient = request.recipient_id.trim().to_string();
    if recipient.is_empty() {
        return Err(StudyBuddyError::Config("受信者IDが空です".into()).into());
    }
    let platform = parse_platform(request.platform.as_deref())?;

    // 撮影画像がなければテキストのみ
    let image = state.monitor.camera().latest_capture();
    let report = state
        .messenger
        .current()
        .test_recipient(platform, &recipient, image.as_deref())
        .await?;

    let message = if report.all_delivered() {
        "テスト送信が完了しました"
    } else {
        "テスト送信に失敗した項目があります"
    };
    Ok(Json(ApiResponse {
        success: report.any_delivered(),
        data: Some(TestRecipientResponse {
            recipient,
            image: image.map(|p| p.display().to_string()),
            report,
        }),
        message: Some(message.to_string()),
    }))
}

pub async fn save_recipients(
    State(state): State<WebState>,
    Json(request): Json<SaveRecipientsRequest>,
) -> ApiResult<Json<ApiResponse<SaveRecipientsResponse>>> {
    let recipients = split_recipients(&request.recipients);
    if recipients.is_empty() {
        return Err(StudyBuddyError::Config("受信者リストが空です".into()).into());
    }
    let platform = parse_platform(request.platform.as_deref())?.unwrap_or(Platform::WeCom);

    let _guard = state.recipients_lock.lock().await;
    let mut next = state.app_config();
    match platform {
        Platform::WeCom => {
            next.wecom
                .as_mut()
                .ok_or_else(|| StudyBuddyError::Config("WeCom が設定されていません".into()))?
                .recipients = recipients.clone();
        }
        Platform::Telegram => {
            next.telegram
                .as_mut()
                .ok_or_else(|| StudyBuddyError::Config("Telegram が設定されていません".into()))?
                .chat_ids = recipients.clone();
        }
    }

    // 保存 → 送信サービス再構築 → 反映
    let path = next.paths.recipients_file();
    let saved = recipients.clone();
    tokio::task::spawn_blocking(move || -> Result<(), StudyBuddyError> {
        let mut file = RecipientsFile::load(&path)?.unwrap_or_default();
        match platform {
            Platform::WeCom => file.wecom = saved,
            Platform::Telegram => file.telegram = saved,
        }
        file.save(&path)
    })
    .await
    .map_err(|e| StudyBuddyError::Config(format!("受信者の保存タスクが失敗: {}", e)))??;
    state.messenger.replace(MessengerService::from_config(&next)?);
    state.replace_app_config(next);

    info!(platform = platform.as_str(), count = recipients.len(), "受信者リストを保存");
    Ok(ApiResponse::ok_with_message(
        SaveRecipientsResponse {
            platform: platform.as_str().to_string(),
            recipients,
        },
        "保存しました",
    ))
}

// =============================================
// 記録
// =============================================

pub async fn today_records(State(state): State<WebState>) -> ApiResult<Json<ApiResponse<RecordsResponse>>> {
    let records = state.monitor.store().get_today(Local::now().date_naive())?;
    Ok(ApiResponse::ok(RecordsResponse::new(records)))
}

pub async fn recent_records(
    State(state): State<WebState>,
    Query(query): Query<RecentQuery>,
) -> ApiResult<Json<ApiResponse<RecordsResponse>>> {
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT);
    let records = state.monitor.store().get_recent(limit)?;
    Ok(ApiResponse::ok(RecordsResponse::new(records)))
}

/// 撮影ディレクトリ内に限定してパスを解決
pub fn resolve_capture_path(captures_dir: &Path, requested: &str) -> Result<PathBuf, StudyBuddyError> {
    let requested_path = Path::new(requested);
    if requested.trim().is_empty() {
        return Err(StudyBuddyError::Forbidden("パスが空です".into()));
    }
    if requested_path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(StudyBuddyError::Forbidden(requested.to_string()));
    }

    let candidate = if requested_path.is_absolute() {
        requested_path.to_path_buf()
    } else {
        captures_dir.join(requested_path)
    };
    if !candidate.starts_with(captures_dir) {
        return Err(StudyBuddyError::Forbidden(requested.to_string()));
    }

    let resolved = candidate
        .canonicalize()
        .map_err(|_| StudyBuddyError::NotFound(requested.to_string()))?;
    let root = captures_dir
        .canonicalize()
        .map_err(|_| StudyBuddyError::NotFound(requested.to_string()))?;
    // シンボリックリンク経由の脱出
    if !resolved.starts_with(&root) {
        return Err(StudyBuddyError::Forbidden(requested.to_string()));
    }
    if !resolved.is_file() {
        return Err(StudyBuddyError::NotFound(requested.to_string()));
    }
    Ok(resolved)
}

pub async fn image(State(state): State<WebState>, Query(query): Query<ImageQuery>) -> Response {
    let Some(requested) = query.path else {
        return (StatusCode::BAD_REQUEST, Json(ApiResponse::<()>::failure("path を指定してください"))).into_response();
    };
    let path = match resolve_capture_path(state.monitor.camera().captures_dir(), &requested) {
        Ok(path) => path,
        Err(e) => return ApiError(e).into_response(),
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => (StatusCode::OK, [(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response(),
        Err(e) => ApiError(StudyBuddyError::Io(e)).into_response(),
    }
}

// =============================================
// プレビュー
// =============================================

pub async fn preview_status(State(state): State<WebState>) -> Json<ApiResponse<PreviewStatusResponse>> {
    let remaining = state.monitor.camera().preview_remaining();
    ApiResponse::ok(PreviewStatusResponse {
        active: remaining.is_some(),
        remaining: remaining
            .map(|d| (d.as_secs_f64() * 10.0).round() / 10.0)
            .unwrap_or(0.0),
    })
}

fn mjpeg_part(frame: &[u8]) -> Bytes {
    let mut chunk = Vec::with_capacity(frame.len() + 64);
    chunk.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
    chunk.extend_from_slice(frame);
    chunk.extend_from_slice(b"\r\n");
    Bytes::from(chunk)
}

/// プレビュー中のみ MJPEG を流す（約10fps、期限切れで終了）
pub async fn video_feed(State(state): State<WebState>) -> Response {
    let camera = state.monitor.camera().clone();
    if !camera.is_previewing() {
        return (StatusCode::FORBIDDEN, Json(ApiResponse::<()>::failure("プレビューは無効です"))).into_response();
    }

    let stream = futures::stream::unfold((camera, true), |(camera, first)| async move {
        if !first {
            tokio::time::sleep(FRAME_INTERVAL).await;
        }
        loop {
            match next_frame(&camera).await {
                Some(Ok(frame)) => return Some((Ok::<_, std::io::Error>(mjpeg_part(&frame)), (camera, false))),
                Some(Err(())) => tokio::time::sleep(FRAME_RETRY_DELAY).await,
                None => return None,
            }
        }
    });

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE), (header::CACHE_CONTROL, "no-cache")],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn next_frame(camera: &CameraService) -> Option<Result<Vec<u8>, ()>> {
    match camera.next_preview_frame().await {
        Ok(Some(frame)) => Some(Ok(frame)),
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "プレビューフレームの取得に失敗");
            Some(Err(()))
        }
    }
}
