use axum::Json;
use serde::{Deserialize, Serialize};
use study_buddy_common::DetectionRecord;

use crate::messenger::DeliveryReport;

/// 共通レスポンス `{success, data?, message?}`
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            message: None,
        })
    }

    pub fn ok_with_message(data: T, message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            message: Some(message.into()),
        })
    }
}

impl ApiResponse<()> {
    pub fn message(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            data: None,
            message: Some(message.into()),
        })
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub preview_duration: u64,
}

#[derive(Debug, Deserialize)]
pub struct TestRecipientRequest {
    #[serde(default)]
    pub recipient_id: String,
    #[serde(default)]
    pub platform: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TestRecipientResponse {
    pub recipient: String,
    pub image: Option<String>,
    pub report: DeliveryReport,
}

#[derive(Debug, Deserialize)]
pub struct SaveRecipientsRequest {
    #[serde(default)]
    pub recipients: String,
    #[serde(default)]
    pub platform: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SaveRecipientsResponse {
    pub platform: String,
    pub recipients: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RecordsResponse {
    pub count: usize,
    pub records: Vec<DetectionRecord>,
}

impl RecordsResponse {
    pub fn new(records: Vec<DetectionRecord>) -> Self {
        Self {
            count: records.len(),
            records,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PreviewStatusResponse {
    pub active: bool,
    /// 残り秒数（0.1秒単位）
    pub remaining: f64,
}
