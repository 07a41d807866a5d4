//! Telegram Bot API

use super::{delivery_error, read_limited};
use crate::config::TelegramSettings;
use crate::error::{Result, StudyBuddyError};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const TELEGRAM_IMAGE_LIMIT: u64 = 10 * 1024 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TelegramReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramReply {
    fn ok(self, what: &str) -> Result<()> {
        if self.ok {
            Ok(())
        } else {
            Err(StudyBuddyError::NotifyDelivery(format!(
                "Telegram {} 失敗: {}",
                what,
                self.description.unwrap_or_default()
            )))
        }
    }
}

pub struct TelegramAdapter {
    client: reqwest::Client,
    settings: TelegramSettings,
}

impl TelegramAdapter {
    pub fn new(settings: TelegramSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StudyBuddyError::Config(format!("HTTPクライアント初期化に失敗: {}", e)))?;
        Ok(Self { client, settings })
    }

    pub fn recipients(&self) -> &[String] {
        &self.settings.chat_ids
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.bot_token,
            method
        )
    }

    pub async fn send_text(&self, chat_id: &str, text: &str) -> Result<()> {
        let reply: TelegramReply = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&json!({"chat_id": chat_id, "text": text}))
            .send()
            .await
            .map_err(delivery_error)?
            .json()
            .await
            .map_err(delivery_error)?;
        reply.ok("sendMessage")?;
        debug!(chat_id, "Telegram テキスト送信");
        Ok(())
    }

    /// 読み込み済み画像を送る（10MB まで）
    pub async fn send_photo(&self, chat_id: &str, file_name: &str, bytes: Vec<u8>) -> Result<()> {
        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str("image/jpeg")
            .map_err(delivery_error)?;
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part("photo", part);

        let reply: TelegramReply = self
            .client
            .post(self.method_url("sendPhoto"))
            .multipart(form)
            .send()
            .await
            .map_err(delivery_error)?
            .json()
            .await
            .map_err(delivery_error)?;
        reply.ok("sendPhoto")?;
        debug!(chat_id, "Telegram 画像送信");
        Ok(())
    }

    pub async fn load_photo(path: &Path) -> Result<Vec<u8>> {
        read_limited(path, TELEGRAM_IMAGE_LIMIT).await
    }
}
