//! 企業微信（WeCom）アプリメッセージ

use super::{delivery_error, read_limited};
use crate::config::WeComSettings;
use crate::error::{Result, StudyBuddyError};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const WECOM_IMAGE_LIMIT: u64 = 2 * 1024 * 1024;
/// トークン期限の前倒し
const TOKEN_EARLY_EXPIRY: Duration = Duration::from_secs(300);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// WeCom のトークン有効期間（秒）。これを超える expires_in は丸める
const MAX_TOKEN_LIFETIME_SECS: u64 = 7200;

#[derive(Debug, Deserialize)]
struct WeComReply {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    media_id: Option<String>,
}

impl WeComReply {
    fn ok(self, what: &str) -> Result<Self> {
        if self.errcode == 0 {
            Ok(self)
        } else {
            Err(StudyBuddyError::NotifyDelivery(format!(
                "WeCom {} 失敗 (errcode {}): {}",
                what, self.errcode, self.errmsg
            )))
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

pub struct WeComAdapter {
    client: reqwest::Client,
    settings: WeComSettings,
    token: Mutex<Option<CachedToken>>,
}

impl WeComAdapter {
    pub fn new(settings: WeComSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StudyBuddyError::Config(format!("HTTPクライアント初期化に失敗: {}", e)))?;
        Ok(Self {
            client,
            settings,
            token: Mutex::new(None),
        })
    }

    pub fn recipients(&self) -> &[String] {
        &self.settings.recipients
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    /// キャッシュ付きアクセストークン取得
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.token.clone());
            }
        }

        let reply: WeComReply = self
            .client
            .get(self.url("/cgi-bin/gettoken"))
            .query(&[
                ("corpid", self.settings.corp_id.as_str()),
                ("corpsecret", self.settings.secret.as_str()),
            ])
            .send()
            .await
            .map_err(delivery_error)?
            .json()
            .await
            .map_err(delivery_error)?;
        let reply = reply.ok("access_token 取得")?;

        let token = reply
            .access_token
            .ok_or_else(|| StudyBuddyError::NotifyDelivery("access_token がありません".into()))?;
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at: token_expiry(Instant::now(), reply.expires_in),
        });
        info!("WeCom access_token を取得");
        Ok(token)
    }

    async fn post_message(&self, body: serde_json::Value) -> Result<()> {
        let token = self.access_token().await?;
        let reply: WeComReply = self
            .client
            .post(self.url("/cgi-bin/message/send"))
            .query(&[("access_token", token.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(delivery_error)?
            .json()
            .await
            .map_err(delivery_error)?;
        reply.ok("メッセージ送信")?;
        Ok(())
    }

    pub async fn send_text(&self, recipient: &str, text: &str) -> Result<()> {
        self.post_message(json!({
            "touser": recipient,
            "msgtype": "text",
            "agentid": self.settings.agent_id,
            "text": {"content": text},
            "safe": 0
        }))
        .await?;
        debug!(recipient, "WeCom テキスト送信");
        Ok(())
    }

    /// 画像をアップロードして media_id を返す（2MB まで）
    pub async fn upload_image(&self, path: &Path) -> Result<String> {
        let bytes = read_limited(path, WECOM_IMAGE_LIMIT).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "image.jpg".into());
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("image/jpeg")
            .map_err(delivery_error)?;

        let token = self.access_token().await?;
        let reply: WeComReply = self
            .client
            .post(self.url("/cgi-bin/media/upload"))
            .query(&[("access_token", token.as_str()), ("type", "image")])
            .multipart(Form::new().part("media", part))
            .send()
            .await
            .map_err(delivery_error)?
            .json()
            .await
            .map_err(delivery_error)?;
        let reply = reply.ok("画像アップロード")?;
        reply
            .media_id
            .ok_or_else(|| StudyBuddyError::NotifyDelivery("media_id がありません".into()))
    }

    pub async fn send_media(&self, recipient: &str, media_id: &str) -> Result<()> {
        self.post_message(json!({
            "touser": recipient,
            "msgtype": "image",
            "agentid": self.settings.agent_id,
            "image": {"media_id": media_id},
            "safe": 0
        }))
        .await?;
        debug!(recipient, "WeCom 画像送信");
        Ok(())
    }
}

fn token_expiry(now: Instant, expires_in: Option<u64>) -> Instant {
    let secs = expires_in
        .unwrap_or(MAX_TOKEN_LIFETIME_SECS)
        .min(MAX_TOKEN_LIFETIME_SECS);
    now + Duration::from_secs(secs).saturating_sub(TOKEN_EARLY_EXPIRY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_expiry_clamps_server_lifetime() {
        let now = Instant::now();
        assert_eq!(token_expiry(now, Some(u64::MAX)), now + Duration::from_secs(6900));
        assert_eq!(token_expiry(now, None), now + Duration::from_secs(6900));
        assert_eq!(token_expiry(now, Some(600)), now + Duration::from_secs(300));
        // 前倒し分より短ければ即期限切れ
        assert_eq!(token_expiry(now, Some(60)), now);
    }

    #[test]
    fn test_reply_errcode() {
        let reply: WeComReply = serde_json::from_str(r#"{"errcode": 40014, "errmsg": "invalid access_token"}"#).unwrap();
        let err = reply.ok("送信").unwrap_err();
        assert!(err.to_string().contains("40014"));
    }
}
