//! 通知送信
//!
//! 設定済みの全アダプタ・全受信者へ配信する。受信者ごとの失敗は記録して次へ進む。

mod message;
mod telegram;
mod wecom;

pub use message::{level_marker, with_level, AlertMessage, NOTIFICATION_TITLE};
pub use telegram::{TelegramAdapter, TELEGRAM_IMAGE_LIMIT};
pub use wecom::{WeComAdapter, WECOM_IMAGE_LIMIT};

use crate::config::AppConfig;
use crate::error::{Result, StudyBuddyError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};
use study_buddy_common::NotifyLevel;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[serde(alias = "wechat")]
    WeCom,
    Telegram,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::WeCom => "wecom",
            Platform::Telegram => "telegram",
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = StudyBuddyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "wecom" | "wechat" => Ok(Platform::WeCom),
            "telegram" => Ok(Platform::Telegram),
            other => Err(StudyBuddyError::Config(format!("未知のプラットフォーム: {}", other))),
        }
    }
}

/// 送信前に準備した画像（WeCom はアップロード済み media_id）
enum PreparedImage {
    WeComMedia(String),
    Bytes { file_name: String, bytes: Vec<u8> },
}

/// チャットプラットフォーム
pub enum Adapter {
    WeCom(WeComAdapter),
    Telegram(TelegramAdapter),
}

impl Adapter {
    pub fn platform(&self) -> Platform {
        match self {
            Adapter::WeCom(_) => Platform::WeCom,
            Adapter::Telegram(_) => Platform::Telegram,
        }
    }

    pub fn recipients(&self) -> &[String] {
        match self {
            Adapter::WeCom(a) => a.recipients(),
            Adapter::Telegram(a) => a.recipients(),
        }
    }

    pub async fn send_text(&self, recipient: &str, text: &str) -> Result<()> {
        match self {
            Adapter::WeCom(a) => a.send_text(recipient, text).await,
            Adapter::Telegram(a) => a.send_text(recipient, text).await,
        }
    }

    pub async fn send_image(&self, recipient: &str, path: &Path) -> Result<()> {
        let prepared = self.prepare_image(path).await?;
        self.send_prepared(recipient, &prepared).await
    }

    async fn prepare_image(&self, path: &Path) -> Result<PreparedImage> {
        match self {
            Adapter::WeCom(a) => Ok(PreparedImage::WeComMedia(a.upload_image(path).await?)),
            Adapter::Telegram(_) => Ok(PreparedImage::Bytes {
                file_name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "image.jpg".into()),
                bytes: TelegramAdapter::load_photo(path).await?,
            }),
        }
    }

    async fn send_prepared(&self, recipient: &str, image: &PreparedImage) -> Result<()> {
        match (self, image) {
            (Adapter::WeCom(a), PreparedImage::WeComMedia(media_id)) => a.send_media(recipient, media_id).await,
            (Adapter::Telegram(a), PreparedImage::Bytes { file_name, bytes }) => {
                a.send_photo(recipient, file_name, bytes.clone()).await
            }
            _ => Err(StudyBuddyError::NotifyDelivery("画像形式がアダプタと一致しません".into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryFailure {
    pub platform: Platform,
    pub recipient: String,
    pub error: String,
}

/// 配信結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// `platform:recipient`
    pub delivered: Vec<String>,
    pub failed: Vec<DeliveryFailure>,
}

impl DeliveryReport {
    pub fn any_delivered(&self) -> bool {
        !self.delivered.is_empty()
    }

    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty() && !self.delivered.is_empty()
    }

    pub fn merge(&mut self, other: DeliveryReport) {
        self.delivered.extend(other.delivered);
        self.failed.extend(other.failed);
    }

    fn record(&mut self, platform: Platform, recipient: &str, result: Result<()>) {
        match result {
            Ok(()) => self.delivered.push(format!("{}:{}", platform.as_str(), recipient)),
            Err(e) => {
                warn!(platform = platform.as_str(), recipient, error = %e, "通知送信に失敗");
                self.failed.push(DeliveryFailure {
                    platform,
                    recipient: recipient.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
}

pub struct MessengerService {
    adapters: Vec<Adapter>,
}

impl MessengerService {
    pub fn new(adapters: Vec<Adapter>) -> Self {
        Self { adapters }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// 環境設定にあるプラットフォームをすべて有効化
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let mut adapters = Vec::new();
        if let Some(wecom) = &config.wecom {
            adapters.push(Adapter::WeCom(WeComAdapter::new(wecom.clone())?));
        }
        if let Some(telegram) = &config.telegram {
            adapters.push(Adapter::Telegram(TelegramAdapter::new(telegram.clone())?));
        }
        info!(adapters = adapters.len(), "Messenger 初期化");
        Ok(Self::new(adapters))
    }

    pub fn is_configured(&self) -> bool {
        self.adapters.iter().any(|a| !a.recipients().is_empty())
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.adapters.iter().map(Adapter::platform).collect()
    }

    pub fn recipient_count(&self) -> usize {
        self.adapters.iter().map(|a| a.recipients().len()).sum()
    }

    /// 全受信者へテキスト送信
    pub async fn send(&self, text: &str, level: NotifyLevel) -> DeliveryReport {
        let text = with_level(level, text);
        let mut report = DeliveryReport::default();
        for adapter in &self.adapters {
            for recipient in adapter.recipients() {
                let result = adapter.send_text(recipient, &text).await;
                report.record(adapter.platform(), recipient, result);
            }
        }
        info!(
            level = level.as_str(),
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "テキスト通知"
        );
        report
    }

    /// 全受信者へ画像送信（準備はアダプタごとに1回）
    pub async fn send_image(&self, path: &Path, level: NotifyLevel) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for adapter in &self.adapters {
            if adapter.recipients().is_empty() {
                continue;
            }
            match adapter.prepare_image(path).await {
                Ok(prepared) => {
                    for recipient in adapter.recipients() {
                        let result = adapter.send_prepared(recipient, &prepared).await;
                        report.record(adapter.platform(), recipient, result);
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    for recipient in adapter.recipients() {
                        report.record(
                            adapter.platform(),
                            recipient,
                            Err(StudyBuddyError::NotifyDelivery(message.clone())),
                        );
                    }
                }
            }
        }
        info!(
            level = level.as_str(),
            path = %path.display(),
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "画像通知"
        );
        report
    }

    /// 1人の受信者へテスト送信（platform 未指定なら最初のアダプタ）
    pub async fn test_recipient(
        &self,
        platform: Option<Platform>,
        recipient: &str,
        image: Option<&Path>,
    ) -> Result<DeliveryReport> {
        let adapter = match platform {
            Some(p) => self.adapters.iter().find(|a| a.platform() == p),
            None => self.adapters.first(),
        }
        .ok_or_else(|| StudyBuddyError::Config("通知プラットフォームが設定されていません".into()))?;

        let text = with_level(
            NotifyLevel::Info,
            &format!(
                "{}\n\n这是一条测试消息。\n时间: {}",
                NOTIFICATION_TITLE,
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
            ),
        );

        let mut report = DeliveryReport::default();
        let result = adapter.send_text(recipient, &text).await;
        report.record(adapter.platform(), recipient, result);
        if let Some(path) = image {
            let result = adapter.send_image(recipient, path).await;
            report.record(adapter.platform(), recipient, result);
        }
        Ok(report)
    }
}

/// 監視サービスから見た通知先
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_text(&self, text: &str, level: NotifyLevel) -> DeliveryReport;
    async fn notify_image(&self, path: &Path, level: NotifyLevel) -> DeliveryReport;
}

#[async_trait]
impl Notifier for MessengerService {
    async fn notify_text(&self, text: &str, level: NotifyLevel) -> DeliveryReport {
        self.send(text, level).await
    }

    async fn notify_image(&self, path: &Path, level: NotifyLevel) -> DeliveryReport {
        self.send_image(path, level).await
    }
}

/// 差し替え可能な MessengerService（受信者保存時に作り直す）
pub struct SharedMessenger {
    inner: RwLock<Arc<MessengerService>>,
}

impl SharedMessenger {
    pub fn new(service: MessengerService) -> Self {
        Self {
            inner: RwLock::new(Arc::new(service)),
        }
    }

    pub fn current(&self) -> Arc<MessengerService> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, service: MessengerService) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(service);
    }
}

#[async_trait]
impl Notifier for SharedMessenger {
    async fn notify_text(&self, text: &str, level: NotifyLevel) -> DeliveryReport {
        self.current().send(text, level).await
    }

    async fn notify_image(&self, path: &Path, level: NotifyLevel) -> DeliveryReport {
        self.current().send_image(path, level).await
    }
}

pub(crate) fn delivery_error(e: impl std::fmt::Display) -> StudyBuddyError {
    StudyBuddyError::NotifyDelivery(e.to_string())
}

/// サイズ上限付きで読み込む
pub(crate) async fn read_limited(path: &Path, limit: u64) -> Result<Vec<u8>> {
    let meta = tokio::fs::metadata(path).await.map_err(|e| {
        StudyBuddyError::NotifyDelivery(format!("画像がありません {}: {}", path.display(), e))
    })?;
    if meta.len() > limit {
        return Err(StudyBuddyError::NotifyDelivery(format!(
            "画像サイズが上限を超えています: {:.2}MB > {:.0}MB",
            meta.len() as f64 / 1024.0 / 1024.0,
            limit as f64 / 1024.0 / 1024.0
        )));
    }
    Ok(tokio::fs::read(path).await?)
}
