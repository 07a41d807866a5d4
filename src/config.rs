//! アプリケーション設定
//!
//! - AppConfig: 環境変数から解決する接続設定（APIキー・通知先・カメラ）
//! - AppPaths: ホームディレクトリ配下のファイル配置
//! - ConfigStore: 監視設定ファイルの読み書きと共有スナップショット

use crate::error::{Result, StudyBuddyError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use study_buddy_common::MonitorConfig;
use tracing::{info, warn};

pub const DEFAULT_KIMI_BASE_URL: &str = "https://api.moonshot.cn/v1";
pub const DEFAULT_KIMI_MODEL: &str = "moonshot-v1-8k-vision-preview";
pub const DEFAULT_WECOM_BASE_URL: &str = "https://qyapi.weixin.qq.com";
pub const DEFAULT_TELEGRAM_BASE_URL: &str = "https://api.telegram.org";

/// ホームディレクトリ配下のパス
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub home: PathBuf,
}

impl AppPaths {
    /// `--home` → `STUDY_BUDDY_HOME` → `~/.study-buddy`
    pub fn resolve(home_flag: Option<PathBuf>) -> Result<Self> {
        if let Some(home) = home_flag {
            return Ok(Self::new(home));
        }
        if let Ok(home) = std::env::var("STUDY_BUDDY_HOME") {
            if !home.trim().is_empty() {
                return Ok(Self::new(PathBuf::from(home)));
            }
        }
        let home = dirs::home_dir()
            .ok_or_else(|| StudyBuddyError::Config("ホームディレクトリが見つかりません".into()))?;
        Ok(Self::new(home.join(".study-buddy")))
    }

    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.home.join("config")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.home.join("data")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn captures_dir(&self) -> PathBuf {
        self.data_dir().join("captures")
    }

    pub fn monitor_config_file(&self) -> PathBuf {
        self.config_dir().join("monitor_config.json")
    }

    pub fn recipients_file(&self) -> PathBuf {
        self.config_dir().join("recipients.json")
    }

    pub fn database_file(&self) -> PathBuf {
        self.data_dir().join("detection_records.db")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.config_dir(), self.captures_dir(), self.logs_dir()] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KimiSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeComSettings {
    pub corp_id: String,
    pub secret: String,
    pub agent_id: i64,
    pub recipients: Vec<String>,
    pub base_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_ids: Vec<String>,
    pub base_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSettings {
    /// 撮影コマンド（既定 ffmpeg）
    pub program: String,
    /// デバイス指定（未指定ならプラットフォーム既定）
    pub device: Option<String>,
    pub max_width: u32,
    pub capture_timeout_secs: u64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            program: "ffmpeg".into(),
            device: None,
            max_width: 1920,
            capture_timeout_secs: 15,
        }
    }
}

/// 環境変数から解決した設定一式
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub paths: AppPaths,
    pub kimi: KimiSettings,
    pub wecom: Option<WeComSettings>,
    pub telegram: Option<TelegramSettings>,
    pub camera: CameraSettings,
}

impl AppConfig {
    pub fn load(home_flag: Option<PathBuf>) -> Result<Self> {
        let paths = AppPaths::resolve(home_flag)?;
        let mut config = Self::from_lookup(paths, |key| std::env::var(key).ok())?;
        config.apply_saved_recipients()?;
        Ok(config)
    }

    /// 任意の検索関数から構築（テスト用に環境変数を差し替えられる）
    pub fn from_lookup<F>(paths: AppPaths, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let kimi = KimiSettings {
            api_key: get("KIMI_API_KEY"),
            base_url: get("KIMI_BASE_URL").unwrap_or_else(|| DEFAULT_KIMI_BASE_URL.into()),
            model: get("KIMI_MODEL").unwrap_or_else(|| DEFAULT_KIMI_MODEL.into()),
            timeout_secs: parse_env_number(get("KIMI_TIMEOUT_SECS"), "KIMI_TIMEOUT_SECS", 120)?,
            max_retries: parse_env_number(get("KIMI_MAX_RETRIES"), "KIMI_MAX_RETRIES", 3)?,
        };

        let wecom = match (get("WECHAT_CORPID"), get("WECHAT_SECRET"), get("WECHAT_AGENTID")) {
            (Some(corp_id), Some(secret), Some(agent_id)) => Some(WeComSettings {
                corp_id,
                secret,
                agent_id: agent_id.parse().map_err(|_| {
                    StudyBuddyError::Config(format!("WECHAT_AGENTID が数値ではありません: {}", agent_id))
                })?,
                recipients: split_recipients(get("WECHAT_TOUSER").as_deref().unwrap_or("")),
                base_url: get("WECHAT_BASE_URL").unwrap_or_else(|| DEFAULT_WECOM_BASE_URL.into()),
            }),
            _ => None,
        };

        let telegram = get("TELEGRAM_BOT_TOKEN").map(|bot_token| TelegramSettings {
            bot_token,
            chat_ids: split_recipients(get("TELEGRAM_CHAT_ID").as_deref().unwrap_or("")),
            base_url: get("TELEGRAM_BASE_URL").unwrap_or_else(|| DEFAULT_TELEGRAM_BASE_URL.into()),
        });

        let mut camera = CameraSettings::default();
        if let Some(program) = get("STUDY_BUDDY_CAMERA_PROGRAM") {
            camera.program = program;
        }
        camera.device = get("STUDY_BUDDY_CAMERA_DEVICE");

        Ok(Self {
            paths,
            kimi,
            wecom,
            telegram,
            camera,
        })
    }

    pub fn get_api_key(&self) -> Result<String> {
        self.kimi.api_key.clone().ok_or(StudyBuddyError::MissingApiKey)
    }

    /// 保存済みの受信者リストで環境変数の値を上書き
    pub fn apply_saved_recipients(&mut self) -> Result<()> {
        let Some(saved) = RecipientsFile::load(&self.paths.recipients_file())? else {
            return Ok(());
        };
        if let Some(wecom) = self.wecom.as_mut() {
            if !saved.wecom.is_empty() {
                wecom.recipients = saved.wecom;
            }
        }
        if let Some(telegram) = self.telegram.as_mut() {
            if !saved.telegram.is_empty() {
                telegram.chat_ids = saved.telegram;
            }
        }
        Ok(())
    }
}

fn parse_env_number<T: std::str::FromStr>(value: Option<String>, key: &str, default: T) -> Result<T> {
    match value {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| StudyBuddyError::Config(format!("{} が数値ではありません: {}", key, v))),
    }
}

/// `a|b|c` 形式の受信者リスト
pub fn split_recipients(raw: &str) -> Vec<String> {
    raw.split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// 受信者リストの永続化（config/recipients.json）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientsFile {
    #[serde(default)]
    pub wecom: Vec<String>,
    #[serde(default)]
    pub telegram: Vec<String>,
}

impl RecipientsFile {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// 監視設定ストア
///
/// サイクルごとに [`ConfigStore::snapshot`] で最新値を取得する。
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    current: Arc<RwLock<MonitorConfig>>,
}

impl ConfigStore {
    /// ファイルがなければ既定値を書き出す。壊れたJSONは既定値で起動（ファイルは上書きしない）。
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            match MonitorConfig::from_json_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "監視設定を読めないため既定値を使用");
                    MonitorConfig::default()
                }
            }
        } else {
            let config = MonitorConfig::default();
            write_config(&path, &config)?;
            info!(path = %path.display(), "既定の監視設定を作成");
            config
        };

        Ok(Self {
            path,
            current: Arc::new(RwLock::new(config)),
        })
    }

    /// メモリ上のみ（テスト用）
    pub fn in_memory(path: impl Into<PathBuf>, config: MonitorConfig) -> Self {
        Self {
            path: path.into(),
            current: Arc::new(RwLock::new(config)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> MonitorConfig {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 部分更新: 検証 → 保存 → 反映。失敗時は元の設定とファイルをそのまま残す。
    ///
    /// 戻り値は (更新前, 更新後)
    pub fn update(&self, patch: &Value) -> Result<(MonitorConfig, MonitorConfig)> {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = guard.apply_patch(patch)?;
        write_config(&self.path, &next)?;
        let previous = std::mem::replace(&mut *guard, next.clone());
        Ok((previous, next))
    }

    /// 既定値に戻して保存
    pub fn reset(&self) -> Result<MonitorConfig> {
        let config = MonitorConfig::default();
        write_config(&self.path, &config)?;
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = config.clone();
        Ok(config)
    }
}

fn write_config(path: &Path, config: &MonitorConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, config.to_json_pretty()?)?;
    Ok(())
}
