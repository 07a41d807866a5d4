//! 監視設定（MonitorConfig）
//!
//! 読み込みは寛容（欠落・型不一致は既定値）、Web からの部分更新は厳格
//! （不正値はエラーにして元の設定を保持）。

use crate::error::{Error, Result};
use crate::notify::NotifyPolicy;
use crate::rules::validate_rules;
use crate::types::Rule;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_MIN_NOTIFY_INTERVAL: u64 = 10;
pub const DEFAULT_MAX_NOTIFY_INTERVAL: u64 = 60;
pub const DEFAULT_CONSECUTIVE_FAIL_LIMIT: u32 = 5;
pub const DEFAULT_CAPTURE_INTERVAL: u64 = 30;
pub const DEFAULT_PREVIEW_DURATION: u64 = 10;
pub const DEFAULT_AUTO_START_TIME: &str = "09:00";
pub const DEFAULT_AUTO_STOP_TIME: &str = "18:00";
/// 通知間隔の上限（7日、分）
pub const MAX_NOTIFY_INTERVAL: u64 = 7 * 24 * 60;

/// 監視設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub rules: Vec<Rule>,
    /// 分
    pub min_notify_interval: u64,
    /// 分
    pub max_notify_interval: u64,
    pub consecutive_fail_limit: u32,
    /// HH:MM
    pub auto_start_time: String,
    /// HH:MM
    pub auto_stop_time: String,
    pub enable_time_scheduler: bool,
    /// 秒
    pub capture_interval: u64,
    /// 秒
    pub preview_duration: u64,
    pub enable_preview: bool,
}

/// 既定ルール（キーは prompts::SCENE_ATTRIBUTES と対応）
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule::new("at_desk", "^true$"),
        Rule::new("is_study", "^true$"),
        Rule::new("activity", "^(看书|写字)$"),
        Rule::new("posture", "^(端正)$"),
        Rule::new("lighting", "^(充足|一般)$"),
    ]
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            min_notify_interval: DEFAULT_MIN_NOTIFY_INTERVAL,
            max_notify_interval: DEFAULT_MAX_NOTIFY_INTERVAL,
            consecutive_fail_limit: DEFAULT_CONSECUTIVE_FAIL_LIMIT,
            auto_start_time: DEFAULT_AUTO_START_TIME.to_string(),
            auto_stop_time: DEFAULT_AUTO_STOP_TIME.to_string(),
            enable_time_scheduler: false,
            capture_interval: DEFAULT_CAPTURE_INTERVAL,
            preview_duration: DEFAULT_PREVIEW_DURATION,
            enable_preview: true,
        }
    }
}

/// `HH:MM` をパース
pub fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|_| Error::InvalidTime(s.to_string()))
}

impl MonitorConfig {
    /// ファイル内容から寛容に読み込む
    ///
    /// 欠落フィールド、数値でない数値フィールド、解釈できないルール配列は既定値になる。
    /// トップレベルがオブジェクトでなければエラー。
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::Config("設定がJSONオブジェクトではありません".into()))?;
        let defaults = Self::default();

        let rules = obj
            .get("rules")
            .and_then(|v| serde_json::from_value::<Vec<Rule>>(v.clone()).ok())
            .filter(|rules| !rules.is_empty())
            .unwrap_or(defaults.rules);

        Ok(Self {
            rules,
            min_notify_interval: lenient_u64(obj.get("min_notify_interval"))
                .filter(|n| *n <= MAX_NOTIFY_INTERVAL)
                .unwrap_or(defaults.min_notify_interval),
            max_notify_interval: lenient_u64(obj.get("max_notify_interval"))
                .filter(|n| *n <= MAX_NOTIFY_INTERVAL)
                .unwrap_or(defaults.max_notify_interval),
            consecutive_fail_limit: lenient_u64(obj.get("consecutive_fail_limit"))
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.consecutive_fail_limit),
            auto_start_time: lenient_time(obj.get("auto_start_time"))
                .unwrap_or(defaults.auto_start_time),
            auto_stop_time: lenient_time(obj.get("auto_stop_time"))
                .unwrap_or(defaults.auto_stop_time),
            enable_time_scheduler: lenient_bool(obj.get("enable_time_scheduler"))
                .unwrap_or(defaults.enable_time_scheduler),
            capture_interval: lenient_u64(obj.get("capture_interval"))
                .unwrap_or(defaults.capture_interval),
            preview_duration: lenient_u64(obj.get("preview_duration"))
                .unwrap_or(defaults.preview_duration),
            enable_preview: lenient_bool(obj.get("enable_preview"))
                .unwrap_or(defaults.enable_preview),
        })
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(s)?;
        Self::from_value(&value)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 部分更新を適用した新しい設定を返す（self は変更しない）
    ///
    /// 数値は文字列でも可、真偽値は `"true"/"1"/"yes"` も可。
    /// 未知のキーは無視する。結果は [`MonitorConfig::validate`] を通ったもののみ。
    pub fn apply_patch(&self, patch: &Value) -> Result<Self> {
        let obj = patch
            .as_object()
            .ok_or_else(|| Error::Config("更新内容がJSONオブジェクトではありません".into()))?;
        let mut next = self.clone();

        for (key, value) in obj {
            match key.as_str() {
                "rules" => {
                    next.rules = serde_json::from_value(value.clone()).map_err(|e| {
                        Error::Config(format!("rules の形式が不正です: {}", e))
                    })?;
                }
                "min_notify_interval" => {
                    if let Some(n) = strict_u64(key, value)? {
                        next.min_notify_interval = n;
                    }
                }
                "max_notify_interval" => {
                    if let Some(n) = strict_u64(key, value)? {
                        next.max_notify_interval = n;
                    }
                }
                "consecutive_fail_limit" => {
                    if let Some(n) = strict_u64(key, value)? {
                        next.consecutive_fail_limit = u32::try_from(n)
                            .map_err(|_| Error::Config(format!("{} が大きすぎます: {}", key, n)))?;
                    }
                }
                "capture_interval" => {
                    if let Some(n) = strict_u64(key, value)? {
                        next.capture_interval = n;
                    }
                }
                "preview_duration" => {
                    if let Some(n) = strict_u64(key, value)? {
                        next.preview_duration = n;
                    }
                }
                "auto_start_time" => next.auto_start_time = strict_str(key, value)?,
                "auto_stop_time" => next.auto_stop_time = strict_str(key, value)?,
                "enable_time_scheduler" => next.enable_time_scheduler = strict_bool(key, value)?,
                "enable_preview" => next.enable_preview = strict_bool(key, value)?,
                _ => {}
            }
        }

        next.validate()?;
        Ok(next)
    }

    /// 保存可能な設定か検証
    pub fn validate(&self) -> Result<()> {
        if self.rules.is_empty() {
            return Err(Error::Config("ルールを1件以上設定してください".into()));
        }
        validate_rules(&self.rules)?;
        let start = parse_hhmm(&self.auto_start_time)?;
        let stop = parse_hhmm(&self.auto_stop_time)?;
        if self.enable_time_scheduler && start >= stop {
            return Err(Error::Config(format!(
                "自動開始 ({}) は自動停止 ({}) より前にしてください",
                self.auto_start_time, self.auto_stop_time
            )));
        }

        if self.capture_interval == 0 {
            return Err(Error::Config("capture_interval は1秒以上にしてください".into()));
        }
        if self.min_notify_interval == 0 || self.max_notify_interval == 0 {
            return Err(Error::Config("通知間隔は1分以上にしてください".into()));
        }
        if self.max_notify_interval > MAX_NOTIFY_INTERVAL {
            return Err(Error::Config(format!(
                "通知間隔は{}分以下にしてください: {}",
                MAX_NOTIFY_INTERVAL, self.max_notify_interval
            )));
        }
        if self.min_notify_interval > self.max_notify_interval {
            return Err(Error::Config(format!(
                "min_notify_interval ({}) が max_notify_interval ({}) を超えています",
                self.min_notify_interval, self.max_notify_interval
            )));
        }
        if self.consecutive_fail_limit == 0 {
            return Err(Error::Config("consecutive_fail_limit は1以上にしてください".into()));
        }
        if self.enable_preview && self.preview_duration == 0 {
            return Err(Error::Config("preview_duration は1秒以上にしてください".into()));
        }
        Ok(())
    }

    pub fn notify_policy(&self) -> NotifyPolicy {
        NotifyPolicy::from_minutes(
            self.min_notify_interval,
            self.max_notify_interval,
            self.consecutive_fail_limit,
        )
    }

    pub fn start_time(&self) -> Result<NaiveTime> {
        parse_hhmm(&self.auto_start_time)
    }

    pub fn stop_time(&self) -> Result<NaiveTime> {
        parse_hhmm(&self.auto_stop_time)
    }

    /// スケジューラ関連フィールドが変わったか
    pub fn scheduler_changed(&self, other: &Self) -> bool {
        self.enable_time_scheduler != other.enable_time_scheduler
            || self.auto_start_time != other.auto_start_time
            || self.auto_stop_time != other.auto_stop_time
    }

    /// キー → 値 のマップ（表示用）
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

// =============================================
// 値変換
// =============================================

fn lenient_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_bool(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(truthy(s)),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        _ => None,
    }
}

fn lenient_time(value: Option<&Value>) -> Option<String> {
    value?
        .as_str()
        .filter(|s| parse_hhmm(s).is_ok())
        .map(|s| s.trim().to_string())
}

fn truthy(s: &str) -> bool {
    matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

/// null / 空文字は「変更なし」
fn strict_u64(key: &str, value: &Value) -> Result<Option<u64>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| Error::Config(format!("{} は0以上の整数にしてください: {}", key, n))),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} は0以上の整数にしてください: {}", key, s))),
        other => Err(Error::Config(format!("{} の型が不正です: {}", key, other))),
    }
}

fn strict_bool(key: &str, value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => Ok(truthy(s)),
        Value::Number(n) => Ok(n.as_i64().map_or(false, |i| i != 0)),
        other => Err(Error::Config(format!("{} の型が不正です: {}", key, other))),
    }
}

fn strict_str(key: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(|s| s.trim().to_string())
        .ok_or_else(|| Error::Config(format!("{} は文字列にしてください", key)))
}
