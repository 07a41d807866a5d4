//! 監視ドメインの型定義
//!
//! - AnalysisResult: Vision API が1枚の画像について返した属性マップ
//! - Rule: 属性キーと正規表現の組
//! - DetectionRecord: 1サイクル分の検出記録
//! - NotifyLevel: 通知レベル

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// AI解析結果（属性キー → 観測値）
///
/// キー順は Vision API の応答順を保持する。
/// ルール判定では値を不透明な文字列として扱う（[`AnalysisResult::value_str`]）。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisResult(Map<String, Value>);

impl AnalysisResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// 解析失敗時の記録用（`{"error": "..."}`）
    pub fn from_error(message: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("error".to_string(), Value::String(message.into()));
        Self(map)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// 値を文字列形式に変換して返す
    ///
    /// 文字列はそのまま、真偽値は `true`/`false`、数値は10進表記、
    /// null は `null`、配列・オブジェクトはJSON表記。
    pub fn value_str(&self, key: &str) -> Option<String> {
        self.0.get(key).map(value_to_string)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// 判定ルール: `analysis[key]` が `pattern` に全体一致すること
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub key: String,

    #[serde(alias = "regexp")]
    pub pattern: String,
}

impl Rule {
    pub fn new(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            pattern: pattern.into(),
        }
    }
}

/// 通知レベル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyLevel {
    Info,
    Warning,
    Danger,
}

impl NotifyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyLevel::Info => "info",
            NotifyLevel::Warning => "warning",
            NotifyLevel::Danger => "danger",
        }
    }
}

impl std::fmt::Display for NotifyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 検出記録（保存前）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDetectionRecord {
    pub timestamp: NaiveDateTime,
    pub image_path: String,
    pub is_valid: bool,
    pub failed_keys: Vec<String>,
    pub should_notify: bool,
    pub analysis: AnalysisResult,
}

/// 検出記録（保存済み）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: i64,
    pub timestamp: NaiveDateTime,
    pub image_path: String,
    pub is_valid: bool,
    pub failed_keys: Vec<String>,
    pub should_notify: bool,
    pub analysis: AnalysisResult,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_str_coercion() {
        let mut analysis = AnalysisResult::new();
        analysis.insert("at_desk", true);
        analysis.insert("posture", "端正");
        analysis.insert("confidence", 0.95);
        analysis.insert("count", 3);
        analysis.insert("note", Value::Null);

        assert_eq!(analysis.value_str("at_desk").as_deref(), Some("true"));
        assert_eq!(analysis.value_str("posture").as_deref(), Some("端正"));
        assert_eq!(analysis.value_str("confidence").as_deref(), Some("0.95"));
        assert_eq!(analysis.value_str("count").as_deref(), Some("3"));
        assert_eq!(analysis.value_str("note").as_deref(), Some("null"));
        assert_eq!(analysis.value_str("missing"), None);
    }

    #[test]
    fn test_analysis_preserves_key_order() {
        let analysis: AnalysisResult =
            serde_json::from_value(json!({"z": 1, "a": 2, "m": 3})).unwrap();
        let keys: Vec<&String> = analysis.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_rule_accepts_regexp_alias() {
        let rule: Rule = serde_json::from_value(json!({"key": "at_desk", "regexp": "^true$"})).unwrap();
        assert_eq!(rule, Rule::new("at_desk", "^true$"));

        let serialized = serde_json::to_value(&rule).unwrap();
        assert_eq!(serialized, json!({"key": "at_desk", "pattern": "^true$"}));
    }

    #[test]
    fn test_notify_level_serde() {
        assert_eq!(serde_json::to_value(NotifyLevel::Danger).unwrap(), json!("danger"));
        assert_eq!(NotifyLevel::Warning.to_string(), "warning");
    }
}
