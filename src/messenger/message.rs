//! 通知文面

use chrono::NaiveDateTime;
use study_buddy_common::{AnalysisResult, NotifyLevel};

pub const NOTIFICATION_TITLE: &str = "Study Buddy 学习提醒";

/// `[INFO]` / `[WARNING]` / `[DANGER]`
pub fn level_marker(level: NotifyLevel) -> &'static str {
    match level {
        NotifyLevel::Info => "[INFO]",
        NotifyLevel::Warning => "[WARNING]",
        NotifyLevel::Danger => "[DANGER]",
    }
}

pub fn with_level(level: NotifyLevel, text: &str) -> String {
    format!("{} {}", level_marker(level), text)
}

/// 監視サイクルの通知本文（レベル表示は送信時に付与）
#[derive(Debug, Clone)]
pub struct AlertMessage<'a> {
    pub consecutive_failures: u32,
    pub reason: &'a str,
    pub issues: &'a [String],
    pub analysis: Option<&'a AnalysisResult>,
    pub time: NaiveDateTime,
}

impl AlertMessage<'_> {
    pub fn render(&self) -> String {
        let mut text = format!("{}\n\n", NOTIFICATION_TITLE);
        text.push_str(&format!("连续失败: {}\n", self.consecutive_failures));
        text.push_str(&format!("原因: {}\n", self.reason));

        if !self.issues.is_empty() {
            text.push_str("问题:\n");
            for issue in self.issues {
                text.push_str(&format!("  {}\n", issue));
            }
        }

        if let Some(analysis) = self.analysis {
            text.push_str("\n分析结果:\n");
            for (key, value) in analysis.iter() {
                let shown = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                text.push_str(&format!("  {}: {}\n", key, shown));
            }
        }

        text.push_str(&format!("\n时间: {}", self.time.format("%Y-%m-%d %H:%M:%S")));
        text
    }
}
