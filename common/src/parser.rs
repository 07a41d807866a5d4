//! APIレスポンスパーサー
//!
//! Vision API の応答テキストからJSONオブジェクトを抽出し、
//! AnalysisResult に変換する

use crate::error::{Error, Result};
use crate::types::AnalysisResult;
use serde_json::Value;

/// APIレスポンスからJSON部分を抽出
///
/// 抽出優先順位:
/// 1. ```json ... ``` ブロック
/// 2. 最初の `{` から最後の `}` まで
/// 3. エラー
///
/// # Examples
/// ```
/// use study_buddy_common::extract_json;
///
/// let response = "結果: {\"at_desk\": true} 以上";
/// let json = extract_json(response).unwrap();
/// assert_eq!(json, "{\"at_desk\": true}");
/// ```
pub fn extract_json(response: &str) -> Result<&str> {
    // ```json ... ``` ブロックを探す
    if let Some(start_marker) = response.find("```json") {
        let start = start_marker + 7; // "```json" の長さ
        if let Some(end_offset) = response[start..].find("```") {
            let end = start + end_offset;
            return Ok(response[start..end].trim());
        }
    }

    // 生の {...} を探す
    if let Some(start) = response.find('{') {
        if let Some(end) = response.rfind('}') {
            if end >= start {
                return Ok(&response[start..=end]);
            }
        }
    }

    Err(Error::Parse("JSONが見つかりません".into()))
}

/// Vision API の応答をパース
///
/// JSONオブジェクトでなければエラー。
pub fn parse_analysis_response(response: &str) -> Result<AnalysisResult> {
    let json_str = extract_json(response)?;
    let value: Value = serde_json::from_str(json_str.trim())
        .map_err(|e| Error::Parse(format!("解析結果 JSONパースエラー: {}", e)))?;

    match value {
        Value::Object(map) => Ok(AnalysisResult::from_map(map)),
        other => Err(Error::Parse(format!(
            "解析結果がJSONオブジェクトではありません: {}",
            truncate(&other.to_string(), 100)
        ))),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
