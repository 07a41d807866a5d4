//! エラー型定義

use thiserror::Error;

/// 共通エラー型
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid rule [{key}]: {message}")]
    InvalidRule { key: String, message: String },

    #[error("Invalid time (expected HH:MM): {0}")]
    InvalidTime(String),
}

/// Result型エイリアス
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error = Error::Io(io_error);
        let display = format!("{}", error);
        assert!(display.contains("IO error"));
        assert!(display.contains("file not found"));
    }

    #[test]
    fn test_error_display_config() {
        let error = Error::Config("設定ファイルが見つかりません".to_string());
        let display = format!("{}", error);
        assert_eq!(display, "Config error: 設定ファイルが見つかりません");
    }

    #[test]
    fn test_error_display_invalid_rule() {
        let error = Error::InvalidRule {
            key: "posture".to_string(),
            message: "unclosed group".to_string(),
        };
        let display = format!("{}", error);
        assert!(display.contains("posture"));
        assert!(display.contains("unclosed group"));
    }

    #[test]
    fn test_error_from_json() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error: Error = json_error.into();
        assert!(matches!(error, Error::Json(_)));
    }

    #[test]
    fn test_error_debug() {
        let error = Error::InvalidTime("25:99".to_string());
        let debug = format!("{:?}", error);
        assert!(debug.contains("InvalidTime"));
        assert!(debug.contains("25:99"));
    }
}
