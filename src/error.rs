use thiserror::Error;

#[derive(Error, Debug)]
pub enum StudyBuddyError {
    #[error("設定エラー: {0}")]
    Config(String),

    #[error("APIキーが設定されていません。環境変数 KIMI_API_KEY を設定してください")]
    MissingApiKey,

    #[error("撮影エラー: {0}")]
    Capture(String),

    #[error("AI解析エラー: {0}")]
    Analysis(String),

    #[error("APIレスポンスのパースに失敗: {0}")]
    ApiParse(String),

    #[error("通知送信エラー: {0}")]
    NotifyDelivery(String),

    #[error(transparent)]
    Common(#[from] study_buddy_common::Error),

    #[error("監視はすでに実行中です")]
    AlreadyRunning,

    #[error("監視は実行されていません")]
    NotRunning,

    #[error("処理が中断されました")]
    Cancelled,

    #[error("データベースエラー: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("JSON解析エラー: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IOエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("見つかりません: {0}")]
    NotFound(String),

    #[error("アクセスが拒否されました: {0}")]
    Forbidden(String),
}

impl StudyBuddyError {
    /// 設定の検証エラー（Web では 400 として返す）
    pub fn is_config_error(&self) -> bool {
        matches!(self, StudyBuddyError::Config(_) | StudyBuddyError::Common(_))
    }
}

impl From<reqwest::Error> for StudyBuddyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StudyBuddyError::Analysis(format!("タイムアウト: {}", e))
        } else {
            StudyBuddyError::Analysis(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, StudyBuddyError>;
