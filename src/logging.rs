//! ログ初期化
//!
//! stderr に人間向け、`<home>/logs/study-buddy.log` に JSON Lines を出力する。
//! フィルタは `RUST_LOG` 優先、なければ info（`--verbose` で debug）。

use crate::error::{Result, StudyBuddyError};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const LOG_FILE_NAME: &str = "study-buddy.log";

pub fn log_file_path(logs_dir: &Path) -> PathBuf {
    logs_dir.join(LOG_FILE_NAME)
}

fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "debug,hyper=info,reqwest=info"
    } else {
        "info"
    }
}

/// グローバルsubscriberを登録（プロセスで1回）
pub fn init(logs_dir: &Path, verbose: bool) -> Result<()> {
    std::fs::create_dir_all(logs_dir)?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path(logs_dir))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(
            fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(true)
                .flatten_event(true),
        )
        .try_init()
        .map_err(|e| StudyBuddyError::Config(format!("ログ初期化に失敗: {}", e)))?;

    tracing::debug!(path = %log_file_path(logs_dir).display(), "logging initialized");
    Ok(())
}
