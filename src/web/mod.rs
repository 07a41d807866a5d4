//! Web API（HTTP + JSON）
//!
//! 設定の読み書き、監視の開始・停止、記録の参照、プレビュー配信のみ。
//! 監視サイクル自体には関与しない。

mod dto;
mod error;
mod handlers;
mod html;

pub use dto::ApiResponse;
pub use error::{status_for, ApiError};
pub use handlers::{resolve_capture_path, DEFAULT_RECENT_LIMIT, MJPEG_CONTENT_TYPE};

use std::sync::{Arc, RwLock};

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use tracing::info;

use crate::config::AppConfig;
use crate::messenger::SharedMessenger;
use crate::monitor::MonitorService;

#[derive(Clone)]
pub struct WebState {
    pub monitor: MonitorService,
    pub messenger: Arc<SharedMessenger>,
    app_config: Arc<RwLock<AppConfig>>,
    /// 受信者保存（読み込み → 更新 → 書き込み → 差し替え）の直列化
    recipients_lock: Arc<tokio::sync::Mutex<()>>,
}

impl WebState {
    pub fn new(monitor: MonitorService, messenger: Arc<SharedMessenger>, app_config: AppConfig) -> Self {
        Self {
            monitor,
            messenger,
            app_config: Arc::new(RwLock::new(app_config)),
            recipients_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn app_config(&self) -> AppConfig {
        match self.app_config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace_app_config(&self, config: AppConfig) {
        let mut guard = match self.app_config.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = config;
    }
}

pub fn app_router(state: WebState) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/api/status", get(handlers::status))
        .route("/api/config", get(handlers::get_config).post(handlers::update_config))
        .route("/api/monitor/start", post(handlers::start_monitor))
        .route("/api/monitor/stop", post(handlers::stop_monitor))
        .route("/api/messenger/test", post(handlers::test_recipient))
        .route("/api/messenger/save_recipients", post(handlers::save_recipients))
        .route("/api/records/today", get(handlers::today_records))
        .route("/api/records/recent", get(handlers::recent_records))
        .route("/image", get(handlers::image))
        .route("/api/preview/status", get(handlers::preview_status))
        .route("/video_feed", get(handlers::video_feed))
        .with_state(state)
}

/// Ctrl-C まで待ち受け、終了時に監視とスケジューラを止める
pub async fn serve(state: WebState, host: &str, port: u16) -> anyhow::Result<()> {
    let bind_addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("{bind_addr} で待ち受けできません"))?;
    let local = listener.local_addr()?;
    println!("✔ Web ダッシュボード: http://{}", local);
    info!(addr = %local, "Webサーバー起動");

    let monitor = state.monitor.clone();
    axum::serve(listener, app_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("Webサーバーが異常終了しました")?;

    info!("Webサーバー停止");
    monitor.shutdown().await;
    Ok(())
}
