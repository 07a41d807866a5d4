//! カメラ
//!
//! 撮影とプレビューは1つのリース（非同期Mutex）を取り合う。
//! リースはフレーム取得の間だけ保持し、エンコードや保存中は解放している。

mod command;

pub use command::{is_jpeg, CommandGrabber};

use crate::error::{Result, StudyBuddyError};
use async_trait::async_trait;
use chrono::Local;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const JPEG_QUALITY: u8 = 95;

lazy_static! {
    static ref CAPTURE_FILE_RE: Regex = Regex::new(r"^\d{8}_\d{6}(_\d+)?\.jpg$").unwrap();
}

/// フレーム取得元
#[async_trait]
pub trait FrameGrabber: Send + Sync {
    /// JPEG 1フレーム
    async fn grab(&self) -> Result<Vec<u8>>;

    /// デバイス解放（常駐しない実装では何もしない）
    async fn release(&self) {}
}

#[derive(Debug, Clone, Copy)]
pub struct CameraOptions {
    pub max_width: u32,
    pub capture_timeout: Duration,
}

impl Default for CameraOptions {
    fn default() -> Self {
        Self {
            max_width: 1920,
            capture_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
struct PreviewSession {
    client_id: String,
    started: Instant,
    duration: Duration,
}

impl PreviewSession {
    fn remaining(&self) -> Option<Duration> {
        self.duration.checked_sub(self.started.elapsed()).filter(|d| !d.is_zero())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub busy: bool,
    pub previewing: bool,
    pub preview_client: Option<String>,
    pub preview_remaining_secs: u64,
}

/// カメラ占有リース（drop で解放）
pub struct CameraLease {
    _guard: OwnedMutexGuard<()>,
    busy: Arc<AtomicBool>,
}

impl Drop for CameraLease {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

pub struct CameraService {
    grabber: Arc<dyn FrameGrabber>,
    lease: Arc<AsyncMutex<()>>,
    busy: Arc<AtomicBool>,
    preview: Mutex<Option<PreviewSession>>,
    captures_dir: PathBuf,
    options: CameraOptions,
}

impl CameraService {
    pub fn new(grabber: Arc<dyn FrameGrabber>, captures_dir: impl Into<PathBuf>, options: CameraOptions) -> Self {
        Self {
            grabber,
            lease: Arc::new(AsyncMutex::new(())),
            busy: Arc::new(AtomicBool::new(false)),
            preview: Mutex::new(None),
            captures_dir: captures_dir.into(),
            options,
        }
    }

    pub fn captures_dir(&self) -> &Path {
        &self.captures_dir
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// 占有を待って取得
    pub async fn acquire(&self) -> CameraLease {
        let guard = self.lease.clone().lock_owned().await;
        self.busy.store(true, Ordering::SeqCst);
        CameraLease {
            _guard: guard,
            busy: self.busy.clone(),
        }
    }

    /// 1枚撮影して保存し、パスを返す
    pub async fn capture(&self) -> Result<PathBuf> {
        let frame = {
            let _lease = self.acquire().await;
            tokio::time::timeout(self.options.capture_timeout, self.grabber.grab())
                .await
                .map_err(|_| {
                    StudyBuddyError::Capture(format!(
                        "撮影がタイムアウトしました（{}秒）",
                        self.options.capture_timeout.as_secs()
                    ))
                })??
        };

        std::fs::create_dir_all(&self.captures_dir)?;
        let path = next_capture_path(&self.captures_dir);
        let max_width = self.options.max_width;
        let target = path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let jpeg = process_frame(&frame, max_width)?;
            std::fs::write(&target, jpeg)?;
            Ok(())
        })
        .await
        .map_err(|e| StudyBuddyError::Capture(format!("画像保存タスクが失敗: {}", e)))??;

        info!(path = %path.display(), "撮影完了");
        Ok(path)
    }

    /// デバイスを解放（監視停止時）
    pub async fn release(&self) {
        let _lease = self.acquire().await;
        self.grabber.release().await;
        debug!("カメラを解放");
    }

    // =============================================
    // プレビュー
    // =============================================

    pub fn begin_preview(&self, client_id: impl Into<String>, duration: Duration) {
        let session = PreviewSession {
            client_id: client_id.into(),
            started: Instant::now(),
            duration,
        };
        info!(client = %session.client_id, secs = duration.as_secs(), "プレビュー開始");
        *self.preview_slot() = Some(session);
    }

    pub fn end_preview(&self) {
        if self.preview_slot().take().is_some() {
            info!("プレビュー終了");
        }
    }

    /// 残り時間。期限切れならセッションを片付けて None
    pub fn preview_remaining(&self) -> Option<Duration> {
        let mut slot = self.preview_slot();
        let remaining = slot.as_ref().and_then(PreviewSession::remaining);
        if remaining.is_none() {
            *slot = None;
        }
        remaining
    }

    pub fn is_previewing(&self) -> bool {
        self.preview_remaining().is_some()
    }

    /// プレビュー中なら次のフレーム（フレームごとにリースを取る）
    pub async fn next_preview_frame(&self) -> Result<Option<Vec<u8>>> {
        if !self.is_previewing() {
            return Ok(None);
        }
        let _lease = self.acquire().await;
        let frame = tokio::time::timeout(self.options.capture_timeout, self.grabber.grab())
            .await
            .map_err(|_| StudyBuddyError::Capture("プレビューフレーム取得がタイムアウト".into()))??;
        Ok(Some(frame))
    }

    pub fn status(&self) -> CameraStatus {
        let remaining = self.preview_remaining();
        let client = self.preview_slot().as_ref().map(|s| s.client_id.clone());
        CameraStatus {
            busy: self.is_busy(),
            previewing: remaining.is_some(),
            preview_client: client,
            preview_remaining_secs: remaining.map(|d| d.as_secs()).unwrap_or(0),
        }
    }

    /// 最新の撮影画像
    pub fn latest_capture(&self) -> Option<PathBuf> {
        latest_capture_in(&self.captures_dir)
    }

    fn preview_slot(&self) -> std::sync::MutexGuard<'_, Option<PreviewSession>> {
        match self.preview.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("preview lock poisoned");
                poisoned.into_inner()
            }
        }
    }
}

/// `YYYYmmdd_HHMMSS.jpg`（同一秒なら `_1`, `_2` ...）
pub fn next_capture_path(dir: &Path) -> PathBuf {
    let stem = Local::now().format("%Y%m%d_%H%M%S").to_string();
    let mut path = dir.join(format!("{}.jpg", stem));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{}_{}.jpg", stem, n));
        n += 1;
    }
    path
}

pub fn latest_capture_in(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| CAPTURE_FILE_RE.is_match(&e.file_name().to_string_lossy()))
        .max_by(|a, b| a.file_name().cmp(b.file_name()))
        .map(|e| e.into_path())
}

/// デコード → 幅を max_width 以下に縮小 → JPEG(95) 再エンコード
pub fn process_frame(frame: &[u8], max_width: u32) -> Result<Vec<u8>> {
    let image = image::load_from_memory(frame)
        .map_err(|e| StudyBuddyError::Capture(format!("フレームのデコードに失敗: {}", e)))?;

    let image = if max_width > 0 && image.width() > max_width {
        let height = ((image.height() as u64 * max_width as u64) / image.width() as u64).max(1) as u32;
        image.resize_exact(max_width, height, FilterType::Triangle)
    } else {
        image
    };

    let rgb = image.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| StudyBuddyError::Capture(format!("JPEGエンコードに失敗: {}", e)))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use tempfile::tempdir;

    fn sample_jpeg(width: u32, height: u32) -> Vec<u8> {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, 80).encode_image(&img).unwrap();
        buf
    }

    struct StaticGrabber {
        frame: Vec<u8>,
        delay: Duration,
    }

    #[async_trait]
    impl FrameGrabber for StaticGrabber {
        async fn grab(&self) -> Result<Vec<u8>> {
            tokio::time::sleep(self.delay).await;
            Ok(self.frame.clone())
        }
    }

    fn service(dir: &Path, delay: Duration, timeout: Duration) -> CameraService {
        let grabber = Arc::new(StaticGrabber {
            frame: sample_jpeg(64, 48),
            delay,
        });
        CameraService::new(
            grabber,
            dir,
            CameraOptions {
                max_width: 32,
                capture_timeout: timeout,
            },
        )
    }

    #[test]
    fn test_process_frame_downscales() {
        let out = process_frame(&sample_jpeg(64, 48), 32).unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.width(), 32);
        assert_eq!(decoded.height(), 24);
    }

    #[test]
    fn test_process_frame_keeps_small_images() {
        let out = process_frame(&sample_jpeg(20, 10), 1920).unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (20, 10));
    }

    #[test]
    fn test_process_frame_rejects_garbage() {
        assert!(matches!(process_frame(b"not an image", 100), Err(StudyBuddyError::Capture(_))));
    }

    #[test]
    fn test_latest_capture_picks_newest_name() {
        let dir = tempdir().unwrap();
        for name in ["20260301_080000.jpg", "20260302_090000.jpg", "20260302_090000_1.jpg", "other.jpg"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let latest = latest_capture_in(dir.path()).unwrap();
        assert_eq!(latest.file_name().unwrap(), "20260302_090000_1.jpg");
    }

    #[test]
    fn test_latest_capture_empty_dir() {
        let dir = tempdir().unwrap();
        assert!(latest_capture_in(dir.path()).is_none());
    }

    #[test]
    fn test_next_capture_path_avoids_collision() {
        let dir = tempdir().unwrap();
        let first = next_capture_path(dir.path());
        std::fs::write(&first, b"x").unwrap();
        let second = next_capture_path(dir.path());
        assert_ne!(first, second);
        assert!(CAPTURE_FILE_RE.is_match(&second.file_name().unwrap().to_string_lossy()));
    }

    #[tokio::test]
    async fn test_capture_writes_resized_jpeg() {
        let dir = tempdir().unwrap();
        let camera = service(dir.path(), Duration::ZERO, Duration::from_secs(5));
        let path = camera.capture().await.unwrap();
        assert!(path.starts_with(dir.path()));
        let decoded = image::open(&path).unwrap();
        assert_eq!(decoded.width(), 32);
        assert!(!camera.is_busy());
        assert_eq!(camera.latest_capture(), Some(path));
    }

    #[tokio::test]
    async fn test_capture_timeout_releases_lease() {
        let dir = tempdir().unwrap();
        let camera = service(dir.path(), Duration::from_secs(10), Duration::from_millis(50));
        let result = camera.capture().await;
        assert!(matches!(result, Err(StudyBuddyError::Capture(_))));
        assert!(!camera.is_busy());
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let dir = tempdir().unwrap();
        let camera = Arc::new(service(dir.path(), Duration::ZERO, Duration::from_secs(5)));

        let lease = camera.acquire().await;
        assert!(camera.is_busy());

        let waiter = {
            let camera = camera.clone();
            tokio::spawn(async move { camera.capture().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(lease);
        let path = waiter.await.unwrap().unwrap();
        assert!(path.exists());
        assert!(!camera.is_busy());
    }

    #[tokio::test]
    async fn test_preview_session_lifecycle() {
        let dir = tempdir().unwrap();
        let camera = service(dir.path(), Duration::ZERO, Duration::from_secs(5));

        assert!(camera.next_preview_frame().await.unwrap().is_none());

        camera.begin_preview("web", Duration::from_secs(10));
        assert!(camera.is_previewing());
        assert!(camera.preview_remaining().unwrap() <= Duration::from_secs(10));
        let frame = camera.next_preview_frame().await.unwrap().unwrap();
        assert!(is_jpeg(&frame));
        assert_eq!(camera.status().preview_client.as_deref(), Some("web"));

        camera.end_preview();
        assert!(!camera.is_previewing());
    }

    #[tokio::test]
    async fn test_preview_expires() {
        let dir = tempdir().unwrap();
        let camera = service(dir.path(), Duration::ZERO, Duration::from_secs(5));
        camera.begin_preview("web", Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(camera.preview_remaining().is_none());
        assert!(!camera.status().previewing);
    }
}
