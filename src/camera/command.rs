//! 外部コマンド（ffmpeg）による1フレーム取得

use super::FrameGrabber;
use crate::config::CameraSettings;
use crate::error::{Result, StudyBuddyError};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

#[cfg(target_os = "linux")]
const INPUT_FORMAT: &str = "v4l2";
#[cfg(target_os = "linux")]
const DEFAULT_DEVICE: &str = "/dev/video0";

#[cfg(target_os = "macos")]
const INPUT_FORMAT: &str = "avfoundation";
#[cfg(target_os = "macos")]
const DEFAULT_DEVICE: &str = "0";

#[cfg(windows)]
const INPUT_FORMAT: &str = "dshow";
#[cfg(windows)]
const DEFAULT_DEVICE: &str = "video=Integrated Camera";

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
const INPUT_FORMAT: &str = "v4l2";
#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
const DEFAULT_DEVICE: &str = "/dev/video0";

/// ffmpeg を起動して MJPEG 1フレームを stdout から受け取る
///
/// 子プロセスは future の破棄時に kill される（停止時にデバイスを離す）。
#[derive(Debug, Clone)]
pub struct CommandGrabber {
    program: String,
    device: String,
}

impl CommandGrabber {
    pub fn new(program: impl Into<String>, device: Option<String>) -> Self {
        Self {
            program: program.into(),
            device: device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
        }
    }

    pub fn from_settings(settings: &CameraSettings) -> Self {
        Self::new(settings.program.clone(), settings.device.clone())
    }

    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-f", INPUT_FORMAT]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if INPUT_FORMAT == "avfoundation" {
            args.extend(["-framerate".to_string(), "30".to_string()]);
        }
        args.extend(
            [
                "-i",
                self.device.as_str(),
                "-frames:v",
                "1",
                "-f",
                "image2pipe",
                "-vcodec",
                "mjpeg",
                "-",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args
    }
}

#[async_trait]
impl FrameGrabber for CommandGrabber {
    async fn grab(&self) -> Result<Vec<u8>> {
        let args = self.args();
        debug!(program = %self.program, device = %self.device, "フレーム取得");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StudyBuddyError::Capture(format!("{} の起動に失敗: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StudyBuddyError::Capture(format!(
                "撮影コマンドが失敗 (code {:?}): {}",
                output.status.code(),
                stderr.trim()
            )));
        }

        let frame = output.stdout;
        if !is_jpeg(&frame) {
            return Err(StudyBuddyError::Capture(format!(
                "JPEGフレームを取得できません（{} bytes）",
                frame.len()
            )));
        }
        Ok(frame)
    }
}

/// SOI マーカーで判定
pub fn is_jpeg(bytes: &[u8]) -> bool {
    bytes.len() > 2 && bytes[0] == 0xFF && bytes[1] == 0xD8
}
