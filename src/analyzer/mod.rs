//! AI画像解析
//!
//! 解析器は1回の呼び出しのみ行う。リトライは監視サービス側の責務。

mod kimi;

pub use kimi::KimiVisionAnalyzer;

use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;
use study_buddy_common::AnalysisResult;

#[async_trait]
pub trait SceneAnalyzer: Send + Sync {
    async fn analyze(&self, image_path: &Path) -> Result<AnalysisResult>;
}
