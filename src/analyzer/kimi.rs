//! Kimi (Moonshot) Vision API 連携
//!
//! OpenAI 互換の `/chat/completions` に画像を data URI で送る。

use super::SceneAnalyzer;
use crate::config::KimiSettings;
use crate::error::{Result, StudyBuddyError};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use study_buddy_common::prompts::CONNECTION_CHECK_PROMPT;
use study_buddy_common::{build_vision_prompt, parse_analysis_response, AnalysisResult};
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct KimiVisionAnalyzer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    prompt: String,
}

impl KimiVisionAnalyzer {
    pub fn new(settings: &KimiSettings) -> Result<Self> {
        let api_key = settings.api_key.clone().ok_or(StudyBuddyError::MissingApiKey)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| StudyBuddyError::Config(format!("HTTPクライアント初期化に失敗: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            prompt: build_vision_prompt(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// 画像付きリクエストボディ
    pub fn build_request(&self, image_base64: &str) -> Value {
        json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": self.prompt},
                    {
                        "type": "image_url",
                        "image_url": {"url": format!("data:image/jpeg;base64,{}", image_base64)}
                    }
                ]
            }],
            "temperature": 0.3,
            "response_format": {"type": "json_object"}
        })
    }

    async fn complete(&self, body: &Value) -> Result<String> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let preview: String = text.chars().take(300).collect();
            return Err(StudyBuddyError::Analysis(format!(
                "Vision API が {} を返しました: {}",
                status, preview
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| StudyBuddyError::ApiParse(format!("レスポンス形式が不正: {}", e)))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| StudyBuddyError::ApiParse("choices[0].message.content がありません".into()))
    }

    /// 認証情報の確認（テキストのみの最小リクエスト）
    pub async fn check_connection(&self) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": CONNECTION_CHECK_PROMPT}],
            "max_tokens": 10
        });
        let reply = self.complete(&body).await?;
        info!(model = %self.model, "Vision API 接続確認OK");
        Ok(reply)
    }
}

#[async_trait]
impl SceneAnalyzer for KimiVisionAnalyzer {
    async fn analyze(&self, image_path: &Path) -> Result<AnalysisResult> {
        let bytes = tokio::fs::read(image_path).await.map_err(|e| {
            StudyBuddyError::Analysis(format!("画像を読めません {}: {}", image_path.display(), e))
        })?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        debug!(path = %image_path.display(), base64_len = encoded.len(), "画像エンコード完了");

        let content = self.complete(&self.build_request(&encoded)).await?;
        let analysis = parse_analysis_response(&content)
            .map_err(|e| StudyBuddyError::ApiParse(e.to_string()))?;

        info!(path = %image_path.display(), fields = analysis.len(), "解析完了");
        Ok(analysis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Clone, Default)]
    struct Captured {
        body: Arc<Mutex<Option<Value>>>,
        auth: Arc<Mutex<Option<String>>>,
    }

    async fn spawn_fake_api(status: StatusCode, reply: Value) -> (String, Captured) {
        let captured = Captured::default();
        let app = Router::new()
            .route(
                "/v1/chat/completions",
                post(
                    move |State(c): State<Captured>, headers: HeaderMap, Json(body): Json<Value>| {
                        let reply = reply.clone();
                        async move {
                            *c.body.lock().unwrap() = Some(body);
                            *c.auth.lock().unwrap() = headers
                                .get("authorization")
                                .and_then(|v| v.to_str().ok())
                                .map(String::from);
                            (status, Json(reply))
                        }
                    },
                ),
            )
            .with_state(captured.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/v1", addr), captured)
    }

    fn settings(base_url: &str) -> KimiSettings {
        KimiSettings {
            api_key: Some("sk-test".into()),
            base_url: base_url.into(),
            model: "moonshot-v1-8k-vision-preview".into(),
            timeout_secs: 5,
            max_retries: 1,
        }
    }

    fn completion(content: &str) -> Value {
        json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
    }

    #[test]
    fn test_new_requires_api_key() {
        let mut s = settings("http://localhost");
        s.api_key = None;
        assert!(matches!(KimiVisionAnalyzer::new(&s), Err(StudyBuddyError::MissingApiKey)));
    }

    #[test]
    fn test_build_request_shape() {
        let analyzer = KimiVisionAnalyzer::new(&settings("http://localhost/v1/")).unwrap();
        assert_eq!(analyzer.endpoint(), "http://localhost/v1/chat/completions");
        let body = analyzer.build_request("QUJD");
        assert_eq!(body["temperature"], json!(0.3));
        assert_eq!(body["response_format"]["type"], "json_object");
        let url = body["messages"][0]["content"][1]["image_url"]["url"].as_str().unwrap();
        assert_eq!(url, "data:image/jpeg;base64,QUJD");
    }

    #[tokio::test]
    async fn test_analyze_parses_reply() {
        let (base, captured) = spawn_fake_api(
            StatusCode::OK,
            completion(r#"{"at_desk": true, "posture": "端正", "lighting": "充足"}"#),
        )
        .await;
        let dir = tempdir().unwrap();
        let image = dir.path().join("a.jpg");
        std::fs::write(&image, [0xFF, 0xD8, 0xFF, 0xD9]).unwrap();

        let analyzer = KimiVisionAnalyzer::new(&settings(&base)).unwrap();
        let result = analyzer.analyze(&image).await.unwrap();
        assert_eq!(result.value_str("at_desk").as_deref(), Some("true"));
        assert_eq!(result.value_str("posture").as_deref(), Some("端正"));

        assert_eq!(captured.auth.lock().unwrap().as_deref(), Some("Bearer sk-test"));
        let body = captured.body.lock().unwrap().clone().unwrap();
        assert_eq!(body["model"], "moonshot-v1-8k-vision-preview");
    }

    #[tokio::test]
    async fn test_analyze_non_2xx_is_analysis_error() {
        let (base, _) = spawn_fake_api(StatusCode::UNAUTHORIZED, json!({"error": "bad key"})).await;
        let dir = tempdir().unwrap();
        let image = dir.path().join("a.jpg");
        std::fs::write(&image, [0xFF, 0xD8]).unwrap();

        let analyzer = KimiVisionAnalyzer::new(&settings(&base)).unwrap();
        let err = analyzer.analyze(&image).await.unwrap_err();
        assert!(matches!(err, StudyBuddyError::Analysis(ref m) if m.contains("401")));
    }

    #[tokio::test]
    async fn test_analyze_unparsable_reply() {
        let (base, _) = spawn_fake_api(StatusCode::OK, completion("I cannot see the image.")).await;
        let dir = tempdir().unwrap();
        let image = dir.path().join("a.jpg");
        std::fs::write(&image, [0xFF, 0xD8]).unwrap();

        let analyzer = KimiVisionAnalyzer::new(&settings(&base)).unwrap();
        assert!(matches!(analyzer.analyze(&image).await, Err(StudyBuddyError::ApiParse(_))));
    }

    #[tokio::test]
    async fn test_analyze_missing_image() {
        let analyzer = KimiVisionAnalyzer::new(&settings("http://127.0.0.1:9")).unwrap();
        let result = analyzer.analyze(Path::new("/nonexistent/a.jpg")).await;
        assert!(matches!(result, Err(StudyBuddyError::Analysis(_))));
    }

    #[tokio::test]
    async fn test_check_connection() {
        let (base, captured) = spawn_fake_api(StatusCode::OK, completion("Hi")).await;
        let analyzer = KimiVisionAnalyzer::new(&settings(&base)).unwrap();
        assert_eq!(analyzer.check_connection().await.unwrap(), "Hi");
        let body = captured.body.lock().unwrap().clone().unwrap();
        assert_eq!(body["messages"][0]["content"], "Hello");
    }
}
