//! 監視サービス
//!
//! 1サイクル: 撮影 → AI解析（リトライ付き） → ルール判定 → 通知判定 → 記録保存 → 通知送信。
//! 各段階は停止要求と競合させ、停止時はカメラを必ず解放する。
//! 時刻スケジューラは別タスクで動き、`start()` / `stop()` を呼ぶだけ。

mod cancel;
pub mod scheduler;

pub use cancel::CancelToken;
pub use scheduler::{ScheduleAction, ScheduleInput, ScheduleMemory, SCHEDULER_TICK};

use crate::analyzer::SceneAnalyzer;
use crate::camera::{CameraService, CameraStatus};
use crate::config::ConfigStore;
use crate::error::{Result, StudyBuddyError};
use crate::messenger::{AlertMessage, DeliveryReport, Notifier};
use crate::storage::{DetectionStore, StorageStats};
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use study_buddy_common::{
    AnalysisResult, CheckOutcome, MonitorConfig, NewDetectionRecord, NotifyDecision, NotifyManager, NotifyStatus,
    RuleChecker,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const PREVIEW_CLIENT: &str = "monitor";

#[derive(Debug, Clone, Copy)]
pub struct MonitorOptions {
    /// 解析の試行回数
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// 停止時にループの終了を待つ時間
    pub stop_grace: Duration,
    pub scheduler_tick: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            stop_grace: Duration::from_secs(3),
            scheduler_tick: SCHEDULER_TICK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Stopped,
    Previewing,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Manual,
    Scheduler,
    FailureLimit,
}

/// 監視サービスの依存先
pub struct MonitorDeps {
    pub camera: Arc<CameraService>,
    pub analyzer: Arc<dyn SceneAnalyzer>,
    pub notifier: Arc<dyn Notifier>,
    pub store: DetectionStore,
    pub config: ConfigStore,
}

/// 1サイクルの結果
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub image_path: Option<PathBuf>,
    pub record_id: Option<i64>,
    pub outcome: CheckOutcome,
    pub decision: NotifyDecision,
    pub delivery: Option<DeliveryReport>,
}

#[derive(Debug, Clone)]
struct RunStatus {
    state: MonitorState,
    started_at: Option<NaiveDateTime>,
    stopped_at: Option<NaiveDateTime>,
    stop_reason: Option<StopReason>,
    snapshots_processed: u64,
    notifications_sent: u64,
    last_decision: Option<NotifyDecision>,
    last_error: Option<String>,
    last_image: Option<String>,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self {
            state: MonitorState::Stopped,
            started_at: None,
            stopped_at: None,
            stop_reason: None,
            snapshots_processed: 0,
            notifications_sent: 0,
            last_decision: None,
            last_error: None,
            last_image: None,
        }
    }
}

/// ステータスAPI用スナップショット
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub state: MonitorState,
    pub monitoring: bool,
    pub scheduler_enabled: bool,
    pub scheduler_running: bool,
    pub auto_start_time: String,
    pub auto_stop_time: String,
    pub started_at: Option<NaiveDateTime>,
    pub stopped_at: Option<NaiveDateTime>,
    pub stop_reason: Option<StopReason>,
    pub snapshots_processed: u64,
    pub notifications_sent: u64,
    pub consecutive_failures: u32,
    pub last_decision: Option<NotifyDecision>,
    pub last_error: Option<String>,
    pub last_image: Option<String>,
    pub notify: NotifyStatus,
    pub camera: CameraStatus,
    pub storage: Option<StorageStats>,
    pub config: MonitorConfig,
}

struct TaskHandle {
    cancel: CancelToken,
    task: JoinHandle<()>,
}

struct Inner {
    camera: Arc<CameraService>,
    analyzer: Arc<dyn SceneAnalyzer>,
    notifier: Arc<dyn Notifier>,
    store: DetectionStore,
    config: ConfigStore,
    options: MonitorOptions,
    notify: Mutex<NotifyManager>,
    status: Mutex<RunStatus>,
    run: tokio::sync::Mutex<Option<TaskHandle>>,
    scheduler: tokio::sync::Mutex<Option<TaskHandle>>,
    scheduler_running: AtomicBool,
}

#[derive(Clone)]
pub struct MonitorService {
    inner: Arc<Inner>,
}

impl MonitorService {
    pub fn new(deps: MonitorDeps, options: MonitorOptions) -> Self {
        let policy = deps.config.snapshot().notify_policy();
        let now = Local::now().naive_local();
        Self {
            inner: Arc::new(Inner {
                camera: deps.camera,
                analyzer: deps.analyzer,
                notifier: deps.notifier,
                store: deps.store,
                config: deps.config,
                options,
                notify: Mutex::new(NotifyManager::new(policy, now)),
                status: Mutex::new(RunStatus::default()),
                run: tokio::sync::Mutex::new(None),
                scheduler: tokio::sync::Mutex::new(None),
                scheduler_running: AtomicBool::new(false),
            }),
        }
    }

    pub fn camera(&self) -> &Arc<CameraService> {
        &self.inner.camera
    }

    pub fn store(&self) -> &DetectionStore {
        &self.inner.store
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.inner.config
    }

    pub fn config(&self) -> MonitorConfig {
        self.inner.config.snapshot()
    }

    pub fn state(&self) -> MonitorState {
        self.run_status().state
    }

    pub fn is_running(&self) -> bool {
        self.state() != MonitorState::Stopped
    }

    pub fn is_scheduler_running(&self) -> bool {
        self.inner.scheduler_running.load(Ordering::SeqCst)
    }

    fn notify(&self) -> MutexGuard<'_, NotifyManager> {
        match self.inner.notify.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn run_status(&self) -> MutexGuard<'_, RunStatus> {
        match self.inner.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn status(&self) -> MonitorStatus {
        let config = self.inner.config.snapshot();
        let notify = self.notify().status();
        let run = self.run_status().clone();
        let storage = match self.inner.store.stats(Local::now().date_naive()) {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "統計の取得に失敗");
                None
            }
        };

        MonitorStatus {
            state: run.state,
            monitoring: run.state != MonitorState::Stopped,
            scheduler_enabled: config.enable_time_scheduler,
            scheduler_running: self.is_scheduler_running(),
            auto_start_time: config.auto_start_time.clone(),
            auto_stop_time: config.auto_stop_time.clone(),
            started_at: run.started_at,
            stopped_at: run.stopped_at,
            stop_reason: run.stop_reason,
            snapshots_processed: run.snapshots_processed,
            notifications_sent: run.notifications_sent,
            consecutive_failures: notify.consecutive_failures,
            last_decision: run.last_decision,
            last_error: run.last_error,
            last_image: run.last_image,
            notify,
            camera: self.inner.camera.status(),
            storage,
            config,
        }
    }

    // =============================================
    // 開始・停止
    // =============================================

    /// 監視を開始し、プレビュー秒数（無効なら0）を返す
    pub async fn start(&self) -> Result<u64> {
        let mut run = self.inner.run.lock().await;
        if self.is_running() {
            return Err(StudyBuddyError::AlreadyRunning);
        }

        let config = self.inner.config.snapshot();
        config.validate()?;

        // 連続失敗で自ら終了したループの後片付け
        if let Some(old) = run.take() {
            old.task.abort();
        }

        let now = Local::now().naive_local();
        {
            let mut notify = self.notify();
            notify.update_limits(config.notify_policy());
            notify.reset(now);
        }

        let preview = (config.enable_preview && config.preview_duration > 0)
            .then(|| Duration::from_secs(config.preview_duration));
        {
            let mut status = self.run_status();
            *status = RunStatus {
                state: if preview.is_some() {
                    MonitorState::Previewing
                } else {
                    MonitorState::Running
                },
                started_at: Some(now),
                ..RunStatus::default()
            };
        }

        let cancel = CancelToken::new();
        let task = tokio::spawn(self.clone().run_loop(cancel.clone(), preview));
        *run = Some(TaskHandle { cancel, task });

        info!(
            capture_interval = config.capture_interval,
            preview_secs = preview.map(|d| d.as_secs()).unwrap_or(0),
            "監視を開始"
        );
        Ok(preview.map(|d| d.as_secs()).unwrap_or(0))
    }

    /// 監視を停止し、カメラを解放する
    pub async fn stop(&self, reason: StopReason) -> Result<()> {
        let mut run = self.inner.run.lock().await;
        if !self.is_running() {
            return Err(StudyBuddyError::NotRunning);
        }

        if let Some(mut handle) = run.take() {
            handle.cancel.cancel();
            if tokio::time::timeout(self.inner.options.stop_grace, &mut handle.task)
                .await
                .is_err()
            {
                warn!("監視ループが猶予時間内に終了しないため中断");
                handle.task.abort();
                let _ = handle.task.await;
            }
        }

        self.inner.camera.end_preview();
        if tokio::time::timeout(self.inner.options.stop_grace, self.inner.camera.release())
            .await
            .is_err()
        {
            warn!("カメラ解放がタイムアウト");
        }

        let mut status = self.run_status();
        status.state = MonitorState::Stopped;
        status.stop_reason = Some(reason);
        status.stopped_at = Some(Local::now().naive_local());
        info!(reason = ?reason, "監視を停止");
        Ok(())
    }

    /// サーバー終了時: スケジューラと監視を止める
    pub async fn shutdown(&self) {
        self.stop_scheduler().await;
        match self.stop(StopReason::Manual).await {
            Ok(()) | Err(StudyBuddyError::NotRunning) => {}
            Err(e) => warn!(error = %e, "終了時の停止に失敗"),
        }
    }

    /// 設定更新: 検証 → 保存 → 通知上限へ反映 → 必要ならスケジューラ再起動
    pub async fn update_config(&self, patch: &Value) -> Result<MonitorConfig> {
        let (previous, next) = self.inner.config.update(patch)?;
        self.notify().update_limits(next.notify_policy());
        if previous.scheduler_changed(&next) {
            info!(
                enabled = next.enable_time_scheduler,
                start = %next.auto_start_time,
                stop = %next.auto_stop_time,
                "スケジュール変更"
            );
            self.start_scheduler().await;
        }
        Ok(next)
    }

    // =============================================
    // 監視ループ
    // =============================================

    async fn run_loop(self, cancel: CancelToken, preview: Option<Duration>) {
        if let Some(duration) = preview {
            self.inner.camera.begin_preview(PREVIEW_CLIENT, duration);
            let finished = cancellable(&cancel, tokio::time::sleep(duration)).await;
            self.inner.camera.end_preview();
            if finished.is_err() {
                return;
            }
            self.run_status().state = MonitorState::Running;
            info!("プレビュー終了、監視サイクルへ移行");
        }

        loop {
            let config = self.inner.config.snapshot();
            let report = match self.run_cycle(&config, &cancel).await {
                Ok(report) => report,
                Err(_) => {
                    debug!("サイクル中に停止要求");
                    return;
                }
            };

            if report.decision.should_stop {
                self.finish_after_failure_limit().await;
                return;
            }

            let interval = Duration::from_secs(config.capture_interval.max(1));
            if cancellable(&cancel, tokio::time::sleep(interval)).await.is_err() {
                return;
            }
        }
    }

    async fn finish_after_failure_limit(&self) {
        self.inner.camera.end_preview();
        self.inner.camera.release().await;
        let mut status = self.run_status();
        status.state = MonitorState::Stopped;
        status.stop_reason = Some(StopReason::FailureLimit);
        status.stopped_at = Some(Local::now().naive_local());
        warn!("連続失敗の上限に達したため監視を停止（再開は手動）");
    }

    /// 1サイクル。失敗した段階は「不合格サイクル」として扱い、Err は停止要求のみ。
    async fn run_cycle(&self, config: &MonitorConfig, cancel: &CancelToken) -> Result<CycleReport> {
        let now = Local::now().naive_local();

        let image_path = match cancellable(cancel, self.inner.camera.capture()).await? {
            Ok(path) => Some(path),
            Err(e) => {
                error!(error = %e, "撮影に失敗");
                self.run_status().last_error = Some(e.to_string());
                None
            }
        };

        let (analysis, outcome) = match &image_path {
            Some(path) => {
                let analysis = match self.analyze_with_retry(path, cancel).await {
                    Ok(analysis) => analysis,
                    Err(StudyBuddyError::Cancelled) => return Err(StudyBuddyError::Cancelled),
                    Err(e) => {
                        error!(error = %e, "AI解析に失敗");
                        self.run_status().last_error = Some(e.to_string());
                        AnalysisResult::from_error(e.to_string())
                    }
                };
                let outcome = match RuleChecker::new(&config.rules) {
                    Ok(checker) => checker.check(&analysis),
                    Err(e) => {
                        error!(error = %e, "ルールのコンパイルに失敗");
                        failed_outcome(format!("规则错误: {}", e))
                    }
                };
                (Some(analysis), outcome)
            }
            None => (None, failed_outcome("拍照失败".to_string())),
        };

        let (decision, consecutive_failures) = {
            let mut notify = self.notify();
            let decision = notify.evaluate(outcome.is_valid, Local::now().naive_local());
            (decision, notify.consecutive_failures())
        };
        debug!(
            is_valid = outcome.is_valid,
            failed = ?outcome.failed_keys,
            notify = decision.should_notify,
            stop = decision.should_stop,
            "サイクル判定"
        );

        let record_id = match (&image_path, &analysis) {
            (Some(path), Some(analysis)) => {
                let record = NewDetectionRecord {
                    timestamp: now,
                    image_path: path.display().to_string(),
                    is_valid: outcome.is_valid,
                    failed_keys: outcome.failed_keys.clone(),
                    should_notify: decision.should_notify,
                    analysis: analysis.clone(),
                };
                match self.inner.store.save(&record) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        error!(error = %e, "検出記録の保存に失敗");
                        None
                    }
                }
            }
            _ => None,
        };

        let delivery = if decision.should_notify {
            let text = AlertMessage {
                consecutive_failures,
                reason: &decision.reason,
                issues: &outcome.issues,
                analysis: analysis.as_ref(),
                time: now,
            }
            .render();
            let mut report = cancellable(cancel, self.inner.notifier.notify_text(&text, decision.level)).await?;
            if let Some(path) = &image_path {
                let images = cancellable(cancel, self.inner.notifier.notify_image(path, decision.level)).await?;
                report.merge(images);
            }
            Some(report)
        } else {
            None
        };

        {
            let mut status = self.run_status();
            status.snapshots_processed += 1;
            if delivery.as_ref().is_some_and(DeliveryReport::any_delivered) {
                status.notifications_sent += 1;
            }
            status.last_decision = Some(decision.clone());
            if let Some(path) = &image_path {
                status.last_image = Some(path.display().to_string());
            }
        }

        Ok(CycleReport {
            image_path,
            record_id,
            outcome,
            decision,
            delivery,
        })
    }

    async fn analyze_with_retry(&self, path: &Path, cancel: &CancelToken) -> Result<AnalysisResult> {
        let attempts = self.inner.options.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match cancellable(cancel, self.inner.analyzer.analyze(path)).await? {
                Ok(analysis) => return Ok(analysis),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "AI解析に失敗");
                    // 設定不備は再試行しても変わらない
                    let retryable = !(e.is_config_error() || matches!(e, StudyBuddyError::MissingApiKey));
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                    if attempt < attempts {
                        cancellable(cancel, tokio::time::sleep(self.inner.options.retry_delay)).await?;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| StudyBuddyError::Analysis("解析を実行できませんでした".into())))
    }

    // =============================================
    // 時刻スケジューラ
    // =============================================

    /// 設定で有効ならスケジューラを（再）起動。既存のものは止める。
    pub async fn start_scheduler(&self) -> bool {
        let mut slot = self.inner.scheduler.lock().await;
        if let Some(old) = slot.take() {
            self.finish_task(old).await;
        }

        if !self.inner.config.snapshot().enable_time_scheduler {
            self.inner.scheduler_running.store(false, Ordering::SeqCst);
            return false;
        }

        let cancel = CancelToken::new();
        let task = tokio::spawn(self.clone().scheduler_loop(cancel.clone()));
        *slot = Some(TaskHandle { cancel, task });
        self.inner.scheduler_running.store(true, Ordering::SeqCst);
        info!("時刻スケジューラを開始");
        true
    }

    pub async fn stop_scheduler(&self) {
        let mut slot = self.inner.scheduler.lock().await;
        if let Some(old) = slot.take() {
            self.finish_task(old).await;
            info!("時刻スケジューラを停止");
        }
        self.inner.scheduler_running.store(false, Ordering::SeqCst);
    }

    /// 実行中の判定は最後まで走らせてから止める
    async fn finish_task(&self, mut handle: TaskHandle) {
        handle.cancel.cancel();
        let wait = self.inner.options.stop_grace * 2;
        if tokio::time::timeout(wait, &mut handle.task).await.is_err() {
            handle.task.abort();
        }
    }

    async fn scheduler_loop(self, cancel: CancelToken) {
        let mut memory = ScheduleMemory::default();
        loop {
            self.scheduler_tick(&mut memory, Local::now().naive_local()).await;
            if cancellable(&cancel, tokio::time::sleep(self.inner.options.scheduler_tick))
                .await
                .is_err()
            {
                break;
            }
        }
    }

    async fn scheduler_tick(&self, memory: &mut ScheduleMemory, now: NaiveDateTime) -> ScheduleAction {
        let config = self.inner.config.snapshot();
        let (start, stop) = match (config.start_time(), config.stop_time()) {
            (Ok(start), Ok(stop)) => (start, stop),
            _ => {
                warn!("スケジュール時刻を解釈できません");
                return ScheduleAction::Idle;
            }
        };

        let (running, failure_stopped_today) = {
            let status = self.run_status();
            (
                status.state != MonitorState::Stopped,
                status.stop_reason == Some(StopReason::FailureLimit)
                    && status.stopped_at.map(|t| t.date()) == Some(now.date()),
            )
        };

        let action = scheduler::evaluate(
            memory,
            ScheduleInput {
                now,
                start,
                stop,
                running,
                failure_stopped_today,
            },
        );

        match action {
            ScheduleAction::Start => {
                info!(time = %now.format("%H:%M"), "スケジュールにより監視を開始");
                if let Err(e) = self.start().await {
                    warn!(error = %e, "スケジュール開始に失敗");
                }
            }
            ScheduleAction::Stop => {
                info!(time = %now.format("%H:%M"), "スケジュールにより監視を停止");
                if let Err(e) = self.stop(StopReason::Scheduler).await {
                    warn!(error = %e, "スケジュール停止に失敗");
                }
            }
            ScheduleAction::Idle => {}
        }
        action
    }
}

fn failed_outcome(issue: String) -> CheckOutcome {
    CheckOutcome {
        is_valid: false,
        failed_keys: Vec::new(),
        passed_keys: Vec::new(),
        issues: vec![issue],
    }
}

/// 停止要求と競合させる
async fn cancellable<F: Future>(cancel: &CancelToken, future: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StudyBuddyError::Cancelled),
        output = future => Ok(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraOptions, FrameGrabber};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use image::codecs::jpeg::JpegEncoder;
    use image::{ImageBuffer, Rgb};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use study_buddy_common::NotifyLevel;
    use tempfile::{tempdir, TempDir};

    fn sample_jpeg() -> Vec<u8> {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_fn(16, 12, |x, _| Rgb([x as u8 * 10, 80, 160]));
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, 80).encode_image(&img).unwrap();
        buf
    }

    struct FakeGrabber {
        fail: bool,
    }

    #[async_trait]
    impl FrameGrabber for FakeGrabber {
        async fn grab(&self) -> Result<Vec<u8>> {
            if self.fail {
                Err(StudyBuddyError::Capture("no device".into()))
            } else {
                Ok(sample_jpeg())
            }
        }
    }

    /// 最初の `failures` 回は失敗し、その後 `result` を返す
    struct FlakyAnalyzer {
        failures: usize,
        calls: AtomicUsize,
        result: Value,
    }

    #[async_trait]
    impl SceneAnalyzer for FlakyAnalyzer {
        async fn analyze(&self, _image_path: &Path) -> Result<AnalysisResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(StudyBuddyError::Analysis("timeout".into()));
            }
            Ok(serde_json::from_value(self.result.clone()).unwrap())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        texts: Mutex<Vec<String>>,
        images: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_text(&self, text: &str, _level: NotifyLevel) -> DeliveryReport {
            self.texts.lock().unwrap().push(text.to_string());
            DeliveryReport {
                delivered: vec!["fake:someone".into()],
                failed: vec![],
            }
        }

        async fn notify_image(&self, _path: &Path, _level: NotifyLevel) -> DeliveryReport {
            self.images.fetch_add(1, Ordering::SeqCst);
            DeliveryReport::default()
        }
    }

    struct Fixture {
        _dir: TempDir,
        service: MonitorService,
        analyzer: Arc<FlakyAnalyzer>,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture(capture_fails: bool, analyzer_failures: usize, result: Value) -> Fixture {
        let dir = tempdir().unwrap();
        let camera = Arc::new(CameraService::new(
            Arc::new(FakeGrabber { fail: capture_fails }),
            dir.path().join("captures"),
            CameraOptions::default(),
        ));
        let analyzer = Arc::new(FlakyAnalyzer {
            failures: analyzer_failures,
            calls: AtomicUsize::new(0),
            result,
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let mut config = MonitorConfig::default();
        config.rules = vec![
            study_buddy_common::Rule::new("at_desk", "^true$"),
            study_buddy_common::Rule::new("posture", "^端正$"),
        ];
        let service = MonitorService::new(
            MonitorDeps {
                camera,
                analyzer: analyzer.clone(),
                notifier: notifier.clone(),
                store: DetectionStore::open_in_memory().unwrap(),
                config: ConfigStore::in_memory(dir.path().join("monitor_config.json"), config),
            },
            MonitorOptions {
                retry_delay: Duration::from_millis(5),
                ..MonitorOptions::default()
            },
        );
        Fixture {
            _dir: dir,
            service,
            analyzer,
            notifier,
        }
    }

    #[tokio::test]
    async fn test_cycle_records_failed_keys_and_notifies() {
        let f = fixture(false, 0, json!({"at_desk": true, "posture": "歪坐"}));
        let config = f.service.config();
        let report = f.service.run_cycle(&config, &CancelToken::new()).await.unwrap();

        assert!(!report.outcome.is_valid);
        assert_eq!(report.outcome.failed_keys, vec!["posture"]);
        assert!(report.decision.should_notify);
        assert!(report.record_id.is_some());

        let records = f.service.store().get_recent(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].failed_keys, vec!["posture"]);
        assert!(records[0].should_notify);

        let texts = f.notifier.texts.lock().unwrap();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("posture: 歪坐"));
        assert_eq!(f.notifier.images.load(Ordering::SeqCst), 1);
        assert_eq!(f.service.status().notifications_sent, 1);
    }

    #[tokio::test]
    async fn test_passing_cycle_is_quiet() {
        let f = fixture(false, 0, json!({"at_desk": "true", "posture": "端正"}));
        let config = f.service.config();
        let report = f.service.run_cycle(&config, &CancelToken::new()).await.unwrap();
        assert!(report.outcome.is_valid);
        assert!(!report.decision.should_notify);
        assert!(report.delivery.is_none());
        assert!(f.notifier.texts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_analysis_retries_then_succeeds() {
        let f = fixture(false, 2, json!({"at_desk": true, "posture": "端正"}));
        let config = f.service.config();
        let report = f.service.run_cycle(&config, &CancelToken::new()).await.unwrap();
        assert!(report.outcome.is_valid);
        assert_eq!(f.analyzer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_analysis_failure_is_a_failed_cycle() {
        let f = fixture(false, 10, json!({}));
        let config = f.service.config();
        let report = f.service.run_cycle(&config, &CancelToken::new()).await.unwrap();
        assert_eq!(f.analyzer.calls.load(Ordering::SeqCst), 3);
        assert!(!report.outcome.is_valid);
        assert_eq!(report.outcome.failed_keys, vec!["at_desk", "posture"]);

        let records = f.service.store().get_recent(1).unwrap();
        assert!(records[0].analysis.get("error").is_some());
        assert!(f.service.status().last_error.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_capture_failure_counts_without_record() {
        let f = fixture(true, 0, json!({}));
        let config = f.service.config();
        let report = f.service.run_cycle(&config, &CancelToken::new()).await.unwrap();
        assert!(report.image_path.is_none());
        assert!(report.record_id.is_none());
        assert!(!report.outcome.is_valid);
        assert_eq!(f.service.notify().consecutive_failures(), 1);
        assert!(f.service.store().get_recent(10).unwrap().is_empty());
        // テキストのみ
        assert_eq!(f.notifier.texts.lock().unwrap().len(), 1);
        assert_eq!(f.notifier.images.load(Ordering::SeqCst), 0);
        assert_eq!(f.analyzer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_returns_cancelled() {
        let f = fixture(false, 0, json!({"at_desk": true, "posture": "端正"}));
        let cancel = CancelToken::new();
        cancel.cancel();
        let config = f.service.config();
        let result = f.service.run_cycle(&config, &cancel).await;
        assert!(matches!(result, Err(StudyBuddyError::Cancelled)));
        assert!(!f.service.camera().is_busy());
    }

    #[tokio::test]
    async fn test_scheduler_tick_skips_day_after_failure_limit() {
        let f = fixture(false, 0, json!({}));
        let today = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        {
            let mut status = f.service.run_status();
            status.stop_reason = Some(StopReason::FailureLimit);
            status.stopped_at = Some(today.and_hms_opt(9, 30, 0).unwrap());
        }
        let mut memory = ScheduleMemory::default();
        let action = f
            .service
            .scheduler_tick(&mut memory, today.and_hms_opt(10, 0, 0).unwrap())
            .await;
        assert_eq!(action, ScheduleAction::Idle);
        assert!(!f.service.is_running());
    }

    #[tokio::test]
    async fn test_update_config_applies_notify_limits() {
        let f = fixture(false, 0, json!({}));
        let next = f
            .service
            .update_config(&json!({"consecutive_fail_limit": "2", "min_notify_interval": 5}))
            .await
            .unwrap();
        assert_eq!(next.consecutive_fail_limit, 2);
        assert_eq!(f.service.notify().policy().consecutive_fail_limit, 2);
        assert!(f.service.update_config(&json!({"rules": [{"key": "x", "pattern": "("}]})).await.is_err());
        assert_eq!(f.service.config().consecutive_fail_limit, 2);
    }
}
