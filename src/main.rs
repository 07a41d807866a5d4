use anyhow::Context;
use chrono::Local;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use study_buddy::analyzer::{KimiVisionAnalyzer, SceneAnalyzer};
use study_buddy::camera::{CameraOptions, CameraService, CommandGrabber};
use study_buddy::cli::{Cli, Commands};
use study_buddy::config::{AppConfig, ConfigStore};
use study_buddy::messenger::{MessengerService, SharedMessenger};
use study_buddy::monitor::{MonitorDeps, MonitorOptions, MonitorService};
use study_buddy::storage::DetectionStore;
use study_buddy::{logging, web};
use study_buddy_common::{DetectionRecord, NotifyLevel, RuleChecker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let app = AppConfig::load(cli.home.clone())?;
    app.paths.ensure_dirs()?;
    logging::init(&app.paths.logs_dir(), cli.verbose)?;

    match cli.command {
        Commands::Serve { host, port } => {
            println!("📚 study-buddy - 監視サービス\n");

            println!("[1/3] 設定と記録を読み込み中...");
            let config_store = ConfigStore::open(app.paths.monitor_config_file())?;
            let store = DetectionStore::open(app.paths.database_file())?;
            println!("✔ 設定: {}", config_store.path().display());
            println!("✔ 記録: {}\n", app.paths.database_file().display());

            println!("[2/3] サービスを初期化中...");
            let analyzer: Arc<dyn SceneAnalyzer> = Arc::new(KimiVisionAnalyzer::new(&app.kimi)?);
            let messenger = Arc::new(SharedMessenger::new(MessengerService::from_config(&app)?));
            let recipients = messenger.current().recipient_count();
            let monitor = MonitorService::new(
                MonitorDeps {
                    camera: Arc::new(build_camera(&app)),
                    analyzer,
                    notifier: messenger.clone(),
                    store,
                    config: config_store,
                },
                MonitorOptions {
                    max_retries: app.kimi.max_retries,
                    ..MonitorOptions::default()
                },
            );
            if recipients == 0 {
                println!("- 通知先が未設定です（WECHAT_* / TELEGRAM_*）");
            }
            if monitor.start_scheduler().await {
                let config = monitor.config();
                println!("✔ 時刻スケジューラ: {}-{}", config.auto_start_time, config.auto_stop_time);
            }
            println!("✔ 初期化完了（通知先 {}件）\n", recipients);

            println!("[3/3] Webサーバーを起動中...");
            web::serve(web::WebState::new(monitor, messenger, app), &host, port).await?;
            println!("\n✅ 終了しました");
        }

        Commands::Capture => {
            println!("📷 study-buddy - 撮影\n");
            let camera = build_camera(&app);
            let path = camera.capture().await?;
            camera.release().await;
            println!("✔ 保存: {}", path.display());
        }

        Commands::Analyze { image } => {
            println!("🔍 study-buddy - AI解析\n");
            let analyzer = KimiVisionAnalyzer::new(&app.kimi)?;
            println!("[1/1] 解析中（{}）...", analyzer.model());
            let analysis = analyzer.analyze(&image).await?;
            println!("✔ 解析完了\n");
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }

        Commands::Check { image } => {
            println!("✅ study-buddy - ルール判定\n");
            let config = ConfigStore::open(app.paths.monitor_config_file())?.snapshot();
            let checker = RuleChecker::new(&config.rules)?;

            println!("[1/2] AI解析中...");
            let analyzer = KimiVisionAnalyzer::new(&app.kimi)?;
            let analysis = analyzer.analyze(&image).await?;
            println!("✔ 解析完了\n");

            println!("[2/2] ルール判定中（{}件）...", checker.len());
            let outcome = checker.check(&analysis);
            for key in &outcome.passed_keys {
                println!("  ✔ {}", key);
            }
            for issue in &outcome.issues {
                println!("  ✘ {}", issue);
            }
            println!(
                "\n{}",
                if outcome.is_valid { "✅ 合格" } else { "❌ 不合格" }
            );
        }

        Commands::Records { recent, reset } => {
            let store = DetectionStore::open(app.paths.database_file())?;
            if reset {
                let deleted = store.reset()?;
                println!("✔ {}件の記録を削除しました", deleted);
                return Ok(());
            }

            let today = Local::now().date_naive();
            let records = match recent {
                Some(limit) => store.get_recent(limit)?,
                None => store.get_today(today)?,
            };
            let stats = store.stats(today)?;
            println!(
                "記録: 全{}件 / 本日{}件（合格 {}・通知 {}）\n",
                stats.total, stats.today, stats.today_valid, stats.today_notified
            );
            for record in &records {
                print_record(record);
            }
            if records.is_empty() {
                println!("（記録はありません）");
            }
        }

        Commands::Config { show, reset } => {
            let store = ConfigStore::open(app.paths.monitor_config_file())?;
            if reset {
                store.reset()?;
                println!("✔ 監視設定を既定値に戻しました");
            }
            if show || !reset {
                let config = store.snapshot();
                println!("設定: {}", store.path().display());
                println!("  ルール:");
                for rule in &config.rules {
                    println!("    {} = {}", rule.key, rule.pattern);
                }
                println!("  撮影間隔: {}秒", config.capture_interval);
                println!(
                    "  通知間隔: {}〜{}分",
                    config.min_notify_interval, config.max_notify_interval
                );
                println!("  連続失敗の上限: {}", config.consecutive_fail_limit);
                println!(
                    "  プレビュー: {}（{}秒）",
                    if config.enable_preview { "有効" } else { "無効" },
                    config.preview_duration
                );
                println!(
                    "  時刻スケジューラ: {}（{}-{}）",
                    if config.enable_time_scheduler { "有効" } else { "無効" },
                    config.auto_start_time,
                    config.auto_stop_time
                );
                println!(
                    "  APIキー: {}",
                    if app.kimi.api_key.is_some() { "設定済み" } else { "未設定" }
                );
            }
        }

        Commands::Notify { text } => {
            let messenger = MessengerService::from_config(&app)?;
            if !messenger.is_configured() {
                anyhow::bail!("通知先が設定されていません（WECHAT_* / TELEGRAM_*）");
            }
            let report = messenger.send(&text, NotifyLevel::Info).await;
            for target in &report.delivered {
                println!("✔ {}", target);
            }
            for failure in &report.failed {
                println!("✘ {}:{} {}", failure.platform.as_str(), failure.recipient, failure.error);
            }
            if !report.any_delivered() {
                anyhow::bail!("送信できた通知先がありません");
            }
        }

        Commands::Doctor => {
            println!("🩺 study-buddy - 診断\n");
            println!("ホーム: {}", app.paths.home.display());
            println!(
                "WeCom: {}",
                app.wecom
                    .as_ref()
                    .map(|w| format!("設定済み（受信者 {}件）", w.recipients.len()))
                    .unwrap_or_else(|| "未設定".into())
            );
            println!(
                "Telegram: {}",
                app.telegram
                    .as_ref()
                    .map(|t| format!("設定済み（チャット {}件）", t.chat_ids.len()))
                    .unwrap_or_else(|| "未設定".into())
            );
            println!("撮影コマンド: {}\n", app.camera.program);

            println!("[1/1] Vision API 接続確認中...");
            let analyzer = KimiVisionAnalyzer::new(&app.kimi)?;
            let reply = analyzer
                .check_connection()
                .await
                .context("Vision API に接続できません")?;
            println!("✔ 接続OK（{}）: {}", analyzer.model(), reply.trim());
        }
    }

    Ok(())
}

fn build_camera(app: &AppConfig) -> CameraService {
    CameraService::new(
        Arc::new(CommandGrabber::from_settings(&app.camera)),
        app.paths.captures_dir(),
        CameraOptions {
            max_width: app.camera.max_width,
            capture_timeout: Duration::from_secs(app.camera.capture_timeout_secs),
        },
    )
}

fn print_record(record: &DetectionRecord) {
    println!(
        "{} {} {}{}",
        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        if record.is_valid { "✔" } else { "✘" },
        if record.failed_keys.is_empty() {
            String::new()
        } else {
            format!("[{}] ", record.failed_keys.join(", "))
        },
        record.image_path
    );
}
