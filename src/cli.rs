use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "study-buddy")]
#[command(about = "学習見守りアシスタント（定期撮影・AI判定・通知）", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 詳細ログを出力
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// データディレクトリ（既定: $STUDY_BUDDY_HOME または ~/.study-buddy）
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 監視サービスとWebダッシュボードを起動
    Serve {
        /// 待ち受けアドレス
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// ポート番号
        #[arg(short, long, default_value = "5000")]
        port: u16,
    },

    /// 1枚撮影して保存
    Capture,

    /// 画像をAI解析してJSONを出力
    Analyze {
        /// 画像ファイル
        #[arg(required = true)]
        image: PathBuf,
    },

    /// 画像を解析してルール判定
    Check {
        /// 画像ファイル
        #[arg(required = true)]
        image: PathBuf,
    },

    /// 検出記録を表示
    Records {
        /// 最近の件数（未指定なら本日分）
        #[arg(long)]
        recent: Option<usize>,

        /// 全記録を削除
        #[arg(long)]
        reset: bool,
    },

    /// 監視設定を表示・初期化
    Config {
        /// 現在の設定を表示
        #[arg(long)]
        show: bool,

        /// 既定値に戻す
        #[arg(long)]
        reset: bool,
    },

    /// 全受信者へテスト通知
    Notify {
        /// 本文
        #[arg(required = true)]
        text: String,
    },

    /// 設定とAPI接続を診断
    Doctor,
}
