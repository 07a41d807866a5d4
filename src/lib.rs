//! Study Buddy: 定期撮影 → AI判定 → ルール判定 → 通知 の学習見守りサービス

pub mod analyzer;
pub mod camera;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod messenger;
pub mod monitor;
pub mod storage;
pub mod web;
