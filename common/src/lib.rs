//! Study Buddy Common Library
//!
//! CLI・監視サービス・Web で共有される型と判定ロジック（I/Oなし）

pub mod config;
pub mod error;
pub mod notify;
pub mod parser;
pub mod prompts;
pub mod rules;
pub mod types;

pub use config::{default_rules, parse_hhmm, MonitorConfig};
pub use error::{Error, Result};
pub use notify::{NotifyDecision, NotifyManager, NotifyPolicy, NotifyState, NotifyStatus};
pub use parser::{extract_json, parse_analysis_response};
pub use prompts::build_vision_prompt;
pub use rules::{compile_pattern, validate_rules, CheckOutcome, RuleChecker};
pub use types::{AnalysisResult, DetectionRecord, NewDetectionRecord, NotifyLevel, Rule};
