//! ルール判定
//!
//! 各ルール `{key, pattern}` について `analysis[key]` を文字列化し、
//! パターンに全体一致するか判定する（大文字小文字は区別しない）。
//! キー欠落は不合格。全ルール合格で合格（AND）。

use crate::error::{Error, Result};
use crate::types::{AnalysisResult, Rule};
use regex::{Regex, RegexBuilder};

/// 判定結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub is_valid: bool,
    /// 不合格キー（ルール順）
    pub failed_keys: Vec<String>,
    /// 合格キー（ルール順）
    pub passed_keys: Vec<String>,
    /// 表示用の不合格理由（`key: value`）
    pub issues: Vec<String>,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: Rule,
    regex: Regex,
}

/// コンパイル済みルール集合
#[derive(Debug, Clone, Default)]
pub struct RuleChecker {
    rules: Vec<CompiledRule>,
}

/// パターンを全体一致用にコンパイル
pub fn compile_pattern(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    RegexBuilder::new(&format!("^(?:{})$", pattern))
        .case_insensitive(true)
        .build()
}

/// ルール検証のみ（保存前チェック用）
pub fn validate_rules(rules: &[Rule]) -> Result<()> {
    RuleChecker::new(rules).map(|_| ())
}

impl RuleChecker {
    pub fn new(rules: &[Rule]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.key.trim().is_empty() {
                return Err(Error::InvalidRule {
                    key: rule.key.clone(),
                    message: "キーが空です".into(),
                });
            }
            let regex = compile_pattern(&rule.pattern).map_err(|e| Error::InvalidRule {
                key: rule.key.clone(),
                message: format!("無効な正規表現 {}: {}", rule.pattern, e),
            })?;
            compiled.push(CompiledRule {
                rule: rule.clone(),
                regex,
            });
        }
        Ok(Self { rules: compiled })
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.rules.iter().map(|c| c.rule.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn check(&self, analysis: &AnalysisResult) -> CheckOutcome {
        let mut failed_keys = Vec::new();
        let mut passed_keys = Vec::new();
        let mut issues = Vec::new();

        for compiled in &self.rules {
            let key = &compiled.rule.key;
            match analysis.value_str(key) {
                None => {
                    failed_keys.push(key.clone());
                    issues.push(format!("{}: 字段缺失", key));
                }
                Some(value) if compiled.regex.is_match(&value) => {
                    passed_keys.push(key.clone());
                }
                Some(value) => {
                    failed_keys.push(key.clone());
                    issues.push(format!("{}: {}", key, value));
                }
            }
        }

        CheckOutcome {
            is_valid: failed_keys.is_empty(),
            failed_keys,
            passed_keys,
            issues,
        }
    }
}
