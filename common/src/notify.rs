//! 通知判定（状態機械）
//!
//! サイクルごとに合否と現在時刻を受け取り、通知/抑制/停止を決める。
//! 評価順:
//! 1. 連続失敗（今回分を含む）が上限以上 → 最終通知して停止
//! 2. 不合格かつ前回通知から min 以上経過 → 通知
//! 3. 合格かつ前回通知（未通知なら開始時刻）から max 以上経過 → 状況通知
//! 4. それ以外 → 通知なし（連続失敗数のみ更新）

use crate::types::NotifyLevel;
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// 通知間隔と停止上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyPolicy {
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub consecutive_fail_limit: u32,
}

impl NotifyPolicy {
    /// 分単位の設定値から生成（表現できない値は上限に丸める）
    pub fn from_minutes(min_minutes: u64, max_minutes: u64, consecutive_fail_limit: u32) -> Self {
        Self {
            min_interval: minutes_saturating(min_minutes),
            max_interval: minutes_saturating(max_minutes),
            consecutive_fail_limit,
        }
    }
}

fn minutes_saturating(minutes: u64) -> Duration {
    i64::try_from(minutes)
        .ok()
        .and_then(Duration::try_minutes)
        .unwrap_or(Duration::MAX)
}

impl Default for NotifyPolicy {
    fn default() -> Self {
        Self::from_minutes(10, 60, 5)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyState {
    Idle,
    Notifying,
    Suppressed,
    Stopped,
}

/// 1サイクル分の判定結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyDecision {
    pub should_notify: bool,
    pub should_stop: bool,
    pub level: NotifyLevel,
    pub reason: String,
}

/// 状態スナップショット（ステータスAPI用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyStatus {
    pub state: NotifyState,
    pub consecutive_failures: u32,
    pub consecutive_fail_limit: u32,
    pub last_notify_time: Option<NaiveDateTime>,
    pub min_notify_interval_minutes: i64,
    pub max_notify_interval_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct NotifyManager {
    policy: NotifyPolicy,
    state: NotifyState,
    consecutive_failures: u32,
    last_notify_time: Option<NaiveDateTime>,
    started_at: NaiveDateTime,
}

impl NotifyManager {
    pub fn new(policy: NotifyPolicy, now: NaiveDateTime) -> Self {
        Self {
            policy,
            state: NotifyState::Idle,
            consecutive_failures: 0,
            last_notify_time: None,
            started_at: now,
        }
    }

    /// 監視開始時に呼ぶ
    pub fn reset(&mut self, now: NaiveDateTime) {
        self.state = NotifyState::Idle;
        self.consecutive_failures = 0;
        self.last_notify_time = None;
        self.started_at = now;
    }

    pub fn update_limits(&mut self, policy: NotifyPolicy) {
        self.policy = policy;
    }

    pub fn policy(&self) -> NotifyPolicy {
        self.policy
    }

    pub fn state(&self) -> NotifyState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_notify_time(&self) -> Option<NaiveDateTime> {
        self.last_notify_time
    }

    pub fn evaluate(&mut self, is_valid: bool, now: NaiveDateTime) -> NotifyDecision {
        if self.state == NotifyState::Stopped {
            return NotifyDecision {
                should_notify: false,
                should_stop: true,
                level: NotifyLevel::Danger,
                reason: "已停止，需手动重新启动".to_string(),
            };
        }

        let failing = !is_valid;
        let projected = self.consecutive_failures + u32::from(failing);

        // 1. 停止判定
        if projected >= self.policy.consecutive_fail_limit {
            self.consecutive_failures = projected;
            self.last_notify_time = Some(now);
            self.state = NotifyState::Stopped;
            return NotifyDecision {
                should_notify: true,
                should_stop: true,
                level: NotifyLevel::Danger,
                reason: format!("连续失败 {} 次，已达到限制，停止监控", projected),
            };
        }

        // 2. 不合格
        if failing && self.elapsed_since_notify(now).map_or(true, |e| e >= self.policy.min_interval) {
            self.consecutive_failures = projected;
            self.last_notify_time = Some(now);
            self.state = NotifyState::Notifying;
            return NotifyDecision {
                should_notify: true,
                should_stop: false,
                level: NotifyLevel::Warning,
                reason: format!("连续失败 {} 次", projected),
            };
        }

        // 3. 合格の定期報告
        if !failing {
            let reference = self.last_notify_time.unwrap_or(self.started_at);
            if non_negative(now - reference) >= self.policy.max_interval {
                self.consecutive_failures = 0;
                self.last_notify_time = Some(now);
                self.state = NotifyState::Notifying;
                return NotifyDecision {
                    should_notify: true,
                    should_stop: false,
                    level: NotifyLevel::Info,
                    reason: "状态更新 - 正常".to_string(),
                };
            }
        }

        // 4. 通知なし
        self.consecutive_failures = if failing { projected } else { 0 };
        self.state = NotifyState::Suppressed;
        let reason = if failing {
            match self.elapsed_since_notify(now) {
                Some(e) => format!("距离上次通知仅 {}s，小于最小间隔", e.num_seconds()),
                None => "小于最小间隔".to_string(),
            }
        } else {
            "状态正常".to_string()
        };
        NotifyDecision {
            should_notify: false,
            should_stop: false,
            level: NotifyLevel::Info,
            reason,
        }
    }

    pub fn status(&self) -> NotifyStatus {
        NotifyStatus {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_fail_limit: self.policy.consecutive_fail_limit,
            last_notify_time: self.last_notify_time,
            min_notify_interval_minutes: self.policy.min_interval.num_minutes(),
            max_notify_interval_minutes: self.policy.max_interval.num_minutes(),
        }
    }

    fn elapsed_since_notify(&self, now: NaiveDateTime) -> Option<Duration> {
        self.last_notify_time.map(|last| non_negative(now - last))
    }
}

fn non_negative(d: Duration) -> Duration {
    if d < Duration::zero() {
        Duration::zero()
    } else {
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    fn minutes(m: i64) -> Duration {
        Duration::minutes(m)
    }

    #[test]
    fn test_first_failure_notifies_immediately() {
        let mut manager = NotifyManager::new(NotifyPolicy::default(), t0());
        let decision = manager.evaluate(false, t0());
        assert!(decision.should_notify);
        assert!(!decision.should_stop);
        assert_eq!(decision.level, NotifyLevel::Warning);
        assert_eq!(manager.consecutive_failures(), 1);
        assert_eq!(manager.state(), NotifyState::Notifying);
    }

    #[test]
    fn test_min_interval_suppresses_second_failure() {
        let mut manager = NotifyManager::new(NotifyPolicy::from_minutes(10, 60, 5), t0());
        assert!(manager.evaluate(false, t0()).should_notify);

        let second = manager.evaluate(false, t0() + minutes(3));
        assert!(!second.should_notify);
        assert_eq!(manager.state(), NotifyState::Suppressed);
        assert_eq!(manager.consecutive_failures(), 2);
        // 抑制時はタイマーを戻さない
        assert_eq!(manager.last_notify_time(), Some(t0()));
    }

    #[test]
    fn test_max_interval_status_update_fires_once_in_65_minutes() {
        let mut manager = NotifyManager::new(NotifyPolicy::from_minutes(10, 60, 5), t0());
        let mut notified_at = Vec::new();
        for minute in (0..=65).step_by(1) {
            let now = t0() + minutes(minute);
            let decision = manager.evaluate(true, now);
            if decision.should_notify {
                assert_eq!(decision.level, NotifyLevel::Info);
                notified_at.push(minute);
            }
        }
        assert_eq!(notified_at, vec![60]);
        assert_eq!(manager.last_notify_time(), Some(t0() + minutes(60)));
    }

    #[test]
    fn test_fail_limit_yields_single_stop_notification() {
        let mut manager = NotifyManager::new(NotifyPolicy::from_minutes(10, 60, 3), t0());
        let decisions: Vec<NotifyDecision> = (0..6)
            .map(|i| manager.evaluate(false, t0() + minutes(i)))
            .collect();

        let stop_notifications = decisions
            .iter()
            .filter(|d| d.should_stop && d.should_notify)
            .count();
        assert_eq!(stop_notifications, 1);
        assert!(decisions[2].should_stop);
        assert!(decisions[2].should_notify);
        assert_eq!(decisions[2].level, NotifyLevel::Danger);
        assert!(!decisions[1].should_stop);
        assert_eq!(manager.state(), NotifyState::Stopped);
        assert!(decisions[3..].iter().all(|d| d.should_stop && !d.should_notify));
    }

    #[test]
    fn test_pass_resets_failure_counter() {
        let mut manager = NotifyManager::new(NotifyPolicy::from_minutes(10, 60, 3), t0());
        manager.evaluate(false, t0());
        manager.evaluate(false, t0() + minutes(1));
        assert_eq!(manager.consecutive_failures(), 2);

        manager.evaluate(true, t0() + minutes(2));
        assert_eq!(manager.consecutive_failures(), 0);

        // リセット後は再び上限まで数える
        manager.evaluate(false, t0() + minutes(3));
        let decision = manager.evaluate(false, t0() + minutes(4));
        assert!(!decision.should_stop);
    }

    #[test]
    fn test_reset_clears_stopped_state() {
        let mut manager = NotifyManager::new(NotifyPolicy::from_minutes(10, 60, 1), t0());
        assert!(manager.evaluate(false, t0()).should_stop);
        manager.reset(t0() + minutes(30));
        assert_eq!(manager.state(), NotifyState::Idle);
        assert_eq!(manager.consecutive_failures(), 0);
        assert_eq!(manager.last_notify_time(), None);
    }

    #[test]
    fn test_status_snapshot() {
        let mut manager = NotifyManager::new(NotifyPolicy::from_minutes(15, 45, 4), t0());
        manager.evaluate(false, t0());
        let status = manager.status();
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(status.consecutive_fail_limit, 4);
        assert_eq!(status.min_notify_interval_minutes, 15);
        assert_eq!(status.max_notify_interval_minutes, 45);
        assert_eq!(status.last_notify_time, Some(t0()));
    }

    /// 疑似クロックで100サイクル: 失敗中は min 以内に2回通知しない、
    /// 合格中は max を超えて通知を保留しない
    #[test]
    fn test_interval_bounds_over_100_synthetic_cycles() {
        let policy = NotifyPolicy::from_minutes(10, 60, 1000);
        let mut manager = NotifyManager::new(policy, t0());

        let mut last_notify: Option<NaiveDateTime> = None;
        let mut now = t0();
        for cycle in 0..100u32 {
            // 3分間隔、合否は擬似乱数パターン
            now += minutes(3);
            let is_valid = (cycle * 7 + cycle / 5) % 3 != 0;

            let decision = manager.evaluate(is_valid, now);
            assert!(!decision.should_stop);

            if !is_valid && decision.should_notify {
                if let Some(last) = last_notify {
                    assert!(now - last >= policy.min_interval, "cycle {cycle}: too frequent");
                }
            }
            if is_valid {
                let reference = last_notify.unwrap_or(t0());
                if now - reference >= policy.max_interval {
                    assert!(decision.should_notify, "cycle {cycle}: withheld beyond max");
                }
            }
            if decision.should_notify {
                last_notify = Some(now);
            }
        }
    }

    #[test]
    fn test_policy_from_huge_minutes_saturates() {
        let policy = NotifyPolicy::from_minutes(u64::MAX, i64::MAX as u64, 3);
        assert_eq!(policy.min_interval, Duration::MAX);
        assert_eq!(policy.max_interval, Duration::MAX);

        // 定期報告は実質発生しない
        let mut manager = NotifyManager::new(policy, t0());
        assert!(!manager.evaluate(true, t0() + minutes(600)).should_notify);
    }
}
