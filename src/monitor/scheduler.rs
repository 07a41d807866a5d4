//! 時刻スケジューラの判定
//!
//! - 監視時間帯 `[start, stop)` に入っていて停止中なら自動開始（1日1回まで）
//! - 実行中に stop 時刻をまたいだら停止
//! - 連続失敗で止まった日は自動開始しない

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::time::Duration;

pub const SCHEDULER_TICK: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAction {
    Start,
    Stop,
    Idle,
}

/// 判定間で持ち越す状態
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleMemory {
    last_check: Option<NaiveDateTime>,
    last_auto_start: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduleInput {
    pub now: NaiveDateTime,
    pub start: NaiveTime,
    pub stop: NaiveTime,
    pub running: bool,
    /// 本日、連続失敗上限で停止済み
    pub failure_stopped_today: bool,
}

pub fn in_window(time: NaiveTime, start: NaiveTime, stop: NaiveTime) -> bool {
    start <= time && time < stop
}

pub fn evaluate(memory: &mut ScheduleMemory, input: ScheduleInput) -> ScheduleAction {
    let today = input.now.date();
    let time = input.now.time();
    // 日付が変わったら前回時刻は使わない
    let previous = memory
        .last_check
        .filter(|last| last.date() == today)
        .map(|last| last.time());
    memory.last_check = Some(input.now);

    if input.running {
        let crossed_stop = previous.is_some_and(|p| p < input.stop) && time >= input.stop;
        return if crossed_stop {
            ScheduleAction::Stop
        } else {
            ScheduleAction::Idle
        };
    }

    if in_window(time, input.start, input.stop)
        && memory.last_auto_start != Some(today)
        && !input.failure_stopped_today
    {
        memory.last_auto_start = Some(today);
        return ScheduleAction::Start;
    }

    ScheduleAction::Idle
}
