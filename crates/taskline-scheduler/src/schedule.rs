//! Schedule evaluator: pure decisions over a schedule and the current time.
//!
//! All inputs are UTC; `utc_offset_hours` shifts them before dates, times
//! and weekdays are compared.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};
use std::str::FromStr;

use taskline_core::{Result, ScheduleSettings, TasklineError};

/// Set of weekdays a task may run on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkDays([bool; 7]);

impl WorkDays {
    pub fn all() -> Self {
        Self([true; 7])
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0[day.num_days_from_sunday() as usize] = true;
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0[day.num_days_from_sunday() as usize]
    }

    pub fn is_empty(&self) -> bool {
        !self.0.iter().any(|d| *d)
    }

    pub fn len(&self) -> usize {
        self.0.iter().filter(|d| **d).count()
    }
}

/// Parse a comma-separated day list.
///
/// Numbers `0`-`7` (0 and 7 are Sunday, 1 is Monday) and day names
/// (`mon`, `Monday`, ...) are accepted; anything else is a configuration
/// error. Duplicates collapse.
pub fn parse_work_days(days: &str) -> Result<WorkDays> {
    let mut set = WorkDays::default();
    for token in days.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let day = match token.parse::<u8>() {
            Ok(0) | Ok(7) => Weekday::Sun,
            Ok(n @ 1..=6) => Weekday::try_from(n - 1)
                .map_err(|_| TasklineError::config(format!("invalid work day: {token}")))?,
            Ok(_) => return Err(TasklineError::config(format!("invalid work day: {token}"))),
            Err(_) => Weekday::from_str(token)
                .map_err(|_| TasklineError::config(format!("invalid work day: {token}")))?,
        };
        set.insert(day);
    }
    Ok(set)
}

/// Result of [`TaskSchedule::readiness`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// `permanent` gates (disabled, no work days) stop the task; a
    /// non-work day only means waiting.
    NotReady { reason: String, permanent: bool },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Result of [`TaskSchedule::can_start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartDecision {
    Start,
    Wait {
        reason: String,
        wait: std::time::Duration,
    },
}

impl StartDecision {
    pub fn can_start(&self) -> bool {
        matches!(self, StartDecision::Start)
    }
}

/// Result of [`TaskSchedule::should_stop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopDecision {
    Continue,
    Stop(String),
}

impl StopDecision {
    pub fn must_stop(&self) -> bool {
        matches!(self, StopDecision::Stop(_))
    }
}

/// Evaluated schedule of one task.
#[derive(Debug, Clone)]
pub struct TaskSchedule {
    enabled: bool,
    is_once: bool,
    once_consumed: bool,
    work_days: WorkDays,
    work_time: std::time::Duration,
    start_date: Option<NaiveDate>,
    start_time: Option<NaiveTime>,
    stop_date: Option<NaiveDate>,
    stop_time: Option<NaiveTime>,
    offset: Duration,
}

impl TaskSchedule {
    pub fn new(settings: &ScheduleSettings) -> Result<Self> {
        Ok(Self {
            enabled: settings.is_enable,
            is_once: settings.is_once,
            once_consumed: false,
            work_days: parse_work_days(&settings.work_days)?,
            work_time: settings.work_time()?,
            start_date: settings.start_date,
            start_time: settings.start_time,
            stop_date: settings.stop_date,
            stop_time: settings.stop_time,
            offset: Duration::hours(i64::from(settings.utc_offset_hours)),
        })
    }

    /// Nominal tick interval.
    pub fn work_time(&self) -> std::time::Duration {
        self.work_time
    }

    pub fn work_days(&self) -> WorkDays {
        self.work_days
    }

    pub fn is_once(&self) -> bool {
        self.is_once
    }

    pub fn is_work_day(&self, now: DateTime<Utc>) -> bool {
        self.work_days.contains(self.local(now).weekday())
    }

    /// Whether the task may run at all today.
    pub fn readiness(&self, now: DateTime<Utc>) -> Readiness {
        if !self.enabled {
            return Readiness::NotReady {
                reason: "disabled by setting 'is_enable'".into(),
                permanent: true,
            };
        }
        // An empty day set would otherwise wait forever for a valid day
        if self.work_days.is_empty() {
            return Readiness::NotReady {
                reason: "setting 'work_days' is empty".into(),
                permanent: true,
            };
        }
        let today = self.local(now).weekday();
        if !self.work_days.contains(today) {
            return Readiness::NotReady {
                reason: format!("{today} is not listed in 'work_days'"),
                permanent: false,
            };
        }
        Readiness::Ready
    }

    /// Whether a run may start now, or how long to wait for the next window.
    pub fn can_start(&self, now: DateTime<Utc>) -> StartDecision {
        let local = self.local(now);
        let today = local.date();

        if let Some(start_date) = self.start_date {
            let start = self.window_start(start_date);
            if local < start {
                let at = self.next_window(start_date);
                return self.wait_until(local, at, format!("starts at {}", at.format("%Y-%m-%d %H:%M:%S")));
            }
        }

        if !self.work_days.contains(today.weekday()) {
            let at = self.next_window(today + Duration::days(1));
            return self.wait_until(
                local,
                at,
                format!("{} is not a work day", today.weekday()),
            );
        }

        if let Some(start_time) = self.start_time {
            if local.time() < start_time {
                let at = today.and_time(start_time);
                return self.wait_until(local, at, format!("starts at {start_time}"));
            }
        }

        // Without a stop date the stop time closes a daily window
        if let (None, Some(stop_time)) = (self.stop_date, self.stop_time) {
            if local.time() > stop_time {
                let at = self.next_window(today + Duration::days(1));
                return self.wait_until(local, at, format!("daily window closed at {stop_time}"));
            }
        }

        StartDecision::Start
    }

    /// Whether the task is finished for good.
    pub fn should_stop(&self, now: DateTime<Utc>) -> StopDecision {
        if let Some(stop_date) = self.stop_date {
            let end = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
            let stop_at = stop_date.and_time(self.stop_time.unwrap_or(end));
            if self.local(now) > stop_at {
                return StopDecision::Stop(format!(
                    "stop time {} has passed",
                    stop_at.format("%Y-%m-%d %H:%M:%S")
                ));
            }
        }
        if self.once_consumed {
            return StopDecision::Stop("one-shot task has already run".into());
        }
        StopDecision::Continue
    }

    /// Record that the single run of a one-shot task happened. Idempotent.
    pub fn mark_once(&mut self) {
        self.once_consumed = true;
    }

    fn local(&self, now: DateTime<Utc>) -> NaiveDateTime {
        (now + self.offset).naive_utc()
    }

    fn window_start(&self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(self.start_time.unwrap_or(NaiveTime::MIN))
    }

    /// Start of the first work day on or after `from`.
    fn next_window(&self, from: NaiveDate) -> NaiveDateTime {
        let mut date = from;
        for _ in 0..7 {
            if self.work_days.contains(date.weekday()) {
                return self.window_start(date);
            }
            date += Duration::days(1);
        }
        self.window_start(from)
    }

    fn wait_until(&self, local: NaiveDateTime, at: NaiveDateTime, reason: String) -> StartDecision {
        let wait = (at - local).to_std().unwrap_or_default();
        StartDecision::Wait { reason, wait }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // 2026-03-02 is a Monday
    fn monday(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    fn settings() -> ScheduleSettings {
        ScheduleSettings::default()
    }

    #[test]
    fn test_parse_work_days_tokens() {
        let days = parse_work_days("1, tue,Wed ,thursday,7").unwrap();
        assert!(days.contains(Weekday::Mon));
        assert!(days.contains(Weekday::Tue));
        assert!(days.contains(Weekday::Wed));
        assert!(days.contains(Weekday::Thu));
        assert!(days.contains(Weekday::Sun));
        assert!(!days.contains(Weekday::Sat));
        assert_eq!(days.len(), 5);

        assert_eq!(parse_work_days("0,7").unwrap().len(), 1);
        assert!(parse_work_days("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_work_days_rejects_unknown() {
        assert!(parse_work_days("mon,funday").unwrap_err().is_configuration());
        assert!(parse_work_days("8").is_err());
    }

    #[test]
    fn test_disabled_is_never_ready() {
        let mut s = settings();
        s.is_enable = false;
        let schedule = TaskSchedule::new(&s).unwrap();
        for hour in [0, 6, 12, 23] {
            let readiness = schedule.readiness(monday(hour, 0));
            assert!(!readiness.is_ready());
            assert!(matches!(readiness, Readiness::NotReady { permanent: true, .. }));
        }
    }

    #[test]
    fn test_empty_work_days_is_never_ready() {
        let mut s = settings();
        s.work_days = " ".into();
        let schedule = TaskSchedule::new(&s).unwrap();
        for day in 2..9 {
            let now = Utc.with_ymd_and_hms(2026, 3, day, 10, 0, 0).unwrap();
            assert!(matches!(
                schedule.readiness(now),
                Readiness::NotReady { permanent: true, .. }
            ));
        }
    }

    #[test]
    fn test_off_day_waits_until_next_work_day() {
        let mut s = settings();
        s.work_days = "wed".into();
        s.start_time = NaiveTime::from_hms_opt(8, 0, 0);
        let schedule = TaskSchedule::new(&s).unwrap();

        let now = monday(10, 0);
        assert!(matches!(
            schedule.readiness(now),
            Readiness::NotReady { permanent: false, .. }
        ));
        match schedule.can_start(now) {
            StartDecision::Wait { wait, .. } => {
                // Monday 10:00 -> Wednesday 08:00
                assert_eq!(wait, std::time::Duration::from_secs((24 + 22) * 3600));
            }
            StartDecision::Start => panic!("must wait for Wednesday"),
        }
    }

    #[test]
    fn test_start_time_not_reached() {
        let mut s = settings();
        s.start_time = NaiveTime::from_hms_opt(9, 30, 0);
        let schedule = TaskSchedule::new(&s).unwrap();

        match schedule.can_start(monday(9, 0)) {
            StartDecision::Wait { wait, .. } => {
                assert_eq!(wait, std::time::Duration::from_secs(30 * 60))
            }
            StartDecision::Start => panic!("start time not reached"),
        }
        assert!(schedule.can_start(monday(9, 30)).can_start());
        assert!(schedule.can_start(monday(18, 0)).can_start());
    }

    #[test]
    fn test_start_date_in_future_picks_later_instant() {
        let mut s = settings();
        // Friday, but only Mondays are work days
        s.start_date = NaiveDate::from_ymd_opt(2026, 3, 6);
        s.start_time = NaiveTime::from_hms_opt(6, 0, 0);
        s.work_days = "1".into();
        let schedule = TaskSchedule::new(&s).unwrap();

        match schedule.can_start(monday(6, 0)) {
            StartDecision::Wait { wait, .. } => {
                // Monday 2026-03-09 06:00 is one week later
                assert_eq!(wait, std::time::Duration::from_secs(7 * 24 * 3600));
            }
            StartDecision::Start => panic!("start date is in the future"),
        }
    }

    #[test]
    fn test_daily_window_closed() {
        let mut s = settings();
        s.start_time = NaiveTime::from_hms_opt(8, 0, 0);
        s.stop_time = NaiveTime::from_hms_opt(18, 0, 0);
        let schedule = TaskSchedule::new(&s).unwrap();

        assert!(schedule.can_start(monday(12, 0)).can_start());
        match schedule.can_start(monday(19, 0)) {
            StartDecision::Wait { wait, .. } => {
                assert_eq!(wait, std::time::Duration::from_secs(13 * 3600))
            }
            StartDecision::Start => panic!("window is closed"),
        }
        assert!(!schedule.should_stop(monday(19, 0)).must_stop());
    }

    #[test]
    fn test_stop_date_passed() {
        let mut s = settings();
        s.stop_date = NaiveDate::from_ymd_opt(2026, 3, 1);
        let schedule = TaskSchedule::new(&s).unwrap();
        assert!(schedule.should_stop(monday(0, 0)).must_stop());

        s.stop_date = NaiveDate::from_ymd_opt(2026, 3, 2);
        s.stop_time = NaiveTime::from_hms_opt(12, 0, 0);
        let schedule = TaskSchedule::new(&s).unwrap();
        assert!(!schedule.should_stop(monday(11, 59)).must_stop());
        assert!(schedule.should_stop(monday(12, 1)).must_stop());
    }

    #[test]
    fn test_once_allows_single_window() {
        let mut s = settings();
        s.is_once = true;
        let mut schedule = TaskSchedule::new(&s).unwrap();
        assert!(!schedule.should_stop(monday(10, 0)).must_stop());

        schedule.mark_once();
        assert!(schedule.should_stop(monday(10, 0)).must_stop());
        schedule.mark_once();
        assert!(schedule.should_stop(monday(10, 1)).must_stop());
    }

    #[test]
    fn test_utc_offset_shifts_weekday() {
        let mut s = settings();
        s.work_days = "tue".into();
        s.utc_offset_hours = 3;
        let schedule = TaskSchedule::new(&s).unwrap();
        // Monday 22:00 UTC is Tuesday 01:00 at +3
        assert!(schedule.is_work_day(monday(22, 0)));
        assert!(!schedule.is_work_day(monday(20, 0)));
    }
}
