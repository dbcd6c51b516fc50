//! Exchange calendar helper for market-hour gating.
//!
//! Weekday + session-window checks for the CN A-share market. Exchange
//! holidays are not modeled here; providers answer `latest_trade_date`
//! for anything that needs the authoritative calendar.

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc, Weekday};

/// Beijing time (UTC+8); exchange-local for SSE/SZSE/BSE.
fn cst() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).unwrap_or_else(|| FixedOffset::east_opt(0).unwrap())
}

/// Whether `now` falls on a CN trading weekday.
pub fn is_trading_day(now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&cst());
    !matches!(local.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Whether `now` falls inside a CN trading session
/// (09:30-11:30 or 13:00-15:00 Beijing time, Monday-Friday).
pub fn in_trading_hours(now: DateTime<Utc>) -> bool {
    if !is_trading_day(now) {
        return false;
    }
    let t = now.with_timezone(&cst()).time();
    let morning_open = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
    let morning_close = NaiveTime::from_hms_opt(11, 30, 0).unwrap();
    let afternoon_open = NaiveTime::from_hms_opt(13, 0, 0).unwrap();
    let afternoon_close = NaiveTime::from_hms_opt(15, 0, 0).unwrap();
    (t >= morning_open && t <= morning_close) || (t >= afternoon_open && t <= afternoon_close)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn weekend_is_not_trading() {
        // 2025-11-08 is a Saturday.
        assert!(!is_trading_day(utc(2025, 11, 8, 2, 0)));
        assert!(is_trading_day(utc(2025, 11, 5, 2, 0)));
    }

    #[test]
    fn session_windows_in_beijing_time() {
        // 02:00 UTC = 10:00 Beijing, morning session.
        assert!(in_trading_hours(utc(2025, 11, 5, 2, 0)));
        // 04:00 UTC = 12:00 Beijing, lunch break.
        assert!(!in_trading_hours(utc(2025, 11, 5, 4, 0)));
        // 06:30 UTC = 14:30 Beijing, afternoon session.
        assert!(in_trading_hours(utc(2025, 11, 5, 6, 30)));
        // 08:00 UTC = 16:00 Beijing, closed.
        assert!(!in_trading_hours(utc(2025, 11, 5, 8, 0)));
    }
}
