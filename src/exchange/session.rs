//! Trading-session calendar by instrument prefix.
//!
//! Instrument codes carry their venue as a prefix: `US.`, `HK.`, `FX.` or
//! `CC.`. US and FX hours follow New York local time, HK follows Hong Kong
//! local time, crypto never closes.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::America::New_York;
use chrono_tz::Asia::Hong_Kong;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const WEEK_SECS: i64 = 7 * 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Venue {
    Us,
    Hk,
    Fx,
    Crypto,
    Other,
}

impl Venue {
    pub fn of(code: &str) -> Self {
        if code.len() <= 3 {
            return Venue::Other;
        }
        match &code[..3] {
            "US." => Venue::Us,
            "HK." => Venue::Hk,
            "FX." => Venue::Fx,
            "CC." => Venue::Crypto,
            _ => Venue::Other,
        }
    }
}

/// Default price tick for an instrument code.
pub fn tick_size(code: &str) -> Decimal {
    match Venue::of(code) {
        Venue::Fx => dec!(0.0001),
        Venue::Crypto => dec!(0.000001),
        _ => dec!(0.01),
    }
}

/// Decimal places used when rounding order prices.
pub fn price_precision(code: &str) -> u32 {
    match Venue::of(code) {
        Venue::Fx => 4,
        _ => 2,
    }
}

fn minute_of_day<T: TimeZone>(t: &DateTime<T>) -> u32 {
    t.hour() * 60 + t.minute()
}

fn is_weekday(day: Weekday) -> bool {
    day.num_days_from_monday() < 5
}

fn local_at(tz: Tz, date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(hour, minute, 0)?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

fn secs_until(target: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    target
        .map(|t| (t - now).num_seconds().max(0))
        .unwrap_or(0)
}

/// Move a Saturday or Sunday forward to Monday.
fn skip_weekend(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date + Duration::days(2),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

/// Session predicates for a pool of instruments.
#[derive(Debug, Clone, Default)]
pub struct MarketCalendar {
    instruments: Vec<String>,
}

impl MarketCalendar {
    pub fn new(instruments: Vec<String>) -> Self {
        Self { instruments }
    }

    pub fn instruments(&self) -> &[String] {
        &self.instruments
    }

    fn has(&self, venue: Venue) -> bool {
        self.instruments.iter().any(|c| Venue::of(c) == venue)
    }

    pub fn can_place_order_at(&self, code: &str, now: DateTime<Utc>) -> bool {
        match Venue::of(code) {
            Venue::Us => {
                let t = now.with_timezone(&New_York);
                let m = minute_of_day(&t);
                is_weekday(t.weekday()) && (4 * 60..20 * 60).contains(&m)
            }
            Venue::Hk => Self::hk_trading(now),
            Venue::Fx => Self::fx_trading(now),
            Venue::Crypto | Venue::Other => true,
        }
    }

    pub fn is_continuous_at(&self, code: &str, now: DateTime<Utc>) -> bool {
        match Venue::of(code) {
            Venue::Us => {
                let t = now.with_timezone(&New_York);
                let m = minute_of_day(&t);
                is_weekday(t.weekday()) && (9 * 60 + 30..16 * 60).contains(&m)
            }
            Venue::Hk => Self::hk_trading(now),
            Venue::Fx => Self::fx_trading(now),
            Venue::Crypto | Venue::Other => true,
        }
    }

    /// Some instrument of the pool accepts orders.
    pub fn market_open_at(&self, now: DateTime<Utc>) -> bool {
        self.instruments
            .iter()
            .any(|c| self.can_place_order_at(c, now))
    }

    /// Every instrument of the pool is in continuous bidding.
    pub fn pool_continuous_at(&self, now: DateTime<Utc>) -> bool {
        self.instruments
            .iter()
            .all(|c| self.is_continuous_at(c, now))
    }

    /// Seconds until the earliest venue of the pool opens, zero when open.
    pub fn secs_to_open_at(&self, now: DateTime<Utc>) -> i64 {
        let mut secs = WEEK_SECS;
        for code in &self.instruments {
            let venue_secs = match Venue::of(code) {
                Venue::Us => Self::us_secs_to_open(now),
                Venue::Hk => Self::hk_secs_to_open(now),
                Venue::Fx => Self::fx_secs_to_open(now),
                Venue::Crypto => 0,
                Venue::Other => continue,
            };
            secs = secs.min(venue_secs);
        }
        secs
    }

    pub fn secs_to_preopen_end_at(&self, now: DateTime<Utc>) -> i64 {
        if self.has(Venue::Us) {
            let t = now.with_timezone(&New_York);
            if !is_weekday(t.weekday()) {
                return 0;
            }
            return secs_until(local_at(New_York, t.date_naive(), 9, 30), now);
        }
        if self.has(Venue::Hk) {
            return Self::hk_secs_to_open(now);
        }
        0
    }

    pub fn secs_to_afterhours_end_at(&self, now: DateTime<Utc>) -> i64 {
        if self.has(Venue::Us) {
            let t = now.with_timezone(&New_York);
            if !is_weekday(t.weekday()) {
                return 0;
            }
            return secs_until(local_at(New_York, t.date_naive(), 20, 0), now);
        }
        if self.has(Venue::Hk) {
            let t = now.with_timezone(&Hong_Kong);
            if !is_weekday(t.weekday()) {
                return 0;
            }
            return secs_until(local_at(Hong_Kong, t.date_naive(), 16, 0), now);
        }
        0
    }

    pub fn has_preopen(&self) -> bool {
        self.has(Venue::Us)
    }

    /// Late evening in New York ends the trading day.
    pub fn is_day_rollover_at(&self, now: DateTime<Utc>) -> bool {
        now.with_timezone(&New_York).hour() == 23
    }

    fn hk_trading(now: DateTime<Utc>) -> bool {
        let t = now.with_timezone(&Hong_Kong);
        let m = minute_of_day(&t);
        is_weekday(t.weekday()) && (9 * 60 + 30..16 * 60).contains(&m)
    }

    fn fx_trading(now: DateTime<Utc>) -> bool {
        let t = now.with_timezone(&New_York);
        match t.weekday() {
            Weekday::Mon | Weekday::Tue | Weekday::Wed | Weekday::Thu => true,
            Weekday::Fri => t.hour() < 15,
            Weekday::Sat => false,
            Weekday::Sun => t.hour() >= 15,
        }
    }

    fn us_secs_to_open(now: DateTime<Utc>) -> i64 {
        let t = now.with_timezone(&New_York);
        let mut date = t.date_naive();
        if t.hour() >= 16 {
            date = date + Duration::days(1);
        }
        secs_until(local_at(New_York, skip_weekend(date), 4, 0), now)
    }

    fn hk_secs_to_open(now: DateTime<Utc>) -> i64 {
        let t = now.with_timezone(&Hong_Kong);
        let mut date = t.date_naive();
        if t.hour() >= 16 {
            date = date + Duration::days(1);
        }
        secs_until(local_at(Hong_Kong, skip_weekend(date), 9, 30), now)
    }

    fn fx_secs_to_open(now: DateTime<Utc>) -> i64 {
        if Self::fx_trading(now) {
            return 0;
        }
        let t = now.with_timezone(&New_York);
        let date = match t.weekday() {
            Weekday::Fri => t.date_naive() + Duration::days(2),
            Weekday::Sat => t.date_naive() + Duration::days(1),
            _ => t.date_naive(),
        };
        secs_until(local_at(New_York, date, 15, 0), now)
    }
}
