//! 配置值解析：时长、大小、时刻

use std::time::Duration;

use chrono::NaiveTime;

use crate::error::{CacheError, Result};

/// 解析时长，如 `"90d"`、`"1h"`、`"30s"`、`"250ms"`
///
/// 不带单位时按秒计。
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (num, unit) = split_number(s)?;

    let unit = unit.trim().to_ascii_lowercase();
    let multiplier: u64 = match unit.as_str() {
        "ms" | "millis" | "milliseconds" => return Ok(Duration::from_millis(num)),
        "" | "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3600,
        "d" | "day" | "days" => 86_400,
        "w" | "week" | "weeks" => 604_800,
        _ => {
            return Err(CacheError::configuration(format!(
                "Invalid duration unit in {:?}",
                s
            )))
        }
    };

    num.checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| CacheError::configuration(format!("Duration out of range: {:?}", s)))
}

/// 解析字节数，如 `"128m"`、`"4k"`、`"2g"`，按 1024 进位
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (num, unit) = split_number(s)?;

    let unit = unit.trim().to_ascii_lowercase();
    let unit = unit.strip_suffix('b').unwrap_or(&unit);
    let unit = unit.strip_suffix('i').unwrap_or(unit);
    let multiplier: u64 = match unit {
        "" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        _ => {
            return Err(CacheError::configuration(format!(
                "Invalid size unit in {:?}",
                s
            )))
        }
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| CacheError::configuration(format!("Size out of range: {:?}", s)))
}

/// 解析时刻 `HH:MM` 或 `HH:MM:SS`
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| CacheError::configuration(format!("Invalid time of day {:?}: {}", s, e)))
}

fn split_number(s: &str) -> Result<(u64, &str)> {
    if s.is_empty() {
        return Err(CacheError::configuration("Empty value"));
    }
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, rest) = s.split_at(end);
    let num = digits
        .parse::<u64>()
        .map_err(|_| CacheError::configuration(format!("Invalid number in {:?}", s)))?;
    Ok((num, rest))
}
