//! Delivery time-window gating
//!
//! A broadcast may restrict sends to a daily local-clock interval
//! (e.g. "07:00"–"21:00"). The check converts "now" to minutes since
//! midnight in the broadcast's timezone and compares against the bounds,
//! inclusive on both ends. An absent window is always open; a window with
//! start > end spans midnight.

use chrono::{DateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::models::broadcast::Model as Broadcast;

/// Parse a "HH:MM" clock time into minutes since midnight.
fn parse_clock_minutes(value: &str) -> Option<u32> {
    let (hours, minutes) = value.split_once(':')?;
    let hours: u32 = hours.trim().parse().ok()?;
    let minutes: u32 = minutes.trim().parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

/// Minutes since midnight for `now` in the named timezone. Unknown or
/// absent timezone names fall back to UTC rather than failing the run.
fn local_minutes(now: DateTime<Utc>, timezone: Option<&str>) -> u32 {
    match timezone.and_then(|name| name.parse::<Tz>().ok()) {
        Some(tz) => {
            let local = tz.from_utc_datetime(&now.naive_utc());
            local.hour() * 60 + local.minute()
        }
        None => now.hour() * 60 + now.minute(),
    }
}

/// Whether the broadcast's delivery window is open at `now`.
pub fn window_open_at(broadcast: &Broadcast, now: DateTime<Utc>) -> bool {
    let (start, end) = match (
        broadcast.time_window_start.as_deref(),
        broadcast.time_window_end.as_deref(),
    ) {
        (Some(start), Some(end)) => (start, end),
        // A half-configured window cannot be evaluated; treat as open
        _ => return true,
    };

    let (Some(start), Some(end)) = (parse_clock_minutes(start), parse_clock_minutes(end)) else {
        return true;
    };

    let current = local_minutes(now, broadcast.timezone.as_deref());

    if start <= end {
        current >= start && current <= end
    } else {
        // Window spans midnight, e.g. 21:00-07:00
        current >= start || current <= end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sea_orm::prelude::DateTimeWithTimeZone;
    use uuid::Uuid;

    fn broadcast_with_window(
        timezone: Option<&str>,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Broadcast {
        let now: DateTimeWithTimeZone = Utc::now().fixed_offset();
        Broadcast {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "Promo".to_string(),
            account_id: "acct".to_string(),
            sender_id: "sender".to_string(),
            template_name: "welcome".to_string(),
            template_language: "en".to_string(),
            template_components: None,
            status: "pending".to_string(),
            contacts: serde_json::json!([]),
            current_index: 0,
            sent_count: 0,
            failed_count: 0,
            scheduled_at: None,
            timezone: timezone.map(str::to_string),
            time_window_start: start.map(str::to_string),
            time_window_end: end.map(str::to_string),
            enable_deduplication: false,
            sync_integration_id: None,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    fn utc(time: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(time).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn parse_clock_minutes_bounds() {
        assert_eq!(parse_clock_minutes("07:00"), Some(420));
        assert_eq!(parse_clock_minutes("23:59"), Some(1439));
        assert_eq!(parse_clock_minutes("24:00"), None);
        assert_eq!(parse_clock_minutes("nope"), None);
    }

    #[test]
    fn absent_window_is_always_open() {
        let broadcast = broadcast_with_window(None, None, None);
        assert!(window_open_at(&broadcast, utc("2025-01-01T03:00:00Z")));
    }

    #[test]
    fn inclusive_bounds_in_utc() {
        let broadcast = broadcast_with_window(Some("UTC"), Some("09:00"), Some("18:00"));
        assert!(window_open_at(&broadcast, utc("2025-01-01T09:00:00Z")));
        assert!(window_open_at(&broadcast, utc("2025-01-01T18:00:00Z")));
        assert!(!window_open_at(&broadcast, utc("2025-01-01T08:59:00Z")));
        assert!(!window_open_at(&broadcast, utc("2025-01-01T20:00:00Z")));
    }

    #[test]
    fn window_respects_named_timezone() {
        // 20:00 UTC is 17:00 in São Paulo (UTC-3), inside 09:00-18:00 local
        let broadcast =
            broadcast_with_window(Some("America/Sao_Paulo"), Some("09:00"), Some("18:00"));
        assert!(window_open_at(&broadcast, utc("2025-01-15T20:00:00Z")));
        // 22:00 UTC is 19:00 local, outside the window
        assert!(!window_open_at(&broadcast, utc("2025-01-15T22:00:00Z")));
    }

    #[test]
    fn wrap_around_window_spans_midnight() {
        let broadcast = broadcast_with_window(Some("UTC"), Some("21:00"), Some("07:00"));
        assert!(window_open_at(&broadcast, utc("2025-01-01T22:00:00Z")));
        assert!(window_open_at(&broadcast, utc("2025-01-01T03:00:00Z")));
        assert!(!window_open_at(&broadcast, utc("2025-01-01T12:00:00Z")));
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let broadcast = broadcast_with_window(Some("Mars/Olympus"), Some("09:00"), Some("18:00"));
        assert!(window_open_at(&broadcast, utc("2025-01-01T12:00:00Z")));
        assert!(!window_open_at(&broadcast, utc("2025-01-01T20:00:00Z")));
    }
}
