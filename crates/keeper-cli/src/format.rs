use chrono::{DateTime, Local, Utc};

pub(crate) fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Stored size plus the share saved against the raw dump.
pub(crate) fn format_size_with_savings(stored: u64, raw: u64) -> String {
    if raw == 0 || stored >= raw {
        return format_bytes(stored);
    }
    let pct = (1.0 - stored as f64 / raw as f64) * 100.0;
    format!("{}  ({pct:.1}% saved)", format_bytes(stored))
}

pub(crate) fn format_duration_ms(ms: u64) -> String {
    if ms < 1_000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        let secs = ms / 1_000;
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

pub(crate) fn format_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

pub(crate) fn format_optional_time(at: Option<DateTime<Utc>>) -> String {
    at.map(format_time).unwrap_or_else(|| "-".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_use_binary_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MiB");
    }

    #[test]
    fn savings_only_shown_when_smaller() {
        assert_eq!(format_size_with_savings(50, 200), "50 B  (75.0% saved)");
        assert_eq!(format_size_with_savings(200, 200), "200 B");
        assert_eq!(format_size_with_savings(10, 0), "10 B");
    }

    #[test]
    fn durations_pick_a_readable_unit() {
        assert_eq!(format_duration_ms(250), "250ms");
        assert_eq!(format_duration_ms(2_500), "2.5s");
        assert_eq!(format_duration_ms(125_000), "2m05s");
    }
}
