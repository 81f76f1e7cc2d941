use std::time::Duration;

const UNITS: [(&str, u64); 7] = [
    ("year", 31_536_000),
    ("month", 2_592_000),
    ("week", 604_800),
    ("day", 86_400),
    ("hour", 3_600),
    ("minute", 60),
    ("second", 1),
];

/// Render whole seconds as `"1 hour, 2 minutes, 1 second"`, largest unit first.
/// Zero-valued units are omitted, so `0` renders as an empty string.
pub fn format_elapsed(seconds: u64) -> String {
    let mut remaining = seconds;
    let mut parts = Vec::new();

    for (label, unit) in UNITS {
        if remaining >= unit {
            let value = remaining / unit;
            remaining %= unit;
            let plural = if value == 1 { "" } else { "s" };
            parts.push(format!("{} {}{}", value, label, plural));
        }
    }

    parts.join(", ")
}

pub fn format_duration(duration: Duration) -> String {
    format_elapsed(duration.as_secs())
}
