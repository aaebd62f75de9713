//! Human-readable numbers for reports.

use std::time::Duration;

const UNITS: [&str; 8] = ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi"];

/// Format a byte count with binary prefixes, e.g. `2.4GiB`.
pub fn sizeof_fmt(bytes: f64) -> String {
    let mut num = bytes;
    for unit in UNITS {
        if num.abs() < 1024.0 {
            return format!("{:.1}{}B", num, unit);
        }
        num /= 1024.0;
    }
    format!("{:.1}YiB", num)
}

/// Format an elapsed time as `1d2h3m4s5ms`, omitting leading zero units.
pub fn pretty_time_delta(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let (days, rest) = (total / 86_400, total % 86_400);
    let (hours, rest) = (rest / 3_600, rest % 3_600);
    let (minutes, seconds) = (rest / 60, rest % 60);
    let millis = elapsed.subsec_millis();

    if days > 0 {
        format!("{}d{}h{}m{}s{}ms", days, hours, minutes, seconds, millis)
    } else if hours > 0 {
        format!("{}h{}m{}s{}ms", hours, minutes, seconds, millis)
    } else if minutes > 0 {
        format!("{}m{}s{}ms", minutes, seconds, millis)
    } else {
        format!("{}s{}ms", seconds, millis)
    }
}

/// Group digits in thousands: `71,349,660`.
pub fn with_commas(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
