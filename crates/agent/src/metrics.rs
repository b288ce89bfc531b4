//! Host metrics attached to heartbeats.
//!
//! Every probe is optional: a field that cannot be read is simply
//! omitted from the report. Parsers are split out so the /proc formats
//! stay covered by tests.

use nw_protocol::HostMetrics;

/// Collect what the host exposes. Never fails.
pub fn collect() -> HostMetrics {
    HostMetrics {
        os_info: std::fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|raw| parse_os_release(&raw)),
        kernel: std::fs::read_to_string("/proc/sys/kernel/osrelease")
            .ok()
            .map(|s| s.trim().to_string()),
        load_avg: std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|raw| parse_loadavg(&raw)),
        mem_total_kb: read_meminfo_field("MemTotal"),
        mem_available_kb: read_meminfo_field("MemAvailable"),
        uptime_secs: std::fs::read_to_string("/proc/uptime")
            .ok()
            .and_then(|raw| parse_uptime(&raw)),
    }
}

fn read_meminfo_field(field: &str) -> Option<u64> {
    let raw = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_field(&raw, field)
}

/// `/proc/loadavg`: "0.52 0.58 0.59 1/467 12345".
pub fn parse_loadavg(raw: &str) -> Option<[f64; 3]> {
    let mut parts = raw.split_whitespace();
    let one = parts.next()?.parse().ok()?;
    let five = parts.next()?.parse().ok()?;
    let fifteen = parts.next()?.parse().ok()?;
    Some([one, five, fifteen])
}

/// `/proc/meminfo` line: "MemTotal:       16384000 kB".
pub fn parse_meminfo_field(raw: &str, field: &str) -> Option<u64> {
    raw.lines()
        .find(|line| line.starts_with(field) && line[field.len()..].starts_with(':'))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse().ok())
}

/// `/proc/uptime`: "351200.52 1400123.67".
pub fn parse_uptime(raw: &str) -> Option<u64> {
    raw.split_whitespace()
        .next()?
        .parse::<f64>()
        .ok()
        .map(|secs| secs as u64)
}

/// `PRETTY_NAME="Debian GNU/Linux 12 (bookworm)"` from /etc/os-release.
pub fn parse_os_release(raw: &str) -> Option<String> {
    raw.lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|value| value.trim_matches('"').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loadavg_parsing() {
        assert_eq!(
            parse_loadavg("0.52 0.58 0.59 1/467 12345\n"),
            Some([0.52, 0.58, 0.59])
        );
        assert_eq!(parse_loadavg("garbage"), None);
    }

    #[test]
    fn meminfo_field_parsing() {
        let raw = "MemTotal:       16384000 kB\nMemFree:         1024000 kB\nMemAvailable:    8192000 kB\n";
        assert_eq!(parse_meminfo_field(raw, "MemTotal"), Some(16_384_000));
        assert_eq!(parse_meminfo_field(raw, "MemAvailable"), Some(8_192_000));
        assert_eq!(parse_meminfo_field(raw, "SwapTotal"), None);
        // "Mem" must not match "MemTotal".
        assert_eq!(parse_meminfo_field(raw, "Mem"), None);
    }

    #[test]
    fn uptime_parsing() {
        assert_eq!(parse_uptime("351200.52 1400123.67\n"), Some(351_200));
        assert_eq!(parse_uptime(""), None);
    }

    #[test]
    fn os_release_parsing() {
        let raw = "NAME=\"Debian GNU/Linux\"\nPRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\n";
        assert_eq!(
            parse_os_release(raw),
            Some("Debian GNU/Linux 12 (bookworm)".to_string())
        );
        assert_eq!(parse_os_release("NAME=x"), None);
    }

    #[test]
    fn collect_never_panics() {
        let _ = collect();
    }
}
