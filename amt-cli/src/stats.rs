//! Statistics display and formatting

use amt_gateway::InterfaceStats;
use std::io::Write;
use std::time::Duration;

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a bit rate in human-readable form
pub fn format_bandwidth(bps: u64) -> String {
    const KBPS: u64 = 1000;
    const MBPS: u64 = KBPS * 1000;
    const GBPS: u64 = MBPS * 1000;

    if bps >= GBPS {
        format!("{:.2} Gbps", bps as f64 / GBPS as f64)
    } else if bps >= MBPS {
        format!("{:.2} Mbps", bps as f64 / MBPS as f64)
    } else if bps >= KBPS {
        format!("{:.2} Kbps", bps as f64 / KBPS as f64)
    } else {
        format!("{} bps", bps)
    }
}

/// Format duration in human-readable form
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Bytes written by the receiver since start
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputStats {
    pub datagrams: u64,
    pub bytes: u64,
}

/// Display interface statistics as a table
pub fn display_interface_stats(name: &str, stats: &InterfaceStats) {
    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ TUNNEL {:<53}│", name);
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ Phase:        {:<46}│", stats.phase.to_string());
    println!(
        "│ Groups:       {:<46}│",
        format!("{} ({} channels)", stats.groups, stats.channels)
    );
    println!(
        "│ Reports:      {:<46}│",
        format!("{} sent / {} refused", stats.reports_sent, stats.send_refusals)
    );
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ DATA                                                        │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!(
        "│ Received:     {:<46}│",
        format!("{} packets", stats.data_packets_received)
    );
    println!(
        "│ Reassembled:  {:<46}│",
        format!(
            "{} ({} timed out, {} over budget)",
            stats.datagrams_reassembled, stats.reassembly_timeouts, stats.reassembly_overflows
        )
    );
    println!(
        "│ Delivered:    {:<46}│",
        format!(
            "{} ({} sinks evicted)",
            stats.datagrams_delivered, stats.sink_evictions
        )
    );
    println!("└─────────────────────────────────────────────────────────────┘");
}

/// Display compact stats on one line (for continuous updates)
pub fn display_compact_stats(stats: &InterfaceStats, output: OutputStats, elapsed: Duration) {
    let throughput_bps = if elapsed.as_secs() > 0 {
        (output.bytes * 8) / elapsed.as_secs()
    } else {
        0
    };

    eprint!(
        "\r[{:8}] {} | Groups: {} | Recv: {} | Out: {} | Rate: {}         ",
        format_duration(elapsed),
        stats.phase,
        stats.groups,
        stats.data_packets_received,
        format_bytes(output.bytes),
        format_bandwidth(throughput_bps),
    );

    // Progress line only; a failed flush is not worth reporting.
    let _ = std::io::stderr().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(2 * 1024 * 1024), "2.00 MB");
    }

    #[test]
    fn test_format_bandwidth() {
        assert_eq!(format_bandwidth(500), "500 bps");
        assert_eq!(format_bandwidth(10_000), "10.00 Kbps");
        assert_eq!(format_bandwidth(10_000_000), "10.00 Mbps");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 01m 01s");
    }
}
