use std::fmt::Write as _;

use chrono::{DateTime, Local, Utc};
use fleet_core::{
    ActionOutcome, ActionReport, CommandReport, FleetSummary, InstanceStatus, LifecycleAction,
    Snapshot,
};
use shared_event_bus::FleetEvent;
use shared_logging::LogRecord;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

fn status_marker(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Running => "[running ]",
        InstanceStatus::Starting => "[starting]",
        InstanceStatus::Stopping => "[stopping]",
        InstanceStatus::Stopped => "[stopped ]",
        InstanceStatus::Unknown => "[unknown ]",
    }
}

/// Numbered inventory, with a node header whenever the node changes.
pub fn render_list(snapshot: &Snapshot) -> String {
    let mut out = String::from("Fleet instances:\n");
    let mut last_node: Option<&str> = None;
    for instance in snapshot.instances() {
        if last_node != Some(instance.node_id.as_str()) {
            let node_name = snapshot
                .node(&instance.node_id)
                .map_or("unknown node", |node| node.display_name.as_str());
            let _ = writeln!(out, "\nNode: {node_name} ({})", instance.node_id);
            last_node = Some(instance.node_id.as_str());
        }
        let tag = if snapshot.is_ambiguous(&instance.name) {
            " (duplicate name)"
        } else {
            ""
        };
        let _ = writeln!(
            out,
            "[{}] {} {}{tag}",
            instance.position,
            status_marker(instance.status),
            instance.name
        );
    }
    if snapshot.is_empty() {
        out.push_str("\n(no instances on this panel)\n");
    }
    for node in snapshot.skipped_nodes() {
        let _ = writeln!(out, "\nwarning: instances of node {node} could not be listed");
    }
    if !snapshot.ambiguous_names().is_empty() {
        out.push_str("\nInstances marked as duplicate names must be addressed by number or uuid.\n");
    }
    if let Some(at) = snapshot.refreshed_at() {
        let _ = writeln!(out, "\nas of {}", format_time(Some(at)));
    }
    out
}

/// One-line result of a start or stop.
pub fn render_action(report: &ActionReport) -> String {
    let verb = match report.action {
        LifecycleAction::Start => "start",
        LifecycleAction::Stop => "stop",
    };
    match report.outcome {
        ActionOutcome::Accepted => format!("{verb} sent to {}", report.instance.name),
        ActionOutcome::CoolingDown { remaining } => format!(
            "{} was acted on recently; retry in {:.1}s",
            report.instance.name,
            remaining.as_secs_f64()
        ),
    }
}

/// Command acknowledgement plus recent console output.
pub fn render_command(report: &CommandReport) -> String {
    let output = report.output.as_deref().unwrap_or("(no output returned)");
    format!(
        "command sent to {}: {}\nrecent output:\n{output}",
        report.instance.name, report.command
    )
}

/// Fleet health report.
pub fn render_status(summary: &FleetSummary) -> String {
    let mut out = String::new();
    match summary.panel_version.as_deref() {
        Some(version) => {
            let _ = writeln!(out, "Panel v{version}");
        }
        None => out.push_str("Panel (version unknown)\n"),
    }
    let _ = writeln!(out, "  data time: {}", format_time(summary.panel_time));
    out.push_str("----------------------\n");
    for node in &summary.per_node {
        let _ = writeln!(out, "Node: {}", node.name);
        let _ = writeln!(
            out,
            "- state: {}",
            if node.available { "online" } else { "offline" }
        );
        let _ = writeln!(out, "- daemon: {}", node.daemon_version.as_deref().unwrap_or("unknown"));
        let _ = writeln!(out, "- os: {}", node.os_version.as_deref().unwrap_or("unknown"));
        let _ = writeln!(out, "- cpu: {}", format_percent(node.cpu_fraction));
        let _ = writeln!(
            out,
            "- memory: {} / {}",
            format_gib(node.mem_used_bytes),
            format_gib(node.mem_total_bytes)
        );
        let _ = writeln!(
            out,
            "- instances: {} running / {} total",
            node.instance_running, node.instance_total
        );
        out.push_str("----------------------\n");
    }
    if let Some(mean) = summary.mean_cpu_fraction() {
        let _ = writeln!(out, "mean cpu: {}", format_percent(mean));
    }
    let _ = writeln!(out, "uptime: {}", format_uptime(summary.panel_uptime_secs));
    let _ = writeln!(
        out,
        "nodes: {} online / {} total",
        summary.node_count_available, summary.node_count_total
    );
    let _ = write!(
        out,
        "instances running: {} / {}",
        summary.instance_count_running, summary.instance_count_total
    );
    out
}

/// Recent audit records, oldest first.
pub fn render_audit(records: &[LogRecord]) -> String {
    if records.is_empty() {
        return "(audit log is empty)".into();
    }
    records
        .iter()
        .map(|record| {
            let metadata = serde_json::Value::Object(record.metadata.clone());
            format!(
                "{} {:5} {} {metadata}",
                record.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                record.level.to_string(),
                record.message
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Recent lifecycle events, oldest first.
pub fn render_events(events: &[FleetEvent]) -> String {
    if events.is_empty() {
        return "(no events recorded)".into();
    }
    events
        .iter()
        .map(|event| {
            let name = event.payload["name"].as_str().unwrap_or("-");
            let instance = event.instance.as_deref().unwrap_or("-");
            format!(
                "{} {} {name} {instance} {}",
                event.at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                event.kind,
                event.payload
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Seconds as the two largest of days, hours and minutes; seconds under a minute.
pub fn format_uptime(seconds: Option<f64>) -> String {
    let Some(seconds) = seconds.filter(|s| s.is_finite() && *s > 0.0) else {
        return "unknown".into();
    };
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let total = seconds as u64;
    let (minutes, secs) = (total / 60, total % 60);
    let (hours, minutes) = (minutes / 60, minutes % 60);
    let (days, hours) = (hours / 24, hours % 24);
    let parts: Vec<String> = [(days, "d"), (hours, "h"), (minutes, "m")]
        .into_iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{value}{unit}"))
        .take(2)
        .collect();
    if parts.is_empty() {
        format!("{secs}s")
    } else {
        parts.join(" ")
    }
}

/// Bytes as GiB with two decimals; negative or missing values show as zero.
pub fn format_gib(bytes: f64) -> String {
    let bytes = if bytes.is_finite() { bytes.max(0.0) } else { 0.0 };
    format!("{:.2} GiB", bytes / GIB)
}

/// Fraction as a percentage, clamped for display.
pub fn format_percent(fraction: f64) -> String {
    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    format!("{:.2}%", fraction * 100.0)
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map_or_else(
        || "unknown".into(),
        |t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
    )
}
