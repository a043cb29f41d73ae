use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::payload::{non_empty, RawNode, RawOverview};

/// Fleet-wide health view built from one overview payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetSummary {
    /// Nodes listed by the panel.
    pub node_count_total: u64,
    /// Nodes the panel reports reachable.
    pub node_count_available: u64,
    /// Instances summed over every node.
    pub instance_count_total: u64,
    /// Running instances summed over every node.
    pub instance_count_running: u64,
    /// Panel version, if reported.
    pub panel_version: Option<String>,
    /// Panel OS uptime in seconds, if reported.
    pub panel_uptime_secs: Option<f64>,
    /// Timestamp of the overview data, if the envelope carried one.
    pub panel_time: Option<DateTime<Utc>>,
    /// One entry per node, in overview order.
    pub per_node: Vec<NodeSummary>,
}

/// Health of a single node. Fractions are passed through unclamped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    /// Display name.
    pub name: String,
    /// Reachability as reported by the panel.
    pub available: bool,
    /// CPU usage as a fraction of one.
    pub cpu_fraction: f64,
    /// Memory in use, derived from total memory and usage fraction.
    pub mem_used_bytes: f64,
    /// Physical memory.
    pub mem_total_bytes: f64,
    /// Running instances.
    pub instance_running: u64,
    /// Instances hosted.
    pub instance_total: u64,
    /// Daemon version.
    pub daemon_version: Option<String>,
    /// Operating system version.
    pub os_version: Option<String>,
}

impl FleetSummary {
    /// Attaches the envelope timestamp (milliseconds since the epoch).
    #[must_use]
    pub fn with_panel_time(mut self, millis: Option<i64>) -> Self {
        self.panel_time = millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        self
    }

    /// Mean CPU fraction over available nodes.
    #[must_use]
    pub fn mean_cpu_fraction(&self) -> Option<f64> {
        let available: Vec<f64> = self
            .per_node
            .iter()
            .filter(|node| node.available)
            .map(|node| node.cpu_fraction)
            .collect();
        if available.is_empty() {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let count = available.len() as f64;
        Some(available.iter().sum::<f64>() / count)
    }
}

/// Builds a [`FleetSummary`] from the overview `data` block.
///
/// Missing fields count as zero. Node counts prefer the panel's own
/// `remoteCount` and fall back to counting the listed nodes.
#[must_use]
pub fn summarize(overview: &Value) -> FleetSummary {
    let raw = RawOverview::decode(overview);
    let per_node: Vec<NodeSummary> = raw
        .remote
        .iter()
        .enumerate()
        .map(|(idx, node)| summarize_node(idx, node))
        .collect();

    let counted_available = per_node.iter().filter(|node| node.available).count() as u64;
    let (node_count_total, node_count_available) = raw.remote_count.as_ref().map_or(
        (per_node.len() as u64, counted_available),
        |count| {
            (
                count.total.unwrap_or(per_node.len() as u64),
                count.available.unwrap_or(counted_available),
            )
        },
    );

    FleetSummary {
        node_count_total,
        node_count_available,
        instance_count_total: per_node.iter().map(|node| node.instance_total).sum(),
        instance_count_running: per_node.iter().map(|node| node.instance_running).sum(),
        panel_version: non_empty(raw.version.as_ref()).map(str::to_string),
        panel_uptime_secs: raw.system.as_ref().and_then(|system| system.uptime),
        panel_time: None,
        per_node,
    }
}

fn summarize_node(idx: usize, node: &RawNode) -> NodeSummary {
    let name = non_empty(node.remarks.as_ref())
        .or_else(|| non_empty(node.hostname.as_ref()))
        .map_or_else(|| format!("Unnamed Node ({})", idx + 1), str::to_string);
    let system = node.system.as_ref();
    let mem_total_bytes = system.and_then(|s| s.total_mem).unwrap_or_default();
    let mem_fraction = system.and_then(|s| s.mem_usage).unwrap_or_default();
    let instances = node.instance.as_ref();
    NodeSummary {
        name,
        available: node.available.unwrap_or(false),
        cpu_fraction: system.and_then(|s| s.cpu_usage).unwrap_or_default(),
        mem_used_bytes: mem_total_bytes * mem_fraction,
        mem_total_bytes,
        instance_running: instances.and_then(|i| i.running).unwrap_or_default(),
        instance_total: instances.and_then(|i| i.total).unwrap_or_default(),
        daemon_version: non_empty(node.version.as_ref()).map(str::to_string),
        os_version: system.and_then(|s| {
            non_empty(s.version.as_ref())
                .or_else(|| non_empty(s.release.as_ref()))
                .map(str::to_string)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sums_counts_and_passes_fractions_through() {
        let summary = summarize(&json!({
            "version": "10.2.1",
            "remoteCount": { "available": 1, "total": 2 },
            "system": { "uptime": 3600.5 },
            "remote": [
                {
                    "remarks": "alpha",
                    "available": true,
                    "version": "4.1.0",
                    "system": { "cpuUsage": 1.4, "memUsage": 0.5, "totalmem": 8_000_000_000_u64, "release": "6.1.0" },
                    "instance": { "running": 2, "total": 3 }
                },
                {
                    "hostname": "beta-host",
                    "available": false,
                    "instance": { "running": 0, "total": 4 }
                }
            ]
        }));
        assert_eq!(summary.node_count_total, 2);
        assert_eq!(summary.node_count_available, 1);
        assert_eq!(summary.instance_count_total, 7);
        assert_eq!(summary.instance_count_running, 2);
        assert_eq!(summary.panel_version.as_deref(), Some("10.2.1"));
        assert_eq!(summary.panel_uptime_secs, Some(3600.5));

        let alpha = &summary.per_node[0];
        assert!((alpha.cpu_fraction - 1.4).abs() < f64::EPSILON);
        assert!((alpha.mem_used_bytes - 4_000_000_000.0).abs() < 1.0);
        assert_eq!(alpha.os_version.as_deref(), Some("6.1.0"));
        assert_eq!(alpha.daemon_version.as_deref(), Some("4.1.0"));
        assert_eq!(summary.per_node[1].name, "beta-host");
        assert_eq!(summary.mean_cpu_fraction(), Some(1.4));
    }

    #[test]
    fn missing_fields_count_as_zero() {
        let summary = summarize(&json!({ "remote": [{}, { "system": "broken" }] }));
        assert_eq!(summary.node_count_total, 2);
        assert_eq!(summary.node_count_available, 0);
        assert_eq!(summary.instance_count_total, 0);
        assert_eq!(summary.per_node[0].name, "Unnamed Node (1)");
        assert_eq!(summary.per_node[1].name, "Unnamed Node (2)");
        assert_eq!(summary.per_node[1].mem_used_bytes, 0.0);
        assert!(summary.per_node[1].os_version.is_none());
        assert_eq!(summary.mean_cpu_fraction(), None);
        assert_eq!(summarize(&Value::Null), FleetSummary::default());
    }

    #[test]
    fn panel_time_is_millis() {
        let summary = FleetSummary::default().with_panel_time(Some(1_700_000_000_000));
        assert_eq!(
            summary.panel_time.map(|t| t.timestamp()),
            Some(1_700_000_000)
        );
        assert!(FleetSummary::default().with_panel_time(None).panel_time.is_none());
    }
}
