//! Metrics scrape of a direct node over a secure-shell session
//!
//! One command prints `/proc/stat` twice a second apart, memory totals,
//! uptime and root filesystem usage between section markers; the control
//! plane does the arithmetic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use fp_core::traits::{NodeLink, SecureShell, SshTarget};
use fp_core::{ConnectionType, NodeId, PanelError, ResourceSnapshot};

pub const SCRAPE_COMMAND: &str = "echo '#stat'; head -n1 /proc/stat; sleep 1; head -n1 /proc/stat; \
echo '#mem'; grep -E '^(MemTotal|MemAvailable):' /proc/meminfo; \
echo '#uptime'; cat /proc/uptime; \
echo '#df'; df -Pk / | tail -n1";

pub struct SshLink {
    node_id: NodeId,
    target: SshTarget,
    ssh: Arc<dyn SecureShell>,
    connect_timeout: Duration,
}

impl SshLink {
    pub fn new(
        node_id: NodeId,
        target: SshTarget,
        ssh: Arc<dyn SecureShell>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            target,
            ssh,
            connect_timeout,
        }
    }
}

#[async_trait]
impl NodeLink for SshLink {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Direct
    }

    fn kind(&self) -> &'static str {
        "ssh"
    }

    async fn probe(&self) -> Result<ResourceSnapshot, PanelError> {
        let session = self.ssh.connect(&self.target, self.connect_timeout).await?;
        let output = session.exec(SCRAPE_COMMAND).await;
        if let Err(e) = session.close().await {
            tracing::debug!("Closing scrape session for {} failed: {}", self.node_id, e);
        }
        let output = output?;
        if !output.success() {
            return Err(PanelError::Unreachable(format!(
                "metrics scrape on {} failed: {}",
                self.target.display(),
                output.summary(3)
            )));
        }
        parse_scrape(&output.stdout)
    }
}

/// Parse `SCRAPE_COMMAND` output
pub fn parse_scrape(text: &str) -> Result<ResourceSnapshot, PanelError> {
    let mut section = "";
    let mut stats: Vec<(u64, u64)> = Vec::new();
    let mut mem_total = None;
    let mut mem_available = None;
    let mut uptime = None;
    let mut disk = None;

    for line in text.lines() {
        let line = line.trim();
        if let Some(name) = line.strip_prefix('#') {
            section = name;
            continue;
        }
        match section {
            "stat" if line.starts_with("cpu ") => stats.push(cpu_times(line)?),
            "mem" => {
                let mut parts = line.split_whitespace();
                let key = parts.next();
                let value = parts.next().and_then(|v| v.parse::<u64>().ok());
                match key {
                    Some("MemTotal:") => mem_total = value,
                    Some("MemAvailable:") => mem_available = value,
                    _ => {}
                }
            }
            "uptime" => {
                uptime = line
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse::<f64>().ok())
                    .map(|v| v as u64);
            }
            "df" if !line.is_empty() => {
                let cols: Vec<&str> = line.split_whitespace().collect();
                if cols.len() >= 4 {
                    let used = cols[2].parse::<u64>().ok();
                    let avail = cols[3].parse::<u64>().ok();
                    if let (Some(used), Some(avail)) = (used, avail) {
                        disk = Some(percent(used, used + avail));
                    }
                }
            }
            _ => {}
        }
    }

    let cpu_percent = match stats.as_slice() {
        [(busy0, total0), (busy1, total1), ..] => {
            let total = total1.saturating_sub(*total0);
            percent(busy1.saturating_sub(*busy0), total)
        }
        _ => return Err(malformed("cpu counters")),
    };
    let ram_percent = match (mem_total, mem_available) {
        (Some(total), Some(avail)) => percent(total.saturating_sub(avail), total),
        _ => return Err(malformed("memory totals")),
    };

    Ok(ResourceSnapshot {
        cpu_percent,
        ram_percent,
        disk_percent: disk.ok_or_else(|| malformed("filesystem usage"))?,
        uptime_secs: uptime.ok_or_else(|| malformed("uptime"))?,
    }
    .normalized())
}

/// (busy, total) jiffies from the aggregate `cpu` line
fn cpu_times(line: &str) -> Result<(u64, u64), PanelError> {
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|_| malformed("cpu counters"))?;
    if fields.len() < 4 {
        return Err(malformed("cpu counters"));
    }
    // user nice system idle iowait irq softirq steal; guest time is already
    // counted in user
    let total: u64 = fields.iter().take(8).sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Ok((total.saturating_sub(idle), total))
}

fn percent(part: u64, whole: u64) -> f32 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64 * 100.0) as f32
    }
}

fn malformed(what: &str) -> PanelError {
    PanelError::Unreachable(format!("metrics scrape returned no {}", what))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "#stat
cpu  1000 0 1000 8000 0 0 0 0 0 0
cpu  1100 0 1100 8800 0 0 0 0 0 0
#mem
MemTotal:        8000000 kB
MemAvailable:    2000000 kB
#uptime
12345.67 40000.00
#df
/dev/sda1        100000  25000  75000  25% /
";

    #[test]
    fn parses_a_full_scrape() {
        let snap = parse_scrape(SAMPLE).unwrap();
        assert!((snap.cpu_percent - 20.0).abs() < 0.01);
        assert!((snap.ram_percent - 75.0).abs() < 0.01);
        assert!((snap.disk_percent - 25.0).abs() < 0.01);
        assert_eq!(snap.uptime_secs, 12345);
    }

    #[test]
    fn missing_sections_are_errors() {
        let truncated = SAMPLE.split("#uptime").next().unwrap();
        assert!(parse_scrape(truncated).is_err());
        assert!(parse_scrape("").is_err());
    }
}
