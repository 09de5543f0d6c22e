//! TOML workload profile parsing
//!
//! A profile mirrors the structure of a uperf XML profile:
//!
//! ```toml
//! name = "tcp-stream"
//!
//! [options]
//! goodbye_timeout_ms = 5000
//!
//! [[group]]
//! name = "writers"
//! nthreads = 4
//!
//! [[group.transaction]]
//! iterations = 1
//! [[group.transaction.flowop]]
//! type = "connect"
//! remotehost = "10.0.0.2"
//! protocol = "tcp"
//!
//! [[group.transaction]]
//! duration = "30s"
//! [[group.transaction.flowop]]
//! type = "write"
//! size = "64k"
//! ```

use super::RunOptions;
use crate::workload::{
    Flowop, FlowopFlags, FlowopOptions, FlowopType, Group, Protocol, StrandKind, Txn, Workorder,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Complete profile document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub name: String,
    #[serde(default)]
    pub options: RunOptions,
    #[serde(rename = "group")]
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub name: Option<String>,
    /// Thread-backed strands
    pub nthreads: Option<u32>,
    /// Process-backed strands
    pub nprocs: Option<u32>,
    #[serde(rename = "transaction")]
    pub txns: Vec<TxnConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnConfig {
    pub iterations: Option<u64>,
    /// Wall-clock duration (e.g. "30s", "500ms")
    pub duration: Option<String>,
    /// Invocations per second; needs a duration
    pub rate: Option<u32>,
    #[serde(rename = "flowop")]
    pub flowops: Vec<FlowopConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowopConfig {
    #[serde(rename = "type")]
    pub kind: Option<FlowopType>,
    pub name: Option<String>,
    /// Logical connection id
    #[serde(default)]
    pub conn: u32,
    pub protocol: Option<Protocol>,
    pub remotehost: Option<String>,
    pub localhost: Option<String>,
    pub port: Option<u32>,
    /// Transfer size (e.g. "64k")
    pub size: Option<String>,
    /// Size the slave uses instead of `size`
    pub rsize: Option<String>,
    /// Random transfer size range (e.g. "1k-64k")
    pub rand_size: Option<String>,
    pub count: Option<u64>,
    /// Think time (e.g. "10ms")
    pub duration: Option<String>,
    /// Spin instead of sleeping during think time
    #[serde(default)]
    pub busy: bool,
    #[serde(default)]
    pub canfail: bool,
    #[serde(default)]
    pub tcp_nodelay: bool,
    /// Socket buffer size (e.g. "256k")
    pub wndsz: Option<String>,
    /// Poll timeout (e.g. "1s")
    pub poll_timeout: Option<String>,
}

/// Parse a profile file
pub fn parse_profile_file(path: &Path) -> Result<ProfileConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read profile: {}", path.display()))?;

    parse_profile_string(&contents)
        .with_context(|| format!("Failed to parse profile: {}", path.display()))
}

/// Parse a profile from a string
pub fn parse_profile_string(contents: &str) -> Result<ProfileConfig> {
    let profile: ProfileConfig =
        ::toml::from_str(contents).context("Failed to parse TOML profile")?;

    Ok(profile)
}

impl ProfileConfig {
    /// Build the validated workorder this profile describes
    pub fn to_workorder(&self) -> Result<Workorder> {
        let mut groups = Vec::with_capacity(self.groups.len());
        for (i, g) in self.groups.iter().enumerate() {
            groups.push(g.to_group(i as u32).with_context(|| {
                format!("Invalid group {} of profile '{}'", i, self.name)
            })?);
        }
        let workorder = Workorder {
            name: self.name.clone(),
            groups,
        };
        workorder.validate()?;
        Ok(workorder)
    }
}

impl GroupConfig {
    fn to_group(&self, id: u32) -> Result<Group> {
        let (kind, nthreads) = match (self.nthreads, self.nprocs) {
            (Some(n), None) => (StrandKind::Thread, n),
            (None, Some(n)) => (StrandKind::Process, n),
            (None, None) => (StrandKind::Thread, 1),
            (Some(_), Some(_)) => anyhow::bail!("Set either nthreads or nprocs, not both"),
        };
        let txns = self
            .txns
            .iter()
            .enumerate()
            .map(|(i, t)| t.to_txn(i as u32))
            .collect::<Result<Vec<_>>>()?;
        Ok(Group {
            id,
            name: self.name.clone().unwrap_or_else(|| format!("group{}", id)),
            kind,
            nthreads,
            max_async: 0,
            txns,
        })
    }
}

impl TxnConfig {
    fn to_txn(&self, id: u32) -> Result<Txn> {
        let flowops = self
            .flowops
            .iter()
            .map(FlowopConfig::to_flowop)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Invalid flowop in transaction {}", id))?;
        let mut txn = Txn::new(id, flowops);
        if let Some(d) = &self.duration {
            txn.duration_ns = parse_duration_ns(d)?;
        }
        if let Some(n) = self.iterations {
            txn.iterations = n;
        }
        if let Some(r) = self.rate {
            txn.rate_count = r;
        }
        Ok(txn)
    }
}

impl FlowopConfig {
    fn to_flowop(&self) -> Result<Flowop> {
        let kind = self.kind.context("Flowop needs a type")?;
        let mut o = FlowopOptions::default();
        if let Some(p) = self.protocol {
            o.protocol = p;
        }
        if let Some(h) = &self.remotehost {
            o.remotehost = h.clone();
        }
        if let Some(h) = &self.localhost {
            o.localhost = h.clone();
        }
        if let Some(p) = self.port {
            o.port = p;
        }
        if let Some(s) = &self.size {
            o.size = size_u32(s)?;
        }
        if let Some(s) = &self.rsize {
            o.rsize = size_u32(s)?;
        }
        if let Some(range) = &self.rand_size {
            let (min, max) = range
                .split_once('-')
                .with_context(|| format!("Random size must be MIN-MAX: {}", range))?;
            o.rand_sz_min = size_u32(min)?;
            o.rand_sz_max = size_u32(max)?;
            o.flag.insert(FlowopFlags::SIZE_RAND);
        }
        if let Some(c) = self.count {
            o.count = c;
        }
        if let Some(d) = &self.duration {
            o.duration = parse_duration_ns(d)?;
        }
        if let Some(w) = &self.wndsz {
            o.wndsz = parse_size(w)?;
        }
        if let Some(t) = &self.poll_timeout {
            o.poll_timeout = parse_duration_ns(t)?;
        }
        if kind == FlowopType::Think {
            o.flag.insert(if self.busy {
                FlowopFlags::THINK_BUSY
            } else {
                FlowopFlags::THINK_IDLE
            });
        }
        if self.canfail {
            o.flag.insert(FlowopFlags::CANFAIL);
        }
        if self.tcp_nodelay {
            o.flag.insert(FlowopFlags::TCP_NODELAY);
        }

        let mut f = Flowop::new(kind, o);
        f.connection_id = self.conn;
        if let Some(n) = &self.name {
            f.name = n.clone();
        }
        Ok(f)
    }
}

/// Parse duration string (e.g., "30s", "500ms", "100us", "2m") to nanoseconds
pub fn parse_duration_ns(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("Empty duration string");
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num_str, unit) = s.split_at(split);
    let num: u64 = num_str
        .parse()
        .with_context(|| format!("Invalid number in duration: {}", s))?;

    let multiplier = match unit {
        "ns" => 1,
        "us" => 1_000,
        "ms" => 1_000_000,
        "s" | "" => 1_000_000_000,
        "m" => 60_000_000_000,
        "h" => 3_600_000_000_000,
        _ => anyhow::bail!("Invalid duration unit: {}. Use ns, us, ms, s, m or h", unit),
    };

    num.checked_mul(multiplier)
        .with_context(|| format!("Duration too large: {}", s))
}

/// Parse size string (e.g., "64k", "1M", "8192") to bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();
    if s.is_empty() {
        anyhow::bail!("Empty size string");
    }

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('K') {
        (n, 1024u64)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .parse()
        .with_context(|| format!("Invalid number in size: {}", num_str))?;

    num.checked_mul(multiplier)
        .with_context(|| format!("Size too large: {}", s))
}

fn size_u32(s: &str) -> Result<u32> {
    let n = parse_size(s)?;
    u32::try_from(n).with_context(|| format!("Transfer size {} exceeds 4G", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::TxnMode;
    use std::io::Write;
    use std::time::Duration;

    const STREAM: &str = r#"
name = "tcp-stream"

[options]
goodbye_timeout_ms = 5000

[[group]]
name = "writers"
nthreads = 4

[[group.transaction]]
iterations = 1
[[group.transaction.flowop]]
type = "connect"
remotehost = "10.0.0.2"
protocol = "tcp"

[[group.transaction]]
duration = "30s"
rate = 100
[[group.transaction.flowop]]
type = "write"
size = "64k"
[[group.transaction.flowop]]
type = "think"
duration = "1ms"
busy = true

[[group.transaction]]
[[group.transaction.flowop]]
type = "disconnect"
"#;

    #[test]
    fn test_parse_duration_ns() {
        assert_eq!(parse_duration_ns("30s").unwrap(), 30_000_000_000);
        assert_eq!(parse_duration_ns("500ms").unwrap(), 500_000_000);
        assert_eq!(parse_duration_ns("100us").unwrap(), 100_000);
        assert_eq!(parse_duration_ns("2m").unwrap(), 120_000_000_000);
        assert_eq!(parse_duration_ns("5").unwrap(), 5_000_000_000);
        assert!(parse_duration_ns("").is_err());
        assert!(parse_duration_ns("10x").is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("8192").unwrap(), 8192);
        assert_eq!(parse_size("64k").unwrap(), 65536);
        assert_eq!(parse_size("1M").unwrap(), 1024 * 1024);
        assert!(parse_size("k").is_err());
        assert!(size_u32("8G").is_err());
    }

    #[test]
    fn test_profile_to_workorder() {
        let profile = parse_profile_string(STREAM).unwrap();
        assert_eq!(profile.options.goodbye_timeout_ms, 5000);
        assert_eq!(profile.options.port, 20000);

        let w = profile.to_workorder().unwrap();
        assert_eq!(w.name, "tcp-stream");
        assert_eq!(w.num_strands(), 4);
        assert_eq!(w.remote_hosts(), vec!["10.0.0.2".to_string()]);

        let g = &w.groups[0];
        assert_eq!(g.kind, StrandKind::Thread);
        assert_eq!(g.txns.len(), 3);
        assert_eq!(g.txns[0].mode(), TxnMode::Iterations(1));
        assert_eq!(
            g.txns[1].mode(),
            TxnMode::Rate {
                duration: Duration::from_secs(30),
                per_sec: 100
            }
        );
        assert_eq!(g.txns[1].flowops[0].options.size, 65536);
        assert!(g.txns[1].flowops[1].options.flag.think_busy());
        assert_eq!(g.txns[1].flowops[1].options.duration, 1_000_000);
    }

    #[test]
    fn test_nprocs_and_random_size() {
        let profile = parse_profile_string(
            r#"
name = "rr"
[[group]]
nprocs = 2
[[group.transaction]]
iterations = 10
[[group.transaction.flowop]]
type = "read"
conn = 3
rand_size = "1k-4k"
canfail = true
"#,
        )
        .unwrap();
        let w = profile.to_workorder().unwrap();
        let g = &w.groups[0];
        assert_eq!(g.name, "group0");
        assert_eq!(g.kind, StrandKind::Process);
        let f = &g.txns[0].flowops[0];
        assert_eq!(f.connection_id, 3);
        assert!(f.options.flag.random_size());
        assert!(f.options.flag.can_fail());
        assert_eq!((f.options.rand_sz_min, f.options.rand_sz_max), (1024, 4096));
    }

    #[test]
    fn test_invalid_profiles() {
        let both = r#"
name = "x"
[[group]]
nthreads = 1
nprocs = 1
[[group.transaction]]
[[group.transaction.flowop]]
type = "nop"
"#;
        let err = parse_profile_string(both).unwrap().to_workorder().unwrap_err();
        assert!(format!("{:#}", err).contains("either nthreads or nprocs"));

        let rate_only = r#"
name = "x"
[[group]]
[[group.transaction]]
rate = 10
[[group.transaction.flowop]]
type = "nop"
"#;
        assert!(parse_profile_string(rate_only).unwrap().to_workorder().is_err());
    }

    #[test]
    fn test_parse_profile_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(STREAM.as_bytes()).unwrap();
        let profile = parse_profile_file(file.path()).unwrap();
        assert_eq!(profile.groups.len(), 1);

        let missing = file.path().with_extension("missing");
        assert!(parse_profile_file(&missing).is_err());
    }
}
