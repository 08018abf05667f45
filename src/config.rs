use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::MAX_ESCALATE_AFTER_SECS;
use crate::model::{CrowdLevel, Severity, Zone};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneTuning {
    pub ceiling: u32,
    /// Largest per-tick random-walk move, in either direction.
    pub step: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneConfig {
    /// Indexed by `Zone::index()`.
    pub tuning: [ZoneTuning; 4],
    /// Share of checked-in members that leave the queue zone.
    pub queue_transfer_ratio: f64,
    /// Fixed seed for the simulator; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl ZoneConfig {
    pub fn tuning(&self, zone: Zone) -> ZoneTuning {
        self.tuning[zone.index()]
    }
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            tuning: [
                ZoneTuning { ceiling: 1800, step: 20 },
                ZoneTuning { ceiling: 2000, step: 30 },
                ZoneTuning { ceiling: 2500, step: 40 },
                ZoneTuning { ceiling: 1500, step: 25 },
            ],
            queue_transfer_ratio: 0.3,
            seed: None,
        }
    }
}

/// Density percentages above which a zone is reported at each level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrowdThresholds {
    pub critical: f64,
    pub high: f64,
    pub moderate: f64,
}

impl Default for CrowdThresholds {
    fn default() -> Self {
        Self {
            critical: 80.0,
            high: 60.0,
            moderate: 40.0,
        }
    }
}

impl CrowdThresholds {
    pub fn classify(&self, density: f64) -> CrowdLevel {
        if density > self.critical {
            CrowdLevel::Critical
        } else if density > self.high {
            CrowdLevel::High
        } else if density > self.moderate {
            CrowdLevel::Moderate
        } else {
            CrowdLevel::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Lower-cased incident location → responsible unit.
    pub incident_units: HashMap<String, String>,
    pub fallback_unit: String,
    /// Pending SOS cases older than this get their severity bumped.
    pub escalate_after: Duration,
    /// Default ETA in minutes, indexed low, medium, high, critical.
    pub eta_minutes: [u32; 4],
}

impl DispatchConfig {
    pub fn unit_for(&self, location: &str) -> &str {
        self.incident_units
            .get(&location.trim().to_lowercase())
            .map(String::as_str)
            .unwrap_or(&self.fallback_unit)
    }

    pub fn default_eta(&self, severity: Severity) -> u32 {
        let idx = match severity {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        };
        self.eta_minutes[idx]
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let incident_units = [
            ("gate a", "Unit-Alpha"),
            ("gate b", "Unit-Bravo"),
            ("gate c", "Unit-Charlie"),
            ("main temple", "Unit-Delta"),
            ("queue complex", "Unit-Echo"),
            ("parking", "Unit-Foxtrot"),
        ]
        .into_iter()
        .map(|(loc, unit)| (loc.to_string(), unit.to_string()))
        .collect();
        Self {
            incident_units,
            fallback_unit: "Unit-Dispatch".into(),
            escalate_after: Duration::from_secs(300),
            eta_minutes: [20, 12, 8, 5],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlatformConfig {
    /// WAL directory; `None` runs with a volatile store.
    pub data_dir: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub tick_interval: Duration,
    pub sweep_interval: Duration,
    pub compact_threshold: u64,
    pub zones: ZoneConfig,
    pub crowd: CrowdThresholds,
    pub dispatch: DispatchConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            metrics_port: None,
            tick_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(30),
            compact_threshold: 1000,
            zones: ZoneConfig::default(),
            crowd: CrowdThresholds::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl PlatformConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset or unparsable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
            lookup(name).and_then(|s| s.trim().parse().ok())
        }

        let mut config = Self::default();
        config.data_dir = lookup("DARSHAN_DATA_DIR").map(PathBuf::from);
        config.metrics_port = parsed(&lookup, "DARSHAN_METRICS_PORT");
        if let Some(ms) = parsed::<u64>(&lookup, "DARSHAN_TICK_MS") {
            config.tick_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(secs) = parsed::<u64>(&lookup, "DARSHAN_SWEEP_SECS") {
            config.sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = parsed(&lookup, "DARSHAN_COMPACT_THRESHOLD") {
            config.compact_threshold = n;
        }
        config.zones.seed = parsed(&lookup, "DARSHAN_ZONE_SEED");
        if let Some(ratio) = parsed::<f64>(&lookup, "DARSHAN_QUEUE_TRANSFER_RATIO")
            && (0.0..=1.0).contains(&ratio)
        {
            config.zones.queue_transfer_ratio = ratio;
        }
        if let Some(secs) = parsed::<u64>(&lookup, "DARSHAN_ESCALATE_AFTER_SECS") {
            config.dispatch.escalate_after =
                Duration::from_secs(secs.clamp(1, MAX_ESCALATE_AFTER_SECS));
        }
        if let Some(unit) = lookup("DARSHAN_FALLBACK_UNIT").filter(|u| !u.trim().is_empty()) {
            config.dispatch.fallback_unit = unit.trim().to_string();
        }
        if let Some(raw) = lookup("DARSHAN_INCIDENT_UNITS") {
            match serde_json::from_str::<HashMap<String, String>>(&raw) {
                Ok(map) => {
                    config.dispatch.incident_units = map
                        .into_iter()
                        .map(|(loc, unit)| (loc.trim().to_lowercase(), unit))
                        .collect();
                }
                Err(e) => tracing::warn!("ignoring DARSHAN_INCIDENT_UNITS: {e}"),
            }
        }
        config
    }
}
