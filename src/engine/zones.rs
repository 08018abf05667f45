use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::{now_ms, update_entity, EngineError};
use crate::config::{CrowdThresholds, ZoneConfig};
use crate::model::{CrowdLevel, Kind, Zone, ZoneStats, ZONE_STATS_KEY};
use crate::observability::{ZONE_OCCUPANCY, ZONE_TICKS_TOTAL};
use crate::store::{fetch, swap, EntityStore};

/// Partial overwrite of the zone counters; `None` leaves a zone untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZonePatch {
    pub gate: Option<u32>,
    pub queue: Option<u32>,
    pub inner: Option<u32>,
    pub exit: Option<u32>,
}

impl ZonePatch {
    fn get(&self, zone: Zone) -> Option<u32> {
        match zone {
            Zone::Gate => self.gate,
            Zone::Queue => self.queue,
            Zone::Inner => self.inner,
            Zone::Exit => self.exit,
        }
    }
}

/// Live headcounts per zone. One record, many writers: every change is a
/// read-check-write on the singleton, and counts stay within `[0, ceiling]`.
pub struct ZoneOccupancyEngine {
    store: Arc<dyn EntityStore>,
    config: ZoneConfig,
    crowd: CrowdThresholds,
    rng: Mutex<StdRng>,
}

impl ZoneOccupancyEngine {
    pub fn new(store: Arc<dyn EntityStore>, config: ZoneConfig, crowd: CrowdThresholds) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            store,
            config,
            crowd,
            rng: Mutex::new(rng),
        }
    }

    /// Current counts. The record is created (all zeros) on first read.
    pub async fn get(&self) -> Result<ZoneStats, EngineError> {
        let store = self.store.as_ref();
        if let Some(stats) = fetch::<ZoneStats>(store, ZONE_STATS_KEY).await? {
            return Ok(stats);
        }
        let initial = ZoneStats {
            updated_at: now_ms(),
            ..ZoneStats::default()
        };
        if swap(store, None, &initial).await? {
            return Ok(initial);
        }
        // lost the race to create it
        fetch::<ZoneStats>(store, ZONE_STATS_KEY)
            .await?
            .ok_or_else(|| EngineError::not_found(Kind::ZoneStats, ZONE_STATS_KEY))
    }

    /// One simulator step: every zone moves by a bounded random delta.
    pub async fn tick(&self) -> Result<ZoneStats, EngineError> {
        let deltas = self.draw_deltas();
        let now = now_ms();
        let stats = self
            .update(|current| {
                let mut next = *current;
                for zone in Zone::ALL {
                    let ceiling = i64::from(self.config.tuning(zone).ceiling);
                    let moved = i64::from(current.get(zone)) + deltas[zone.index()];
                    next.set(zone, moved.clamp(0, ceiling) as u32);
                }
                next.updated_at = now;
                Ok(next)
            })
            .await?;
        metrics::counter!(ZONE_TICKS_TOTAL).increment(1);
        debug!(
            "zone tick: gate={} queue={} inner={} exit={}",
            stats.gate, stats.queue, stats.inner, stats.exit
        );
        Ok(stats)
    }

    /// A checked-in party enters the gate zone and pulls a share of the queue along.
    pub async fn apply_check_in_transfer(&self, members: u32) -> Result<ZoneStats, EngineError> {
        let gate_ceiling = self.config.tuning(Zone::Gate).ceiling;
        let leaving = (f64::from(members) * self.config.queue_transfer_ratio).floor() as u32;
        let now = now_ms();
        self.update(|current| {
            Ok(ZoneStats {
                gate: current.gate.saturating_add(members).min(gate_ceiling),
                queue: current.queue.saturating_sub(leaving),
                updated_at: now,
                ..*current
            })
        })
        .await
    }

    /// Operator override. Values above a zone's ceiling are rejected.
    pub async fn set(&self, patch: ZonePatch) -> Result<ZoneStats, EngineError> {
        for zone in Zone::ALL {
            let ceiling = self.config.tuning(zone).ceiling;
            if let Some(value) = patch.get(zone)
                && value > ceiling
            {
                return Err(EngineError::validation(format!(
                    "{} = {value} exceeds ceiling {ceiling}",
                    zone.key()
                )));
            }
        }
        let now = now_ms();
        self.update(|current| {
            let mut next = *current;
            for zone in Zone::ALL {
                if let Some(value) = patch.get(zone) {
                    next.set(zone, value);
                }
            }
            next.updated_at = now;
            Ok(next)
        })
        .await
    }

    pub fn crowd_level(&self, density: f64) -> CrowdLevel {
        self.crowd.classify(density)
    }

    async fn update<F>(&self, next: F) -> Result<ZoneStats, EngineError>
    where
        F: FnMut(&ZoneStats) -> Result<ZoneStats, EngineError> + Send,
    {
        self.get().await?;
        let stats = update_entity(self.store.as_ref(), ZONE_STATS_KEY, next).await?;
        for zone in Zone::ALL {
            metrics::gauge!(ZONE_OCCUPANCY, "zone" => zone.key()).set(f64::from(stats.get(zone)));
        }
        Ok(stats)
    }

    fn draw_deltas(&self) -> [i64; 4] {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        Zone::ALL.map(|zone| {
            let step = i64::from(self.config.tuning(zone).step);
            rng.gen_range(-step..=step)
        })
    }
}
