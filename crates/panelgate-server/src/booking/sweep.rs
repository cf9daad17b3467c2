//! Sweep-line peak demand over half-open time intervals.

use panelgate_core::config::CapacityConfig;

use crate::error::ResourceDimension;

/// Resource amounts along every bookable dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resources {
    pub cpu_cores: i64,
    pub ram_gb: i64,
    pub gpu_ram_gb: i64,
}

impl Resources {
    const fn get(&self, dim: ResourceDimension) -> i64 {
        match dim {
            ResourceDimension::Cpu => self.cpu_cores,
            ResourceDimension::Ram => self.ram_gb,
            ResourceDimension::GpuRam => self.gpu_ram_gb,
        }
    }

    const fn add(&mut self, other: &Self, sign: i64) {
        self.cpu_cores += sign * other.cpu_cores;
        self.ram_gb += sign * other.ram_gb;
        self.gpu_ram_gb += sign * other.gpu_ram_gb;
    }
}

impl From<&CapacityConfig> for Resources {
    fn from(c: &CapacityConfig) -> Self {
        Self {
            cpu_cores: c.cpu_cores,
            ram_gb: c.ram_gb,
            gpu_ram_gb: c.gpu_ram_gb,
        }
    }
}

/// Dimensions in the order they are checked and reported.
const DIMENSIONS: [ResourceDimension; 3] = [
    ResourceDimension::Cpu,
    ResourceDimension::Ram,
    ResourceDimension::GpuRam,
];

/// Demand held over `[start, end)`.
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    pub start: i64,
    pub end: i64,
    pub demand: Resources,
}

/// First point where the summed demand exceeds capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Violation {
    pub dimension: ResourceDimension,
    pub at: i64,
    pub requested: i64,
    pub capacity: i64,
}

/// Return the earliest capacity violation caused by adding `proposed` over
/// `[start, end)` on top of `existing`.
///
/// Existing intervals are clipped to the window. Events are ordered by time
/// with ends before starts, so touching intervals never overlap, and the
/// running sums are checked after every start.
pub fn first_violation(
    capacity: Resources,
    start: i64,
    end: i64,
    proposed: Resources,
    existing: impl IntoIterator<Item = Interval>,
) -> Option<Violation> {
    // (time, is_start, demand); `false < true` puts ends first on ties.
    let mut events: Vec<(i64, bool, Resources)> = vec![(start, true, proposed), (end, false, proposed)];
    for iv in existing {
        let s = iv.start.max(start);
        let e = iv.end.min(end);
        if s < e {
            events.push((s, true, iv.demand));
            events.push((e, false, iv.demand));
        }
    }
    events.sort_by_key(|(time, is_start, _)| (*time, *is_start));

    let mut load = Resources::default();
    for (time, is_start, demand) in events {
        if !is_start {
            load.add(&demand, -1);
            continue;
        }
        load.add(&demand, 1);
        for dim in DIMENSIONS {
            if load.get(dim) > capacity.get(dim) {
                return Some(Violation {
                    dimension: dim,
                    at: time,
                    requested: load.get(dim),
                    capacity: capacity.get(dim),
                });
            }
        }
    }
    None
}
