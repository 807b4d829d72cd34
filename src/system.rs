/// Host conditions that make measurements unreliable, and energy counters
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

const CPU_SYSFS: &str = "/sys/devices/system/cpu";
const POWERCAP_SYSFS: &str = "/sys/class/powercap";

fn read_number(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Detects thermal throttling of the cores a run used
#[derive(Debug)]
pub struct ThrottleCheck {
    counters: BTreeMap<PathBuf, u64>,
}

impl ThrottleCheck {
    /// Snapshot the throttle counters; `None` means all cores
    pub fn new(cores: Option<&BTreeSet<usize>>) -> Self {
        Self::with_root(Path::new(CPU_SYSFS), cores)
    }

    pub fn with_root(root: &Path, cores: Option<&BTreeSet<usize>>) -> Self {
        let mut counters = BTreeMap::new();
        let Ok(entries) = fs::read_dir(root) else {
            return Self { counters };
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(cpu) = name.strip_prefix("cpu").and_then(|n| n.parse::<usize>().ok()) else {
                continue;
            };
            if cores.is_some_and(|cores| !cores.contains(&cpu)) {
                continue;
            }
            let Ok(files) = fs::read_dir(entry.path().join("thermal_throttle")) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                let is_counter = path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().ends_with("_throttle_count"));
                if let (true, Some(value)) = (is_counter, read_number(&path)) {
                    counters.insert(path, value);
                }
            }
        }
        Self { counters }
    }

    pub fn has_throttled(&self) -> bool {
        self.counters
            .iter()
            .any(|(path, before)| read_number(path).is_some_and(|now| now > *before))
    }
}

fn swap_activity(vmstat: &str) -> u64 {
    vmstat
        .lines()
        .filter_map(|line| line.split_once(' '))
        .filter(|(key, _)| *key == "pswpin" || *key == "pswpout")
        .filter_map(|(_, value)| value.trim().parse::<u64>().ok())
        .sum()
}

/// Detects swapping of the whole system during a run
#[derive(Debug)]
pub struct SwapCheck {
    swapped_pages: Option<u64>,
}

impl SwapCheck {
    pub fn new() -> Self {
        Self {
            swapped_pages: Self::read(),
        }
    }

    fn read() -> Option<u64> {
        fs::read_to_string("/proc/vmstat").ok().map(|s| swap_activity(&s))
    }

    pub fn has_swapped(&self) -> bool {
        match (self.swapped_pages, Self::read()) {
            (Some(before), Some(now)) => now > before,
            _ => false,
        }
    }
}

impl Default for SwapCheck {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the machine has any swap space configured
pub fn has_swap() -> bool {
    let Ok(meminfo) = fs::read_to_string("/proc/meminfo") else {
        return false;
    };
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("SwapTotal:"))
        .and_then(|value| value.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .is_some_and(|kb| kb > 0)
}

#[derive(Clone, Debug)]
struct EnergyZone {
    counter: PathBuf,
    /// Value at which the counter wraps around
    range: Option<u64>,
    start: u64,
}

/// Energy of the CPU packages from the RAPL powercap interface
#[derive(Debug)]
pub struct EnergyMeter {
    zones: Vec<EnergyZone>,
}

impl EnergyMeter {
    pub fn start() -> Self {
        Self::start_at(Path::new(POWERCAP_SYSFS))
    }

    pub fn start_at(root: &Path) -> Self {
        let mut zones = Vec::new();
        if let Ok(entries) = fs::read_dir(root) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                // package zones only; sub-zones (intel-rapl:0:0) are part of them
                let is_package = name
                    .strip_prefix("intel-rapl:")
                    .is_some_and(|rest| !rest.contains(':'));
                if !is_package {
                    continue;
                }
                let counter = entry.path().join("energy_uj");
                if let Some(start) = read_number(&counter) {
                    zones.push(EnergyZone {
                        range: read_number(&entry.path().join("max_energy_range_uj")),
                        counter,
                        start,
                    });
                }
            }
        }
        if zones.is_empty() {
            log::debug!("No readable RAPL energy counters");
        }
        Self { zones }
    }

    /// Joules consumed since `start`
    pub fn finish(&self) -> Option<f64> {
        if self.zones.is_empty() {
            return None;
        }
        let mut micro_joules = 0u64;
        for zone in &self.zones {
            let now = read_number(&zone.counter)?;
            micro_joules += if now >= zone.start {
                now - zone.start
            } else {
                zone.range?.saturating_sub(zone.start) + now
            };
        }
        Some(micro_joules as f64 / 1_000_000.0)
    }
}
