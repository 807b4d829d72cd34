/// Assignment of CPU cores and memory banks to parallel runs
///
/// Every run gets its own set of cores. Runs do not share a physical core
/// (hyper-threading siblings stay together) and do not span several CPU
/// packages unless they need more cores than one package has.
use crate::cgroup::{parse_int_list, CgroupBackend};
use crate::types::{BenchError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

const CPU_SYSFS: &str = "/sys/devices/system/cpu";
const NODE_SYSFS: &str = "/sys/devices/system/node";

/// Core layout of the machine, restricted to the cores we may use
#[derive(Clone, Debug, PartialEq)]
pub struct Topology {
    pub cores: BTreeSet<usize>,
    pub cores_of_package: BTreeMap<usize, Vec<usize>>,
    /// Siblings of each core, including the core itself
    pub siblings_of_core: BTreeMap<usize, Vec<usize>>,
}

fn read_trimmed(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| BenchError::Config(format!("Cannot read {}: {}", path.display(), e)))
}

impl Topology {
    pub fn read(allowed: &BTreeSet<usize>) -> Result<Self> {
        Self::read_from(Path::new(CPU_SYSFS), allowed)
    }

    pub fn read_from(sysfs: &Path, allowed: &BTreeSet<usize>) -> Result<Self> {
        let mut cores_of_package: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut siblings_of_core = BTreeMap::new();
        for &core in allowed {
            let topology = sysfs.join(format!("cpu{}/topology", core));
            let package = read_trimmed(&topology.join("physical_package_id"))?
                .parse::<usize>()
                .map_err(|e| BenchError::Config(format!("Invalid package id of core {}: {}", core, e)))?;
            cores_of_package.entry(package).or_default().push(core);
            let siblings = parse_int_list(&read_trimmed(&topology.join("thread_siblings_list"))?)?;
            siblings_of_core.insert(core, siblings.into_iter().collect());
        }
        log::debug!("Physical packages of cores are {:?}", cores_of_package);
        log::debug!("Siblings of cores are {:?}", siblings_of_core);
        Ok(Self {
            cores: allowed.clone(),
            cores_of_package,
            siblings_of_core,
        })
    }
}

/// Cores per run, plus warnings about a degraded assignment
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CoreAssignment {
    pub runs: Vec<BTreeSet<usize>>,
    pub warnings: Vec<String>,
}

fn uniform_size<'a, I>(groups: I, what: &str) -> Result<usize>
where
    I: IntoIterator<Item = (&'a usize, &'a Vec<usize>)>,
{
    let mut size = None;
    for (id, members) in groups {
        match size {
            None => size = Some(members.len()),
            Some(expected) if expected != members.len() => {
                return Err(BenchError::Config(format!(
                    "Asymmetric machine architecture not supported: {} {} has {} cores, others have {}",
                    what,
                    id,
                    members.len(),
                    expected
                )));
            }
            Some(_) => {}
        }
    }
    size.ok_or_else(|| BenchError::Config("No CPU cores available".to_string()))
}

/// Compute `runs` disjoint sets of `core_limit` cores each
pub fn assign_cores(topology: &Topology, core_limit: usize, runs: usize) -> Result<CoreAssignment> {
    let available = topology.cores.len();
    if core_limit == 0 || runs == 0 {
        return Err(BenchError::Config(
            "Core assignment needs at least one run with at least one core".to_string(),
        ));
    }
    if core_limit > available {
        return Err(BenchError::Config(format!(
            "Cannot run with {} CPU cores, only {} available",
            core_limit, available
        )));
    }
    if core_limit * runs > available {
        return Err(BenchError::Config(format!(
            "Cannot run {} runs in parallel with {} CPU cores each, only {} available. \
             Reduce the number of parallel runs to {}.",
            runs,
            core_limit,
            available,
            available / core_limit
        )));
    }

    let package_size = uniform_size(&topology.cores_of_package, "CPU package")?;
    let core_size = uniform_size(&topology.siblings_of_core, "CPU core")?;
    for (core, siblings) in &topology.siblings_of_core {
        let unusable: Vec<_> = siblings.iter().filter(|s| !topology.cores.contains(s)).collect();
        if !unusable.is_empty() {
            return Err(BenchError::Config(format!(
                "Siblings {:?} of core {} are not usable; make all virtual cores of a physical core available",
                unusable, core
            )));
        }
    }

    let package_count = topology.cores_of_package.len();
    let packages: Vec<usize> = topology.cores_of_package.keys().copied().collect();
    let limit_rounded_up = core_limit.div_ceil(core_size) * core_size;
    let packages_per_run = limit_rounded_up.div_ceil(package_size);
    if packages_per_run > 1 && packages_per_run * runs > package_count {
        return Err(BenchError::Config(format!(
            "Cannot split runs over several CPUs and put several runs on one CPU at the same time. \
             Reduce the number of parallel runs to {}.",
            package_count / packages_per_run
        )));
    }
    let runs_per_package = runs.div_ceil(package_count);
    if packages_per_run == 1 && runs_per_package * core_limit > package_size {
        return Err(BenchError::Config(format!(
            "Cannot run {} runs with {} cores on {} CPUs with {} cores without splitting runs across CPUs",
            runs, core_limit, package_count, package_size
        )));
    }

    let mut warnings = Vec::new();
    let need_hyper_threading_split = if packages_per_run == 1 {
        limit_rounded_up * runs_per_package > package_size
    } else {
        limit_rounded_up * runs > available
    };
    if need_hyper_threading_split {
        warnings.push(format!(
            "Too many parallel runs, hyper-threading siblings are split among runs, \
             which makes measurements unreliable. Reduce the number of parallel runs to {}.",
            if packages_per_run == 1 {
                (package_size / limit_rounded_up) * package_count
            } else {
                available / limit_rounded_up
            }
        ));
    }

    let mut remaining = topology.cores_of_package.clone();
    let mut used: BTreeSet<usize> = BTreeSet::new();
    let mut result = Vec::with_capacity(runs);
    for run in 0..runs {
        // spreads runs evenly across packages
        let start_package = (run * packages_per_run) % package_count;
        let mut cores: Vec<usize> = Vec::new();
        let mut cores_with_siblings = BTreeSet::new();
        for package_nr in start_package..start_package + packages_per_run {
            let package = *packages.get(package_nr).ok_or_else(|| {
                BenchError::Config("Runs do not fit onto the available CPU packages".to_string())
            })?;
            let package_cores = remaining.get(&package).cloned().unwrap_or_default();
            for core in package_cores {
                if !cores.contains(&core) {
                    if let Some(siblings) = topology.siblings_of_core.get(&core) {
                        cores.extend(siblings.iter().filter(|c| !used.contains(c)));
                    }
                }
                if cores.len() >= core_limit {
                    break;
                }
            }
            cores_with_siblings.extend(cores.iter().copied());
            cores.truncate(core_limit);
            if let Some(list) = remaining.get_mut(&package) {
                list.retain(|core| !cores.contains(core));
            }
        }

        if cores.len() != core_limit {
            return Err(BenchError::Config(format!(
                "Could only find {} of {} cores for run {}",
                cores.len(),
                core_limit,
                run + 1
            )));
        }
        if need_hyper_threading_split {
            used.extend(cores.iter().copied());
        } else {
            used.extend(cores_with_siblings);
        }
        result.push(cores.into_iter().collect::<BTreeSet<_>>());
    }

    log::debug!("Final core assignment: {:?}", result);
    Ok(CoreAssignment {
        runs: result,
        warnings,
    })
}

/// Memory banks listed as `node<N>` entries in a sysfs directory
fn banks_listed_in(dir: &Path) -> BTreeSet<usize> {
    let Ok(entries) = fs::read_dir(dir) else {
        return BTreeSet::new();
    };
    entries
        .flatten()
        .filter_map(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .strip_prefix("node")
                .and_then(|id| id.parse().ok())
        })
        .collect()
}

/// NUMA nodes local to the cores of each run. `None` on machines without NUMA.
pub fn memory_banks_per_run(
    assignment: &[BTreeSet<usize>],
    allowed_banks: &BTreeSet<usize>,
) -> Option<Vec<BTreeSet<usize>>> {
    memory_banks_from(Path::new(CPU_SYSFS), Path::new(NODE_SYSFS), assignment, allowed_banks)
}

pub fn memory_banks_from(
    cpu_sysfs: &Path,
    node_sysfs: &Path,
    assignment: &[BTreeSet<usize>],
    allowed_banks: &BTreeSet<usize>,
) -> Option<Vec<BTreeSet<usize>>> {
    let result: Vec<BTreeSet<usize>> = assignment
        .iter()
        .map(|cores| {
            let local: BTreeSet<usize> = cores
                .iter()
                .flat_map(|core| banks_listed_in(&cpu_sysfs.join(format!("cpu{}", core))))
                .collect();
            local.intersection(allowed_banks).copied().collect()
        })
        .collect();
    if result.iter().any(|banks| !banks.is_empty()) && node_sysfs.is_dir() {
        Some(result)
    } else {
        None
    }
}

/// Size of a memory bank in bytes from `node<N>/meminfo`
pub fn memory_bank_size(node_sysfs: &Path, bank: usize) -> Result<u64> {
    let path = node_sysfs.join(format!("node{}/meminfo", bank));
    let content = read_trimmed(&path)?;
    content
        .lines()
        .find(|line| line.contains("MemTotal"))
        .and_then(|line| line.split_once(':'))
        .and_then(|(_, size)| size.trim().strip_suffix(" kB"))
        .and_then(|kb| kb.trim().parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .ok_or_else(|| BenchError::Config(format!("No memory size in {}", path.display())))
}

/// Check that `runs` runs with `limit` bytes each fit onto their memory banks
pub fn check_memory_size(
    limit: u64,
    banks_per_run: &[BTreeSet<usize>],
    bank_size: impl Fn(usize) -> Result<u64>,
) -> Result<()> {
    let mut sizes = HashMap::new();
    let mut used: HashMap<Vec<usize>, u64> = HashMap::new();
    for banks in banks_per_run {
        let mut total = 0;
        for &bank in banks {
            if !sizes.contains_key(&bank) {
                sizes.insert(bank, bank_size(bank)?);
            }
            total += sizes.get(&bank).copied().unwrap_or(0);
        }
        if total < limit {
            return Err(BenchError::Config(format!(
                "Memory banks {:?} have only {} bytes, not enough for one run with {} bytes",
                banks, total, limit
            )));
        }
        let key: Vec<usize> = banks.iter().copied().collect();
        let entry = used.entry(key).or_insert(0);
        *entry += limit;
        if *entry > total {
            return Err(BenchError::Config(format!(
                "Memory banks {:?} have only {} bytes, not enough for all runs. \
                 Reduce the number of parallel runs.",
                banks, total
            )));
        }
    }
    Ok(())
}

/// Cores and memory banks of one parallel slot
#[derive(Clone, Debug, PartialEq)]
pub struct Slot {
    pub cores: BTreeSet<usize>,
    pub memory_nodes: Option<BTreeSet<usize>>,
}

#[derive(Debug)]
struct SlotTable {
    busy: Mutex<Vec<bool>>,
    freed: Condvar,
}

/// Hands out slots to concurrently executing runs. A run keeps its slot
/// for as long as it holds the lease.
#[derive(Clone, Debug)]
pub struct CoreAllocator {
    slots: Arc<Vec<Slot>>,
    table: Arc<SlotTable>,
    oversubscribe: bool,
    next: Arc<Mutex<usize>>,
}

impl CoreAllocator {
    pub fn new(slots: Vec<Slot>, oversubscribe: bool) -> Self {
        let busy = vec![false; slots.len()];
        Self {
            slots: Arc::new(slots),
            table: Arc::new(SlotTable {
                busy: Mutex::new(busy),
                freed: Condvar::new(),
            }),
            oversubscribe,
            next: Arc::new(Mutex::new(0)),
        }
    }

    /// Partition the cores this process may use into `runs` slots
    pub fn for_machine(
        backend: &dyn CgroupBackend,
        core_limit: usize,
        runs: usize,
        memory_limit: Option<u64>,
        oversubscribe: bool,
    ) -> Result<(Self, Vec<String>)> {
        let allowed = backend.allowed_cpus()?;
        let topology = Topology::read(&allowed)?;
        let assignment = assign_cores(&topology, core_limit, runs)?;
        let allowed_banks = backend.allowed_memory_nodes().unwrap_or_default();
        let banks = memory_banks_per_run(&assignment.runs, &allowed_banks);
        if let Some(limit) = memory_limit {
            let node_sysfs = PathBuf::from(NODE_SYSFS);
            if node_sysfs.is_dir() {
                let per_run = banks
                    .clone()
                    .unwrap_or_else(|| vec![allowed_banks.clone(); runs]);
                check_memory_size(limit, &per_run, |bank| memory_bank_size(&node_sysfs, bank))?;
            }
        }
        let slots = assignment
            .runs
            .iter()
            .enumerate()
            .map(|(i, cores)| Slot {
                cores: cores.clone(),
                memory_nodes: banks.as_ref().and_then(|b| b.get(i).cloned()),
            })
            .collect();
        Ok((Self::new(slots, oversubscribe), assignment.warnings))
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Block until a slot is free
    pub fn acquire(&self) -> Result<CoreLease> {
        if self.slots.is_empty() {
            return Err(BenchError::Config("Allocator has no slots".to_string()));
        }
        if self.oversubscribe {
            let mut next = self.next.lock().unwrap_or_else(|p| p.into_inner());
            let index = *next % self.slots.len();
            *next += 1;
            return Ok(self.lease(index, false));
        }
        let mut busy = self.table.busy.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(index) = busy.iter().position(|b| !*b) {
                busy[index] = true;
                return Ok(self.lease(index, true));
            }
            busy = self
                .table
                .freed
                .wait(busy)
                .unwrap_or_else(|p| p.into_inner());
        }
    }

    /// Like `acquire`, but `None` if every slot is taken
    pub fn try_acquire(&self) -> Option<CoreLease> {
        if self.oversubscribe {
            return self.acquire().ok();
        }
        let mut busy = self.table.busy.lock().unwrap_or_else(|p| p.into_inner());
        let index = busy.iter().position(|b| !*b)?;
        busy[index] = true;
        Some(self.lease(index, true))
    }

    fn lease(&self, index: usize, exclusive: bool) -> CoreLease {
        CoreLease {
            slot: self.slots[index].clone(),
            index,
            table: exclusive.then(|| Arc::clone(&self.table)),
        }
    }
}

/// Exclusive use of one slot, returned on drop
#[derive(Debug)]
pub struct CoreLease {
    slot: Slot,
    index: usize,
    table: Option<Arc<SlotTable>>,
}

impl CoreLease {
    pub fn cores(&self) -> &BTreeSet<usize> {
        &self.slot.cores
    }

    pub fn memory_nodes(&self) -> Option<&BTreeSet<usize>> {
        self.slot.memory_nodes.as_ref()
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for CoreLease {
    fn drop(&mut self) {
        if let Some(table) = &self.table {
            let mut busy = table.busy.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(entry) = busy.get_mut(self.index) {
                *entry = false;
            }
            table.freed.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// `packages` CPUs with `cores` physical cores and `threads` threads each,
    /// numbered the way Linux usually numbers them (siblings far apart)
    fn machine(packages: usize, cores: usize, threads: usize) -> Topology {
        let physical = packages * cores;
        let mut topology = Topology {
            cores: BTreeSet::new(),
            cores_of_package: BTreeMap::new(),
            siblings_of_core: BTreeMap::new(),
        };
        for thread in 0..threads {
            for package in 0..packages {
                for core in 0..cores {
                    let id = thread * physical + package * cores + core;
                    let siblings = (0..threads)
                        .map(|t| t * physical + package * cores + core)
                        .collect();
                    topology.cores.insert(id);
                    topology.cores_of_package.entry(package).or_default().push(id);
                    topology.siblings_of_core.insert(id, siblings);
                }
            }
        }
        for list in topology.cores_of_package.values_mut() {
            list.sort();
        }
        topology
    }

    fn sets(runs: &[&[usize]]) -> Vec<BTreeSet<usize>> {
        runs.iter().map(|r| r.iter().copied().collect()).collect()
    }

    #[test]
    fn test_single_package_without_hyper_threading() {
        let assignment = assign_cores(&machine(1, 8, 1), 2, 3).unwrap();
        assert_eq!(assignment.runs, sets(&[&[0, 1], &[2, 3], &[4, 5]]));
        assert!(assignment.warnings.is_empty());
    }

    #[test]
    fn test_hyper_threading_siblings_stay_together() {
        // quad core with HT: siblings (0,4) (1,5) (2,6) (3,7)
        let assignment = assign_cores(&machine(1, 4, 2), 2, 2).unwrap();
        assert_eq!(assignment.runs, sets(&[&[0, 4], &[1, 5]]));

        let assignment = assign_cores(&machine(1, 4, 2), 1, 4).unwrap();
        assert_eq!(assignment.runs, sets(&[&[0], &[1], &[2], &[3]]));
        assert!(assignment.warnings.is_empty());
    }

    #[test]
    fn test_too_many_runs_split_siblings() {
        let assignment = assign_cores(&machine(1, 2, 2), 1, 4).unwrap();
        assert_eq!(assignment.runs.len(), 4);
        assert_eq!(assignment.warnings.len(), 1);
    }

    #[test]
    fn test_runs_spread_across_packages() {
        let assignment = assign_cores(&machine(2, 4, 1), 2, 2).unwrap();
        assert_eq!(assignment.runs, sets(&[&[0, 1], &[4, 5]]));

        let assignment = assign_cores(&machine(2, 4, 1), 8, 1).unwrap();
        assert_eq!(assignment.runs[0].len(), 8);
    }

    #[test]
    fn test_assignments_are_disjoint() {
        let assignment = assign_cores(&machine(2, 8, 2), 3, 8).unwrap();
        let mut seen = BTreeSet::new();
        for run in &assignment.runs {
            assert_eq!(run.len(), 3);
            for core in run {
                assert!(seen.insert(*core), "core {} assigned twice", core);
            }
        }
    }

    #[test]
    fn test_impossible_requests() {
        assert!(assign_cores(&machine(1, 4, 1), 5, 1).is_err());
        assert!(assign_cores(&machine(1, 4, 1), 2, 3).is_err());
        assert!(assign_cores(&machine(2, 4, 1), 6, 2).is_err());

        let mut asymmetric = machine(2, 4, 1);
        asymmetric.cores_of_package.get_mut(&1).unwrap().pop();
        asymmetric.cores.remove(&7);
        asymmetric.siblings_of_core.remove(&7);
        assert!(assign_cores(&asymmetric, 1, 2).is_err());
    }

    #[test]
    fn test_read_topology_and_banks() {
        let cpu = tempfile::tempdir().unwrap();
        let node = tempfile::tempdir().unwrap();
        for (core, package, siblings) in [(0, 0, "0-1"), (1, 0, "0-1"), (2, 1, "2,3"), (3, 1, "2,3")] {
            let dir = cpu.path().join(format!("cpu{}", core));
            fs::create_dir_all(dir.join("topology")).unwrap();
            fs::write(dir.join("topology/physical_package_id"), format!("{}\n", package)).unwrap();
            fs::write(dir.join("topology/thread_siblings_list"), format!("{}\n", siblings)).unwrap();
            fs::create_dir_all(dir.join(format!("node{}", package))).unwrap();
        }
        let allowed: BTreeSet<usize> = (0..4).collect();
        let topology = Topology::read_from(cpu.path(), &allowed).unwrap();
        assert_eq!(topology.cores_of_package[&1], vec![2, 3]);
        assert_eq!(topology.siblings_of_core[&0], vec![0, 1]);

        let assignment = assign_cores(&topology, 2, 2).unwrap();
        let banks = memory_banks_from(cpu.path(), node.path(), &assignment.runs, &[0, 1].into_iter().collect());
        assert_eq!(banks, Some(sets(&[&[0], &[1]])));
    }

    #[test]
    fn test_memory_size_check() {
        let banks = sets(&[&[0], &[0]]);
        let size = |_: usize| -> Result<u64> { Ok(3 << 30) };
        assert!(check_memory_size(1 << 30, &banks, size).is_ok());
        assert!(check_memory_size(2 << 30, &banks, size).is_err());
        assert!(check_memory_size(4 << 30, &sets(&[&[0]]), size).is_err());
    }

    #[test]
    fn test_memory_bank_size() {
        let node = tempfile::tempdir().unwrap();
        fs::create_dir_all(node.path().join("node0")).unwrap();
        fs::write(
            node.path().join("node0/meminfo"),
            "Node 0 MemTotal:       16307440 kB\nNode 0 MemFree:         1000 kB\n",
        )
        .unwrap();
        assert_eq!(memory_bank_size(node.path(), 0).unwrap(), 16307440 * 1024);
        assert!(memory_bank_size(node.path(), 1).is_err());
    }

    #[test]
    fn test_leases_are_exclusive() {
        let allocator = CoreAllocator::new(
            vec![
                Slot { cores: [0].into_iter().collect(), memory_nodes: None },
                Slot { cores: [1].into_iter().collect(), memory_nodes: None },
            ],
            false,
        );
        let first = allocator.acquire().unwrap();
        let second = allocator.acquire().unwrap();
        assert!(first.cores().is_disjoint(second.cores()));
        assert!(allocator.try_acquire().is_none());

        let waiter = {
            let allocator = allocator.clone();
            std::thread::spawn(move || allocator.acquire().unwrap().index())
        };
        std::thread::sleep(Duration::from_millis(50));
        let released = first.index();
        drop(first);
        assert_eq!(waiter.join().unwrap(), released);
    }

    #[test]
    fn test_oversubscription_never_blocks() {
        let allocator = CoreAllocator::new(
            vec![Slot { cores: [0].into_iter().collect(), memory_nodes: None }],
            true,
        );
        let a = allocator.acquire().unwrap();
        let b = allocator.acquire().unwrap();
        assert_eq!(a.cores(), b.cores());
    }
}
