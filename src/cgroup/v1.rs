/// Legacy cgroup hierarchies: one directory per controller, kept in lockstep
use super::probe::{self, Mounts, OwnCgroups};
use super::{
    cgroup_tree, format_int_list, new_scope_name, parse_int_list, parse_key_values, read_pids,
    read_u64, read_value, remove_cgroup_dir, write_value, CgroupBackend, CgroupVersion,
    Controller, LimitOutcome, ResourceLimit, RetryPolicy, Scope, Usage,
};
use crate::types::{BenchError, Result};
use nix::unistd::Pid;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Kernel clock ticks per second used by cpuacct.stat
const USER_HZ: f64 = 100.0;

#[derive(Debug)]
pub struct LegacyBackend {
    /// Parent directory for new scopes, per controller
    parents: BTreeMap<Controller, PathBuf>,
    controllers: BTreeSet<Controller>,
    degradations: Vec<String>,
    policy: RetryPolicy,
}

impl LegacyBackend {
    pub fn new(mounts: &Mounts, own: &OwnCgroups, policy: RetryPolicy) -> Result<Self> {
        let mut parents = BTreeMap::new();
        let mut degradations = Vec::new();

        for controller in Controller::ALL {
            let name = controller.v1_name();
            let Some(mount) = mounts.v1.get(name) else {
                degradations.push(format!(
                    "Cgroup controller {} is not mounted, its measurements and limits are unavailable.",
                    name
                ));
                continue;
            };
            let own_path = own.v1.get(name).map(String::as_str).unwrap_or("/");
            let preferred = probe::join_cgroup_path(mount, own_path);
            let fallback = mount.join(probe::FALLBACK_V1);

            if probe::is_writable_dir(&preferred) {
                parents.insert(controller, preferred);
            } else if probe::is_writable_dir(&fallback) {
                log::debug!(
                    "Cannot use cgroup {}, falling back to {}",
                    preferred.display(),
                    fallback.display()
                );
                parents.insert(controller, fallback);
            } else {
                degradations.push(format!(
                    "No permission to create cgroups for controller {} in {} or {}.",
                    name,
                    preferred.display(),
                    fallback.display()
                ));
            }
        }

        if parents.is_empty() {
            return Err(BenchError::Cgroup(
                "No usable cgroup v1 hierarchy found, check permissions of /sys/fs/cgroup"
                    .to_string(),
            ));
        }
        for message in &degradations {
            log::warn!("{}", message);
        }

        let controllers = parents.keys().copied().collect();
        Ok(Self {
            parents,
            controllers,
            degradations,
            policy,
        })
    }

    fn file(scope: &Scope, controller: Controller, name: &str) -> Option<PathBuf> {
        scope.path(controller).map(|dir| dir.join(name))
    }

    fn read_cpuacct_usage(dir: &Path) -> Result<Option<f64>> {
        let usage = dir.join("cpuacct.usage");
        if usage.exists() {
            let ns = read_u64(&usage)?;
            return Ok(Some(ns as f64 / 1_000_000_000.0));
        }
        let stat = dir.join("cpuacct.stat");
        if stat.exists() {
            let values = parse_key_values(&read_value(&stat)?);
            let ticks: u64 = ["user", "system"]
                .iter()
                .filter_map(|key| values.get(*key))
                .filter_map(|value| value.parse::<u64>().ok())
                .sum();
            return Ok(Some(ticks as f64 / USER_HZ));
        }
        Ok(None)
    }

    fn read_per_core(dir: &Path) -> BTreeMap<usize, f64> {
        let Ok(content) = read_value(&dir.join("cpuacct.usage_percpu")) else {
            return BTreeMap::new();
        };
        content
            .split_whitespace()
            .filter_map(|value| value.parse::<u64>().ok())
            .enumerate()
            .filter(|(_, ns)| *ns > 0)
            .map(|(core, ns)| (core, ns as f64 / 1_000_000_000.0))
            .collect()
    }

    fn read_memory_peak(dir: &Path) -> Result<Option<u64>> {
        for name in ["memory.memsw.max_usage_in_bytes", "memory.max_usage_in_bytes"] {
            let file = dir.join(name);
            if !file.exists() {
                continue;
            }
            match read_u64(&file) {
                Ok(value) => return Ok(Some(value)),
                // swap accounting disabled in the kernel makes the memsw file unreadable
                Err(e) if name.contains("memsw") => {
                    log::debug!("Ignoring {}: {}", name, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn read_blkio(dir: &Path) -> (Option<u64>, Option<u64>) {
        let Ok(content) = read_value(&dir.join("blkio.throttle.io_service_bytes")) else {
            return (None, None);
        };
        let (mut read, mut write) = (0u64, 0u64);
        for line in content.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 3 {
                continue;
            }
            let value = fields[2].parse::<u64>().unwrap_or(0);
            match fields[1] {
                "Read" => read += value,
                "Write" => write += value,
                _ => {}
            }
        }
        (Some(read), Some(write))
    }

    fn copy_from_parent(&self, dir: &Path, file: &str) -> Result<()> {
        if let Some(parent) = self.parents.get(&Controller::Cpuset) {
            let value = read_value(&parent.join(file))?;
            write_value(&dir.join(file), &value)?;
        }
        Ok(())
    }

    fn allowed_cpuset_value(&self, file: &str) -> Result<BTreeSet<usize>> {
        match self.parents.get(&Controller::Cpuset) {
            Some(parent) => parse_int_list(&read_value(&parent.join(file))?),
            None => Err(BenchError::Unsupported(
                "cpuset controller is not available".to_string(),
            )),
        }
    }
}

impl CgroupBackend for LegacyBackend {
    fn version(&self) -> CgroupVersion {
        CgroupVersion::V1
    }

    fn controllers(&self) -> &BTreeSet<Controller> {
        &self.controllers
    }

    fn degradations(&self) -> &[String] {
        &self.degradations
    }

    fn create_scope(&self) -> Result<Scope> {
        let name = new_scope_name();
        let mut paths = BTreeMap::new();

        for (controller, parent) in &self.parents {
            let dir = parent.join(&name);
            // one path may serve several controllers (e.g. cpu,cpuacct)
            let shared = paths.values().any(|created: &PathBuf| *created == dir);
            if !shared {
                if let Err(e) = fs::create_dir(&dir) {
                    log::warn!(
                        "Could not create cgroup {} for controller {}: {}",
                        dir.display(),
                        controller,
                        e
                    );
                    continue;
                }
            }
            paths.insert(*controller, dir);
        }

        if paths.is_empty() {
            return Err(BenchError::Cgroup(format!(
                "Could not create cgroup {} in any hierarchy",
                name
            )));
        }

        let scope = Scope::new(name, CgroupVersion::V1, paths);

        if let Some(dir) = scope.path(Controller::Cpuset) {
            // new cpusets start empty and would refuse tasks
            let copied = self
                .copy_from_parent(dir, "cpuset.cpus")
                .and_then(|()| self.copy_from_parent(dir, "cpuset.mems"));
            if let Err(e) = copied {
                for created in scope.dirs() {
                    if let Err(cleanup) = remove_cgroup_dir(created, self.policy) {
                        log::warn!("Could not remove cgroup {}: {}", created.display(), cleanup);
                    }
                }
                return Err(e);
            }
        }

        log::debug!("Created cgroup scope {} in {:?}", scope.name(), scope.dirs());
        Ok(scope)
    }

    fn enter(&self, scope: &Scope, pid: Pid) -> Result<()> {
        for dir in scope.dirs() {
            write_value(&dir.join("tasks"), &pid.to_string())?;
        }
        Ok(())
    }

    fn membership_files(&self, scope: &Scope) -> Vec<PathBuf> {
        scope.dirs().into_iter().map(|dir| dir.join("tasks")).collect()
    }

    fn set_limit(&self, scope: &Scope, limit: &ResourceLimit) -> Result<LimitOutcome> {
        let controller = limit.controller();
        let Some(dir) = scope.path(controller) else {
            return Ok(LimitOutcome::Unsupported(format!(
                "cgroup controller {} is not available",
                controller
            )));
        };

        match limit {
            ResourceLimit::Memory(bytes) => {
                let value = bytes.to_string();
                write_value(&dir.join("memory.limit_in_bytes"), &value)?;
                let memsw = dir.join("memory.memsw.limit_in_bytes");
                if memsw.exists() {
                    write_value(&memsw, &value)?;
                } else {
                    log::warn!(
                        "Kernel does not account swap, memory limit of {} bytes only covers RAM.",
                        bytes
                    );
                }
                let swappiness = dir.join("memory.swappiness");
                if swappiness.exists() {
                    if let Err(e) = write_value(&swappiness, "0") {
                        log::debug!("Could not disable swapping for {}: {}", scope.name(), e);
                    }
                }
            }
            ResourceLimit::Cores(cores) => {
                write_value(&dir.join("cpuset.cpus"), &format_int_list(cores))?;
            }
            ResourceLimit::MemoryNodes(nodes) => {
                write_value(&dir.join("cpuset.mems"), &format_int_list(nodes))?;
            }
            ResourceLimit::Processes(max) => {
                write_value(&dir.join("pids.max"), &max.to_string())?;
            }
        }
        Ok(LimitOutcome::Applied)
    }

    fn read_cpu_time(&self, scope: &Scope) -> Result<Option<f64>> {
        match scope.path(Controller::Cpu) {
            Some(dir) => Self::read_cpuacct_usage(dir),
            None => Ok(None),
        }
    }

    fn read_usage(&self, scope: &Scope) -> Result<Usage> {
        let mut usage = Usage::default();
        if let Some(dir) = scope.path(Controller::Cpu) {
            usage.cpu_time = Self::read_cpuacct_usage(dir)?;
            usage.cpu_time_per_core = Self::read_per_core(dir);
        }
        if let Some(dir) = scope.path(Controller::Memory) {
            usage.memory_current = read_u64(&dir.join("memory.usage_in_bytes")).ok();
            usage.memory_peak = Self::read_memory_peak(dir)?;
        }
        if let Some(dir) = scope.path(Controller::Io) {
            let (read, write) = Self::read_blkio(dir);
            usage.io_read_bytes = read;
            usage.io_write_bytes = write;
        }
        Ok(usage)
    }

    fn oom_kill_count(&self, scope: &Scope) -> Result<u64> {
        let Some(file) = Self::file(scope, Controller::Memory, "memory.oom_control") else {
            return Ok(0);
        };
        let values = parse_key_values(&read_value(&file)?);
        // "oom_kill" exists since Linux 4.13
        Ok(values
            .get("oom_kill")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    fn allowed_cpus(&self) -> Result<BTreeSet<usize>> {
        self.allowed_cpuset_value("cpuset.cpus")
    }

    fn allowed_memory_nodes(&self) -> Result<BTreeSet<usize>> {
        self.allowed_cpuset_value("cpuset.mems")
    }

    fn tasks(&self, scope: &Scope) -> Result<Vec<Pid>> {
        let mut pids = BTreeSet::new();
        for dir in scope.dirs() {
            for cgroup in cgroup_tree(dir) {
                pids.extend(read_pids(&cgroup.join("tasks"))?);
            }
        }
        Ok(pids.into_iter().collect())
    }

    fn kill_atomically(&self, _scope: &Scope) -> Result<bool> {
        Ok(false)
    }

    fn set_frozen(&self, scope: &Scope, frozen: bool) -> Result<bool> {
        let Some(dir) = scope.path(Controller::Freezer) else {
            return Ok(false);
        };
        let state = if frozen { "FROZEN" } else { "THAWED" };
        let file = dir.join("freezer.state");
        if !file.exists() {
            return Ok(false);
        }
        write_value(&file, state)?;
        if frozen {
            // FREEZING is transient; wait until the kernel confirms
            for _ in 0..1000 {
                if read_value(&file)? == "FROZEN" {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }
        Ok(true)
    }

    fn destroy_scope(&self, scope: &Scope) -> Result<()> {
        let mut last_error = None;
        for dir in scope.dirs() {
            if let Err(e) = remove_cgroup_dir(dir, self.policy) {
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => {
                log::debug!("Removed cgroup scope {}", scope.name());
                Ok(())
            }
        }
    }
}
