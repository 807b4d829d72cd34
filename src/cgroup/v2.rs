/// Unified cgroup hierarchy: one directory per scope with delegated controllers
use super::probe::{self, Mounts, OwnCgroups};
use super::{
    cgroup_tree, format_int_list, new_scope_name, parse_int_list, parse_key_values, read_pids,
    read_value, remove_cgroup_dir, write_value, CgroupBackend, CgroupVersion, Controller,
    LimitOutcome, ResourceLimit, RetryPolicy, Scope, Usage,
};
use crate::types::{BenchError, Result};
use nix::unistd::Pid;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct UnifiedBackend {
    parent: PathBuf,
    controllers: BTreeSet<Controller>,
    degradations: Vec<String>,
    policy: RetryPolicy,
}

impl UnifiedBackend {
    pub fn new(mounts: &Mounts, own: &OwnCgroups, policy: RetryPolicy) -> Result<Self> {
        let mount = mounts
            .v2
            .as_ref()
            .ok_or_else(|| BenchError::Cgroup("cgroup2 is not mounted".to_string()))?;
        let own_path = own.v2.as_deref().unwrap_or("/");
        let preferred = probe::join_cgroup_path(mount, own_path);
        let fallback = mount.join(probe::FALLBACK_V2);

        let parent = if probe::is_writable_dir(&preferred) {
            preferred
        } else if probe::is_writable_dir(&fallback) {
            log::debug!(
                "Cannot use cgroup {}, falling back to {}",
                preferred.display(),
                fallback.display()
            );
            fallback
        } else {
            return Err(BenchError::Cgroup(format!(
                "No permission to create cgroups in {} or {}",
                preferred.display(),
                fallback.display()
            )));
        };

        let mut degradations = Vec::new();
        let enabled = Self::delegate_controllers(&parent, &mut degradations)?;

        // cpu.stat with usage_usec exists in every non-root cgroup
        let mut controllers: BTreeSet<Controller> = Controller::ALL
            .into_iter()
            .filter(|c| c.v2_name().map_or(false, |name| enabled.contains(name)))
            .collect();
        controllers.insert(Controller::Cpu);
        // cgroup.freeze since Linux 5.2, checked per scope
        controllers.insert(Controller::Freezer);

        for controller in [Controller::Memory, Controller::Cpuset, Controller::Io, Controller::Pids]
        {
            if !controllers.contains(&controller) {
                degradations.push(format!(
                    "Cgroup controller {} is not delegated to {}, its measurements and limits are unavailable.",
                    controller.v2_name().unwrap_or("?"),
                    parent.display()
                ));
            }
        }
        for message in &degradations {
            log::warn!("{}", message);
        }

        Ok(Self {
            parent,
            controllers,
            degradations,
            policy,
        })
    }

    /// Enable all available controllers for children of `parent`.
    ///
    /// The kernel refuses this while `parent` itself holds processes. If we are
    /// the only process there, we move ourselves into a leaf child first.
    fn delegate_controllers(parent: &Path, degradations: &mut Vec<String>) -> Result<BTreeSet<String>> {
        let available: BTreeSet<String> = read_value(&parent.join("cgroup.controllers"))?
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let wanted: Vec<&str> = ["cpu", "cpuset", "memory", "io", "pids"]
            .into_iter()
            .filter(|name| available.contains(*name))
            .collect();

        let subtree = parent.join("cgroup.subtree_control");
        let request = wanted
            .iter()
            .map(|name| format!("+{}", name))
            .collect::<Vec<_>>()
            .join(" ");

        if !request.is_empty() && write_value(&subtree, &request).is_err() {
            let procs = read_pids(&parent.join("cgroup.procs"))?;
            let me = Pid::this();
            if procs == [me] {
                let leaf = parent.join(format!("benchbox_main_{}", me));
                fs::create_dir_all(&leaf)?;
                write_value(&leaf.join("cgroup.procs"), &me.to_string())?;
                if let Err(e) = write_value(&subtree, &request) {
                    degradations.push(format!(
                        "Could not delegate cgroup controllers to children of {}: {}",
                        parent.display(),
                        e
                    ));
                }
            } else {
                degradations.push(format!(
                    "Cgroup {} contains other processes, cannot delegate controllers to runs.",
                    parent.display()
                ));
            }
        }

        Ok(read_value(&subtree)?
            .split_whitespace()
            .map(str::to_string)
            .collect())
    }

    fn dir(scope: &Scope) -> Result<&Path> {
        scope
            .path(Controller::Cpu)
            .ok_or_else(|| BenchError::Cgroup(format!("Scope {} has no directory", scope.name())))
    }

    fn read_io_stat(dir: &Path) -> (Option<u64>, Option<u64>) {
        let Ok(content) = read_value(&dir.join("io.stat")) else {
            return (None, None);
        };
        let (mut read, mut write) = (0u64, 0u64);
        for line in content.lines() {
            // "8:0 rbytes=1 wbytes=2 rios=3 ..."
            for field in line.split_whitespace().skip(1) {
                if let Some((key, value)) = field.split_once('=') {
                    let value = value.parse::<u64>().unwrap_or(0);
                    match key {
                        "rbytes" => read += value,
                        "wbytes" => write += value,
                        _ => {}
                    }
                }
            }
        }
        (Some(read), Some(write))
    }

    fn allowed_cpuset(&self, file: &str) -> Result<BTreeSet<usize>> {
        let effective = self.parent.join(format!("{}.effective", file));
        if effective.exists() {
            return parse_int_list(&read_value(&effective)?);
        }
        Err(BenchError::Unsupported(format!(
            "{} is not available in {}",
            file,
            self.parent.display()
        )))
    }
}

impl CgroupBackend for UnifiedBackend {
    fn version(&self) -> CgroupVersion {
        CgroupVersion::V2
    }

    fn controllers(&self) -> &BTreeSet<Controller> {
        &self.controllers
    }

    fn degradations(&self) -> &[String] {
        &self.degradations
    }

    fn create_scope(&self) -> Result<Scope> {
        let name = new_scope_name();
        let dir = self.parent.join(&name);
        fs::create_dir(&dir).map_err(|e| {
            BenchError::Cgroup(format!("Failed to create cgroup {}: {}", dir.display(), e))
        })?;

        let mut paths = BTreeMap::new();
        for controller in &self.controllers {
            if *controller == Controller::Freezer && !dir.join("cgroup.freeze").exists() {
                continue;
            }
            paths.insert(*controller, dir.clone());
        }
        let scope = Scope::new(name, CgroupVersion::V2, paths);
        log::debug!("Created cgroup scope {}", dir.display());
        Ok(scope)
    }

    fn enter(&self, scope: &Scope, pid: Pid) -> Result<()> {
        write_value(&Self::dir(scope)?.join("cgroup.procs"), &pid.to_string())
    }

    fn membership_files(&self, scope: &Scope) -> Vec<PathBuf> {
        scope
            .dirs()
            .into_iter()
            .map(|dir| dir.join("cgroup.procs"))
            .collect()
    }

    fn set_limit(&self, scope: &Scope, limit: &ResourceLimit) -> Result<LimitOutcome> {
        let controller = limit.controller();
        let Some(dir) = scope.path(controller) else {
            return Ok(LimitOutcome::Unsupported(format!(
                "cgroup controller {} is not delegated",
                controller.v2_name().unwrap_or("?")
            )));
        };

        match limit {
            ResourceLimit::Memory(bytes) => {
                write_value(&dir.join("memory.max"), &bytes.to_string())?;
                let swap = dir.join("memory.swap.max");
                if swap.exists() {
                    write_value(&swap, "0")?;
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
        let stat = parse_key_values(&read_value(&Self::dir(scope)?.join("cpu.stat"))?);
        Ok(stat
            .get("usage_usec")
            .and_then(|value| value.parse::<u64>().ok())
            .map(|usec| usec as f64 / 1_000_000.0))
    }

    fn read_usage(&self, scope: &Scope) -> Result<Usage> {
        let dir = Self::dir(scope)?;
        let mut usage = Usage {
            cpu_time: self.read_cpu_time(scope)?,
            ..Usage::default()
        };
        if scope.has(Controller::Memory) {
            usage.memory_current = read_value(&dir.join("memory.current"))
                .ok()
                .and_then(|value| value.parse().ok());
            // memory.peak since Linux 5.19
            usage.memory_peak = read_value(&dir.join("memory.peak"))
                .ok()
                .and_then(|value| value.parse().ok());
        }
        if scope.has(Controller::Io) {
            let (read, write) = Self::read_io_stat(dir);
            usage.io_read_bytes = read;
            usage.io_write_bytes = write;
        }
        Ok(usage)
    }

    fn oom_kill_count(&self, scope: &Scope) -> Result<u64> {
        if !scope.has(Controller::Memory) {
            return Ok(0);
        }
        let events = parse_key_values(&read_value(&Self::dir(scope)?.join("memory.events"))?);
        Ok(events
            .get("oom_kill")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    fn allowed_cpus(&self) -> Result<BTreeSet<usize>> {
        self.allowed_cpuset("cpuset.cpus")
    }

    fn allowed_memory_nodes(&self) -> Result<BTreeSet<usize>> {
        self.allowed_cpuset("cpuset.mems")
    }

    fn tasks(&self, scope: &Scope) -> Result<Vec<Pid>> {
        let mut pids = BTreeSet::new();
        for cgroup in cgroup_tree(Self::dir(scope)?) {
            pids.extend(read_pids(&cgroup.join("cgroup.procs"))?);
        }
        Ok(pids.into_iter().collect())
    }

    fn kill_atomically(&self, scope: &Scope) -> Result<bool> {
        let kill = Self::dir(scope)?.join("cgroup.kill");
        // cgroup.kill since Linux 5.14
        if !kill.exists() {
            return Ok(false);
        }
        write_value(&kill, "1")?;
        Ok(true)
    }

    fn set_frozen(&self, scope: &Scope, frozen: bool) -> Result<bool> {
        let Some(dir) = scope.path(Controller::Freezer) else {
            return Ok(false);
        };
        write_value(&dir.join("cgroup.freeze"), if frozen { "1" } else { "0" })?;
        if frozen {
            for _ in 0..1000 {
                let events = parse_key_values(&read_value(&dir.join("cgroup.events"))?);
                if events.get("frozen").map(String::as_str) == Some("1") {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }
        Ok(true)
    }

    fn destroy_scope(&self, scope: &Scope) -> Result<()> {
        remove_cgroup_dir(Self::dir(scope)?, self.policy)?;
        log::debug!("Removed cgroup scope {}", scope.name());
        Ok(())
    }
}
