/// Discovery of cgroup mount points and of the cgroups this process lives in
use super::CgroupVersion;
use crate::types::{BenchError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Parent used when we may not create cgroups below our own one
pub const FALLBACK_V1: &str = "system.slice/benchexec-cgroup.service";
pub const FALLBACK_V2: &str = "system.slice/benchexec-cgroup.service/benchexec_root";

/// Mounted cgroup hierarchies
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mounts {
    /// v1 controller (and named hierarchy) to mount point
    pub v1: BTreeMap<String, PathBuf>,
    /// Mount point of the unified hierarchy
    pub v2: Option<PathBuf>,
}

/// Paths of our own cgroups, relative to the hierarchy roots
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OwnCgroups {
    pub v1: BTreeMap<String, String>,
    pub v2: Option<String>,
}

pub fn read_mounts(root_override: Option<&Path>) -> Result<Mounts> {
    let content = fs::read_to_string("/proc/mounts")
        .map_err(|e| BenchError::Cgroup(format!("Failed to read /proc/mounts: {}", e)))?;
    let mut mounts = parse_mounts(&content);

    if let Some(root) = root_override {
        // keep the kinds of hierarchies the system has, but below another root
        for (name, mount) in mounts.v1.iter_mut() {
            let leaf = mount
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(name));
            *mount = root.join(leaf);
        }
        if mounts.v2.is_some() || mounts.v1.is_empty() {
            mounts.v2 = Some(root.to_path_buf());
        }
    }
    Ok(mounts)
}

pub fn read_own_cgroups() -> Result<OwnCgroups> {
    let content = fs::read_to_string("/proc/self/cgroup")
        .map_err(|e| BenchError::Cgroup(format!("Failed to read /proc/self/cgroup: {}", e)))?;
    Ok(parse_proc_cgroup(&content))
}

/// Parse /proc/mounts, keeping cgroup and cgroup2 entries
pub fn parse_mounts(content: &str) -> Mounts {
    let mut mounts = Mounts::default();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let mountpoint = PathBuf::from(unescape_mount_path(fields[1]));
        match fields[2] {
            "cgroup2" => {
                mounts.v2.get_or_insert(mountpoint);
            }
            "cgroup" => {
                for option in fields[3].split(',') {
                    if is_mount_option(option) {
                        continue;
                    }
                    mounts
                        .v1
                        .entry(option.to_string())
                        .or_insert_with(|| mountpoint.clone());
                }
            }
            _ => {}
        }
    }
    mounts
}

fn is_mount_option(option: &str) -> bool {
    matches!(
        option,
        "rw" | "ro" | "nosuid" | "nodev" | "noexec" | "relatime" | "noatime" | "clone_children"
    ) || option.starts_with("name=")
        || option.starts_with("release_agent=")
        || option.starts_with("xattr")
}

/// Parse lines "hierarchy-id:controller-list:path" of /proc/self/cgroup
pub fn parse_proc_cgroup(content: &str) -> OwnCgroups {
    let mut own = OwnCgroups::default();
    for line in content.lines() {
        let mut parts = line.splitn(3, ':');
        let (Some(id), Some(controllers), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if id == "0" && controllers.is_empty() {
            own.v2 = Some(path.to_string());
            continue;
        }
        for controller in controllers.split(',').filter(|c| !c.starts_with("name=")) {
            own.v1.insert(controller.to_string(), path.to_string());
        }
    }
    own
}

/// v2 when we are exclusively in the unified hierarchy, v1 when any
/// v1 controller hierarchy is mounted and we are a member of it
pub fn select_version(mounts: &Mounts, own: &OwnCgroups) -> Option<CgroupVersion> {
    let has_v1 = own.v1.keys().any(|controller| mounts.v1.contains_key(controller));
    if has_v1 {
        Some(CgroupVersion::V1)
    } else if mounts.v2.is_some() && own.v2.is_some() {
        Some(CgroupVersion::V2)
    } else if !mounts.v1.is_empty() {
        Some(CgroupVersion::V1)
    } else if mounts.v2.is_some() {
        Some(CgroupVersion::V2)
    } else {
        None
    }
}

/// Join a hierarchy root with an absolute cgroup path from /proc/self/cgroup
pub fn join_cgroup_path(mount: &Path, cgroup: &str) -> PathBuf {
    mount.join(cgroup.trim_start_matches('/'))
}

/// Whether we can create cgroups below `dir`
pub fn is_writable_dir(dir: &Path) -> bool {
    dir.is_dir()
        && nix::unistd::access(dir, nix::unistd::AccessFlags::W_OK | nix::unistd::AccessFlags::X_OK)
            .is_ok()
}

/// /proc/mounts escapes spaces and a few other bytes as octal sequences
pub(crate) fn unescape_mount_path(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let octal = std::str::from_utf8(&bytes[i + 1..i + 4]).ok();
            if let Some(value) = octal.and_then(|o| u8::from_str_radix(o, 8).ok()) {
                result.push(value);
                i += 4;
                continue;
            }
        }
        result.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&result).into_owned()
}
