/// Namespace creation and privilege handling for containerized runs
use crate::types::{BenchError, Result};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{getgid, getuid, Pid};
use std::fs;
use std::io;
use std::path::Path;

/// Identity used inside the container when the system identity is virtualized
pub const CONTAINER_UID: u32 = 1000;
pub const CONTAINER_GID: u32 = 1000;
pub const CONTAINER_USER: &str = "benchexec";
pub const CONTAINER_HOSTNAME: &str = "benchexec";
pub const CONTAINER_HOME: &str = "/home/benchexec";

/// Who the tool is inside its user namespace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerIdentity {
    pub uid: u32,
    pub gid: u32,
    pub user: String,
    pub home: String,
    /// `None` keeps the host name of the machine
    pub hostname: Option<String>,
}

impl ContainerIdentity {
    /// The synthetic `benchexec` user, or root when the host identity is kept
    pub fn new(system_config: bool) -> Self {
        if system_config {
            Self {
                uid: CONTAINER_UID,
                gid: CONTAINER_GID,
                user: CONTAINER_USER.to_string(),
                home: CONTAINER_HOME.to_string(),
                hostname: Some(CONTAINER_HOSTNAME.to_string()),
            }
        } else {
            Self {
                uid: 0,
                gid: 0,
                user: "root".to_string(),
                home: "/root".to_string(),
                hostname: None,
            }
        }
    }
}

/// Namespace setup of one container
#[derive(Clone, Debug)]
pub struct NamespaceIsolation {
    network_access: bool,
    identity: ContainerIdentity,
}

impl NamespaceIsolation {
    pub fn new(network_access: bool, identity: ContainerIdentity) -> Self {
        Self {
            network_access,
            identity,
        }
    }

    pub fn identity(&self) -> &ContainerIdentity {
        &self.identity
    }

    /// Namespaces every container gets, plus a network namespace unless the
    /// tool may use the host network
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::CLONE_NEWUSER
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC;
        if !self.network_access {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        flags
    }

    pub fn has_network_namespace(&self) -> bool {
        !self.network_access
    }

    /// Create the namespaces for the calling process. Children forked
    /// afterwards live in the new PID namespace.
    pub fn unshare(&self) -> Result<()> {
        unshare(self.clone_flags())
            .map_err(|e| BenchError::Namespace(format!("Failed to create namespaces: {}", e)))
    }

    /// Map the invoking user to the container identity in the user namespace of `pid`
    pub fn write_id_maps(&self, pid: Pid) -> Result<()> {
        let proc_dir = Path::new("/proc").join(pid.as_raw().to_string());
        let write = |file: &str, content: String| -> Result<()> {
            fs::write(proc_dir.join(file), &content).map_err(|e| {
                BenchError::Namespace(format!("Failed to write {} of {}: {}", file, pid, e))
            })
        };
        // setgroups must be denied before an unprivileged gid_map write
        match fs::write(proc_dir.join("setgroups"), "deny") {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(BenchError::Namespace(format!(
                    "Failed to deny setgroups for {}: {}",
                    pid, e
                )))
            }
        }
        write(
            "uid_map",
            format!("{} {} 1\n", self.identity.uid, getuid().as_raw()),
        )?;
        write(
            "gid_map",
            format!("{} {} 1\n", self.identity.gid, getgid().as_raw()),
        )
    }

    /// Hostname and loopback device, run inside the new namespaces
    pub fn configure_inside(&self) -> Result<()> {
        if let Some(hostname) = &self.identity.hostname {
            nix::unistd::sethostname(hostname).map_err(|e| {
                BenchError::Namespace(format!("Failed to set hostname: {}", e))
            })?;
        }
        if self.has_network_namespace() {
            bring_up_loopback()?;
        }
        Ok(())
    }

    /// Whether this system lets unprivileged users create user namespaces
    pub fn is_supported() -> NamespaceSupport {
        let check = |path: &str, disabled: &str| {
            fs::read_to_string(path)
                .ok()
                .filter(|value| value.trim() == disabled)
                .map(|_| format!("{} is {}", path, disabled))
        };
        let reason = if !Path::new("/proc/self/ns/user").exists() {
            Some("Kernel lacks user namespace support".to_string())
        } else {
            check("/proc/sys/kernel/unprivileged_userns_clone", "0")
                .or_else(|| check("/proc/sys/user/max_user_namespaces", "0"))
                .or_else(|| check("/proc/sys/kernel/apparmor_restrict_unprivileged_userns", "1"))
        };
        NamespaceSupport {
            user_namespaces: reason.is_none(),
            reason,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceSupport {
    pub user_namespaces: bool,
    /// Why user namespaces are unusable
    pub reason: Option<String>,
}

impl std::fmt::Display for NamespaceSupport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            None => write!(f, "available"),
            Some(reason) => write!(f, "unavailable ({})", reason),
        }
    }
}

#[repr(C)]
struct InterfaceRequest {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// A fresh network namespace has `lo` down
pub fn bring_up_loopback() -> Result<()> {
    // SAFETY: plain socket creation; the descriptor is closed below.
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if sock < 0 {
        return Err(BenchError::Namespace(format!(
            "Failed to open socket for loopback setup: {}",
            io::Error::last_os_error()
        )));
    }

    let mut request = InterfaceRequest {
        name: [0; libc::IFNAMSIZ],
        flags: 0,
        _pad: [0; 22],
    };
    for (dst, src) in request.name.iter_mut().zip(b"lo".iter()) {
        *dst = *src as libc::c_char;
    }

    // SAFETY: `request` has the layout of `struct ifreq` for the flag ioctls.
    let result = unsafe {
        if libc::ioctl(sock, libc::SIOCGIFFLAGS as _, &mut request) < 0 {
            -1
        } else {
            request.flags |= libc::IFF_UP as libc::c_short;
            libc::ioctl(sock, libc::SIOCSIFFLAGS as _, &request)
        }
    };
    let error = io::Error::last_os_error();
    // SAFETY: sock is a valid descriptor we own.
    unsafe { libc::close(sock) };

    if result < 0 {
        return Err(BenchError::Namespace(format!(
            "Failed to bring up loopback interface: {}",
            error
        )));
    }
    Ok(())
}

#[repr(C)]
struct CapHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

/// prctl reads unused arguments as full-width zeros
const ZERO: libc::c_ulong = 0;

/// Drop every capability from the bounding set and the current sets.
///
/// Called in the tool process right before exec, after all mounts are done.
pub fn drop_capabilities() -> Result<()> {
    let last_cap = fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ok()
        .and_then(|value| value.trim().parse::<libc::c_ulong>().ok())
        .unwrap_or(40);
    for cap in 0..=last_cap {
        // SAFETY: prctl with integer arguments only.
        let result = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap, ZERO, ZERO, ZERO) };
        if result != 0 {
            let error = io::Error::last_os_error();
            // capabilities newer than the running kernel
            if error.raw_os_error() != Some(libc::EINVAL) {
                return Err(BenchError::Namespace(format!(
                    "Failed to drop capability {} from bounding set: {}",
                    cap, error
                )));
            }
        }
    }

    let header = CapHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = [CapData::default(); 2];
    // SAFETY: header and data match the kernel ABI of capset v3.
    let result = unsafe { libc::syscall(libc::SYS_capset, &header, data.as_ptr()) };
    if result != 0 {
        return Err(BenchError::Namespace(format!(
            "Failed to clear capabilities: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

pub fn set_no_new_privileges() -> Result<()> {
    // SAFETY: prctl with integer arguments only.
    let result = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1 as libc::c_ulong, ZERO, ZERO, ZERO) };
    if result != 0 {
        return Err(BenchError::Namespace(format!(
            "Failed to set no_new_privs: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Make the kernel kill the calling process when its parent dies
pub fn die_with_parent() -> Result<()> {
    // SAFETY: prctl with integer arguments only.
    let result = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, ZERO, ZERO, ZERO) };
    if result != 0 {
        return Err(BenchError::Namespace(format!(
            "Failed to set parent death signal: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_flags() {
        let isolated = NamespaceIsolation::new(false, ContainerIdentity::new(true));
        assert!(isolated.clone_flags().contains(CloneFlags::CLONE_NEWNET));
        assert!(isolated.clone_flags().contains(CloneFlags::CLONE_NEWUSER));

        let networked = NamespaceIsolation::new(true, ContainerIdentity::new(true));
        assert!(!networked.clone_flags().contains(CloneFlags::CLONE_NEWNET));
        assert!(networked.clone_flags().contains(CloneFlags::CLONE_NEWPID));
    }

    #[test]
    fn test_identity() {
        let virtual_identity = ContainerIdentity::new(true);
        assert_eq!(virtual_identity.uid, CONTAINER_UID);
        assert_eq!(virtual_identity.hostname.as_deref(), Some("benchexec"));
        assert_eq!(virtual_identity.home, "/home/benchexec");

        let host_identity = ContainerIdentity::new(false);
        assert_eq!(host_identity.uid, 0);
        assert!(host_identity.hostname.is_none());
    }

    #[test]
    fn test_interface_request_layout() {
        assert_eq!(std::mem::size_of::<InterfaceRequest>(), 40);
    }

    #[test]
    fn test_support_report_is_consistent() {
        let support = NamespaceIsolation::is_supported();
        assert_eq!(support.user_namespaces, support.reason.is_none());
    }
}
