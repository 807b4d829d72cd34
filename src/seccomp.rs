/// Syscall filter for contained tools
///
/// The filter is a deny-list: everything is allowed except a few syscalls that
/// reach state shared with the host, such as the kernel keyrings. Denied calls
/// fail with ENOSYS as if the kernel did not have them.
use crate::types::{BenchError, Result};
use seccompiler::{apply_filter, BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};
use std::collections::BTreeMap;
use std::convert::TryInto;

/// Syscalls the tool may not use
pub const BLOCKED_SYSCALLS: [(&str, libc::c_long); 3] = [
    ("add_key", libc::SYS_add_key),
    ("keyctl", libc::SYS_keyctl),
    ("request_key", libc::SYS_request_key),
];

/// Compiled filter, ready to be installed in the tool process
pub struct SyscallFilter {
    program: BpfProgram,
}

impl std::fmt::Debug for SyscallFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SyscallFilter({} instructions)", self.program.len())
    }
}

impl SyscallFilter {
    /// Compile the deny-list for the architecture we run on
    pub fn compile() -> Result<Self> {
        let arch: TargetArch = std::env::consts::ARCH
            .try_into()
            .map_err(|e| BenchError::Seccomp(format!("Unsupported architecture: {:?}", e)))?;

        let rules: BTreeMap<i64, Vec<SeccompRule>> = BLOCKED_SYSCALLS
            .iter()
            .map(|(_, number)| (*number as i64, Vec::new()))
            .collect();

        let filter = SeccompFilter::new(
            rules,
            SeccompAction::Allow,
            SeccompAction::Errno(libc::ENOSYS as u32),
            arch,
        )
        .map_err(|e| BenchError::Seccomp(format!("Failed to create filter: {}", e)))?;

        let program: BpfProgram = filter
            .try_into()
            .map_err(|e| BenchError::Seccomp(format!("Failed to compile filter: {}", e)))?;
        Ok(Self { program })
    }

    pub fn len(&self) -> usize {
        self.program.len()
    }

    pub fn is_empty(&self) -> bool {
        self.program.is_empty()
    }

    /// Install the filter for the calling thread. Requires no_new_privs or
    /// CAP_SYS_ADMIN in the current user namespace.
    pub fn install(&self) -> Result<()> {
        apply_filter(&self.program)
            .map_err(|e| BenchError::Seccomp(format!("Failed to install filter: {}", e)))
    }
}

/// Whether the kernel supports seccomp filters
pub fn is_available() -> bool {
    // SAFETY: prctl with integer arguments only.
    let result = unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0 as libc::c_ulong) };
    result >= 0
}
