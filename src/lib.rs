//! benchbox: resource measurement and isolation of benchmark runs on Linux
//!
//! The pieces, bottom-up: a cgroup adapter with one backend per kernel API,
//! a watchdog enforcing limits over a cgroup scope, a process-tree killer,
//! a container builder (namespaces, mount tree, handshake, result retrieval),
//! and the run executor that ties them together. The run registry routes
//! termination signals of the program to all in-flight runs.

pub mod cgroup;
pub mod cli;
pub mod config;
pub mod container;
pub mod cpu_alloc;
pub mod executor;
pub mod files_limit;
pub mod filesystem;
pub mod ipc;
pub mod killer;
pub mod namespace;
pub mod oom;
pub mod process;
pub mod registry;
pub mod resource_limits;
pub mod retrieval;
pub mod seccomp;
pub mod system;
pub mod types;
pub mod watchdog;

pub use config::ExecutorConfig;
pub use cpu_alloc::{CoreAllocator, CoreLease};
pub use executor::RunExecutor;
pub use registry::RunRegistry;
pub use types::{
    BenchError, ContainerConfig, DirMode, Limits, Result, Run, RunResult, RunState,
    TerminationReason,
};
