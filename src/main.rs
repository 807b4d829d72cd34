/// benchbox: reliable resource measurement and isolation of benchmark runs
///
/// Runs one command in its own cgroup, optionally inside a container with a
/// private view of the file system, enforces CPU time, wall time, memory and
/// file limits, and reports the measured resource usage.
///
/// # Usage
/// ```bash
/// benchbox run --timelimit 10s --memlimit 1GB -- ./tool input.c
/// benchbox run --container --result-files '*.log' -- ./tool
/// benchbox check-cgroups
/// ```
use anyhow::Result;

fn main() -> Result<()> {
    if !cfg!(target_os = "linux") {
        eprintln!("Error: benchbox needs Linux cgroups and namespaces");
        std::process::exit(1);
    }
    benchbox::cli::run()
}
