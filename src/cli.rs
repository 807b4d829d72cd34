/// Command line interface of benchbox
use crate::cgroup::{self, parse_int_list};
use crate::config::ExecutorConfig;
use crate::executor::RunExecutor;
use crate::namespace::NamespaceIsolation;
use crate::registry::RunRegistry;
use crate::seccomp;
use crate::types::{ContainerConfig, DirMode, Run, RunResult, RunState, StdinSource};
use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "benchbox")]
#[command(about = "Reliable resource measurement and isolation of benchmark runs", long_about = None)]
pub struct Cli {
    /// Log debug output
    #[arg(long, global = true)]
    pub debug: bool,

    /// JSON file with executor settings
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute one command with resource limits and measure it
    Run(RunArgs),

    /// Report which kernel features are usable for measurements and containers
    CheckCgroups,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Command and its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,

    /// Hard CPU time limit, e.g. 10s or 2min
    #[arg(long = "timelimit", value_parser = parse_time_value)]
    pub cpu_time_hard: Option<Duration>,

    /// Soft CPU time limit; the tool receives SIGTERM when it is reached
    #[arg(long = "softtimelimit", value_parser = parse_time_value)]
    pub cpu_time_soft: Option<Duration>,

    /// Wall time limit
    #[arg(long = "walltimelimit", value_parser = parse_time_value)]
    pub wall_time: Option<Duration>,

    /// Memory limit, e.g. 1000000 or 512MB
    #[arg(long = "memlimit", value_parser = parse_memory_value)]
    pub memory: Option<u64>,

    /// CPU cores to use, e.g. 0-3,8
    #[arg(long)]
    pub cores: Option<String>,

    /// NUMA memory nodes to use, e.g. 0
    #[arg(long = "memory-nodes")]
    pub memory_nodes: Option<String>,

    /// Maximum number of tasks in the run
    #[arg(long = "max-processes")]
    pub max_processes: Option<u64>,

    /// Maximum number of files written in the container
    #[arg(long = "files-count")]
    pub files_count: Option<u64>,

    /// Maximum size of files written in the container
    #[arg(long = "files-size", value_parser = parse_memory_value)]
    pub files_size: Option<u64>,

    /// Standard input of the tool (default /dev/null)
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// File receiving standard output and error of the tool
    #[arg(long, default_value = "output.log")]
    pub output: PathBuf,

    /// Working directory of the tool
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Start from an empty environment and keep only these host variables
    #[arg(long = "keep-env", value_name = "VAR")]
    pub keep_env: Vec<String>,

    /// Set an environment variable: --set-env VAR=VALUE
    #[arg(long = "set-env", value_name = "VAR=VALUE")]
    pub set_env: Vec<String>,

    /// Append to an environment variable: --append-env VAR=SUFFIX
    #[arg(long = "append-env", value_name = "VAR=SUFFIX")]
    pub append_env: Vec<String>,

    /// Remove an environment variable
    #[arg(long = "unset-env", value_name = "VAR")]
    pub unset_env: Vec<String>,

    /// Run the tool in a container
    #[arg(long)]
    pub container: bool,

    /// Hide a directory in the container
    #[arg(long = "hidden-dir")]
    pub hidden_dirs: Vec<PathBuf>,

    /// Make a directory read-only in the container
    #[arg(long = "read-only-dir")]
    pub read_only_dirs: Vec<PathBuf>,

    /// Redirect writes to a directory into the container
    #[arg(long = "overlay-dir")]
    pub overlay_dirs: Vec<PathBuf>,

    /// Give the tool write access to a directory of the host
    #[arg(long = "full-access-dir")]
    pub full_access_dirs: Vec<PathBuf>,

    /// Keep network access in the container
    #[arg(long = "network-access")]
    pub network_access: bool,

    /// Keep user, hostname and /etc files of the host
    #[arg(long = "keep-system-config")]
    pub keep_system_config: bool,

    /// Keep writable layers on disk instead of in memory
    #[arg(long = "no-tmpfs")]
    pub no_tmpfs: bool,

    /// Pattern of files written in the container to keep after the run
    #[arg(long = "result-files", value_name = "PATTERN")]
    pub result_files: Vec<String>,

    /// Directory receiving retrieved result files
    #[arg(long = "output-directory", default_value = "output.files")]
    pub output_directory: PathBuf,

    /// Fail instead of degrading when a limit cannot be enforced
    #[arg(long)]
    pub strict: bool,

    /// Shrink the output file to about this size
    #[arg(long = "max-output-size", value_parser = parse_memory_value)]
    pub max_output_size: Option<u64>,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Parse `10`, `10s`, `1.5min` or `2h` into a duration
pub fn parse_time_value(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| format!("Invalid time value {:?}", value))?;
    let factor = match unit.trim() {
        "" | "s" => 1.0,
        "min" => 60.0,
        "h" => 3600.0,
        other => return Err(format!("Unknown time unit {:?}", other)),
    };
    Duration::try_from_secs_f64(number * factor).map_err(|e| e.to_string())
}

/// Parse a byte count with an optional SI suffix (B, kB, MB, GB, TB)
pub fn parse_memory_value(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: u64 = number
        .parse()
        .map_err(|_| format!("Invalid memory value {:?}", value))?;
    let factor: u64 = match unit.trim() {
        "" | "B" => 1,
        "kB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "TB" => 1_000_000_000_000,
        other => return Err(format!("Unknown memory unit {:?}", other)),
    };
    number
        .checked_mul(factor)
        .ok_or_else(|| format!("Memory value {:?} is too large", value))
}

fn parse_assignment(value: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = value
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid environment assignment {:?}, expected VAR=VALUE", value))?;
    Ok((key.to_string(), value.to_string()))
}

fn parse_set(list: Option<&str>) -> anyhow::Result<Option<BTreeSet<usize>>> {
    list.map(|list| parse_int_list(list).with_context(|| format!("Invalid list {:?}", list)))
        .transpose()
}

impl RunArgs {
    /// Turn the command line into a run description
    pub fn to_run(&self) -> anyhow::Result<Run> {
        let mut run = Run::new(self.command.iter().cloned(), self.output.clone());
        run.working_dir = self.dir.clone();
        if let Some(input) = &self.input {
            run.stdin = StdinSource::File(input.clone());
        }

        run.limits.cpu_time_hard = self.cpu_time_hard;
        run.limits.cpu_time_soft = self.cpu_time_soft;
        run.limits.wall_time = self.wall_time;
        run.limits.memory = self.memory;
        run.limits.cores = parse_set(self.cores.as_deref())?;
        run.limits.memory_nodes = parse_set(self.memory_nodes.as_deref())?;
        run.limits.max_processes = self.max_processes;
        run.limits.files_count = self.files_count;
        run.limits.files_size = self.files_size;

        run.environment.keep = self.keep_env.iter().cloned().collect();
        for assignment in &self.set_env {
            let (key, value) = parse_assignment(assignment)?;
            run.environment.set.insert(key, value);
        }
        for assignment in &self.append_env {
            let (key, value) = parse_assignment(assignment)?;
            run.environment.append.insert(key, value);
        }
        run.environment.remove = self.unset_env.iter().cloned().collect();

        let has_dir_rules = !(self.hidden_dirs.is_empty()
            && self.read_only_dirs.is_empty()
            && self.overlay_dirs.is_empty()
            && self.full_access_dirs.is_empty());
        if !self.container {
            if has_dir_rules || !self.result_files.is_empty() {
                bail!("Directory modes and result files require --container");
            }
            return Ok(run);
        }

        let mut container = ContainerConfig {
            network_access: self.network_access,
            system_config: !self.keep_system_config,
            use_tmpfs: !self.no_tmpfs,
            result_files: self.result_files.clone(),
            output_dir: self.output_directory.clone(),
            ..ContainerConfig::default()
        };
        for (dirs, mode) in [
            (&self.hidden_dirs, DirMode::Hidden),
            (&self.read_only_dirs, DirMode::ReadOnly),
            (&self.overlay_dirs, DirMode::Overlay),
            (&self.full_access_dirs, DirMode::FullAccess),
        ] {
            for dir in dirs {
                container.dir_rules.insert(dir.clone(), mode);
            }
        }
        run.container = Some(container);
        Ok(run)
    }
}

/// Human readable `key=value` report, one measurement per line
pub fn format_report(result: &RunResult) -> String {
    let mut lines = vec![format!("starttime={}", result.started_at.to_rfc3339())];
    if let Some(code) = result.exit.code {
        lines.push(format!("returnvalue={}", code));
    }
    if let Some(signal) = result.exit.signal {
        lines.push(format!("exitsignal={}", signal));
    }
    lines.push(format!("walltime={:.6}s", result.usage.wall_time));
    lines.push(format!("cputime={:.6}s", result.usage.cpu_time));
    for (core, time) in &result.usage.cpu_time_per_core {
        lines.push(format!("cputime-cpu{}={:.6}s", core, time));
    }
    if let Some(memory) = result.usage.memory_peak {
        lines.push(format!("memory={}B", memory));
    }
    if let Some(read) = result.usage.io_read_bytes {
        lines.push(format!("blkio-read={}B", read));
    }
    if let Some(written) = result.usage.io_write_bytes {
        lines.push(format!("blkio-write={}B", written));
    }
    if let Some(energy) = result.usage.energy {
        lines.push(format!("cpuenergy={:.6}J", energy));
    }
    if let Some(reason) = result.termination_reason {
        lines.push(format!("terminationreason={}", reason));
    }
    if let Some(error) = &result.setup_error {
        lines.push(format!("setuperror={}", error));
    }
    for file in &result.result_files {
        lines.push(format!("resultfile={}", file.display()));
    }
    lines.join("\n")
}

fn load_config(cli: &Cli) -> anyhow::Result<ExecutorConfig> {
    match &cli.config {
        Some(path) => ExecutorConfig::load(path)
            .with_context(|| format!("Cannot load configuration {}", path.display())),
        None => Ok(ExecutorConfig::default()),
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    // before any thread exists, so that only the handler thread sees the signals
    let registry = RunRegistry::global();
    registry
        .install_signal_handler()
        .context("Cannot install signal handler")?;

    let mut config = load_config(&cli)?;
    match &cli.command {
        Commands::Run(args) => {
            config.strict_mode |= args.strict;
            if args.max_output_size.is_some() {
                config.max_output_size = args.max_output_size;
            }
            let run = args.to_run()?;
            let executor = RunExecutor::new(config).context("Cannot set up measurements")?;
            let result = executor
                .execute(&run)
                .with_context(|| format!("Executing {} failed", run.args.join(" ")))?;

            if args.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", format_report(&result));
            }
            for warning in &result.warnings {
                eprintln!("Warning: {}", warning);
            }
            if result.state == RunState::SetupFailed {
                std::process::exit(1);
            }
        }

        Commands::CheckCgroups => {
            println!("benchbox system check");
            println!("=====================");

            match cgroup::detect(&config) {
                Ok(backend) => {
                    println!("Cgroups: {}", backend.version());
                    let controllers: Vec<String> =
                        backend.controllers().iter().map(|c| c.to_string()).collect();
                    println!("Controllers: {}", controllers.join(" "));
                    for degradation in backend.degradations() {
                        println!("Degraded: {}", degradation);
                    }
                    match backend.allowed_cpus() {
                        Ok(cpus) => println!("Allowed CPUs: {}", cgroup::format_int_list(&cpus)),
                        Err(e) => println!("Allowed CPUs: unknown ({})", e),
                    }
                    match backend.allowed_memory_nodes() {
                        Ok(nodes) => {
                            println!("Allowed memory nodes: {}", cgroup::format_int_list(&nodes))
                        }
                        Err(e) => println!("Allowed memory nodes: unknown ({})", e),
                    }
                }
                Err(e) => println!("Cgroups: not usable ({})", e),
            }

            println!(
                "Seccomp: {}",
                if seccomp::is_available() {
                    "available"
                } else {
                    "not available"
                }
            );
            println!("User namespaces: {}", NamespaceIsolation::is_supported());
            println!("Swap: {}", if crate::system::has_swap() { "enabled" } else { "disabled" });
        }
    }

    Ok(())
}
