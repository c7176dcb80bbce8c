use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser};
use tracing_subscriber::filter::EnvFilter;

use evstat::{parse_cpu_list, session, StatConfig};

/// Count hardware performance events for a command, a process or the whole
/// system.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Command {
    /// Measure the whole system
    #[arg(short, long = "all-cpus", conflicts_with = "pid")]
    all: bool,
    /// Attach to an existing process
    #[arg(short, long)]
    pid: Option<i32>,
    /// Comma separated events to measure, {} for groups
    #[arg(short, long)]
    events: Vec<String>,
    /// Print counters every N milliseconds
    #[arg(short = 'I', long, value_name = "MS")]
    interval: Option<u64>,
    /// Only measure on these CPUs: numbers or ranges a-b
    #[arg(short = 'C', long = "cpu", value_name = "CPUS")]
    cpus: Option<String>,
    /// Print values for individual CPUs
    #[arg(short = 'A', long)]
    no_aggr: bool,
    /// Print perf_event_open arguments; repeat for debug logs
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// perfmon JSON event list for symbolic events
    #[arg(long, value_name = "PATH")]
    event_file: Option<PathBuf>,
    /// Command to run and measure
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Command {
    fn into_config(self) -> Result<StatConfig> {
        let cpus = match &self.cpus {
            Some(list) => Some(parse_cpu_list(list)?),
            None => None,
        };
        let config = StatConfig {
            verbosity: self.verbose,
            events: self.events,
            all_cpus: self.all,
            pid: self.pid,
            cpus,
            interval: self.interval.map(Duration::from_millis),
            no_aggr: self.no_aggr,
            event_file: self.event_file,
            command: self.command,
        };
        config.validate()?;
        Ok(config)
    }
}

fn init_log(config: &StatConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level()));

    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
    {
        eprintln!("failed to init logger: {}", e);
    }
}

fn main() -> Result<()> {
    let config = Command::parse().into_config()?;
    init_log(&config);

    let code = session::run(&config)?;
    if code != 0 {
        process::exit(code);
    }
    Ok(())
}
