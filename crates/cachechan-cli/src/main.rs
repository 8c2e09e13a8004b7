//! cachechan CLI - sends and receives messages through the cache residency of one shared line

#[cfg(not(any(target_arch = "x86_64", target_arch = "riscv64")))]
compile_error!("cachechan has no cache back-end for this target architecture");

mod receive;
mod send;

use cachechan_core::{CalibrationConfig, PollPolicy};
use cachechan_shared::DEFAULT_SHM_NAME;
use clap::{Parser, Subcommand};
use colored::Colorize;
use env_logger::Env;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "cachechan")]
#[command(about = "Covert channel over the cache state of a shared memory line")]
#[command(version)]
struct Args {
    /// Shared memory object name (must start with '/')
    #[arg(long, global = true, default_value = DEFAULT_SHM_NAME)]
    shm_name: String,

    /// Log every bit (sets the default log filter to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the shared region, calibrate and print every message received
    Receive {
        /// Latency samples per cache state during calibration
        #[arg(short, long, default_value_t = 80)]
        trials: u32,

        /// Number of sessions to serve (0 = until killed)
        #[arg(short, long, default_value_t = 0)]
        sessions: usize,
    },
    /// Open the shared region and send messages
    Send {
        /// Message to send; without it, lines are read from stdin until EOF
        #[arg(short, long)]
        message: Option<String>,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    let env = Env::default().filter_or(
        "CACHECHAN_LOG",
        if args.verbose { "debug" } else { "warn" },
    );
    env_logger::init_from_env(env);

    print_banner();

    let policy = PollPolicy::default();
    let ok = match args.command {
        Command::Receive { trials, sessions } => {
            let calibration = CalibrationConfig {
                trials: trials.max(1),
                ..CalibrationConfig::default()
            };
            let limit = (sessions > 0).then_some(sessions);
            receive::run(&args.shm_name, policy, calibration, limit, args.verbose)
        }
        Command::Send { message } => send::run(&args.shm_name, policy, message.as_deref()),
    };

    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

fn print_banner() {
    println!();
    println!("{}", "CACHECHAN".cyan().bold());
    println!("{}", "cache residency covert channel".white());
    println!();
}
