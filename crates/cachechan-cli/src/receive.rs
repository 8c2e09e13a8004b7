//! Receiver side: owns the shared region and serves sessions

use cachechan_core::ops::NativeOps;
use cachechan_core::{CalibrationConfig, PollPolicy, Receiver, SessionReport};
use cachechan_shared::{ChannelError, RegionHost};
use colored::Colorize;
use log::info;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal::unix::{SignalKind, signal};

/// Serve sessions on `shm_name` until SIGINT/SIGTERM or the session limit.
/// Returns false if the region could not be set up.
pub fn run(
    shm_name: &str,
    policy: PollPolicy,
    calibration: CalibrationConfig,
    sessions: Option<usize>,
    verbose: bool,
) -> bool {
    println!("{} Creating shared memory '{}'...", "[INFO]".blue(), shm_name);
    let region = match RegionHost::create(shm_name) {
        Ok(region) => region,
        Err(e) => {
            eprintln!("{} Failed to create shared memory: {}", "[ERROR]".red(), e);
            return false;
        }
    };
    println!("{} Shared memory '{}' ready", "[OK]".green(), region.name());

    let stop = Arc::new(AtomicBool::new(false));
    if let Err(e) = stop_on_signal(Arc::clone(&stop)) {
        eprintln!(
            "{} Failed to install signal handlers, stop with the session limit only: {}",
            "[WARN]".yellow(),
            e
        );
    }

    let mut receiver = Receiver::new(&region, NativeOps::default(), policy, calibration);
    if verbose {
        receiver = receiver.on_bit(|sample| {
            println!(
                "  bit {:4}: measured={:4} => {}",
                sample.index + 1,
                sample.latency,
                sample.bit
            );
        });
    }

    println!("{} Calibrating and waiting for a sender...", "[INFO]".blue());
    let served = receiver.serve(&stop, sessions, |outcome| display_outcome(&outcome));
    info!("served {served} sessions on {shm_name}");

    if stop.load(Ordering::SeqCst) {
        println!("{} Stop requested, removing '{}'", "[INFO]".blue(), region.name());
    }
    println!("{} Finished", "[OK]".green());
    true
}

/// Raise `stop` on SIGINT or SIGTERM.
///
/// Handlers are registered before this returns; a background thread waits
/// for the first signal.
fn stop_on_signal(stop: Arc<AtomicBool>) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let (mut interrupt, mut terminate) = {
        let _guard = runtime.enter();
        (
            signal(SignalKind::interrupt())?,
            signal(SignalKind::terminate())?,
        )
    };

    std::thread::Builder::new()
        .name("cachechan-signals".to_string())
        .spawn(move || {
            let name = runtime.block_on(async {
                tokio::select! {
                    _ = interrupt.recv() => "SIGINT",
                    _ = terminate.recv() => "SIGTERM",
                }
            });
            info!("{name} received, stopping");
            stop.store(true, Ordering::SeqCst);
        })?;

    Ok(())
}

fn display_outcome(outcome: &Result<SessionReport, ChannelError>) {
    match outcome {
        Ok(report) => {
            println!(
                "{} Calibration: avg_cached={} avg_evicted={} threshold={}",
                "[INFO]".blue(),
                report.calibration.avg_cached,
                report.calibration.avg_evicted,
                report.calibration.threshold
            );
            println!(
                "{} Recovered message ({} bytes): \"{}\"",
                "[OK]".green(),
                report.message.len(),
                String::from_utf8_lossy(&report.message)
            );
        }
        Err(e) => {
            eprintln!("{} Session aborted: {}", "[WARN]".yellow(), e);
        }
    }
    println!("{} Waiting for the next message...", "[INFO]".blue());
}
