//! Sender side: opens the shared region and transmits messages

use cachechan_core::ops::NativeOps;
use cachechan_core::{PollPolicy, Sender};
use cachechan_shared::{ChannelError, MESSAGE_MAX_LEN, RegionClient};
use colored::Colorize;
use log::warn;
use std::io::{self, BufRead, Write};

/// Send `message`, or every line of stdin when none is given. Returns false on failure.
pub fn run(shm_name: &str, policy: PollPolicy, message: Option<&str>) -> bool {
    println!(
        "{} Opening shared memory '{}' (waiting for receiver)...",
        "[INFO]".blue(),
        shm_name
    );
    let region = match RegionClient::connect(shm_name, policy.connect_attempts, policy.connect_interval) {
        Ok(region) => region,
        Err(e) => {
            eprintln!(
                "{} Failed to open shared memory after retries: {}",
                "[ERROR]".red(),
                e
            );
            return false;
        }
    };

    let mut sender = Sender::new(&region, NativeOps::default(), policy);

    if let Some(msg) = message {
        return send_one(&mut sender, msg);
    }

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!(
            "Type the secret message (max {} chars) and press Enter: ",
            MESSAGE_MAX_LEN
        );
        let _ = io::stdout().flush();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                eprintln!("{} Failed to read input: {}", "[ERROR]".red(), e);
                return false;
            }
            None => {
                println!();
                return true;
            }
        };

        if !send_one(&mut sender, &line) {
            return false;
        }
    }
}

fn send_one(sender: &mut Sender<'_, NativeOps>, msg: &str) -> bool {
    // Length limits are enforced by Sender::send before the region is touched
    println!(
        "{} Sending message ({} bytes): \"{}\"",
        "[INFO]".blue(),
        msg.len(),
        msg
    );
    match sender.send(msg.as_bytes()) {
        Ok(()) => {
            println!("{} Finished sending", "[OK]".green());
            true
        }
        Err(ChannelError::InvalidMessageLength(len)) => {
            eprintln!(
                "{} Message must be 1 to {} bytes, got {}",
                "[ERROR]".red(),
                MESSAGE_MAX_LEN,
                len
            );
            false
        }
        Err(e) => {
            warn!("send of {} bytes failed: {e}", msg.len());
            eprintln!("{} Send failed: {}", "[ERROR]".red(), e);
            false
        }
    }
}
