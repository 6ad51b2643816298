//! transfer-audit: audit relay for a file-transfer worker
//!
//! Loads the broker configuration, forks the audit listener, then reads
//! completed operations from stdin, one per line, and forwards them:
//!
//! ```text
//! upload /data/in.bin
//! remove /data/gone.bin
//! rename /data/old.bin /data/new.bin
//! ```
//!
//! At end of input the listener is shut down and its exit status becomes
//! the relay's exit status.
//!
//! ## Configuration
//! - First argument, else TRANSFER_AUDIT_CONFIG, else /etc/ega/mq.conf
//! - TRANSFER_AUDIT_* variables override file options
//! - TRANSFER_AUDIT_LOG: log filter (default: info)

use std::io::{self, BufRead};
use std::path::PathBuf;

use nix::unistd::{getuid, User};
use tracing::{info, warn};

use transfer_audit::config::Settings;
use transfer_audit::event::Event;
use transfer_audit::ipc;
use transfer_audit::utils::bootstrap::init_tracing;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref())?;

    let user = User::from_uid(getuid())?
        .map(|u| u.name)
        .unwrap_or_else(|| getuid().to_string());

    // No threads may exist before this point
    let handle = ipc::spawn(&settings, &user)?;
    info!(listener = %handle.pid(), user = %user, "transfer-audit relay started");

    let dropped = relay(io::stdin().lock(), |event| handle.send(event))?;
    if dropped > 0 {
        warn!(dropped, "Some operations were not forwarded to the listener");
    }

    handle.shutdown()?;
    let status = handle.wait()?;
    info!(status, "Listener exited");
    std::process::exit(status);
}

/// Forward every parsed line of `input` through `send`.
///
/// Returns how many events `send` could not deliver.
fn relay<R, F>(input: R, send: F) -> io::Result<usize>
where
    R: BufRead,
    F: Fn(&Event) -> ipc::Result<()>,
{
    let mut dropped = 0;
    for line in input.lines() {
        let line = line?;
        match parse_command(&line) {
            Ok(Some(event)) => {
                if send(&event).is_err() {
                    dropped += 1;
                }
            }
            Ok(None) => {}
            Err(reason) => warn!(line = %line, reason = %reason, "Ignoring input line"),
        }
    }
    Ok(dropped)
}

/// Parse one input line. Blank lines yield `None`.
fn parse_command(line: &str) -> Result<Option<Event>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let event = match (verb, args.as_slice()) {
        ("upload", [path]) => Event::upload(*path),
        ("remove", [path]) => Event::remove(*path),
        ("rename", [old_path, path]) => Event::rename(*old_path, *path),
        ("upload" | "remove" | "rename", _) => {
            return Err(format!("wrong number of arguments for '{}'", verb))
        }
        _ => return Err(format!("unknown operation '{}'", verb)),
    };
    Ok(Some(event))
}
