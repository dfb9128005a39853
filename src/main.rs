//! Line-oriented bridge for shells that talk over pipes: one JSON command per
//! stdin line, one JSON response per stdout line.

use log::{error, info};
use std::io::{self, BufRead, Write};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("SIGNDESK_LOG", "info")).init();
    info!("signdesk-bridge {} ready", env!("CARGO_PKG_VERSION"));

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("bridge: stdin read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = signdesk_core::dispatch(&line);
        if writeln!(stdout, "{response}").and_then(|_| stdout.flush()).is_err() {
            break;
        }
    }
}
