pub mod config;
pub mod validate;

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::engine::control::{parse_control_command, ControlCommand, ControlState};

/// Runtime threads for a run peaking at `total_workers` workers.
/// Roughly 50-75 workers per thread at scale, never below the core count.
pub fn runtime_threads(total_workers: usize) -> usize {
    let base_parallelism = num_cpus::get().max(1);
    if total_workers > 5000 {
        (total_workers / 75).min(128).max(base_parallelism * 2)
    } else if total_workers > 1000 {
        (total_workers / 50).min(64).max(base_parallelism)
    } else {
        base_parallelism.max(8)
    }
}

/// Read control commands from stdin until EOF or `stop`.
pub fn spawn_stdin_control(control: Arc<ControlState>) -> tokio::task::JoinHandle<()> {
    println!("Interactive mode enabled. Commands: ramp <N>, pause, resume, tag k=v, status, stop");
    println!("   Type commands and press Enter.\n");

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_control_command(&line) {
                Some(ControlCommand::Status) => {
                    let state = if control.is_paused() { "PAUSED" } else { "RUNNING" };
                    println!(
                        "[Status] Workers: {} (target {}), State: {}",
                        control.live_workers(),
                        control.target_workers(),
                        state
                    );
                }
                Some(ControlCommand::Stop) => {
                    println!("[Control] Stopping test...");
                    control.stop();
                    break;
                }
                Some(cmd) => control.apply(cmd),
                None if !line.trim().is_empty() => println!("Unknown command: {}", line.trim()),
                None => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_threads_scale_with_workers() {
        let cores = num_cpus::get().max(1);
        assert_eq!(runtime_threads(10), cores.max(8));
        assert!(runtime_threads(3000) >= cores);
        assert!(runtime_threads(3000) <= 64.max(cores));
        assert!(runtime_threads(1_000_000) >= cores * 2);
        assert!(runtime_threads(1_000_000) <= 128.max(cores * 2));
    }
}
