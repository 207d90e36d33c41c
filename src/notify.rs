use std::process::{Command, Stdio};
use std::thread;

use tracing::{debug, warn};

/// Tells the dependent service that the served tree changed. Delivery is
/// best-effort and never fails the transition that triggered it.
pub trait ReloadNotifier: Send + Sync {
    fn notify(&self);
}

pub struct NoopNotifier;

impl ReloadNotifier for NoopNotifier {
    fn notify(&self) {
        debug!("no reload command configured");
    }
}

/// Spawns a configured command with no arguments of its own and reaps it on
/// a background thread.
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
}

impl CommandNotifier {
    /// `None` when the command line is empty.
    pub fn from_command_line(parts: &[String]) -> Option<Self> {
        let (program, args) = parts.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl ReloadNotifier for CommandNotifier {
    fn notify(&self) {
        let spawned = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(err) => {
                report_reload_failure(&self.program, &err.to_string());
                return;
            }
        };

        let program = self.program.clone();
        thread::spawn(move || match child.wait_with_output() {
            Ok(output) if output.status.success() => {
                debug!(program = %program, "reload notification delivered");
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                report_reload_failure(
                    &program,
                    &format!("exit status {}: {}", output.status, stderr),
                );
            }
            Err(err) => report_reload_failure(&program, &err.to_string()),
        });
    }
}

fn report_reload_failure(program: &str, message: &str) {
    warn!(program, message, "reload notification failed");
    eprintln!(
        "{{\"event\":\"reload_notify_error\",\"program\":{},\"message\":{}}}",
        serde_json::to_string(program).unwrap_or_else(|_| "\"<encode-error>\"".to_string()),
        serde_json::to_string(message).unwrap_or_else(|_| "\"<encode-error>\"".to_string())
    );
}
