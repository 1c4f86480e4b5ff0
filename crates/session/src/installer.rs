use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sandbox::{InstallRequest, ProcessExit};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::managed::{ManagedSandbox, SandboxState};
use crate::registry::SandboxRegistry;
use crate::types::InstallEvent;

/// Progress lines buffered between the install worker and the stream reader.
const EVENT_BUFFER: usize = 64;

/// Stderr lines quoted in a failed `Done` message.
const FAILURE_TAIL_LINES: usize = 5;

/// Normalize a requirement string to its canonical distribution name.
///
/// Version specifiers and extras are stripped, names are lowercased, and runs
/// of `_`/`.` become `-`. Returns `None` for names that can't be a package.
pub fn normalize_package(requirement: &str) -> Option<String> {
    let requirement = requirement.trim();
    let name_end = requirement
        .find(|c: char| matches!(c, '[' | '=' | '<' | '>' | '!' | '~' | ',' | ';'))
        .unwrap_or(requirement.len());
    let name = requirement.get(..name_end)?.trim();

    if name.is_empty()
        || name.starts_with('-')
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return None;
    }

    let mut normalized = String::with_capacity(name.len());
    for c in name.chars() {
        let c = if matches!(c, '_' | '.') { '-' } else { c.to_ascii_lowercase() };
        if c == '-' && normalized.ends_with('-') {
            continue;
        }
        normalized.push(c);
    }
    Some(normalized)
}

/// Adds dependencies to sandboxes, serialized with executions on the same
/// sandbox.
pub struct PackageInstaller {
    registry: Arc<SandboxRegistry>,
    timeout: Duration,
    unsupported: HashSet<String>,
}

impl PackageInstaller {
    pub fn new(
        registry: Arc<SandboxRegistry>,
        timeout: Duration,
        unsupported: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            registry,
            timeout,
            unsupported: unsupported
                .into_iter()
                .filter_map(|name| normalize_package(&name))
                .collect(),
        }
    }

    /// Stream the installation of `package` into `sandbox`.
    ///
    /// Nothing happens until the first [`InstallStream::next`] call.
    pub fn install_stream(&self, sandbox: Arc<ManagedSandbox>, package: &str) -> InstallStream {
        InstallStream {
            pending: Some(InstallJob {
                registry: Arc::clone(&self.registry),
                sandbox,
                requirement: package.trim().to_string(),
                timeout: self.timeout,
                unsupported: self.unsupported.clone(),
            }),
            rx: None,
            finished: false,
        }
    }
}

/// Lazy, finite, non-restartable sequence of install events, always ending
/// in exactly one [`InstallEvent::Done`].
pub struct InstallStream {
    pending: Option<InstallJob>,
    rx: Option<mpsc::Receiver<InstallEvent>>,
    finished: bool,
}

impl InstallStream {
    /// Next event, or `None` once `Done` has been yielded.
    pub async fn next(&mut self) -> Option<InstallEvent> {
        if self.finished {
            return None;
        }
        if let Some(job) = self.pending.take() {
            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            tokio::spawn(job.run(tx));
            self.rx = Some(rx);
        }

        let event = match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        };
        let event = event.unwrap_or_else(|| InstallEvent::Done {
            success: false,
            message: "install worker exited unexpectedly".to_string(),
        });
        if matches!(event, InstallEvent::Done { .. }) {
            self.finished = true;
            self.rx = None;
        }
        Some(event)
    }

    /// Drain the stream, returning the final `Done` event.
    pub async fn finish(mut self) -> InstallEvent {
        let mut last = None;
        while let Some(event) = self.next().await {
            last = Some(event);
        }
        last.unwrap_or(InstallEvent::Done {
            success: false,
            message: "install stream already consumed".to_string(),
        })
    }
}

struct InstallJob {
    registry: Arc<SandboxRegistry>,
    sandbox: Arc<ManagedSandbox>,
    requirement: String,
    timeout: Duration,
    unsupported: HashSet<String>,
}

impl InstallJob {
    async fn run(self, tx: mpsc::Sender<InstallEvent>) {
        let (success, message) = self.install(&tx).await;
        if success {
            info!(sandbox_id = self.sandbox.id(), package = %self.requirement, "package installed");
        } else {
            warn!(sandbox_id = self.sandbox.id(), package = %self.requirement, %message, "package install failed");
        }
        let _ = tx.send(InstallEvent::Done { success, message }).await;
    }

    async fn install(&self, tx: &mpsc::Sender<InstallEvent>) -> (bool, String) {
        let Some(name) = normalize_package(&self.requirement) else {
            return (false, format!("invalid package name: {:?}", self.requirement));
        };
        if self.unsupported.contains(&name) {
            return (false, format!("{name} is not installable in this sandbox"));
        }
        if self.sandbox.has_package(&name) {
            return (true, format!("{name} already installed"));
        }

        let _permit = Arc::clone(&self.sandbox.gate).lock_owned().await;
        // Someone else may have installed it while we queued.
        if self.sandbox.has_package(&name) {
            return (true, format!("{name} already installed"));
        }
        if !self.sandbox.transition(SandboxState::Ready, SandboxState::Busy) {
            return (false, format!("sandbox {} is {}", self.sandbox.id(), self.sandbox.state()));
        }

        let (progress_tx, mut progress_rx) = mpsc::channel::<String>(EVENT_BUFFER);
        let backend = {
            let sandbox = Arc::clone(&self.sandbox);
            let requirement = self.requirement.clone();
            let timeout = self.timeout;
            tokio::spawn(async move {
                sandbox
                    .inner
                    .install(
                        &InstallRequest {
                            package: &requirement,
                            timeout,
                        },
                        progress_tx,
                    )
                    .await
            })
        };

        while let Some(line) = progress_rx.recv().await {
            debug!(sandbox_id = self.sandbox.id(), %line, "install progress");
            let _ = tx.send(InstallEvent::Progress { message: line }).await;
        }

        let (success, message, evict) = match backend.await {
            Ok(Ok(result)) => match result.exit {
                ProcessExit::Exited(0) => (true, format!("installed {name}"), false),
                ProcessExit::Exited(code) => (
                    false,
                    failure_message(&name, &format!("exit code {code}"), &result.stderr),
                    false,
                ),
                ProcessExit::Signaled(signal) => (
                    false,
                    failure_message(&name, &format!("signal {signal}"), &result.stderr),
                    false,
                ),
                ProcessExit::TimedOut { reaped } => {
                    (false, format!("install of {name} timed out"), !reaped)
                }
            },
            Ok(Err(e)) => (false, format!("install of {name} failed: {e}"), false),
            Err(join) => (false, format!("install worker failed: {join}"), true),
        };

        if success {
            self.sandbox.add_package(name);
        }
        if evict {
            self.registry.evict(&self.sandbox).await;
        } else {
            self.sandbox.transition(SandboxState::Busy, SandboxState::Ready);
            self.sandbox.touch();
        }
        (success, message)
    }
}

fn failure_message(name: &str, reason: &str, stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let tail = lines
        .get(lines.len().saturating_sub(FAILURE_TAIL_LINES)..)
        .unwrap_or_default()
        .join("\n");
    if tail.is_empty() {
        format!("install of {name} failed ({reason})")
    } else {
        format!("install of {name} failed ({reason}):\n{tail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_requirement_strings() {
        assert_eq!(normalize_package("NumPy").as_deref(), Some("numpy"));
        assert_eq!(normalize_package("scikit_learn>=1.3").as_deref(), Some("scikit-learn"));
        assert_eq!(normalize_package("zope.interface").as_deref(), Some("zope-interface"));
        assert_eq!(normalize_package("requests[socks]==2.31").as_deref(), Some("requests"));
        assert_eq!(normalize_package("  pandas  ").as_deref(), Some("pandas"));
    }

    #[test]
    fn rejects_option_injection_and_garbage() {
        assert_eq!(normalize_package(""), None);
        assert_eq!(normalize_package("--index-url=http://evil"), None);
        assert_eq!(normalize_package("a b"), None);
        assert_eq!(normalize_package("../x"), None);
    }

    #[test]
    fn failure_message_quotes_stderr_tail() {
        let stderr = b"line1\nline2\nline3\nline4\nline5\nERROR: no matching distribution\n";
        let msg = failure_message("torch", "exit code 1", stderr);
        assert!(msg.starts_with("install of torch failed (exit code 1):"));
        assert!(msg.ends_with("ERROR: no matching distribution"));
        assert!(!msg.contains("line1"));
    }
}
