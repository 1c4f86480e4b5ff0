#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use notebook_server::{DatasetRepository, FsDatasetRepository, NotebookConfig, NotebookServer};
use realtime::{Outbound, Registration};
use sandbox::{
    ExecRequest, ExecResult, InstallRequest, ProcessExit, Sandbox, SandboxConfig, SandboxFactory,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// Factory whose sandboxes fake just enough of the interpreter:
///
/// - `print:<text>` writes a stdout line
/// - `fail:<text>` writes a stderr line and exits 1
/// - `sleep:<ms>` sleeps, honouring the timeout
/// - a feature pipeline script (anything calling `df.to_csv(...)`) writes a
///   two-column CSV to the requested path and reports its metadata, unless
///   `raise` appears in the script
///
/// Installing `broken` fails; anything else succeeds.
pub struct ScriptedFactory {
    pub execs: Arc<AtomicUsize>,
    pub scripts: Arc<std::sync::Mutex<Vec<String>>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self {
            execs: Arc::new(AtomicUsize::new(0)),
            scripts: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn execs(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    pub fn last_script(&self) -> Option<String> {
        self.scripts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl SandboxFactory for ScriptedFactory {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn create(&self, config: SandboxConfig) -> sandbox::Result<Box<dyn Sandbox>> {
        Ok(Box::new(ScriptedSandbox {
            id: config.id.to_string(),
            runtime_version: config.runtime_version,
            workspace: PathBuf::from("/nonexistent"),
            execs: Arc::clone(&self.execs),
            scripts: Arc::clone(&self.scripts),
        }))
    }

    async fn destroy(&self, _sandbox: &dyn Sandbox) {}
}

pub struct ScriptedSandbox {
    id: String,
    runtime_version: String,
    workspace: PathBuf,
    execs: Arc<AtomicUsize>,
    scripts: Arc<std::sync::Mutex<Vec<String>>>,
}

fn exited(code: i32, stdout: String, stderr: String) -> ExecResult {
    ExecResult {
        exit: ProcessExit::Exited(code),
        stdout: stdout.into_bytes(),
        stderr: stderr.into_bytes(),
        stdout_dropped: 0,
        stderr_dropped: 0,
    }
}

/// The JSON string literal passed to `df.to_csv(`.
fn csv_target(script: &str) -> Option<String> {
    let start = script.find("df.to_csv(")? + "df.to_csv(".len();
    let rest = script.get(start..)?;
    let end = rest.find(", index=False)")?;
    serde_json::from_str(rest.get(..end)?).ok()
}

async fn run_pipeline(script: &str, target: &str) -> ExecResult {
    if script.contains("raise") {
        return exited(1, String::new(), "ValueError: boom\n".into());
    }
    tokio::fs::write(target, "price,log_price\n1.0,0.69\n").await.unwrap();
    let report = json!({
        "kind": "feature_metadata",
        "data": {
            "columns": [
                {"name": "price", "dtype": "float64", "nullCount": 0},
                {"name": "log_price", "dtype": "float64", "nullCount": 0}
            ],
            "rowCount": 1,
            "sample": [{"price": 1.0, "log_price": 0.69}]
        }
    });
    exited(0, format!("{}{report}\n", session::OUTPUT_MARKER), String::new())
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn runtime_version(&self) -> &str {
        &self.runtime_version
    }

    fn workspace(&self) -> &Path {
        &self.workspace
    }

    async fn start(&mut self) -> sandbox::Result<()> {
        Ok(())
    }

    async fn kill(&self) -> sandbox::Result<()> {
        Ok(())
    }

    async fn exec(&self, request: &ExecRequest<'_>) -> sandbox::Result<ExecResult> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        self.scripts.lock().unwrap().push(request.script.to_string());

        if let Some(target) = csv_target(request.script) {
            return Ok(run_pipeline(request.script, &target).await);
        }

        let mut stdout = String::new();
        let mut remaining = request.timeout;
        for line in request.script.lines() {
            let (op, arg) = line.split_once(':').unwrap_or((line, ""));
            match op {
                "print" => {
                    stdout.push_str(arg);
                    stdout.push('\n');
                }
                "fail" => return Ok(exited(1, stdout, format!("{arg}\n"))),
                "sleep" => {
                    let wanted = Duration::from_millis(arg.parse().unwrap_or(0));
                    if wanted > remaining {
                        tokio::time::sleep(remaining).await;
                        let mut result = exited(0, stdout, String::new());
                        result.exit = ProcessExit::TimedOut { reaped: true };
                        return Ok(result);
                    }
                    tokio::time::sleep(wanted).await;
                    remaining -= wanted;
                }
                _ => {}
            }
        }
        Ok(exited(0, stdout, String::new()))
    }

    async fn install(
        &self,
        request: &InstallRequest<'_>,
        progress: mpsc::Sender<String>,
    ) -> sandbox::Result<ExecResult> {
        let _ = progress.send(format!("Collecting {}", request.package)).await;
        if request.package == "broken" {
            return Ok(exited(
                1,
                String::new(),
                "ERROR: No matching distribution found for broken\n".into(),
            ));
        }
        let _ = progress
            .send(format!("Successfully installed {}", request.package))
            .await;
        Ok(exited(0, String::new(), String::new()))
    }
}

/// A server over scripted sandboxes and a dataset directory holding
/// `sales.csv`.
pub struct Fixture {
    pub server: NotebookServer,
    pub factory: Arc<ScriptedFactory>,
    pub datasets: Arc<FsDatasetRepository>,
    pub dir: tempfile::TempDir,
}

pub async fn fixture() -> Fixture {
    fixture_with(|_| {}).await
}

/// Like [`fixture`], with `configure` applied to the config first. The
/// config is not validated.
pub async fn fixture_with(configure: impl FnOnce(&mut NotebookConfig)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("datasets");
    let datasets = Arc::new(FsDatasetRepository::new(data_dir.clone()).await.unwrap());
    tokio::fs::write(data_dir.join("sales.csv"), "price\n1.0\n")
        .await
        .unwrap();

    let mut config = NotebookConfig::default();
    config.server.listen = "127.0.0.1:0".to_string();
    config.datasets.dir = data_dir;
    configure(&mut config);

    let factory = Arc::new(ScriptedFactory::new());
    let server = NotebookServer::with_parts(
        config,
        Arc::clone(&factory) as Arc<dyn SandboxFactory>,
        Arc::clone(&datasets) as Arc<dyn DatasetRepository>,
    );
    Fixture {
        server,
        factory,
        datasets,
        dir,
    }
}

/// Next JSON frame queued for a registered connection.
pub async fn next_frame(registration: &mut Registration) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), registration.outbound.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed");
        if let Outbound::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Skip frames until one of `kind` arrives.
pub async fn next_of(registration: &mut Registration, kind: &str) -> Value {
    loop {
        let frame = next_frame(registration).await;
        if frame["type"] == kind {
            return frame;
        }
    }
}

/// Whether nothing is queued for the connection right now.
pub fn is_idle(registration: &mut Registration) -> bool {
    registration.outbound.try_recv().is_err()
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}
