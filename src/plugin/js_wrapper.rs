use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::js_runtime::{ScriptSandbox, Terminator};
use super::value::ScriptValue;
use crate::core::error::{Result, TingError};

/// Command sent to the sandbox worker thread
enum SandboxCommand {
    Evaluate {
        code: String,
        resp: oneshot::Sender<Result<ScriptValue>>,
    },
    Call {
        name: String,
        args: Vec<ScriptValue>,
        resp: oneshot::Sender<Result<ScriptValue>>,
    },
    SetGlobal {
        name: String,
        value: ScriptValue,
        resp: oneshot::Sender<Result<()>>,
    },
    GetGlobal {
        name: String,
        resp: oneshot::Sender<Result<ScriptValue>>,
    },
}

impl SandboxCommand {
    /// Whether the caller stopped waiting, e.g. after a timeout
    fn is_abandoned(&self) -> bool {
        match self {
            SandboxCommand::Evaluate { resp, .. }
            | SandboxCommand::Call { resp, .. }
            | SandboxCommand::GetGlobal { resp, .. } => resp.is_closed(),
            SandboxCommand::SetGlobal { resp, .. } => resp.is_closed(),
        }
    }
}

/// Send + Sync handle to a sandbox living on its own thread
///
/// Script engines are single-threaded, so each source gets a dedicated thread
/// running a current-thread Tokio runtime. Commands are processed one at a
/// time in arrival order, which serializes every call against the source's
/// sandbox while different sources run in parallel. When the last handle is
/// dropped the channel closes and the worker disposes the engine.
#[derive(Clone)]
pub struct SandboxHandle {
    name: Arc<str>,
    tx: mpsc::Sender<(u64, SandboxCommand)>,
    terminator: Option<Terminator>,
    /// Id of the command the worker is executing, 0 when idle
    running: Arc<AtomicU64>,
    next_id: Arc<AtomicU64>,
    timeout: Duration,
}

impl SandboxHandle {
    /// Start a worker thread and build the sandbox on it
    ///
    /// `factory` runs on the worker thread, so the sandbox itself does not
    /// need to be `Send`. Fails if the sandbox cannot be initialized.
    pub async fn spawn<F>(name: &str, timeout: Duration, factory: F) -> Result<Self>
    where
        F: FnOnce() -> Box<dyn ScriptSandbox> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<(u64, SandboxCommand)>(32);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<Option<Terminator>>>();
        let running = Arc::new(AtomicU64::new(0));

        let worker_name = name.to_string();
        let worker_running = running.clone();
        thread::Builder::new()
            .name(format!("source-sandbox-{}", name))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create Tokio runtime for {}: {}", worker_name, e);
                        let _ = ready_tx.send(Err(TingError::ScriptError(format!(
                            "Failed to start sandbox runtime: {}",
                            e
                        ))));
                        return;
                    }
                };

                let local = tokio::task::LocalSet::new();
                local.block_on(&rt, async move {
                    let mut sandbox = factory();
                    if let Err(e) = sandbox.initialize() {
                        error!("Failed to initialize sandbox for {}: {}", worker_name, e);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                    let _ = ready_tx.send(Ok(sandbox.terminator()));
                    info!("Sandbox worker ready for {}", worker_name);

                    while let Some((id, cmd)) = rx.recv().await {
                        if cmd.is_abandoned() {
                            debug!(source = %worker_name, "Skipping abandoned sandbox command");
                            continue;
                        }

                        worker_running.store(id, Ordering::SeqCst);
                        match cmd {
                            SandboxCommand::Evaluate { code, resp } => {
                                let _ = resp.send(sandbox.evaluate_script(&code));
                            }
                            SandboxCommand::Call { name, args, resp } => {
                                let result = sandbox.call_function(&name, args).await;
                                let _ = resp.send(result);
                            }
                            SandboxCommand::SetGlobal { name, value, resp } => {
                                let _ = resp.send(sandbox.set_global(&name, value));
                            }
                            SandboxCommand::GetGlobal { name, resp } => {
                                let _ = resp.send(sandbox.get_global(&name));
                            }
                        }
                        worker_running.store(0, Ordering::SeqCst);
                    }

                    sandbox.dispose();
                    info!("Sandbox worker for {} exiting", worker_name);
                });
            })
            .map_err(|e| TingError::ScriptError(format!("Failed to spawn sandbox thread: {}", e)))?;

        let terminator = ready_rx
            .await
            .map_err(|_| TingError::ScriptError("Sandbox worker exited during startup".to_string()))??;

        Ok(Self {
            name: Arc::from(name),
            tx,
            terminator,
            running,
            next_id: Arc::new(AtomicU64::new(0)),
            timeout,
        })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> SandboxCommand,
    ) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (resp_tx, resp_rx) = oneshot::channel();

        self.tx
            .send((id, make(resp_tx)))
            .await
            .map_err(|_| TingError::ScriptError(format!("Sandbox for {} is closed", self.name)))?;

        match tokio::time::timeout(self.timeout, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TingError::ScriptError(format!(
                "Sandbox worker for {} stopped",
                self.name
            ))),
            Err(_) => {
                // Only interrupt the engine if it is still busy with this call
                if self.running.load(Ordering::SeqCst) == id {
                    if let Some(terminate) = &self.terminator {
                        warn!(source = %self.name, "Terminating script after timeout");
                        terminate();
                    }
                }
                Err(TingError::ScriptError(format!(
                    "Script execution timed out after {}s",
                    self.timeout.as_secs_f64()
                )))
            }
        }
    }

    pub async fn evaluate_script(&self, code: &str) -> Result<ScriptValue> {
        let code = code.to_string();
        self.request(|resp| SandboxCommand::Evaluate { code, resp }).await
    }

    pub async fn call_function(&self, name: &str, args: Vec<ScriptValue>) -> Result<ScriptValue> {
        let name = name.to_string();
        self.request(|resp| SandboxCommand::Call { name, args, resp })
            .await
    }

    pub async fn set_global(&self, name: &str, value: ScriptValue) -> Result<()> {
        let name = name.to_string();
        self.request(|resp| SandboxCommand::SetGlobal { name, value, resp })
            .await
    }

    pub async fn get_global(&self, name: &str) -> Result<ScriptValue> {
        let name = name.to_string();
        self.request(|resp| SandboxCommand::GetGlobal { name, resp })
            .await
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
