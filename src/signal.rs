//! Signal handling and cancellation
//!
//! Translates OS signals into graceful cancellation. First signal:
//! transition to cancelling, cancel the run context, emit
//! `loop_cancelling`. Second signal: force-kill registered child
//! processes and exit 130. Install/uninstall are idempotent so tests can
//! drive orchestrator lifecycles deterministically.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::events::{EventBus, LoopEvent};
use crate::util::now_utc;

/// Cancellation source; carries a reason to every token
pub struct Cancellation {
    tx: watch::Sender<Option<String>>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// A token observers poll or await
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Cancel with a reason; later calls keep the first reason
    pub fn cancel(&self, reason: impl Into<String>) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.into());
                true
            } else {
                false
            }
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative cancellation token
///
/// Workers check between events and before spawning subprocesses.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<Option<String>>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Wait until cancellation is requested
    pub async fn cancelled(&mut self) {
        while self.rx.borrow_and_update().is_none() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Pids of live child processes (CLI backend subprocesses)
#[derive(Default, Debug)]
pub struct ChildRegistry {
    pids: Mutex<HashSet<i32>>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: i32) {
        self.pids.lock().unwrap().insert(pid);
    }

    pub fn unregister(&self, pid: i32) {
        self.pids.lock().unwrap().remove(&pid);
    }

    pub fn len(&self) -> usize {
        self.pids.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.lock().unwrap().is_empty()
    }

    /// SIGKILL every registered child
    pub fn kill_all(&self) {
        let pids: Vec<i32> = self.pids.lock().unwrap().drain().collect();
        for pid in pids {
            warn!(pid, "Force-killing child process");
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                warn!(pid, error = %e, "Failed to kill child");
            }
        }
    }
}

/// What a received signal resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Graceful cancellation was requested
    Cancelled,
    /// Children were killed; caller must exit 130
    ForceExit,
}

/// Translates interrupt/termination signals for one run
pub struct SignalHandler {
    installed: AtomicBool,
    signal_count: AtomicU32,
    cancellation: Arc<Cancellation>,
    children: Arc<ChildRegistry>,
    bus: Arc<EventBus>,
    run_id: String,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SignalHandler {
    pub fn new(
        cancellation: Arc<Cancellation>,
        children: Arc<ChildRegistry>,
        bus: Arc<EventBus>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            installed: AtomicBool::new(false),
            signal_count: AtomicU32::new(0),
            cancellation,
            children,
            bus,
            run_id: run_id.into(),
            listener: Mutex::new(None),
        }
    }

    /// Install OS hooks once; repeated installs are no-ops
    pub fn install(self: Arc<Self>) {
        if self.installed.swap(true, Ordering::SeqCst) {
            return;
        }

        let handler = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut interrupt = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGINT hook");
                    return;
                }
            };
            let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM hook");
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = interrupt.recv() => {}
                    _ = terminate.recv() => {}
                }
                if handler.on_signal() == SignalAction::ForceExit {
                    std::process::exit(130);
                }
            }
        });

        *self.listener.lock().unwrap() = Some(handle);
        info!("Signal handler installed");
    }

    /// Handle one received signal
    ///
    /// Exposed so tests can drive the state machine without raising real
    /// signals.
    pub fn on_signal(&self) -> SignalAction {
        let count = self.signal_count.fetch_add(1, Ordering::SeqCst);

        if count == 0 {
            info!("Interrupt received, cancelling run");
            self.cancellation.cancel("interrupt received");
            self.bus.emit(LoopEvent::LoopCancelling {
                timestamp: now_utc(),
                run_id: self.run_id.clone(),
                reason: "interrupt received".to_string(),
            });
            SignalAction::Cancelled
        } else {
            warn!("Second interrupt, force-terminating children");
            self.children.kill_all();
            SignalAction::ForceExit
        }
    }

    /// Remove OS hooks; repeated uninstalls are no-ops
    pub fn uninstall(&self) {
        if !self.installed.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.listener.lock().unwrap().take() {
            handle.abort();
        }
        self.signal_count.store(0, Ordering::SeqCst);
        info!("Signal handler uninstalled");
    }
}
