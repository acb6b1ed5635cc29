//! Process lifecycle coordination.
//!
//! Listeners register in bind order and are drained in reverse, one at a
//! time: each gets its close trigger fired and its task awaited before the
//! next is touched, bounding simultaneous connection loss during deploys.
//! A watchdog forces termination when the drain overruns its grace period.
use std::{
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{signal, sync::broadcast, task::JoinHandle, time::timeout};

/// Lifecycle states of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Draining,
    Terminated,
}

/// How a drain ended. `TimedOut` and `Fatal` both force immediate process
/// termination on the exit path; they are distinct values so tests can
/// observe which path fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed,
    TimedOut,
    Fatal,
}

struct RegisteredListener {
    name: String,
    close: Option<tokio::sync::oneshot::Sender<()>>,
    done: JoinHandle<eyre::Result<()>>,
}

/// Coordinates graceful shutdown across all registered listeners.
///
/// This is the only component permitted to terminate the process.
pub struct ShutdownCoordinator {
    listeners: Mutex<Vec<RegisteredListener>>,
    state: Mutex<LifecycleState>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_initiated: AtomicBool,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            listeners: Mutex::new(Vec::new()),
            state: Mutex::new(LifecycleState::Running),
            shutdown_tx,
            shutdown_initiated: AtomicBool::new(false),
            grace,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.lock().expect("lifecycle state lock poisoned")
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.lock().expect("lifecycle state lock poisoned") = state;
    }

    /// Register a listener for draining. `close` asks the listener to stop
    /// accepting and finish in-flight work; `done` resolves when it has.
    pub fn register(
        &self,
        name: impl Into<String>,
        close: tokio::sync::oneshot::Sender<()>,
        done: JoinHandle<eyre::Result<()>>,
    ) {
        self.listeners
            .lock()
            .expect("listener registry lock poisoned")
            .push(RegisteredListener {
                name: name.into(),
                close: Some(close),
                done,
            });
    }

    /// Trigger shutdown without an OS signal (unrecovered-fault path).
    pub fn trigger_shutdown(&self) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!("shutdown triggered");
            let _ = self.shutdown_tx.send(());
        }
    }

    /// Wait for SIGTERM, SIGINT or a manual trigger, then drain. Returns
    /// only on a clean drain; the timed-out and fatal paths terminate the
    /// process immediately.
    pub async fn run_until_shutdown(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        // A fault may have fired before anyone was listening.
        if !self.shutdown_initiated.load(Ordering::Relaxed) {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    tracing::info!("received SIGINT; shutting down gracefully");
                }
                _ = wait_for_sigterm() => {
                    tracing::info!("received SIGTERM; shutting down gracefully");
                }
                _ = shutdown_rx.recv() => {}
            }
        }
        self.shutdown_initiated.store(true, Ordering::Relaxed);

        match self.drain().await {
            DrainOutcome::Completed => {
                tracing::info!("all listeners drained");
            }
            DrainOutcome::TimedOut => {
                tracing::error!(
                    grace = ?self.grace,
                    "could not drain all listeners in time; terminating"
                );
                std::process::exit(1);
            }
            DrainOutcome::Fatal => {
                tracing::error!("listener failed during drain; terminating");
                std::process::exit(1);
            }
        }
    }

    /// Close every registered listener in reverse registration order under
    /// the watchdog deadline. Kept free of process exits so the ordering and
    /// timeout behavior stay testable.
    pub async fn drain(&self) -> DrainOutcome {
        self.set_state(LifecycleState::Draining);

        let items: Vec<RegisteredListener> = {
            let mut listeners = self
                .listeners
                .lock()
                .expect("listener registry lock poisoned");
            listeners.drain(..).collect()
        };

        let work = async {
            for mut item in items.into_iter().rev() {
                if let Some(close) = item.close.take() {
                    // A send failure means the listener is already gone.
                    let _ = close.send(());
                }
                match (&mut item.done).await {
                    Ok(Ok(())) => {
                        tracing::info!(listener = %item.name, "listener closed");
                    }
                    Ok(Err(e)) => {
                        tracing::error!(listener = %item.name, error = %e, "listener close failed");
                        return DrainOutcome::Fatal;
                    }
                    Err(e) if e.is_cancelled() => {
                        // Already stopped; nothing left to wait for.
                        tracing::debug!(listener = %item.name, "listener already stopped");
                    }
                    Err(e) => {
                        tracing::error!(listener = %item.name, error = %e, "listener task panicked");
                        return DrainOutcome::Fatal;
                    }
                }
            }
            DrainOutcome::Completed
        };

        let outcome = match timeout(self.grace, work).await {
            Ok(outcome) => outcome,
            Err(_) => DrainOutcome::TimedOut,
        };
        self.set_state(LifecycleState::Terminated);
        outcome
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix systems, we only have Ctrl+C
    std::future::pending::<()>().await;
}
