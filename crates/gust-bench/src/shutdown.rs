use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

const RUN: u8 = 0;
const INTERRUPT_REQUESTED: u8 = 1;
const CONFIRMED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Run,
    /// An operator interrupt arrived and awaits confirmation
    InterruptRequested,
    /// Terminal: the run is stopping
    Confirmed,
}

#[derive(Debug)]
struct TokenInner {
    state: AtomicU8,
    interrupts: AtomicU64,
    notify: Notify,
}

/// Cooperative stop signal shared by the control loop and every worker.
///
/// `Run -> InterruptRequested -> Run` may repeat while the operator keeps
/// declining; `Confirmed` is never left once entered.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    inner: Arc<TokenInner>,
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                state: AtomicU8::new(RUN),
                interrupts: AtomicU64::new(0),
                notify: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> ShutdownState {
        match self.inner.state.load(Ordering::SeqCst) {
            RUN => ShutdownState::Run,
            INTERRUPT_REQUESTED => ShutdownState::InterruptRequested,
            _ => ShutdownState::Confirmed,
        }
    }

    /// Record an external interrupt (OS signal or operator request)
    pub fn interrupt(&self) {
        self.inner.interrupts.fetch_add(1, Ordering::SeqCst);
        let _ = self.inner.state.compare_exchange(
            RUN,
            INTERRUPT_REQUESTED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.inner.notify.notify_waiters();
    }

    pub fn confirm(&self) {
        self.inner.state.store(CONFIRMED, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Withdraw a pending interrupt. Returns false if there was none to withdraw.
    pub fn decline(&self) -> bool {
        self.inner
            .state
            .compare_exchange(INTERRUPT_REQUESTED, RUN, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == ShutdownState::Confirmed
    }

    pub fn interrupt_count(&self) -> u64 {
        self.inner.interrupts.load(Ordering::SeqCst)
    }

    /// Resolves once the token is confirmed
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once more than `seen` interrupts have been recorded
    pub async fn next_interrupt(&self, seen: u64) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.interrupt_count() > seen {
                return;
            }
            notified.await;
        }
    }
}

/// Points process signals at whichever run is currently active
#[derive(Debug, Clone, Default)]
pub struct SignalRoute {
    current: Arc<Mutex<Option<ShutdownToken>>>,
}

impl SignalRoute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: ShutdownToken) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    pub fn interrupt(&self) {
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match current {
            Some(token) => token.interrupt(),
            None => warn!("Interrupt received with no active run"),
        }
    }
}

/// Route SIGINT/SIGTERM into the interrupt path instead of killing the process
pub fn spawn_signal_listener(route: SignalRoute) {
    tokio::spawn(async move {
        loop {
            wait_for_signal().await;
            info!("Interrupt received");
            route.interrupt();
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// One-shot start barrier: workers wait until the orchestrator releases it
#[derive(Debug, Clone)]
pub struct StartGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StartGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StartGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn release(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_released(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as any gate clone, so this cannot fail
        let _ = rx.wait_for(|released| *released).await;
    }
}
