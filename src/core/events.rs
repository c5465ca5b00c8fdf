// src/core/events.rs

//! Defines the interrupt bus used to wake and steer the supervisor and its
//! workers. In the original process-per-child design these were delivered as
//! SIGUSR1 with a reason code; here the same reason codes travel over a
//! broadcast channel with identical semantics.

use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::debug;

/// Capacity of the interrupt channel. Interrupts are tiny and rare; a lagging
/// receiver only ever needs the most recent ones.
const INTERRUPT_BUS_CAPACITY: usize = 256;

/// How the pool should go down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Wait for active sessions to finish before exiting.
    Smart,
    /// Terminate sessions immediately, flush state, exit.
    Fast,
    /// Exit as quickly as possible.
    Immediate,
}

impl ShutdownMode {
    /// Parses the single-letter mode used on the control protocol (`s`/`f`/`i`).
    pub fn from_pcp_code(c: u8) -> Option<Self> {
        match c {
            b's' => Some(ShutdownMode::Smart),
            b'f' => Some(ShutdownMode::Fast),
            b'i' => Some(ShutdownMode::Immediate),
            _ => None,
        }
    }
}

/// A reason code delivered to the supervisor loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interrupt {
    /// A failover request was enqueued and the engine should drain the queue.
    FailoverRequest,
    /// The watchdog quorum membership changed.
    QuorumChanged,
    /// A watchdog peer changed state.
    StateChanged,
    /// The leader requests backend-status synchronisation.
    SyncRequired,
    /// A peer asks us to quarantine nodes it can no longer reach.
    InformQuarantine,
    /// Wake idle workers so they re-evaluate their loops.
    Wake,
    /// Re-read configuration, HBA rules and the password store.
    Reload,
    /// Begin shutting the pool down.
    Shutdown(ShutdownMode),
}

/// The broadcast hub every long-running worker subscribes to.
#[derive(Debug)]
pub struct InterruptBus {
    sender: Sender<Interrupt>,
}

impl Default for InterruptBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(INTERRUPT_BUS_CAPACITY);
        Self { sender }
    }

    /// Publishes an interrupt to all subscribers. Having no subscriber yet is
    /// not an error; it happens during startup ordering.
    pub fn raise(&self, interrupt: Interrupt) {
        if self.sender.send(interrupt.clone()).is_err() {
            debug!("interrupt {:?} raised with no active subscribers", interrupt);
        }
    }

    pub fn subscribe(&self) -> Receiver<Interrupt> {
        self.sender.subscribe()
    }
}
