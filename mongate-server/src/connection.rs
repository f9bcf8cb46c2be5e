//! Connection state tracking.
//!
//! Each client socket has a [`ConnectionState`] plus the time of its last
//! transition, packed as `(millis << 8) | tag` into one `AtomicU64`. The
//! worker owning the socket is the only writer and stores the word once per
//! message; the shutdown drain reads it concurrently without locking.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

const TAG_BITS: u32 = 8;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

/// Lifecycle of a client connection.
///
/// `New → Idle`, then `Idle ⇄ Active` for each message, and finally
/// `Closed` from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Accepted, no read attempted yet.
    New = 0,
    /// Waiting for the next message.
    Idle = 1,
    /// A message is being handled.
    Active = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_tag(tag: u8) -> Self {
        match tag {
            0 => ConnectionState::New,
            1 => ConnectionState::Idle,
            2 => ConnectionState::Active,
            _ => ConnectionState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Idle => "idle",
            ConnectionState::Active => "active",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn pack(state: ConnectionState, millis: u64) -> u64 {
    (millis << TAG_BITS) | state as u64
}

fn unpack(word: u64) -> (ConnectionState, u64) {
    (
        ConnectionState::from_tag((word & TAG_MASK) as u8),
        word >> TAG_BITS,
    )
}

/// Lock-free `(state, last transition)` cell.
#[derive(Debug)]
pub struct StateCell {
    word: AtomicU64,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(pack(ConnectionState::New, now_millis())),
        }
    }

    /// Records a transition to `state` at the current time.
    pub fn set(&self, state: ConnectionState) {
        self.set_at(state, now_millis());
    }

    fn set_at(&self, state: ConnectionState, millis: u64) {
        self.word.store(pack(state, millis), Ordering::Release);
    }

    /// Returns the current state and the unix time (ms) it was entered.
    pub fn load(&self) -> (ConnectionState, u64) {
        unpack(self.word.load(Ordering::Acquire))
    }

    pub fn state(&self) -> ConnectionState {
        self.load().0
    }

    /// Returns how long the connection has been in its current state.
    pub fn elapsed(&self) -> Duration {
        let (_, since) = self.load();
        Duration::from_millis(now_millis().saturating_sub(since))
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// A tracked connection as seen by the gateway.
#[derive(Debug)]
pub struct ConnHandle {
    pub id: u64,
    pub addr: SocketAddr,
    pub state: StateCell,
    close: CancellationToken,
}

impl ConnHandle {
    pub fn new(id: u64, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            state: StateCell::new(),
            close: CancellationToken::new(),
        }
    }

    /// Asks the worker to close the socket. The worker only observes this
    /// while waiting for a message, so an in-flight request always completes.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn close_requested(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Resolves once [`ConnHandle::close`] has been called.
    pub async fn closed(&self) {
        self.close.cancelled().await
    }

    /// Returns whether the drain may close this connection: idle for longer
    /// than `grace`.
    pub fn is_idle_past(&self, grace: Duration) -> bool {
        self.state.state() == ConnectionState::Idle && self.state.elapsed() > grace
    }
}
