//! Session registry mapping transport addresses to lobby seats
//!
//! This module tracks which network address currently speaks for which seat:
//! - Session lifecycle (bind on first command, unbind on leave or timeout)
//! - Reconnection bookkeeping: a seat survives its connection, and a rejoin
//!   with matching identity rebinds a fresh address to the old seat
//! - Connection health monitoring via a last-seen sweep
//!
//! The registry holds no game logic. Disconnection is a first-class
//! transition here, never an error: unbinding a session leaves the seat in
//! its lobby or game untouched.

use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// How long a session may go silent before it is considered disconnected.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// One bound connection: the seat it speaks for and when it was last heard.
#[derive(Debug, Clone)]
pub struct Session {
    pub player_id: u32,
    pub lobby_code: String,
    pub last_seen: Instant,
}

impl Session {
    pub fn new(player_id: u32, lobby_code: String) -> Self {
        Self {
            player_id,
            lobby_code,
            last_seen: Instant::now(),
        }
    }

    /// Returns true if no datagram has arrived within the timeout window.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Maps connection addresses to seats across all lobbies.
///
/// Exactly one address may speak for a seat at a time; rebinding evicts any
/// stale address first so a reconnecting client cannot be shadowed by its
/// own dead connection.
pub struct SessionRegistry {
    sessions: HashMap<SocketAddr, Session>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Binds an address to a seat. Any prior binding for the same seat is
    /// dropped, which makes rejoin-after-crash a plain rebind.
    pub fn bind(&mut self, addr: SocketAddr, player_id: u32, lobby_code: &str) {
        self.sessions.retain(|existing_addr, session| {
            let stale = session.player_id == player_id
                && session.lobby_code == lobby_code
                && *existing_addr != addr;
            if stale {
                info!(
                    "Evicting stale session for player {} at {}",
                    player_id, existing_addr
                );
            }
            !stale
        });
        self.sessions
            .insert(addr, Session::new(player_id, lobby_code.to_string()));
        info!("Bound {} to player {} in lobby {}", addr, player_id, lobby_code);
    }

    /// Removes the binding for an address, returning the seat it spoke for.
    pub fn unbind(&mut self, addr: &SocketAddr) -> Option<Session> {
        let session = self.sessions.remove(addr);
        if let Some(ref s) = session {
            info!("Unbound {} (player {} in {})", addr, s.player_id, s.lobby_code);
        }
        session
    }

    pub fn find(&self, addr: &SocketAddr) -> Option<&Session> {
        self.sessions.get(addr)
    }

    /// Refreshes the last-seen time for an address. Any datagram counts.
    pub fn touch(&mut self, addr: &SocketAddr) {
        if let Some(session) = self.sessions.get_mut(addr) {
            session.last_seen = Instant::now();
        }
    }

    /// Looks up the live address for a seat, if any is bound.
    pub fn addr_of(&self, lobby_code: &str, player_id: u32) -> Option<SocketAddr> {
        self.sessions
            .iter()
            .find(|(_, s)| s.player_id == player_id && s.lobby_code == lobby_code)
            .map(|(addr, _)| *addr)
    }

    /// All live addresses for a lobby, used for lobby-wide broadcasts.
    pub fn addrs_in_lobby(&self, lobby_code: &str) -> Vec<SocketAddr> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.lobby_code == lobby_code)
            .map(|(addr, _)| *addr)
            .collect()
    }

    /// Sweeps out sessions that have gone silent and returns them so the
    /// caller can clear the matching seats' connections.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<(SocketAddr, Session)> {
        let timed_out: Vec<SocketAddr> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.is_timed_out(timeout))
            .map(|(addr, _)| *addr)
            .collect();

        let mut removed = Vec::with_capacity(timed_out.len());
        for addr in timed_out {
            if let Some(session) = self.sessions.remove(&addr) {
                info!(
                    "Session timeout for player {} in {} ({})",
                    session.player_id, session.lobby_code, addr
                );
                removed.push((addr, session));
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
