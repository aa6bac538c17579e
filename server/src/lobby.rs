//! Waiting-room management ahead of a game
//!
//! A lobby collects players, ready state, and host-controlled settings, then
//! hands a frozen roster to the round engine on start. Lobbies live in an
//! injectable [`LobbyStore`] rather than a process-wide map so tests can run
//! any number of isolated stores side by side.

use log::info;
use rand::Rng;

use shared::{
    Driver, GameSettings, LobbyError, LobbyPlayerSnapshot, LobbySnapshot, LOBBY_CODE_LEN,
    MAX_PLAYERS,
};

/// Characters used in lobby codes. Ambiguous glyphs (0/O, 1/I) are left out.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyStatus {
    Waiting,
    InGame,
}

#[derive(Debug, Clone)]
pub struct LobbyPlayer {
    pub id: u32,
    pub name: String,
    pub ready: bool,
    pub connected: bool,
    pub driver_pref: Option<Driver>,
}

/// A seat frozen out of the lobby at start time, seeding one game player.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub id: u32,
    pub name: String,
    pub driver_pref: Option<Driver>,
}

#[derive(Debug, Clone)]
pub struct Lobby {
    pub code: String,
    pub host_id: u32,
    pub players: Vec<LobbyPlayer>,
    pub settings: GameSettings,
    pub status: LobbyStatus,
    next_player_id: u32,
}

impl Lobby {
    /// Creates a lobby with the given code and its host already seated.
    /// Returns the lobby together with the host's player id.
    pub fn new(code: String, host_name: String, settings: GameSettings) -> (Self, u32) {
        let mut lobby = Self {
            code,
            host_id: 0,
            players: Vec::new(),
            settings,
            status: LobbyStatus::Waiting,
            next_player_id: 1,
        };
        let host_id = lobby.seat_player(host_name);
        lobby.host_id = host_id;
        (lobby, host_id)
    }

    fn seat_player(&mut self, name: String) -> u32 {
        let id = self.next_player_id;
        self.next_player_id += 1;
        self.players.push(LobbyPlayer {
            id,
            name,
            ready: false,
            connected: true,
            driver_pref: None,
        });
        id
    }

    /// Seats a joining player, enforcing capacity and start state.
    pub fn join(&mut self, name: String) -> Result<u32, LobbyError> {
        if self.status == LobbyStatus::InGame {
            return Err(LobbyError::AlreadyStarted);
        }
        if self.players.iter().filter(|p| p.connected).count() >= MAX_PLAYERS {
            return Err(LobbyError::Full);
        }
        let id = self.seat_player(name);
        info!("Player {} joined lobby {}", id, self.code);
        Ok(id)
    }

    /// Drops a player from the waiting room. The host seat moves to the next
    /// connected player. Returns true when nobody connected remains and the
    /// lobby should be deleted.
    pub fn leave(&mut self, player_id: u32) -> bool {
        if self.status == LobbyStatus::Waiting {
            self.players.retain(|p| p.id != player_id);
        } else if let Some(player) = self.players.iter_mut().find(|p| p.id == player_id) {
            player.connected = false;
        }
        if self.host_id == player_id {
            if let Some(next_host) = self.players.iter().find(|p| p.connected) {
                self.host_id = next_host.id;
                info!("Lobby {} host moved to player {}", self.code, next_host.id);
            }
        }
        !self.players.iter().any(|p| p.connected)
    }

    pub fn mark_disconnected(&mut self, player_id: u32) -> bool {
        if let Some(player) = self.players.iter_mut().find(|p| p.id == player_id) {
            player.connected = false;
            player.ready = false;
        }
        if self.host_id == player_id {
            if let Some(next_host) = self.players.iter().find(|p| p.connected) {
                self.host_id = next_host.id;
            }
        }
        !self.players.iter().any(|p| p.connected)
    }

    pub fn mark_connected(&mut self, player_id: u32) {
        if let Some(player) = self.players.iter_mut().find(|p| p.id == player_id) {
            player.connected = true;
        }
    }

    pub fn toggle_ready(&mut self, player_id: u32) -> Result<(), LobbyError> {
        if self.status == LobbyStatus::InGame {
            return Err(LobbyError::AlreadyStarted);
        }
        let player = self
            .players
            .iter_mut()
            .find(|p| p.id == player_id)
            .ok_or(LobbyError::NotInLobby)?;
        player.ready = !player.ready;
        Ok(())
    }

    /// Host-only settings write. Last writer wins; the host is the only
    /// writer so there is no real contention.
    pub fn update_settings(
        &mut self,
        player_id: u32,
        settings: GameSettings,
    ) -> Result<(), LobbyError> {
        if self.status == LobbyStatus::InGame {
            return Err(LobbyError::AlreadyStarted);
        }
        if player_id != self.host_id {
            return Err(LobbyError::NotHost);
        }
        self.settings = settings;
        Ok(())
    }

    /// Records a pre-game driver preference. Duplicates are rejected so the
    /// in-game selection phase starts from a consistent wish list.
    pub fn select_driver(&mut self, player_id: u32, driver: Driver) -> Result<(), LobbyError> {
        if self
            .players
            .iter()
            .any(|p| p.id != player_id && p.driver_pref == Some(driver))
        {
            return Err(LobbyError::DriverTaken);
        }
        let player = self
            .players
            .iter_mut()
            .find(|p| p.id == player_id)
            .ok_or(LobbyError::NotInLobby)?;
        player.driver_pref = Some(driver);
        Ok(())
    }

    /// Freezes the ready subset and flips the lobby into its in-game state.
    /// Only the host may start, and every connected player must be ready.
    pub fn start(&mut self, player_id: u32) -> Result<Vec<RosterEntry>, LobbyError> {
        if self.status == LobbyStatus::InGame {
            return Err(LobbyError::AlreadyStarted);
        }
        if player_id != self.host_id {
            return Err(LobbyError::NotHost);
        }
        let ready: Vec<&LobbyPlayer> = self
            .players
            .iter()
            .filter(|p| p.connected && p.ready)
            .collect();
        let unready = self
            .players
            .iter()
            .filter(|p| p.connected && !p.ready)
            .count();
        if ready.is_empty() || unready > 0 {
            return Err(LobbyError::InsufficientReady);
        }

        let roster = ready
            .into_iter()
            .map(|p| RosterEntry {
                id: p.id,
                name: p.name.clone(),
                driver_pref: p.driver_pref,
            })
            .collect();
        self.status = LobbyStatus::InGame;
        info!("Lobby {} started its game", self.code);
        Ok(roster)
    }

    pub fn snapshot(&self) -> LobbySnapshot {
        LobbySnapshot {
            code: self.code.clone(),
            host_id: self.host_id,
            in_game: self.status == LobbyStatus::InGame,
            settings: self.settings,
            players: self
                .players
                .iter()
                .map(|p| LobbyPlayerSnapshot {
                    id: p.id,
                    name: p.name.clone(),
                    ready: p.ready,
                    connected: p.connected,
                    driver_pref: p.driver_pref,
                })
                .collect(),
        }
    }
}

/// Repository of live lobbies. Injectable so the core never depends on a
/// process-wide registry.
pub trait LobbyStore {
    fn get(&self, code: &str) -> Option<&Lobby>;
    fn get_mut(&mut self, code: &str) -> Option<&mut Lobby>;
    fn insert(&mut self, lobby: Lobby);
    fn remove(&mut self, code: &str) -> Option<Lobby>;
    fn contains(&self, code: &str) -> bool;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct InMemoryLobbyStore {
    lobbies: std::collections::HashMap<String, Lobby>,
}

impl InMemoryLobbyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LobbyStore for InMemoryLobbyStore {
    fn get(&self, code: &str) -> Option<&Lobby> {
        self.lobbies.get(code)
    }

    fn get_mut(&mut self, code: &str) -> Option<&mut Lobby> {
        self.lobbies.get_mut(code)
    }

    fn insert(&mut self, lobby: Lobby) {
        self.lobbies.insert(lobby.code.clone(), lobby);
    }

    fn remove(&mut self, code: &str) -> Option<Lobby> {
        self.lobbies.remove(code)
    }

    fn contains(&self, code: &str) -> bool {
        self.lobbies.contains_key(code)
    }

    fn len(&self) -> usize {
        self.lobbies.len()
    }
}

/// Draws 4-character codes until one misses every live lobby.
pub fn generate_lobby_code<S: LobbyStore + ?Sized, R: Rng>(store: &S, rng: &mut R) -> String {
    loop {
        let code: String = (0..LOBBY_CODE_LEN)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        if !store.contains(&code) {
            return code;
        }
    }
}
