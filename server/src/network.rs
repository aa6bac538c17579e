//! Server network layer: UDP transport, command dispatch, and tick driving
//!
//! The `Server` owns every piece of mutable state (session registry, lobby
//! store, and one round engine per in-game lobby) on a single event loop.
//! Network tasks only shuttle datagrams: a receiver task decodes inbound
//! [`ClientCommand`]s onto a channel, a sender task drains the outbound
//! queue, and the main `select!` loop applies commands, sweeps session
//! timeouts, and drives every engine's `tick`. Nothing outside the loop
//! touches game state, so handlers need no locking.

use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::interval;

use shared::messages::{ClientCommand, ServerEvent};
use shared::{GameSettings, LobbyError};

use crate::analytics::{record_round_best_effort, record_summary_best_effort, AnalyticsSink};
use crate::engine::{EngineOutput, RoundEngine};
use crate::lobby::{generate_lobby_code, Lobby, LobbyStore};
use crate::session::{SessionRegistry, SESSION_TIMEOUT};

/// Messages sent from network tasks to the main server loop.
#[derive(Debug)]
pub enum ServerMessage {
    CommandReceived {
        command: ClientCommand,
        addr: SocketAddr,
    },
    #[allow(dead_code)]
    Shutdown,
}

/// Outbound events queued for the sender task.
#[derive(Debug)]
pub struct OutboundMessage {
    pub event: ServerEvent,
    pub addr: SocketAddr,
}

/// Main server coordinating networking, lobbies, and game engines.
pub struct Server {
    socket: Arc<UdpSocket>,
    registry: SessionRegistry,
    lobbies: Box<dyn LobbyStore + Send>,
    engines: HashMap<String, RoundEngine>,
    sink: Box<dyn AnalyticsSink + Send>,
    rng: StdRng,
    tick_duration: Duration,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    out_tx: mpsc::UnboundedSender<OutboundMessage>,
    out_rx: Option<mpsc::UnboundedReceiver<OutboundMessage>>,
}

impl Server {
    pub async fn new(
        addr: &str,
        tick_duration: Duration,
        lobbies: Box<dyn LobbyStore + Send>,
        sink: Box<dyn AnalyticsSink + Send>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            registry: SessionRegistry::new(),
            lobbies,
            engines: HashMap::new(),
            sink,
            rng: StdRng::from_entropy(),
            tick_duration,
            server_tx,
            server_rx,
            out_tx,
            out_rx: Some(out_rx),
        })
    }

    /// Spawns the task that continuously listens for incoming datagrams.
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(command) = deserialize::<ClientCommand>(&buffer[0..len]) {
                            if server_tx
                                .send(ServerMessage::CommandReceived { command, addr })
                                .is_err()
                            {
                                break;
                            }
                        } else {
                            warn!("Failed to decode command from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns the task that drains the outbound event queue.
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let mut out_rx = self
            .out_rx
            .take()
            .unwrap_or_else(|| mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                match serialize(&message.event) {
                    Ok(data) => {
                        if let Err(e) = socket.send_to(&data, message.addr).await {
                            error!("Failed to send to {}: {}", message.addr, e);
                        }
                    }
                    Err(e) => error!("Failed to encode event: {}", e),
                }
            }
        });
    }

    fn send_event(&self, addr: SocketAddr, event: ServerEvent) {
        if self.out_tx.send(OutboundMessage { event, addr }).is_err() {
            error!("Outbound queue closed; dropping event for {}", addr);
        }
    }

    fn send_error(&self, addr: SocketAddr, error: LobbyError) {
        self.send_event(
            addr,
            ServerEvent::ActionError {
                message: error.to_string(),
            },
        );
    }

    fn broadcast_lobby_update(&self, code: &str) {
        let Some(lobby) = self.lobbies.get(code) else {
            return;
        };
        let event = ServerEvent::LobbyUpdate {
            lobby: lobby.snapshot(),
        };
        for addr in self.registry.addrs_in_lobby(code) {
            self.send_event(addr, event.clone());
        }
    }

    /// Routes one engine's outputs to the wire and the analytics sink.
    /// Returns true when the engine reported itself finished.
    fn route_outputs(&mut self, code: &str, outputs: Vec<EngineOutput>) -> bool {
        let mut finished = false;
        for output in outputs {
            match output {
                EngineOutput::Broadcast(event) => {
                    for addr in self.registry.addrs_in_lobby(code) {
                        self.send_event(addr, event.clone());
                    }
                }
                EngineOutput::ToPlayer(player_id, event) => {
                    // Bots and disconnected seats simply have no address.
                    if let Some(addr) = self.registry.addr_of(code, player_id) {
                        self.send_event(addr, event);
                    }
                }
                EngineOutput::RoundSnapshot(record) => {
                    record_round_best_effort(self.sink.as_mut(), &record);
                }
                EngineOutput::GameSummary(record) => {
                    record_summary_best_effort(self.sink.as_mut(), &record);
                }
                EngineOutput::Finished => finished = true,
            }
        }
        finished
    }

    /// Tears down a finished game: the engine (and with it every phase
    /// timer) is dropped, and the lobby returns to the waiting room.
    fn cleanup_finished_game(&mut self, code: &str) {
        self.engines.remove(code);
        let empty = match self.lobbies.get_mut(code) {
            Some(lobby) => {
                lobby.status = crate::lobby::LobbyStatus::Waiting;
                for player in lobby.players.iter_mut() {
                    player.ready = false;
                }
                lobby.players.retain(|p| p.connected);
                lobby.players.is_empty()
            }
            None => false,
        };
        if empty {
            self.lobbies.remove(code);
            info!("Lobby {} deleted after its game ended empty", code);
        } else {
            self.broadcast_lobby_update(code);
        }
    }

    fn run_engine<F>(&mut self, code: &str, f: F)
    where
        F: FnOnce(&mut RoundEngine) -> Vec<EngineOutput>,
    {
        let outputs = match self.engines.get_mut(code) {
            Some(engine) => f(engine),
            None => return,
        };
        if self.route_outputs(code, outputs) {
            self.cleanup_finished_game(code);
        }
    }

    /// Applies one inbound command. Lobby-flow failures are answered with
    /// `ActionError`; game actions that do not fit the current phase are
    /// dropped by the engine as safe no-ops.
    fn handle_command(&mut self, command: ClientCommand, addr: SocketAddr) {
        self.registry.touch(&addr);
        let now = Instant::now();

        match command {
            ClientCommand::Ping => self.send_event(addr, ServerEvent::Pong),
            ClientCommand::CreateLobby { name, settings } => {
                self.handle_create_lobby(addr, name, settings)
            }
            ClientCommand::JoinLobby { code, name } => self.handle_join_lobby(addr, code, name),
            ClientCommand::LeaveLobby => self.handle_leave(addr, now),
            ClientCommand::ToggleReady => {
                self.with_lobby(addr, |lobby, player_id| lobby.toggle_ready(player_id))
            }
            ClientCommand::UpdateSettings { settings } => self.with_lobby(addr, |lobby, id| {
                lobby.update_settings(id, settings)
            }),
            ClientCommand::SelectDriver { driver } => {
                self.with_lobby(addr, move |lobby, id| lobby.select_driver(id, driver))
            }
            ClientCommand::StartGame => self.handle_start_game(addr, now),
            ClientCommand::SelectDriverInGame { driver } => {
                self.handle_game_action(addr, |engine, id| engine.select_driver(id, driver, now))
            }
            ClientCommand::ConfirmDriver => {
                self.handle_game_action(addr, |engine, id| engine.confirm_driver(id, now))
            }
            ClientCommand::Press => {
                self.handle_game_action(addr, |engine, id| engine.press(id, now))
            }
            ClientCommand::Release => {
                self.handle_game_action(addr, |engine, id| engine.release(id, now))
            }
            ClientCommand::ReadyNext => {
                self.handle_game_action(addr, |engine, id| engine.ready_next(id, now))
            }
            ClientCommand::RejoinGame { code, player_id } => {
                self.handle_rejoin(addr, code, player_id, now)
            }
        }
    }

    fn handle_create_lobby(&mut self, addr: SocketAddr, name: String, settings: GameSettings) {
        if self.registry.find(&addr).is_some() {
            self.send_error(addr, LobbyError::AlreadyStarted);
            return;
        }
        let code = generate_lobby_code(self.lobbies.as_ref(), &mut self.rng);
        let (lobby, host_id) = Lobby::new(code.clone(), name, settings);
        self.lobbies.insert(lobby);
        self.registry.bind(addr, host_id, &code);
        info!("Lobby {} created", code);
        self.broadcast_lobby_update(&code);
    }

    fn handle_join_lobby(&mut self, addr: SocketAddr, code: String, name: String) {
        let Some(lobby) = self.lobbies.get_mut(&code) else {
            self.send_error(addr, LobbyError::NotFound);
            return;
        };
        match lobby.join(name) {
            Ok(player_id) => {
                self.registry.bind(addr, player_id, &code);
                self.broadcast_lobby_update(&code);
            }
            Err(e) => self.send_error(addr, e),
        }
    }

    /// Leaving is an explicit disconnect: in the waiting room the seat is
    /// dropped, mid-game it persists without a connection.
    fn handle_leave(&mut self, addr: SocketAddr, now: Instant) {
        let Some(session) = self.registry.unbind(&addr) else {
            return;
        };
        let code = session.lobby_code.clone();
        if self.engines.contains_key(&code) {
            if let Some(lobby) = self.lobbies.get_mut(&code) {
                lobby.mark_disconnected(session.player_id);
            }
            self.run_engine(&code, |engine| {
                engine.player_disconnected(session.player_id, now)
            });
            return;
        }
        let empty = match self.lobbies.get_mut(&code) {
            Some(lobby) => lobby.leave(session.player_id),
            None => false,
        };
        if empty {
            self.lobbies.remove(&code);
            info!("Lobby {} deleted (no connected players)", code);
        } else {
            self.broadcast_lobby_update(&code);
        }
    }

    fn with_lobby<F>(&mut self, addr: SocketAddr, f: F)
    where
        F: FnOnce(&mut Lobby, u32) -> Result<(), LobbyError>,
    {
        let Some(session) = self.registry.find(&addr) else {
            self.send_error(addr, LobbyError::NotInLobby);
            return;
        };
        let code = session.lobby_code.clone();
        let player_id = session.player_id;
        let Some(lobby) = self.lobbies.get_mut(&code) else {
            self.send_error(addr, LobbyError::NotFound);
            return;
        };
        match f(lobby, player_id) {
            Ok(()) => self.broadcast_lobby_update(&code),
            Err(e) => self.send_error(addr, e),
        }
    }

    fn handle_start_game(&mut self, addr: SocketAddr, now: Instant) {
        let Some(session) = self.registry.find(&addr) else {
            self.send_error(addr, LobbyError::NotInLobby);
            return;
        };
        let code = session.lobby_code.clone();
        let player_id = session.player_id;
        let Some(lobby) = self.lobbies.get_mut(&code) else {
            self.send_error(addr, LobbyError::NotFound);
            return;
        };
        match lobby.start(player_id) {
            Ok(roster) => {
                let settings = lobby.settings;
                let (engine, outputs) = RoundEngine::new(code.clone(), roster, settings, now);
                self.engines.insert(code.clone(), engine);
                self.broadcast_lobby_update(&code);
                if self.route_outputs(&code, outputs) {
                    self.cleanup_finished_game(&code);
                }
            }
            Err(e) => self.send_error(addr, e),
        }
    }

    fn handle_game_action<F>(&mut self, addr: SocketAddr, f: F)
    where
        F: FnOnce(&mut RoundEngine, u32) -> Vec<EngineOutput>,
    {
        let Some(session) = self.registry.find(&addr) else {
            return;
        };
        let code = session.lobby_code.clone();
        let player_id = session.player_id;
        self.run_engine(&code, |engine| f(engine, player_id));
    }

    fn handle_rejoin(&mut self, addr: SocketAddr, code: String, player_id: u32, now: Instant) {
        let valid = self
            .engines
            .get(&code)
            .and_then(|engine| engine.state().player(player_id))
            .map(|player| !player.is_bot)
            .unwrap_or(false);
        if !valid {
            self.send_error(addr, LobbyError::NotFound);
            return;
        }
        self.registry.bind(addr, player_id, &code);
        if let Some(lobby) = self.lobbies.get_mut(&code) {
            lobby.mark_connected(player_id);
        }
        self.run_engine(&code, |engine| engine.player_rejoined(player_id, now));
    }

    /// A timed-out session is a disconnect, never an error: a mid-game seat
    /// stays and waits for a rejoin; a waiting-room seat is simply dropped.
    fn handle_session_timeout(&mut self, session: crate::session::Session, now: Instant) {
        let code = session.lobby_code.clone();
        if self.engines.contains_key(&code) {
            if let Some(lobby) = self.lobbies.get_mut(&code) {
                lobby.mark_disconnected(session.player_id);
            }
            self.run_engine(&code, |engine| {
                engine.player_disconnected(session.player_id, now)
            });
            return;
        }
        let empty = match self.lobbies.get_mut(&code) {
            Some(lobby) => lobby.leave(session.player_id),
            None => false,
        };
        if empty {
            self.lobbies.remove(&code);
            info!("Lobby {} deleted after its last session timed out", code);
        } else {
            self.broadcast_lobby_update(&code);
        }
    }

    /// Drives every active engine forward one tick.
    fn tick_games(&mut self, now: Instant) {
        let codes: Vec<String> = self.engines.keys().cloned().collect();
        for code in codes {
            self.run_engine(&code, |engine| engine.tick(now));
        }
    }

    /// Main server loop coordinating all operations.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();

        let mut tick_interval = interval(self.tick_duration);
        let mut sweep_interval = interval(Duration::from_secs(1));

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::CommandReceived { command, addr }) => {
                            self.handle_command(command, addr);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    self.tick_games(now);

                    if !self.engines.is_empty() {
                        debug!(
                            "{} active games, {} sessions",
                            self.engines.len(),
                            self.registry.len()
                        );
                    }
                },

                _ = sweep_interval.tick() => {
                    let now = Instant::now();
                    let timed_out = self.registry.check_timeouts(SESSION_TIMEOUT);
                    for (_, session) in timed_out {
                        self.handle_session_timeout(session, now);
                    }
                },
            }
        }

        Ok(())
    }
}
