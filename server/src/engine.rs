//! Round engine and game state machine
//!
//! One engine instance owns the authoritative [`GameState`] for one lobby
//! and is the only thing that mutates it. Every wait is expressed as a
//! re-check inside `tick(now)` rather than a blocking sleep, and every
//! action handler is synchronous and phase-gated, so the whole machine can
//! be driven in tests with synthesized instants and a seeded RNG.
//!
//! Phase flow:
//!
//! ```text
//! driver_selection -> waiting_for_ready -> countdown -> bidding -> round_end
//!                         ^                                            |
//!                         +------------- next round -------------------+
//!                                                                      v
//!                                                                  game_over
//! ```
//!
//! The engine never touches sockets. It returns [`EngineOutput`] values and
//! the transport layer routes them, which keeps visibility rules (who may
//! learn the mole's identity, who sees an ability fire) in one place.

use std::time::{Duration, Instant};

use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use shared::messages::ServerEvent;
use shared::{
    Driver, GamePhase, GameSettings, ImpactKind, MomentFlag, Personality, ProtocolKind,
    Visibility, BIDDING_MIN_ELAPSED, BIG_BID_THRESHOLD, CLOSE_WIN_EPSILON, COUNTDOWN_TICKS,
    MIN_PLAYERS, MOLE_SAFE_MARGIN, READY_GATE_SECS,
};

use crate::analytics::{
    GameSummaryRecord, PlayerPosition, PlayerResult, RoundSnapshotRecord,
};
use crate::bots;
use crate::drivers::waives_countdown_penalty;
use crate::lobby::RosterEntry;
use crate::protocols::roll_protocol;
use crate::resolver::{
    determine_winner, resolve_round_end, RoundContext, TaggedEvent, WinnerDecision,
};
use crate::state::{GamePlayer, GameState, LogEvent};

/// What the engine wants the outside world to do. The transport layer maps
/// `Broadcast` to the lobby channel and `ToPlayer` to a single live seat.
#[derive(Debug)]
pub enum EngineOutput {
    Broadcast(ServerEvent),
    ToPlayer(u32, ServerEvent),
    RoundSnapshot(RoundSnapshotRecord),
    GameSummary(GameSummaryRecord),
    /// Terminal marker; the owner should drop the engine and its timers.
    Finished,
}

pub struct RoundEngine {
    state: GameState,
    rng: StdRng,
    /// When each bot readies up during waiting_for_ready.
    bot_ready_at: Vec<(u32, Instant)>,
    next_countdown_tick: Option<Instant>,
    bidding_started: Option<Instant>,
    /// Seats force-eliminated by overrun this round, for flags and recap.
    overrun_this_round: Vec<u32>,
    finished: bool,
}

impl RoundEngine {
    pub fn new(
        lobby_code: String,
        roster: Vec<RosterEntry>,
        settings: GameSettings,
        now: Instant,
    ) -> (Self, Vec<EngineOutput>) {
        Self::build(lobby_code, roster, settings, now, StdRng::from_entropy())
    }

    /// Deterministic construction for tests.
    pub fn with_seed(
        lobby_code: String,
        roster: Vec<RosterEntry>,
        settings: GameSettings,
        now: Instant,
        seed: u64,
    ) -> (Self, Vec<EngineOutput>) {
        Self::build(lobby_code, roster, settings, now, StdRng::seed_from_u64(seed))
    }

    fn build(
        lobby_code: String,
        roster: Vec<RosterEntry>,
        settings: GameSettings,
        now: Instant,
        mut rng: StdRng,
    ) -> (Self, Vec<EngineOutput>) {
        let game_id: u64 = rng.gen();
        let mut state = GameState::new(game_id, lobby_code, settings);
        let time_bank = settings.duration.time_bank();

        let mut next_id = 1;
        for entry in &roster {
            next_id = next_id.max(entry.id + 1);
            let mut player = GamePlayer::human(entry.id, entry.name.clone(), time_bank);
            player.driver = entry.driver_pref;
            state.players.push(player);
        }

        // Auto-fill bots up to the table minimum.
        let mut bot_index = 0;
        while state.players.len() < MIN_PLAYERS {
            let (name, personality) = bots::bot_profile(bot_index, &mut rng);
            state.players.push(GamePlayer::bot(next_id, name, time_bank, personality));
            next_id += 1;
            bot_index += 1;
        }

        state.log(LogEvent::GameStarted {
            player_count: state.players.len(),
        });
        info!(
            "Game {} started in lobby {} with {} seats",
            state.game_id,
            state.lobby_code,
            state.players.len()
        );

        let mut engine = Self {
            state,
            rng,
            bot_ready_at: Vec::new(),
            next_countdown_tick: None,
            bidding_started: None,
            overrun_this_round: Vec::new(),
            finished: false,
        };

        let mut outputs = Vec::new();
        // Driver selection is a multiplayer negotiation; with a single human
        // there is nothing to negotiate, so seats are assigned directly.
        if engine.state.connected_human_count() <= 1 {
            engine.auto_assign_drivers();
            outputs.push(EngineOutput::Broadcast(ServerEvent::GameStarted {
                snapshot: engine.state.snapshot(),
            }));
            outputs.extend(engine.begin_round(now));
        } else {
            outputs.push(EngineOutput::Broadcast(ServerEvent::GameStarted {
                snapshot: engine.state.snapshot(),
            }));
        }
        (engine, outputs)
    }

    pub fn state(&self) -> &GameState {
        &self.state
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    // ---- driver selection ------------------------------------------------

    /// In-game driver pick. Uniqueness is enforced here; everything else
    /// about the choice is cosmetic until confirmation.
    pub fn select_driver(&mut self, player_id: u32, driver: Driver, _now: Instant) -> Vec<EngineOutput> {
        if self.state.phase != GamePhase::DriverSelection {
            return Vec::new();
        }
        let taken = self
            .state
            .players
            .iter()
            .any(|p| p.id != player_id && p.driver == Some(driver));
        if taken {
            return vec![EngineOutput::ToPlayer(
                player_id,
                ServerEvent::ActionError {
                    message: shared::LobbyError::DriverTaken.to_string(),
                },
            )];
        }
        let Some(player) = self.state.player_mut(player_id) else {
            return Vec::new();
        };
        if player.driver_confirmed {
            return Vec::new();
        }
        player.driver = Some(driver);
        vec![self.snapshot_broadcast()]
    }

    pub fn confirm_driver(&mut self, player_id: u32, now: Instant) -> Vec<EngineOutput> {
        if self.state.phase != GamePhase::DriverSelection {
            return Vec::new();
        }
        let Some(player) = self.state.player_mut(player_id) else {
            return Vec::new();
        };
        if player.driver.is_none() {
            return Vec::new();
        }
        player.driver_confirmed = true;
        self.try_complete_driver_selection(now)
    }

    /// Advances once every connected human has confirmed. Bots and vanished
    /// humans get leftover drivers so no seat is ever left unassigned.
    fn try_complete_driver_selection(&mut self, now: Instant) -> Vec<EngineOutput> {
        let all_confirmed = self
            .state
            .players
            .iter()
            .filter(|p| !p.is_bot && p.connected)
            .all(|p| p.driver_confirmed);
        if !all_confirmed {
            return vec![self.snapshot_broadcast()];
        }
        self.auto_assign_drivers();
        self.begin_round(now)
    }

    fn auto_assign_drivers(&mut self) {
        let mut unused: Vec<Driver> = Driver::ALL
            .iter()
            .copied()
            .filter(|d| !self.state.players.iter().any(|p| p.driver == Some(*d)))
            .collect();
        unused.shuffle(&mut self.rng);
        for player in self.state.players.iter_mut() {
            if player.driver.is_none() {
                player.driver = unused.pop();
            }
            player.driver_confirmed = true;
        }
    }

    // ---- round setup -----------------------------------------------------

    /// Enters waiting_for_ready for the current round: transients cleared,
    /// protocol rolled, bot ready timers armed.
    fn begin_round(&mut self, now: Instant) -> Vec<EngineOutput> {
        self.state.phase = GamePhase::WaitingForReady;
        self.state.round_start = None;
        self.state.countdown_remaining = 0;
        self.state.bidding_clock = 0.0;
        self.state.all_humans_holding_since = None;
        self.state.active_protocol = None;
        self.state.is_double_tokens_round = false;
        self.state.mole_player_id = None;
        self.state.private_channel_pair = None;
        self.state.bot_target_bids.clear();
        self.next_countdown_tick = None;
        self.bidding_started = None;
        self.overrun_this_round.clear();
        for player in self.state.players.iter_mut() {
            player.clear_round_transients();
        }

        let mut outputs = Vec::new();
        outputs.extend(self.roll_round_protocol());

        self.bot_ready_at.clear();
        let bot_ids: Vec<u32> = self
            .state
            .players
            .iter()
            .filter(|p| p.is_bot && p.is_active())
            .map(|p| p.id)
            .collect();
        for id in bot_ids {
            let delay = bots::ready_delay(&mut self.rng);
            self.bot_ready_at
                .push((id, now + Duration::from_secs_f32(delay)));
        }

        debug!(
            "Round {}/{} waiting for ready in lobby {}",
            self.state.round, self.state.total_rounds, self.state.lobby_code
        );
        outputs.push(self.snapshot_broadcast());
        outputs
    }

    fn roll_round_protocol(&mut self) -> Vec<EngineOutput> {
        let connected_humans = self.state.connected_human_count();
        let protocol = roll_protocol(
            &mut self.rng,
            self.state.settings.duration,
            &self.state.settings,
            &self.state.protocol_history,
            self.state.active_count(),
            connected_humans,
        );
        let Some(protocol) = protocol else {
            return Vec::new();
        };

        self.state.active_protocol = Some(protocol);
        self.state.protocol_history.push(protocol);
        self.state.log(LogEvent::ProtocolRolled { protocol });
        info!("Lobby {} rolled protocol {:?}", self.state.lobby_code, protocol);

        let mut outputs = Vec::new();
        match protocol {
            ProtocolKind::DoubleTokens => {
                self.state.is_double_tokens_round = true;
            }
            ProtocolKind::Mole => {
                // Prefer a connected human mole; any active seat otherwise.
                let humans: Vec<u32> = self
                    .state
                    .players
                    .iter()
                    .filter(|p| p.is_active_human() && p.connected)
                    .map(|p| p.id)
                    .collect();
                let candidates: Vec<u32> = if humans.is_empty() {
                    self.state.active_players().map(|p| p.id).collect()
                } else {
                    humans
                };
                if let Some(mole) = candidates.choose(&mut self.rng).copied() {
                    self.state.mole_player_id = Some(mole);
                    outputs.push(EngineOutput::ToPlayer(
                        mole,
                        ServerEvent::ProtocolDetail {
                            protocol,
                            detail: "you are the mole: your bid is free, but win big and \
                                     you pay in tokens"
                                .to_string(),
                        },
                    ));
                }
            }
            ProtocolKind::PrivateChannel => {
                let mut candidates: Vec<u32> = self
                    .state
                    .players
                    .iter()
                    .filter(|p| p.is_active_human() && p.connected)
                    .map(|p| p.id)
                    .collect();
                candidates.shuffle(&mut self.rng);
                if candidates.len() >= 2 {
                    let pair = (candidates[0], candidates[1]);
                    self.state.private_channel_pair = Some(pair);
                    for id in [pair.0, pair.1] {
                        outputs.push(EngineOutput::ToPlayer(
                            id,
                            ServerEvent::ProtocolDetail {
                                protocol,
                                detail: "you share a private channel this round".to_string(),
                            },
                        ));
                    }
                }
            }
            _ => {}
        }

        if !protocol.is_secret() {
            outputs.push(EngineOutput::Broadcast(ServerEvent::ProtocolDetail {
                protocol,
                detail: format!("protocol {} is live this round", protocol.id()),
            }));
        }
        outputs
    }

    // ---- player actions --------------------------------------------------

    pub fn press(&mut self, player_id: u32, now: Instant) -> Vec<EngineOutput> {
        match self.state.phase {
            GamePhase::WaitingForReady => {
                let Some(player) = self.state.player_mut(player_id) else {
                    return Vec::new();
                };
                if !player.is_active() {
                    return Vec::new();
                }
                player.is_holding = true;
                self.refresh_ready_gate(now);
                vec![self.snapshot_broadcast()]
            }
            GamePhase::Countdown => {
                let Some(player) = self.state.player_mut(player_id) else {
                    return Vec::new();
                };
                // A seat that already bailed out (penalty marker set) sits
                // the round out; anyone else may re-grip before bidding.
                if player.is_active() && player.current_bid.is_none() {
                    player.is_holding = true;
                }
                vec![self.snapshot_broadcast()]
            }
            // Bidding starts everyone holding; a released bid stays locked.
            _ => Vec::new(),
        }
    }

    pub fn release(&mut self, player_id: u32, now: Instant) -> Vec<EngineOutput> {
        match self.state.phase {
            GamePhase::WaitingForReady => {
                let Some(player) = self.state.player_mut(player_id) else {
                    return Vec::new();
                };
                if player.is_holding {
                    player.is_holding = false;
                    // Any early release restarts the synchronized gate.
                    self.state.all_humans_holding_since = None;
                }
                vec![self.snapshot_broadcast()]
            }
            GamePhase::Countdown => self.release_during_countdown(player_id),
            GamePhase::Bidding => self.release_during_bidding(player_id, now),
            _ => Vec::new(),
        }
    }

    fn release_during_countdown(&mut self, player_id: u32) -> Vec<EngineOutput> {
        let penalty = self.state.settings.duration.countdown_penalty();
        let Some(player) = self.state.player_mut(player_id) else {
            return Vec::new();
        };
        if !player.is_holding || !player.is_active() {
            return Vec::new();
        }
        player.is_holding = false;
        // The negative marker both records the bail-out and keeps the seat
        // out of the bidding window.
        player.current_bid = Some(-penalty);

        let mut outputs = Vec::new();
        if waives_countdown_penalty(player.driver) {
            let driver = player.driver;
            outputs.push(EngineOutput::ToPlayer(
                player_id,
                ServerEvent::RealityModeAbility {
                    driver: driver.unwrap_or(Driver::Hairpin),
                    description: "countdown penalty waived".to_string(),
                    impacts: Vec::new(),
                },
            ));
        } else if !player.penalty_applied {
            let amount = penalty.min(player.remaining_time);
            player.remaining_time -= amount;
            player.penalty_applied = true;
            player.add_impact(ImpactKind::CountdownPenalty, -amount, "countdown");
            self.state.log(LogEvent::CountdownPenalty {
                player_id,
                amount,
            });
            if let Some(player) = self.state.player_mut(player_id) {
                if player.remaining_time <= 0.0 {
                    player.remaining_time = 0.0;
                    player.is_eliminated = true;
                    self.state.log(LogEvent::PlayerEliminated { player_id });
                }
            }
        }
        outputs.push(self.snapshot_broadcast());
        outputs
    }

    fn release_during_bidding(&mut self, player_id: u32, now: Instant) -> Vec<EngineOutput> {
        let clock = self.current_clock(now);
        let Some(player) = self.state.player_mut(player_id) else {
            return Vec::new();
        };
        // Idempotent: a locked bid stays locked, a non-holder has nothing
        // to release.
        if !player.is_holding || player.current_bid.is_some() || !player.is_active() {
            return Vec::new();
        }
        // Overrun beats a deliberate release arriving in the same instant.
        if clock >= player.remaining_time {
            self.force_eliminate(player_id, clock);
        } else {
            player.is_holding = false;
            player.current_bid = Some(clock);
            player.total_time_bid += clock;
            self.state.log(LogEvent::BidLocked {
                player_id,
                bid: clock,
            });
        }

        let mut outputs = vec![self.snapshot_broadcast()];
        if self.bidding_should_end(now) {
            outputs.extend(self.enter_round_end(now));
        }
        outputs
    }

    pub fn ready_next(&mut self, player_id: u32, now: Instant) -> Vec<EngineOutput> {
        if self.state.phase != GamePhase::RoundEnd {
            return Vec::new();
        }
        let Some(player) = self.state.player_mut(player_id) else {
            return Vec::new();
        };
        if player.is_bot {
            return Vec::new();
        }
        player.acknowledged = true;
        if self.all_acknowledged() {
            self.advance_after_round(now)
        } else {
            vec![self.snapshot_broadcast()]
        }
    }

    // ---- connection transitions -----------------------------------------

    /// A vanished human keeps their seat; only the connection flag drops.
    /// With no connected humans left the game force-ends on the spot.
    pub fn player_disconnected(&mut self, player_id: u32, now: Instant) -> Vec<EngineOutput> {
        let Some(player) = self.state.player_mut(player_id) else {
            return Vec::new();
        };
        if player.is_bot {
            return Vec::new();
        }
        player.connected = false;
        info!(
            "Player {} disconnected from game {} (seat kept)",
            player_id, self.state.game_id
        );

        if self.state.connected_human_count() == 0 {
            return self.enter_game_over(now);
        }

        match self.state.phase {
            GamePhase::DriverSelection => self.try_complete_driver_selection(now),
            GamePhase::WaitingForReady => {
                self.refresh_ready_gate(now);
                vec![self.snapshot_broadcast()]
            }
            GamePhase::RoundEnd => {
                if let Some(player) = self.state.player_mut(player_id) {
                    player.acknowledged = true;
                }
                if self.all_acknowledged() {
                    self.advance_after_round(now)
                } else {
                    vec![self.snapshot_broadcast()]
                }
            }
            _ => vec![self.snapshot_broadcast()],
        }
    }

    /// Rejoin with matching identity: restore the connection and replay the
    /// targeted state the seat is entitled to.
    pub fn player_rejoined(&mut self, player_id: u32, _now: Instant) -> Vec<EngineOutput> {
        let Some(player) = self.state.player_mut(player_id) else {
            return Vec::new();
        };
        if player.is_bot {
            return Vec::new();
        }
        player.connected = true;
        info!("Player {} rejoined game {}", player_id, self.state.game_id);

        let mut outputs = vec![EngineOutput::ToPlayer(
            player_id,
            ServerEvent::GameState {
                snapshot: self.state.snapshot(),
            },
        )];
        // Secret roles are targeted-only; a reconnect replays them privately.
        if self.state.mole_player_id == Some(player_id) {
            if let Some(protocol) = self.state.active_protocol {
                outputs.push(EngineOutput::ToPlayer(
                    player_id,
                    ServerEvent::ProtocolDetail {
                        protocol,
                        detail: "you are the mole: your bid is free, but win big and \
                                 you pay in tokens"
                            .to_string(),
                    },
                ));
            }
        }
        if let Some((a, b)) = self.state.private_channel_pair {
            if player_id == a || player_id == b {
                if let Some(protocol) = self.state.active_protocol {
                    outputs.push(EngineOutput::ToPlayer(
                        player_id,
                        ServerEvent::ProtocolDetail {
                            protocol,
                            detail: "you share a private channel this round".to_string(),
                        },
                    ));
                }
            }
        }
        outputs.push(self.snapshot_broadcast());
        outputs
    }

    // ---- the tick driver -------------------------------------------------

    /// Advances every time-based rule to `now`. The owning loop calls this
    /// roughly every 100ms; nothing here assumes a fixed cadence.
    pub fn tick(&mut self, now: Instant) -> Vec<EngineOutput> {
        if self.finished {
            return Vec::new();
        }
        match self.state.phase {
            GamePhase::DriverSelection => Vec::new(),
            GamePhase::WaitingForReady => self.tick_waiting(now),
            GamePhase::Countdown => self.tick_countdown(now),
            GamePhase::Bidding => self.tick_bidding(now),
            GamePhase::RoundEnd => {
                if self.all_acknowledged() {
                    self.advance_after_round(now)
                } else {
                    Vec::new()
                }
            }
            GamePhase::GameOver => Vec::new(),
        }
    }

    fn tick_waiting(&mut self, now: Instant) -> Vec<EngineOutput> {
        // Bots ready up on their randomized timers.
        let due: Vec<u32> = self
            .bot_ready_at
            .iter()
            .filter(|(_, at)| *at <= now)
            .map(|(id, _)| *id)
            .collect();
        if !due.is_empty() {
            self.bot_ready_at.retain(|(_, at)| *at > now);
            for id in due {
                if let Some(bot) = self.state.player_mut(id) {
                    if bot.is_active() {
                        bot.is_holding = true;
                    }
                }
            }
        }

        self.refresh_ready_gate(now);
        if let Some(since) = self.state.all_humans_holding_since {
            if now.duration_since(since).as_secs_f32() >= READY_GATE_SECS {
                return self.enter_countdown(now);
            }
        }
        vec![self.snapshot_broadcast()]
    }

    /// Starts or keeps the 3-second gate: it runs while every human who can
    /// press (active and connected) is holding.
    fn refresh_ready_gate(&mut self, now: Instant) {
        if self.state.phase != GamePhase::WaitingForReady {
            return;
        }
        let all_holding = self.state.gating_humans().all(|p| p.is_holding);
        if all_holding {
            if self.state.all_humans_holding_since.is_none() {
                self.state.all_humans_holding_since = Some(now);
            }
        } else {
            self.state.all_humans_holding_since = None;
        }
    }

    fn enter_countdown(&mut self, now: Instant) -> Vec<EngineOutput> {
        self.state.phase = GamePhase::Countdown;
        self.state.countdown_remaining = COUNTDOWN_TICKS;
        self.state.all_humans_holding_since = None;
        self.next_countdown_tick = Some(now + Duration::from_secs(1));
        debug!("Lobby {} countdown started", self.state.lobby_code);
        vec![self.snapshot_broadcast()]
    }

    fn tick_countdown(&mut self, now: Instant) -> Vec<EngineOutput> {
        while let Some(due) = self.next_countdown_tick {
            if now < due {
                break;
            }
            self.state.countdown_remaining = self.state.countdown_remaining.saturating_sub(1);
            if self.state.countdown_remaining == 0 {
                self.next_countdown_tick = None;
                return self.enter_bidding(now);
            }
            self.next_countdown_tick = Some(due + Duration::from_secs(1));
        }
        vec![self.snapshot_broadcast()]
    }

    fn enter_bidding(&mut self, now: Instant) -> Vec<EngineOutput> {
        self.state.phase = GamePhase::Bidding;
        self.state.round_start = Some(now);
        self.bidding_started = Some(now);
        self.state.bidding_clock = self.state.settings.duration.min_bid();
        self.state.log(LogEvent::RoundStarted);

        // Everyone still in the round grips at the gun, bots included. Seats
        // that bailed during the countdown carry their penalty marker.
        let is_final = self.state.round >= self.state.total_rounds;
        let protocol = self.state.active_protocol;
        let settings = self.state.settings;
        let bank = settings.duration.time_bank();

        let bidding_bots: Vec<(u32, Personality, f32)> = self
            .state
            .players
            .iter()
            .filter(|p| p.is_active() && p.is_bot && p.current_bid.is_none())
            .map(|p| {
                (
                    p.id,
                    p.personality.unwrap_or(Personality::Balanced),
                    p.remaining_time,
                )
            })
            .collect();
        for (id, personality, remaining) in bidding_bots {
            let target = bots::decide_bot_bid(
                personality,
                remaining,
                bank,
                is_final,
                protocol,
                &settings,
                &mut self.rng,
            );
            self.state.bot_target_bids.insert(id, target);
        }

        for player in self.state.players.iter_mut() {
            if player.is_active() && player.current_bid.is_none() {
                player.is_holding = true;
            }
        }

        debug!(
            "Lobby {} bidding open at {:.1}s floor",
            self.state.lobby_code, self.state.bidding_clock
        );
        vec![self.snapshot_broadcast()]
    }

    /// Shared clock value at `now`: the preset floor plus elapsed time,
    /// doubled under the panic protocol.
    fn current_clock(&self, now: Instant) -> f32 {
        let Some(started) = self.bidding_started else {
            return self.state.settings.duration.min_bid();
        };
        let rate = if self.state.active_protocol == Some(ProtocolKind::Panic) {
            2.0
        } else {
            1.0
        };
        self.state.settings.duration.min_bid()
            + now.duration_since(started).as_secs_f32() * rate
    }

    fn tick_bidding(&mut self, now: Instant) -> Vec<EngineOutput> {
        let clock = self.current_clock(now);
        self.state.bidding_clock = clock;

        // Overruns resolve before any deliberate release can be credited.
        let overrun: Vec<u32> = self
            .state
            .players
            .iter()
            .filter(|p| p.is_active() && p.is_holding && clock >= p.remaining_time)
            .map(|p| p.id)
            .collect();
        for id in overrun {
            self.force_eliminate(id, clock);
        }

        // Bots release once the clock passes their precomputed target.
        let releasing: Vec<(u32, f32)> = self
            .state
            .players
            .iter()
            .filter(|p| p.is_active() && p.is_holding && p.is_bot)
            .filter_map(|p| {
                self.state
                    .bot_target_bids
                    .get(&p.id)
                    .filter(|target| bots::should_release_now(**target, clock))
                    .map(|_| (p.id, clock))
            })
            .collect();
        for (id, bid) in releasing {
            if let Some(bot) = self.state.player_mut(id) {
                bot.is_holding = false;
                bot.current_bid = Some(bid);
                bot.total_time_bid += bid;
            }
            self.state.log(LogEvent::BidLocked { player_id: id, bid });
        }

        if self.bidding_should_end(now) {
            return self.enter_round_end(now);
        }
        vec![self.snapshot_broadcast()]
    }

    /// Ends once nobody active is holding, with a minimum elapsed guard so a
    /// table of simultaneous overruns still registers as a round.
    fn bidding_should_end(&self, now: Instant) -> bool {
        let Some(started) = self.bidding_started else {
            return false;
        };
        if now.duration_since(started).as_secs_f32() < BIDDING_MIN_ELAPSED {
            return false;
        }
        !self
            .state
            .players
            .iter()
            .any(|p| p.is_active() && p.is_holding)
    }

    /// Overrun: the accrued bid hit the seat's whole bank. The bid locks at
    /// exactly the remaining time and the seat is out on the spot.
    fn force_eliminate(&mut self, player_id: u32, _clock: f32) {
        let Some(player) = self.state.player_mut(player_id) else {
            return;
        };
        let bid = player.remaining_time;
        player.is_holding = false;
        player.current_bid = Some(bid);
        player.total_time_bid += bid;
        player.is_eliminated = true;
        player.moment_flags.push(MomentFlag::AllIn);
        self.overrun_this_round.push(player_id);
        self.state.log(LogEvent::ForceEliminated { player_id, bid });
    }

    // ---- round end -------------------------------------------------------

    fn enter_round_end(&mut self, now: Instant) -> Vec<EngineOutput> {
        self.state.phase = GamePhase::RoundEnd;
        let decision = determine_winner(&self.state.players);
        match decision.winner_id {
            Some(winner_id) => {
                let bid = self
                    .state
                    .player(winner_id)
                    .and_then(|p| p.locked_bid())
                    .unwrap_or(0.0);
                self.state.log(LogEvent::RoundWon {
                    player_id: winner_id,
                    bid,
                });
            }
            None if decision.deadlock => self.state.log(LogEvent::Deadlock),
            None => {}
        }

        let ctx = RoundContext {
            protocol: self.state.active_protocol,
            mole_player_id: self.state.mole_player_id,
            is_double_tokens: self.state.is_double_tokens_round,
            variant: self.state.settings.variant,
            abilities_enabled: self.state.settings.abilities_enabled,
        };
        let resolution =
            resolve_round_end(&mut self.state.players, &ctx, &decision, &mut self.rng);

        for id in &resolution.newly_eliminated {
            self.state.log(LogEvent::PlayerEliminated { player_id: *id });
        }
        if let Some(protocol) = self.state.active_protocol.filter(|p| p.is_secret()) {
            self.state.log(LogEvent::ProtocolRevealed { protocol });
        }

        let round_flags = self.apply_moment_flags(&decision);

        let mut outputs = Vec::new();
        for event in resolution.events {
            outputs.extend(self.route_tagged(event));
        }

        let mut eliminated_now = self.overrun_this_round.clone();
        eliminated_now.extend(&resolution.newly_eliminated);
        outputs.push(EngineOutput::Broadcast(ServerEvent::RoundResult {
            round: self.state.round,
            winner: decision.winner_id,
            deadlock: decision.deadlock,
            eliminated: eliminated_now.clone(),
        }));

        outputs.push(EngineOutput::RoundSnapshot(RoundSnapshotRecord {
            game_id: self.state.game_id,
            round: self.state.round,
            snapshot_type: "round_end",
            winner_id: decision.winner_id,
            eliminated_ids: eliminated_now,
            flags_triggered: round_flags,
            protocols_triggered: self.state.active_protocol.into_iter().collect(),
            player_positions: self
                .state
                .players
                .iter()
                .map(|p| PlayerPosition {
                    player_id: p.id,
                    tokens: p.tokens,
                    remaining_time: p.remaining_time,
                })
                .collect(),
            settings: self.state.settings,
        }));

        // Bots, eliminated seats, and vanished humans cannot click through
        // the recap; acknowledge for them.
        for player in self.state.players.iter_mut() {
            if player.is_bot || player.is_eliminated || !player.connected {
                player.acknowledged = true;
            }
        }

        outputs.push(self.snapshot_broadcast());
        if self.all_acknowledged() {
            outputs.extend(self.advance_after_round(now));
        }
        outputs
    }

    /// Moment flags earned this round, recorded on the seats and returned
    /// for the analytics snapshot.
    fn apply_moment_flags(&mut self, decision: &WinnerDecision) -> Vec<MomentFlag> {
        let mut round_flags: Vec<MomentFlag> = Vec::new();
        for id in &self.overrun_this_round {
            if self.state.player(*id).is_some() {
                round_flags.push(MomentFlag::AllIn);
            }
        }

        let is_final = self.state.round >= self.state.total_rounds;
        let Some(winner_id) = decision.winner_id else {
            return round_flags;
        };
        let Some(winner) = self.state.player(winner_id) else {
            return round_flags;
        };

        let mut winner_flags = Vec::new();
        if let Some(margin) = decision.margin {
            if margin <= CLOSE_WIN_EPSILON {
                winner_flags.push(MomentFlag::PhotoFinish);
            }
            if margin > MOLE_SAFE_MARGIN {
                winner_flags.push(MomentFlag::Steamroll);
            }
        }
        if winner.locked_bid().unwrap_or(0.0) > BIG_BID_THRESHOLD {
            winner_flags.push(MomentFlag::BigSpender);
        }
        if is_final {
            winner_flags.push(MomentFlag::LastStand);
        }
        let touched = winner.round_impacts.iter().any(|impact| {
            matches!(
                impact.kind,
                ImpactKind::CountdownPenalty | ImpactKind::AbilitySteal | ImpactKind::ProtocolTax
            ) && impact.value < 0.0
        });
        if !touched {
            winner_flags.push(MomentFlag::Untouched);
        }

        if let Some(winner) = self.state.player_mut(winner_id) {
            winner.moment_flags.extend(winner_flags.iter().copied());
        }
        round_flags.extend(winner_flags);
        round_flags
    }

    fn route_tagged(&self, event: TaggedEvent) -> Vec<EngineOutput> {
        match event.visibility {
            Visibility::All => vec![EngineOutput::Broadcast(event.event)],
            Visibility::DriverOnly => event
                .owner
                .map(|id| vec![EngineOutput::ToPlayer(id, event.event)])
                .unwrap_or_default(),
            Visibility::TargetOnly => event
                .target
                .or(event.owner)
                .map(|id| vec![EngineOutput::ToPlayer(id, event.event)])
                .unwrap_or_default(),
            Visibility::DriverAndTarget => {
                let mut outputs = Vec::new();
                if let Some(owner) = event.owner {
                    outputs.push(EngineOutput::ToPlayer(owner, event.event.clone()));
                }
                if let Some(target) = event.target.filter(|t| Some(*t) != event.owner) {
                    outputs.push(EngineOutput::ToPlayer(target, event.event));
                }
                outputs
            }
        }
    }

    fn all_acknowledged(&self) -> bool {
        self.state.players.iter().all(|p| p.acknowledged)
    }

    fn advance_after_round(&mut self, now: Instant) -> Vec<EngineOutput> {
        // With no humans left in the running the remaining rounds are fast
        // forwarded so final standings still mean something.
        if self.state.active_human_count() == 0
            && self.state.active_count() > 1
            && self.state.round < self.state.total_rounds
        {
            return self.fast_forward_and_finish(now);
        }
        if self.state.active_count() <= 1 || self.state.round >= self.state.total_rounds {
            return self.enter_game_over(now);
        }
        self.state.round += 1;
        self.begin_round(now)
    }

    fn fast_forward_and_finish(&mut self, now: Instant) -> Vec<EngineOutput> {
        let bot_ids: Vec<u32> = self
            .state
            .players
            .iter()
            .filter(|p| p.is_bot && p.is_active())
            .map(|p| p.id)
            .collect();
        let remaining = self.state.total_rounds - self.state.round;
        info!(
            "No humans left in game {}; fast-forwarding {} rounds",
            self.state.game_id, remaining
        );
        for _ in 0..remaining {
            if let Some(id) = bot_ids.choose(&mut self.rng).copied() {
                if let Some(bot) = self.state.player_mut(id) {
                    bot.tokens += 1;
                }
                self.state.log(LogEvent::FastForwardToken { player_id: id });
            }
        }
        self.state.round = self.state.total_rounds;
        self.enter_game_over(now)
    }

    fn enter_game_over(&mut self, _now: Instant) -> Vec<EngineOutput> {
        self.state.phase = GamePhase::GameOver;
        self.finished = true;
        let standings = self.state.standings();
        let winner_id = standings.first().map(|s| s.player_id);
        self.state.log(LogEvent::GameOver { winner_id });
        info!(
            "Game {} over, winner {:?}",
            self.state.game_id, winner_id
        );

        vec![
            EngineOutput::Broadcast(ServerEvent::GameOver {
                standings: standings.clone(),
            }),
            EngineOutput::GameSummary(GameSummaryRecord {
                game_id: self.state.game_id,
                total_rounds: self.state.total_rounds,
                results: self
                    .state
                    .players
                    .iter()
                    .map(|p| PlayerResult {
                        player_id: p.id,
                        name: p.name.clone(),
                        is_bot: p.is_bot,
                        tokens: p.tokens,
                        remaining_time: p.remaining_time,
                        total_time_bid: p.total_time_bid,
                    })
                    .collect(),
                winner_id,
            }),
            EngineOutput::Broadcast(ServerEvent::GameState {
                snapshot: self.state.snapshot(),
            }),
            EngineOutput::Finished,
        ]
    }

    fn snapshot_broadcast(&self) -> EngineOutput {
        EngineOutput::Broadcast(ServerEvent::GameState {
            snapshot: self.state.snapshot(),
        })
    }
}
