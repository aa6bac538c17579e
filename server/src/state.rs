//! Authoritative game state owned by one round engine
//!
//! One [`GameState`] exists per lobby while its game runs. Nothing outside
//! the engine mutates it; bot policy and the round resolver are invoked by
//! the engine and hand their results back. Seats are never removed mid-game:
//! elimination and disconnection are flags, so ids in the log and in
//! analytics records stay valid for the whole game.

use std::collections::HashMap;
use std::time::Instant;

use shared::{
    Driver, GamePhase, GameSettings, GameSnapshot, MomentFlag, Personality, PlayerSnapshot,
    ProtocolKind, RoundImpact, Standing,
};

/// One seat, human or bot. Created when the engine instantiates the game and
/// kept for its whole lifetime.
#[derive(Debug, Clone)]
pub struct GamePlayer {
    pub id: u32,
    pub name: String,
    /// False while the seat has no live connection. Always false for bots.
    pub connected: bool,
    pub is_bot: bool,
    pub personality: Option<Personality>,
    pub driver: Option<Driver>,
    pub driver_confirmed: bool,
    pub tokens: u32,
    pub remaining_time: f32,
    pub total_time_bid: f32,
    /// None until the player acts this round. A negative value encodes
    /// "countdown penalty taken, no real bid".
    pub current_bid: Option<f32>,
    pub is_holding: bool,
    pub is_eliminated: bool,
    pub round_impacts: Vec<RoundImpact>,
    pub ability_used: bool,
    pub penalty_applied: bool,
    pub acknowledged: bool,
    pub moment_flags: Vec<MomentFlag>,
    pub protocol_wins: Vec<ProtocolKind>,
}

impl GamePlayer {
    pub fn human(id: u32, name: String, time_bank: f32) -> Self {
        Self::seat(id, name, time_bank, false, None)
    }

    pub fn bot(id: u32, name: String, time_bank: f32, personality: Personality) -> Self {
        Self::seat(id, name, time_bank, true, Some(personality))
    }

    fn seat(
        id: u32,
        name: String,
        time_bank: f32,
        is_bot: bool,
        personality: Option<Personality>,
    ) -> Self {
        Self {
            id,
            name,
            connected: !is_bot,
            is_bot,
            personality,
            driver: None,
            driver_confirmed: false,
            tokens: 0,
            remaining_time: time_bank,
            total_time_bid: 0.0,
            current_bid: None,
            is_holding: false,
            is_eliminated: false,
            round_impacts: Vec::new(),
            ability_used: false,
            penalty_applied: false,
            acknowledged: false,
            moment_flags: Vec::new(),
            protocol_wins: Vec::new(),
        }
    }

    /// Still competing: not eliminated.
    pub fn is_active(&self) -> bool {
        !self.is_eliminated
    }

    /// A human seat that still gates round progression.
    pub fn is_active_human(&self) -> bool {
        !self.is_bot && self.is_active()
    }

    pub fn clear_round_transients(&mut self) {
        self.current_bid = None;
        self.is_holding = false;
        self.round_impacts.clear();
        self.ability_used = false;
        self.penalty_applied = false;
        self.acknowledged = false;
    }

    /// A real (non-penalty) locked bid, if the player made one this round.
    pub fn locked_bid(&self) -> Option<f32> {
        self.current_bid.filter(|bid| *bid >= 0.0)
    }

    pub fn add_impact(&mut self, kind: shared::ImpactKind, value: f32, source: &str) {
        self.round_impacts.push(RoundImpact {
            kind,
            value,
            source: source.to_string(),
        });
    }

    fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            id: self.id,
            name: self.name.clone(),
            is_bot: self.is_bot,
            connected: self.connected,
            driver: self.driver,
            driver_confirmed: self.driver_confirmed,
            tokens: self.tokens,
            remaining_time: self.remaining_time,
            total_time_bid: self.total_time_bid,
            current_bid: self.current_bid,
            is_holding: self.is_holding,
            is_eliminated: self.is_eliminated,
            ability_used: self.ability_used,
            acknowledged: self.acknowledged,
            round_impacts: self.round_impacts.clone(),
            moment_flags: self.moment_flags.clone(),
            protocol_wins: self.protocol_wins.clone(),
        }
    }
}

/// Structured, append-only record of what happened in a game.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub round: u32,
    pub event: LogEvent,
}

#[derive(Debug, Clone)]
pub enum LogEvent {
    GameStarted { player_count: usize },
    ProtocolRolled { protocol: ProtocolKind },
    RoundStarted,
    CountdownPenalty { player_id: u32, amount: f32 },
    BidLocked { player_id: u32, bid: f32 },
    ForceEliminated { player_id: u32, bid: f32 },
    RoundWon { player_id: u32, bid: f32 },
    Deadlock,
    PlayerEliminated { player_id: u32 },
    ProtocolRevealed { protocol: ProtocolKind },
    FastForwardToken { player_id: u32 },
    GameOver { winner_id: Option<u32> },
}

#[derive(Debug)]
pub struct GameState {
    /// Correlation id for analytics records only.
    pub game_id: u64,
    pub lobby_code: String,
    pub players: Vec<GamePlayer>,
    pub round: u32,
    pub total_rounds: u32,
    pub phase: GamePhase,
    pub round_start: Option<Instant>,
    pub countdown_remaining: u32,
    pub bidding_clock: f32,
    pub active_protocol: Option<ProtocolKind>,
    pub protocol_history: Vec<ProtocolKind>,
    pub is_double_tokens_round: bool,
    pub mole_player_id: Option<u32>,
    pub private_channel_pair: Option<(u32, u32)>,
    pub settings: GameSettings,
    pub all_humans_holding_since: Option<Instant>,
    pub bot_target_bids: HashMap<u32, f32>,
    pub game_log: Vec<LogEntry>,
}

impl GameState {
    pub fn new(game_id: u64, lobby_code: String, settings: GameSettings) -> Self {
        Self {
            game_id,
            lobby_code,
            players: Vec::new(),
            round: 1,
            total_rounds: settings.duration.total_rounds(),
            phase: GamePhase::DriverSelection,
            round_start: None,
            countdown_remaining: 0,
            bidding_clock: 0.0,
            active_protocol: None,
            protocol_history: Vec::new(),
            is_double_tokens_round: false,
            mole_player_id: None,
            private_channel_pair: None,
            settings,
            all_humans_holding_since: None,
            bot_target_bids: HashMap::new(),
            game_log: Vec::new(),
        }
    }

    pub fn log(&mut self, event: LogEvent) {
        self.game_log.push(LogEntry {
            round: self.round,
            event,
        });
    }

    pub fn player(&self, id: u32) -> Option<&GamePlayer> {
        self.players.iter().find(|p| p.id == id)
    }

    pub fn player_mut(&mut self, id: u32) -> Option<&mut GamePlayer> {
        self.players.iter_mut().find(|p| p.id == id)
    }

    pub fn active_players(&self) -> impl Iterator<Item = &GamePlayer> {
        self.players.iter().filter(|p| p.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active_players().count()
    }

    /// Humans still in the running, regardless of connection state.
    pub fn active_human_count(&self) -> usize {
        self.players.iter().filter(|p| p.is_active_human()).count()
    }

    /// Humans with a live connection, eliminated or not. The game force-ends
    /// when this reaches zero.
    pub fn connected_human_count(&self) -> usize {
        self.players
            .iter()
            .filter(|p| !p.is_bot && p.connected)
            .count()
    }

    /// The waiting-room gate watches humans who can actually press: active
    /// and connected. A vanished player must not deadlock the room.
    pub fn gating_humans(&self) -> impl Iterator<Item = &GamePlayer> {
        self.players
            .iter()
            .filter(|p| p.is_active_human() && p.connected)
    }

    /// Final placement: tokens descending, remaining time breaks ties.
    pub fn standings(&self) -> Vec<Standing> {
        let mut rows: Vec<&GamePlayer> = self.players.iter().collect();
        rows.sort_by(|a, b| {
            b.tokens.cmp(&a.tokens).then(
                b.remaining_time
                    .partial_cmp(&a.remaining_time)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });
        rows.into_iter()
            .map(|p| Standing {
                player_id: p.id,
                name: p.name.clone(),
                is_bot: p.is_bot,
                tokens: p.tokens,
                remaining_time: p.remaining_time,
            })
            .collect()
    }

    /// Sanitized broadcast view. Secret roles and bot targets never leave
    /// the server through this path.
    pub fn snapshot(&self) -> GameSnapshot {
        let public_protocol = self
            .active_protocol
            .filter(|protocol| !protocol.is_secret());
        GameSnapshot {
            lobby_code: self.lobby_code.clone(),
            round: self.round,
            total_rounds: self.total_rounds,
            phase: self.phase,
            countdown_remaining: self.countdown_remaining,
            bidding_clock: self.bidding_clock,
            active_protocol: public_protocol,
            is_double_tokens_round: self.is_double_tokens_round,
            settings: self.settings,
            players: self.players.iter().map(|p| p.snapshot()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{DurationPreset, ImpactKind};

    fn state_with_players() -> GameState {
        let mut state = GameState::new(1, "AB12".to_string(), GameSettings::default());
        state.players.push(GamePlayer::human(1, "a".to_string(), 300.0));
        state
            .players
            .push(GamePlayer::bot(2, "b".to_string(), 300.0, Personality::Balanced));
        state
    }

    #[test]
    fn test_total_rounds_follows_preset() {
        let state = state_with_players();
        assert_eq!(
            state.total_rounds,
            DurationPreset::Standard.total_rounds()
        );
        assert_eq!(state.round, 1);
    }

    #[test]
    fn test_clear_round_transients() {
        let mut player = GamePlayer::human(1, "a".to_string(), 300.0);
        player.current_bid = Some(5.0);
        player.is_holding = true;
        player.ability_used = true;
        player.penalty_applied = true;
        player.acknowledged = true;
        player.add_impact(ImpactKind::BidDeduction, -5.0, "bid");

        player.clear_round_transients();
        assert_eq!(player.current_bid, None);
        assert!(!player.is_holding);
        assert!(!player.ability_used);
        assert!(!player.penalty_applied);
        assert!(!player.acknowledged);
        assert!(player.round_impacts.is_empty());
    }

    #[test]
    fn test_locked_bid_ignores_penalty_marker() {
        let mut player = GamePlayer::human(1, "a".to_string(), 300.0);
        assert_eq!(player.locked_bid(), None);
        player.current_bid = Some(-2.0);
        assert_eq!(player.locked_bid(), None);
        player.current_bid = Some(7.5);
        assert_eq!(player.locked_bid(), Some(7.5));
    }

    #[test]
    fn test_standings_order() {
        let mut state = state_with_players();
        state.players[0].tokens = 2;
        state.players[0].remaining_time = 10.0;
        state.players[1].tokens = 2;
        state.players[1].remaining_time = 50.0;
        state
            .players
            .push(GamePlayer::human(3, "c".to_string(), 300.0));
        state.players[2].tokens = 5;

        let standings = state.standings();
        assert_eq!(standings[0].player_id, 3);
        // Tie on tokens broken by remaining time.
        assert_eq!(standings[1].player_id, 2);
        assert_eq!(standings[2].player_id, 1);
    }

    #[test]
    fn test_snapshot_hides_secret_protocol() {
        let mut state = state_with_players();
        state.active_protocol = Some(ProtocolKind::Mole);
        state.mole_player_id = Some(1);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.active_protocol, None);

        state.active_protocol = Some(ProtocolKind::Panic);
        let snapshot = state.snapshot();
        assert_eq!(snapshot.active_protocol, Some(ProtocolKind::Panic));
    }

    #[test]
    fn test_snapshot_serializes_without_mole_id() {
        // The broadcast payload must not even be able to carry the secret
        // role; encode and scan the decoded structure.
        let mut state = state_with_players();
        state.active_protocol = Some(ProtocolKind::Mole);
        state.mole_player_id = Some(2);

        let bytes = bincode::serialize(&state.snapshot()).unwrap();
        let decoded: GameSnapshot = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.active_protocol, None);
    }

    #[test]
    fn test_gating_humans_skips_disconnected() {
        let mut state = state_with_players();
        state
            .players
            .push(GamePlayer::human(3, "c".to_string(), 300.0));
        state.players[2].connected = false;

        let gating: Vec<u32> = state.gating_humans().map(|p| p.id).collect();
        assert_eq!(gating, vec![1]);
    }

    #[test]
    fn test_counts() {
        let mut state = state_with_players();
        assert_eq!(state.active_count(), 2);
        assert_eq!(state.active_human_count(), 1);
        assert_eq!(state.connected_human_count(), 1);

        state.players[0].is_eliminated = true;
        assert_eq!(state.active_count(), 1);
        assert_eq!(state.active_human_count(), 0);
        // Eliminated but still connected humans keep the game live.
        assert_eq!(state.connected_human_count(), 1);
    }
}
