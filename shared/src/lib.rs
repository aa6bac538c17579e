use serde::{Deserialize, Serialize};

pub mod messages;

pub const TIE_EPSILON: f32 = 0.05;
pub const MOLE_SAFE_MARGIN: f32 = 7.0;
pub const CLOSE_WIN_EPSILON: f32 = 1.1;
pub const BIG_BID_THRESHOLD: f32 = 15.0;
pub const TIME_TAX_AMOUNT: f32 = 1.5;
pub const MOLE_TOKEN_PENALTY: u32 = 2;

pub const MIN_PLAYERS: usize = 4;
pub const MAX_PLAYERS: usize = 8;

pub const READY_GATE_SECS: f32 = 3.0;
pub const COUNTDOWN_TICKS: u32 = 3;
pub const BIDDING_MIN_ELAPSED: f32 = 0.5;
pub const BOT_READY_DELAY_MIN: f32 = 0.5;
pub const BOT_READY_DELAY_MAX: f32 = 2.5;
pub const PROTOCOL_HISTORY_WINDOW: usize = 3;
pub const LOW_BANK_FRACTION: f32 = 0.2;

pub const LOBBY_CODE_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurationPreset {
    Short,
    Standard,
    Long,
}

impl DurationPreset {
    pub fn total_rounds(&self) -> u32 {
        match self {
            DurationPreset::Short => 5,
            DurationPreset::Standard => 9,
            DurationPreset::Long => 13,
        }
    }

    pub fn time_bank(&self) -> f32 {
        match self {
            DurationPreset::Short => 150.0,
            DurationPreset::Standard => 300.0,
            DurationPreset::Long => 450.0,
        }
    }

    /// Floor value of the bidding clock. The clock starts here, never at zero.
    pub fn min_bid(&self) -> f32 {
        match self {
            DurationPreset::Short => 1.0,
            DurationPreset::Standard => 2.0,
            DurationPreset::Long => 4.0,
        }
    }

    /// Flat deduction for releasing during the countdown window.
    pub fn countdown_penalty(&self) -> f32 {
        self.min_bid()
    }

    pub fn protocol_chance(&self) -> f64 {
        match self {
            DurationPreset::Short => 0.5,
            DurationPreset::Standard => 0.4,
            DurationPreset::Long => 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameVariant {
    GrandPrix,
    Endurance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Difficulty {
    Casual,
    Normal,
    Ruthless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Personality {
    Aggressive,
    Conservative,
    Random,
    Balanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GamePhase {
    DriverSelection,
    WaitingForReady,
    Countdown,
    Bidding,
    RoundEnd,
    GameOver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Driver {
    Metronome,
    Banker,
    Clutch,
    Juggernaut,
    Gambler,
    Leech,
    Jammer,
    Hairpin,
    Bedrock,
    Phantom,
}

impl Driver {
    pub const ALL: [Driver; 10] = [
        Driver::Metronome,
        Driver::Banker,
        Driver::Clutch,
        Driver::Juggernaut,
        Driver::Gambler,
        Driver::Leech,
        Driver::Jammer,
        Driver::Hairpin,
        Driver::Bedrock,
        Driver::Phantom,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Driver::Metronome => "metronome",
            Driver::Banker => "banker",
            Driver::Clutch => "clutch",
            Driver::Juggernaut => "juggernaut",
            Driver::Gambler => "gambler",
            Driver::Leech => "leech",
            Driver::Jammer => "jammer",
            Driver::Hairpin => "hairpin",
            Driver::Bedrock => "bedrock",
            Driver::Phantom => "phantom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolKind {
    Panic,
    Mole,
    DoubleTokens,
    TimeTax,
    LowBid,
    NoLook,
    Mute,
    PrivateChannel,
}

impl ProtocolKind {
    /// Secret protocols are announced lobby-wide only after the round ends.
    pub fn is_secret(&self) -> bool {
        matches!(
            self,
            ProtocolKind::Mole | ProtocolKind::TimeTax | ProtocolKind::LowBid
        )
    }

    /// Protocols that make bots bid more cautiously.
    pub fn raises_caution(&self) -> bool {
        matches!(
            self,
            ProtocolKind::Panic | ProtocolKind::NoLook | ProtocolKind::Mute
        )
    }

    pub fn id(&self) -> &'static str {
        match self {
            ProtocolKind::Panic => "panic",
            ProtocolKind::Mole => "mole",
            ProtocolKind::DoubleTokens => "double_tokens",
            ProtocolKind::TimeTax => "time_tax",
            ProtocolKind::LowBid => "low_bid",
            ProtocolKind::NoLook => "no_look",
            ProtocolKind::Mute => "mute",
            ProtocolKind::PrivateChannel => "private_channel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GameSettings {
    pub difficulty: Difficulty,
    pub protocols_enabled: bool,
    pub abilities_enabled: bool,
    pub variant: GameVariant,
    pub duration: DurationPreset,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            difficulty: Difficulty::Normal,
            protocols_enabled: true,
            abilities_enabled: true,
            variant: GameVariant::GrandPrix,
            duration: DurationPreset::Standard,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImpactKind {
    BidDeduction,
    CountdownPenalty,
    AbilityRefund,
    AbilitySteal,
    AbilityTokens,
    ProtocolTax,
    ProtocolTokens,
    RoundTokens,
}

/// One entry of a player's per-round audit trail, shown in the round recap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundImpact {
    pub kind: ImpactKind,
    pub value: f32,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MomentFlag {
    PhotoFinish,
    Steamroll,
    BigSpender,
    AllIn,
    LastStand,
    Untouched,
}

/// Who is allowed to see a resolver event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    DriverOnly,
    TargetOnly,
    DriverAndTarget,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyError {
    NotFound,
    Full,
    AlreadyStarted,
    NotHost,
    InsufficientReady,
    NotInLobby,
    DriverTaken,
}

impl std::fmt::Display for LobbyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            LobbyError::NotFound => "lobby not found",
            LobbyError::Full => "lobby is full",
            LobbyError::AlreadyStarted => "game already started",
            LobbyError::NotHost => "only the host can do that",
            LobbyError::InsufficientReady => "not enough ready players",
            LobbyError::NotInLobby => "you are not in a lobby",
            LobbyError::DriverTaken => "that driver is already taken",
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for LobbyError {}

/// Public view of a seat. Never carries bot targets or secret roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub id: u32,
    pub name: String,
    pub is_bot: bool,
    pub connected: bool,
    pub driver: Option<Driver>,
    pub driver_confirmed: bool,
    pub tokens: u32,
    pub remaining_time: f32,
    pub total_time_bid: f32,
    pub current_bid: Option<f32>,
    pub is_holding: bool,
    pub is_eliminated: bool,
    pub ability_used: bool,
    pub acknowledged: bool,
    pub round_impacts: Vec<RoundImpact>,
    pub moment_flags: Vec<MomentFlag>,
    pub protocol_wins: Vec<ProtocolKind>,
}

/// Full sanitized state broadcast. Clients replace their local copy wholesale;
/// two identical snapshots in a row must be indistinguishable to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub lobby_code: String,
    pub round: u32,
    pub total_rounds: u32,
    pub phase: GamePhase,
    pub countdown_remaining: u32,
    pub bidding_clock: f32,
    /// Only public protocols appear here; secret ones stay None until revealed.
    pub active_protocol: Option<ProtocolKind>,
    pub is_double_tokens_round: bool,
    pub settings: GameSettings,
    pub players: Vec<PlayerSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyPlayerSnapshot {
    pub id: u32,
    pub name: String,
    pub ready: bool,
    pub connected: bool,
    pub driver_pref: Option<Driver>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbySnapshot {
    pub code: String,
    pub host_id: u32,
    pub in_game: bool,
    pub settings: GameSettings,
    pub players: Vec<LobbyPlayerSnapshot>,
}

/// Final placement row, ordered by tokens then remaining time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Standing {
    pub player_id: u32,
    pub name: String,
    pub is_bot: bool,
    pub tokens: u32,
    pub remaining_time: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_tables() {
        assert_eq!(DurationPreset::Standard.total_rounds(), 9);
        assert_eq!(DurationPreset::Standard.time_bank(), 300.0);
        assert_eq!(DurationPreset::Standard.min_bid(), 2.0);
        assert_eq!(DurationPreset::Short.min_bid(), 1.0);
        assert_eq!(DurationPreset::Long.min_bid(), 4.0);
        assert_eq!(DurationPreset::Short.protocol_chance(), 0.5);
        assert_eq!(DurationPreset::Long.protocol_chance(), 0.3);
    }

    #[test]
    fn test_penalty_matches_min_bid() {
        for preset in [
            DurationPreset::Short,
            DurationPreset::Standard,
            DurationPreset::Long,
        ] {
            assert_eq!(preset.countdown_penalty(), preset.min_bid());
        }
    }

    #[test]
    fn test_secret_protocols() {
        assert!(ProtocolKind::Mole.is_secret());
        assert!(ProtocolKind::TimeTax.is_secret());
        assert!(ProtocolKind::LowBid.is_secret());
        assert!(!ProtocolKind::Panic.is_secret());
        assert!(!ProtocolKind::DoubleTokens.is_secret());
    }

    #[test]
    fn test_caution_protocols() {
        assert!(ProtocolKind::Panic.raises_caution());
        assert!(ProtocolKind::NoLook.raises_caution());
        assert!(ProtocolKind::Mute.raises_caution());
        assert!(!ProtocolKind::Mole.raises_caution());
    }

    #[test]
    fn test_driver_ids_unique() {
        let mut ids: Vec<&str> = Driver::ALL.iter().map(|d| d.id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), Driver::ALL.len());
    }

    #[test]
    fn test_lobby_error_display() {
        assert_eq!(LobbyError::NotFound.to_string(), "lobby not found");
        assert_eq!(LobbyError::Full.to_string(), "lobby is full");
    }

    #[test]
    fn test_default_settings() {
        let settings = GameSettings::default();
        assert!(settings.protocols_enabled);
        assert!(settings.abilities_enabled);
        assert_eq!(settings.duration, DurationPreset::Standard);
        assert_eq!(settings.variant, GameVariant::GrandPrix);
    }
}
