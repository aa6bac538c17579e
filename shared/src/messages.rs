//! Wire protocol between clients and the authoritative server.
//!
//! One closed enum per direction: `ClientCommand` inbound, `ServerEvent`
//! outbound. Both travel as bincode-serialized UDP datagrams. Handlers match
//! exhaustively so adding a message is a compile-time event everywhere.

use serde::{Deserialize, Serialize};

use crate::{
    Driver, GameSettings, GameSnapshot, LobbySnapshot, ProtocolKind, RoundImpact, Standing,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientCommand {
    CreateLobby {
        name: String,
        settings: GameSettings,
    },
    JoinLobby {
        code: String,
        name: String,
    },
    LeaveLobby,
    ToggleReady,
    UpdateSettings {
        settings: GameSettings,
    },
    /// Pre-game driver preference from the waiting room.
    SelectDriver {
        driver: Driver,
    },
    StartGame,
    SelectDriverInGame {
        driver: Driver,
    },
    ConfirmDriver,
    Press,
    Release,
    ReadyNext,
    RejoinGame {
        code: String,
        player_id: u32,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerEvent {
    LobbyUpdate {
        lobby: LobbySnapshot,
    },
    /// Synchronous rejection of a lobby-flow command. Game-phase commands that
    /// do not apply are dropped silently instead.
    ActionError {
        message: String,
    },
    GameStarted {
        snapshot: GameSnapshot,
    },
    GameState {
        snapshot: GameSnapshot,
    },
    /// A driver ability fired. Routed per the resolver's visibility tag.
    RealityModeAbility {
        driver: Driver,
        description: String,
        impacts: Vec<RoundImpact>,
    },
    /// Targeted protocol briefing (e.g. the mole learns they are the mole).
    ProtocolDetail {
        protocol: ProtocolKind,
        detail: String,
    },
    /// Lobby-wide unveiling of a secret protocol at round end.
    ProtocolReveal {
        protocol: ProtocolKind,
        summary: String,
    },
    RoundResult {
        round: u32,
        winner: Option<u32>,
        deadlock: bool,
        eliminated: Vec<u32>,
    },
    GameOver {
        standings: Vec<Standing>,
    },
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DurationPreset, GamePhase};

    #[test]
    fn test_command_roundtrip() {
        let commands = vec![
            ClientCommand::CreateLobby {
                name: "alba".to_string(),
                settings: GameSettings::default(),
            },
            ClientCommand::JoinLobby {
                code: "AB12".to_string(),
                name: "finn".to_string(),
            },
            ClientCommand::ToggleReady,
            ClientCommand::SelectDriverInGame {
                driver: Driver::Clutch,
            },
            ClientCommand::Press,
            ClientCommand::Release,
            ClientCommand::ReadyNext,
            ClientCommand::RejoinGame {
                code: "AB12".to_string(),
                player_id: 3,
            },
        ];

        for command in commands {
            let bytes = bincode::serialize(&command).unwrap();
            let back: ClientCommand = bincode::deserialize(&bytes).unwrap();
            match (&command, &back) {
                (ClientCommand::CreateLobby { name: a, .. }, ClientCommand::CreateLobby { name: b, .. }) => {
                    assert_eq!(a, b)
                }
                (ClientCommand::JoinLobby { code: a, .. }, ClientCommand::JoinLobby { code: b, .. }) => {
                    assert_eq!(a, b)
                }
                (ClientCommand::ToggleReady, ClientCommand::ToggleReady) => {}
                (
                    ClientCommand::SelectDriverInGame { driver: a },
                    ClientCommand::SelectDriverInGame { driver: b },
                ) => assert_eq!(a, b),
                (ClientCommand::Press, ClientCommand::Press) => {}
                (ClientCommand::Release, ClientCommand::Release) => {}
                (ClientCommand::ReadyNext, ClientCommand::ReadyNext) => {}
                (
                    ClientCommand::RejoinGame { player_id: a, .. },
                    ClientCommand::RejoinGame { player_id: b, .. },
                ) => assert_eq!(a, b),
                _ => panic!("command type changed across the wire"),
            }
        }
    }

    #[test]
    fn test_event_roundtrip() {
        let event = ServerEvent::RoundResult {
            round: 3,
            winner: Some(2),
            deadlock: false,
            eliminated: vec![4],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let back: ServerEvent = bincode::deserialize(&bytes).unwrap();
        match back {
            ServerEvent::RoundResult {
                round,
                winner,
                deadlock,
                eliminated,
            } => {
                assert_eq!(round, 3);
                assert_eq!(winner, Some(2));
                assert!(!deadlock);
                assert_eq!(eliminated, vec![4]);
            }
            _ => panic!("event type changed across the wire"),
        }
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let snapshot = GameSnapshot {
            lobby_code: "XK42".to_string(),
            round: 1,
            total_rounds: DurationPreset::Standard.total_rounds(),
            phase: GamePhase::WaitingForReady,
            countdown_remaining: 0,
            bidding_clock: 0.0,
            active_protocol: None,
            is_double_tokens_round: false,
            settings: GameSettings::default(),
            players: vec![],
        };
        let bytes = bincode::serialize(&ServerEvent::GameState { snapshot }).unwrap();
        let back: ServerEvent = bincode::deserialize(&bytes).unwrap();
        match back {
            ServerEvent::GameState { snapshot } => {
                assert_eq!(snapshot.lobby_code, "XK42");
                assert_eq!(snapshot.phase, GamePhase::WaitingForReady);
            }
            _ => panic!("event type changed across the wire"),
        }
    }
}
