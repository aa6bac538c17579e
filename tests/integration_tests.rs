//! Integration tests for the game server components
//!
//! These tests validate cross-component interactions and real network
//! behavior: wire protocol round-trips, UDP datagram exchange, and the
//! lobby-to-engine handoff.

use bincode::{deserialize, serialize};
use shared::messages::{ClientCommand, ServerEvent};
use shared::{Driver, GamePhase, GameSettings, LobbyError};
use std::net::UdpSocket;
use std::thread;
use std::time::Duration;
use tokio::time::sleep;

/// WIRE PROTOCOL TESTS
mod protocol_tests {
    use super::*;

    /// Commands survive a serialization round-trip unchanged in kind.
    #[tokio::test]
    async fn command_serialization_roundtrip() {
        let commands = vec![
            ClientCommand::CreateLobby {
                name: "host".to_string(),
                settings: GameSettings::default(),
            },
            ClientCommand::JoinLobby {
                code: "AB12".to_string(),
                name: "guest".to_string(),
            },
            ClientCommand::ToggleReady,
            ClientCommand::StartGame,
            ClientCommand::SelectDriverInGame {
                driver: Driver::Phantom,
            },
            ClientCommand::ConfirmDriver,
            ClientCommand::Press,
            ClientCommand::Release,
            ClientCommand::ReadyNext,
            ClientCommand::Ping,
        ];

        for command in commands {
            let bytes = serialize(&command).unwrap();
            let back: ClientCommand = deserialize(&bytes).unwrap();
            assert_eq!(
                std::mem::discriminant(&command),
                std::mem::discriminant(&back),
                "command changed kind across the wire"
            );
        }
    }

    /// Events survive the reverse direction too.
    #[tokio::test]
    async fn event_serialization_roundtrip() {
        let events = vec![
            ServerEvent::ActionError {
                message: LobbyError::NotFound.to_string(),
            },
            ServerEvent::RoundResult {
                round: 4,
                winner: None,
                deadlock: true,
                eliminated: vec![2, 3],
            },
            ServerEvent::Pong,
        ];
        for event in events {
            let bytes = serialize(&event).unwrap();
            let back: ServerEvent = deserialize(&bytes).unwrap();
            assert_eq!(
                std::mem::discriminant(&event),
                std::mem::discriminant(&back)
            );
        }
    }

    /// Tests real UDP socket communication with a bincode command payload.
    #[tokio::test]
    async fn udp_socket_communication() {
        let server_socket = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind server socket");
        let server_addr = server_socket.local_addr().unwrap();

        // Echo server
        let server_socket_clone = server_socket.try_clone().unwrap();
        thread::spawn(move || {
            let mut buf = [0; 1024];
            if let Ok((size, client_addr)) = server_socket_clone.recv_from(&mut buf) {
                let _ = server_socket_clone.send_to(&buf[..size], client_addr);
            }
        });

        sleep(Duration::from_millis(10)).await;

        let client_socket = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind client socket");
        client_socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();

        let command = ClientCommand::JoinLobby {
            code: "XK42".to_string(),
            name: "traveler".to_string(),
        };
        let bytes = serialize(&command).unwrap();
        client_socket.send_to(&bytes, server_addr).unwrap();

        let mut buf = [0; 1024];
        let (size, _) = client_socket.recv_from(&mut buf).unwrap();
        let received: ClientCommand = deserialize(&buf[..size]).unwrap();

        match received {
            ClientCommand::JoinLobby { code, name } => {
                assert_eq!(code, "XK42");
                assert_eq!(name, "traveler");
            }
            _ => panic!("Wrong command received"),
        }
    }

    /// Malformed datagrams must fail decoding instead of producing garbage.
    #[test]
    fn malformed_datagram_handling() {
        let valid = serialize(&ClientCommand::Press).unwrap();

        let truncated = &valid[..valid.len() / 2];
        assert!(deserialize::<ClientCommand>(truncated).is_err());

        let mut corrupted = valid.clone();
        corrupted[0] = 0xFF;
        assert!(deserialize::<ClientCommand>(&corrupted).is_err());

        assert!(deserialize::<ClientCommand>(&[]).is_err());
    }
}

/// LOBBY-TO-ENGINE HANDOFF TESTS
mod lobby_flow_tests {
    use super::*;
    use server::engine::RoundEngine;
    use server::lobby::{generate_lobby_code, InMemoryLobbyStore, Lobby, LobbyStore};
    use std::time::Instant;

    #[test]
    fn full_lobby_lifecycle_seeds_a_game() {
        let mut store = InMemoryLobbyStore::new();
        let mut rng = rand::thread_rng();
        let code = generate_lobby_code(&store, &mut rng);

        let (mut lobby, host_id) =
            Lobby::new(code.clone(), "host".to_string(), GameSettings::default());
        let guest_id = lobby.join("guest".to_string()).unwrap();
        lobby.toggle_ready(host_id).unwrap();
        lobby.toggle_ready(guest_id).unwrap();
        lobby.select_driver(host_id, Driver::Clutch).unwrap();

        let roster = lobby.start(host_id).unwrap();
        store.insert(lobby);
        assert_eq!(roster.len(), 2);

        let (engine, outputs) = RoundEngine::with_seed(
            code.clone(),
            roster,
            GameSettings::default(),
            Instant::now(),
            7,
        );
        // Two humans: the game opens in driver selection, bots fill the
        // table to the minimum.
        assert_eq!(engine.state().phase, GamePhase::DriverSelection);
        assert_eq!(engine.state().players.len(), shared::MIN_PLAYERS);
        assert!(!outputs.is_empty());
        // The host's waiting-room preference carries into the game.
        assert_eq!(
            engine.state().player(host_id).unwrap().driver,
            Some(Driver::Clutch)
        );
    }

    #[test]
    fn start_errors_surface_to_the_caller() {
        let (mut lobby, host_id) =
            Lobby::new("AB12".to_string(), "host".to_string(), GameSettings::default());
        let guest_id = lobby.join("guest".to_string()).unwrap();
        lobby.toggle_ready(host_id).unwrap();

        assert_eq!(lobby.start(guest_id), Err(LobbyError::NotHost));
        assert_eq!(lobby.start(host_id), Err(LobbyError::InsufficientReady));
        lobby.toggle_ready(guest_id).unwrap();
        assert!(lobby.start(host_id).is_ok());
        assert_eq!(lobby.start(host_id), Err(LobbyError::AlreadyStarted));
    }

    #[test]
    fn generated_codes_are_unique_against_live_lobbies() {
        let mut store = InMemoryLobbyStore::new();
        let mut rng = rand::thread_rng();
        let mut codes = std::collections::HashSet::new();
        for _ in 0..20 {
            let code = generate_lobby_code(&store, &mut rng);
            assert!(codes.insert(code.clone()), "code {} repeated", code);
            let (lobby, _) = Lobby::new(code, "host".to_string(), GameSettings::default());
            store.insert(lobby);
        }
        assert_eq!(store.len(), 20);
    }
}

/// SESSION REGISTRY TESTS
mod session_tests {
    use server::session::SessionRegistry;
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    /// A reconnect from a new address takes over the seat cleanly.
    #[test]
    fn rejoin_rebinds_without_duplicates() {
        let mut registry = SessionRegistry::new();
        registry.bind(addr(9100), 1, "AB12");
        registry.bind(addr(9101), 2, "AB12");

        // Player 1 reconnects from a different port.
        registry.bind(addr(9102), 1, "AB12");

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.addr_of("AB12", 1), Some(addr(9102)));
        assert!(registry.find(&addr(9100)).is_none());
    }

    #[test]
    fn lobby_broadcast_targets_only_that_lobby() {
        let mut registry = SessionRegistry::new();
        registry.bind(addr(9100), 1, "AB12");
        registry.bind(addr(9101), 1, "CD34");

        assert_eq!(registry.addrs_in_lobby("AB12"), vec![addr(9100)]);
        assert_eq!(registry.addrs_in_lobby("CD34"), vec![addr(9101)]);
        assert!(registry.addrs_in_lobby("EF56").is_empty());
    }
}
