//! Full-game simulations
//!
//! The round engine takes every timestamp as an argument, so whole games can
//! be played out here tick by tick with synthesized instants, without sleeps
//! or wall-clock dependence. These scenarios exercise the machine end to end
//! the way a real lobby would.

use std::time::{Duration, Instant};

use assert_approx_eq::assert_approx_eq;
use server::engine::{EngineOutput, RoundEngine};
use server::lobby::RosterEntry;
use shared::messages::ServerEvent;
use shared::{
    DurationPreset, GamePhase, GameSettings, MomentFlag, COUNTDOWN_TICKS, MIN_PLAYERS,
};

fn at(t0: Instant, secs: f32) -> Instant {
    t0 + Duration::from_secs_f32(secs)
}

fn roster(n: usize) -> Vec<RosterEntry> {
    (1..=n)
        .map(|i| RosterEntry {
            id: i as u32,
            name: format!("human{}", i),
            driver_pref: None,
        })
        .collect()
}

fn quiet_settings() -> GameSettings {
    GameSettings {
        protocols_enabled: false,
        abilities_enabled: false,
        ..GameSettings::default()
    }
}

/// Presses the given humans, waits out the ready gate and countdown.
/// Returns the instant bidding opened.
fn drive_to_bidding(engine: &mut RoundEngine, humans: &[u32], start: Instant) -> Instant {
    for id in humans {
        engine.press(*id, start);
    }
    engine.tick(at(start, 3.0));
    assert_eq!(engine.state().phase, GamePhase::Countdown);
    for i in 0..COUNTDOWN_TICKS {
        engine.tick(at(start, 4.0 + i as f32));
    }
    assert_eq!(engine.state().phase, GamePhase::Bidding);
    at(start, 3.0 + COUNTDOWN_TICKS as f32)
}

/// Ticks until the bidding phase ends, collecting outputs.
fn run_out_bidding(engine: &mut RoundEngine, bid_start: Instant) -> Vec<EngineOutput> {
    let mut outputs = Vec::new();
    for i in 1..500 {
        outputs.extend(engine.tick(at(bid_start, i as f32)));
        if engine.state().phase != GamePhase::Bidding {
            return outputs;
        }
    }
    panic!("bidding never ended");
}

/// Scenario: one human and three auto-filled bots on the standard preset.
/// Driver selection is skipped, bots ready up inside 2.5 seconds, the 3s
/// all-holding gate fires the countdown, and the clock opens at 2.0s.
#[test]
fn single_human_standard_game_opening() {
    let t0 = Instant::now();
    let (mut engine, outputs) = RoundEngine::with_seed(
        "SIM1".to_string(),
        roster(1),
        quiet_settings(),
        t0,
        21,
    );

    assert!(outputs
        .iter()
        .any(|o| matches!(o, EngineOutput::Broadcast(ServerEvent::GameStarted { .. }))));
    assert_eq!(engine.state().phase, GamePhase::WaitingForReady);
    assert_eq!(engine.state().players.len(), MIN_PLAYERS);
    assert_eq!(engine.state().total_rounds, 9);
    for player in &engine.state().players {
        assert_eq!(player.remaining_time, 300.0);
    }

    engine.press(1, t0);
    engine.tick(at(t0, 2.5));
    assert!(engine
        .state()
        .players
        .iter()
        .filter(|p| p.is_bot)
        .all(|p| p.is_holding));
    assert_eq!(engine.state().phase, GamePhase::WaitingForReady);

    engine.tick(at(t0, 3.0));
    assert_eq!(engine.state().phase, GamePhase::Countdown);
    engine.tick(at(t0, 4.0));
    engine.tick(at(t0, 5.0));
    engine.tick(at(t0, 6.0));
    assert_eq!(engine.state().phase, GamePhase::Bidding);
    assert_eq!(
        engine.state().bidding_clock,
        DurationPreset::Standard.min_bid()
    );
    assert!(engine
        .state()
        .players
        .iter()
        .all(|p| p.is_holding && p.current_bid.is_none()));
}

/// Scenario: a human who never lets go burns through their entire bank, is
/// force-released at exactly the remaining time, and with no humans left the
/// remaining rounds fast-forward to a complete final standing.
#[test]
fn holding_forever_eliminates_and_fast_forwards() {
    let t0 = Instant::now();
    let (mut engine, _) = RoundEngine::with_seed(
        "SIM2".to_string(),
        roster(1),
        quiet_settings(),
        t0,
        22,
    );
    let total_rounds = engine.state().total_rounds;

    let bid_start = drive_to_bidding(&mut engine, &[1], t0);
    run_out_bidding(&mut engine, bid_start);

    let human = engine.state().player(1).unwrap();
    assert!(human.is_eliminated);
    // Force release locks the bid at exactly the full bank.
    assert_eq!(human.current_bid, Some(300.0));
    assert!(human.moment_flags.contains(&MomentFlag::AllIn));

    assert!(engine.finished());
    assert_eq!(engine.state().phase, GamePhase::GameOver);
    assert_eq!(engine.state().round, total_rounds);

    // One token per fast-forwarded round keeps the standings meaningful.
    let bot_tokens: u32 = engine
        .state()
        .players
        .iter()
        .filter(|p| p.is_bot)
        .map(|p| p.tokens)
        .sum();
    assert!(bot_tokens >= total_rounds - 1);

    let standings = engine.state().standings();
    assert_eq!(standings.len(), MIN_PLAYERS);
    assert!(standings[0].is_bot);
    for pair in standings.windows(2) {
        assert!(
            pair[0].tokens > pair[1].tokens
                || (pair[0].tokens == pair[1].tokens
                    && pair[0].remaining_time >= pair[1].remaining_time)
        );
    }
}

/// Scenario: a human disconnects mid-bidding while holding. The seat is not
/// eliminated, and after rejoining with the same identity the bid can still
/// be released normally before round end.
#[test]
fn disconnect_and_rejoin_mid_bidding() {
    let t0 = Instant::now();
    let (mut engine, _) = RoundEngine::with_seed(
        "SIM3".to_string(),
        roster(2),
        quiet_settings(),
        t0,
        23,
    );
    assert_eq!(engine.state().phase, GamePhase::DriverSelection);
    engine.select_driver(1, shared::Driver::Metronome, t0);
    engine.select_driver(2, shared::Driver::Banker, t0);
    engine.confirm_driver(1, t0);
    engine.confirm_driver(2, t0);
    assert_eq!(engine.state().phase, GamePhase::WaitingForReady);

    let bid_start = drive_to_bidding(&mut engine, &[1, 2], t0);
    engine.tick(at(bid_start, 1.0));

    engine.player_disconnected(2, at(bid_start, 1.2));
    let seat = engine.state().player(2).unwrap();
    assert!(!seat.connected);
    assert!(!seat.is_eliminated);
    assert!(seat.is_holding);

    let outputs = engine.player_rejoined(2, at(bid_start, 2.0));
    assert!(outputs.iter().any(|o| matches!(
        o,
        EngineOutput::ToPlayer(2, ServerEvent::GameState { .. })
    )));

    engine.release(2, at(bid_start, 2.5));
    let seat = engine.state().player(2).unwrap();
    assert!(!seat.is_eliminated);
    // Floor 2.0 plus the 2.5 seconds held after the gun.
    assert_approx_eq!(seat.current_bid.unwrap(), 4.5, 0.01);
}

/// A complete standard game, one human releasing early every round. The
/// round counter only climbs, no seat is ever removed, and the bank never
/// goes negative at any round boundary.
#[test]
fn full_game_invariants_hold() {
    let t0 = Instant::now();
    let (mut engine, _) = RoundEngine::with_seed(
        "SIM4".to_string(),
        roster(1),
        quiet_settings(),
        t0,
        24,
    );
    let total_rounds = engine.state().total_rounds;
    let seat_count = engine.state().players.len();

    let mut now = t0;
    let mut last_round = 0;
    let mut rounds_played = 0;
    while !engine.finished() {
        rounds_played += 1;
        assert!(rounds_played <= total_rounds, "game overran its rounds");
        assert!(engine.state().round > last_round);
        last_round = engine.state().round;

        let bid_start = drive_to_bidding(&mut engine, &[1], now);
        engine.tick(at(bid_start, 1.0));
        engine.release(1, at(bid_start, 1.0));
        run_out_bidding(&mut engine, bid_start);

        assert_eq!(engine.state().players.len(), seat_count);
        for player in &engine.state().players {
            assert!(player.remaining_time >= 0.0);
            if player.remaining_time == 0.0 {
                assert!(player.is_eliminated);
            }
        }

        if engine.state().phase == GamePhase::RoundEnd {
            engine.ready_next(1, at(bid_start, 400.0));
        }
        now = at(bid_start, 410.0);
    }

    assert_eq!(engine.state().phase, GamePhase::GameOver);
    assert!(engine.state().round <= total_rounds);
    assert!(!engine.state().game_log.is_empty());
}

/// With protocols and abilities on, secret protocols must never surface in
/// a lobby-wide `GameState` or `ProtocolDetail` payload. Only the targeted
/// events and the end-of-round reveal may mention them.
#[test]
fn secret_protocols_stay_out_of_broadcasts() {
    let t0 = Instant::now();
    let settings = GameSettings::default();
    let (mut engine, mut outputs) = RoundEngine::with_seed(
        "SIM5".to_string(),
        roster(1),
        settings,
        t0,
        25,
    );

    let mut now = t0;
    let mut rounds_played = 0;
    while !engine.finished() && rounds_played < 20 {
        rounds_played += 1;
        let bid_start = drive_to_bidding(&mut engine, &[1], now);
        outputs.extend(engine.tick(at(bid_start, 1.0)));
        outputs.extend(engine.release(1, at(bid_start, 1.0)));
        outputs.extend(run_out_bidding(&mut engine, bid_start));
        if engine.state().phase == GamePhase::RoundEnd {
            outputs.extend(engine.ready_next(1, at(bid_start, 400.0)));
        }
        now = at(bid_start, 410.0);
    }

    for output in &outputs {
        match output {
            EngineOutput::Broadcast(ServerEvent::GameState { snapshot }) => {
                if let Some(protocol) = snapshot.active_protocol {
                    assert!(
                        !protocol.is_secret(),
                        "secret protocol {:?} leaked into a broadcast snapshot",
                        protocol
                    );
                }
            }
            EngineOutput::Broadcast(ServerEvent::ProtocolDetail { protocol, .. }) => {
                assert!(
                    !protocol.is_secret(),
                    "secret protocol {:?} briefed lobby-wide",
                    protocol
                );
            }
            _ => {}
        }
    }
    assert!(engine.finished());
}
