//! Round protocol rolling
//!
//! A protocol is an optional round-wide modifier rolled while the lobby
//! waits to ready up. The roll probability comes from the duration preset,
//! the candidate pool from the variant and the table composition, and the
//! last few rolled protocols are excluded so rounds do not repeat
//! themselves back to back.

use rand::seq::SliceRandom;
use rand::Rng;

use shared::{DurationPreset, GameSettings, GameVariant, ProtocolKind, PROTOCOL_HISTORY_WINDOW};

/// Protocols that can appear this round.
///
/// Mole needs at least three live seats to be interesting, and a private
/// channel needs two humans who can actually talk. The Endurance theme drops
/// the private channel entirely.
pub fn protocol_pool(
    variant: GameVariant,
    active_players: usize,
    connected_humans: usize,
) -> Vec<ProtocolKind> {
    let mut pool = vec![
        ProtocolKind::Panic,
        ProtocolKind::DoubleTokens,
        ProtocolKind::TimeTax,
        ProtocolKind::LowBid,
        ProtocolKind::NoLook,
        ProtocolKind::Mute,
    ];
    if active_players >= 3 {
        pool.push(ProtocolKind::Mole);
    }
    if connected_humans >= 2 && variant == GameVariant::GrandPrix {
        pool.push(ProtocolKind::PrivateChannel);
    }
    pool
}

/// Rolls the protocol for the upcoming round, if any.
pub fn roll_protocol<R: Rng>(
    rng: &mut R,
    preset: DurationPreset,
    settings: &GameSettings,
    history: &[ProtocolKind],
    active_players: usize,
    connected_humans: usize,
) -> Option<ProtocolKind> {
    if !settings.protocols_enabled {
        return None;
    }
    if !rng.gen_bool(preset.protocol_chance()) {
        return None;
    }

    let recent: Vec<ProtocolKind> = history
        .iter()
        .rev()
        .take(PROTOCOL_HISTORY_WINDOW)
        .copied()
        .collect();
    let pool: Vec<ProtocolKind> = protocol_pool(settings.variant, active_players, connected_humans)
        .into_iter()
        .filter(|p| !recent.contains(p))
        .collect();

    pool.choose(rng).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_disabled_settings_never_roll() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut settings = GameSettings::default();
        settings.protocols_enabled = false;
        for _ in 0..50 {
            assert_eq!(
                roll_protocol(&mut rng, DurationPreset::Short, &settings, &[], 4, 2),
                None
            );
        }
    }

    #[test]
    fn test_roll_rate_tracks_preset() {
        let settings = GameSettings::default();
        let mut rng = StdRng::seed_from_u64(2);
        let rolls = (0..1000)
            .filter(|_| {
                roll_protocol(&mut rng, DurationPreset::Short, &settings, &[], 4, 2).is_some()
            })
            .count();
        // Short preset rolls half the time; allow generous slack.
        assert!((350..650).contains(&rolls), "rolled {} of 1000", rolls);
    }

    #[test]
    fn test_recent_history_excluded() {
        let settings = GameSettings::default();
        let mut rng = StdRng::seed_from_u64(3);
        let history = vec![
            ProtocolKind::Panic,
            ProtocolKind::Mole,
            ProtocolKind::TimeTax,
        ];
        for _ in 0..200 {
            if let Some(protocol) =
                roll_protocol(&mut rng, DurationPreset::Short, &settings, &history, 4, 2)
            {
                assert!(!history.contains(&protocol), "{:?} repeated", protocol);
            }
        }
    }

    #[test]
    fn test_history_window_only_covers_last_three() {
        let settings = GameSettings::default();
        let mut rng = StdRng::seed_from_u64(4);
        // Panic is four rounds back, so it is allowed again.
        let history = vec![
            ProtocolKind::Panic,
            ProtocolKind::Mole,
            ProtocolKind::TimeTax,
            ProtocolKind::LowBid,
        ];
        let mut saw_panic = false;
        for _ in 0..500 {
            if let Some(ProtocolKind::Panic) =
                roll_protocol(&mut rng, DurationPreset::Short, &settings, &history, 4, 2)
            {
                saw_panic = true;
                break;
            }
        }
        assert!(saw_panic);
    }

    #[test]
    fn test_pool_composition() {
        let pool = protocol_pool(GameVariant::GrandPrix, 2, 1);
        assert!(!pool.contains(&ProtocolKind::Mole));
        assert!(!pool.contains(&ProtocolKind::PrivateChannel));

        let pool = protocol_pool(GameVariant::GrandPrix, 4, 2);
        assert!(pool.contains(&ProtocolKind::Mole));
        assert!(pool.contains(&ProtocolKind::PrivateChannel));

        let pool = protocol_pool(GameVariant::Endurance, 4, 2);
        assert!(pool.contains(&ProtocolKind::Mole));
        assert!(!pool.contains(&ProtocolKind::PrivateChannel));
    }
}
