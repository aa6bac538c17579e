//! Bot bidding policy
//!
//! Pure decision functions consumed by the round engine. A target bid is
//! drawn once per bidding window; `should_release_now` is then checked every
//! tick against the shared clock. Targets are deliberately jittered so a
//! table of bots never locks identical bids.

use rand::Rng;

use shared::{
    Difficulty, GameSettings, Personality, ProtocolKind, BOT_READY_DELAY_MAX, BOT_READY_DELAY_MIN,
    LOW_BANK_FRACTION,
};

const BOT_NAMES: [&str; 8] = [
    "Axle", "Gasket", "Piston", "Camber", "Spoiler", "Turbo", "Dipstick", "Flywheel",
];

/// Name and personality for the nth auto-filled seat.
pub fn bot_profile<R: Rng>(index: usize, rng: &mut R) -> (String, Personality) {
    let name = BOT_NAMES[index % BOT_NAMES.len()].to_string();
    let personality = match rng.gen_range(0..4) {
        0 => Personality::Aggressive,
        1 => Personality::Conservative,
        2 => Personality::Random,
        _ => Personality::Balanced,
    };
    (name, personality)
}

/// Randomized waiting-room delay before a bot starts holding.
pub fn ready_delay<R: Rng>(rng: &mut R) -> f32 {
    rng.gen_range(BOT_READY_DELAY_MIN..BOT_READY_DELAY_MAX)
}

/// Picks the seconds a bot intends to hold this round.
///
/// The result is a personality-banded fraction of the bot's remaining time,
/// nudged by the final round, caution-raising protocols, a thin time bank,
/// and the lobby difficulty, then clamped to `[min_bid, remaining]`.
pub fn decide_bot_bid<R: Rng>(
    personality: Personality,
    remaining: f32,
    time_bank: f32,
    is_final_round: bool,
    protocol: Option<ProtocolKind>,
    settings: &GameSettings,
    rng: &mut R,
) -> f32 {
    let mut fraction: f32 = match personality {
        Personality::Conservative => rng.gen_range(0.08..0.15),
        Personality::Balanced => rng.gen_range(0.15..0.25),
        Personality::Aggressive => rng.gen_range(0.25..0.40),
        Personality::Random => rng.gen_range(0.02..0.50),
    };

    if is_final_round {
        // Nothing to save time for; everyone pushes.
        fraction = (fraction * 2.5).min(0.9);
    }

    if protocol.map(|p| p.raises_caution()).unwrap_or(false) {
        fraction *= 0.6;
    }

    if remaining < time_bank * LOW_BANK_FRACTION {
        fraction *= 0.5;
    }

    fraction *= match settings.difficulty {
        Difficulty::Casual => 0.85,
        Difficulty::Normal => 1.0,
        Difficulty::Ruthless => 1.15,
    };

    let min_bid = settings.duration.min_bid();
    let target = remaining * fraction;
    // A bank thinner than the minimum bid can only go all in.
    target.clamp(min_bid.min(remaining), remaining)
}

/// Checked each bidding tick against the shared clock.
pub fn should_release_now(target: f32, elapsed: f32) -> bool {
    elapsed >= target
}
