//! Declarative driver ability table
//!
//! Every driver maps to one descriptor: a trigger condition, an effect, and
//! a visibility rule. The resolver consumes the table uniformly; there is no
//! per-driver branching anywhere else in the codebase, so adding a driver
//! means adding a row here.

use shared::{Driver, GameVariant, Visibility, BIG_BID_THRESHOLD, CLOSE_WIN_EPSILON, MOLE_SAFE_MARGIN};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AbilityTrigger {
    /// Fires every round the driver survives.
    Always,
    OnWin,
    /// Won by no more than `epsilon` seconds over the runner-up.
    OnCloseWin { epsilon: f32 },
    /// Won by strictly more than `min_margin` seconds.
    OnWinMargin { min_margin: f32 },
    /// Bid over `threshold` seconds and still lost the round.
    OnLoseBigBid { threshold: f32 },
    /// Targets another player at round end.
    Disrupt,
    /// Consulted when a countdown release would cost the flat penalty.
    OnCountdownRelease,
    /// No round-end action; the effect is an immunity consulted elsewhere.
    Passive,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AbilityEffect {
    RefundTime(f32),
    BonusTokens(u32),
    StealFromWinner(f32),
    DrainRandomOpponent(f32),
    WaivePenalty,
    ProtocolImmunity,
    FullImmunity,
}

#[derive(Debug, Clone, Copy)]
pub struct AbilityDescriptor {
    pub driver: Driver,
    pub trigger: AbilityTrigger,
    pub effect: AbilityEffect,
    pub visibility: Visibility,
    pub blurb: &'static str,
}

/// Row order must match the discriminant order of [`Driver`].
pub const ABILITIES: [AbilityDescriptor; 10] = [
    AbilityDescriptor {
        driver: Driver::Metronome,
        trigger: AbilityTrigger::Always,
        effect: AbilityEffect::RefundTime(1.0),
        visibility: Visibility::TargetOnly,
        blurb: "banks one second back every round",
    },
    AbilityDescriptor {
        driver: Driver::Banker,
        trigger: AbilityTrigger::OnWin,
        effect: AbilityEffect::RefundTime(1.0),
        visibility: Visibility::DriverAndTarget,
        blurb: "a win refunds one second",
    },
    AbilityDescriptor {
        driver: Driver::Clutch,
        trigger: AbilityTrigger::OnCloseWin {
            epsilon: CLOSE_WIN_EPSILON,
        },
        effect: AbilityEffect::BonusTokens(1),
        visibility: Visibility::All,
        blurb: "photo-finish wins pay a bonus token",
    },
    AbilityDescriptor {
        driver: Driver::Juggernaut,
        trigger: AbilityTrigger::OnWinMargin {
            min_margin: MOLE_SAFE_MARGIN,
        },
        effect: AbilityEffect::RefundTime(2.0),
        visibility: Visibility::All,
        blurb: "crushing wins refund two seconds",
    },
    AbilityDescriptor {
        driver: Driver::Gambler,
        trigger: AbilityTrigger::OnLoseBigBid {
            threshold: BIG_BID_THRESHOLD,
        },
        effect: AbilityEffect::RefundTime(3.0),
        visibility: Visibility::TargetOnly,
        blurb: "losing a huge bid refunds three seconds",
    },
    AbilityDescriptor {
        driver: Driver::Leech,
        trigger: AbilityTrigger::Disrupt,
        effect: AbilityEffect::StealFromWinner(1.5),
        visibility: Visibility::DriverAndTarget,
        blurb: "siphons time from the round winner",
    },
    AbilityDescriptor {
        driver: Driver::Jammer,
        trigger: AbilityTrigger::Disrupt,
        effect: AbilityEffect::DrainRandomOpponent(2.0),
        visibility: Visibility::TargetOnly,
        blurb: "burns time off a random rival",
    },
    AbilityDescriptor {
        driver: Driver::Hairpin,
        trigger: AbilityTrigger::OnCountdownRelease,
        effect: AbilityEffect::WaivePenalty,
        visibility: Visibility::DriverOnly,
        blurb: "bails out of the countdown for free",
    },
    AbilityDescriptor {
        driver: Driver::Bedrock,
        trigger: AbilityTrigger::Passive,
        effect: AbilityEffect::ProtocolImmunity,
        visibility: Visibility::All,
        blurb: "shrugs off protocol effects",
    },
    AbilityDescriptor {
        driver: Driver::Phantom,
        trigger: AbilityTrigger::Passive,
        effect: AbilityEffect::FullImmunity,
        visibility: Visibility::All,
        blurb: "cannot be touched by any ability",
    },
];

pub fn descriptor(driver: Driver) -> &'static AbilityDescriptor {
    &ABILITIES[driver as usize]
}

/// Immune to round-level protocol effects (time tax and the like).
pub fn protocol_immune(driver: Option<Driver>) -> bool {
    matches!(
        driver.map(|d| descriptor(d).effect),
        Some(AbilityEffect::ProtocolImmunity) | Some(AbilityEffect::FullImmunity)
    )
}

/// Cannot be chosen as a disrupt target. Protocol immunity alone only blocks
/// disrupts under the Endurance variant; full immunity always does.
pub fn disrupt_immune(driver: Option<Driver>, variant: GameVariant) -> bool {
    match driver.map(|d| descriptor(d).effect) {
        Some(AbilityEffect::FullImmunity) => true,
        Some(AbilityEffect::ProtocolImmunity) => variant == GameVariant::Endurance,
        _ => false,
    }
}

/// Whether this driver skips the countdown release penalty.
pub fn waives_countdown_penalty(driver: Option<Driver>) -> bool {
    matches!(
        driver.map(|d| descriptor(d).trigger),
        Some(AbilityTrigger::OnCountdownRelease)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_order_matches_enum() {
        for (index, driver) in Driver::ALL.iter().enumerate() {
            assert_eq!(ABILITIES[index].driver, *driver);
            assert_eq!(descriptor(*driver).driver, *driver);
        }
    }

    #[test]
    fn test_protocol_immunity() {
        assert!(protocol_immune(Some(Driver::Bedrock)));
        assert!(protocol_immune(Some(Driver::Phantom)));
        assert!(!protocol_immune(Some(Driver::Leech)));
        assert!(!protocol_immune(None));
    }

    #[test]
    fn test_disrupt_immunity_by_variant() {
        // Base variant: protocol immunity does not block disrupts.
        assert!(!disrupt_immune(Some(Driver::Bedrock), GameVariant::GrandPrix));
        assert!(disrupt_immune(Some(Driver::Bedrock), GameVariant::Endurance));
        // Full immunity blocks disrupts in every variant.
        assert!(disrupt_immune(Some(Driver::Phantom), GameVariant::GrandPrix));
        assert!(disrupt_immune(Some(Driver::Phantom), GameVariant::Endurance));
        assert!(!disrupt_immune(Some(Driver::Metronome), GameVariant::GrandPrix));
    }

    #[test]
    fn test_penalty_waiver() {
        assert!(waives_countdown_penalty(Some(Driver::Hairpin)));
        assert!(!waives_countdown_penalty(Some(Driver::Clutch)));
        assert!(!waives_countdown_penalty(None));
    }

    #[test]
    fn test_thresholds_come_from_balance_constants() {
        match descriptor(Driver::Clutch).trigger {
            AbilityTrigger::OnCloseWin { epsilon } => assert_eq!(epsilon, CLOSE_WIN_EPSILON),
            _ => panic!("clutch should trigger on close wins"),
        }
        match descriptor(Driver::Gambler).trigger {
            AbilityTrigger::OnLoseBigBid { threshold } => {
                assert_eq!(threshold, BIG_BID_THRESHOLD)
            }
            _ => panic!("gambler should trigger on big losing bids"),
        }
    }
}
