//! Round-end resolution pipeline
//!
//! Applies everything that happens when a bidding window closes, in a fixed
//! order so no effect is double-counted:
//!
//! 1. locked bids are deducted (the mole bids for free),
//! 2. always-on self refunds,
//! 3. disrupt abilities, filtered through immunity,
//! 4. win-conditional abilities (margin, close-win, big-bid triggers),
//! 5. secret protocol effects revealed at round end,
//! 6. clamp to zero and flag eliminations.
//!
//! The engine is the only caller and owns the players being mutated. Every
//! emitted event carries a visibility tag; the transport layer must never
//! widen it.

use log::debug;
use rand::seq::SliceRandom;
use rand::Rng;

use shared::messages::ServerEvent;
use shared::{
    Driver, GameVariant, ImpactKind, ProtocolKind, RoundImpact, Visibility, MOLE_SAFE_MARGIN,
    MOLE_TOKEN_PENALTY, TIE_EPSILON, TIME_TAX_AMOUNT,
};

use crate::drivers::{descriptor, disrupt_immune, protocol_immune, AbilityEffect, AbilityTrigger};
use crate::state::GamePlayer;

/// Everything the resolver needs to know about the round besides the players.
#[derive(Debug, Clone, Copy)]
pub struct RoundContext {
    pub protocol: Option<ProtocolKind>,
    pub mole_player_id: Option<u32>,
    pub is_double_tokens: bool,
    pub variant: GameVariant,
    pub abilities_enabled: bool,
}

/// Outcome of picking the round winner from the locked bids.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WinnerDecision {
    pub winner_id: Option<u32>,
    pub deadlock: bool,
    /// Winner's bid minus the runner-up's. None without a runner-up.
    pub margin: Option<f32>,
}

/// A resolver event plus the routing information to honor its visibility.
#[derive(Debug, Clone)]
pub struct TaggedEvent {
    pub visibility: Visibility,
    pub owner: Option<u32>,
    pub target: Option<u32>,
    pub event: ServerEvent,
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub events: Vec<TaggedEvent>,
    pub newly_eliminated: Vec<u32>,
}

/// Picks the round winner: highest locked bid among non-eliminated bidders,
/// unless the top two sit within the tie epsilon, which is a deadlock.
pub fn determine_winner(players: &[GamePlayer]) -> WinnerDecision {
    let mut bids: Vec<(u32, f32)> = players
        .iter()
        .filter(|p| p.is_active())
        .filter_map(|p| p.locked_bid().map(|bid| (p.id, bid)))
        .collect();

    if bids.is_empty() {
        return WinnerDecision {
            winner_id: None,
            deadlock: false,
            margin: None,
        };
    }

    bids.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let (top_id, top_bid) = bids[0];

    if bids.len() == 1 {
        return WinnerDecision {
            winner_id: Some(top_id),
            deadlock: false,
            margin: None,
        };
    }

    let runner_up = bids[1].1;
    if top_bid - runner_up <= TIE_EPSILON {
        debug!(
            "Deadlock: top bids {:.2} and {:.2} within epsilon",
            top_bid, runner_up
        );
        return WinnerDecision {
            winner_id: None,
            deadlock: true,
            margin: None,
        };
    }

    WinnerDecision {
        winner_id: Some(top_id),
        deadlock: false,
        margin: Some(top_bid - runner_up),
    }
}

fn index_of(players: &[GamePlayer], id: u32) -> Option<usize> {
    players.iter().position(|p| p.id == id)
}

fn ability_event(
    driver: Driver,
    owner: u32,
    impacts: Vec<RoundImpact>,
    target: Option<u32>,
) -> TaggedEvent {
    let desc = descriptor(driver);
    TaggedEvent {
        visibility: desc.visibility,
        owner: Some(owner),
        target,
        event: ServerEvent::RealityModeAbility {
            driver,
            description: desc.blurb.to_string(),
            impacts,
        },
    }
}

/// Runs the full pipeline over the round's players. Mutates in place; the
/// returned resolution carries the visibility-tagged events and the seats
/// eliminated at this boundary.
pub fn resolve_round_end<R: Rng>(
    players: &mut [GamePlayer],
    ctx: &RoundContext,
    decision: &WinnerDecision,
    rng: &mut R,
) -> Resolution {
    let mut resolution = Resolution::default();

    deduct_bids(players, ctx);
    award_round_tokens(players, ctx, decision);
    if ctx.abilities_enabled {
        apply_always_abilities(players, &mut resolution);
        apply_disrupts(players, ctx, decision, rng, &mut resolution);
        apply_win_conditionals(players, decision, &mut resolution);
    }
    apply_protocol_effects(players, ctx, decision, &mut resolution);
    clamp_and_eliminate(players, &mut resolution);

    resolution
}

/// Step 1: every locked bid comes out of the bank. The designated mole bids
/// on the house.
fn deduct_bids(players: &mut [GamePlayer], ctx: &RoundContext) {
    let mole = if ctx.protocol == Some(ProtocolKind::Mole) {
        ctx.mole_player_id
    } else {
        None
    };
    for player in players.iter_mut() {
        let Some(bid) = player.locked_bid() else {
            continue;
        };
        // The free ride covers deliberate bids only; an overrun burned the
        // bank for real, keeping zeroed-out and eliminated in agreement.
        if Some(player.id) == mole && !player.is_eliminated {
            player.add_impact(ImpactKind::BidDeduction, 0.0, "mole");
            continue;
        }
        player.remaining_time -= bid;
        player.add_impact(ImpactKind::BidDeduction, -bid, "bid");
    }
}

/// Step 1b: the round's basic stake. Doubled under the DoubleTokens protocol.
fn award_round_tokens(players: &mut [GamePlayer], ctx: &RoundContext, decision: &WinnerDecision) {
    let Some(winner_id) = decision.winner_id else {
        return;
    };
    let Some(index) = index_of(players, winner_id) else {
        return;
    };
    let amount = if ctx.is_double_tokens { 2 } else { 1 };
    let winner = &mut players[index];
    winner.tokens += amount;
    winner.add_impact(ImpactKind::RoundTokens, amount as f32, "round_win");
    if let Some(protocol) = ctx.protocol {
        winner.protocol_wins.push(protocol);
    }
}

/// Step 2: unconditional self refunds. A refund landing before the clamp can
/// pull a seat back from exactly zero.
fn apply_always_abilities(players: &mut [GamePlayer], resolution: &mut Resolution) {
    for player in players.iter_mut() {
        if !player.is_active() {
            continue;
        }
        let Some(driver) = player.driver else {
            continue;
        };
        let desc = descriptor(driver);
        if desc.trigger != AbilityTrigger::Always {
            continue;
        }
        if let AbilityEffect::RefundTime(amount) = desc.effect {
            player.remaining_time += amount;
            player.ability_used = true;
            let impact = RoundImpact {
                kind: ImpactKind::AbilityRefund,
                value: amount,
                source: driver.id().to_string(),
            };
            player.round_impacts.push(impact.clone());
            let event = ability_event(driver, player.id, vec![impact], Some(player.id));
            resolution.events.push(event);
        }
    }
}

/// Step 3: disrupt abilities. Immunity filters targets; the variant decides
/// whether protocol immunity extends to disrupts.
fn apply_disrupts<R: Rng>(
    players: &mut [GamePlayer],
    ctx: &RoundContext,
    decision: &WinnerDecision,
    rng: &mut R,
    resolution: &mut Resolution,
) {
    let actors: Vec<u32> = players
        .iter()
        .filter(|p| p.is_active())
        .filter(|p| {
            p.driver
                .map(|d| descriptor(d).trigger == AbilityTrigger::Disrupt)
                .unwrap_or(false)
        })
        .map(|p| p.id)
        .collect();

    for actor_id in actors {
        let actor_index = match index_of(players, actor_id) {
            Some(index) => index,
            None => continue,
        };
        let driver = match players[actor_index].driver {
            Some(driver) => driver,
            None => continue,
        };
        match descriptor(driver).effect {
            AbilityEffect::StealFromWinner(amount) => {
                let Some(winner_id) = decision.winner_id else {
                    continue;
                };
                if winner_id == actor_id {
                    continue;
                }
                let Some(winner_index) = index_of(players, winner_id) else {
                    continue;
                };
                if disrupt_immune(players[winner_index].driver, ctx.variant) {
                    continue;
                }
                let stolen = amount.min(players[winner_index].remaining_time);
                if stolen <= 0.0 {
                    continue;
                }
                players[winner_index].remaining_time -= stolen;
                players[winner_index].add_impact(
                    ImpactKind::AbilitySteal,
                    -stolen,
                    driver.id(),
                );
                players[actor_index].remaining_time += stolen;
                players[actor_index].ability_used = true;
                let impact = RoundImpact {
                    kind: ImpactKind::AbilitySteal,
                    value: stolen,
                    source: driver.id().to_string(),
                };
                players[actor_index].round_impacts.push(impact.clone());
                let event = ability_event(driver, actor_id, vec![impact], Some(winner_id));
                resolution.events.push(event);
            }
            AbilityEffect::DrainRandomOpponent(amount) => {
                let candidates: Vec<u32> = players
                    .iter()
                    .filter(|p| p.is_active() && p.id != actor_id)
                    .filter(|p| !disrupt_immune(p.driver, ctx.variant))
                    .map(|p| p.id)
                    .collect();
                let Some(target_id) = candidates.choose(rng).copied() else {
                    continue;
                };
                let Some(target_index) = index_of(players, target_id) else {
                    continue;
                };
                let drained = amount.min(players[target_index].remaining_time);
                if drained <= 0.0 {
                    continue;
                }
                players[target_index].remaining_time -= drained;
                players[target_index].add_impact(
                    ImpactKind::AbilitySteal,
                    -drained,
                    driver.id(),
                );
                players[actor_index].ability_used = true;
                let impact = RoundImpact {
                    kind: ImpactKind::AbilitySteal,
                    value: -drained,
                    source: driver.id().to_string(),
                };
                let event = ability_event(driver, actor_id, vec![impact], Some(target_id));
                resolution.events.push(event);
            }
            _ => {}
        }
    }
}

/// Step 4: abilities keyed on how the round was won or lost.
fn apply_win_conditionals(
    players: &mut [GamePlayer],
    decision: &WinnerDecision,
    resolution: &mut Resolution,
) {
    for index in 0..players.len() {
        if !players[index].is_active() {
            continue;
        }
        let Some(driver) = players[index].driver else {
            continue;
        };
        let desc = descriptor(driver);
        let is_winner = decision.winner_id == Some(players[index].id);

        let fired = match desc.trigger {
            AbilityTrigger::OnWin => is_winner,
            AbilityTrigger::OnCloseWin { epsilon } => {
                is_winner && decision.margin.map(|m| m <= epsilon).unwrap_or(false)
            }
            AbilityTrigger::OnWinMargin { min_margin } => {
                is_winner && decision.margin.map(|m| m > min_margin).unwrap_or(false)
            }
            AbilityTrigger::OnLoseBigBid { threshold } => {
                !is_winner
                    && players[index]
                        .locked_bid()
                        .map(|bid| bid > threshold)
                        .unwrap_or(false)
            }
            _ => false,
        };
        if !fired {
            continue;
        }

        let impact = match desc.effect {
            AbilityEffect::RefundTime(amount) => {
                players[index].remaining_time += amount;
                RoundImpact {
                    kind: ImpactKind::AbilityRefund,
                    value: amount,
                    source: driver.id().to_string(),
                }
            }
            AbilityEffect::BonusTokens(amount) => {
                players[index].tokens += amount;
                RoundImpact {
                    kind: ImpactKind::AbilityTokens,
                    value: amount as f32,
                    source: driver.id().to_string(),
                }
            }
            _ => continue,
        };
        players[index].ability_used = true;
        players[index].round_impacts.push(impact.clone());
        let owner = players[index].id;
        let event = ability_event(driver, owner, vec![impact], Some(owner));
        resolution.events.push(event);
    }
}

/// Step 5: secret protocols come out of hiding and take their cut.
fn apply_protocol_effects(
    players: &mut [GamePlayer],
    ctx: &RoundContext,
    decision: &WinnerDecision,
    resolution: &mut Resolution,
) {
    match ctx.protocol {
        Some(ProtocolKind::TimeTax) => {
            for player in players.iter_mut() {
                if !player.is_active() || protocol_immune(player.driver) {
                    continue;
                }
                let tax = TIME_TAX_AMOUNT.min(player.remaining_time);
                player.remaining_time -= tax;
                player.add_impact(ImpactKind::ProtocolTax, -tax, "time_tax");
            }
            resolution.events.push(TaggedEvent {
                visibility: Visibility::All,
                owner: None,
                target: None,
                event: ServerEvent::ProtocolReveal {
                    protocol: ProtocolKind::TimeTax,
                    summary: format!("every survivor paid {:.1}s in tax", TIME_TAX_AMOUNT),
                },
            });
        }
        Some(ProtocolKind::LowBid) => {
            let lowest = players
                .iter()
                .filter(|p| p.is_active())
                .filter_map(|p| p.locked_bid().map(|bid| (p.id, bid)))
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            if let Some((low_id, low_bid)) = lowest {
                if let Some(index) = index_of(players, low_id) {
                    players[index].tokens += 1;
                    players[index].add_impact(ImpactKind::ProtocolTokens, 1.0, "low_bid");
                    resolution.events.push(TaggedEvent {
                        visibility: Visibility::All,
                        owner: None,
                        target: Some(low_id),
                        event: ServerEvent::ProtocolReveal {
                            protocol: ProtocolKind::LowBid,
                            summary: format!(
                                "lowest bid ({:.1}s) earned a token",
                                low_bid
                            ),
                        },
                    });
                }
            }
        }
        Some(ProtocolKind::Mole) => {
            let Some(mole_id) = ctx.mole_player_id else {
                return;
            };
            let busted = decision.winner_id == Some(mole_id)
                && decision.margin.map(|m| m > MOLE_SAFE_MARGIN).unwrap_or(false);
            if busted {
                if let Some(index) = index_of(players, mole_id) {
                    if !protocol_immune(players[index].driver) {
                        players[index].tokens =
                            players[index].tokens.saturating_sub(MOLE_TOKEN_PENALTY);
                        players[index].add_impact(
                            ImpactKind::ProtocolTokens,
                            -(MOLE_TOKEN_PENALTY as f32),
                            "mole",
                        );
                    }
                }
            }
            let summary = if busted {
                "the mole won too big and lost tokens".to_string()
            } else {
                "the mole walked away clean".to_string()
            };
            resolution.events.push(TaggedEvent {
                visibility: Visibility::All,
                owner: None,
                target: Some(mole_id),
                event: ServerEvent::ProtocolReveal {
                    protocol: ProtocolKind::Mole,
                    summary,
                },
            });
        }
        _ => {}
    }
}

/// Step 6: the round boundary where `remaining_time == 0` and elimination
/// are forced back into agreement.
fn clamp_and_eliminate(players: &mut [GamePlayer], resolution: &mut Resolution) {
    for player in players.iter_mut() {
        if player.remaining_time <= 0.0 {
            player.remaining_time = 0.0;
            if !player.is_eliminated {
                player.is_eliminated = true;
                resolution.newly_eliminated.push(player.id);
            }
        }
    }
}
