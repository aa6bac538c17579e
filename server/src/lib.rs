//! # Overbid Game Server Library
//!
//! Authoritative server for the Overbid party game: players hold a button to
//! bid seconds out of a personal time bank, the longest hold each round wins
//! a token, and tokens over a fixed number of rounds decide the game. The
//! server is the only source of truth; clients render whatever state they
//! are sent and never simulate on their own.
//!
//! ## Architecture
//!
//! All mutable state lives on a single event loop per process. Network tasks
//! only move datagrams; lobby bookkeeping, session tracking, and every game
//! engine are owned by the loop, so action handlers run without locks and
//! there is exactly one writer for any piece of game state.
//!
//! Each in-game lobby is driven by its own [`engine::RoundEngine`], a
//! synchronous state machine advanced by `tick(now)` calls from the loop's
//! shared interval. Waits are re-checks against injected instants rather
//! than sleeps, which keeps the machine responsive to player actions between
//! ticks and makes every phase transition testable without wall-clock time.
//!
//! ## Module Organization
//!
//! - [`session`]: binds transport addresses to seats, sweeps timeouts,
//!   and handles rejoin rebinding. Disconnects never destroy a seat.
//! - [`lobby`]: the pre-game waiting room with roster, ready state,
//!   host-controlled settings, and the injectable [`lobby::LobbyStore`].
//! - [`state`]: the authoritative `GameState`/`GamePlayer` data model and
//!   the sanitized snapshots broadcast to clients.
//! - [`engine`]: the round state machine covering the ready gate, countdown,
//!   bidding clock, round resolution, acknowledgments, and game over.
//! - [`bots`]: pure bid policy for auto-filled seats.
//! - [`drivers`]: the declarative driver ability table.
//! - [`protocols`]: round modifier rolling with recent-history exclusion.
//! - [`resolver`]: the fixed-order round-end pipeline.
//! - [`analytics`]: fire-and-forget snapshot recording.
//! - [`network`]: UDP transport, command dispatch, and the main loop.

pub mod analytics;
pub mod bots;
pub mod drivers;
pub mod engine;
pub mod lobby;
pub mod network;
pub mod protocols;
pub mod resolver;
pub mod session;
pub mod state;
