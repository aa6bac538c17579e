//! Write-only analytics sink
//!
//! The engine emits snapshot records as plain data; the server loop forwards
//! them here. Nothing is ever read back into gameplay, and a sink failure is
//! logged and swallowed so recording can never block or break a live game.

use log::{info, warn};

use shared::{GameSettings, MomentFlag, ProtocolKind};

/// Per-player placement row inside a snapshot.
#[derive(Debug, Clone)]
pub struct PlayerPosition {
    pub player_id: u32,
    pub tokens: u32,
    pub remaining_time: f32,
}

#[derive(Debug, Clone)]
pub struct RoundSnapshotRecord {
    pub game_id: u64,
    pub round: u32,
    pub snapshot_type: &'static str,
    pub winner_id: Option<u32>,
    pub eliminated_ids: Vec<u32>,
    pub flags_triggered: Vec<MomentFlag>,
    pub protocols_triggered: Vec<ProtocolKind>,
    pub player_positions: Vec<PlayerPosition>,
    pub settings: GameSettings,
}

#[derive(Debug, Clone)]
pub struct PlayerResult {
    pub player_id: u32,
    pub name: String,
    pub is_bot: bool,
    pub tokens: u32,
    pub remaining_time: f32,
    pub total_time_bid: f32,
}

#[derive(Debug, Clone)]
pub struct GameSummaryRecord {
    pub game_id: u64,
    pub total_rounds: u32,
    pub results: Vec<PlayerResult>,
    pub winner_id: Option<u32>,
}

/// Durable recorder for offline analysis. Implementations must be
/// best-effort: return errors, never panic, never retry inline.
pub trait AnalyticsSink {
    fn record_round_snapshot(
        &mut self,
        record: &RoundSnapshotRecord,
    ) -> Result<(), Box<dyn std::error::Error>>;

    fn record_game_summary(
        &mut self,
        record: &GameSummaryRecord,
    ) -> Result<(), Box<dyn std::error::Error>>;
}

/// Forwards a record to a sink, downgrading any failure to a warning.
pub fn record_round_best_effort(sink: &mut dyn AnalyticsSink, record: &RoundSnapshotRecord) {
    if let Err(e) = sink.record_round_snapshot(record) {
        warn!(
            "Analytics round snapshot failed for game {}: {}",
            record.game_id, e
        );
    }
}

pub fn record_summary_best_effort(sink: &mut dyn AnalyticsSink, record: &GameSummaryRecord) {
    if let Err(e) = sink.record_game_summary(record) {
        warn!(
            "Analytics game summary failed for game {}: {}",
            record.game_id, e
        );
    }
}

/// Default sink: structured log lines, one per record.
#[derive(Default)]
pub struct LogSink;

impl AnalyticsSink for LogSink {
    fn record_round_snapshot(
        &mut self,
        record: &RoundSnapshotRecord,
    ) -> Result<(), Box<dyn std::error::Error>> {
        info!(
            "analytics game={} round={} type={} winner={:?} eliminated={:?} flags={:?} protocols={:?}",
            record.game_id,
            record.round,
            record.snapshot_type,
            record.winner_id,
            record.eliminated_ids,
            record.flags_triggered,
            record.protocols_triggered,
        );
        Ok(())
    }

    fn record_game_summary(
        &mut self,
        record: &GameSummaryRecord,
    ) -> Result<(), Box<dyn std::error::Error>> {
        info!(
            "analytics game={} summary rounds={} winner={:?} players={}",
            record.game_id,
            record.total_rounds,
            record.winner_id,
            record.results.len(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    impl AnalyticsSink for FailingSink {
        fn record_round_snapshot(
            &mut self,
            _record: &RoundSnapshotRecord,
        ) -> Result<(), Box<dyn std::error::Error>> {
            Err("sink offline".into())
        }

        fn record_game_summary(
            &mut self,
            _record: &GameSummaryRecord,
        ) -> Result<(), Box<dyn std::error::Error>> {
            Err("sink offline".into())
        }
    }

    fn round_record() -> RoundSnapshotRecord {
        RoundSnapshotRecord {
            game_id: 7,
            round: 1,
            snapshot_type: "round_end",
            winner_id: Some(2),
            eliminated_ids: vec![],
            flags_triggered: vec![MomentFlag::PhotoFinish],
            protocols_triggered: vec![],
            player_positions: vec![],
            settings: GameSettings::default(),
        }
    }

    #[test]
    fn test_log_sink_accepts_records() {
        let mut sink = LogSink;
        assert!(sink.record_round_snapshot(&round_record()).is_ok());
        assert!(sink
            .record_game_summary(&GameSummaryRecord {
                game_id: 7,
                total_rounds: 9,
                results: vec![],
                winner_id: None,
            })
            .is_ok());
    }

    #[test]
    fn test_failures_are_swallowed() {
        let mut sink = FailingSink;
        // Must not panic or propagate.
        record_round_best_effort(&mut sink, &round_record());
        record_summary_best_effort(
            &mut sink,
            &GameSummaryRecord {
                game_id: 7,
                total_rounds: 9,
                results: vec![],
                winner_id: None,
            },
        );
    }
}
