// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::{Duration, Instant};

use super::*;
use crate::command::Side;
use crate::table::ProcessingEntry;
use crate::test_support::{one_pe_config, start_rig, two_pe_config};

fn stamped(index: u64, barcode: &str, chute: i32, trigger_at: Instant) -> Parcel {
    let mut parcel = Parcel::new(index, barcode, chute);
    parcel.stamp_trigger(trigger_at, trigger_at + Duration::from_millis(20));
    parcel
}

#[tokio::test]
async fn first_match_wins_in_index_order() -> anyhow::Result<()> {
    let rig = start_rig(one_pe_config()).await?;
    let state = rig.engine.state();
    let now = Instant::now();
    let trigger_at = now - Duration::from_millis(400);

    state.table.insert_pending(stamped(2, "B", 1, trigger_at));
    state.table.insert_pending(stamped(1, "A", 1, trigger_at));
    state.table.arm_timer(1);
    state.table.arm_timer(2);

    let matched = match_sort_signal(state, "P1", now).ok_or(anyhow::anyhow!("no match"))?;
    assert_eq!(matched.index, 1);
    assert_eq!(matched.state(), SortState::Processing);
    assert_eq!(state.table.pending_len(), 1, "later parcel stays pending");
    Ok(())
}

#[tokio::test]
async fn delay_window_respects_slack() -> anyhow::Result<()> {
    let rig = start_rig(one_pe_config()).await?;
    let state = rig.engine.state();
    let now = Instant::now();

    // 339 ms is outside even the slackened window; 340 ms is inside.
    state.table.insert_pending(stamped(1, "A", 1, now - Duration::from_millis(339)));
    state.table.arm_timer(1);
    assert!(match_sort_signal(state, "P1", now).is_none());

    state.table.remove_pending(1);
    state.table.insert_pending(stamped(1, "A", 1, now - Duration::from_millis(340)));
    assert!(match_sort_signal(state, "P1", now).is_some());
    Ok(())
}

#[tokio::test]
async fn stale_delay_is_rejected() -> anyhow::Result<()> {
    let rig = start_rig(one_pe_config()).await?;
    let state = rig.engine.state();
    let now = Instant::now();

    state.table.insert_pending(stamped(1, "A", 1, now - Duration::from_millis(611)));
    state.table.arm_timer(1);
    assert!(match_sort_signal(state, "P1", now).is_none());
    Ok(())
}

#[tokio::test]
async fn unstamped_parcel_is_skipped() -> anyhow::Result<()> {
    let rig = start_rig(one_pe_config()).await?;
    let state = rig.engine.state();

    state.table.insert_pending(Parcel::new(1, "A", 1));
    state.table.arm_timer(1);
    assert!(match_sort_signal(state, "P1", Instant::now()).is_none());
    Ok(())
}

#[tokio::test]
async fn foreign_chute_is_skipped() -> anyhow::Result<()> {
    let rig = start_rig(two_pe_config()).await?;
    let state = rig.engine.state();
    let now = Instant::now();

    // Chute 3 belongs to P2, not P1.
    state.table.insert_pending(stamped(1, "A", 3, now - Duration::from_millis(400)));
    state.table.arm_timer(1);
    assert!(match_sort_signal(state, "P1", now).is_none());
    assert!(match_sort_signal(state, "P2", now).is_some());
    Ok(())
}

#[tokio::test]
async fn processing_barcode_is_skipped() -> anyhow::Result<()> {
    let rig = start_rig(one_pe_config()).await?;
    let state = rig.engine.state();
    let now = Instant::now();

    state.table.insert_pending(stamped(1, "A", 1, now - Duration::from_millis(400)));
    state.table.arm_timer(1);
    state
        .table
        .processing
        .lock()
        .insert("A".to_owned(), ProcessingEntry { started_at: now, pe: "P1".to_owned() });

    assert!(match_sort_signal(state, "P1", now).is_none());
    Ok(())
}

#[tokio::test]
async fn disarmed_timer_blocks_match() -> anyhow::Result<()> {
    let rig = start_rig(one_pe_config()).await?;
    let state = rig.engine.state();
    let now = Instant::now();

    state.table.insert_pending(stamped(1, "A", 1, now - Duration::from_millis(400)));
    // Timer never armed: the parcel's timeout already ran or is racing.
    assert!(match_sort_signal(state, "P1", now).is_none());
    Ok(())
}

#[tokio::test]
async fn match_consumes_into_processing_and_disarms() -> anyhow::Result<()> {
    let rig = start_rig(one_pe_config()).await?;
    let state = rig.engine.state();
    let now = Instant::now();

    state.table.insert_pending(stamped(1, "A", 1, now - Duration::from_millis(400)));
    state.table.arm_timer(1);

    let matched = match_sort_signal(state, "P1", now).ok_or(anyhow::anyhow!("no match"))?;
    assert_eq!(matched.barcode, "A");
    assert_eq!(state.table.pending_len(), 0);
    assert!(state.table.is_in_flight("A"));
    assert!(!state.table.timer_armed(1));

    // Consumed exactly once: a second edge finds nothing.
    assert!(match_sort_signal(state, "P1", now).is_none());
    Ok(())
}

#[tokio::test]
async fn no_match_on_waiting_pendulum_restores_neutral() -> anyhow::Result<()> {
    let rig = start_rig(one_pe_config()).await?;
    let state = rig.engine.state();
    let handle = rig.handle("P1")?;

    state.pendulums.with("P1", |p| {
        p.swing(Side::Left);
        p.wait_for_next(1);
    });
    state.pendulums.record_swing(1);
    handle.clear_sent();

    on_sort_signal(state, "P1", Instant::now()).await;

    assert_eq!(
        handle.sent_frames(),
        vec![bytes::Bytes::from_static(state.commands.reset_left)],
        "waiting bet lost: expect one left reset"
    );
    assert_eq!(state.pendulums.direction("P1"), Some(Direction::Reset));
    Ok(())
}
