// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end sorting-line scenarios: scripted photoelectric lines in,
//! command frames and domain events out.

use std::time::Duration;

use divert::command::DEFAULT_COMMANDS;
use divert::engine::TRIGGER_DEVICE;
use divert::parcel::SortState;
use divert::pendulum::Direction;
use divert::test_support::{one_pe_config, single_config, two_pe_config};

use divert_specs::{frames_of, ScenarioRig};

const CMD: divert::command::CommandSet = DEFAULT_COMMANDS;

async fn ms(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

// -- 1. Happy path single sort ------------------------------------------------

#[tokio::test]
async fn happy_path_single_sort() -> anyhow::Result<()> {
    let rig = ScenarioRig::start(one_pe_config()).await?;

    rig.fire_trigger(TRIGGER_DEVICE).await?;
    ms(20).await;
    rig.ingest(1, "A", 1)?;
    ms(380).await;
    rig.fire_sort("P1").await?;

    let parcel = rig.completed("A", Duration::from_secs(2)).await?;
    assert_eq!(parcel.state(), SortState::Sorted);
    assert!(parcel.trigger_at().is_some(), "trigger must be stamped at ingress");
    let processing = parcel.processing_time().map(|d| d.as_millis()).unwrap_or(0);
    assert!(processing < 100, "processing time should be the ingress lag, got {processing} ms");

    // Swing left for the odd chute, then the delayed left reset.
    ms(300).await;
    assert_eq!(rig.frames("P1")?, frames_of(&[CMD.swing_left, CMD.reset_left]));
    assert_eq!(rig.rig.engine.pendulum_direction("P1"), Some(Direction::Reset));

    // Events in causal order.
    let position = |kind: &str| {
        rig.event_position(kind).ok_or_else(|| anyhow::anyhow!("missing event {kind}"))
    };
    let trigger = position("trigger_signal")?;
    let ingress = position("package_processing")?;
    let sort = position("sorting_signal")?;
    let done = position("sorting_completed")?;
    assert!(
        trigger < ingress && ingress < sort && sort < done,
        "event order: {trigger} {ingress} {sort} {done}"
    );
    Ok(())
}

// -- 2. Straight-through ------------------------------------------------------

#[tokio::test]
async fn straight_through_parcel_never_commands() -> anyhow::Result<()> {
    let rig = ScenarioRig::start(one_pe_config()).await?;

    rig.fire_trigger(TRIGGER_DEVICE).await?;
    ms(20).await;
    rig.ingest(2, "B", 99)?;

    let parcel = rig.completed("B", Duration::from_secs(2)).await?;
    assert_eq!(parcel.state(), SortState::Sorted);
    assert!(rig.frames("P1")?.is_empty(), "no PE owns chute 99, no commands");
    assert_eq!(rig.rig.engine.pending_len(), 0);
    Ok(())
}

// -- 3. Sort timeout with recovery --------------------------------------------

#[tokio::test]
async fn sort_timeout_errors_and_resets() -> anyhow::Result<()> {
    let rig = ScenarioRig::start(one_pe_config()).await?;

    rig.fire_trigger(TRIGGER_DEVICE).await?;
    ms(20).await;
    rig.ingest(3, "C", 2)?;

    // No sort signal ever arrives; timeout = 600 + 500 from ingestion.
    let parcel = rig.completed("C", Duration::from_secs(3)).await?;
    assert_eq!(parcel.state(), SortState::Error);

    // Nothing was swung, so last_slot is still 0 (even): right reset.
    ms(100).await;
    assert_eq!(rig.frames("P1")?, frames_of(&[CMD.reset_right]));
    assert_eq!(rig.rig.engine.pendulum_direction("P1"), Some(Direction::Reset));
    Ok(())
}

// -- 4. Consecutive same-chute optimization -----------------------------------

#[tokio::test]
async fn consecutive_same_chute_skips_reset_and_swing() -> anyhow::Result<()> {
    let rig = ScenarioRig::start(one_pe_config()).await?;

    // Two parcels for chute 1, triggers 80 ms apart.
    rig.fire_trigger(TRIGGER_DEVICE).await?;
    ms(20).await;
    rig.ingest(4, "D", 1)?;
    ms(60).await;
    rig.fire_trigger(TRIGGER_DEVICE).await?;
    ms(20).await;
    rig.ingest(5, "E", 1)?;

    // First sort edge 400 ms after the first trigger.
    ms(300).await;
    rig.fire_sort("P1").await?;
    let first = rig.completed("D", Duration::from_secs(2)).await?;
    assert_eq!(first.state(), SortState::Sorted);
    assert_eq!(
        rig.rig.engine.pendulum_direction("P1"),
        Some(Direction::WaitingForNext { slot: 1 }),
        "look-ahead should hold the arm for the follower"
    );

    // Second sort edge: the arm is already staged, no new swing.
    ms(60).await;
    rig.fire_sort("P1").await?;
    let second = rig.completed("E", Duration::from_secs(2)).await?;
    assert_eq!(second.state(), SortState::Sorted);

    // Exactly one swing and one reset across both parcels.
    ms(300).await;
    assert_eq!(rig.frames("P1")?, frames_of(&[CMD.swing_left, CMD.reset_left]));
    assert_eq!(rig.rig.engine.pendulum_direction("P1"), Some(Direction::Reset));
    Ok(())
}

// -- 5. Adjacent different-chute interruption ---------------------------------

#[tokio::test]
async fn interrupting_parcel_resets_bridges_and_swings() -> anyhow::Result<()> {
    let rig = ScenarioRig::start(one_pe_config()).await?;

    rig.fire_trigger(TRIGGER_DEVICE).await?;
    ms(20).await;
    rig.ingest(6, "F", 1)?;
    ms(60).await;
    rig.fire_trigger(TRIGGER_DEVICE).await?;
    ms(20).await;
    rig.ingest(7, "G", 2)?;

    ms(300).await;
    rig.fire_sort("P1").await?;
    let first = rig.completed("F", Duration::from_secs(2)).await?;
    assert_eq!(first.state(), SortState::Sorted);

    // The second parcel matches before the 200 ms reset delay elapses
    // and needs the opposite side.
    ms(60).await;
    rig.fire_sort("P1").await?;
    let second = rig.completed("G", Duration::from_secs(2)).await?;
    assert_eq!(second.state(), SortState::Sorted);

    // Immediate left reset, 20 ms bridge, right swing, then the second
    // parcel's own delayed right reset. The superseded left reset from
    // the first parcel never fires.
    ms(400).await;
    assert_eq!(
        rig.frames("P1")?,
        frames_of(&[CMD.swing_left, CMD.reset_left, CMD.swing_right, CMD.reset_right])
    );
    assert_eq!(rig.rig.engine.last_slot(), 2);
    assert_eq!(rig.rig.engine.pendulum_direction("P1"), Some(Direction::Reset));
    Ok(())
}

// -- 6. Debounce --------------------------------------------------------------

#[tokio::test]
async fn duplicate_sort_edges_are_debounced() -> anyhow::Result<()> {
    let rig = ScenarioRig::start(one_pe_config()).await?;

    rig.fire_trigger(TRIGGER_DEVICE).await?;
    ms(20).await;
    rig.ingest(8, "H", 1)?;

    ms(380).await;
    rig.fire_sort("P1").await?;
    ms(15).await;
    rig.fire_sort("P1").await?;

    let parcel = rig.completed("H", Duration::from_secs(2)).await?;
    assert_eq!(parcel.state(), SortState::Sorted);
    assert_eq!(rig.rig.sink.count("sorting_signal"), 1, "second edge inside 30 ms dropped");

    ms(300).await;
    assert_eq!(rig.frames("P1")?, frames_of(&[CMD.swing_left, CMD.reset_left]));
    Ok(())
}

// -- Pre-stamped ingress ------------------------------------------------------

#[tokio::test]
async fn prestamped_ingress_sorts_without_trigger_line() -> anyhow::Result<()> {
    let rig = ScenarioRig::start(one_pe_config()).await?;

    // The upstream scanner already correlated the trigger; the engine
    // never sees a trigger line for this parcel.
    let t0 = std::time::Instant::now();
    rig.ingest_stamped(14, "N", 1, t0)?;
    ms(400).await;
    rig.fire_sort("P1").await?;

    let parcel = rig.completed("N", Duration::from_secs(2)).await?;
    assert_eq!(parcel.state(), SortState::Sorted);
    assert_eq!(parcel.trigger_at(), Some(t0));

    ms(300).await;
    assert_eq!(rig.frames("P1")?, frames_of(&[CMD.swing_left, CMD.reset_left]));
    Ok(())
}

// -- Multi-diverter routing ---------------------------------------------------

#[tokio::test]
async fn second_diverter_owns_chutes_three_and_four() -> anyhow::Result<()> {
    let rig = ScenarioRig::start(two_pe_config()).await?;

    rig.fire_trigger(TRIGGER_DEVICE).await?;
    ms(20).await;
    rig.ingest(9, "I", 3)?;
    ms(380).await;
    rig.fire_sort("P2").await?;

    let parcel = rig.completed("I", Duration::from_secs(2)).await?;
    assert_eq!(parcel.state(), SortState::Sorted);

    ms(300).await;
    // Chute 3 is odd: left swing, left reset, all on P2.
    assert_eq!(rig.frames("P2")?, frames_of(&[CMD.swing_left, CMD.reset_left]));
    assert!(rig.frames("P1")?.is_empty());
    Ok(())
}

// -- Single-pendulum line -----------------------------------------------------

#[tokio::test]
async fn single_mode_shares_one_device() -> anyhow::Result<()> {
    let rig = ScenarioRig::start(single_config()).await?;

    // Trigger and sort channels arrive on the same combined device.
    rig.fire_trigger("default").await?;
    ms(20).await;
    rig.ingest(10, "J", 2)?;
    ms(380).await;
    rig.fire_sort("default").await?;

    let parcel = rig.completed("J", Duration::from_secs(2)).await?;
    assert_eq!(parcel.state(), SortState::Sorted);

    ms(300).await;
    assert_eq!(rig.frames("default")?, frames_of(&[CMD.swing_right, CMD.reset_right]));
    Ok(())
}

// -- Universal property: one completion per parcel ----------------------------

#[tokio::test]
async fn every_parcel_completes_exactly_once() -> anyhow::Result<()> {
    let rig = ScenarioRig::start(one_pe_config()).await?;

    // A sorted parcel, a straight-through parcel, and a timed-out parcel.
    rig.fire_trigger(TRIGGER_DEVICE).await?;
    ms(20).await;
    rig.ingest(11, "K", 1)?;
    rig.ingest(12, "L", 99)?;
    rig.ingest(13, "M", 2)?;
    ms(380).await;
    rig.fire_sort("P1").await?;

    assert_eq!(rig.completed("K", Duration::from_secs(2)).await?.state(), SortState::Sorted);
    assert_eq!(rig.completed("L", Duration::from_secs(2)).await?.state(), SortState::Sorted);
    assert_eq!(rig.completed("M", Duration::from_secs(3)).await?.state(), SortState::Error);

    // Quiescence: nothing left pending or processing, one completion each.
    ms(200).await;
    assert_eq!(rig.rig.engine.pending_len(), 0);
    assert_eq!(rig.rig.engine.processing_len(), 0);
    assert_eq!(rig.rig.sink.count("sorting_completed"), 3);
    Ok(())
}
