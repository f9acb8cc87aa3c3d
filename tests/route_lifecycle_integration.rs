//! Integration tests for route construction and removal
//!
//! These tests validate the full route lifecycle against the simulated
//! firmware: builder staging, provisioning, subscription refcounts and
//! idempotent teardown.

mod common;

use anyhow::Result;
use common::builders::{accel_sensor, temp_sensor, BoardBuilder};
use common::{assert_float_eq, init_tracing, pump};
use sensorlink::{Comparison, ConsumerKind, LinkError, Value};

#[test]
fn test_simple_stream_resolves_without_firmware_traffic() {
    init_tracing();
    let (mut board, handle, _clock) = BoardBuilder::new().build();
    let source = accel_sensor(&mut board);

    let mut result = board.add_route(source, |c| c.stream().map(|_| ()));
    let route_id = result.try_take().expect("resolves synchronously").unwrap();

    assert!(handle.sent_frames().is_empty());
    let route = board.registry().route(route_id).unwrap();
    assert_eq!(route.consumer_count(), 1);
    assert_eq!(route.consumer(0).unwrap().kind(), ConsumerKind::Stream);
}

#[test]
fn test_consumers_keep_builder_call_order() {
    init_tracing();
    let (mut board, handle, _clock) = BoardBuilder::new().build();
    let source = accel_sensor(&mut board);

    let mut result = board.add_route(source, |c| {
        c.split()?
            .index(0)?
            .stream()?
            .index(2)?
            .average(4)?
            .log()?
            .index(1)?
            .stream()?
            .end()
            .map(|_| ())
    });
    pump(&mut board, &handle);
    let route_id = result.try_take().unwrap().unwrap();

    let route = board.registry().route(route_id).unwrap();
    let kinds: Vec<_> = route.consumers().map(|c| c.kind()).collect();
    assert_eq!(
        kinds,
        vec![ConsumerKind::Stream, ConsumerKind::Log, ConsumerKind::Stream]
    );
    // Positions 0 and 2 are the x and y lanes of the split
    assert_eq!(
        board.descriptor(route.consumer(0).unwrap().descriptor()).layout.offset,
        0
    );
    assert_eq!(
        board.descriptor(route.consumer(2).unwrap().descriptor()).layout.offset,
        2
    );
}

#[test]
fn test_shared_sensor_enable_is_refcounted() {
    init_tracing();
    let (mut board, handle, _clock) = BoardBuilder::new().build();
    let source = accel_sensor(&mut board);

    let mut result = board.add_route(source, |c| {
        c.split()?
            .index(0)?
            .stream()?
            .index(1)?
            .stream()?
            .end()
            .map(|_| ())
    });
    let route_id = result.try_take().unwrap().unwrap();

    let rx_x = board.subscribe(route_id, 0).unwrap();
    // Both lanes notify through the same sensor register; one enable only
    assert_eq!(handle.sent_frames(), vec![vec![0x03, 0x02, 1]]);
    let rx_y = board.subscribe(route_id, 1).unwrap();
    assert_eq!(handle.sent_frames().len(), 1);

    // x = 0.5 g, y = -0.25 g, z = 1.0 g
    handle.emit(vec![0x03, 0x44, 0x00, 0x20, 0x00, 0xF0, 0x00, 0x40]);
    pump(&mut board, &handle);
    match rx_x.try_recv().unwrap() {
        Value::Float(v) => assert_float_eq(v, 0.5, 1e-3),
        other => panic!("expected float, got {other:?}"),
    }
    match rx_y.try_recv().unwrap() {
        Value::Float(v) => assert_float_eq(v, -0.25, 1e-3),
        other => panic!("expected float, got {other:?}"),
    }

    // Dropping one lane keeps the sensor live for the other
    handle.clear_sent();
    board.unsubscribe(route_id, 0).unwrap();
    assert!(handle.sent_frames().is_empty());
    board.unsubscribe(route_id, 1).unwrap();
    assert_eq!(handle.sent_frames(), vec![vec![0x03, 0x02, 0]]);
    drop(rx_y);
}

#[test]
fn test_filtered_reaction_removal_frees_exactly_its_objects() {
    init_tracing();
    let (mut board, handle, _clock) = BoardBuilder::new().build();
    let temp = temp_sensor(&mut board);

    // Occupy processor ids 0-2 and event ids 0-6 with unrelated objects
    let mut filler = board.add_route(temp, |c| {
        c.average(2)?.count()?.delay(1)?.stream().map(|_| ())
    });
    pump(&mut board, &handle);
    filler.try_take().unwrap().unwrap();
    let mut observer = board.add_observer(temp, |rec| {
        for i in 0..7 {
            rec.record_command(0x08, 0x01, &[i])?;
        }
        Ok(())
    });
    pump(&mut board, &handle);
    observer.try_take().unwrap().unwrap();

    // The route under test lands on processor id 3 and event id 7
    let mut result = board.add_route(temp, |c| {
        c.filter(Comparison::Gt, &[25.0])?
            .react(|rec| rec.record_command(0x08, 0x01, &[0xFF]))?
            .stream()
            .map(|_| ())
    });
    pump(&mut board, &handle);
    let route_id = result.try_take().unwrap().unwrap();
    assert!(handle.allocated_processors().contains(&3));
    assert!(handle.allocated_events().contains(&7));

    handle.clear_sent();
    board.remove_route(route_id).unwrap();
    // Exactly the two owned objects go away, events before processors
    assert_eq!(
        handle.sent_frames(),
        vec![vec![0x0A, 0x04, 7], vec![0x09, 0x06, 3]]
    );
    assert!(!handle.allocated_processors().contains(&3));
    assert!(!handle.allocated_events().contains(&7));
    assert!(board.registry().route(route_id).is_none());

    // Removal is idempotent
    handle.clear_sent();
    board.remove_route(route_id).unwrap();
    assert!(handle.sent_frames().is_empty());
}

#[test]
fn test_removal_releases_route_names() {
    init_tracing();
    let (mut board, handle, _clock) = BoardBuilder::new().build();
    let temp = temp_sensor(&mut board);

    let mut result = board.add_route(temp, |c| {
        c.name("room_temp")?.stream().map(|_| ())
    });
    let route_id = result.try_take().unwrap().unwrap();
    assert!(board.registry().lookup_name("room_temp").is_some());

    // A second route cannot take the name while it is held
    let mut clash = board.add_route(temp, |c| c.name("room_temp")?.stream().map(|_| ()));
    assert!(matches!(
        clash.try_take(),
        Some(Err(LinkError::InvalidRoute(_)))
    ));

    board.remove_route(route_id).unwrap();
    assert!(board.registry().lookup_name("room_temp").is_none());

    let mut reuse = board.add_route(temp, |c| c.name("room_temp")?.stream().map(|_| ()));
    pump(&mut board, &handle);
    assert!(reuse.try_take().unwrap().is_ok());
}

#[test]
fn test_feedback_route_binds_named_producer() -> Result<()> {
    init_tracing();
    let (mut board, handle, _clock) = BoardBuilder::new().build();
    let temp = temp_sensor(&mut board);

    let mut reference = board.add_route(temp, |c| c.name("setpoint").map(|_| ()));
    reference.try_take().expect("resolves synchronously")?;

    let mut result = board.add_route(temp, |c| {
        c.filter_ref(Comparison::Gt, "setpoint")?.stream().map(|_| ())
    });
    pump(&mut board, &handle);
    result.try_take().expect("resolved after acks")?;

    // One comparator plus one event rewriting its reference
    assert_eq!(handle.allocated_processors().len(), 1);
    assert_eq!(handle.allocated_events().len(), 1);
    let entry = handle
        .sent_frames()
        .into_iter()
        .find(|f| f.starts_with(&[0x0A, 0x02]))
        .expect("event entry frame");
    // Triggered by the named temperature signal
    assert_eq!(&entry[2..5], &[0x05, 0x03, 0xFF]);
    // Replays a parameter command against the data processor module
    assert_eq!(&entry[5..7], &[0x09, 0x05]);
    Ok(())
}
