//! Integration tests for logged consumers and chunked log downloads
//!
//! A logged signal wider than one log entry is captured under several
//! trigger ids and re-merged on download. Rows are delivered only once
//! every id has contributed its chunk.

mod common;

use common::builders::{accel_sensor, temp_sensor, BoardBuilder};
use common::{assert_float_eq, init_tracing, pump};
use sensorlink::Value;

#[test]
fn test_log_download_is_enabled_once() {
    init_tracing();
    let (mut board, handle, _clock) = BoardBuilder::new().build();
    let temp = temp_sensor(&mut board);

    let mut first = board.add_route(temp, |c| c.log().map(|_| ()));
    pump(&mut board, &handle);
    first.try_take().unwrap().unwrap();

    let readiness: Vec<_> = handle
        .sent_frames()
        .into_iter()
        .filter(|f| f[0] == 0x0B && (f[1] == 0x01 || f[1] == 0x07))
        .collect();
    assert_eq!(readiness, vec![vec![0x0B, 0x01, 1], vec![0x0B, 0x07, 1]]);

    // A second logged route reuses the already-enabled download path
    handle.clear_sent();
    let mut second = board.add_route(temp, |c| c.log().map(|_| ()));
    pump(&mut board, &handle);
    second.try_take().unwrap().unwrap();
    assert!(handle
        .sent_frames()
        .iter()
        .all(|f| !(f[0] == 0x0B && (f[1] == 0x01 || f[1] == 0x07))));
}

#[test]
fn test_chunked_row_merges_across_trigger_ids() {
    init_tracing();
    let (mut board, handle, _clock) = BoardBuilder::new().build();
    let accel = accel_sensor(&mut board);

    let mut result = board.add_route(accel, |c| c.log().map(|_| ()));
    pump(&mut board, &handle);
    let route_id = result.try_take().unwrap().unwrap();
    assert_eq!(handle.allocated_loggers(), vec![0, 1]);

    let rx = board.subscribe(route_id, 0).unwrap();
    // Log subscription is host-side only
    assert!(handle.sent_frames().iter().all(|f| f[0] != 0x03));

    // x = 0.5 g, y = -0.25 g in chunk 0; z = 1.0 g in chunk 1
    handle.emit(vec![0x0B, 0x07, 0, 0x00, 0x20, 0x00, 0xF0]);
    pump(&mut board, &handle);
    // One chunk alone is not a row
    assert!(rx.try_recv().is_err());

    handle.emit(vec![0x0B, 0x07, 1, 0x00, 0x40]);
    pump(&mut board, &handle);
    match rx.try_recv().unwrap() {
        Value::Vector(lanes) => {
            assert_eq!(lanes.len(), 3);
            assert_float_eq(lanes[0], 0.5, 1e-3);
            assert_float_eq(lanes[1], -0.25, 1e-3);
            assert_float_eq(lanes[2], 1.0, 1e-3);
        }
        other => panic!("expected vector, got {other:?}"),
    }
}

#[test]
fn test_rows_queue_per_id_under_interleaving() {
    init_tracing();
    let (mut board, handle, _clock) = BoardBuilder::new().build();
    let accel = accel_sensor(&mut board);

    let mut result = board.add_route(accel, |c| c.log().map(|_| ()));
    pump(&mut board, &handle);
    let route_id = result.try_take().unwrap().unwrap();
    let rx = board.subscribe(route_id, 0).unwrap();

    // Two chunk-0 entries arrive before any chunk-1 entry
    handle.emit(vec![0x0B, 0x07, 0, 0x00, 0x20, 0x00, 0x00]);
    handle.emit(vec![0x0B, 0x07, 0, 0x00, 0x40, 0x00, 0x00]);
    pump(&mut board, &handle);
    assert!(rx.try_recv().is_err());

    handle.emit(vec![0x0B, 0x07, 1, 0x00, 0x00]);
    pump(&mut board, &handle);
    let first = rx.try_recv().unwrap();
    assert_float_eq(first.as_lanes().unwrap()[0], 0.5, 1e-3);
    assert!(rx.try_recv().is_err());

    handle.emit(vec![0x0B, 0x07, 1, 0x00, 0x00]);
    pump(&mut board, &handle);
    let second = rx.try_recv().unwrap();
    assert_float_eq(second.as_lanes().unwrap()[0], 1.0, 1e-3);
}

#[test]
fn test_removed_route_drops_its_log_chunks() {
    init_tracing();
    let (mut board, handle, _clock) = BoardBuilder::new().build();
    let accel = accel_sensor(&mut board);

    let mut result = board.add_route(accel, |c| c.log().map(|_| ()));
    pump(&mut board, &handle);
    let route_id = result.try_take().unwrap().unwrap();
    let rx = board.subscribe(route_id, 0).unwrap();

    handle.clear_sent();
    board.remove_route(route_id).unwrap();
    // Both trigger ids are freed on the firmware
    let removes: Vec<_> = handle
        .sent_frames()
        .into_iter()
        .filter(|f| f.starts_with(&[0x0B, 0x03]))
        .collect();
    assert_eq!(removes, vec![vec![0x0B, 0x03, 0], vec![0x0B, 0x03, 1]]);
    assert!(handle.allocated_loggers().is_empty());

    // Late chunks for the dead ids are ignored
    handle.emit(vec![0x0B, 0x07, 0, 0x00, 0x20, 0x00, 0xF0]);
    handle.emit(vec![0x0B, 0x07, 1, 0x00, 0x40]);
    pump(&mut board, &handle);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_mixed_route_logs_the_processed_signal() {
    init_tracing();
    let (mut board, handle, _clock) = BoardBuilder::new().build();
    let temp = temp_sensor(&mut board);

    // Averaged temperature fits one chunk: a single trigger id
    let mut result = board.add_route(temp, |c| c.average(8)?.log().map(|_| ()));
    pump(&mut board, &handle);
    let route_id = result.try_take().unwrap().unwrap();
    assert_eq!(handle.allocated_loggers(), vec![0]);

    // The trigger sources from the processor's notify register, not the sensor
    let trigger = handle
        .sent_frames()
        .into_iter()
        .find(|f| f.starts_with(&[0x0B, 0x02]))
        .expect("log trigger frame");
    assert_eq!(&trigger[2..5], &[0x09, 0x03, 0]);

    let rx = board.subscribe(route_id, 0).unwrap();
    // 21.5 degrees at 1/8 degree resolution
    handle.emit(vec![0x0B, 0x07, 0, 0xAC, 0x00]);
    pump(&mut board, &handle);
    match rx.try_recv().unwrap() {
        Value::Float(v) => assert_float_eq(v, 21.5, 1e-3),
        other => panic!("expected float, got {other:?}"),
    }
}
