//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use sensorlink::mock::MockHandle;
use sensorlink::Board;
use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a tracing subscriber honouring `RUST_LOG`, once per process
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Feed queued firmware notifications into the board until none remain
pub fn pump(board: &mut Board, handle: &MockHandle) {
    loop {
        let frames = handle.take_notifications();
        if frames.is_empty() {
            break;
        }
        for frame in frames {
            board.on_notification(&frame);
        }
    }
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f32, b: f32, epsilon: f32) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}
