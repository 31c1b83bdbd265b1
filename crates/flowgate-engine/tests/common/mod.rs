//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Mutex;

use flowgate_engine::MessageConsumer;
use tracing_subscriber::EnvFilter;

/// Installs a test subscriber honouring `RUST_LOG`; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Consumer that keeps every frame it is handed.
#[derive(Default)]
pub struct RecordingConsumer {
    frames: Mutex<Vec<(i32, Vec<u8>)>>,
}

impl RecordingConsumer {
    pub fn frames(&self) -> Vec<(i32, Vec<u8>)> {
        self.frames.lock().unwrap().clone()
    }
}

impl MessageConsumer for RecordingConsumer {
    fn accept(&self, type_id: i32, frame: &[u8]) {
        self.frames.lock().unwrap().push((type_id, frame.to_vec()));
    }
}
