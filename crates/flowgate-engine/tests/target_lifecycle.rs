//! A target writing into a worker's file-backed streams ring, end to end.

mod common;

use std::sync::Arc;

use common::RecordingConsumer;
use flowgate_engine::frame::{
    encode_data, BEGIN_TYPE_ID, DATA_TYPE_ID, END_TYPE_ID, RESET_TYPE_ID, WINDOW_TYPE_ID,
};
use flowgate_engine::stream_id::{reply_id, stream_id, throttle_id};
use flowgate_engine::{
    EngineConfig, EngineError, FrameHeader, FrameMetrics, FrameType, FrameView, LoadManager,
    MetricHandlerKind, StreamsLayout, Target,
};

fn config(dir: &std::path::Path) -> EngineConfig {
    EngineConfig::new(dir)
        .with_streams_buffer_capacity(64 * 1024)
        .with_worker_count(2)
}

fn drain(layout: &StreamsLayout) -> Vec<(i32, FrameHeader, Vec<u8>)> {
    let mut frames = Vec::new();
    while layout.ring().read_all(|type_id, frame| {
        let view = FrameView::wrap(frame).unwrap();
        frames.push((type_id, view.header(), view.extension().to_vec()));
    }) > 0
    {}
    frames
}

#[test]
fn stream_pair_round_trip() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let reader = StreamsLayout::create(&config.streams_path(1), config.streams_buffer_capacity)
        .unwrap();

    let metrics = Arc::new(FrameMetrics::new());
    let loads = Arc::new(LoadManager::new());
    let mut target = Target::open(&config, 1, metrics.clone(), loads.clone()).unwrap();
    assert_eq!(target.name(), "data1");

    let initial = stream_id(1, 0, 3);
    let reply = reply_id(initial);
    let sender = Arc::new(RecordingConsumer::default());
    target.register_throttle(initial, sender.clone()).unwrap();
    target.register_correlation(reply, Arc::new(RecordingConsumer::default()));
    target.register_route_stream(42, initial);

    let begin = FrameHeader::new(FrameType::Begin, initial).with_route(7, 42);
    target.write(BEGIN_TYPE_ID, &begin.to_bytes()).unwrap();

    let data = encode_data(
        &FrameHeader::new(FrameType::Data, initial).with_route(7, 42).with_window(0, 0, 8192),
        0,
        0,
        b"request",
    );
    target.write(DATA_TYPE_ID, &data).unwrap();

    assert!(target.resolve_correlation(reply).unwrap());
    let reply_begin = FrameHeader::new(FrameType::Begin, reply).with_route(42, 7);
    target.write(BEGIN_TYPE_ID, &reply_begin.to_bytes()).unwrap();

    let reply_data = encode_data(
        &FrameHeader::new(FrameType::Data, reply).with_route(42, 7),
        0,
        0,
        b"response!",
    );
    target.write(DATA_TYPE_ID, &reply_data).unwrap();

    let state = target.lifecycle(initial).unwrap();
    assert!(state.initial_opened());
    assert!(state.reply_opened());

    target
        .write(END_TYPE_ID, &FrameHeader::new(FrameType::End, initial).with_route(7, 42).to_bytes())
        .unwrap();
    target
        .write(END_TYPE_ID, &FrameHeader::new(FrameType::End, reply).with_route(42, 7).to_bytes())
        .unwrap();
    assert_eq!(target.lifecycle(initial), None);

    let frames = drain(&reader);
    let types: Vec<i32> = frames.iter().map(|(t, _, _)| *t).collect();
    assert_eq!(
        types,
        vec![BEGIN_TYPE_ID, DATA_TYPE_ID, BEGIN_TYPE_ID, DATA_TYPE_ID, END_TYPE_ID, END_TYPE_ID]
    );
    assert_eq!(frames[0].1, begin);
    assert_eq!(frames[1].1.maximum, 8192);
    assert_eq!(&frames[1].2[16..], b"request");

    let load = loads.snapshot(7).unwrap();
    assert_eq!(load.reply_opened, 1);
    assert_eq!(load.reply_closed, 1);
    assert_eq!(load.reply_bytes_written, 9);
    assert_eq!(loads.snapshot(42).unwrap().initial_opened, 1);

    let routed = metrics.binding(MetricHandlerKind::Routed, 7).unwrap();
    assert_eq!((routed.begin, routed.data, routed.end), (1, 1, 1));

    assert_eq!(target.close(), 0);
    assert!(sender.frames().is_empty());
}

#[test]
fn close_resets_open_senders() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let _reader = StreamsLayout::create(&config.streams_path(0), config.streams_buffer_capacity)
        .unwrap();

    let mut target = Target::open(
        &config,
        0,
        Arc::new(FrameMetrics::new()),
        Arc::new(LoadManager::new()),
    )
    .unwrap();

    let open = stream_id(0, 1, 5);
    let ended = stream_id(0, 1, 7);
    let open_sender = Arc::new(RecordingConsumer::default());
    let ended_sender = Arc::new(RecordingConsumer::default());
    target.register_throttle(open, open_sender.clone()).unwrap();
    target.register_throttle(ended, ended_sender.clone()).unwrap();

    target
        .write(BEGIN_TYPE_ID, &FrameHeader::new(FrameType::Begin, ended).to_bytes())
        .unwrap();
    target
        .write(END_TYPE_ID, &FrameHeader::new(FrameType::End, ended).to_bytes())
        .unwrap();

    assert_eq!(target.close(), 1);
    assert!(ended_sender.frames().is_empty());

    let frames = open_sender.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, RESET_TYPE_ID);
    let reset = FrameView::wrap(&frames[0].1).unwrap();
    assert_eq!(reset.stream_id(), throttle_id(0, 1, 5));
    assert_eq!(reset.sequence(), -1);
    assert_eq!(reset.acknowledge(), -1);
    assert_eq!(reset.maximum(), 0);
}

#[test]
fn detached_target_accepts_writes_after_reader_is_gone() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path()).with_streams_buffer_capacity(1024);
    let reader = StreamsLayout::create(&config.streams_path(0), 1024).unwrap();

    let mut target = Target::open(
        &config,
        0,
        Arc::new(FrameMetrics::new()),
        Arc::new(LoadManager::new()),
    )
    .unwrap();

    let window = FrameHeader::new(FrameType::Window, 0).to_bytes();
    let mut written = 0;
    loop {
        match target.write(WINDOW_TYPE_ID, &window) {
            Ok(()) => written += 1,
            Err(EngineError::Unwritable { target, .. }) => {
                assert_eq!(target, "data0");
                break;
            }
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert!(written > 0);

    drop(reader);
    target.detach();
    for _ in 0..100 {
        target.write(WINDOW_TYPE_ID, &window).unwrap();
    }
    target.close();
}

#[test]
fn open_requires_existing_layout_and_valid_index() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    let err = Target::open(
        &config,
        0,
        Arc::new(FrameMetrics::new()),
        Arc::new(LoadManager::new()),
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::Io(_)));

    let err = Target::open(
        &config,
        2,
        Arc::new(FrameMetrics::new()),
        Arc::new(LoadManager::new()),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        EngineError::WorkerIndexOutOfRange { index: 2, limit: 2 }
    ));
}
