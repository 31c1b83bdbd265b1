//! Many producers, one consumer, against heap and file-backed rings.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use flowgate_engine::{ManyToOneRing, StreamsLayout};

const PRODUCERS: usize = 4;
const MESSAGES_PER_PRODUCER: u32 = 2_000;

fn encode(producer: u8, sequence: u32, filler: usize) -> Vec<u8> {
    let mut payload = Vec::with_capacity(5 + filler);
    payload.push(producer);
    payload.extend_from_slice(&sequence.to_le_bytes());
    payload.extend(std::iter::repeat(producer).take(filler));
    payload
}

fn decode(payload: &[u8]) -> (usize, u32) {
    let producer = payload[0];
    let sequence = u32::from_le_bytes(payload[1..5].try_into().unwrap());
    assert!(
        payload[5..].iter().all(|&b| b == producer),
        "payload torn for producer {producer} sequence {sequence}"
    );
    (producer as usize, sequence)
}

/// Drains until every producer's messages have arrived, checking per-producer order.
fn consume(ring: &ManyToOneRing, producers: usize, per_producer: u32) {
    let mut next = vec![0u32; producers];
    let total = producers as u64 * per_producer as u64;
    let mut received = 0u64;

    while received < total {
        let read = ring.read(
            |type_id, payload| {
                assert_eq!(type_id, 1);
                let (producer, sequence) = decode(payload);
                assert_eq!(sequence, next[producer], "producer {producer} out of order");
                next[producer] += 1;
            },
            64,
        );
        if read == 0 {
            thread::yield_now();
        }
        received += read as u64;
    }

    assert!(next.iter().all(|&n| n == per_producer));
}

#[test]
fn many_writers_one_reader() {
    common::init_tracing();
    let ring = Arc::new(ManyToOneRing::with_capacity(4096).unwrap());

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let ring = ring.clone();
            thread::spawn(move || {
                for sequence in 0..MESSAGES_PER_PRODUCER {
                    let payload = encode(producer as u8, sequence, (sequence % 40) as usize);
                    while !ring.write(1, &payload).unwrap() {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    consume(&ring, PRODUCERS, MESSAGES_PER_PRODUCER);

    for producer in producers {
        producer.join().unwrap();
    }

    assert_eq!(ring.size(), 0);
    assert_eq!(ring.producer_position(), ring.consumer_position());
}

#[test]
fn many_claimers_one_reader() {
    let ring = Arc::new(ManyToOneRing::with_capacity(2048).unwrap());

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let ring = ring.clone();
            thread::spawn(move || {
                for sequence in 0..MESSAGES_PER_PRODUCER {
                    let payload = encode(producer as u8, sequence, 11);
                    let index = loop {
                        match ring.try_claim(1, payload.len()).unwrap() {
                            Some(index) => break index,
                            None => thread::yield_now(),
                        }
                    };
                    assert_eq!(index % 8, 0);
                    ring.buffer().put_bytes(index, &payload);
                    ring.commit(index);
                }
            })
        })
        .collect();

    consume(&ring, PRODUCERS, MESSAGES_PER_PRODUCER);

    for producer in producers {
        producer.join().unwrap();
    }
}

#[test]
fn writers_through_separate_mappings() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data0");
    let reader = StreamsLayout::create(&path, 4096).unwrap();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let writer = StreamsLayout::open(&path).unwrap();
            thread::spawn(move || {
                let ring = writer.ring();
                for sequence in 0..500 {
                    let payload = encode(producer as u8, sequence, 3);
                    while !ring.write(1, &payload).unwrap() {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    consume(reader.ring(), PRODUCERS, 500);

    for producer in producers {
        producer.join().unwrap();
    }
}

#[test]
fn supervisor_unblocks_dead_producer() {
    common::init_tracing();
    let ring = Arc::new(ManyToOneRing::with_capacity(1024).unwrap());

    // a producer that claims and then dies before committing
    let abandoned = ring.try_claim(1, 32).unwrap().unwrap();
    ring.buffer().put_bytes(abandoned, &[0xee; 32]);

    let done = Arc::new(AtomicBool::new(false));
    let producer = {
        let ring = ring.clone();
        let done = done.clone();
        thread::spawn(move || {
            for sequence in 0..50u32 {
                let payload = encode(1, sequence, 0);
                while !ring.write(1, &payload).unwrap() {
                    thread::yield_now();
                }
            }
            done.store(true, Ordering::Release);
        })
    };

    while !done.load(Ordering::Acquire) {
        assert_eq!(ring.read_all(|_, _| {}), 0);
        thread::yield_now();
    }
    producer.join().unwrap();

    assert_eq!(ring.read_all(|_, _| {}), 0);
    assert!(ring.unblock());

    let mut sequences = Vec::new();
    while sequences.len() < 50 {
        let read = ring.read_all(|_, payload| sequences.push(decode(payload).1));
        assert!(read > 0 || sequences.len() == 50);
    }
    assert_eq!(sequences, (0..50).collect::<Vec<_>>());
}
