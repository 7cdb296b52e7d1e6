//! Backpressure and cancellation tests: small rings, big streams,
//! blocked workers.

use riffle::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Sink that drains tiny chunks with a delay between steps.
struct SlowSink {
    data: Arc<Mutex<Vec<u8>>>,
}

impl Stage for SlowSink {
    fn stage_type(&self) -> StageType {
        StageType::Sink
    }

    fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress> {
        std::thread::sleep(Duration::from_millis(30));
        let mut buf = [0u8; 4];
        let n = io.read(&mut buf)?;
        if n == 0 {
            return Ok(Progress::Done);
        }
        self.data.lock().unwrap().extend_from_slice(&buf[..n]);
        Ok(Progress::Continue)
    }

    fn name(&self) -> &str {
        "slow_sink"
    }
}

#[test]
fn test_filter_with_op_timeout_loses_nothing_under_stall() {
    // A tiny downstream ring plus a slow consumer forces the filter's
    // writes to stall past its configured timeout; every byte it read
    // from upstream must still come out the other end.
    let payload: Vec<u8> = (0..32u8).collect();
    let data = Arc::new(Mutex::new(Vec::new()));

    let mut p = Pipeline::new();
    p.register(Element::new(MemSrc::new(payload.clone())), "src")
        .unwrap();
    p.register(
        Element::with_config(
            PassThrough::default(),
            ElementConfig::default()
                .with_out_capacity(4)
                .with_op_timeout(Duration::from_millis(20)),
        ),
        "mid",
    )
    .unwrap();
    p.register(
        Element::new(SlowSink {
            data: Arc::clone(&data),
        }),
        "sink",
    )
    .unwrap();
    p.link(&["src", "mid", "sink"]).unwrap();

    p.run().unwrap();
    p.wait_for_stop(Some(Duration::from_secs(10))).unwrap();

    assert_eq!(*data.lock().unwrap(), payload);
    let info = p.element("mid").unwrap().info();
    assert_eq!(info.bytes_in, payload.len() as u64);
    assert_eq!(info.bytes_out, payload.len() as u64);
}

#[test]
fn test_pipeline_moves_stream_larger_than_every_ring() {
    let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 253) as u8).collect();
    let sink = MemSink::new();
    let collected = sink.data();

    let mut p = Pipeline::new();
    p.register(
        Element::with_config(
            MemSrc::new(payload.clone()),
            ElementConfig::default().with_out_capacity(1024),
        ),
        "src",
    )
    .unwrap();
    p.register(
        Element::with_config(
            PassThrough::default(),
            ElementConfig::default()
                .with_required_in_capacity(1024)
                .with_out_capacity(512),
        ),
        "mid",
    )
    .unwrap();
    p.register(Element::new(sink), "sink").unwrap();
    p.link(&["src", "mid", "sink"]).unwrap();

    p.run().unwrap();
    p.wait_for_stop(Some(Duration::from_secs(10))).unwrap();

    assert_eq!(*collected.lock().unwrap(), payload);
    let info = p.element("mid").unwrap().info();
    assert_eq!(info.bytes_in, payload.len() as u64);
    assert_eq!(info.bytes_out, payload.len() as u64);
}

#[test]
fn test_stop_unblocks_writer_stuck_on_full_ring() {
    let mut p = Pipeline::new();
    p.register(
        Element::with_config(
            MemSrc::new(vec![0u8; 1 << 20]),
            ElementConfig::default().with_out_capacity(1024),
        ),
        "src",
    )
    .unwrap();
    // The sink never starts, so the source fills its ring and blocks.
    p.register(
        Element::with_config(NullSink::default(), ElementConfig::default().manual_start()),
        "sink",
    )
    .unwrap();
    p.link(&["src", "sink"]).unwrap();

    p.run().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(p.element("src").unwrap().state(), State::Running);
    assert_eq!(p.element("sink").unwrap().state(), State::Initialized);

    let begin = Instant::now();
    p.stop().unwrap();
    assert!(begin.elapsed() < Duration::from_secs(1));
    assert_eq!(p.element("src").unwrap().state(), State::Stopped);
}

#[test]
fn test_op_timeout_is_a_soft_stall() {
    // A consumer with a short read timeout keeps retrying while its
    // producer trickles, and still sees every byte.
    let payload = b"slow but steady".to_vec();
    let sink = MemSink::new();
    let collected = sink.data();

    let mut p = Pipeline::new();
    p.register(Element::new(MemSrc::new(payload.clone())), "src")
        .unwrap();
    p.register(
        Element::with_config(
            sink,
            ElementConfig::default().with_op_timeout(Duration::from_millis(5)),
        ),
        "sink",
    )
    .unwrap();
    p.link(&["src", "sink"]).unwrap();

    p.run().unwrap();
    p.wait_for_stop(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(*collected.lock().unwrap(), payload);
}

#[test]
fn test_wait_for_stop_times_out_while_stream_flows() {
    let mut p = Pipeline::new();
    p.register(Element::new(StarvedSrc), "src").unwrap();
    p.register(Element::new(NullSink::default()), "sink")
        .unwrap();
    p.link(&["src", "sink"]).unwrap();

    p.run().unwrap();
    assert!(matches!(
        p.wait_for_stop(Some(Duration::from_millis(50))),
        Err(Error::Timeout)
    ));
    p.stop().unwrap();
}
