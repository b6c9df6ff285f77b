// src/io/serial/reader.rs
//
// Blocking receive worker. Owns the byte source, the ingest buffer and the
// decoder for one link session; runs on a `spawn_blocking` thread.
// Between reads it services control requests and queued transmits.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use super::framer::{FramingEncoding, SerialFramer};
use crate::channel::SampleSender;
use crate::decoder::SampleDecoder;
use crate::error::{FrameError, LinkError};
use crate::io::types::{ControlReceiver, TransmitReceiver, WorkerControl};
use crate::io::{emit, ByteSource, EventSender, ScopeEvent};

const READ_CHUNK: usize = 1024;

// ============================================================================
// Types
// ============================================================================

/// Everything the worker needs for one session. Moved onto the worker thread.
pub struct ReceiverContext {
    pub port_name: String,
    pub framing: FramingEncoding,
    pub decoder: SampleDecoder,
    pub samples: SampleSender,
    pub events: EventSender,
    pub cancel: Arc<AtomicBool>,
    pub control_rx: ControlReceiver,
    pub transmit_rx: TransmitReceiver,
    /// Minimum spacing of BytesReceived events
    pub bytes_event_interval: Duration,
}

/// Why the worker stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverExit {
    /// Cancelled by a close request
    Stopped,
    /// The source failed mid-session
    Failed(LinkError),
}

/// Per-session counters, logged when the worker exits.
#[derive(Debug, Default)]
struct ReceiveStats {
    frames: u64,
    samples: u64,
    decode_errors: u64,
    checksum_errors: u64,
    desync_bytes: u64,
}

// ============================================================================
// Receive loop
// ============================================================================

/// Run until cancelled or the source fails. On the way out, frames already
/// buffered are decoded, a trailing partial frame is dropped, the source is
/// closed and the sample channel sealed.
pub fn run_receive_loop(mut source: Box<dyn ByteSource>, ctx: ReceiverContext) -> ReceiverExit {
    let ReceiverContext {
        port_name,
        framing,
        mut decoder,
        samples,
        events,
        cancel,
        control_rx,
        transmit_rx,
        bytes_event_interval,
    } = ctx;

    let mut framer = SerialFramer::new(framing);
    let mut stats = ReceiveStats::default();
    let mut buf = [0u8; READ_CHUNK];
    let mut last_emit = Instant::now();
    let mut reported_total = 0u64;

    tlog!("[serial:{}] Receiver started", port_name);

    let exit = loop {
        if cancel.load(Ordering::Relaxed) {
            break ReceiverExit::Stopped;
        }

        // Control requests (non-blocking)
        while let Ok(control) = control_rx.try_recv() {
            match control {
                WorkerControl::SetFrameCheck(enabled) => {
                    tlog!(
                        "[serial:{}] Frame check {}",
                        port_name,
                        if enabled { "enabled" } else { "disabled" }
                    );
                    decoder.set_frame_check(enabled);
                }
                WorkerControl::SetStartMarker(marker) => {
                    tlog!(
                        "[serial:{}] Start marker set to {}",
                        port_name,
                        hex::encode_upper(&marker)
                    );
                    framer.set_start_marker(marker);
                    drain_frames(&mut framer, &mut decoder, &samples, &events, &mut stats);
                }
            }
        }

        // Pending transmit requests (non-blocking)
        while let Ok(req) = transmit_rx.try_recv() {
            match source.write(&req.data) {
                Ok(()) => emit(
                    &events,
                    ScopeEvent::Transmitted {
                        bytes: req.data.len(),
                    },
                ),
                Err(e) => {
                    // A failed write does not end the session
                    tlog!("[serial:{}] Transmit failed: {}", port_name, e);
                    emit(
                        &events,
                        ScopeEvent::TransmitFailed {
                            message: e.to_string(),
                        },
                    );
                }
            }
        }

        match source.read_available(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                framer.append(&buf[..n]);
                drain_frames(&mut framer, &mut decoder, &samples, &events, &mut stats);
            }
            Err(e) => {
                tlog!("[serial:{}] Read error: {}", port_name, e);
                break ReceiverExit::Failed(e);
            }
        }

        // Throttled byte counter
        if framer.total_bytes() != reported_total && last_emit.elapsed() >= bytes_event_interval {
            reported_total = framer.total_bytes();
            last_emit = Instant::now();
            emit(
                &events,
                ScopeEvent::BytesReceived {
                    total: reported_total,
                },
            );
        }
    };

    // Finish what is already buffered, then drop the trailing partial frame
    drain_frames(&mut framer, &mut decoder, &samples, &events, &mut stats);
    let partial = framer.flush();
    report_desync(&mut framer, &events, &mut stats);
    if partial > 0 {
        tlog!(
            "[serial:{}] Dropped {} bytes of incomplete frame",
            port_name,
            partial
        );
    }

    if framer.total_bytes() != reported_total {
        emit(
            &events,
            ScopeEvent::BytesReceived {
                total: framer.total_bytes(),
            },
        );
    }

    source.close();
    samples.close();

    tlog!(
        "[serial:{}] Receiver stopped ({:?}): {} bytes, {} frames, {} samples, {} decode errors, {} checksum errors, {} desync bytes, {} samples dropped",
        port_name,
        exit,
        framer.total_bytes(),
        stats.frames,
        stats.samples,
        stats.decode_errors,
        stats.checksum_errors,
        stats.desync_bytes,
        samples.dropped()
    );

    exit
}

/// Extract and decode every complete frame in the buffer.
fn drain_frames(
    framer: &mut SerialFramer,
    decoder: &mut SampleDecoder,
    samples: &SampleSender,
    events: &EventSender,
    stats: &mut ReceiveStats,
) {
    while let Some(frame) = framer.try_extract_frame() {
        stats.frames += 1;
        match decoder.decode(&frame) {
            Ok(decoded) => {
                stats.samples += decoded.len() as u64;
                samples.push_all(decoded);
            }
            Err(e) => {
                match e {
                    FrameError::ChecksumMismatch { .. } => stats.checksum_errors += 1,
                    _ => stats.decode_errors += 1,
                }
                emit(events, e.into());
            }
        }
    }
    report_desync(framer, events, stats);
}

fn report_desync(framer: &mut SerialFramer, events: &EventSender, stats: &mut ReceiveStats) {
    let discarded = framer.take_discarded();
    if discarded > 0 {
        stats.desync_bytes += discarded as u64;
        emit(events, FrameError::Desync { discarded }.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{sample_channel, Backpressure};
    use crate::io::types::TransmitRequest;
    use crate::io::{LinkOpener, MockLink};
    use crate::settings::{DecoderSettings, LinkConfig};
    use std::sync::mpsc as std_mpsc;

    struct Harness {
        link: MockLink,
        cancel: Arc<AtomicBool>,
        control_tx: std_mpsc::Sender<WorkerControl>,
        transmit_tx: std_mpsc::SyncSender<TransmitRequest>,
        events: tokio::sync::mpsc::UnboundedReceiver<ScopeEvent>,
        samples: crate::channel::SampleReceiver,
        worker: std::thread::JoinHandle<ReceiverExit>,
    }

    fn start() -> Harness {
        let link = MockLink::new();
        let source = link.open(&LinkConfig::new("mock", 115_200)).unwrap();
        let (samples_tx, samples_rx) = sample_channel(256, Backpressure::DropOldest);
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let (control_tx, control_rx) = std_mpsc::channel();
        let (transmit_tx, transmit_rx) = std_mpsc::sync_channel(8);
        let cancel = Arc::new(AtomicBool::new(false));

        let ctx = ReceiverContext {
            port_name: "mock".to_string(),
            framing: FramingEncoding::default(),
            decoder: SampleDecoder::new(&DecoderSettings::default()),
            samples: samples_tx,
            events: events_tx,
            cancel: cancel.clone(),
            control_rx,
            transmit_rx,
            bytes_event_interval: Duration::from_millis(1),
        };
        let worker = std::thread::spawn(move || run_receive_loop(source, ctx));

        Harness {
            link,
            cancel,
            control_tx,
            transmit_tx,
            events: events_rx,
            samples: samples_rx,
            worker,
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn collect(events: &mut tokio::sync::mpsc::UnboundedReceiver<ScopeEvent>) -> Vec<ScopeEvent> {
        std::iter::from_fn(|| events.try_recv().ok()).collect()
    }

    #[test]
    fn test_frames_become_samples_and_stop_seals_channel() {
        let mut h = start();
        h.link.feed(b"\xFF\x021,2\x03\x023");
        wait_until(|| h.samples.len() == 2);

        h.cancel.store(true, Ordering::Relaxed);
        assert_eq!(h.worker.join().unwrap(), ReceiverExit::Stopped);

        let values: Vec<f64> = h.samples.drain(10).iter().map(|s| s.value).collect();
        assert_eq!(values, vec![1.0, 2.0]);
        assert!(h.samples.is_drained());
        assert!(!h.link.is_open());

        let events = collect(&mut h.events);
        // Leading noise, then the trailing partial "\x023" at close
        assert!(events.contains(&ScopeEvent::FrameDesync { discarded: 1 }));
        assert!(events.contains(&ScopeEvent::FrameDesync { discarded: 2 }));
        assert_eq!(
            events
                .iter()
                .filter_map(|e| match e {
                    ScopeEvent::BytesReceived { total } => Some(*total),
                    _ => None,
                })
                .last(),
            Some(8)
        );
    }

    #[test]
    fn test_decode_error_reported_and_stream_continues() {
        let mut h = start();
        h.link.feed(b"\x021,oops\x03\x025\x03");
        wait_until(|| h.samples.len() == 1);
        h.cancel.store(true, Ordering::Relaxed);
        h.worker.join().unwrap();

        let events = collect(&mut h.events);
        assert!(events.iter().any(|e| matches!(
            e,
            ScopeEvent::DecodeError { raw, .. } if raw == b"1,oops"
        )));
        assert_eq!(h.samples.drain(10)[0].value, 5.0);
    }

    #[test]
    fn test_transmit_success_and_failure_keep_running() {
        let mut h = start();
        h.transmit_tx
            .send(TransmitRequest {
                data: b"ping".to_vec(),
            })
            .unwrap();
        wait_until(|| h.link.outbound() == b"ping".to_vec());

        h.link.fail_writes(Some("tx fault"));
        h.transmit_tx
            .send(TransmitRequest {
                data: b"x".to_vec(),
            })
            .unwrap();

        // Still receiving after the failed write
        h.link.feed(b"\x027\x03");
        wait_until(|| h.samples.len() == 1);
        h.cancel.store(true, Ordering::Relaxed);
        assert_eq!(h.worker.join().unwrap(), ReceiverExit::Stopped);

        let events = collect(&mut h.events);
        assert!(events.contains(&ScopeEvent::Transmitted { bytes: 4 }));
        assert!(events
            .iter()
            .any(|e| matches!(e, ScopeEvent::TransmitFailed { .. })));
    }

    #[test]
    fn test_read_error_ends_session() {
        let h = start();
        h.link.fail_next_read("unplugged");
        let exit = h.worker.join().unwrap();
        assert_eq!(exit, ReceiverExit::Failed(LinkError::Io("unplugged".to_string())));
        assert!(h.samples.is_drained());
    }

    #[test]
    fn test_control_requests_applied() {
        let h = start();
        h.control_tx
            .send(WorkerControl::SetStartMarker(vec![0x7E]))
            .unwrap();
        h.control_tx.send(WorkerControl::SetFrameCheck(true)).unwrap();
        // Give the worker a chance to apply both before data arrives
        std::thread::sleep(Duration::from_millis(20));

        // Default CRC-16 Modbus trailer, little-endian
        let check = crate::checksums::FrameCheck::default();
        let mut stream = vec![0x7E];
        stream.extend(check.append_trailer(b"42"));
        stream.push(0x03);
        h.link.feed(&stream);

        wait_until(|| h.samples.len() == 1);
        h.cancel.store(true, Ordering::Relaxed);
        h.worker.join().unwrap();
        assert_eq!(h.samples.drain(1)[0].value, 42.0);
    }
}
