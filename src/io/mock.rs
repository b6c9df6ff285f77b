// src/io/mock.rs
//
// In-memory link for tests and demo mode. Inbound bytes are scripted with
// `feed`, outbound bytes are captured, and open/read/write failures can be
// injected. With loopback on, written bytes are fed straight back.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{ByteSource, LinkOpener};
use crate::error::LinkError;
use crate::settings::LinkConfig;

/// Poll interval when no bytes are queued
const IDLE_POLL: Duration = Duration::from_millis(1);

#[derive(Default)]
struct MockState {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    loopback: bool,
    fail_open: Option<String>,
    fail_read: Option<String>,
    fail_write: Option<String>,
    open_delay: Duration,
    opens: usize,
    open: bool,
}

/// Shared handle to a mock device. Clones refer to the same device.
#[derive(Clone, Default)]
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue bytes for the receiver to read.
    pub fn feed(&self, data: &[u8]) {
        self.lock().inbound.extend(data.iter().copied());
    }

    /// Bytes written so far.
    pub fn outbound(&self) -> Vec<u8> {
        self.lock().outbound.clone()
    }

    pub fn set_loopback(&self, enabled: bool) {
        self.lock().loopback = enabled;
    }

    /// The next open attempt fails with `reason`.
    pub fn fail_next_open(&self, reason: &str) {
        self.lock().fail_open = Some(reason.to_string());
    }

    /// The next read fails with `reason`.
    pub fn fail_next_read(&self, reason: &str) {
        self.lock().fail_read = Some(reason.to_string());
    }

    /// Every write fails with `reason` until cleared with `None`.
    pub fn fail_writes(&self, reason: Option<&str>) {
        self.lock().fail_write = reason.map(str::to_string);
    }

    /// Make `open` block for `delay` before returning.
    pub fn set_open_delay(&self, delay: Duration) {
        self.lock().open_delay = delay;
    }

    /// Successful opens so far.
    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }
}

impl LinkOpener for MockLink {
    fn open(&self, config: &LinkConfig) -> Result<Box<dyn ByteSource>, LinkError> {
        let delay = self.lock().open_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.lock();
        if let Some(reason) = state.fail_open.take() {
            return Err(LinkError::Open {
                port: config.port.clone(),
                reason,
            });
        }
        state.opens += 1;
        state.open = true;
        Ok(Box::new(MockSource { link: self.clone() }))
    }
}

struct MockSource {
    link: MockLink,
}

impl ByteSource for MockSource {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        let count = {
            let mut state = self.link.lock();
            if !state.open {
                return Err(LinkError::NotOpen);
            }
            if let Some(reason) = state.fail_read.take() {
                return Err(LinkError::Io(reason));
            }
            let count = buf.len().min(state.inbound.len());
            for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..count)) {
                *slot = byte;
            }
            count
        };
        if count == 0 {
            std::thread::sleep(IDLE_POLL);
        }
        Ok(count)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let mut state = self.link.lock();
        if !state.open {
            return Err(LinkError::NotOpen);
        }
        if let Some(reason) = &state.fail_write {
            return Err(LinkError::Io(reason.clone()));
        }
        state.outbound.extend_from_slice(data);
        if state.loopback {
            state.inbound.extend(data.iter().copied());
        }
        Ok(())
    }

    fn close(&mut self) {
        self.link.lock().open = false;
    }
}
