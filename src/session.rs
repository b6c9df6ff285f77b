// src/session.rs
//
// Link session controller. Owns the Closed -> Opening -> Open -> Closing ->
// Closed state machine, runs the receive worker and publishes events.
//
// Commands from the UI are handled strictly in order by one controller task.
// Opening is awaited before the next command is taken, so a close issued
// while the port is still opening is handled as soon as the open resolves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};

use crate::channel::{sample_channel, SampleSender};
use crate::chart::ChartUpdater;
use crate::decoder::SampleDecoder;
use crate::error::{ConfigError, LinkError, SessionError};
use crate::io::serial::reader::{run_receive_loop, ReceiverContext, ReceiverExit};
use crate::io::types::{ControlSender, WorkerControl};
use crate::io::{emit, ByteSource, EventReceiver, EventSender, LinkOpener, LinkState, ScopeEvent};
use crate::settings::{LinkConfig, ScopeSettings};
use crate::transmit::{TransmitPath, TransmitSlot};

// ============================================================================
// Handle
// ============================================================================

enum Command {
    Open(LinkConfig),
    Close,
    SetFrameCheck(bool),
    SetStartMarker(Vec<u8>),
    Shutdown,
}

/// UI-side handle to a running session. Commands are queued and never block.
pub struct ScopeSession {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<LinkState>,
    transmit: TransmitPath,
    controller: Option<JoinHandle<()>>,
}

impl ScopeSession {
    /// Start the controller task. Must be called inside a tokio runtime.
    /// Returns the handle, the chart model for the render loop, and the event
    /// stream.
    pub fn start(
        opener: Arc<dyn LinkOpener>,
        settings: ScopeSettings,
    ) -> Result<(ScopeSession, ChartUpdater, EventReceiver), ConfigError> {
        settings.validate()?;

        let (samples_tx, samples_rx) =
            sample_channel(settings.channel.capacity, settings.channel.backpressure);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LinkState::Closed);
        let slot: TransmitSlot = Arc::new(Mutex::new(None));

        let chart = ChartUpdater::new(samples_rx, settings.chart.clone());
        let transmit = TransmitPath::new(&settings, slot.clone());

        let controller = Controller {
            opener,
            frame_check: settings.decoder.frame_check_enabled,
            start_marker: settings.framing.start_marker().to_vec(),
            settings,
            samples: samples_tx,
            events: events_tx,
            state: state_tx,
            slot,
            worker: None,
        };
        let handle = tokio::spawn(controller.run(commands_rx));

        let session = ScopeSession {
            commands: commands_tx,
            state: state_rx,
            transmit,
            controller: Some(handle),
        };
        Ok((session, chart, events_rx))
    }

    fn command(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::ControllerGone)
    }

    /// Open the link with `config`. Ignored unless the link is closed.
    pub fn open(&self, config: LinkConfig) -> Result<(), SessionError> {
        self.command(Command::Open(config))
    }

    /// Close the link, draining queued samples first.
    pub fn close(&self) -> Result<(), SessionError> {
        self.command(Command::Close)
    }

    /// Toggle checksum verification (receive) and trailers (framed transmit).
    pub fn set_frame_check(&mut self, enabled: bool) -> Result<(), SessionError> {
        self.transmit.set_frame_check(enabled);
        self.command(Command::SetFrameCheck(enabled))
    }

    /// Change the frame start marker on both directions.
    pub fn set_start_marker(&mut self, marker: Vec<u8>) -> Result<(), SessionError> {
        self.transmit.set_start_marker(marker.clone());
        self.command(Command::SetStartMarker(marker))
    }

    /// Put `text` in the send buffer and queue it for writing.
    pub fn send_message(&mut self, text: impl Into<String>) -> Result<usize, SessionError> {
        self.transmit.set_message(text);
        self.transmit.send()
    }

    /// Queue the current send buffer again.
    pub fn send(&self) -> Result<usize, SessionError> {
        self.transmit.send()
    }

    pub fn clear_send_buffer(&mut self) {
        self.transmit.clear();
    }

    pub fn transmit(&self) -> &TransmitPath {
        &self.transmit
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch channel for awaiting state changes.
    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Close the link if open and stop the controller.
    pub async fn shutdown(mut self) {
        let _ = self.command(Command::Shutdown);
        if let Some(handle) = self.controller.take() {
            if let Err(e) = handle.await {
                tlog!("[session] Controller task failed: {}", e);
            }
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

struct Worker {
    port: String,
    cancel: Arc<AtomicBool>,
    control: ControlSender,
    handle: JoinHandle<ReceiverExit>,
}

enum Wake {
    Command(Option<Command>),
    WorkerExited(Result<ReceiverExit, JoinError>),
}

struct Controller {
    opener: Arc<dyn LinkOpener>,
    settings: ScopeSettings,
    samples: SampleSender,
    events: EventSender,
    state: watch::Sender<LinkState>,
    slot: TransmitSlot,
    frame_check: bool,
    start_marker: Vec<u8>,
    worker: Option<Worker>,
}

impl Controller {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let wake = match self.worker.as_mut() {
                Some(worker) => tokio::select! {
                    command = commands.recv() => Wake::Command(command),
                    exit = &mut worker.handle => Wake::WorkerExited(exit),
                },
                None => Wake::Command(commands.recv().await),
            };

            match wake {
                Wake::Command(Some(Command::Shutdown)) | Wake::Command(None) => {
                    self.close().await;
                    break;
                }
                Wake::Command(Some(command)) => self.handle(command).await,
                Wake::WorkerExited(result) => {
                    // The worker stopped on its own (read error, disconnect)
                    let port = self.worker.take().map(|w| w.port).unwrap_or_default();
                    self.set_state(LinkState::Closing);
                    self.clear_slot();
                    self.finish_close(&port, exit_from(result)).await;
                }
            }
        }
        tlog!("[session] Controller stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Open(config) => self.open(config).await,
            Command::Close => self.close().await,
            Command::SetFrameCheck(enabled) => {
                self.frame_check = enabled;
                self.control(WorkerControl::SetFrameCheck(enabled));
            }
            Command::SetStartMarker(marker) => {
                self.start_marker = marker.clone();
                self.control(WorkerControl::SetStartMarker(marker));
            }
            Command::Shutdown => {}
        }
    }

    fn current_state(&self) -> LinkState {
        *self.state.borrow()
    }

    fn set_state(&self, state: LinkState) {
        self.state.send_replace(state);
        tlog!("[session] Link {}", state);
        emit(&self.events, ScopeEvent::state_changed(state));
    }

    fn control(&self, request: WorkerControl) {
        if let Some(worker) = &self.worker {
            // A worker that already exited is reaped by the run loop
            let _ = worker.control.send(request);
        }
    }

    fn clear_slot(&self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    async fn open(&mut self, config: LinkConfig) {
        let state = self.current_state();
        if state != LinkState::Closed {
            tlog!("[session] Open of {} ignored, link is {}", config.port, state);
            return;
        }

        self.set_state(LinkState::Opening);
        tlog!("[session] Opening {} ({})", config.port, config.summary());

        let opener = self.opener.clone();
        let open_config = config.clone();
        let opened = tokio::task::spawn_blocking(move || opener.open(&open_config))
            .await
            .unwrap_or_else(|e| {
                Err(LinkError::Open {
                    port: config.port.clone(),
                    reason: format!("open task failed: {}", e),
                })
            });

        match opened {
            Ok(source) => {
                self.start_worker(source, &config);
                self.set_state(LinkState::Open);
            }
            Err(e) => {
                tlog!("[session] {}", e);
                emit(&self.events, ScopeEvent::link_error(&e));
                self.set_state(LinkState::Closed);
            }
        }
    }

    fn start_worker(&mut self, source: Box<dyn ByteSource>, config: &LinkConfig) {
        let session = &self.settings.session;
        let (transmit_tx, transmit_rx) = std_mpsc::sync_channel(session.transmit_queue.max(1));
        let (control_tx, control_rx) = std_mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));

        let mut framing = self.settings.framing.clone();
        framing.set_start_marker(self.start_marker.clone());
        let mut decoder = SampleDecoder::new(&self.settings.decoder);
        decoder.set_frame_check(self.frame_check);

        // New link session: fresh channel generation, chart clears on next tick
        self.samples.reopen();
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(transmit_tx);

        let ctx = ReceiverContext {
            port_name: config.port.clone(),
            framing,
            decoder,
            samples: self.samples.clone(),
            events: self.events.clone(),
            cancel: cancel.clone(),
            control_rx,
            transmit_rx,
            bytes_event_interval: Duration::from_millis(session.bytes_event_interval_ms),
        };
        let handle = tokio::task::spawn_blocking(move || run_receive_loop(source, ctx));

        self.worker = Some(Worker {
            port: config.port.clone(),
            cancel,
            control: control_tx,
            handle,
        });
    }

    async fn close(&mut self) {
        let Some(worker) = self.worker.take() else {
            tlog!("[session] Close ignored, link is {}", self.current_state());
            return;
        };

        self.set_state(LinkState::Closing);
        self.clear_slot();
        worker.cancel.store(true, Ordering::Relaxed);
        let exit = exit_from(worker.handle.await);
        self.finish_close(&worker.port, exit).await;
    }

    /// Report a failure, wait (bounded) for the chart to drain, then Closed.
    async fn finish_close(&mut self, port: &str, exit: ReceiverExit) {
        if let ReceiverExit::Failed(e) = &exit {
            tlog!("[session] {} failed: {}", port, e);
            emit(&self.events, ScopeEvent::link_error(e));
        }

        // Already sealed by the worker unless it panicked
        self.samples.close();

        let timeout = Duration::from_millis(self.settings.session.close_drain_timeout_ms);
        if !self.samples.wait_drained(timeout).await {
            tlog!(
                "[session] Chart did not drain within {} ms, closing anyway",
                timeout.as_millis()
            );
        }
        self.set_state(LinkState::Closed);
    }
}

fn exit_from(result: Result<ReceiverExit, JoinError>) -> ReceiverExit {
    result.unwrap_or_else(|e| ReceiverExit::Failed(LinkError::Io(format!("receiver task failed: {}", e))))
}
