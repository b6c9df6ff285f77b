// tools/scope_cli/main.rs
//
// Terminal front end for uartscope. Translates keys and mouse movement into
// session commands and renders the chart model with ratatui. Holds no
// pipeline state of its own.
//
// Keys: F2 open/close, F3 frame check, Enter send, Esc clear, F10/Ctrl-C quit.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use crossterm::{
    event::{
        self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
        KeyModifiers, MouseEventKind,
    },
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{prelude::*, widgets::*};
use tokio::runtime::Runtime;

use uartscope::settings::{default_settings_path, load_settings};
use uartscope::{
    logging, tlog, ChartUpdater, EventReceiver, HoverPoint, LinkConfig, LinkOpener, LinkState,
    MockLink, ScopeEvent, ScopeSession, ScopeSettings,
};

const TICK: Duration = Duration::from_millis(50);
const PALETTE: [Color; 8] = [
    Color::Cyan,
    Color::Yellow,
    Color::Magenta,
    Color::Green,
    Color::Red,
    Color::Blue,
    Color::LightCyan,
    Color::LightYellow,
];

#[derive(Parser, Debug)]
#[command(name = "scope_cli", about = "Live chart of numeric data framed on a serial port")]
struct Cli {
    /// Serial port, e.g. /dev/ttyUSB0 or COM3 (overrides the settings file)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate (overrides the settings file)
    #[arg(short, long)]
    baud: Option<u32>,

    /// Settings file (default: <config dir>/uartscope/settings.toml)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Use a simulated device that streams sine waves
    #[arg(long)]
    demo: bool,

    /// Print events as JSON lines instead of drawing the terminal UI
    #[arg(long)]
    events: bool,

    /// Also write log lines to a timestamped file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match cli.settings.clone().or_else(default_settings_path) {
        Some(path) => load_settings(&path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => ScopeSettings::default(),
    };
    if let Some(port) = cli.port.clone() {
        settings.link.port = port;
    }
    if let Some(baud) = cli.baud {
        settings.link.baud_rate = baud;
    }
    if cli.demo && settings.link.port.is_empty() {
        settings.link.port = "demo".to_string();
    }

    if let Some(dir) = &cli.log_dir {
        logging::init_file_logging(dir)
            .with_context(|| format!("starting file logging in {}", dir.display()))?;
    }

    let rt = Runtime::new().context("starting tokio runtime")?;
    let _guard = rt.enter();

    let demo_check = Arc::new(AtomicBool::new(settings.decoder.frame_check_enabled));
    let opener: Arc<dyn LinkOpener> = if cli.demo {
        let link = MockLink::new();
        link.set_loopback(true);
        spawn_demo(link.clone(), &settings, demo_check.clone());
        Arc::new(link)
    } else {
        serial_opener()?
    };

    let config = settings.link.clone();
    let (session, chart, events) = ScopeSession::start(opener, settings)?;

    let result = if cli.events {
        run_events(&rt, session, chart, events, config)
    } else {
        run_tui(&rt, session, chart, events, config, demo_check)
    };
    logging::stop_file_logging();
    result
}

#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
fn serial_opener() -> anyhow::Result<Arc<dyn LinkOpener>> {
    Ok(Arc::new(uartscope::SerialPortOpener))
}

#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
fn serial_opener() -> anyhow::Result<Arc<dyn LinkOpener>> {
    anyhow::bail!("serial ports are not supported on this platform; use --demo")
}

/// Feed framed text samples into the mock link while it is open.
fn spawn_demo(link: MockLink, settings: &ScopeSettings, checked: Arc<AtomicBool>) {
    let encoding = settings.framing.clone();
    let frame_check = settings.decoder.frame_check;
    std::thread::spawn(move || {
        let mut t = 0.0f64;
        loop {
            std::thread::sleep(Duration::from_millis(20));
            if !link.is_open() {
                continue;
            }
            t += 0.05;
            let text = format!(
                "{:.3},{:.3},{:.3}",
                10.0 * t.sin(),
                5.0 * (0.7 * t).cos(),
                8.0 * (3.0 * t).sin() * (0.1 * t).cos()
            );
            let body = if checked.load(Ordering::Relaxed) {
                frame_check.append_trailer(text.as_bytes())
            } else {
                text.into_bytes()
            };
            // Only unstuffed framing can refuse a body
            if let Ok(wire) = encoding.encode(&body) {
                link.feed(&wire);
            }
        }
    });
}

// ============================================================================
// JSON event mode
// ============================================================================

fn run_events(
    rt: &Runtime,
    session: ScopeSession,
    mut chart: ChartUpdater,
    mut events: EventReceiver,
    config: LinkConfig,
) -> anyhow::Result<()> {
    rt.block_on(async move {
        session.open(config)?;
        let mut tick = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    println!("{}", serde_json::to_string(&event)?);
                    if matches!(event, ScopeEvent::LinkStateChanged { state: LinkState::Closed, .. }) {
                        break;
                    }
                }
                _ = tick.tick() => {
                    for event in chart.tick() {
                        println!("{}", serde_json::to_string(&event)?);
                    }
                }
            }
        }
        session.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
}

// ============================================================================
// Terminal UI
// ============================================================================

struct App {
    session: ScopeSession,
    chart: ChartUpdater,
    events: EventReceiver,
    config: LinkConfig,
    input: String,
    frame_check: bool,
    demo_check: Arc<AtomicBool>,
    state: LinkState,
    bytes: u64,
    status: String,
    hover: Option<HoverPoint>,
    chart_areas: Vec<Rect>,
}

impl App {
    fn poll_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                ScopeEvent::LinkStateChanged { state, .. } => {
                    self.state = state;
                    if state == LinkState::Open {
                        self.bytes = 0;
                    }
                }
                ScopeEvent::BytesReceived { total } => self.bytes = total,
                ScopeEvent::LinkError { message, .. } => self.status = message,
                ScopeEvent::TransmitFailed { message } => {
                    self.status = format!("Send failed: {}", message)
                }
                ScopeEvent::Transmitted { bytes } => self.status = format!("Sent {} bytes", bytes),
                ScopeEvent::DecodeError { reason, .. } => {
                    self.status = format!("Decode error: {}", reason)
                }
                ScopeEvent::ChecksumMismatch {
                    expected, actual, ..
                } => {
                    self.status = format!(
                        "Checksum mismatch: expected {:04X}, got {:04X}",
                        expected, actual
                    )
                }
                ScopeEvent::FrameDesync { .. }
                | ScopeEvent::SeriesUpdated { .. }
                | ScopeEvent::ProcessingComplete => {}
            }
        }
        for event in self.chart.tick() {
            if event == ScopeEvent::ProcessingComplete {
                self.status = "Link closed, all samples charted".to_string();
            }
        }
    }

    /// Returns true when the user asked to quit.
    fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.kind != KeyEventKind::Press {
            return false;
        }
        let result = match key.code {
            KeyCode::F(10) => return true,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => return true,
            KeyCode::F(2) => match self.state {
                LinkState::Closed => self.session.open(self.config.clone()),
                _ => self.session.close(),
            },
            KeyCode::F(3) => {
                self.frame_check = !self.frame_check;
                self.demo_check.store(self.frame_check, Ordering::Relaxed);
                self.session.set_frame_check(self.frame_check)
            }
            KeyCode::Enter => match self.session.send_message(self.input.clone()) {
                Ok(_) => Ok(()),
                Err(e) => {
                    self.status = e.to_string();
                    Ok(())
                }
            },
            KeyCode::Esc => {
                self.input.clear();
                self.session.clear_send_buffer();
                Ok(())
            }
            KeyCode::Backspace => {
                self.input.pop();
                Ok(())
            }
            KeyCode::Char(c) => {
                self.input.push(c);
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            self.status = e.to_string();
        }
        false
    }

    /// Map a terminal cell to chart coordinates and look up the nearest point.
    fn hover_at(&mut self, column: u16, row: u16) {
        self.hover = None;
        for (index, area) in self.chart_areas.iter().enumerate() {
            let inner = area.inner(Margin::new(1, 1));
            if inner.width == 0 || inner.height == 0 || !inner.contains(Position::new(column, row)) {
                continue;
            }
            let Some(view) = self.chart.charts().get(index) else {
                continue;
            };
            let fx = f64::from(column - inner.x) / f64::from(inner.width);
            let fy = 1.0 - f64::from(row - inner.y) / f64::from(inner.height);
            let x = view.x_range.min + fx * view.x_range.span();
            let y = view.y_range.min + fy * view.y_range.span();
            self.hover = self.chart.hover(index, (x, y));
        }
    }
}

fn run_tui(
    rt: &Runtime,
    session: ScopeSession,
    chart: ChartUpdater,
    events: EventReceiver,
    config: LinkConfig,
    demo_check: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    // The terminal belongs to the UI now
    logging::set_console_logging(false);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let mut app = App {
        frame_check: demo_check.load(Ordering::Relaxed),
        session,
        chart,
        events,
        config,
        input: String::new(),
        demo_check,
        state: LinkState::Closed,
        bytes: 0,
        status: "F2 open/close  F3 frame check  Enter send  Esc clear  F10 quit".to_string(),
        hover: None,
        chart_areas: Vec::new(),
    };

    let result = ui_loop(&mut terminal, &mut app);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;
    logging::set_console_logging(true);

    rt.block_on(app.session.shutdown());
    tlog!("[scope_cli] Exited");
    result
}

fn ui_loop<B: Backend>(terminal: &mut Terminal<B>, app: &mut App) -> anyhow::Result<()> {
    loop {
        app.poll_events();
        terminal.draw(|f| draw(f, app))?;

        if event::poll(TICK)? {
            match event::read()? {
                Event::Key(key) => {
                    if app.handle_key(key) {
                        return Ok(());
                    }
                }
                Event::Mouse(mouse) if mouse.kind == MouseEventKind::Moved => {
                    app.hover_at(mouse.column, mouse.row)
                }
                _ => {}
            }
        }
    }
}

fn draw(f: &mut Frame, app: &mut App) {
    let [charts_area, status_area, hover_area, input_area] = Layout::vertical([
        Constraint::Min(6),
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Length(3),
    ])
    .areas(f.area());

    let views = app.chart.charts().to_vec();
    let count = views.len().max(1) as u32;
    let areas = Layout::vertical(vec![Constraint::Ratio(1, count); views.len().max(1)])
        .split(charts_area);
    app.chart_areas = areas.iter().copied().take(views.len()).collect();

    for (index, view) in views.iter().enumerate() {
        let data: Vec<(usize, Vec<(f64, f64)>)> = view
            .channels
            .iter()
            .filter_map(|&c| {
                app.chart
                    .series(c)
                    .map(|s| (c, s.points().iter().copied().collect()))
            })
            .collect();

        let datasets: Vec<Dataset> = data
            .iter()
            .map(|(channel, points)| {
                Dataset::default()
                    .name(format!("ch{}", channel))
                    .marker(symbols::Marker::Braille)
                    .graph_type(GraphType::Line)
                    .style(Style::default().fg(PALETTE[channel % PALETTE.len()]))
                    .data(points)
            })
            .collect();

        let x = view.x_range;
        let y = view.y_range;
        let widget = Chart::new(datasets)
            .block(Block::bordered().title(format!(" Chart {} ", index + 1)))
            .x_axis(
                Axis::default()
                    .bounds([x.min, x.max])
                    .labels([format!("{:.1}", x.min), format!("{:.1}", x.max)]),
            )
            .y_axis(
                Axis::default()
                    .bounds([y.min, y.max])
                    .labels([format!("{:.2}", y.min), format!("{:.2}", y.max)]),
            );
        f.render_widget(widget, areas[index]);
    }

    let state_style = match app.state {
        LinkState::Open => Style::default().fg(Color::Green),
        LinkState::Closed => Style::default().fg(Color::Red),
        _ => Style::default().fg(Color::Yellow),
    };
    let status = Line::from(vec![
        Span::styled(format!(" {} ", app.state), state_style.add_modifier(Modifier::BOLD)),
        Span::raw(format!(
            "{} {} | rx {} bytes | check {} | dropped {} | {}",
            app.config.port,
            app.config.summary(),
            app.bytes,
            if app.frame_check { "on" } else { "off" },
            app.chart.dropped(),
            app.status
        )),
    ]);
    f.render_widget(Paragraph::new(status), status_area);

    let hover = match app.hover {
        Some(p) => format!(" ch{}  x = {:.3}  y = {:.3}", p.channel, p.x, p.y),
        None => String::new(),
    };
    f.render_widget(Paragraph::new(hover).fg(Color::Gray), hover_area);

    let input = Paragraph::new(app.input.as_str())
        .block(Block::bordered().title(" Send (Enter to send, Esc to clear) "));
    f.render_widget(input, input_area);
}
