//! Terminal user interface.
//!
//! The main loop draws, then waits for whichever comes first: a terminal
//! event (polled on a blocking thread) or the outcome of a spawned job.

pub mod app;
pub mod controller;
mod events;
pub mod headless;
mod ui;
pub mod widgets;

pub use app::App;
pub use controller::{Controller, JobMessage};
pub use events::{Event, EventHandler};

use crate::error::{GuardError, Result};
use crossterm::{
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::io::{self, Stdout};
use std::panic;
use tracing::{info, warn};

enum Step {
    Terminal(Event),
    Job(JobMessage),
    Closed,
}

/// The interactive terminal.
pub struct Tui {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    event_handler: EventHandler,
}

impl Tui {
    /// Switches the terminal to raw mode and the alternate screen.
    pub fn new() -> Result<Self> {
        Ok(Self {
            terminal: Self::setup_terminal()?,
            event_handler: EventHandler::new(),
        })
    }

    fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
        enable_raw_mode()
            .map_err(|e| GuardError::internal(format!("Failed to enable raw mode: {e}")))?;

        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)
            .map_err(|e| GuardError::internal(format!("Failed to enter alternate screen: {e}")))?;

        Terminal::new(CrosstermBackend::new(stdout))
            .map_err(|e| GuardError::internal(format!("Failed to create terminal: {e}")))
    }

    fn restore_terminal(&mut self) -> Result<()> {
        disable_raw_mode()
            .map_err(|e| GuardError::internal(format!("Failed to disable raw mode: {e}")))?;
        execute!(self.terminal.backend_mut(), LeaveAlternateScreen)
            .map_err(|e| GuardError::internal(format!("Failed to leave alternate screen: {e}")))?;
        self.terminal
            .show_cursor()
            .map_err(|e| GuardError::internal(format!("Failed to show cursor: {e}")))?;
        Ok(())
    }

    /// Runs until the operator quits.
    pub async fn run(&mut self, controller: &mut Controller) -> Result<()> {
        let original_hook = panic::take_hook();
        panic::set_hook(Box::new(move |panic_info| {
            let _ = disable_raw_mode();
            let _ = execute!(io::stdout(), LeaveAlternateScreen);
            original_hook(panic_info);
        }));

        let result = self.event_loop(controller).await;

        let _ = panic::take_hook();
        result
    }

    async fn event_loop(&mut self, controller: &mut Controller) -> Result<()> {
        loop {
            self.terminal
                .draw(|frame| ui::render(frame, &controller.app, controller.session()))
                .map_err(|e| GuardError::internal(format!("Failed to draw: {e}")))?;

            if !controller.is_running() {
                break;
            }

            let handler = self.event_handler;
            let step = tokio::select! {
                polled = tokio::task::spawn_blocking(move || handler.next()) => match polled {
                    Ok(event) => Step::Terminal(event?),
                    Err(e) => return Err(GuardError::internal(format!("Event thread failed: {e}"))),
                },
                message = controller.recv() => match message {
                    Some(message) => Step::Job(message),
                    None => Step::Closed,
                },
            };

            match step {
                Step::Terminal(Event::Key(key)) => controller.handle_key(key).await,
                Step::Terminal(Event::Resize(..)) => {}
                Step::Terminal(Event::Tick) => controller.tick(),
                Step::Job(message) => controller.handle_message(message).await,
                Step::Closed => {
                    warn!("Job channel closed");
                    break;
                }
            }
        }
        Ok(())
    }
}

impl Drop for Tui {
    fn drop(&mut self) {
        let _ = self.restore_terminal();
    }
}

/// Runs the interactive terminal over `controller`.
pub async fn run(mut controller: Controller) -> Result<()> {
    let mut tui = Tui::new()?;
    info!("Interactive session started");
    tui.run(&mut controller).await
}
