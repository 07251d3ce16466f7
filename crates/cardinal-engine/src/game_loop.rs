//! Running an [`Engine`] on its own thread.
//!
//! [`GameLoop::start`] ticks whenever the caller sends on `tick_start` and
//! reports each finished tick on `tick_done`, so tests and external
//! schedulers can drive ticks deterministically. [`GameLoop::with_interval`]
//! drives the same loop from a [`crossbeam_channel::tick`] timer. Either way
//! the loop thread selects over its tick source and a stop channel.
//!
//! Transactions are submitted through the engine's
//! [`TxPool`](crate::pool::TxPool) handle, taken before the engine is moved
//! into the loop.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{never, select, Receiver, Sender};

use crate::tick::Engine;
use crate::EngineError;

/// Handle to a running game loop.
pub struct GameLoop {
    stop: Sender<()>,
    handle: Option<JoinHandle<Result<Engine, EngineError>>>,
}

impl GameLoop {
    /// Tick once per message on `tick_start`. The number of each finished
    /// tick is sent on `tick_done`.
    ///
    /// Starts the engine first if needed.
    pub fn start(
        engine: Engine,
        tick_start: Receiver<()>,
        tick_done: Sender<u64>,
    ) -> Result<Self, EngineError> {
        Self::spawn(engine, tick_start, Some(tick_done))
    }

    /// Tick every `config().tick_interval`.
    pub fn with_interval(engine: Engine) -> Result<Self, EngineError> {
        let ticker = crossbeam_channel::tick(engine.config().tick_interval);
        Self::spawn(engine, ticker, None)
    }

    fn spawn<T: Send + 'static>(
        mut engine: Engine,
        ticks: Receiver<T>,
        tick_done: Option<Sender<u64>>,
    ) -> Result<Self, EngineError> {
        if !engine.is_started() {
            engine.start()?;
        }
        let (stop, stop_rx) = crossbeam_channel::bounded(1);

        let handle = thread::Builder::new()
            .name("cardinal-game-loop".into())
            .spawn(move || run(engine, ticks, stop_rx, tick_done))
            .map_err(|err| EngineError::GameLoop(format!("failed to spawn game loop: {err}")))?;

        tracing::info!("game loop started");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Whether the loop thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop, run one last tick if transactions are pending, and hand
    /// the engine back.
    ///
    /// Returns the error that ended the loop if a tick failed.
    pub fn shutdown(mut self) -> Result<Engine, EngineError> {
        tracing::info!("shutting down game loop");
        // Full or disconnected both mean the loop is already on its way out.
        let _ = self.stop.try_send(());
        let handle = self
            .handle
            .take()
            .ok_or_else(|| EngineError::GameLoop("game loop already joined".into()))?;
        let engine = handle
            .join()
            .map_err(|_| EngineError::GameLoop("game loop thread panicked".into()))??;
        tracing::info!(tick = engine.current_tick(), "game loop stopped");
        Ok(engine)
    }
}

impl Drop for GameLoop {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.stop.try_send(());
        }
    }
}

fn run<T>(
    mut engine: Engine,
    mut ticks: Receiver<T>,
    stop: Receiver<()>,
    tick_done: Option<Sender<u64>>,
) -> Result<Engine, EngineError> {
    let report = |tick: u64| {
        if let Some(done) = &tick_done {
            // Nobody listening is fine.
            let _ = done.send(tick);
        }
    };

    loop {
        let mut source_closed = false;
        select! {
            recv(ticks) -> signal => match signal {
                Ok(_) => {
                    let tick = engine.tick()?.tick;
                    report(tick);
                }
                Err(_) => source_closed = true,
            },
            recv(stop) -> _ => break,
        }
        if source_closed {
            // Only the stop signal is left to wait for.
            tracing::debug!("tick source closed");
            ticks = never();
        }
    }

    if engine.pool().count_pending() > 0 {
        let tick = engine.tick()?.tick;
        report(tick);
    }
    engine.shutdown()?;
    Ok(engine)
}
