use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Notify, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;

use crate::error::{FrontierError, Result};
use crate::frontier::WorkQueueFrontier;

/// Crawl-wide state driven by the manager task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// No dispatch; in-flight work drains.
    Pause,
    Run,
    /// Running with nothing queued.
    Empty,
    /// Like `Pause`, held while an operator works on the frontier.
    Hold,
    /// Terminal. No dispatch; reached once in-flight work has drained.
    Finish,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Pause => "PAUSE",
            State::Run => "RUN",
            State::Empty => "EMPTY",
            State::Hold => "HOLD",
            State::Finish => "FINISH",
        };
        write!(f, "{}", name)
    }
}

impl State {
    /// State reached from `self` on the way to `target`. Stopping states are
    /// only reached once nothing is in process.
    pub fn transition(self, target: State, empty: bool, in_process: usize) -> State {
        if self == State::Finish {
            return State::Finish;
        }
        match target {
            State::Run | State::Empty => {
                if empty {
                    State::Empty
                } else {
                    State::Run
                }
            }
            State::Pause | State::Hold | State::Finish => {
                if in_process == 0 {
                    target
                } else {
                    self
                }
            }
        }
    }

    fn blocks_dispatch(&self) -> bool {
        matches!(self, State::Pause | State::Hold | State::Finish)
    }
}

/// Requested and reached state, plus the gate workers pass through to get
/// work. The manager holds the gate's write side while dispatch is blocked.
pub(crate) struct Control {
    target: Mutex<State>,
    reached: watch::Sender<State>,
    notify: Notify,
    pub(crate) outbound: Arc<RwLock<()>>,
    /// Write guard taken at construction, so nothing is dispatched before
    /// the manager runs.
    gate: Mutex<Option<OwnedRwLockWriteGuard<()>>>,
    started: AtomicBool,
}

impl Control {
    pub fn new() -> Self {
        let outbound = Arc::new(RwLock::new(()));
        let gate = outbound.clone().try_write_owned().ok();
        let (reached, _) = watch::channel(State::Pause);
        Self {
            target: Mutex::new(State::Pause),
            reached,
            notify: Notify::new(),
            outbound,
            gate: Mutex::new(gate),
            started: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> State {
        *self.target.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn reached(&self) -> State {
        *self.reached.borrow()
    }

    fn take_gate(&self) -> Option<OwnedRwLockWriteGuard<()>> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl WorkQueueFrontier {
    /// Spawn the manager task. With `handle_interrupt` set, Ctrl-C requests
    /// [`State::Finish`].
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        if self.control.started.swap(true, Ordering::SeqCst) {
            return Err(FrontierError::config("frontier manager already started"));
        }
        if self.config.handle_interrupt {
            let frontier: Weak<Self> = Arc::downgrade(self);
            ctrlc::set_handler(move || {
                if let Some(frontier) = frontier.upgrade() {
                    log::info!("interrupted, finishing crawl");
                    frontier.request_state(State::Finish);
                }
            })
            .map_err(|e| FrontierError::Interrupt(e.to_string()))?;
        }
        let gate = self.control.take_gate();
        let frontier = Arc::clone(self);
        Ok(tokio::spawn(async move {
            frontier.manager_loop(gate).await;
        }))
    }

    async fn manager_loop(self: Arc<Self>, mut gate: Option<OwnedRwLockWriteGuard<()>>) {
        let report_interval = Duration::from_secs(self.config.report_interval_secs);
        let mut last_report = Instant::now();

        'run: loop {
            let target = self.control.target();
            if target.blocks_dispatch() {
                if gate.is_none() {
                    gate = Some(self.control.outbound.clone().write_owned().await);
                }
            } else {
                gate = None;
            }

            match self.manager_step(target) {
                Ok(State::Finish) => {
                    if let Err(e) = self.flush() {
                        log::error!("final flush failed: {}", e);
                    }
                    break 'run;
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("frontier manager error: {}", e);
                    if !matches!(self.control.target(), State::Pause | State::Finish) {
                        self.request_state(State::Pause);
                    }
                }
            }

            if last_report.elapsed() >= report_interval {
                log::info!("{}", self.single_line_report());
                last_report = Instant::now();
            }

            let sleep = tokio::time::sleep(Duration::from_secs(1));
            tokio::pin!(sleep);

            tokio::select! {
                _ = self.control.notify.notified() => {}
                _ = &mut sleep => {}
            }
        }
        drop(gate);
        log::info!("frontier manager finished");
    }

    fn manager_step(&self, target: State) -> Result<State> {
        if !target.blocks_dispatch() {
            self.wake_due()?;
        }
        let empty = self.is_empty();
        if empty && target == State::Run {
            self.uniq.request_flush()?;
        }
        let reached = self.control.reached();
        let next = reached.transition(target, empty, self.in_process_count());
        if next != reached {
            log::info!("frontier {} -> {}", reached, next);
            self.control.reached.send_replace(next);
        }
        Ok(next)
    }

    /// Ask the manager to move to `state`. Ignored once FINISH was
    /// requested.
    pub fn request_state(&self, state: State) {
        let state = if state == State::Empty { State::Run } else { state };
        {
            let mut target = self.control.target.lock().unwrap_or_else(|e| e.into_inner());
            if *target == State::Finish {
                return;
            }
            *target = state;
        }
        log::info!("frontier requested {}", state);
        self.control.notify.notify_one();
    }

    /// State the manager last reached.
    pub fn state(&self) -> State {
        self.control.reached()
    }

    pub async fn wait_for_state(&self, state: State) {
        let mut rx = self.control.reached.subscribe();
        loop {
            if *rx.borrow() == state {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn pause(&self) {
        self.request_state(State::Pause);
    }

    pub fn unpause(&self) {
        self.request_state(State::Run);
    }

    pub fn terminate(&self) {
        self.request_state(State::Finish);
    }

    pub fn is_running(&self) -> bool {
        matches!(self.control.reached(), State::Run | State::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        assert_eq!(State::Pause.transition(State::Run, false, 0), State::Run);
        assert_eq!(State::Run.transition(State::Run, true, 3), State::Empty);
        assert_eq!(State::Empty.transition(State::Run, false, 0), State::Run);
        assert_eq!(State::Run.transition(State::Pause, false, 2), State::Run);
        assert_eq!(State::Run.transition(State::Pause, false, 0), State::Pause);
        assert_eq!(State::Run.transition(State::Finish, true, 1), State::Run);
        assert_eq!(State::Run.transition(State::Finish, true, 0), State::Finish);
        assert_eq!(State::Finish.transition(State::Run, false, 0), State::Finish);
    }

    #[test]
    fn gate_is_held_until_the_manager_runs() {
        let control = Control::new();
        assert!(control.outbound.try_read().is_err());
        drop(control.take_gate());
        assert!(control.outbound.try_read().is_ok());
        assert_eq!(control.reached(), State::Pause);
    }
}
