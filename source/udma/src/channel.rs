//! A single DMA direction, exposed as a blocking byte-stream channel.
//!
//! Each [`Channel`] runs at most one transfer at a time. Callers are
//! serialized by an async *gate*; the channel's [`State`] is guarded by an
//! interrupt-safe lock, which is the only thing the DMA engine's completion
//! callback ever touches. The gate is always acquired before the state lock,
//! never the other way around.
use alloc::sync::Arc;
use core::{cell::RefCell, fmt, future::Future};

use futures::FutureExt;
use heapless::String;
use maitake::{
    sync::{Mutex, WaitQueue},
    time::Timer,
};
use portable_atomic::{AtomicBool, Ordering};

use crate::{
    mm::UserBuf,
    platform::{Callback, Complete, Engine, Platform, PrepFlags},
    signal::Signals,
    stats::Stats,
    transfer::{InFlightTransfer, Stage},
    Direction, Error, UdmaSettings,
};

/// The maximum number of bytes kept from a channel's configured name.
pub const MAX_NAME_LEN: usize = 15;

/// The state of a [`Channel`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    /// No transfer is in flight.
    Idle,
    /// A transfer was submitted and the hardware is running it.
    InFlight,
    /// The hardware finished, but the caller has not yet unwound the transfer.
    Completing,
}

/// A DMA channel for one direction.
pub struct Channel<P: Platform> {
    name: String<MAX_NAME_LEN>,
    direction: Direction,
    platform: Arc<P>,
    engine: P::Engine,
    timer: &'static Timer,
    settings: UdmaSettings,

    /// Cleared to stop new transfers from starting.
    accepting: AtomicBool,
    /// Set while `engine` is held; cleared when it is released.
    init_done: AtomicBool,

    /// Serializes callers.
    gate: Mutex<()>,
    state: critical_section::Mutex<RefCell<Fsm<P>>>,
    /// Woken by the completion callback.
    xfer_done: WaitQueue,
    /// Woken whenever a transfer is unwound.
    idle: WaitQueue,

    stats: Stats,
}

/// A point-in-time view of a [`Channel`], for diagnostics.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChannelSnapshot {
    pub name: String<MAX_NAME_LEN>,
    pub direction: Direction,
    pub state: State,
    pub accepting: bool,
    pub initialized: bool,
    /// How far the current transfer got, if there is one.
    pub stage: Option<Stage>,
    pub packets_sent: u64,
    pub packets_received: u64,
}

struct Fsm<P: Platform> {
    state: State,
    inflight: Option<InFlightTransfer<P>>,
}

// === impl State ===

impl State {
    fn can_transition_to(self, next: State) -> bool {
        matches!(
            (self, next),
            (State::Idle, State::InFlight)
                | (State::InFlight, State::Completing)
                | (State::InFlight, State::Idle)
                | (State::Completing, State::Idle)
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Idle => "idle",
            State::InFlight => "in flight",
            State::Completing => "completing",
        })
    }
}

// === impl Fsm ===

impl<P: Platform> Fsm<P> {
    fn transition(&mut self, next: State) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal channel state transition {} -> {next}",
            self.state,
        );
        tracing::trace!(from = %self.state, to = %next, "state transition");
        self.state = next;
    }
}

// === impl Channel ===

impl<P: Platform> Channel<P> {
    /// Returns a new channel driving `engine`, ready to accept transfers.
    ///
    /// `name` is truncated to [`MAX_NAME_LEN`] bytes.
    pub fn new(
        name: &str,
        direction: Direction,
        platform: Arc<P>,
        engine: P::Engine,
        settings: UdmaSettings,
        timer: &'static Timer,
    ) -> Arc<Self> {
        let chan = Arc::new(Self {
            name: truncate_name(name),
            direction,
            platform,
            engine,
            timer,
            settings,
            accepting: AtomicBool::new(true),
            init_done: AtomicBool::new(true),
            gate: Mutex::new(()),
            state: critical_section::Mutex::new(RefCell::new(Fsm {
                state: State::Idle,
                inflight: None,
            })),
            xfer_done: WaitQueue::new(),
            idle: WaitQueue::new(),
            stats: Stats::new(),
        });
        tracing::info!(channel = %chan.name, "{} ({}) available", chan.name, direction);
        chan
    }

    /// Transfers the whole of `buf` in this channel's direction, waiting
    /// until the hardware has finished with it.
    ///
    /// Returns the number of bytes transferred, which is always `buf.len()`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `buf` is empty or not a multiple of the
    ///   configured alignment.
    /// - [`Error::ChannelClosed`] if the channel is not accepting transfers.
    /// - [`Error::RestartSignal`] if a signal was raised on `signals` while
    ///   waiting. If the hardware was already running, it is terminated.
    /// - [`Error::StallFault`] if the channel could not be reacquired after
    ///   the transfer finished, or if `gate_timeout` is longer than the timer
    ///   can measure. The channel is unusable after this.
    /// - Any error from preparing or submitting the transfer, after
    ///   everything acquired for it has been released.
    #[tracing::instrument(
        level = tracing::Level::DEBUG,
        name = "Channel::transfer",
        skip(self, signals),
        fields(channel = %self.name, dir = %self.direction),
    )]
    pub async fn transfer(
        self: &Arc<Self>,
        buf: UserBuf,
        signals: &Signals,
    ) -> Result<usize, Error> {
        self.settings.check_count(buf.len())?;

        let gate = loop {
            let gate = interruptible(signals, self.gate.lock()).await?;

            if !self.accepting.load(Ordering::Acquire) {
                tracing::debug!("channel is not accepting transfers");
                return Err(Error::ChannelClosed);
            }

            if self.is_idle() {
                break gate;
            }

            // another caller's transfer is still in flight, and that caller
            // needs the gate back to unwind it.
            drop(gate);
            tracing::trace!("channel busy, waiting for it to go idle");
            interruptible(signals, wait_until(&self.idle, || self.is_idle())).await?;
        };

        let prepared = self.prepare(buf);
        drop(gate);
        prepared?;

        let waited = interruptible(
            signals,
            wait_until(&self.xfer_done, || !self.is_in_flight()),
        )
        .await;

        let reacquire = match self
            .timer
            .try_timeout(self.settings.gate_timeout, self.gate.lock())
        {
            Ok(reacquire) => reacquire,
            Err(error) => {
                tracing::error!(
                    channel = %self.name,
                    timeout = ?self.settings.gate_timeout,
                    ?error,
                    "cannot bound the channel reacquire, transfer left in flight"
                );
                return Err(Error::StallFault);
            }
        };
        let Ok(gate) = reacquire.await else {
            tracing::error!(
                channel = %self.name,
                timeout = ?self.settings.gate_timeout,
                "timed out reacquiring channel, transfer left in flight"
            );
            return Err(Error::StallFault);
        };

        let res = self.with_state(|fsm| {
            let mut res = Ok(buf.len());
            if fsm.state == State::InFlight {
                tracing::debug!(?waited, "interrupted while in flight, terminating");
                if self.init_done.load(Ordering::Acquire) {
                    self.engine.terminate_all();
                }
                res = Err(Error::RestartSignal);
            }
            self.unwind(fsm);
            res
        });

        drop(gate);
        self.idle.wake_all();

        if res.is_ok() {
            match self.direction {
                Direction::HostToDevice => self.stats.sent(),
                Direction::DeviceToHost => self.stats.received(),
            }
        }
        res
    }

    /// Stops accepting new transfers, then terminates any work pending on
    /// the engine and releases it. Only the first call does anything.
    ///
    /// A caller blocked waiting for a transfer stays blocked until it is
    /// signalled.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        if self.init_done.swap(false, Ordering::AcqRel) {
            self.engine.terminate_all();
            self.engine.release();
            tracing::info!(channel = %self.name, "released DMA channel");
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns `true` until the channel has been shut down.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.init_done.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    #[must_use]
    pub fn snapshot(&self) -> ChannelSnapshot {
        let (state, stage) = self.with_state(|fsm| {
            let stage = fsm.inflight.as_ref().map(InFlightTransfer::stage);
            (fsm.state, stage)
        });
        ChannelSnapshot {
            name: self.name.clone(),
            direction: self.direction,
            state,
            accepting: self.accepting.load(Ordering::Acquire),
            initialized: self.is_initialized(),
            stage,
            packets_sent: self.stats.packets_sent(),
            packets_received: self.stats.packets_received(),
        }
    }

    /// Builds, maps and submits a transfer of `buf`. Must be called with the
    /// gate held.
    fn prepare(self: &Arc<Self>, buf: UserBuf) -> Result<(), Error> {
        let platform = &*self.platform;
        let mut xfer = InFlightTransfer::new(buf, self.direction)?;

        if let Err(error) = xfer.prepare(platform) {
            tracing::warn!(%error, stage = ?xfer.stage(), "failed to prepare transfer");
            self.with_state(|_| xfer.unwind(platform));
            return Err(error);
        }

        let flags = PrepFlags::new().with(PrepFlags::INTERRUPT, true);
        let tx = xfer.segments().and_then(|sgl| {
            self.engine
                .prep_slave_sg(sgl, self.direction.transfer_direction(), flags)
        });
        let Some(tx) = tx else {
            tracing::warn!("DMA engine could not provide a descriptor");
            self.with_state(|_| xfer.unwind(platform));
            return Err(Error::OutOfMemory);
        };

        let ctx: Arc<dyn Complete> = self.clone();
        self.with_state(move |fsm| {
            debug_assert!(fsm.inflight.is_none(), "prepared with a transfer in flight");
            fsm.transition(State::InFlight);

            let cookie = self.engine.submit(tx, Callback::new(ctx));
            if !cookie.is_valid() {
                tracing::warn!(?cookie, "DMA engine rejected descriptor");
                fsm.transition(State::Idle);
                xfer.unwind(platform);
                return Err(Error::SubmissionFailed);
            }

            xfer.started();
            tracing::debug!(?cookie, pages = xfer.nr_pages(), "transfer started");
            fsm.inflight = Some(xfer);
            self.engine.issue_pending();
            Ok(())
        })
    }

    /// Releases the in-flight transfer, if any, and returns to idle. Must be
    /// called with the gate held.
    fn unwind(&self, fsm: &mut Fsm<P>) {
        match fsm.inflight.take() {
            Some(mut xfer) => xfer.unwind(&self.platform),
            None => tracing::warn!(state = %fsm.state, "unwinding with no transfer in flight"),
        }
        fsm.transition(State::Idle);
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut Fsm<P>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.state.borrow_ref_mut(cs)))
    }

    fn is_idle(&self) -> bool {
        self.with_state(|fsm| fsm.state == State::Idle)
    }

    fn is_in_flight(&self) -> bool {
        self.with_state(|fsm| fsm.state == State::InFlight)
    }
}

impl<P: Platform> Complete for Channel<P> {
    fn complete(&self) {
        self.with_state(|fsm| {
            if fsm.state != State::InFlight {
                tracing::trace!(channel = %self.name, state = %fsm.state, "completion ignored");
                return;
            }
            fsm.transition(State::Completing);
            self.xfer_done.wake_all();
        })
    }
}

impl<P: Platform> fmt::Debug for Channel<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("accepting", &self.accepting)
            .field("init_done", &self.init_done)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

fn truncate_name(name: &str) -> String<MAX_NAME_LEN> {
    let mut truncated = String::new();
    for c in name.chars() {
        if truncated.push(c).is_err() {
            break;
        }
    }
    truncated
}

/// Waits until `done` returns `true`, rechecking whenever `queue` is woken.
async fn wait_until(queue: &WaitQueue, mut done: impl FnMut() -> bool) {
    loop {
        let wait = queue.wait();
        futures::pin_mut!(wait);
        // subscribe before checking, so a wakeup in between isn't lost.
        let _ = wait.as_mut().subscribe();

        if done() {
            return;
        }

        if wait.await.is_err() {
            return;
        }
    }
}

/// Runs `f` unless a signal is raised first.
async fn interruptible<F: Future>(signals: &Signals, f: F) -> Result<F::Output, Error> {
    let f = f.fuse();
    let signal = signals.pending().fuse();
    futures::pin_mut!(f, signal);
    futures::select_biased! {
        output = f => Ok(output),
        _ = signal => {
            tracing::debug!("interrupted by signal");
            Err(Error::RestartSignal)
        }
    }
}
