//! # uDMA
//!
//! Blocking read/write channels that move data directly between a caller's
//! buffer and a peripheral using a DMA engine.
//!
//! A [`Udma`] owns two [`Channel`]s, one per [`Direction`]. Each
//! [`Udma::read`] or [`Udma::write`] pins the caller's buffer, describes it
//! to the DMA engine as a scatter-gather list, submits it, and waits for the
//! engine's completion callback. Whatever happens, everything acquired for
//! the transfer is released exactly once before the call returns.
//!
//! Everything outside the driver core (the device configuration, the memory
//! manager and the DMA engine itself) is reached through the [`Platform`]
//! trait.
#![cfg_attr(not(test), no_std)]
#![warn(missing_debug_implementations)]

extern crate alloc;

pub mod channel;
pub mod error;
pub mod mm;
pub mod platform;
pub mod settings;
pub mod sg;
pub mod signal;
pub mod stats;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

use alloc::{string::String, sync::Arc, vec::Vec};
use core::fmt;

use maitake::time::Timer;

pub use self::{
    channel::{Channel, ChannelSnapshot, State},
    error::{to_ssize, AttachError, Error},
    mm::UserBuf,
    platform::{Platform, TransferDirection},
    settings::UdmaSettings,
    signal::Signals,
};
use self::platform::DmaDataDirection;

/// The direction data moves in a transfer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    /// From the peripheral into the caller's buffer (a read).
    DeviceToHost,
    /// From the caller's buffer out to the peripheral (a write).
    HostToDevice,
}

/// The uDMA driver: one [`Channel`] per [`Direction`].
pub struct Udma<P: Platform> {
    platform: Arc<P>,
    settings: UdmaSettings,
    timer: &'static Timer,
    names: Vec<String>,
    tx: Option<Arc<Channel<P>>>,
    rx: Option<Arc<Channel<P>>>,
}

// === impl Direction ===

impl Direction {
    /// Index of this direction's channel in the configured DMA names.
    #[must_use]
    pub const fn name_index(self) -> usize {
        match self {
            Self::HostToDevice => 0,
            Self::DeviceToHost => 1,
        }
    }

    #[must_use]
    pub const fn transfer_direction(self) -> TransferDirection {
        match self {
            Self::DeviceToHost => TransferDirection::DevToMem,
            Self::HostToDevice => TransferDirection::MemToDev,
        }
    }

    #[must_use]
    pub const fn dma_direction(self) -> DmaDataDirection {
        match self {
            Self::DeviceToHost => DmaDataDirection::FromDevice,
            Self::HostToDevice => DmaDataDirection::ToDevice,
        }
    }

    /// Whether the caller's pages must be pinned writable: the device writes
    /// into them.
    #[must_use]
    pub const fn pins_writable(self) -> bool {
        matches!(self, Self::DeviceToHost)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DeviceToHost => "RX",
            Self::HostToDevice => "TX",
        })
    }
}

// === impl Udma ===

impl<P: Platform> Udma<P> {
    /// Attaches to `platform`, acquiring a DMA engine channel for each
    /// direction.
    ///
    /// A direction whose engine channel is not available yet is left
    /// uninitialized, and [`Udma::is_ready`] returns `false` until
    /// [`Udma::reprobe`] acquires it.
    ///
    /// # Errors
    ///
    /// If the platform configuration names no DMA channels, or they could not
    /// be read.
    #[tracing::instrument(
        name = "Udma::attach",
        level = tracing::Level::INFO,
        skip(platform, timer),
        err(Debug),
    )]
    pub fn attach(
        platform: Arc<P>,
        settings: UdmaSettings,
        timer: &'static Timer,
    ) -> Result<Self, AttachError> {
        let names = platform.dma_names().map_err(AttachError::Property)?;
        if names.is_empty() {
            return Err(AttachError::NoDmaNames);
        }
        tracing::debug!(?names, "found DMA channel names");

        let mut udma = Self {
            platform,
            settings,
            timer,
            names,
            tx: None,
            rx: None,
        };
        udma.probe();
        Ok(udma)
    }

    /// Retries acquiring any direction that is not initialized, returning
    /// whether the driver is now ready.
    pub fn reprobe(&mut self) -> bool {
        self.probe();
        self.is_ready()
    }

    /// Returns `true` if both directions are initialized.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        let ready = |chan: &Option<Arc<Channel<P>>>| {
            chan.as_ref().map_or(false, |chan| chan.is_initialized())
        };
        ready(&self.tx) && ready(&self.rx)
    }

    /// Reads from the device into `buf`, returning the number of bytes read.
    pub async fn read(&self, buf: UserBuf, signals: &Signals) -> Result<usize, Error> {
        self.transfer(Direction::DeviceToHost, buf, signals).await
    }

    /// Writes `buf` to the device, returning the number of bytes written.
    pub async fn write(&self, buf: UserBuf, signals: &Signals) -> Result<usize, Error> {
        self.transfer(Direction::HostToDevice, buf, signals).await
    }

    /// Shuts down both channels, terminating any pending engine work and
    /// releasing the engine channels. Calling this more than once, or on a
    /// driver that never finished attaching, is fine.
    pub fn teardown(&self) {
        for chan in [&self.tx, &self.rx].into_iter().flatten() {
            chan.shutdown();
        }
    }

    #[must_use]
    pub fn tx(&self) -> Option<&Arc<Channel<P>>> {
        self.tx.as_ref()
    }

    #[must_use]
    pub fn rx(&self) -> Option<&Arc<Channel<P>>> {
        self.rx.as_ref()
    }

    #[must_use]
    pub fn settings(&self) -> &UdmaSettings {
        &self.settings
    }

    async fn transfer(
        &self,
        direction: Direction,
        buf: UserBuf,
        signals: &Signals,
    ) -> Result<usize, Error> {
        match self.channel(direction) {
            Some(chan) => chan.transfer(buf, signals).await,
            None => Err(Error::ChannelClosed),
        }
    }

    fn channel(&self, direction: Direction) -> Option<&Arc<Channel<P>>> {
        match direction {
            Direction::HostToDevice => self.tx.as_ref(),
            Direction::DeviceToHost => self.rx.as_ref(),
        }
    }

    fn probe(&mut self) {
        for direction in [Direction::HostToDevice, Direction::DeviceToHost] {
            let slot = match direction {
                Direction::HostToDevice => &mut self.tx,
                Direction::DeviceToHost => &mut self.rx,
            };
            if slot.as_ref().map_or(false, |chan| chan.is_initialized()) {
                continue;
            }

            let Some(name) = self.names.get(direction.name_index()) else {
                tracing::warn!(%direction, "no DMA channel name configured");
                continue;
            };

            let Some(engine) = self.platform.request_channel(name) else {
                tracing::warn!(name = %name, %direction, "couldn't find dma channel, deferring");
                continue;
            };

            *slot = Some(Channel::new(
                name,
                direction,
                self.platform.clone(),
                engine,
                self.settings.clone(),
                self.timer,
            ));
        }
    }
}

impl<P: Platform> Drop for Udma<P> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<P: Platform> fmt::Debug for Udma<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Udma")
            .field("names", &self.names)
            .field("settings", &self.settings)
            .field("tx", &self.tx)
            .field("rx", &self.rx)
            .finish_non_exhaustive()
    }
}
