//! Hardware reset line for the transceiver, driven over Raspberry Pi
//! GPIO using BCM pin numbering.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rppal::gpio::{Gpio, OutputPin};
use tracing::{info, warn};

#[cfg(test)]
use std::sync::Arc;

/// BCM pin wired to the transceiver's reset input.
pub const RESET_PIN: u8 = 24;

/// Abstracts the hardware reset line so the command state machine can be
/// driven in tests without a real Raspberry Pi GPIO pin, the same way an
/// `embedded-hal` `OutputPin` lets driver code stay generic over the
/// concrete pin implementation.
pub trait ResetLine: Send {
    fn pulse(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

#[derive(Debug)]
pub enum GpioError {
    Open(rppal::gpio::Error),
}

impl std::fmt::Display for GpioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open(e) => write!(f, "failed to open GPIO pin {RESET_PIN}: {e}"),
        }
    }
}

impl std::error::Error for GpioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open(e) => Some(e),
        }
    }
}

pub struct RadioReset {
    pin: OutputPin,
}

impl RadioReset {
    pub fn open() -> Result<Self, GpioError> {
        let pin = Gpio::new()
            .map_err(GpioError::Open)?
            .get(RESET_PIN)
            .map_err(GpioError::Open)?
            .into_output_high();
        Ok(Self { pin })
    }

    /// Pulse the reset line low for 250ms, then wait 5s for the
    /// transceiver to finish booting before the caller reprograms it.
    pub async fn pulse_inner(&mut self) {
        info!("pulsing radio reset line");
        self.pin.set_low();
        tokio::time::sleep(Duration::from_millis(250)).await;
        self.pin.set_high();
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

impl ResetLine for RadioReset {
    fn pulse(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.pulse_inner())
    }
}

/// A reset line with no hardware behind it, for the rare case the GPIO
/// pin can't be claimed at startup (e.g. running off the Raspberry Pi).
/// Resets become no-ops rather than aborting the whole gateway.
pub struct NullReset;

impl ResetLine for NullReset {
    fn pulse(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        warn!("GPIO reset line unavailable, skipping hardware reset pulse");
        Box::pin(async {})
    }
}

/// A reset line with no hardware behind it, for driving
/// [`crate::radio::state_machine::CommandStateMachine`] in tests. The
/// returned counter lets a test observe how many pulses happened after
/// the line itself has been boxed away behind `dyn ResetLine`.
#[cfg(test)]
pub struct FakeResetLine {
    pulses: Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl FakeResetLine {
    pub fn new() -> (Self, Arc<std::sync::atomic::AtomicUsize>) {
        let pulses = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        (Self { pulses: pulses.clone() }, pulses)
    }
}

#[cfg(test)]
impl ResetLine for FakeResetLine {
    fn pulse(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.pulses.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Box::pin(async {})
    }
}
