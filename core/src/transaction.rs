//! Command/response exchange with the modem
//!
//! One call to [`TransactionEngine::execute`] is one attempt: discard
//! anything pending, send the command, wait a bounded time for one frame
//! and look for the expected marker in it. Retrying is left to the
//! caller.

use embedded_hal_async::delay::DelayNs;
use embedded_io_async::Write;

use crate::error::LinkError;
use crate::fmt::frame_text;
use crate::frame::FrameReceiver;

/// Line ending appended to AT commands
pub const NEWLINE: &[u8] = b"\r\n";

/// Result of one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    /// The response contained the expected marker
    Matched,
    /// A response arrived without the expected marker
    Mismatched,
    /// No response before the deadline
    TimedOut,
}

impl Outcome {
    pub fn is_matched(&self) -> bool {
        matches!(self, Self::Matched)
    }

    pub fn into_result(self) -> Result<(), LinkError> {
        match self {
            Self::Matched => Ok(()),
            Self::Mismatched => Err(LinkError::Mismatch),
            Self::TimedOut => Err(LinkError::Timeout),
        }
    }
}

/// Immutable description of one exchange: say `payload`, expect
/// `expected` within `timeout_ms`
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec<'a> {
    pub payload: &'a [u8],
    pub expected: &'a [u8],
    pub timeout_ms: u32,
    pub append_newline: bool,
}

impl<'a> CommandSpec<'a> {
    /// AT command terminated with CR LF
    pub const fn new(payload: &'a [u8], expected: &'a [u8], timeout_ms: u32) -> Self {
        Self {
            payload,
            expected,
            timeout_ms,
            append_newline: true,
        }
    }

    /// Send the payload without a line ending (e.g. the `+++` escape)
    pub const fn without_newline(mut self) -> Self {
        self.append_newline = false;
        self
    }
}

/// Case-sensitive, unanchored substring search
pub fn contains_marker(haystack: &[u8], marker: &[u8]) -> bool {
    marker.is_empty() || haystack.windows(marker.len()).any(|w| w == marker)
}

/// Drives single exchanges over a serial transmitter and a shared
/// [`FrameReceiver`]
pub struct TransactionEngine<'a, T, D, const N: usize> {
    rx: &'a FrameReceiver<N>,
    tx: T,
    delay: D,
}

impl<'a, T, D, const N: usize> TransactionEngine<'a, T, D, N>
where
    T: Write,
    D: DelayNs,
{
    pub fn new(rx: &'a FrameReceiver<N>, tx: T, delay: D) -> Self {
        Self { rx, tx, delay }
    }

    /// Perform one exchange.
    ///
    /// The receiver is left empty and armed on every path, including
    /// transmit errors.
    pub async fn execute(&mut self, spec: &CommandSpec<'_>) -> Result<Outcome, LinkError> {
        self.rx.reset();

        debug!("Sending: {}", frame_text(spec.payload));
        self.transmit(spec.payload, spec.append_newline).await?;

        if self.rx.await_frame(&mut self.delay, spec.timeout_ms).await.is_err() {
            debug!("No response within {} ms", spec.timeout_ms);
            return Ok(Outcome::TimedOut);
        }

        let matched = self
            .rx
            .consume_with(|bytes| {
                debug!("Received: {}", frame_text(bytes));
                contains_marker(bytes, spec.expected)
            })
            .unwrap_or(false);

        if matched {
            debug!("Matched {}", frame_text(spec.expected));
            Ok(Outcome::Matched)
        } else {
            debug!("Expected {} not found", frame_text(spec.expected));
            Ok(Outcome::Mismatched)
        }
    }

    /// Wait for any frame (e.g. the boot banner) without consuming it.
    pub async fn await_any_frame(&mut self, timeout_ms: u32) -> Outcome {
        match self.rx.await_frame(&mut self.delay, timeout_ms).await {
            Ok(()) => Outcome::Matched,
            Err(_) => Outcome::TimedOut,
        }
    }

    /// Transmit bytes without waiting for or matching a reply.
    ///
    /// Pending frames are discarded first so the next frame read belongs
    /// to this transmission.
    pub async fn transmit_raw(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.rx.reset();
        self.transmit(bytes, false).await
    }

    /// Pass-through write used by the transparent-mode stream
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<usize, LinkError> {
        self.tx.write(bytes).await.map_err(|_| LinkError::Serial)
    }

    pub async fn flush(&mut self) -> Result<(), LinkError> {
        self.tx.flush().await.map_err(|_| LinkError::Serial)
    }

    async fn transmit(&mut self, bytes: &[u8], newline: bool) -> Result<(), LinkError> {
        self.tx.write_all(bytes).await.map_err(|_| LinkError::Serial)?;
        if newline {
            self.tx.write_all(NEWLINE).await.map_err(|_| LinkError::Serial)?;
        }
        self.tx.flush().await.map_err(|_| LinkError::Serial)
    }

    pub async fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms).await;
    }

    pub fn receiver(&self) -> &'a FrameReceiver<N> {
        self.rx
    }

    /// Give back the transmitter and delay
    pub fn release(self) -> (T, D) {
        (self.tx, self.delay)
    }
}
