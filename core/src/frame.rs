//! Idle-line framed receiver
//!
//! The ESP8266 AT protocol has no length prefix and no terminator the
//! foreground can rely on, so a frame ends when the UART line goes idle.
//! The UART interrupt hands every finished DMA transfer to
//! [`FrameReceiver::on_line_idle`]; the foreground waits for it with
//! [`FrameReceiver::await_frame`] and drains it with one of the consume
//! methods.
//!
//! ## Buffering
//!
//! The DMA target buffer (owned by the [`IdleLineRx`] implementation) is
//! the back buffer. On idle the interrupt copies the received bytes into
//! the published [`RxFrame`] and restarts DMA right away, so reception is
//! never paused and the foreground never reads memory the DMA may still
//! be writing. At most one frame is in flight: bytes arriving while a
//! published frame is unconsumed are appended to its unread tail, so a
//! byte stream split across several idle events stays in order. Only an
//! arrival that does not fit next to the unread bytes is dropped and
//! counted as an overrun.
//!
//! The receiver is `const`-constructible and meant to live in a `static`
//! shared by the interrupt handler and the foreground task.

use core::cell::RefCell;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embedded_hal_async::delay::DelayNs;
use hal_abstractions::IdleLineRx;

use crate::error::LinkError;
use crate::fmt::frame_text;

/// Receive buffer capacity of the ESP8266 UART link
pub const RX_CAPACITY: usize = 1024;

/// One received frame plus its handoff flag
pub struct RxFrame<const N: usize> {
    buffer: [u8; N],
    length: usize,
    /// Read position for partial drains
    cursor: usize,
    ready: bool,
}

impl<const N: usize> RxFrame<N> {
    const fn new() -> Self {
        Self {
            buffer: [0; N],
            length: 0,
            cursor: 0,
            ready: false,
        }
    }

    /// Received bytes not yet drained
    pub fn bytes(&self) -> &[u8] {
        &self.buffer[self.cursor..self.length]
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    fn clear(&mut self) {
        self.buffer.fill(0);
        self.length = 0;
        self.cursor = 0;
        self.ready = false;
    }
}

struct RxState<const N: usize> {
    frame: RxFrame<N>,
    overruns: u32,
}

/// Single-slot handoff of idle-line framed data from interrupt context
/// to the foreground
pub struct FrameReceiver<const N: usize> {
    state: Mutex<CriticalSectionRawMutex, RefCell<RxState<N>>>,
    arrived: Signal<CriticalSectionRawMutex, ()>,
}

impl<const N: usize> FrameReceiver<N> {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(RxState {
                frame: RxFrame::new(),
                overruns: 0,
            })),
            arrived: Signal::new(),
        }
    }

    /// Idle-line interrupt handler body.
    ///
    /// Clears the idle condition, stops DMA, publishes the
    /// `capacity - remaining` bytes it received and restarts DMA into the
    /// same buffer.
    pub fn on_line_idle<H: IdleLineRx>(&self, hw: &mut H) {
        hw.clear_idle();
        hw.stop();
        let len = hw.received_len();
        self.publish(&hw.buffer()[..len]);
        hw.start();
    }

    /// Publish `bytes` as the next frame.
    ///
    /// If a frame is still pending, `bytes` are appended after its unread
    /// part. Returns `false` when they do not fit there and were dropped.
    /// Empty input is ignored. Input longer than the capacity of an empty
    /// slot is truncated.
    pub fn publish(&self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return true;
        }

        let accepted = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let state = &mut *state;
            let frame = &mut state.frame;

            if frame.ready {
                let unread = frame.length - frame.cursor;
                if unread + bytes.len() > N {
                    state.overruns = state.overruns.wrapping_add(1);
                    return false;
                }
                frame.buffer.copy_within(frame.cursor..frame.length, 0);
                frame.buffer[unread..unread + bytes.len()].copy_from_slice(bytes);
                frame.length = unread + bytes.len();
                frame.cursor = 0;
                return true;
            }

            let len = bytes.len().min(N);
            frame.buffer[..len].copy_from_slice(&bytes[..len]);
            frame.length = len;
            frame.cursor = 0;
            frame.ready = true;
            true
        });

        if accepted {
            self.arrived.signal(());
        }
        accepted
    }

    /// Wait until a frame is ready or `timeout_ms` elapses.
    ///
    /// The deadline is a single delay future armed once; wake-ups that
    /// find no frame (e.g. a frame discarded by [`reset`](Self::reset))
    /// keep waiting against the same deadline.
    pub async fn await_frame<D: DelayNs>(
        &self,
        delay: &mut D,
        timeout_ms: u32,
    ) -> Result<(), LinkError> {
        if self.is_ready() {
            return Ok(());
        }

        let deadline = delay.delay_ms(timeout_ms);
        let mut deadline = core::pin::pin!(deadline);
        loop {
            match select(self.arrived.wait(), deadline.as_mut()).await {
                Either::First(()) => {
                    if self.is_ready() {
                        return Ok(());
                    }
                }
                Either::Second(()) => {
                    return if self.is_ready() {
                        Ok(())
                    } else {
                        Err(LinkError::Timeout)
                    };
                }
            }
        }
    }

    /// Wait for the next frame without a deadline.
    pub async fn wait_frame(&self) {
        while !self.is_ready() {
            self.arrived.wait().await;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock(|state| state.borrow().frame.ready)
    }

    /// Length of the pending frame, 0 when none is ready
    pub fn len(&self) -> usize {
        self.state.lock(|state| {
            let state = state.borrow();
            if state.frame.ready {
                state.frame.length
            } else {
                0
            }
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Arrivals dropped because they did not fit next to a pending frame
    pub fn overruns(&self) -> u32 {
        self.state.lock(|state| state.borrow().overruns)
    }

    /// Run `f` over the pending frame, then clear it.
    ///
    /// The slot is released only after `f` returns, so the interrupt path
    /// cannot publish over bytes that are still being inspected. The
    /// arrival signal is cleared in the same critical section, so a frame
    /// published right after the release keeps its wake-up.
    pub fn consume_with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if !state.frame.ready {
                return None;
            }
            let result = f(state.frame.bytes());
            state.frame.clear();
            self.arrived.reset();
            Some(result)
        })
    }

    /// Take a copy of the pending frame and clear it.
    pub fn consume(&self) -> Option<heapless::Vec<u8, N>> {
        self.consume_with(|bytes| {
            let mut frame = heapless::Vec::new();
            // Cannot fail: a frame never exceeds N bytes.
            let _ = frame.extend_from_slice(bytes);
            frame
        })
    }

    /// Copy as much of the pending frame as fits into `out`.
    ///
    /// The frame stays pending until every byte has been read; the call
    /// that reads the last byte clears it. Returns 0 when nothing is
    /// pending.
    pub fn read_into(&self, out: &mut [u8]) -> usize {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if !state.frame.ready {
                return 0;
            }
            let pending = state.frame.bytes();
            let n = pending.len().min(out.len());
            out[..n].copy_from_slice(&pending[..n]);
            state.frame.cursor += n;
            if state.frame.cursor >= state.frame.length {
                state.frame.clear();
                self.arrived.reset();
            }
            n
        })
    }

    /// Discard any pending frame without waiting.
    ///
    /// Called before every transmit so stale data cannot be taken for the
    /// response to the new command.
    pub fn reset(&self) {
        let discarded = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let discarded = state.frame.ready;
            if discarded {
                trace!("Discarding stale frame: {}", frame_text(state.frame.bytes()));
            }
            state.frame.clear();
            self.arrived.reset();
            discarded
        });
        if discarded {
            debug!("Receiver reset dropped a pending frame");
        }
    }
}

impl<const N: usize> Default for FrameReceiver<N> {
    fn default() -> Self {
        Self::new()
    }
}
