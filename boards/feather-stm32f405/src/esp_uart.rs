//! USART3 receive path to the ESP8266
//!
//! `UartRx::read_until_idle` runs a one-shot DMA transfer and
//! returns when the IDLE flag fires, having already cleared the flag and
//! stopped the channel. [`CompletedTransfer`] presents that finished
//! transfer to the frame receiver as idle-line hardware.

use defmt::{info, warn};
use embassy_stm32::mode::Async;
use embassy_stm32::usart::UartRx;
use esp_link_core::{Esp8266Receiver, RX_CAPACITY};
use hal_abstractions::IdleLineRx;

/// A DMA receive that ended on line idle
pub struct CompletedTransfer<'b> {
    buffer: &'b [u8],
    received: usize,
}

impl<'b> CompletedTransfer<'b> {
    pub fn new(buffer: &'b [u8], received: usize) -> Self {
        Self {
            buffer,
            received: received.min(buffer.len()),
        }
    }
}

impl IdleLineRx for CompletedTransfer<'_> {
    // Flag clear, channel stop and restart are owned by read_until_idle
    fn clear_idle(&mut self) {}

    fn stop(&mut self) {}

    fn transfer_remaining(&self) -> usize {
        self.buffer.len() - self.received
    }

    fn buffer(&self) -> &[u8] {
        self.buffer
    }

    fn start(&mut self) {}
}

/// Receive frames forever, publishing each one to `receiver`.
pub async fn receive_frames(
    mut rx: UartRx<'static, Async>,
    receiver: &'static Esp8266Receiver,
) -> ! {
    let mut buffer = [0u8; RX_CAPACITY];
    info!("ESP8266 receive path started");
    loop {
        match rx.read_until_idle(&mut buffer).await {
            Ok(n) => {
                let dropped_before = receiver.overruns();
                receiver.on_line_idle(&mut CompletedTransfer::new(&buffer, n));
                if receiver.overruns() != dropped_before {
                    warn!("{} bytes dropped, no room after the unread frame", n);
                }
            }
            Err(e) => warn!("USART3 receive error: {:?}", e),
        }
    }
}
