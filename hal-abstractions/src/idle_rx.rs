//! Idle-line terminated DMA reception
//!
//! Modems that speak a line protocol without a length prefix are framed
//! by the UART idle-line condition: once the RX line has been quiet for
//! one character time after receiving data, the hardware raises IDLE and
//! the bytes written so far by the DMA stream form one frame.

/// UART receiver running a continuous DMA transfer into a fixed buffer,
/// stopped and restarted around every idle-line event.
///
/// All methods are called from interrupt context and must not block.
pub trait IdleLineRx {
    /// Acknowledge the idle-line condition so the interrupt is not re-raised.
    fn clear_idle(&mut self);

    /// Stop the in-flight DMA transfer.
    ///
    /// After this returns the DMA no longer writes into [`buffer`](Self::buffer).
    fn stop(&mut self);

    /// Number of bytes the stopped transfer still had left to receive
    /// (the DMA NDTR/CNDTR register).
    fn transfer_remaining(&self) -> usize;

    /// The whole DMA target buffer. Its length is the transfer capacity.
    fn buffer(&self) -> &[u8];

    /// Restart the transfer at the beginning of [`buffer`](Self::buffer).
    fn start(&mut self);

    /// Capacity of one transfer in bytes.
    fn capacity(&self) -> usize {
        self.buffer().len()
    }

    /// Bytes received by the transfer that was just stopped.
    fn received_len(&self) -> usize {
        self.capacity().saturating_sub(self.transfer_remaining())
    }
}
