//! Transparent-mode transport
//!
//! Once bring-up has issued `AT+CIPSEND` the modem forwards every byte it
//! receives on the UART to the TCP peer and back, so the link is a plain
//! byte stream. [`RawLink`] exposes it both as explicit send/receive calls
//! and as `embedded-io-async` `Read`/`Write`, which is what MQTT clients
//! such as `rust-mqtt` expect.
//!
//! Received data still arrives in idle-line frames; `Read` drains one frame
//! across as many calls as the caller's buffer requires. A segment that
//! arrives while a frame is half drained is appended behind its unread
//! bytes, so the stream is read back in order.

use embedded_hal_async::delay::DelayNs;
use embedded_io_async::{ErrorType, Read, Write};

use crate::error::LinkError;
use crate::frame::FrameReceiver;
use crate::transaction::TransactionEngine;

/// Byte stream to the TCP peer through a transparent-mode ESP8266
///
/// Obtained from [`BringUp::into_link`](crate::BringUp::into_link).
pub struct RawLink<'a, T, D, const N: usize> {
    engine: TransactionEngine<'a, T, D, N>,
}

impl<'a, T, D, const N: usize> RawLink<'a, T, D, N>
where
    T: Write,
    D: DelayNs,
{
    pub(crate) fn new(engine: TransactionEngine<'a, T, D, N>) -> Self {
        Self { engine }
    }

    /// Transmit `bytes` verbatim.
    ///
    /// Any frame still pending is discarded first, so the next frame
    /// received is the peer's answer to this transmission.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        trace!("Raw send: {} bytes", bytes.len());
        self.engine.transmit_raw(bytes).await
    }

    /// Copy pending received bytes into `buf` without waiting.
    ///
    /// Returns 0 when nothing is pending.
    pub fn receive_raw(&self, buf: &mut [u8]) -> usize {
        self.engine.receiver().read_into(buf)
    }

    /// Wait up to `timeout_ms` for received bytes and copy them into `buf`.
    pub async fn receive_raw_timeout(
        &mut self,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, LinkError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let rx = self.engine.receiver();
        if self.engine.await_any_frame(timeout_ms).await.is_matched() {
            Ok(rx.read_into(buf))
        } else {
            Err(LinkError::Timeout)
        }
    }

    pub fn receiver(&self) -> &'a FrameReceiver<N> {
        self.engine.receiver()
    }

    /// Give back the transmitter and delay, e.g. to run bring-up again
    /// after the peer closed the connection.
    pub fn release(self) -> (T, D) {
        self.engine.release()
    }
}

impl<T, D, const N: usize> ErrorType for RawLink<'_, T, D, N> {
    type Error = LinkError;
}

impl<T, D, const N: usize> Read for RawLink<'_, T, D, N>
where
    T: Write,
    D: DelayNs,
{
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        let rx = self.engine.receiver();
        loop {
            rx.wait_frame().await;
            let n = rx.read_into(buf);
            if n > 0 {
                return Ok(n);
            }
        }
    }
}

impl<T, D, const N: usize> Write for RawLink<'_, T, D, N>
where
    T: Write,
    D: DelayNs,
{
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.engine.write_raw(buf).await
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.engine.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bringup::BringUp;
    use crate::config::{LinkTiming, NetConfig};
    use crate::mock::{MockDelay, MockModem, MockResetPin, ModemHandle};
    use embassy_futures::join::join;
    use embassy_futures::{block_on, yield_now};

    // MQTT 3.1.1 CONNECT for client id "ID", clean session, keep-alive 60
    const CONNECT: &[u8] = &[
        0x10, 0x0e, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3c, 0x00, 0x02, b'I',
        b'D',
    ];
    const CONNACK: &[u8] = &[0x20, 0x02, 0x00, 0x00];

    type TestLink<'a> = RawLink<'a, MockModem<'a, 256>, MockDelay, 256>;

    fn open_link<'a>(rx: &'a FrameReceiver<256>, modem: &ModemHandle) -> TestLink<'a> {
        let engine = TransactionEngine::new(rx, MockModem::new(rx, modem), MockDelay::new());
        let mut bring_up = BringUp::new(engine, MockResetPin::new(rx, modem), NetConfig::default())
            .with_timing(LinkTiming::default());
        block_on(bring_up.bring_up_connection()).unwrap();
        match bring_up.into_link() {
            Ok(link) => link,
            Err(_) => panic!("transparent mode not enabled"),
        }
    }

    #[test]
    fn test_send_and_receive_raw() {
        let rx = FrameReceiver::new();
        let modem = ModemHandle::happy_path(&NetConfig::default());
        modem.script_bytes(CONNECT, CONNACK);
        let mut link = open_link(&rx, &modem);

        block_on(link.send_raw(CONNECT)).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(link.receive_raw(&mut buf), 4);
        assert_eq!(&buf[..4], CONNACK);
        assert_eq!(link.receive_raw(&mut buf), 0);
        let wire = modem.wire();
        assert_eq!(wire.last().map(Vec::as_slice), Some(CONNECT));
    }

    #[test]
    fn test_receive_timeout() {
        let rx = FrameReceiver::new();
        let modem = ModemHandle::happy_path(&NetConfig::default());
        let mut link = open_link(&rx, &modem);

        let mut buf = [0u8; 8];
        assert_eq!(
            block_on(link.receive_raw_timeout(&mut buf, 50)),
            Err(LinkError::Timeout)
        );

        rx.publish(b"\x30\x00");
        assert_eq!(block_on(link.receive_raw_timeout(&mut buf, 50)), Ok(2));
    }

    #[test]
    fn test_io_read_drains_across_calls() {
        let rx = FrameReceiver::new();
        let modem = ModemHandle::happy_path(&NetConfig::default());
        modem.script_bytes(CONNECT, CONNACK);
        let mut link = open_link(&rx, &modem);

        block_on(async {
            link.write_all(CONNECT).await.unwrap();
            link.flush().await.unwrap();

            let mut header = [0u8; 2];
            link.read_exact(&mut header).await.unwrap();
            assert_eq!(header, [0x20, 0x02]);

            let mut body = [0u8; 2];
            assert_eq!(link.read(&mut body).await, Ok(2));
            assert_eq!(body, [0x00, 0x00]);
        });
        assert!(!rx.is_ready());
    }

    #[test]
    fn test_write_error_maps_to_serial() {
        let rx = FrameReceiver::new();
        let modem = ModemHandle::happy_path(&NetConfig::default());
        let mut link = open_link(&rx, &modem);
        modem.fail_writes(true);

        assert_eq!(block_on(link.send_raw(b"\xc0\x00")), Err(LinkError::Serial));
        assert_eq!(block_on(link.write(b"\xc0\x00")), Err(LinkError::Serial));
    }

    #[test]
    fn test_segment_arriving_mid_read_follows_unread_bytes() {
        let rx = FrameReceiver::new();
        let modem = ModemHandle::happy_path(&NetConfig::default());
        modem.script_bytes(CONNECT, CONNACK);
        let mut link = open_link(&rx, &modem);

        block_on(async {
            link.write_all(CONNECT).await.unwrap();

            let mut header = [0u8; 2];
            link.read_exact(&mut header).await.unwrap();
            assert_eq!(header, [0x20, 0x02]);

            // PUBLISH "t" = "x", QoS 0, lands before the CONNACK tail is read
            rx.publish(&[0x30, 0x04, 0x00, 0x01, b't', b'x']);

            let mut rest = [0u8; 8];
            link.read_exact(&mut rest).await.unwrap();
            assert_eq!(rest, [0x00, 0x00, 0x30, 0x04, 0x00, 0x01, b't', b'x']);
        });
        assert_eq!(rx.overruns(), 0);
        assert!(!rx.is_ready());
    }

    #[test]
    fn test_io_read_wakes_on_segment() {
        let rx = FrameReceiver::new();
        let modem = ModemHandle::happy_path(&NetConfig::default());
        let mut link = open_link(&rx, &modem);

        let mut buf = [0u8; 4];
        let (read, _) = block_on(join(link.read(&mut buf), async {
            yield_now().await;
            rx.publish(b"\xd0\x00");
        }));

        assert_eq!(read, Ok(2));
        assert_eq!(&buf[..2], b"\xd0\x00");
    }
}
