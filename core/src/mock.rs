//! Host-side stand-ins for the board collaborators
//!
//! `MockModem` plays the ESP8266: every flushed write is one command, and
//! its scripted reply is pushed through a `MockDma` into the receiver the
//! same way the idle-line interrupt would, before the foreground starts
//! waiting.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::rc::Rc;

use embedded_io_async::ErrorKind;
use hal_abstractions::IdleLineRx;

use crate::config::NetConfig;
use crate::frame::FrameReceiver;

/// DMA receive stream writing into a fixed buffer
pub struct MockDma<const N: usize> {
    buf: [u8; N],
    written: usize,
    pub running: bool,
    pub idle_cleared: bool,
}

impl<const N: usize> MockDma<N> {
    pub fn new() -> Self {
        Self {
            buf: [0; N],
            written: 0,
            running: true,
            idle_cleared: false,
        }
    }

    /// Bytes arriving on the wire while the transfer runs
    pub fn receive(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(N - self.written);
        self.buf[self.written..self.written + n].copy_from_slice(&bytes[..n]);
        self.written += n;
    }
}

impl<const N: usize> IdleLineRx for MockDma<N> {
    fn clear_idle(&mut self) {
        self.idle_cleared = true;
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn transfer_remaining(&self) -> usize {
        N - self.written
    }

    fn buffer(&self) -> &[u8] {
        &self.buf
    }

    fn start(&mut self) {
        self.written = 0;
        self.running = true;
    }
}

/// Delay that completes immediately and records what was asked of it
#[derive(Clone, Default)]
pub struct MockDelay {
    calls: Rc<RefCell<Vec<u32>>>,
}

impl MockDelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requested durations in milliseconds, in call order
    pub fn calls(&self) -> Vec<u32> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, ms: u32) -> usize {
        self.calls.borrow().iter().filter(|&&c| c == ms).count()
    }
}

impl embedded_hal_async::delay::DelayNs for MockDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.calls.borrow_mut().push(ns / 1_000_000);
    }

    async fn delay_us(&mut self, us: u32) {
        self.calls.borrow_mut().push(us / 1_000);
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.calls.borrow_mut().push(ms);
    }
}

/// Delay that never completes, for waits that must end on a frame
pub struct NeverDelay;

impl embedded_hal_async::delay::DelayNs for NeverDelay {
    async fn delay_ns(&mut self, _ns: u32) {
        core::future::pending::<()>().await
    }
}

#[derive(Default)]
struct ModemState {
    /// Command (without line ending) -> replies, one per attempt; the
    /// last reply repeats
    script: HashMap<Vec<u8>, VecDeque<Option<Vec<u8>>>>,
    sent: Vec<Vec<u8>>,
    /// Flushed writes as they appeared on the wire
    wire: Vec<Vec<u8>>,
    boot_banner: Option<Vec<u8>>,
    fail_writes: bool,
}

/// Inspection handle shared by a `MockModem` and its `MockResetPin`
#[derive(Clone, Default)]
pub struct ModemHandle {
    state: Rc<RefCell<ModemState>>,
}

impl ModemHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to `cmd` with each entry of `replies` in turn (`None` stays
    /// silent), repeating the last one.
    pub fn script(&self, cmd: &str, replies: &[Option<&str>]) -> &Self {
        let queue = replies
            .iter()
            .map(|r| r.map(|s| s.as_bytes().to_vec()))
            .collect();
        self.state
            .borrow_mut()
            .script
            .insert(cmd.as_bytes().to_vec(), queue);
        self
    }

    pub fn reply(&self, cmd: &str, reply: &str) -> &Self {
        self.script(cmd, &[Some(reply)])
    }

    pub fn silent(&self, cmd: &str) -> &Self {
        self.script(cmd, &[None])
    }

    pub fn script_bytes(&self, payload: &[u8], reply: &[u8]) -> &Self {
        let mut queue = VecDeque::new();
        queue.push_back(Some(reply.to_vec()));
        self.state
            .borrow_mut()
            .script
            .insert(payload.to_vec(), queue);
        self
    }

    pub fn boot_banner(&self, banner: Option<&str>) -> &Self {
        self.state.borrow_mut().boot_banner = banner.map(|b| b.as_bytes().to_vec());
        self
    }

    pub fn fail_writes(&self, fail: bool) -> &Self {
        self.state.borrow_mut().fail_writes = fail;
        self
    }

    /// A modem that acknowledges every bring-up command on first attempt
    pub fn happy_path(config: &NetConfig) -> Self {
        let modem = Self::new();
        modem
            .boot_banner(Some("\r\nready\r\n"))
            .reply("+++", "+++")
            .reply("ATE0", "ATE0\r\n\r\nOK\r\n")
            .reply("AT+CWMODE_CUR=1", "\r\nOK\r\n")
            .reply("AT+CWAUTOCONN=0", "\r\nOK\r\n")
            .reply(
                &join_command(config),
                "WIFI CONNECTED\r\nWIFI GOT IP\r\n\r\nOK\r\n",
            )
            .reply("AT+CWJAP_CUR?", "+CWJAP_CUR:\"SSID\"\r\n\r\nOK\r\n")
            .reply("AT+CIPSTA_CUR?", "+CIPSTA_CUR:ip:\"192.168.1.42\"\r\n\r\nOK\r\n")
            .reply("AT+CWDHCP_CUR=1,1", "\r\nOK\r\n")
            .reply("AT+CIPMUX=0", "\r\nOK\r\n")
            .reply("AT+CIPMODE=1", "\r\nOK\r\n")
            .reply(&tcp_command(config), "CONNECT\r\n\r\nOK\r\n")
            .reply("AT+CIPSEND", "\r\nOK\r\n\r\n>");
        modem
    }

    /// Every flushed write, line ending stripped
    pub fn sent(&self) -> Vec<String> {
        self.state
            .borrow()
            .sent
            .iter()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect()
    }

    pub fn wire(&self) -> Vec<Vec<u8>> {
        self.state.borrow().wire.clone()
    }

    pub fn count_sent(&self, cmd: &str) -> usize {
        self.sent().iter().filter(|s| *s == cmd).count()
    }

    fn next_reply(&self, cmd: &[u8]) -> Option<Vec<u8>> {
        let mut state = self.state.borrow_mut();
        let queue = state.script.get_mut(cmd)?;
        if queue.len() > 1 {
            queue.pop_front().flatten()
        } else {
            queue.front().cloned().flatten()
        }
    }
}

pub fn join_command(config: &NetConfig) -> String {
    format!(
        "AT+CWJAP_CUR=\"{}\",\"{}\"",
        config.ap_ssid, config.ap_password
    )
}

pub fn tcp_command(config: &NetConfig) -> String {
    format!(
        "AT+CIPSTART=\"TCP\",\"{}\",{}",
        config.server_host, config.server_port
    )
}

/// Scripted ESP8266 on the far side of the UART
pub struct MockModem<'a, const N: usize> {
    rx: &'a FrameReceiver<N>,
    dma: MockDma<N>,
    line: Vec<u8>,
    handle: ModemHandle,
}

impl<'a, const N: usize> MockModem<'a, N> {
    pub fn new(rx: &'a FrameReceiver<N>, handle: &ModemHandle) -> Self {
        Self {
            rx,
            dma: MockDma::new(),
            line: Vec::new(),
            handle: handle.clone(),
        }
    }

    fn answer(&mut self) {
        let mut cmd = core::mem::take(&mut self.line);
        self.handle.state.borrow_mut().wire.push(cmd.clone());
        if cmd.ends_with(b"\r\n") {
            cmd.truncate(cmd.len() - 2);
        }
        let reply = self.handle.next_reply(&cmd);
        self.handle.state.borrow_mut().sent.push(cmd);
        if let Some(reply) = reply {
            self.dma.receive(&reply);
            self.rx.on_line_idle(&mut self.dma);
        }
    }
}

impl<const N: usize> embedded_io_async::ErrorType for MockModem<'_, N> {
    type Error = ErrorKind;
}

impl<const N: usize> embedded_io_async::Write for MockModem<'_, N> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.handle.state.borrow().fail_writes {
            return Err(ErrorKind::BrokenPipe);
        }
        self.line.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        if !self.line.is_empty() {
            self.answer();
        }
        Ok(())
    }
}

/// Reset line of the modem; releasing it boots the modem
pub struct MockResetPin<'a, const N: usize> {
    rx: &'a FrameReceiver<N>,
    dma: MockDma<N>,
    handle: ModemHandle,
    pub levels: Rc<RefCell<Vec<bool>>>,
}

impl<'a, const N: usize> MockResetPin<'a, N> {
    pub fn new(rx: &'a FrameReceiver<N>, handle: &ModemHandle) -> Self {
        Self {
            rx,
            dma: MockDma::new(),
            handle: handle.clone(),
            levels: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl<const N: usize> embedded_hal::digital::ErrorType for MockResetPin<'_, N> {
    type Error = Infallible;
}

impl<const N: usize> embedded_hal::digital::OutputPin for MockResetPin<'_, N> {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.levels.borrow_mut().push(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.levels.borrow_mut().push(true);
        let banner = self.handle.state.borrow().boot_banner.clone();
        if let Some(banner) = banner {
            self.dma.receive(&banner);
            self.rx.on_line_idle(&mut self.dma);
        }
        Ok(())
    }
}
