//! ESP8266 connection bring-up
//!
//! Drives the modem from power-on to an open transparent-mode TCP session
//! through a fixed sequence of [`Step`]s. Every step is retried with a
//! fixed backoff; exhausting the budget of a mandatory step aborts the
//! whole pipeline, while the two informational queries only log and fall
//! through.
//!
//! ```text
//! Reset -> +++ -> ATE0 -> CWMODE -> CWAUTOCONN -> CWJAP -> [CWJAP?] -> [CIPSTA?]
//!       -> CWDHCP -> CIPMUX -> CIPMODE -> CIPSTART -> CIPSEND -> transparent
//! ```
//!
//! # Example
//!
//! ```ignore
//! static RX: Esp8266Receiver = FrameReceiver::new();
//!
//! let engine = TransactionEngine::new(&RX, uart_tx, Delay);
//! let mut bring_up = BringUp::new(engine, reset_pin, NetConfig::default());
//! bring_up.bring_up_connection().await?;
//! let link = bring_up.into_link().ok().unwrap();
//! ```

use core::fmt::Write as _;

use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;
use embedded_io_async::Write;
use heapless::String;

use crate::config::{LinkTiming, NetConfig};
use crate::error::LinkError;
use crate::link::RawLink;
use crate::transaction::{CommandSpec, Outcome, TransactionEngine};

/// Capacity of commands built from configuration
const COMMAND_CAPACITY: usize = 128;

const OK_ACK: &str = "OK";

/// Access point association and TCP session status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    Offline,
    Online,
    Connected,
    Disconnected,
}

/// Whether the modem forwards raw bytes to the TCP session
///
/// Must be `Disabled` for AT exchanges and `Enabled` for payload traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransparentMode {
    Unknown,
    Enabled,
    Disabled,
}

/// Bring-up pipeline steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Step {
    Reset,
    DisableTransparent,
    DisableEcho,
    StationMode,
    DisableAutoConnect,
    JoinAccessPoint,
    QueryApInfo,
    QueryIpInfo,
    EnableDhcp,
    SingleConnection,
    SetTransparent,
    OpenTcp,
    EnableRawSend,
}

impl Step {
    pub const SEQUENCE: [Step; 13] = [
        Step::Reset,
        Step::DisableTransparent,
        Step::DisableEcho,
        Step::StationMode,
        Step::DisableAutoConnect,
        Step::JoinAccessPoint,
        Step::QueryApInfo,
        Step::QueryIpInfo,
        Step::EnableDhcp,
        Step::SingleConnection,
        Step::SetTransparent,
        Step::OpenTcp,
        Step::EnableRawSend,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            Step::Reset => "reset",
            Step::DisableTransparent => "disable transparent mode",
            Step::DisableEcho => "disable echo",
            Step::StationMode => "station mode",
            Step::DisableAutoConnect => "disable auto-connect",
            Step::JoinAccessPoint => "join access point",
            Step::QueryApInfo => "query AP info",
            Step::QueryIpInfo => "query IP info",
            Step::EnableDhcp => "enable DHCP",
            Step::SingleConnection => "single connection",
            Step::SetTransparent => "set transparent mode",
            Step::OpenTcp => "open TCP connection",
            Step::EnableRawSend => "enable raw send",
        }
    }

    /// Informational steps may fail without aborting the pipeline
    pub const fn is_mandatory(&self) -> bool {
        !matches!(self, Step::QueryApInfo | Step::QueryIpInfo)
    }

    fn action(&self) -> Action {
        use Action::Command;
        use Timeout::{Base, Short};

        match self {
            Step::Reset => Action::HardwareReset,
            Step::DisableTransparent => Command {
                payload: "+++",
                ack: "+++",
                timeout: Base,
                newline: false,
            },
            Step::DisableEcho => Command {
                payload: "ATE0",
                ack: OK_ACK,
                timeout: Base,
                newline: true,
            },
            Step::StationMode => Command {
                payload: "AT+CWMODE_CUR=1",
                ack: OK_ACK,
                timeout: Short,
                newline: true,
            },
            Step::DisableAutoConnect => Command {
                payload: "AT+CWAUTOCONN=0",
                ack: OK_ACK,
                timeout: Short,
                newline: true,
            },
            Step::JoinAccessPoint => Action::JoinAccessPoint,
            Step::QueryApInfo => Command {
                payload: "AT+CWJAP_CUR?",
                ack: OK_ACK,
                timeout: Base,
                newline: true,
            },
            Step::QueryIpInfo => Command {
                payload: "AT+CIPSTA_CUR?",
                ack: OK_ACK,
                timeout: Base,
                newline: true,
            },
            Step::EnableDhcp => Command {
                payload: "AT+CWDHCP_CUR=1,1",
                ack: OK_ACK,
                timeout: Short,
                newline: true,
            },
            Step::SingleConnection => Command {
                payload: "AT+CIPMUX=0",
                ack: OK_ACK,
                timeout: Short,
                newline: true,
            },
            Step::SetTransparent => Command {
                payload: "AT+CIPMODE=1",
                ack: OK_ACK,
                timeout: Short,
                newline: true,
            },
            Step::OpenTcp => Action::OpenTcp,
            Step::EnableRawSend => Command {
                payload: "AT+CIPSEND",
                ack: OK_ACK,
                timeout: Short,
                newline: true,
            },
        }
    }
}

impl core::fmt::Display for Step {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy)]
enum Timeout {
    Base,
    Short,
}

/// What one attempt of a step does
enum Action {
    HardwareReset,
    Command {
        payload: &'static str,
        ack: &'static str,
        timeout: Timeout,
        newline: bool,
    },
    /// `AT+CWJAP_CUR` built from configuration; sets [`LinkState::Online`]
    JoinAccessPoint,
    /// `AT+CIPSTART` built from configuration; sets [`LinkState::Connected`]
    OpenTcp,
}

/// Attempt counter of a single step invocation
///
/// A budget of `max` allows `max + 1` attempts. The counter is wider than
/// `max` so the full `u8` range stays finite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    failures: u16,
    max: u8,
}

impl RetryBudget {
    pub const fn new(max: u8) -> Self {
        Self { failures: 0, max }
    }

    /// Count a failed attempt. Returns whether another attempt is allowed.
    pub fn record_failure(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.failures += 1;
        !self.is_exhausted()
    }

    /// Failed attempts so far
    pub fn attempts(&self) -> u16 {
        self.failures
    }

    pub fn is_exhausted(&self) -> bool {
        self.failures > u16::from(self.max)
    }
}

/// Owner of the modem link state and driver of the bring-up pipeline
pub struct BringUp<'a, T, D, P, const N: usize> {
    engine: TransactionEngine<'a, T, D, N>,
    reset: P,
    config: NetConfig,
    timing: LinkTiming,
    link: LinkState,
    transparent: TransparentMode,
    step_counter: u8,
    current: Option<Step>,
}

impl<'a, T, D, P, const N: usize> BringUp<'a, T, D, P, N>
where
    T: Write,
    D: DelayNs,
    P: OutputPin,
{
    pub fn new(engine: TransactionEngine<'a, T, D, N>, reset: P, config: NetConfig) -> Self {
        Self {
            engine,
            reset,
            config,
            timing: LinkTiming::default(),
            link: LinkState::Offline,
            transparent: TransparentMode::Unknown,
            step_counter: 0,
            current: None,
        }
    }

    pub fn with_timing(mut self, timing: LinkTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn link_state(&self) -> LinkState {
        self.link
    }

    pub fn transparent_mode(&self) -> TransparentMode {
        self.transparent
    }

    /// Steps entered minus steps failed in the current run
    pub fn step_counter(&self) -> u8 {
        self.step_counter
    }

    /// Step being executed, or the step the last run stopped at
    pub fn current_step(&self) -> Option<Step> {
        self.current
    }

    /// Position of [`current_step`](Self::current_step) in [`Step::SEQUENCE`]
    pub fn step_index(&self) -> Option<usize> {
        let current = self.current?;
        Step::SEQUENCE.iter().position(|&s| s == current)
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Run the whole pipeline once.
    ///
    /// On error the modem is left as the failing step found it; call
    /// again to start over from the hardware reset.
    pub async fn bring_up_connection(&mut self) -> Result<(), LinkError> {
        self.link = LinkState::Offline;
        self.transparent = TransparentMode::Unknown;
        self.step_counter = 0;
        self.current = None;

        for step in Step::SEQUENCE {
            if !step.is_mandatory() && self.link != LinkState::Online {
                continue;
            }

            self.step_counter = self.step_counter.saturating_add(1);
            self.current = Some(step);
            info!("Bring-up step {}: {}", self.step_counter, step);

            match self.run_step(step).await {
                Ok(()) => self.complete(step),
                Err(e) => {
                    self.step_counter = self.step_counter.saturating_sub(1);
                    if step.is_mandatory() {
                        error!("Step {} failed: {}", step, e);
                        return Err(LinkError::PipelineFailed(step));
                    }
                    warn!("Step {} failed: {}, bring-up continues", step, e);
                }
            }

            self.engine.delay_ms(self.timing.step_settle_ms).await;
        }

        info!(
            "ESP8266 link up: {}:{} in transparent mode",
            self.config.server_host, self.config.server_port
        );
        Ok(())
    }

    /// Hand the transmitter over to raw payload traffic.
    ///
    /// Only available once bring-up has enabled transparent mode;
    /// otherwise `self` is returned unchanged.
    pub fn into_link(self) -> Result<RawLink<'a, T, D, N>, Self> {
        if self.transparent == TransparentMode::Enabled {
            Ok(RawLink::new(self.engine))
        } else {
            Err(self)
        }
    }

    async fn run_step(&mut self, step: Step) -> Result<(), LinkError> {
        let max = if step.is_mandatory() {
            self.timing.max_retries
        } else {
            self.timing.optional_retries()
        };
        let mut budget = RetryBudget::new(max);

        loop {
            let failure = match self.attempt(step).await {
                Ok(outcome) => match outcome.into_result() {
                    Ok(()) => return Ok(()),
                    Err(e) => e,
                },
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            let retry = budget.record_failure();
            warn!("{} attempt {} failed: {}", step, budget.attempts(), failure);
            if !retry {
                return Err(LinkError::RetryExhausted(step));
            }
            self.engine.delay_ms(self.timing.retry_backoff_ms).await;
        }
    }

    async fn attempt(&mut self, step: Step) -> Result<Outcome, LinkError> {
        match step.action() {
            Action::HardwareReset => self.hardware_reset().await,
            Action::Command {
                payload,
                ack,
                timeout,
                newline,
            } => {
                let timeout_ms = match timeout {
                    Timeout::Base => self.timing.base_timeout_ms,
                    Timeout::Short => self.timing.short_timeout_ms,
                };
                let mut spec = CommandSpec::new(payload.as_bytes(), ack.as_bytes(), timeout_ms);
                if !newline {
                    spec = spec.without_newline();
                }
                self.engine.execute(&spec).await
            }
            Action::JoinAccessPoint => self.join_access_point().await,
            Action::OpenTcp => self.open_tcp().await,
        }
    }

    /// Pulse the reset line and wait for the boot banner.
    async fn hardware_reset(&mut self) -> Result<Outcome, LinkError> {
        self.engine.receiver().reset();

        self.reset.set_low().map_err(|_| LinkError::ResetLine)?;
        self.engine.delay_ms(self.timing.reset_pulse_ms).await;
        self.reset.set_high().map_err(|_| LinkError::ResetLine)?;

        let outcome = self.engine.await_any_frame(self.timing.reset_wait_ms).await;
        if outcome.is_matched() {
            info!("ESP8266 hardware reset OK");
            // Boot output keeps coming for a while after the banner
            self.engine.delay_ms(self.timing.reset_settle_ms).await;
            self.engine.receiver().reset();
        }
        Ok(outcome)
    }

    async fn join_access_point(&mut self) -> Result<Outcome, LinkError> {
        let mut cmd: String<COMMAND_CAPACITY> = String::new();
        write!(
            cmd,
            "AT+CWJAP_CUR=\"{}\",\"{}\"",
            self.config.ap_ssid, self.config.ap_password
        )
        .map_err(|_| LinkError::CommandTooLong)?;

        let spec = CommandSpec::new(
            cmd.as_bytes(),
            b"WIFI CONNECTED",
            self.timing.extended_timeout_ms(),
        );
        let result = self.engine.execute(&spec).await;
        self.link = match result {
            Ok(Outcome::Matched) => LinkState::Online,
            _ => LinkState::Offline,
        };
        result
    }

    async fn open_tcp(&mut self) -> Result<Outcome, LinkError> {
        let mut cmd: String<COMMAND_CAPACITY> = String::new();
        write!(
            cmd,
            "AT+CIPSTART=\"TCP\",\"{}\",{}",
            self.config.server_host, self.config.server_port
        )
        .map_err(|_| LinkError::CommandTooLong)?;

        let spec = CommandSpec::new(
            cmd.as_bytes(),
            b"CONNECT",
            self.timing.extended_timeout_ms(),
        );
        let result = self.engine.execute(&spec).await;
        self.link = match result {
            Ok(Outcome::Matched) => LinkState::Connected,
            _ => LinkState::Disconnected,
        };
        result
    }

    fn complete(&mut self, step: Step) {
        match step {
            Step::DisableTransparent => self.transparent = TransparentMode::Disabled,
            Step::EnableRawSend => self.transparent = TransparentMode::Enabled,
            _ => {}
        }
    }
}
