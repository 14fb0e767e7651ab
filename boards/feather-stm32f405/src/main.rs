#![deny(unsafe_code)]
#![deny(warnings)]
#![no_main]
#![no_std]

use defmt_rtt as _; // global logger
use esp_link_core::{Esp8266Receiver, FrameReceiver};
use panic_probe as _;
use rtic::app;
use rtic_monotonics::stm32::prelude::*;

mod config;
mod device_id;
mod esp_uart;
mod mqtt;

stm32_tim2_monotonic!(Mono, 1_000_000);

/// Frames from the ESP8266, shared by the receive and link tasks
static ESP_RX: Esp8266Receiver = FrameReceiver::new();

#[app(device = embassy_stm32, peripherals = true, dispatchers = [USART1, USART2])]
mod app {
    use super::*;
    use defmt::{info, unwrap, warn};
    use embassy_stm32::gpio::{Level, Output, Speed};
    use embassy_stm32::mode::Async;
    use embassy_stm32::peripherals;
    use embassy_stm32::rcc::{Hse, HseMode};
    use embassy_stm32::time::Hertz;
    use embassy_stm32::usart::{self, Uart, UartRx, UartTx};
    use embassy_time::Delay;
    use esp_link_core::{BringUp, LinkState, TransactionEngine};
    use heapless::String;
    use rtic_sync::channel::{Receiver, Sender};
    use rtic_sync::make_channel;
    use static_cell::StaticCell;

    use crate::device_id::CLIENT_ID_MAX_LEN;

    const LINK_STATUS_CAPACITY: usize = 4;
    const ESP8266_BAUD: u32 = 115_200;

    embassy_stm32::bind_interrupts!(struct UartIrqs {
        USART3 => usart::InterruptHandler<peripherals::USART3>;
    });

    #[shared]
    struct Shared {}

    #[local]
    struct Local {
        led: Output<'static>,
        esp_reset: Output<'static>,
        uart_tx: UartTx<'static, Async>,
        uart_rx: Option<UartRx<'static, Async>>,
        status_tx: Sender<'static, LinkState, LINK_STATUS_CAPACITY>,
        status_rx: Receiver<'static, LinkState, LINK_STATUS_CAPACITY>,
    }

    #[init]
    fn init(_cx: init::Context) -> (Shared, Local) {
        info!("ESP8266 link node starting...");

        // Adafruit Feather STM32F405: 12 MHz HSE
        let mut config = embassy_stm32::Config::default();
        config.rcc.hse = Some(Hse {
            freq: Hertz(12_000_000),
            mode: HseMode::Oscillator,
        });

        // HSE (12 MHz) / PREDIV(6) = 2 MHz (PLL input)
        // 2 MHz * MUL(168) = 336 MHz (VCO)
        // VCO / DIVP(4) = 84 MHz (SYSCLK)
        config.rcc.pll_src = embassy_stm32::rcc::PllSource::HSE;
        config.rcc.pll = Some(embassy_stm32::rcc::Pll {
            prediv: embassy_stm32::rcc::PllPreDiv::DIV6,
            mul: embassy_stm32::rcc::PllMul::MUL168,
            divp: Some(embassy_stm32::rcc::PllPDiv::DIV4),
            divq: Some(embassy_stm32::rcc::PllQDiv::DIV7),
            divr: None,
        });
        config.rcc.sys = embassy_stm32::rcc::Sysclk::PLL1_P;
        config.rcc.ahb_pre = embassy_stm32::rcc::AHBPrescaler::DIV1; // 84 MHz
        config.rcc.apb1_pre = embassy_stm32::rcc::APBPrescaler::DIV2; // 42 MHz
        config.rcc.apb2_pre = embassy_stm32::rcc::APBPrescaler::DIV1; // 84 MHz

        let p = embassy_stm32::init(config);
        info!("System initialized: SYSCLK=84MHz");

        // TIM2 on APB1: timer clock = 2*APB1 when prescaler != 1
        let timer_clock_hz = 84_000_000;
        Mono::start(timer_clock_hz);
        info!("TIM2 monotonic timer initialized at 1 MHz");

        let led = Output::new(p.PC1, Level::High, Speed::Low);
        // ESP8266 RST is active low; keep the modem running until bring-up pulses it
        let esp_reset = Output::new(p.PC3, Level::High, Speed::Low);

        // ESP8266 on USART3: TX=PB10, RX=PB11
        let mut uart_config = usart::Config::default();
        uart_config.baudrate = ESP8266_BAUD;
        let uart = unwrap!(Uart::new(
            p.USART3,
            p.PB11,
            p.PB10,
            UartIrqs,
            p.DMA1_CH3,
            p.DMA1_CH1,
            uart_config,
        ));
        let (uart_tx, uart_rx) = uart.split();
        info!("USART3 initialized at {} baud", ESP8266_BAUD);

        let (status_tx, status_rx) = make_channel!(LinkState, LINK_STATUS_CAPACITY);

        heartbeat::spawn().ok();
        esp_rx_task::spawn().ok();
        link_task::spawn().ok();

        (
            Shared {},
            Local {
                led,
                esp_reset,
                uart_tx,
                uart_rx: Some(uart_rx),
                status_tx,
                status_rx,
            },
        )
    }

    /// Heartbeat task
    ///
    /// Fast blink until the TCP session is up, slow blink after.
    #[task(priority = 1, local = [led, status_rx])]
    async fn heartbeat(cx: heartbeat::Context) {
        info!("Heartbeat task started");
        let mut state = LinkState::Offline;
        loop {
            while let Ok(next) = cx.local.status_rx.try_recv() {
                state = next;
            }
            let off_ms: u64 = if state == LinkState::Connected {
                4900
            } else {
                400
            };
            cx.local.led.set_high();
            Mono::delay(100.millis()).await;
            cx.local.led.set_low();
            Mono::delay(off_ms.millis()).await;
        }
    }

    /// ESP8266 receive task - publishes every idle-line frame
    #[task(priority = 2, local = [uart_rx])]
    async fn esp_rx_task(cx: esp_rx_task::Context) {
        match cx.local.uart_rx.take() {
            Some(rx) => esp_uart::receive_frames(rx, &ESP_RX).await,
            None => warn!("USART3 receiver already taken"),
        }
    }

    /// Link task - brings up the ESP8266 and runs the MQTT session on it
    #[task(priority = 1, local = [uart_tx, esp_reset, status_tx])]
    async fn link_task(cx: link_task::Context) {
        static CLIENT_ID: StaticCell<String<CLIENT_ID_MAX_LEN>> = StaticCell::new();
        let client_id: &'static String<CLIENT_ID_MAX_LEN> =
            CLIENT_ID.init(device_id::mqtt_client_id());
        let net = config::net_config(client_id.as_str());

        info!(
            "Link task started: AP {}, server {}:{}",
            net.ap_ssid, net.server_host, net.server_port
        );

        loop {
            let engine = TransactionEngine::new(&ESP_RX, &mut *cx.local.uart_tx, Delay);
            let mut bring_up = BringUp::new(engine, &mut *cx.local.esp_reset, net);

            let result = bring_up.bring_up_connection().await;
            cx.local.status_tx.try_send(bring_up.link_state()).ok();

            if let Err(e) = result {
                warn!("ESP8266 bring-up failed: {}, retrying in 5 s", e);
                Mono::delay(5.secs()).await;
                continue;
            }

            match bring_up.into_link() {
                Ok(link) => {
                    if let Err(e) = mqtt::run_session(link, &net).await {
                        warn!("MQTT session failed: {}", e);
                    }
                }
                Err(bring_up) => warn!(
                    "Transparent mode not entered (state {})",
                    bring_up.transparent_mode()
                ),
            }

            cx.local.status_tx.try_send(LinkState::Disconnected).ok();
            Mono::delay(5.secs()).await;
        }
    }

    /// RTIC idle task - WFI sleep mode when no tasks active
    #[idle]
    fn idle(_cx: idle::Context) -> ! {
        info!("Idle task started - entering WFI loop");
        loop {
            cortex_m::asm::wfi();
        }
    }
}
