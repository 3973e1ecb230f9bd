//! Boarhound — handheld WiFi reconnaissance firmware.
//!
//! Thin hardware shell around the `boarhound` library: provides the
//! radio, allocator stats, storage, and delays through the platform
//! traits and drives the engines from one main-loop task. Mode
//! switching (passive capture vs. attack) hangs off the front button;
//! everything interesting happens in the library.

#![no_std]
#![no_main]

extern crate alloc;

use esp_backtrace as _;

esp_bootloader_esp_idf::esp_app_desc!();

mod board;

use core::cell::Cell;
use core::sync::atomic::{AtomicU8, Ordering};

use critical_section::Mutex;
use embassy_time::{Duration, Instant, Timer};
use esp_hal::interrupt::software::SoftwareInterruptControl;
use esp_hal::timer::timg::TimerGroup;
use static_cell::StaticCell;

use boarhound::attack::AttackEngine;
use boarhound::capture::CaptureEngine;
use boarhound::heap::HeapMonitor;
use boarhound::platform::{
    CompanionBle, Delay, HeapStats, Radio, RadioError, RxCallback, Storage, StorageError,
};
use boarhound::policy::Tunables;
use boarhound::recon::Scanner;
use boarhound::writer::HashcatPcapSink;

// ── Radio adapter ─────────────────────────────────────────────────────

/// The one installed promiscuous callback. The esp-radio sniffer calls
/// a fixed trampoline which forwards through this slot.
static RX_SLOT: Mutex<Cell<Option<RxCallback>>> = Mutex::new(Cell::new(None));

fn now_ms() -> u32 {
    (Instant::now().as_millis() & 0xFFFF_FFFF) as u32
}

/// esp-radio sniffer callback — runs on the WiFi driver task.
fn sniffer_trampoline(pkt: esp_radio::wifi::sniffer::PromiscuousPkt<'_>) {
    let cb = critical_section::with(|cs| RX_SLOT.borrow(cs).get());
    if let Some(cb) = cb {
        cb(
            pkt.data,
            pkt.rx_cntl.rssi as i8,
            pkt.rx_cntl.channel as u8,
            now_ms(),
        );
    }
}

// FFI bindings for WiFi control not surfaced by the sniffer API.
// The symbols are linked via esp-radio's WiFi driver.
unsafe extern "C" {
    fn esp_wifi_set_channel(primary: u8, second: u32) -> i32;
    fn esp_wifi_disconnect() -> i32;
    fn esp_wifi_80211_tx(ifx: u32, buffer: *const u8, len: i32, en_sys_seq: bool) -> i32;
}

/// `Radio` implementation over the esp-radio sniffer interface.
struct EspRadio {
    sniffer: esp_radio::wifi::sniffer::Sniffer,
    mac: [u8; 6],
}

impl Radio for EspRadio {
    fn set_station_mode(&mut self) {
        // The sniffer interface keeps the driver in STA; nothing to do
        // beyond making sure promiscuous delivery is re-armed later.
    }

    fn disconnect(&mut self) {
        unsafe {
            esp_wifi_disconnect();
        }
    }

    fn set_channel(&mut self, channel: u8) {
        unsafe {
            esp_wifi_set_channel(channel, 0);
        }
    }

    fn set_promiscuous_callback(&mut self, cb: Option<RxCallback>) {
        critical_section::with(|cs| RX_SLOT.borrow(cs).set(cb));
    }

    fn clear_promiscuous_filter(&mut self) {
        // esp-radio's sniffer delivers all frame types by default.
    }

    fn set_promiscuous(&mut self, enabled: bool) {
        if self.sniffer.set_promiscuous_mode(enabled).is_err() {
            log::error!("promiscuous mode switch failed");
        }
    }

    fn transmit_raw(&mut self, frame: &[u8]) -> Result<(), RadioError> {
        let rc = unsafe { esp_wifi_80211_tx(0, frame.as_ptr(), frame.len() as i32, true) };
        if rc == 0 {
            Ok(())
        } else {
            Err(RadioError::TxFailed)
        }
    }

    fn mac(&self) -> [u8; 6] {
        self.mac
    }
}

// ── Heap stats adapter ────────────────────────────────────────────────

struct EspHeapStats;

impl HeapStats for EspHeapStats {
    fn free_bytes(&self) -> usize {
        esp_alloc::HEAP.free()
    }

    fn largest_free_block(&self) -> usize {
        // esp-alloc has no direct largest-block query; the largest
        // per-region free span from its region stats is the real
        // measurement closest to heap_caps_get_largest_free_block.
        // An allocation can still only fail within one region, so
        // this bounds what a single allocation can get.
        let stats = esp_alloc::HEAP.stats();
        stats
            .region_stats
            .iter()
            .flatten()
            .map(|region| region.free)
            .max()
            .unwrap_or(0)
    }
}

// ── BLE adapter ───────────────────────────────────────────────────────

/// Holds the BLE connector so the conditioning cycle has something real
/// to tear down. The companion-sync stack reinitializes it on demand.
struct BleHandle {
    connector: Option<esp_radio::ble::controller::BleConnector<'static>>,
}

impl CompanionBle for BleHandle {
    fn is_initialized(&self) -> bool {
        self.connector.is_some()
    }

    fn is_scanning(&self) -> bool {
        false
    }

    fn is_advertising(&self) -> bool {
        false
    }

    fn stop_scan(&mut self) {}

    fn stop_advertising(&mut self) {}

    fn deinit(&mut self) {
        // Dropping the connector releases the controller buffers.
        self.connector = None;
    }
}

// ── Storage adapter ───────────────────────────────────────────────────

/// Bounded in-RAM staging store for capture files. The SD-backed file
/// server is a separate subsystem that drains this over its own
/// interface; the engines only ever see the `Storage` trait.
struct StagingStorage {
    files: heapless::Vec<(heapless::String<96>, heapless::Vec<u8, 3072>), 8>,
}

impl StagingStorage {
    const fn new() -> Self {
        Self {
            files: heapless::Vec::new(),
        }
    }
}

impl Storage for StagingStorage {
    fn exists(&mut self, path: &str) -> bool {
        self.files.iter().any(|(p, _)| p.as_str() == path)
    }

    fn ensure_dir(&mut self, _path: &str) -> Result<(), StorageError> {
        Ok(())
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut content = heapless::Vec::new();
        content
            .extend_from_slice(data)
            .map_err(|_| StorageError::WriteFailed)?;
        if let Some((_, existing)) = self.files.iter_mut().find(|(p, _)| p.as_str() == path) {
            *existing = content;
            return Ok(());
        }
        let mut name = heapless::String::new();
        name.push_str(path).map_err(|_| StorageError::WriteFailed)?;
        self.files
            .push((name, content))
            .map_err(|_| StorageError::WriteFailed)?;
        Ok(())
    }

    fn append(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        if let Some((_, existing)) = self.files.iter_mut().find(|(p, _)| p.as_str() == path) {
            existing
                .extend_from_slice(data)
                .map_err(|_| StorageError::WriteFailed)?;
            return Ok(());
        }
        self.write(path, data)
    }

    fn read(&mut self, path: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        let (_, data) = self
            .files
            .iter()
            .find(|(p, _)| p.as_str() == path)
            .ok_or(StorageError::ReadFailed)?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }
}

// ── Delay adapter ─────────────────────────────────────────────────────

struct BlockingDelay;

impl Delay for BlockingDelay {
    fn delay_ms(&mut self, ms: u32) {
        embassy_time::block_for(Duration::from_millis(ms as u64));
    }
}

// ── Mode switching ────────────────────────────────────────────────────

const MODE_CAPTURE: u8 = 0;
const MODE_ATTACK: u8 = 1;

/// Requested engine mode; flipped by the button task.
static MODE: AtomicU8 = AtomicU8::new(MODE_CAPTURE);

#[embassy_executor::task]
async fn button_task(button: esp_hal::gpio::Input<'static>) {
    loop {
        // Active-low press toggles the mode
        while button.is_high() {
            Timer::after(Duration::from_millis(20)).await;
        }
        let next = if MODE.load(Ordering::Relaxed) == MODE_CAPTURE {
            MODE_ATTACK
        } else {
            MODE_CAPTURE
        };
        MODE.store(next, Ordering::Relaxed);
        log::info!(
            "mode switch requested: {}",
            if next == MODE_ATTACK { "attack" } else { "capture" }
        );
        // Debounce + wait for release
        Timer::after(Duration::from_millis(50)).await;
        while button.is_low() {
            Timer::after(Duration::from_millis(20)).await;
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────

#[esp_rtos::main]
async fn main(spawner: embassy_executor::Spawner) {
    esp_println::logger::init_logger_from_env();

    let peripherals = esp_hal::init(esp_hal::Config::default());

    esp_alloc::heap_allocator!(size: board::HEAP_SIZE);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_int = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, sw_int.software_interrupt0);

    log::info!("boarhound starting on {}", board::BOARD_NAME);

    // Hold power on (M5StickC Plus2 needs GPIO4 HIGH to stay powered)
    #[cfg(feature = "m5stickc")]
    let _power_hold = esp_hal::gpio::Output::new(
        peripherals.GPIO4,
        esp_hal::gpio::Level::High,
        esp_hal::gpio::OutputConfig::default(),
    );

    // BLE connector held for the companion link; the conditioning cycle
    // tears it down when contiguous heap runs short
    let connector =
        esp_radio::ble::controller::BleConnector::new(peripherals.BT, Default::default())
            .expect("BLE connector init failed");
    let mut ble = BleHandle {
        connector: Some(connector),
    };

    // Keep the controller alive for the life of the program — dropping
    // it would deinit the driver
    let (_wifi_controller, wifi_interfaces) =
        esp_radio::wifi::new(peripherals.WIFI, Default::default()).expect("WiFi init failed");

    let mut sniffer = wifi_interfaces.sniffer;
    sniffer.set_receive_cb(sniffer_trampoline);

    let mac = esp_hal::efuse::Efuse::mac_address();
    let mut radio = EspRadio { sniffer, mac };

    #[cfg(feature = "m5stickc")]
    let button = esp_hal::gpio::Input::new(
        peripherals.GPIO37,
        esp_hal::gpio::InputConfig::default(),
    );
    #[cfg(not(feature = "m5stickc"))]
    let button = esp_hal::gpio::Input::new(
        peripherals.GPIO0,
        esp_hal::gpio::InputConfig::default().with_pull(esp_hal::gpio::Pull::Up),
    );
    spawner.spawn(button_task(button)).unwrap();

    // ── Engine wiring ───────────────────────────────────────────────

    static STORAGE: StaticCell<StagingStorage> = StaticCell::new();
    let storage = STORAGE.init(StagingStorage::new());

    let tunables = load_tunables(storage);
    let mut monitor = HeapMonitor::new(tunables);
    monitor.load_previous_session(storage);

    static SINK: StaticCell<HashcatPcapSink<StagingStorage>> = StaticCell::new();
    let sink = SINK.init(HashcatPcapSink::new(StagingStorage::new()));

    static SCANNER: StaticCell<Scanner> = StaticCell::new();
    let scanner = SCANNER.init(Scanner::new());

    // The engines carry their capture buffers inline — keep them off
    // the task stack
    static CAPTURE: StaticCell<CaptureEngine> = StaticCell::new();
    let capture = CAPTURE.init(CaptureEngine::new());
    static ATTACK: StaticCell<AttackEngine> = StaticCell::new();
    let attack = ATTACK.init(AttackEngine::new(tunables));

    let heap_stats = EspHeapStats;
    let mut delay = BlockingDelay;

    let mut active_mode = MODE_CAPTURE;
    capture.start(scanner, &mut radio, now_ms());
    log::info!("passive capture engine running");

    // ── Main loop: engine updates, hop tick, heap governance ────────

    loop {
        let now = now_ms();

        monitor.update(&heap_stats, now);
        let _ = monitor.persist_watermarks(storage, now);

        if monitor.consume_condition_request() {
            // Stop the air interface, run the conditioning cycle, bring
            // the active engine back up
            match active_mode {
                MODE_ATTACK => attack.stop(scanner, &mut radio, sink, &mut delay, now),
                _ => capture.stop(scanner, &mut radio, sink, &mut delay, now),
            }
            scanner.stop(&mut radio);
            let largest =
                monitor.condition_heap(&mut radio, &mut ble, &heap_stats, &mut delay, now_ms());
            log::info!("conditioning finished, largest={}", largest);
            let now = now_ms();
            match active_mode {
                MODE_ATTACK => attack.start(scanner, &mut radio, storage, now),
                _ => capture.start(scanner, &mut radio, now),
            }
        }

        let requested = MODE.load(Ordering::Relaxed);
        if requested != active_mode {
            let now = now_ms();
            match active_mode {
                MODE_ATTACK => attack.stop(scanner, &mut radio, sink, &mut delay, now),
                _ => capture.stop(scanner, &mut radio, sink, &mut delay, now),
            }
            match requested {
                MODE_ATTACK => {
                    attack.start(scanner, &mut radio, storage, now);
                    log::info!("attack engine running");
                }
                _ => {
                    capture.start(scanner, &mut radio, now);
                    log::info!("passive capture engine running");
                }
            }
            active_mode = requested;
        }

        scanner.update(&mut radio, now);
        match active_mode {
            MODE_ATTACK => attack.update(scanner, &mut radio, sink, &mut delay, now),
            _ => capture.update(scanner, &mut radio, sink, &mut delay, now),
        }

        Timer::after(Duration::from_millis(20)).await;
    }
}

/// Tunables override from the config file, defaults otherwise.
fn load_tunables(storage: &mut StagingStorage) -> Tunables {
    let mut buf = [0u8; 1024];
    match storage.read("/boarhound/config/tunables.json", &mut buf) {
        Ok(n) => Tunables::from_json(&buf[..n]).unwrap_or_else(|| {
            log::warn!("tunables file malformed, using defaults");
            Tunables::default()
        }),
        Err(_) => Tunables::default(),
    }
}
