//! Platform seams — the narrow interfaces the engines consume.
//!
//! The library never touches a vendor driver directly. The firmware
//! binary implements these against esp-radio / esp-alloc / the SD
//! card; host tests implement them with scripted fakes. Everything the
//! core needs from the outside world is enumerated here.

/// Raw promiscuous-mode receive callback.
///
/// Runs on the radio driver's internal task (T_rx) and preempts the main
/// loop. Plain function pointer, no captured state: implementations must
/// not allocate, log, or block.
pub type RxCallback = fn(frame: &[u8], rssi: i8, channel: u8, now_ms: u32);

/// Errors surfaced by the radio driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioError {
    /// Driver refused the operation (wrong mode, not started).
    Driver,
    /// Raw transmit failed (queue full, invalid frame).
    TxFailed,
}

/// The vendor WiFi driver, reduced to the operations the core uses.
///
/// One process-wide instance; the channel scanner owns it and nobody
/// else calls it directly (the conditioning cycle borrows it while the
/// scanner is stopped).
pub trait Radio {
    fn set_station_mode(&mut self);
    fn disconnect(&mut self);
    fn set_channel(&mut self, channel: u8);
    /// Install or clear the one promiscuous callback slot.
    fn set_promiscuous_callback(&mut self, cb: Option<RxCallback>);
    /// Clear any subtype filter so every frame reaches the callback.
    fn clear_promiscuous_filter(&mut self);
    fn set_promiscuous(&mut self, enabled: bool);
    /// Transmit a raw 802.11 frame on the current channel.
    fn transmit_raw(&mut self, frame: &[u8]) -> Result<(), RadioError>;
    fn mac(&self) -> [u8; 6];
}

/// The companion BLE stack, as seen by the conditioning cycle: something
/// that may be holding 20–30 KB of buffers and knows how to let go.
pub trait CompanionBle {
    fn is_initialized(&self) -> bool;
    fn is_scanning(&self) -> bool;
    fn is_advertising(&self) -> bool;
    fn stop_scan(&mut self);
    fn stop_advertising(&mut self);
    /// Full teardown — a mere stop leaves the buffers allocated.
    fn deinit(&mut self);
}

/// Allocator statistics. Pure queries, callable from T_main only; the
/// heap monitor republishes them through atomics for everyone else.
pub trait HeapStats {
    fn free_bytes(&self) -> usize;
    fn largest_free_block(&self) -> usize;
}

/// Blocking millisecond delay. Legal on T_main and inside the
/// conditioning cycle, nowhere else.
pub trait Delay {
    fn delay_ms(&mut self, ms: u32);
}

/// Storage failures. The save path treats all of these as transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Medium missing or not mounted.
    Unavailable,
    /// Write or create failed.
    WriteFailed,
    /// Read failed or destination buffer too small.
    ReadFailed,
}

/// Filesystem-agnostic byte storage (SD card on the device).
///
/// Only T_main calls these; the scanner is paused around writes to keep
/// the radio driver and the SD card off the SPI bus at the same time.
pub trait Storage {
    fn exists(&mut self, path: &str) -> bool;
    fn ensure_dir(&mut self, path: &str) -> Result<(), StorageError>;
    /// Create or truncate `path` and write `data`.
    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError>;
    /// Append `data` to `path`, creating it if absent.
    fn append(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError>;
    /// Read up to `buf.len()` bytes; returns the byte count.
    fn read(&mut self, path: &str, buf: &mut [u8]) -> Result<usize, StorageError>;
}
