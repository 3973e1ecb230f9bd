//! Shared test scaffolding: scripted platform fakes and synthetic frame
//! builders. Test-only — the library proper never touches this.

use core::cell::Cell;
use std::sync::{Mutex, MutexGuard};
use std::vec::Vec as StdVec;

use crate::platform::{
    CompanionBle, Delay, HeapStats, Radio, RadioError, RxCallback, Storage, StorageError,
};

/// Serializes tests that touch process-wide state (cached heap atomics,
/// the scanner table, the capture deferral rings).
pub fn serial() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Heap fake ─────────────────────────────────────────────────────────

enum HeapScript {
    Fixed,
    /// Largest grows per query (driver churn), free follows — models the
    /// conditioning cycle against a coalescing allocator.
    Conditioning,
}

pub struct FakeHeap {
    free: Cell<usize>,
    largest: Cell<usize>,
    script: HeapScript,
}

impl FakeHeap {
    pub fn fixed(free: usize, largest: usize) -> Self {
        Self {
            free: Cell::new(free),
            largest: Cell::new(largest),
            script: HeapScript::Fixed,
        }
    }

    pub fn conditioning_script(free: usize, largest: usize) -> Self {
        Self {
            free: Cell::new(free),
            largest: Cell::new(largest),
            script: HeapScript::Conditioning,
        }
    }

    pub fn set(&self, free: usize, largest: usize) {
        self.free.set(free);
        self.largest.set(largest);
    }
}

impl HeapStats for FakeHeap {
    fn free_bytes(&self) -> usize {
        if let HeapScript::Conditioning = self.script {
            let v = (self.free.get() + 2_000).min(95_000);
            self.free.set(v);
        }
        self.free.get()
    }

    fn largest_free_block(&self) -> usize {
        if let HeapScript::Conditioning = self.script {
            let v = (self.largest.get() + 3_000).min(55_000);
            self.largest.set(v);
        }
        self.largest.get()
    }
}

// ── Radio fake ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioOp {
    SetStationMode,
    Disconnect,
    SetChannel(u8),
    SetCallback(bool),
    ClearFilter,
    SetPromiscuous(bool),
    Tx(usize),
}

pub struct FakeRadio {
    ops: StdVec<RadioOp>,
    transmitted: StdVec<StdVec<u8>>,
    callback: Option<RxCallback>,
    promiscuous: bool,
    sta: bool,
    channel: u8,
    pub fail_tx: bool,
    mac: [u8; 6],
}

impl FakeRadio {
    pub fn new() -> Self {
        Self {
            ops: StdVec::new(),
            transmitted: StdVec::new(),
            callback: None,
            promiscuous: false,
            sta: false,
            channel: 1,
            fail_tx: false,
            mac: [0x02, 0xB0, 0xA9, 0x00, 0x00, 0x01],
        }
    }

    pub fn ops(&self) -> &[RadioOp] {
        &self.ops
    }

    pub fn transmitted(&self) -> &[StdVec<u8>] {
        &self.transmitted
    }

    pub fn callback_installed(&self) -> Option<RxCallback> {
        self.callback
    }

    pub fn promiscuous_enabled(&self) -> bool {
        self.promiscuous
    }

    pub fn sta_mode(&self) -> bool {
        self.sta
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn clear_log(&mut self) {
        self.ops.clear();
        self.transmitted.clear();
    }
}

impl Radio for FakeRadio {
    fn set_station_mode(&mut self) {
        self.sta = true;
        self.ops.push(RadioOp::SetStationMode);
    }

    fn disconnect(&mut self) {
        self.ops.push(RadioOp::Disconnect);
    }

    fn set_channel(&mut self, channel: u8) {
        self.channel = channel;
        self.ops.push(RadioOp::SetChannel(channel));
    }

    fn set_promiscuous_callback(&mut self, cb: Option<RxCallback>) {
        self.callback = cb;
        self.ops.push(RadioOp::SetCallback(cb.is_some()));
    }

    fn clear_promiscuous_filter(&mut self) {
        self.ops.push(RadioOp::ClearFilter);
    }

    fn set_promiscuous(&mut self, enabled: bool) {
        self.promiscuous = enabled;
        self.ops.push(RadioOp::SetPromiscuous(enabled));
    }

    fn transmit_raw(&mut self, frame: &[u8]) -> Result<(), RadioError> {
        if self.fail_tx {
            return Err(RadioError::TxFailed);
        }
        self.ops.push(RadioOp::Tx(frame.len()));
        self.transmitted.push(frame.to_vec());
        Ok(())
    }

    fn mac(&self) -> [u8; 6] {
        self.mac
    }
}

// ── BLE fake ──────────────────────────────────────────────────────────

pub struct FakeBle {
    initialized: bool,
    scanning: bool,
    advertising: bool,
    deinit_called: bool,
}

impl FakeBle {
    pub fn initialized() -> Self {
        Self {
            initialized: true,
            scanning: true,
            advertising: true,
            deinit_called: false,
        }
    }

    pub fn absent() -> Self {
        Self {
            initialized: false,
            scanning: false,
            advertising: false,
            deinit_called: false,
        }
    }

    pub fn deinit_called(&self) -> bool {
        self.deinit_called
    }
}

impl CompanionBle for FakeBle {
    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn is_scanning(&self) -> bool {
        self.scanning
    }

    fn is_advertising(&self) -> bool {
        self.advertising
    }

    fn stop_scan(&mut self) {
        self.scanning = false;
    }

    fn stop_advertising(&mut self) {
        self.advertising = false;
    }

    fn deinit(&mut self) {
        self.initialized = false;
        self.deinit_called = true;
    }
}

// ── Delay fake ────────────────────────────────────────────────────────

pub struct NoDelay {
    total_ms: u32,
}

impl NoDelay {
    pub fn new() -> Self {
        Self { total_ms: 0 }
    }

    pub fn total_ms(&self) -> u32 {
        self.total_ms
    }
}

impl Delay for NoDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.total_ms += ms;
    }
}

// ── Storage fake ──────────────────────────────────────────────────────

pub struct MemStorage {
    files: std::collections::HashMap<std::string::String, StdVec<u8>>,
    dirs: std::collections::HashSet<std::string::String>,
    writes: usize,
    pub fail_writes: bool,
}

impl MemStorage {
    pub fn new() -> Self {
        Self {
            files: Default::default(),
            dirs: Default::default(),
            writes: 0,
            fail_writes: false,
        }
    }

    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(|v| v.as_slice())
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn write_count(&self) -> usize {
        self.writes
    }

    pub fn insert(&mut self, path: &str, data: &[u8]) {
        self.files.insert(path.into(), data.to_vec());
    }
}

impl Storage for MemStorage {
    fn exists(&mut self, path: &str) -> bool {
        self.files.contains_key(path) || self.dirs.contains(path)
    }

    fn ensure_dir(&mut self, path: &str) -> Result<(), StorageError> {
        self.dirs.insert(path.into());
        Ok(())
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::WriteFailed);
        }
        self.writes += 1;
        self.files.insert(path.into(), data.to_vec());
        Ok(())
    }

    fn append(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::WriteFailed);
        }
        self.writes += 1;
        self.files.entry(path.into()).or_default().extend_from_slice(data);
        Ok(())
    }

    fn read(&mut self, path: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        let data = self.files.get(path).ok_or(StorageError::ReadFailed)?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }
}

// ── Frame builders ────────────────────────────────────────────────────

pub type FrameBuf = heapless::Vec<u8, 512>;

pub struct BeaconOpts<'a> {
    pub bssid: [u8; 6],
    pub ssid: &'a str,
    pub channel: Option<u8>,
    pub privacy: bool,
    /// (psk, sae, mfpr) — presence adds an RSN IE.
    pub rsn: Option<(bool, bool, bool)>,
    pub wpa1: bool,
    pub interval_tu: u16,
    /// Subtype 0x08 beacon (default) or 0x05 probe response.
    pub probe_resp: bool,
}

impl Default for BeaconOpts<'_> {
    fn default() -> Self {
        Self {
            bssid: [0; 6],
            ssid: "",
            channel: None,
            privacy: false,
            rsn: None,
            wpa1: false,
            interval_tu: 100,
            probe_resp: false,
        }
    }
}

/// Build a minimal valid beacon / probe response:
/// header(24) + timestamp(8) + interval(2) + capability(2) + IEs.
pub fn make_beacon(opts: &BeaconOpts) -> FrameBuf {
    let mut f = FrameBuf::new();
    let push = |f: &mut FrameBuf, b: u8| {
        let _ = f.push(b);
    };
    // Frame control
    push(&mut f, if opts.probe_resp { 0x50 } else { 0x80 });
    push(&mut f, 0x00);
    // Duration
    push(&mut f, 0x00);
    push(&mut f, 0x00);
    // Addr1: broadcast
    for _ in 0..6 {
        push(&mut f, 0xFF);
    }
    // Addr2 / Addr3: BSSID
    for &b in &opts.bssid {
        push(&mut f, b);
    }
    for &b in &opts.bssid {
        push(&mut f, b);
    }
    // Sequence control
    push(&mut f, 0x00);
    push(&mut f, 0x00);
    // Timestamp
    for _ in 0..8 {
        push(&mut f, 0x00);
    }
    // Beacon interval
    let _ = f.extend_from_slice(&opts.interval_tu.to_le_bytes());
    // Capability: ESS + optional privacy
    let cap: u16 = 0x0001 | if opts.privacy { 0x0010 } else { 0 };
    let _ = f.extend_from_slice(&cap.to_le_bytes());
    // SSID IE
    push(&mut f, 0x00);
    push(&mut f, opts.ssid.len() as u8);
    let _ = f.extend_from_slice(opts.ssid.as_bytes());
    // Supported rates — every real beacon carries one
    let _ = f.extend_from_slice(&[0x01, 0x08, 0x82, 0x84, 0x8B, 0x96, 0x24, 0x30, 0x48, 0x6C]);
    // DS Parameter Set
    if let Some(ch) = opts.channel {
        let _ = f.extend_from_slice(&[0x03, 0x01, ch]);
    }
    // WPA1 vendor IE
    if opts.wpa1 {
        let _ = f.extend_from_slice(&[0xDD, 0x06, 0x00, 0x50, 0xF2, 0x01, 0x01, 0x00]);
    }
    // RSN IE
    if let Some((psk, sae, mfpr)) = opts.rsn {
        let mut akms: heapless::Vec<u8, 8> = heapless::Vec::new();
        if psk {
            let _ = akms.extend_from_slice(&[0x00, 0x0F, 0xAC, 0x02]);
        }
        if sae {
            let _ = akms.extend_from_slice(&[0x00, 0x0F, 0xAC, 0x08]);
        }
        let akm_count = (akms.len() / 4) as u8;
        let body_len = 2 + 4 + 2 + 4 + 2 + akms.len() + 2;
        push(&mut f, 48);
        push(&mut f, body_len as u8);
        // Version
        let _ = f.extend_from_slice(&[0x01, 0x00]);
        // Group cipher: CCMP
        let _ = f.extend_from_slice(&[0x00, 0x0F, 0xAC, 0x04]);
        // Pairwise: one suite, CCMP
        let _ = f.extend_from_slice(&[0x01, 0x00, 0x00, 0x0F, 0xAC, 0x04]);
        // AKM list
        let _ = f.extend_from_slice(&[akm_count, 0x00]);
        let _ = f.extend_from_slice(&akms);
        // Capabilities
        let caps: u16 = if mfpr { 0x00C0 } else { 0x0000 };
        let _ = f.extend_from_slice(&caps.to_le_bytes());
    }
    f
}

pub struct EapolOpts {
    pub ap: [u8; 6],
    pub station: [u8; 6],
    /// Message number 1..=4.
    pub message: u8,
    pub qos: bool,
    pub pmkid: Option<[u8; 16]>,
    /// EAPOL-Key descriptor type; 0x02 = RSN, 0xFE = WPA1.
    pub descriptor: u8,
    pub anonce: [u8; 32],
    pub mic: [u8; 16],
}

impl Default for EapolOpts {
    fn default() -> Self {
        Self {
            ap: [0; 6],
            station: [0; 6],
            message: 1,
            qos: false,
            pmkid: None,
            descriptor: 0x02,
            anonce: [0xA0; 32],
            mic: [0x00; 16],
        }
    }
}

/// Build an 802.11 data frame carrying an EAPOL-Key message.
pub fn make_eapol_frame(opts: &EapolOpts) -> FrameBuf {
    let mut f = FrameBuf::new();
    let from_ap = opts.message == 1 || opts.message == 3;

    // Frame control: data (QoS data when requested) + DS bits
    let _ = f.push(if opts.qos { 0x88 } else { 0x08 });
    let _ = f.push(if from_ap { 0x02 } else { 0x01 });
    // Duration
    let _ = f.extend_from_slice(&[0x00, 0x00]);
    // Addressing: AP→station is From-DS (a1=dst, a2=bssid);
    // station→AP is To-DS (a1=bssid, a2=src)
    let (a1, a2) = if from_ap {
        (opts.station, opts.ap)
    } else {
        (opts.ap, opts.station)
    };
    let _ = f.extend_from_slice(&a1);
    let _ = f.extend_from_slice(&a2);
    let _ = f.extend_from_slice(&opts.ap);
    // Sequence control
    let _ = f.extend_from_slice(&[0x00, 0x00]);
    if opts.qos {
        let _ = f.extend_from_slice(&[0x00, 0x00]);
    }
    // LLC/SNAP
    let _ = f.extend_from_slice(&crate::frame::LLC_SNAP_EAPOL);

    // EAPOL-Key payload
    let key_data: heapless::Vec<u8, 64> = match opts.pmkid {
        Some(pmkid) => {
            let mut kd = heapless::Vec::new();
            let _ = kd.extend_from_slice(&crate::frame::PMKID_KDE_PREFIX);
            let _ = kd.extend_from_slice(&pmkid);
            kd
        }
        None => heapless::Vec::new(),
    };

    let key_info: u16 = match opts.message {
        1 => 0x008A,
        2 => 0x010A,
        3 => 0x13CA,
        _ => 0x030A,
    };

    let eapol_body_len = 95 + key_data.len();
    // version, type=Key, length
    let _ = f.push(0x02);
    let _ = f.push(0x03);
    let _ = f.extend_from_slice(&(eapol_body_len as u16).to_be_bytes());
    // descriptor type
    let _ = f.push(opts.descriptor);
    // key_info, key_length
    let _ = f.extend_from_slice(&key_info.to_be_bytes());
    let _ = f.extend_from_slice(&[0x00, 0x10]);
    // replay counter
    let _ = f.extend_from_slice(&[0u8; 8]);
    // nonce
    let _ = f.extend_from_slice(&opts.anonce);
    // key IV, RSC, key ID
    let _ = f.extend_from_slice(&[0u8; 16]);
    let _ = f.extend_from_slice(&[0u8; 8]);
    let _ = f.extend_from_slice(&[0u8; 8]);
    // MIC
    let _ = f.extend_from_slice(&opts.mic);
    // key data
    let _ = f.extend_from_slice(&(key_data.len() as u16).to_be_bytes());
    let _ = f.extend_from_slice(&key_data);
    f
}

/// Plain (non-EAPOL) data frame from `src` to the AP — client traffic.
pub fn make_data_frame(bssid: &[u8; 6], src: &[u8; 6]) -> FrameBuf {
    let mut f = FrameBuf::new();
    let _ = f.push(0x08);
    let _ = f.push(0x01); // To-DS
    let _ = f.extend_from_slice(&[0x00, 0x00]);
    let _ = f.extend_from_slice(bssid);
    let _ = f.extend_from_slice(src);
    let _ = f.extend_from_slice(bssid);
    let _ = f.extend_from_slice(&[0x00, 0x00]);
    // LLC/SNAP for IPv4 — arbitrary payload
    let _ = f.extend_from_slice(&[0xAA, 0xAA, 0x03, 0x00, 0x00, 0x00, 0x08, 0x00]);
    let _ = f.extend_from_slice(&[0u8; 16]);
    f
}
