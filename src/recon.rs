//! Channel scanner — owns the radio's promiscuous slot and the shared
//! network table.
//!
//! One scanner exists per process. The table and the callback slots are
//! statics guarded by critical sections because the radio callback
//! (T_rx) writes them while the main thread iterates; the [`Scanner`]
//! handle holds the main-thread-only state (hop schedule, cleanup
//! timers) and is the only thing that touches the driver.
//!
//! Engines subscribe through the single packet-callback slot and must
//! never touch the driver directly.

use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use critical_section::Mutex;
use heapless::Vec;

use crate::frame::{self, AuthMode, Ssid};
use crate::heap::{self, PressureLevel};
use crate::platform::{Radio, RxCallback};
use crate::policy;

/// Signal-strength smoothing factor for the per-network EMA.
const RSSI_EMA_ALPHA: f32 = 0.30;
/// Beacon cadence deltas outside this window are hop artifacts, not
/// cadence samples.
const INTERVAL_SAMPLE_MIN_MS: u32 = 20;
const INTERVAL_SAMPLE_MAX_MS: u32 = 2_000;

/// One observed access point.
#[derive(Debug, Clone)]
pub struct DetectedNetwork {
    pub bssid: [u8; 6],
    pub ssid: Ssid,
    pub hidden: bool,
    pub channel: u8,
    pub rssi: i8,
    /// Smoothed signal for scoring — raw RSSI jumps around.
    pub rssi_ema: f32,
    pub auth: AuthMode,
    pub pmf_required: bool,
    pub first_seen: u32,
    pub last_seen: u32,
    /// Last data frame involving this BSSID — the client-liveness signal.
    pub last_data_seen: u32,
    pub beacon_count: u32,
    /// Observed beacon cadence EMA in milliseconds (0 until sampled).
    pub beacon_interval_ema_ms: f32,
    /// Data frames seen, saturating — feeds the client estimate.
    pub data_frames: u16,
    pub attack_attempts: u8,
    pub cooldown_until: u32,
    pub has_handshake: bool,
}

impl DetectedNetwork {
    fn from_beacon(info: &frame::BeaconInfo, rssi: i8, channel: u8, now_ms: u32) -> Self {
        Self {
            bssid: info.bssid,
            ssid: info.ssid.clone(),
            hidden: info.hidden,
            channel: info.channel.unwrap_or(channel),
            rssi,
            rssi_ema: rssi as f32,
            auth: info.auth,
            pmf_required: info.pmf_required,
            first_seen: now_ms,
            last_seen: now_ms,
            last_data_seen: 0,
            beacon_count: 1,
            beacon_interval_ema_ms: 0.0,
            data_frames: 0,
            attack_attempts: 0,
            cooldown_until: 0,
            has_handshake: false,
        }
    }
}

/// Advisory hook fired when a network is first admitted to the table.
/// Runs in the radio-callback context: no allocation, no blocking.
pub type NewNetworkCallback = fn(auth: AuthMode, hidden: bool, rssi: i8, channel: u8);

// ── Shared state ──────────────────────────────────────────────────────

pub type NetworkTable = Vec<DetectedNetwork, { policy::MAX_NETWORKS }>;

static NETWORKS: Mutex<RefCell<NetworkTable>> = Mutex::new(RefCell::new(Vec::new()));
static PACKET_CB: Mutex<Cell<Option<RxCallback>>> = Mutex::new(Cell::new(None));
static NEW_NETWORK_CB: Mutex<Cell<Option<NewNetworkCallback>>> = Mutex::new(Cell::new(None));
/// BSSID the cleanup sweep must never evict (the active attack target).
static PROTECTED_BSSID: Mutex<Cell<Option<[u8; 6]>>> = Mutex::new(Cell::new(None));

static RUNNING: AtomicBool = AtomicBool::new(false);
static PAUSED: AtomicBool = AtomicBool::new(false);
static CHANNEL_LOCKED: AtomicBool = AtomicBool::new(false);
static CURRENT_CHANNEL: AtomicU8 = AtomicU8::new(policy::CHANNEL_ORDER[0]);
static HOP_INTERVAL_MS: AtomicU32 = AtomicU32::new(policy::DEFAULT_HOP_INTERVAL_MS);
static PACKET_COUNT: AtomicU32 = AtomicU32::new(0);

pub fn is_running() -> bool {
    RUNNING.load(Ordering::Acquire)
}

pub fn is_paused() -> bool {
    PAUSED.load(Ordering::Acquire)
}

pub fn is_channel_locked() -> bool {
    CHANNEL_LOCKED.load(Ordering::Relaxed)
}

pub fn current_channel() -> u8 {
    CURRENT_CHANNEL.load(Ordering::Relaxed)
}

pub fn hop_interval_ms() -> u32 {
    HOP_INTERVAL_MS.load(Ordering::Relaxed)
}

pub fn packet_count() -> u32 {
    PACKET_COUNT.load(Ordering::Relaxed)
}

/// Position of a channel in the hop order.
pub fn channel_index(channel: u8) -> Option<usize> {
    policy::CHANNEL_ORDER.iter().position(|&c| c == channel)
}

/// Install (or replace) the one engine packet-callback slot.
pub fn set_packet_callback(cb: Option<RxCallback>) {
    critical_section::with(|cs| PACKET_CB.borrow(cs).set(cb));
}

pub fn set_new_network_callback(cb: Option<NewNetworkCallback>) {
    critical_section::with(|cs| NEW_NETWORK_CB.borrow(cs).set(cb));
}

/// Shield a BSSID from stale cleanup and emergency eviction.
pub fn set_protected_bssid(bssid: Option<[u8; 6]>) {
    critical_section::with(|cs| PROTECTED_BSSID.borrow(cs).set(bssid));
}

/// Run `f` with the table under the critical section. Keep it short: no
/// allocation, no I/O, no logging inside.
pub fn with_networks<R>(f: impl FnOnce(&mut NetworkTable) -> R) -> R {
    critical_section::with(|cs| f(&mut NETWORKS.borrow_ref_mut(cs)))
}

/// Thread-safe index lookup by BSSID.
pub fn find_network_index(bssid: &[u8; 6]) -> Option<usize> {
    with_networks(|nets| nets.iter().position(|n| &n.bssid == bssid))
}

pub fn network_count() -> usize {
    with_networks(|nets| nets.len())
}

/// Rough station count from data-frame pressure on the BSSID.
pub fn estimate_client_count(net: &DetectedNetwork, now_ms: u32) -> u8 {
    if net.last_data_seen == 0
        || now_ms.wrapping_sub(net.last_data_seen) > policy::CLIENT_FRESH_MS
    {
        return 0;
    }
    (1 + net.data_frames / 20).min(4) as u8
}

// ── T_rx entry point ──────────────────────────────────────────────────

/// Radio-callback entry. Classifies the frame, updates the shared table
/// under the critical section (fixed-capacity writes only — no
/// allocation), and forwards to the subscribed engine.
pub fn on_promiscuous_frame(frame_data: &[u8], rssi: i8, channel: u8, now_ms: u32) {
    if !RUNNING.load(Ordering::Acquire) || PAUSED.load(Ordering::Acquire) {
        return;
    }
    if frame_data.len() < 16 {
        return;
    }
    PACKET_COUNT.fetch_add(1, Ordering::Relaxed);

    if frame::is_mgmt(frame_data) {
        let st = frame::subtype(frame_data);
        if st == frame::SUBTYPE_BEACON || st == frame::SUBTYPE_PROBE_RESP {
            if let Some(info) = frame::parse_beacon(frame_data) {
                upsert_network(&info, rssi, channel, now_ms);
            }
        }
    } else if frame::is_data(frame_data) {
        if let Some(addrs) = frame::data_addrs(frame_data) {
            note_data_frame(&addrs.bssid, now_ms);
        }
    }

    let cb = critical_section::with(|cs| PACKET_CB.borrow(cs).get());
    if let Some(cb) = cb {
        cb(frame_data, rssi, channel, now_ms);
    }
}

fn upsert_network(info: &frame::BeaconInfo, rssi: i8, rx_channel: u8, now_ms: u32) {
    let mut admitted = false;
    critical_section::with(|cs| {
        let mut nets = NETWORKS.borrow_ref_mut(cs);
        if let Some(net) = nets.iter_mut().find(|n| n.bssid == info.bssid) {
            let delta = now_ms.wrapping_sub(net.last_seen);
            if (INTERVAL_SAMPLE_MIN_MS..=INTERVAL_SAMPLE_MAX_MS).contains(&delta) {
                net.beacon_interval_ema_ms = if net.beacon_interval_ema_ms == 0.0 {
                    delta as f32
                } else {
                    net.beacon_interval_ema_ms + 0.2 * (delta as f32 - net.beacon_interval_ema_ms)
                };
            }
            net.rssi = rssi;
            net.rssi_ema += RSSI_EMA_ALPHA * (rssi as f32 - net.rssi_ema);
            net.last_seen = now_ms;
            net.beacon_count = net.beacon_count.saturating_add(1);
            net.channel = info.channel.unwrap_or(rx_channel);
            net.auth = info.auth;
            net.pmf_required = info.pmf_required;
            // Probe responses reveal hidden SSIDs
            if net.hidden && !info.hidden {
                net.ssid = info.ssid.clone();
                net.hidden = false;
            }
            return;
        }

        // New network admission: signal floor, heap floor, pressure
        if rssi < policy::NETWORK_MIN_RSSI {
            return;
        }
        if heap::cached_free() < policy::MIN_HEAP_FOR_NETWORK_ADD {
            return;
        }
        if heap::pressure_level() >= PressureLevel::Critical {
            return;
        }
        if nets
            .push(DetectedNetwork::from_beacon(info, rssi, rx_channel, now_ms))
            .is_ok()
        {
            admitted = true;
        }
    });

    if admitted {
        let cb = critical_section::with(|cs| NEW_NETWORK_CB.borrow(cs).get());
        if let Some(cb) = cb {
            cb(
                info.auth,
                info.hidden,
                rssi,
                info.channel.unwrap_or(rx_channel),
            );
        }
    }
}

fn note_data_frame(bssid: &[u8; 6], now_ms: u32) {
    critical_section::with(|cs| {
        let mut nets = NETWORKS.borrow_ref_mut(cs);
        if let Some(net) = nets.iter_mut().find(|n| &n.bssid == bssid) {
            net.last_data_seen = now_ms;
            net.data_frames = net.data_frames.saturating_add(1);
        }
    });
}

// ── Main-thread handle ────────────────────────────────────────────────

/// Main-thread scanner state: hop schedule and cleanup timers. All
/// driver access goes through here.
pub struct Scanner {
    hop_index: usize,
    last_hop_ms: u32,
    last_cleanup_ms: u32,
}

impl Scanner {
    pub const fn new() -> Self {
        Self {
            hop_index: 0,
            last_hop_ms: 0,
            last_cleanup_ms: 0,
        }
    }

    /// Claim the radio: STA mode, promiscuous on, callback installed.
    pub fn start(&mut self, radio: &mut impl Radio, now_ms: u32) {
        if is_running() {
            return;
        }
        log::info!("recon: starting promiscuous scan");
        radio.set_station_mode();
        radio.disconnect();
        radio.set_promiscuous_callback(Some(on_promiscuous_frame));
        radio.clear_promiscuous_filter();
        radio.set_promiscuous(true);

        self.hop_index = 0;
        self.last_hop_ms = now_ms;
        self.last_cleanup_ms = now_ms;
        radio.set_channel(policy::CHANNEL_ORDER[0]);
        CURRENT_CHANNEL.store(policy::CHANNEL_ORDER[0], Ordering::Relaxed);
        PACKET_COUNT.store(0, Ordering::Relaxed);
        CHANNEL_LOCKED.store(false, Ordering::Relaxed);
        PAUSED.store(false, Ordering::Release);
        RUNNING.store(true, Ordering::Release);
    }

    /// Take the radio off the air without losing state — used around SD
    /// writes to keep the SPI bus single-owner.
    pub fn pause(&mut self, radio: &mut impl Radio) {
        if !is_running() || is_paused() {
            return;
        }
        PAUSED.store(true, Ordering::Release);
        radio.set_promiscuous(false);
    }

    pub fn resume(&mut self, radio: &mut impl Radio) {
        if !is_running() || !is_paused() {
            return;
        }
        radio.set_promiscuous(true);
        PAUSED.store(false, Ordering::Release);
    }

    /// Release the radio and drop the table. No callback will be
    /// observed after this returns.
    pub fn stop(&mut self, radio: &mut impl Radio) {
        if !is_running() {
            return;
        }
        log::info!("recon: stopping, {} networks seen", network_count());
        RUNNING.store(false, Ordering::Release);
        radio.set_promiscuous(false);
        radio.set_promiscuous_callback(None);
        CHANNEL_LOCKED.store(false, Ordering::Relaxed);
        with_networks(|nets| nets.clear());
        set_protected_bssid(None);
    }

    /// Pin the scanner to one channel; the hop schedule stands still
    /// until [`Self::unlock_channel`].
    pub fn lock_channel(&mut self, radio: &mut impl Radio, channel: u8) {
        radio.set_channel(channel);
        CURRENT_CHANNEL.store(channel, Ordering::Relaxed);
        if let Some(idx) = channel_index(channel) {
            self.hop_index = idx;
        }
        CHANNEL_LOCKED.store(true, Ordering::Relaxed);
    }

    pub fn unlock_channel(&mut self) {
        CHANNEL_LOCKED.store(false, Ordering::Relaxed);
    }

    pub fn set_hop_interval_ms(&mut self, interval: u32) {
        HOP_INTERVAL_MS.store(interval.max(20), Ordering::Relaxed);
    }

    /// Hop tick + periodic stale cleanup. Call from the main loop.
    pub fn update(&mut self, radio: &mut impl Radio, now_ms: u32) {
        if !is_running() || is_paused() {
            return;
        }

        if !is_channel_locked()
            && now_ms.wrapping_sub(self.last_hop_ms) >= hop_interval_ms()
        {
            self.last_hop_ms = now_ms;
            self.hop_index = (self.hop_index + 1) % policy::CHANNEL_ORDER.len();
            let ch = policy::CHANNEL_ORDER[self.hop_index];
            radio.set_channel(ch);
            CURRENT_CHANNEL.store(ch, Ordering::Relaxed);
        }

        if now_ms.wrapping_sub(self.last_cleanup_ms) >= policy::NETWORK_CLEANUP_INTERVAL_MS {
            self.last_cleanup_ms = now_ms;
            cleanup_stale_networks(now_ms);
        }
    }
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Evict entries unseen for the stale window; under Critical pressure
/// additionally shed the weakest entries down to half capacity. The
/// protected BSSID survives both paths — consumers re-bind by BSSID
/// after every sweep.
fn cleanup_stale_networks(now_ms: u32) {
    let emergency = heap::pressure_level() == PressureLevel::Critical;
    critical_section::with(|cs| {
        let mut nets = NETWORKS.borrow_ref_mut(cs);
        let protected = PROTECTED_BSSID.borrow(cs).get();

        let mut i = 0;
        while i < nets.len() {
            let stale =
                now_ms.wrapping_sub(nets[i].last_seen) > policy::NETWORK_STALE_MS;
            let shielded = protected == Some(nets[i].bssid);
            if stale && !shielded {
                nets.swap_remove(i);
            } else {
                i += 1;
            }
        }

        if emergency {
            while nets.len() > policy::MAX_NETWORKS / 2 {
                let mut weakest: Option<usize> = None;
                for (i, n) in nets.iter().enumerate() {
                    if protected == Some(n.bssid) {
                        continue;
                    }
                    match weakest {
                        Some(w) if nets[w].rssi_ema <= n.rssi_ema => {}
                        _ => weakest = Some(i),
                    }
                }
                match weakest {
                    Some(i) => {
                        nets.swap_remove(i);
                    }
                    None => break,
                }
            }
        }
    });
}

/// Stress-test surface: feed a synthetic network through the same
/// admission path real beacons take, without RF.
pub fn inject_test_network(
    bssid: [u8; 6],
    ssid: &str,
    channel: u8,
    rssi: i8,
    auth: AuthMode,
    pmf_required: bool,
    now_ms: u32,
) {
    if !is_running() {
        return;
    }
    // Conservative floor + fragmentation gate: stress floods must not
    // starve the system
    let free = heap::cached_free();
    if free < policy::INJECT_MIN_HEAP {
        return;
    }
    if free > 0 && (heap::cached_largest() as f32 / free as f32) < policy::MIN_FRAG_RATIO_FOR_GROWTH
    {
        return;
    }
    let mut info_ssid = Ssid::new();
    let _ = info_ssid.push_str(ssid);
    let hidden = info_ssid.is_empty();
    let info = frame::BeaconInfo {
        bssid,
        ssid: info_ssid,
        hidden,
        channel: Some(channel),
        auth,
        pmf_required,
        interval_tu: 100,
    };
    upsert_network(&info, rssi, channel, now_ms);
}

#[cfg(test)]
pub(crate) fn reset_for_test() {
    RUNNING.store(false, Ordering::Release);
    PAUSED.store(false, Ordering::Release);
    CHANNEL_LOCKED.store(false, Ordering::Relaxed);
    CURRENT_CHANNEL.store(policy::CHANNEL_ORDER[0], Ordering::Relaxed);
    HOP_INTERVAL_MS.store(policy::DEFAULT_HOP_INTERVAL_MS, Ordering::Relaxed);
    PACKET_COUNT.store(0, Ordering::Relaxed);
    set_packet_callback(None);
    set_new_network_callback(None);
    set_protected_bssid(None);
    with_networks(|nets| nets.clear());
}
