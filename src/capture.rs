//! Passive capture engine.
//!
//! Turns the scanner's packet feed into durable handshake/PMKID
//! captures without ever allocating, logging, or touching storage from
//! the radio callback. The callback parks everything in static deferral
//! buffers; the main-thread `update()` drains them into the bounded
//! collections, runs the adaptive hop state machine, and drives the
//! save protocol.
//!
//! The attack engine reuses everything here except the hop state
//! machine — same callback, same rings, same collections, same saves.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use core::cell::Cell;
use critical_section::Mutex;
use heapless::Vec;

use crate::frame::{self, PmkidKde, Ssid};
use crate::heap::{self, InsertReject, PressureLevel};
use crate::platform::{Delay, Radio};
use crate::policy;
use crate::recon::{self, Scanner};
use crate::ring::{Ring, SlotPool};
use crate::writer::{CaptureSink, FrameExport, HandshakeExport};

// ── Durable capture records ───────────────────────────────────────────

/// One stored EAPOL message: the payload for the hash format plus the
/// full radio frame for pcap export.
#[derive(Clone, Copy)]
pub struct EapolRecord {
    pub data: [u8; policy::EAPOL_MAX_LEN],
    pub len: u16,
    pub full_frame: [u8; policy::FULL_FRAME_MAX_LEN],
    pub full_len: u16,
    pub rssi: i8,
    pub timestamp_ms: u32,
    pub message_num: u8,
}

impl EapolRecord {
    const EMPTY: Self = Self {
        data: [0; policy::EAPOL_MAX_LEN],
        len: 0,
        full_frame: [0; policy::FULL_FRAME_MAX_LEN],
        full_len: 0,
        rssi: 0,
        timestamp_ms: 0,
        message_num: 0,
    };
}

/// In-progress or completed four-message exchange for one (AP, station)
/// pair. Slot `i` is populated iff bit `i` of `captured_mask` is set.
#[derive(Clone)]
pub struct CapturedHandshake {
    pub bssid: [u8; 6],
    pub station: [u8; 6],
    pub ssid: Ssid,
    pub frames: [EapolRecord; 4],
    pub captured_mask: u8,
    pub beacon: [u8; policy::BEACON_MAX_LEN],
    pub beacon_len: u16,
    pub first_seen: u32,
    pub last_seen: u32,
    pub saved: bool,
    pub save_attempts: u8,
}

impl CapturedHandshake {
    fn new(bssid: [u8; 6], station: [u8; 6], now_ms: u32) -> Self {
        Self {
            bssid,
            station,
            ssid: Ssid::new(),
            frames: [EapolRecord::EMPTY; 4],
            captured_mask: 0,
            beacon: [0; policy::BEACON_MAX_LEN],
            beacon_len: 0,
            first_seen: now_ms,
            last_seen: now_ms,
            saved: false,
            save_attempts: 0,
        }
    }

    /// Crackable pair: M1+M2 or M2+M3 with non-zero frame lengths.
    pub fn has_valid_pair(&self) -> bool {
        let m = self.captured_mask;
        let ok = |i: usize| self.frames[i].len > 0;
        (m & 0b0011 == 0b0011 && ok(0) && ok(1)) || (m & 0b0110 == 0b0110 && ok(1) && ok(2))
    }

    /// 22000 message-pair code; `None` until a valid pair exists.
    /// M1+M2 is preferred — the M2 MIC validates against the M1 nonce.
    pub fn message_pair(&self) -> Option<u8> {
        let m = self.captured_mask;
        if m & 0b0011 == 0b0011 && self.frames[0].len > 0 && self.frames[1].len > 0 {
            Some(crate::writer::MESSAGE_PAIR_M1M2)
        } else if m & 0b0110 == 0b0110 && self.frames[1].len > 0 && self.frames[2].len > 0 {
            Some(crate::writer::MESSAGE_PAIR_M2M3)
        } else {
            None
        }
    }

    pub fn has_beacon(&self) -> bool {
        self.beacon_len > 0
    }

    /// Saved captures don't need the beacon blob in RAM.
    pub fn release_beacon(&mut self) {
        self.beacon_len = 0;
    }

    fn export(&self) -> HandshakeExport<'_> {
        let mut frames: [Option<FrameExport<'_>>; 4] = [None, None, None, None];
        for (i, slot) in self.frames.iter().enumerate() {
            if self.captured_mask & (1 << i) != 0 && slot.len > 0 {
                frames[i] = Some(FrameExport {
                    eapol: &slot.data[..slot.len as usize],
                    full_frame: &slot.full_frame[..slot.full_len as usize],
                    timestamp_ms: slot.timestamp_ms,
                });
            }
        }
        HandshakeExport {
            ssid: self.ssid.as_str(),
            bssid: self.bssid,
            station: self.station,
            frames,
            beacon: if self.has_beacon() {
                Some(&self.beacon[..self.beacon_len as usize])
            } else {
                None
            },
            beacon_timestamp_ms: self.first_seen,
            message_pair: self.message_pair().unwrap_or(0xFF),
        }
    }
}

/// One-shot clientless capture from an M1's key data.
#[derive(Clone)]
pub struct CapturedPmkid {
    pub bssid: [u8; 6],
    pub station: [u8; 6],
    pub pmkid: [u8; 16],
    pub ssid: Ssid,
    pub timestamp_ms: u32,
    pub saved: bool,
    pub save_attempts: u8,
}

/// Partial capture sighting — feeds the hunt scheduler.
#[derive(Clone, Copy)]
pub struct IncompleteHs {
    pub bssid: [u8; 6],
    pub captured_mask: u8,
    pub channel: u8,
    pub last_seen: u32,
}

/// Per-channel rolling activity counters for the adaptive scheduler.
#[derive(Debug, Clone, Copy)]
pub struct ChannelActivity {
    pub channel: u8,
    pub beacon_count: u16,
    pub eapol_count: u16,
    pub last_activity_ms: u32,
    pub dead_streak: u8,
    pub lifetime_beacons: u32,
}

impl ChannelActivity {
    const fn empty(channel: u8) -> Self {
        Self {
            channel,
            beacon_count: 0,
            eapol_count: 0,
            last_activity_ms: 0,
            dead_streak: 0,
            lifetime_beacons: 0,
        }
    }
}

// ── Deferral buffers (T_rx side) ──────────────────────────────────────

#[derive(Clone, Copy)]
struct PendingFrame {
    data: [u8; policy::EAPOL_MAX_LEN],
    len: u16,
    full: [u8; policy::FULL_FRAME_MAX_LEN],
    full_len: u16,
    rssi: i8,
}

impl PendingFrame {
    const EMPTY: Self = Self {
        data: [0; policy::EAPOL_MAX_LEN],
        len: 0,
        full: [0; policy::FULL_FRAME_MAX_LEN],
        full_len: 0,
        rssi: 0,
    };
}

#[derive(Clone, Copy)]
struct PendingHandshake {
    bssid: [u8; 6],
    station: [u8; 6],
    mask: u8,
    frames: [PendingFrame; 4],
}

impl PendingHandshake {
    const EMPTY: Self = Self {
        bssid: [0; 6],
        station: [0; 6],
        mask: 0,
        frames: [PendingFrame::EMPTY; 4],
    };
}

#[derive(Clone, Copy)]
struct PendingPmkid {
    bssid: [u8; 6],
    station: [u8; 6],
    pmkid: [u8; 16],
    all_zero: bool,
    ssid: [u8; 32],
    ssid_len: u8,
    channel: u8,
}

impl PendingPmkid {
    const EMPTY: Self = Self {
        bssid: [0; 6],
        station: [0; 6],
        pmkid: [0; 16],
        all_zero: false,
        ssid: [0; 32],
        ssid_len: 0,
        channel: 0,
    };
}

#[derive(Clone, Copy)]
struct PendingBeacon {
    bssid: [u8; 6],
    data: [u8; policy::BEACON_MAX_LEN],
    len: u16,
}

impl PendingBeacon {
    const EMPTY: Self = Self {
        bssid: [0; 6],
        data: [0; policy::BEACON_MAX_LEN],
        len: 0,
    };
}

/// A station heard talking to the watched BSSID (attack-engine client
/// discovery).
#[derive(Clone, Copy)]
pub struct ClientSighting {
    pub mac: [u8; 6],
    pub seen_ms: u32,
}

impl ClientSighting {
    const EMPTY: Self = Self {
        mac: [0; 6],
        seen_ms: 0,
    };
}

static ENGINE_ACTIVE: AtomicBool = AtomicBool::new(false);
/// Main-thread drain in progress — the callback short-circuits and
/// drops the packet rather than contending.
static DRAIN_BUSY: AtomicBool = AtomicBool::new(false);
/// A beacon matching the pending PMKID head arrived with an SSID.
static DWELL_RESOLVED: AtomicBool = AtomicBool::new(false);
/// BSSID whose data frames should yield client sightings.
static CLIENT_WATCH: Mutex<Cell<Option<[u8; 6]>>> = Mutex::new(Cell::new(None));

static PENDING_HS: SlotPool<PendingHandshake, 4> = SlotPool::new(PendingHandshake::EMPTY);
static PENDING_PMKID: Ring<PendingPmkid, 4> = Ring::new(PendingPmkid::EMPTY);
static PENDING_BEACON: Ring<PendingBeacon, 1> = Ring::new(PendingBeacon::EMPTY);
static PENDING_INCOMPLETE: Ring<IncompleteHs, 8> = Ring::new(IncompleteHs {
    bssid: [0; 6],
    captured_mask: 0,
    channel: 0,
    last_seen: 0,
});
static CLIENT_SIGHTINGS: Ring<ClientSighting, 8> = Ring::new(ClientSighting::EMPTY);

static CHANNEL_STATS: Mutex<core::cell::RefCell<[ChannelActivity; 13]>> =
    Mutex::new(core::cell::RefCell::new([ChannelActivity::empty(0); 13]));

/// Free-running counters — the only record T_rx keeps of discarded
/// input.
static MALFORMED_FRAMES: AtomicU32 = AtomicU32::new(0);
static DROPPED_WHILE_BUSY: AtomicU32 = AtomicU32::new(0);

pub fn malformed_frame_count() -> u32 {
    MALFORMED_FRAMES.load(Ordering::Relaxed)
}

pub fn dropped_while_busy_count() -> u32 {
    DROPPED_WHILE_BUSY.load(Ordering::Relaxed)
}

/// Hold the busy flag across a main-thread drain so the callback drops
/// packets instead of contending (attack engine's update).
pub(crate) fn set_drain_busy(busy: bool) {
    DRAIN_BUSY.store(busy, Ordering::Release);
}

/// Watch a BSSID for client sightings (attack engine LOCKING state).
pub(crate) fn set_client_watch(bssid: Option<[u8; 6]>) {
    critical_section::with(|cs| CLIENT_WATCH.borrow(cs).set(bssid));
    if bssid.is_none() {
        CLIENT_SIGHTINGS.clear();
    }
}

pub(crate) fn pop_client_sighting() -> Option<ClientSighting> {
    CLIENT_SIGHTINGS.pop()
}

fn stats_index(channel: u8) -> Option<usize> {
    recon::channel_index(channel)
}

fn bump_beacon_stats(channel: u8, now_ms: u32) {
    if let Some(idx) = stats_index(channel) {
        critical_section::with(|cs| {
            let mut stats = CHANNEL_STATS.borrow_ref_mut(cs);
            stats[idx].channel = channel;
            stats[idx].beacon_count = stats[idx].beacon_count.saturating_add(1);
            stats[idx].lifetime_beacons = stats[idx].lifetime_beacons.saturating_add(1);
            stats[idx].last_activity_ms = now_ms;
        });
    }
}

fn bump_eapol_stats(channel: u8, now_ms: u32) {
    if let Some(idx) = stats_index(channel) {
        critical_section::with(|cs| {
            let mut stats = CHANNEL_STATS.borrow_ref_mut(cs);
            stats[idx].channel = channel;
            stats[idx].eapol_count = stats[idx].eapol_count.saturating_add(1);
            stats[idx].last_activity_ms = now_ms;
        });
    }
}

/// Snapshot of the per-channel counters.
pub fn channel_stats() -> [ChannelActivity; 13] {
    critical_section::with(|cs| *CHANNEL_STATS.borrow_ref(cs))
}

fn reset_channel_stats() {
    critical_section::with(|cs| {
        let mut stats = CHANNEL_STATS.borrow_ref_mut(cs);
        for (i, s) in stats.iter_mut().enumerate() {
            *s = ChannelActivity::empty(policy::CHANNEL_ORDER[i]);
        }
    });
}

/// On leaving a channel: a visit with zero activity extends its dead
/// streak, any activity clears it.
fn bump_dead_streak(idx: usize) {
    critical_section::with(|cs| {
        let mut stats = CHANNEL_STATS.borrow_ref_mut(cs);
        let s = &mut stats[idx];
        if s.beacon_count == 0 && s.eapol_count == 0 {
            s.dead_streak = s.dead_streak.saturating_add(1);
        } else {
            s.dead_streak = 0;
        }
    });
}

/// Zero the rolling counters (lifetime totals survive).
fn decay_channel_stats() {
    critical_section::with(|cs| {
        let mut stats = CHANNEL_STATS.borrow_ref_mut(cs);
        for s in stats.iter_mut() {
            s.beacon_count = 0;
            s.eapol_count = 0;
            s.dead_streak = 0;
        }
    });
}

// ── T_rx entry point ──────────────────────────────────────────────────

/// Engine packet callback, installed into the scanner's subscriber
/// slot. Runs on T_rx: read-only inspection, fixed-buffer writes under
/// short critical sections, and counter updates — nothing else.
pub fn rx_on_frame(frame_data: &[u8], rssi: i8, channel: u8, now_ms: u32) {
    if !ENGINE_ACTIVE.load(Ordering::Acquire) {
        return;
    }
    if DRAIN_BUSY.load(Ordering::Acquire) {
        DROPPED_WHILE_BUSY.fetch_add(1, Ordering::Relaxed);
        return;
    }
    if frame_data.len() < 24 {
        return;
    }
    let channel = if stats_index(channel).is_some() {
        channel
    } else {
        recon::current_channel()
    };

    if frame::is_mgmt(frame_data) && frame::subtype(frame_data) == frame::SUBTYPE_BEACON {
        rx_beacon(frame_data, channel, now_ms);
    } else if frame::is_data(frame_data) {
        rx_data(frame_data, rssi, channel, now_ms);
    }
}

fn rx_beacon(frame_data: &[u8], channel: u8, now_ms: u32) {
    if frame_data.len() < 40 {
        return;
    }
    let mut bssid = [0u8; 6];
    bssid.copy_from_slice(&frame_data[16..22]);

    // Resolve a pending PMKID's SSID straight from the beacon IEs —
    // cheap tag walk, no table access
    let _ = PENDING_PMKID.with_head(|slot| {
        if slot.ssid_len == 0 && slot.bssid == bssid {
            if let Some((ssid, len)) = raw_ssid(frame_data) {
                if len > 0 {
                    slot.ssid = ssid;
                    slot.ssid_len = len;
                    DWELL_RESOLVED.store(true, Ordering::Release);
                }
            }
        }
    });

    // Stash one beacon for pcap attachment; matching against handshakes
    // happens on the main thread
    PENDING_BEACON.push({
        let mut pb = PendingBeacon::EMPTY;
        pb.bssid = bssid;
        let n = frame_data.len().min(policy::BEACON_MAX_LEN);
        pb.data[..n].copy_from_slice(&frame_data[..n]);
        pb.len = n as u16;
        pb
    });

    bump_beacon_stats(channel, now_ms);
}

/// Minimal SSID extraction for the callback path (tag 0 at the first
/// IE position).
fn raw_ssid(frame_data: &[u8]) -> Option<([u8; 32], u8)> {
    let mut offset = 36usize;
    while offset + 2 <= frame_data.len() {
        let tag = frame_data[offset];
        let len = frame_data[offset + 1] as usize;
        if offset + 2 + len > frame_data.len() {
            return None;
        }
        if tag == 0 {
            if len == 0 || len > 32 {
                return None;
            }
            let mut out = [0u8; 32];
            out[..len].copy_from_slice(&frame_data[offset + 2..offset + 2 + len]);
            if out[..len].iter().all(|&b| b == 0) {
                return None;
            }
            return Some((out, len as u8));
        }
        offset += 2 + len;
    }
    None
}

fn rx_data(frame_data: &[u8], rssi: i8, channel: u8, now_ms: u32) {
    // Client discovery for the watched BSSID — any data frame counts
    if let Some(watch) = critical_section::with(|cs| CLIENT_WATCH.borrow(cs).get()) {
        if let Some(addrs) = frame::data_addrs(frame_data) {
            if addrs.bssid == watch {
                let client = if addrs.src == watch { addrs.dst } else { addrs.src };
                if client != watch && client[0] & 0x01 == 0 {
                    CLIENT_SIGHTINGS.push(ClientSighting {
                        mac: client,
                        seen_ms: now_ms,
                    });
                }
            }
        }
    }

    let key = match frame::parse_eapol_key(frame_data) {
        Some(key) => key,
        None => {
            // Only count frames that claimed to be EAPOL and failed
            let hdr = frame::data_header_len(frame_data);
            if hdr + 8 <= frame_data.len()
                && frame_data[hdr..hdr + 8] == frame::LLC_SNAP_EAPOL
            {
                MALFORMED_FRAMES.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
    };

    let eapol = &frame_data[key.eapol_offset..];

    // M1 may carry a PMKID
    if key.message == frame::KeyMessage::M1 {
        if let Some(kde) = frame::extract_pmkid(eapol) {
            let mut slot = PendingPmkid::EMPTY;
            slot.bssid = key.bssid;
            slot.station = key.station;
            slot.channel = channel;
            match kde {
                PmkidKde::Present(pmkid) => slot.pmkid = pmkid,
                PmkidKde::AllZero => slot.all_zero = true,
            }
            PENDING_PMKID.push(slot);
        }
    }

    // Batch the frame into the keyed handshake slot
    let idx = key.message.index();
    PENDING_HS.update_or_claim(
        |s| s.bssid == key.bssid && s.station == key.station,
        |s, fresh| {
            if fresh {
                *s = PendingHandshake::EMPTY;
                s.bssid = key.bssid;
                s.station = key.station;
            }
            let f = &mut s.frames[idx];
            let n = eapol.len().min(policy::EAPOL_MAX_LEN);
            f.data[..n].copy_from_slice(&eapol[..n]);
            f.len = n as u16;
            let fl = frame_data.len().min(policy::FULL_FRAME_MAX_LEN);
            f.full[..fl].copy_from_slice(&frame_data[..fl]);
            f.full_len = fl as u16;
            f.rssi = rssi;
            s.mask |= 1 << idx;
        },
    );

    bump_eapol_stats(channel, now_ms);

    PENDING_INCOMPLETE.push(IncompleteHs {
        bssid: key.bssid,
        captured_mask: 1 << idx,
        channel,
        last_seen: now_ms,
    });
}

// ── Shared engine core (T_main side) ──────────────────────────────────

/// What a drain pass produced — the engines turn these into state
/// transitions, hooks, and immediate saves.
#[derive(Default)]
pub struct DrainOutcome {
    /// A pending PMKID is waiting for its SSID (camp on this channel).
    pub pmkid_needs_ssid: bool,
    /// A PMKID completed with an SSID this pass.
    pub pmkid_captured: Option<Ssid>,
    /// A handshake reached valid-pair this pass.
    pub handshake_captured: Option<Ssid>,
}

/// Collections + drain + save machinery shared by both engines.
pub struct CaptureCore {
    pub handshakes: Vec<CapturedHandshake, { policy::MAX_HANDSHAKES }>,
    pub pmkids: Vec<CapturedPmkid, { policy::MAX_PMKIDS }>,
    pub incomplete: Vec<IncompleteHs, { policy::MAX_INCOMPLETE_HS }>,
    last_backup_save_ms: u32,
    last_prune_ms: u32,
    last_stats_decay_ms: u32,
    last_beacon_audit_ms: u32,
}

impl CaptureCore {
    pub const fn new() -> Self {
        Self {
            handshakes: Vec::new(),
            pmkids: Vec::new(),
            incomplete: Vec::new(),
            last_backup_save_ms: 0,
            last_prune_ms: 0,
            last_stats_decay_ms: 0,
            last_beacon_audit_ms: 0,
        }
    }

    /// Arm the T_rx callback path and clear every deferral buffer.
    pub fn activate(&mut self, now_ms: u32) {
        self.handshakes.clear();
        self.pmkids.clear();
        self.incomplete.clear();
        self.last_backup_save_ms = now_ms;
        self.last_prune_ms = now_ms;
        self.last_stats_decay_ms = now_ms;
        self.last_beacon_audit_ms = now_ms;
        PENDING_HS.clear();
        PENDING_PMKID.clear();
        PENDING_BEACON.clear();
        PENDING_INCOMPLETE.clear();
        CLIENT_SIGHTINGS.clear();
        DWELL_RESOLVED.store(false, Ordering::Release);
        set_client_watch(None);
        reset_channel_stats();
        ENGINE_ACTIVE.store(true, Ordering::Release);
    }

    /// Disarm the callback and release everything engine-local. After
    /// this returns no callback writes are observed.
    pub fn deactivate(&mut self) {
        ENGINE_ACTIVE.store(false, Ordering::Release);
        DRAIN_BUSY.store(false, Ordering::Release);
        set_client_watch(None);
        PENDING_HS.clear();
        PENDING_PMKID.clear();
        PENDING_BEACON.clear();
        PENDING_INCOMPLETE.clear();
        CLIENT_SIGHTINGS.clear();
        self.handshakes.clear();
        self.pmkids.clear();
        self.incomplete.clear();
    }

    /// Drain every deferral buffer into the durable collections.
    /// `force_pmkid` processes PMKIDs even without an SSID (the caller
    /// gave up dwelling for a beacon).
    pub fn drain(&mut self, now_ms: u32, force_pmkid: bool) -> DrainOutcome {
        let mut outcome = DrainOutcome::default();
        self.attach_pending_beacon();
        self.drain_pmkids(now_ms, force_pmkid, &mut outcome);
        self.drain_handshakes(now_ms, &mut outcome);
        self.drain_incomplete(now_ms);
        outcome
    }

    fn attach_pending_beacon(&mut self) {
        let Some(pb) = PENDING_BEACON.pop() else {
            return;
        };
        if pb.len == 0 {
            return;
        }
        for hs in self.handshakes.iter_mut() {
            if !hs.saved && !hs.has_beacon() && hs.bssid == pb.bssid {
                hs.beacon[..pb.len as usize].copy_from_slice(&pb.data[..pb.len as usize]);
                hs.beacon_len = pb.len;
                break;
            }
        }
    }

    fn drain_pmkids(&mut self, now_ms: u32, force: bool, outcome: &mut DrainOutcome) {
        loop {
            // The shared table usually knows the SSID already — a dwell
            // is only worth it when no beacon has been seen at all
            let unresolved =
                PENDING_PMKID.with_head(|s| (s.ssid_len == 0 && !s.all_zero).then_some(s.bssid));
            if let Some(Some(bssid)) = unresolved {
                let mut found: Option<Ssid> = None;
                recon::with_networks(|nets| {
                    if let Some(net) = nets.iter().find(|n| n.bssid == bssid) {
                        if !net.ssid.is_empty() {
                            found = Some(net.ssid.clone());
                        }
                    }
                });
                if let Some(ssid) = found {
                    let _ = PENDING_PMKID.with_head(|s| {
                        let bytes = ssid.as_bytes();
                        s.ssid[..bytes.len()].copy_from_slice(bytes);
                        s.ssid_len = bytes.len() as u8;
                    });
                }
            }

            let head_ready = PENDING_PMKID.with_head(|slot| slot.ssid_len > 0 || slot.all_zero);
            let ready = match head_ready {
                None => return,
                Some(r) => r || force,
            };
            if !ready {
                outcome.pmkid_needs_ssid = true;
                return;
            }
            let Some(slot) = PENDING_PMKID.pop() else {
                return;
            };
            DWELL_RESOLVED.store(false, Ordering::Release);

            let Some(i) = self.find_or_create_pmkid(&slot.bssid, now_ms) else {
                continue;
            };
            let p = &mut self.pmkids[i];
            if p.saved {
                // Terminal (including the all-zero case): never reopened
                continue;
            }
            p.station = slot.station;
            p.timestamp_ms = now_ms;
            if slot.all_zero {
                // Invalid but terminal: recorded, never written, never
                // retried
                p.pmkid = [0; 16];
                p.saved = true;
                continue;
            }
            p.pmkid = slot.pmkid;
            if slot.ssid_len > 0 {
                p.ssid.clear();
                if let Ok(s) = core::str::from_utf8(&slot.ssid[..slot.ssid_len as usize]) {
                    let _ = p.ssid.push_str(s);
                }
            }
            if !p.ssid.is_empty() {
                outcome.pmkid_captured = Some(p.ssid.clone());
            }
        }
    }

    fn drain_handshakes(&mut self, now_ms: u32, outcome: &mut DrainOutcome) {
        while let Some(pending) = PENDING_HS.drain_one() {
            let Some(i) = self.find_or_create_handshake(&pending.bssid, &pending.station, now_ms)
            else {
                continue;
            };
            let hs = &mut self.handshakes[i];

            for msg in 0..4 {
                if pending.mask & (1 << msg) == 0 {
                    continue;
                }
                // First capture of each message wins; retransmissions
                // don't churn stored frames
                if hs.frames[msg].len != 0 {
                    continue;
                }
                let pf = &pending.frames[msg];
                if pf.len == 0 {
                    continue;
                }
                let rec = &mut hs.frames[msg];
                rec.data[..pf.len as usize].copy_from_slice(&pf.data[..pf.len as usize]);
                rec.len = pf.len;
                rec.full_frame[..pf.full_len as usize]
                    .copy_from_slice(&pf.full[..pf.full_len as usize]);
                rec.full_len = pf.full_len;
                rec.rssi = pf.rssi;
                rec.timestamp_ms = now_ms;
                rec.message_num = msg as u8 + 1;
                hs.captured_mask |= 1 << msg;
                hs.last_seen = now_ms;
            }

            if hs.ssid.is_empty() {
                let bssid = hs.bssid;
                let mut found: Option<Ssid> = None;
                recon::with_networks(|nets| {
                    if let Some(net) = nets.iter().find(|n| n.bssid == bssid) {
                        if !net.ssid.is_empty() {
                            found = Some(net.ssid.clone());
                        }
                    }
                });
                if let Some(ssid) = found {
                    self.handshakes[i].ssid = ssid;
                }
            }

            let hs = &self.handshakes[i];
            if hs.has_valid_pair() && !hs.saved && outcome.handshake_captured.is_none() {
                outcome.handshake_captured = Some(hs.ssid.clone());
                // Mark the shared table so target selection skips it
                let bssid = hs.bssid;
                recon::with_networks(|nets| {
                    if let Some(net) = nets.iter_mut().find(|n| n.bssid == bssid) {
                        net.has_handshake = true;
                    }
                });
            }
        }
    }

    fn drain_incomplete(&mut self, now_ms: u32) {
        while let Some(sighting) = PENDING_INCOMPLETE.pop() {
            if let Some(existing) = self
                .incomplete
                .iter_mut()
                .find(|ihs| ihs.bssid == sighting.bssid)
            {
                existing.captured_mask |= sighting.captured_mask;
                existing.last_seen = now_ms;
                continue;
            }
            let _ = self.incomplete.push(IncompleteHs {
                last_seen: now_ms,
                ..sighting
            });
        }
    }

    fn find_or_create_pmkid(&mut self, bssid: &[u8; 6], now_ms: u32) -> Option<usize> {
        if let Some(i) = self.pmkids.iter().position(|p| &p.bssid == bssid) {
            return Some(i);
        }
        if self.pmkids.is_full() {
            return None;
        }
        if let Err(reason) = heap::admit_insert(
            policy::MIN_HEAP_FOR_NETWORK_ADD,
            core::mem::size_of::<CapturedPmkid>(),
            policy::PMKID_ALLOC_SLACK,
            PressureLevel::Warning,
        ) {
            log_reject("pmkid", reason);
            return None;
        }
        let p = CapturedPmkid {
            bssid: *bssid,
            station: [0; 6],
            pmkid: [0; 16],
            ssid: Ssid::new(),
            timestamp_ms: now_ms,
            saved: false,
            save_attempts: 0,
        };
        self.pmkids.push(p).ok()?;
        Some(self.pmkids.len() - 1)
    }

    fn find_or_create_handshake(
        &mut self,
        bssid: &[u8; 6],
        station: &[u8; 6],
        now_ms: u32,
    ) -> Option<usize> {
        if let Some(i) = self
            .handshakes
            .iter()
            .position(|h| &h.bssid == bssid && &h.station == station)
        {
            return Some(i);
        }
        if self.handshakes.is_full() {
            return None;
        }
        if let Err(reason) = heap::admit_insert(
            policy::MIN_HEAP_FOR_HANDSHAKE_ADD,
            core::mem::size_of::<CapturedHandshake>(),
            policy::HANDSHAKE_ALLOC_SLACK,
            PressureLevel::Warning,
        ) {
            log_reject("handshake", reason);
            return None;
        }
        self.handshakes
            .push(CapturedHandshake::new(*bssid, *station, now_ms))
            .ok()?;
        Some(self.handshakes.len() - 1)
    }

    // ── Save protocol ─────────────────────────────────────────────────

    /// Attempt every unsaved capture. Attempts are counted only when a
    /// real write is tried: missing SSID waits for the beacon race to
    /// resolve, short frames wait for better copies.
    pub fn save_all(&mut self, sink: &mut impl CaptureSink, now_ms: u32) {
        if heap::pressure_level() >= PressureLevel::Warning {
            return;
        }
        self.save_pmkids(sink, now_ms);
        self.save_handshakes(sink, now_ms);
    }

    fn backoff_elapsed(attempts: u8, reference_ms: u32, now_ms: u32) -> bool {
        let backoff = policy::SAVE_BACKOFF_MS[(attempts as usize).min(2)];
        now_ms.wrapping_sub(reference_ms) >= backoff
    }

    fn save_pmkids(&mut self, sink: &mut impl CaptureSink, now_ms: u32) {
        for p in self.pmkids.iter_mut() {
            if p.saved || p.save_attempts >= policy::SAVE_MAX_ATTEMPTS {
                continue;
            }
            if !Self::backoff_elapsed(p.save_attempts, p.timestamp_ms, now_ms) {
                continue;
            }
            if p.ssid.is_empty() {
                let bssid = p.bssid;
                recon::with_networks(|nets| {
                    if let Some(net) = nets.iter().find(|n| n.bssid == bssid) {
                        if !net.ssid.is_empty() {
                            p.ssid = net.ssid.clone();
                        }
                    }
                });
            }
            // SSID is mandatory; the retry is free until it resolves
            if p.ssid.is_empty() {
                continue;
            }

            p.save_attempts += 1;
            match sink.write_pmkid_record(p.ssid.as_str(), &p.bssid, &p.station, &p.pmkid) {
                Ok(()) => p.saved = true,
                Err(_) if p.save_attempts >= policy::SAVE_MAX_ATTEMPTS => {
                    // Give up; the in-memory copy stays for the session
                    p.saved = true;
                }
                Err(_) => {}
            }
        }
    }

    fn save_handshakes(&mut self, sink: &mut impl CaptureSink, now_ms: u32) {
        for hs in self.handshakes.iter_mut() {
            if hs.saved || hs.save_attempts >= policy::SAVE_MAX_ATTEMPTS {
                continue;
            }
            if !hs.has_valid_pair() {
                continue;
            }
            if !Self::backoff_elapsed(hs.save_attempts, hs.last_seen, now_ms) {
                continue;
            }
            if hs.ssid.is_empty() {
                let bssid = hs.bssid;
                recon::with_networks(|nets| {
                    if let Some(net) = nets.iter().find(|n| n.bssid == bssid) {
                        if !net.ssid.is_empty() {
                            hs.ssid = net.ssid.clone();
                        }
                    }
                });
            }
            if hs.ssid.is_empty() {
                continue;
            }

            let Some(pair) = hs.message_pair() else {
                continue;
            };
            // Frame sanity before the attempt counts: the nonce needs
            // its 32 bytes at offset 17, the M2 its MIC at 81..97
            let nonce_idx = if pair == crate::writer::MESSAGE_PAIR_M1M2 { 0 } else { 2 };
            if hs.frames[nonce_idx].len < 51 || hs.frames[1].len < 97 {
                continue;
            }

            hs.save_attempts += 1;
            match sink.write_handshake_records(&hs.export()) {
                Ok(()) => {
                    hs.saved = true;
                    hs.release_beacon();
                }
                Err(_) if hs.save_attempts >= policy::SAVE_MAX_ATTEMPTS => {
                    hs.saved = true;
                }
                Err(_) => {}
            }
        }
    }

    /// Housekeeping: incomplete pruning, stats decay, the periodic
    /// backup save sweep, and releasing beacons of saved captures.
    /// Returns true when a backup save sweep is due.
    pub fn maintain(&mut self, now_ms: u32) -> bool {
        if now_ms.wrapping_sub(self.last_prune_ms) > 10_000 {
            self.last_prune_ms = now_ms;
            let mut i = 0;
            while i < self.incomplete.len() {
                if now_ms.wrapping_sub(self.incomplete[i].last_seen)
                    > policy::INCOMPLETE_HS_TIMEOUT_MS
                {
                    self.incomplete.swap_remove(i);
                } else {
                    i += 1;
                }
            }
        }
        if now_ms.wrapping_sub(self.last_stats_decay_ms) > policy::STATS_DECAY_INTERVAL_MS {
            self.last_stats_decay_ms = now_ms;
            decay_channel_stats();
        }
        if now_ms.wrapping_sub(self.last_beacon_audit_ms) > 10_000 {
            self.last_beacon_audit_ms = now_ms;
            for hs in self.handshakes.iter_mut() {
                if hs.saved && hs.has_beacon() {
                    hs.release_beacon();
                }
            }
        }
        if now_ms.wrapping_sub(self.last_backup_save_ms) > policy::BACKUP_SAVE_INTERVAL_MS {
            self.last_backup_save_ms = now_ms;
            return true;
        }
        false
    }

    /// Anything left unsaved with a valid pair or a pending PMKID?
    pub fn has_unsaved(&self) -> bool {
        self.pmkids
            .iter()
            .any(|p| !p.saved && !p.ssid.is_empty() && p.save_attempts < policy::SAVE_MAX_ATTEMPTS)
            || self.handshakes.iter().any(|h| {
                !h.saved && h.has_valid_pair() && h.save_attempts < policy::SAVE_MAX_ATTEMPTS
            })
    }
}

impl Default for CaptureCore {
    fn default() -> Self {
        Self::new()
    }
}

fn log_reject(what: &str, reason: InsertReject) {
    match reason {
        InsertReject::Full => log::warn!("{} insert rejected: collection full", what),
        InsertReject::LowHeap => log::warn!("{} insert rejected: low heap", what),
        InsertReject::Fragmented => log::warn!("{} insert rejected: fragmented heap", what),
        InsertReject::Pressure(level) => {
            log::warn!("{} insert rejected: pressure {}", what, level.as_str())
        }
    }
}

/// Pause the scanner, let the SPI bus settle, save, resume.
pub fn save_with_scanner_paused(
    core: &mut CaptureCore,
    scanner: &mut Scanner,
    radio: &mut impl Radio,
    sink: &mut impl CaptureSink,
    delay: &mut impl Delay,
    now_ms: u32,
) {
    let paused_by_us = recon::is_running() && !recon::is_paused();
    if paused_by_us {
        scanner.pause(radio);
        delay.delay_ms(5);
    }
    core.save_all(sink, now_ms);
    if paused_by_us {
        scanner.resume(radio);
    }
}

// ── Advisory hooks ────────────────────────────────────────────────────

/// Events the personality layer may care about. The hook is optional
/// and runs on the main thread.
#[derive(Debug, Clone, Copy)]
pub enum MoodEvent {
    PassiveScan { networks: u16, channel: u8 },
    PmkidCaptured,
    HandshakeCaptured,
    Bored { networks: u16 },
}

pub type MoodHook = fn(&MoodEvent);

// ── Passive engine state machine ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Walking the hop schedule.
    Hopping,
    /// Camping briefly for a beacon to resolve a PMKID's SSID.
    Dwelling,
    /// Camping on a channel that showed handshake activity.
    Hunting,
    /// Whole spectrum silent — minimum-dwell sweep until anything moves.
    IdleSweep,
}

/// The passive capture engine: adaptive channel scheduler on top of the
/// shared capture core.
pub struct CaptureEngine {
    core: CaptureCore,
    state: CaptureState,
    running: bool,
    current_channel: u8,
    channel_idx: usize,
    dwell_start_ms: u32,
    hunt_start_ms: u32,
    last_hunt_ms: u32,
    last_hunt_channel: u8,
    /// Channel-lock deadline for an adaptive (busy-channel) dwell.
    adaptive_dwell_until: u32,
    last_cycle_activity: u16,
    last_mood_ms: u32,
    mood_hook: Option<MoodHook>,
}

impl CaptureEngine {
    pub const fn new() -> Self {
        Self {
            core: CaptureCore::new(),
            state: CaptureState::Hopping,
            running: false,
            current_channel: policy::CHANNEL_ORDER[0],
            channel_idx: 0,
            dwell_start_ms: 0,
            hunt_start_ms: 0,
            last_hunt_ms: 0,
            last_hunt_channel: 0,
            adaptive_dwell_until: 0,
            last_cycle_activity: 0,
            last_mood_ms: 0,
            mood_hook: None,
        }
    }

    pub fn set_mood_hook(&mut self, hook: Option<MoodHook>) {
        self.mood_hook = hook;
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn core(&self) -> &CaptureCore {
        &self.core
    }

    pub fn start(&mut self, scanner: &mut Scanner, radio: &mut impl Radio, now_ms: u32) {
        if self.running {
            return;
        }
        log::info!("capture: starting passive mode");
        if !recon::is_running() {
            scanner.start(radio, now_ms);
        }
        self.core.activate(now_ms);
        recon::set_packet_callback(Some(rx_on_frame));

        self.state = CaptureState::Hopping;
        self.current_channel = recon::current_channel();
        self.channel_idx = recon::channel_index(self.current_channel).unwrap_or(0);
        self.adaptive_dwell_until = 0;
        self.last_cycle_activity = 0;
        self.last_hunt_ms = 0;
        self.last_hunt_channel = 0;
        self.last_mood_ms = now_ms;
        self.running = true;
    }

    pub fn stop(
        &mut self,
        scanner: &mut Scanner,
        radio: &mut impl Radio,
        sink: &mut impl CaptureSink,
        delay: &mut impl Delay,
        now_ms: u32,
    ) {
        if !self.running {
            return;
        }
        log::info!("capture: stopping");
        self.running = false;
        ENGINE_ACTIVE.store(false, Ordering::Release);
        recon::set_packet_callback(None);
        if recon::is_channel_locked() {
            scanner.unlock_channel();
        }

        // Final drain + flush before dropping everything
        self.core.drain(now_ms, true);
        save_with_scanner_paused(&mut self.core, scanner, radio, sink, delay, now_ms);
        self.core.deactivate();
    }

    pub fn update(
        &mut self,
        scanner: &mut Scanner,
        radio: &mut impl Radio,
        sink: &mut impl CaptureSink,
        delay: &mut impl Delay,
        now_ms: u32,
    ) {
        if !self.running {
            return;
        }
        DRAIN_BUSY.store(true, Ordering::Release);

        let prev_channel = self.current_channel;
        self.current_channel = recon::current_channel();
        if let Some(idx) = recon::channel_index(self.current_channel) {
            self.channel_idx = idx;
        }
        let channel_changed = self.current_channel != prev_channel;
        if channel_changed {
            if let Some(prev_idx) = recon::channel_index(prev_channel) {
                bump_dead_streak(prev_idx);
            }
        }

        // Dwell bookkeeping: force PMKID processing once the dwell
        // resolved or timed out
        let dwell_done = self.state == CaptureState::Dwelling
            && (DWELL_RESOLVED.load(Ordering::Acquire)
                || now_ms.wrapping_sub(self.dwell_start_ms) > policy::DWELL_TIME_MS);
        let outcome = self.core.drain(now_ms, dwell_done);

        if outcome.pmkid_needs_ssid && self.state != CaptureState::Dwelling {
            self.start_dwell(scanner, radio, now_ms);
        }

        let mut immediate_save = false;
        if let Some(ssid) = &outcome.pmkid_captured {
            log::info!("pmkid captured: {}", ssid.as_str());
            self.emit(&MoodEvent::PmkidCaptured);
            immediate_save = true;
        }
        if let Some(ssid) = &outcome.handshake_captured {
            log::info!("handshake captured: {}", ssid.as_str());
            self.emit(&MoodEvent::HandshakeCaptured);
            immediate_save = true;
        }
        if (outcome.pmkid_captured.is_some() || dwell_done)
            && self.state == CaptureState::Dwelling
        {
            self.state = CaptureState::Hopping;
            DWELL_RESOLVED.store(false, Ordering::Release);
            self.adaptive_dwell_until = 0;
            if recon::is_channel_locked() {
                scanner.unlock_channel();
            }
        }

        self.step_state_machine(scanner, radio, channel_changed, now_ms);

        let backup_due = self.core.maintain(now_ms);
        if immediate_save || backup_due {
            save_with_scanner_paused(&mut self.core, scanner, radio, sink, delay, now_ms);
        }

        if now_ms.wrapping_sub(self.last_mood_ms) > 3_000 {
            self.last_mood_ms = now_ms;
            self.emit(&MoodEvent::PassiveScan {
                networks: recon::network_count() as u16,
                channel: self.current_channel,
            });
        }

        DRAIN_BUSY.store(false, Ordering::Release);
    }

    fn emit(&self, event: &MoodEvent) {
        if let Some(hook) = self.mood_hook {
            hook(event);
        }
    }

    fn start_dwell(&mut self, scanner: &mut Scanner, radio: &mut impl Radio, now_ms: u32) {
        self.state = CaptureState::Dwelling;
        self.dwell_start_ms = now_ms;
        DWELL_RESOLVED.store(false, Ordering::Release);
        self.adaptive_dwell_until = 0;
        if !recon::is_channel_locked() {
            scanner.lock_channel(radio, self.current_channel);
        }
    }

    fn step_state_machine(
        &mut self,
        scanner: &mut Scanner,
        radio: &mut impl Radio,
        channel_changed: bool,
        now_ms: u32,
    ) {
        match self.state {
            CaptureState::Hopping => {
                if self.adaptive_dwell_until != 0 && now_ms >= self.adaptive_dwell_until {
                    self.adaptive_dwell_until = 0;
                    if recon::is_channel_locked() {
                        scanner.unlock_channel();
                    }
                }
                if self.adaptive_dwell_until != 0 && self.check_hunting_trigger(scanner, radio, now_ms)
                {
                    self.adaptive_dwell_until = 0;
                }
                if self.adaptive_dwell_until == 0
                    && self.state == CaptureState::Hopping
                    && recon::is_channel_locked()
                {
                    scanner.unlock_channel();
                }

                if channel_changed && self.state == CaptureState::Hopping {
                    if !self.check_hunting_trigger(scanner, radio, now_ms) {
                        self.check_idle_sweep();

                        // Busy channel: extend dwell beyond the base hop
                        if self.state == CaptureState::Hopping {
                            let desired = self.adaptive_hop_delay() as u32;
                            let base = recon::hop_interval_ms();
                            if desired > base {
                                self.adaptive_dwell_until = now_ms + (desired - base);
                                if !recon::is_channel_locked() {
                                    scanner.lock_channel(radio, self.current_channel);
                                }
                            }
                        }
                    }
                }
            }
            CaptureState::Dwelling => {
                if !recon::is_channel_locked() {
                    scanner.lock_channel(radio, self.current_channel);
                }
                // Exit handled in update() when the PMKID drain resolves
            }
            CaptureState::Hunting => {
                if !recon::is_channel_locked() {
                    scanner.lock_channel(radio, self.current_channel);
                }
                if now_ms.wrapping_sub(self.hunt_start_ms) > policy::HUNT_DURATION_MS {
                    self.state = CaptureState::Hopping;
                    self.last_hunt_ms = now_ms;
                    self.last_hunt_channel = self.current_channel;
                    self.adaptive_dwell_until = 0;
                    scanner.unlock_channel();
                }
            }
            CaptureState::IdleSweep => {
                if recon::is_channel_locked() {
                    scanner.unlock_channel();
                }
                self.adaptive_dwell_until = 0;
                if channel_changed {
                    let stats = channel_stats();
                    let s = &stats[self.channel_idx];
                    if s.beacon_count > 0 || s.eapol_count > 0 {
                        self.state = CaptureState::Hopping;
                    }
                }
            }
        }
    }

    fn is_primary_channel(ch: u8) -> bool {
        ch == 1 || ch == 6 || ch == 11
    }

    /// Hop delay = per-channel base x local-activity x global-activity.
    fn adaptive_hop_delay(&self) -> u16 {
        let stats = channel_stats();
        let s = &stats[self.channel_idx];

        let base = if Self::is_primary_channel(self.current_channel) {
            policy::HOP_BASE_PRIMARY_MS
        } else {
            policy::HOP_BASE_SECONDARY_MS
        };

        let mut delay = if s.beacon_count >= policy::BUSY_THRESHOLD {
            base * 3 / 2
        } else if s.beacon_count >= 2 {
            base
        } else if s.dead_streak >= policy::DEAD_STREAK_LIMIT {
            policy::HOP_MIN_MS
        } else {
            base * 7 / 10
        };

        // Global spectrum adjustment (tuning, not contract)
        if self.last_cycle_activity < 5 {
            delay = delay * 3 / 5;
        } else if self.last_cycle_activity > 40 {
            delay = delay * 6 / 5;
        }
        delay
    }

    fn check_hunting_trigger(
        &mut self,
        scanner: &mut Scanner,
        radio: &mut impl Radio,
        now_ms: u32,
    ) -> bool {
        // Anti-oscillation: don't re-hunt the channel we just left
        if self.last_hunt_channel == self.current_channel
            && now_ms.wrapping_sub(self.last_hunt_ms) < policy::HUNT_COOLDOWN_MS
        {
            return false;
        }
        let stats = channel_stats();
        let s = &stats[self.channel_idx];
        // A partial exchange tracked on this channel is worth camping
        // for even after the rolling counters decayed
        let partial_nearby = self.core.incomplete.iter().any(|ihs| {
            ihs.channel == self.current_channel
                && ihs.captured_mask.count_ones() >= 2
                && now_ms.wrapping_sub(ihs.last_seen) < policy::HUNT_DURATION_MS
        });
        if s.eapol_count >= 2 || s.beacon_count >= 8 || partial_nearby {
            self.state = CaptureState::Hunting;
            self.hunt_start_ms = now_ms;
            self.last_hunt_channel = self.current_channel;
            self.last_hunt_ms = now_ms;
            self.adaptive_dwell_until = 0;
            if !recon::is_channel_locked() {
                scanner.lock_channel(radio, self.current_channel);
            }
            return true;
        }
        false
    }

    fn check_idle_sweep(&mut self) {
        // Evaluate once per full cycle, at wrap
        if self.channel_idx != 0 {
            return;
        }
        let stats = channel_stats();
        let total: u16 = stats.iter().map(|s| s.beacon_count).sum();
        self.last_cycle_activity = total;
        if total == 0 {
            self.state = CaptureState::IdleSweep;
        }
    }
}

impl Default for CaptureEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) fn reset_statics_for_test() {
    ENGINE_ACTIVE.store(false, Ordering::Release);
    DRAIN_BUSY.store(false, Ordering::Release);
    DWELL_RESOLVED.store(false, Ordering::Release);
    set_client_watch(None);
    PENDING_HS.clear();
    PENDING_PMKID.clear();
    PENDING_BEACON.clear();
    PENDING_INCOMPLETE.clear();
    CLIENT_SIGHTINGS.clear();
    MALFORMED_FRAMES.store(0, Ordering::Relaxed);
    DROPPED_WHILE_BUSY.store(0, Ordering::Relaxed);
    reset_channel_stats();
}
