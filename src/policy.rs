//! Centralized policy thresholds.
//!
//! Every heap gate, pressure boundary, and engine timing lives here so the
//! tuning surface is one module instead of magic numbers scattered across
//! the engines. The runtime-adjustable subset is [`Tunables`], loadable
//! from a JSON file on SD; buffer sizes and collection caps are
//! compile-time constants because they size static storage.

use serde::Deserialize;

// ── TLS gating ────────────────────────────────────────────────────────

/// Minimum free heap before a TLS-class allocation is allowed.
pub const MIN_HEAP_FOR_TLS: usize = 35_000;
/// Minimum largest contiguous block before a TLS-class allocation is allowed.
pub const MIN_CONTIG_FOR_TLS: usize = 35_000;
/// Below this largest-block size, condition proactively before it matters.
pub const PROACTIVE_CONTIG_THRESHOLD: usize = 45_000;
/// Conditioning early-exits once the largest block reaches this.
pub const HEAP_STABLE_THRESHOLD: usize = 50_000;

// ── Allocation admission floors ───────────────────────────────────────

/// Free-heap floor for admitting a new network into the shared table.
pub const MIN_HEAP_FOR_NETWORK_ADD: usize = 30_000;
/// Free-heap floor for admitting a new handshake entry.
pub const MIN_HEAP_FOR_HANDSHAKE_ADD: usize = 60_000;
/// Free-heap floor for scanner-side growth (probe-resp SSID reveal etc).
pub const MIN_HEAP_FOR_RECON_GROWTH: usize = 20_000;

/// Slack over element size required in the largest block (allocator
/// overhead cushion).
pub const RESERVE_SLACK_SMALL: usize = 256;
pub const RESERVE_SLACK_LARGE: usize = 1_024;
pub const PMKID_ALLOC_SLACK: usize = RESERVE_SLACK_SMALL;
pub const HANDSHAKE_ALLOC_SLACK: usize = RESERVE_SLACK_LARGE;

/// Fragmentation ratio below which bounded collections refuse to grow.
pub const MIN_FRAG_RATIO_FOR_GROWTH: f32 = 0.40;
/// Free-heap floor for the stress-test inject surface.
pub const INJECT_MIN_HEAP: usize = 80_000;

// ── Memory pressure levels (graduated degradation) ────────────────────
//
// Normal: all features. Caution: shed non-essentials. Warning: reject new
// handshake/PMKID inserts, block SD writes. Critical: only the
// eviction-preserving emergency path.

pub const PRESSURE_L1_FREE: usize = 80_000;
pub const PRESSURE_L2_FREE: usize = 50_000;
pub const PRESSURE_L3_FREE: usize = 30_000;
pub const PRESSURE_L1_FRAG: f32 = 0.60;
pub const PRESSURE_L2_FRAG: f32 = 0.40;
pub const PRESSURE_L3_FRAG: f32 = 0.25;
/// Minimum dwell before pressure may relax toward Normal.
pub const PRESSURE_HYSTERESIS_MS: u32 = 3_000;

// ── Heap health sampling / conditioning trigger ───────────────────────

pub const HEALTH_SAMPLE_INTERVAL_MS: u32 = 1_000;
/// Health percent at/below which a conditioning request latches.
pub const HEALTH_CONDITION_TRIGGER_PCT: u8 = 65;
/// Health percent at/above which the latch clears.
pub const HEALTH_CONDITION_CLEAR_PCT: u8 = 75;
/// Divisor applied to largest/free when penalizing fragmentation.
pub const HEALTH_FRAG_PENALTY_SCALE: f32 = 0.60;

/// Display EMA smoothing — slow to drop so transient spikes don't
/// flicker the gauge, moderate recovery.
pub const DISPLAY_EMA_ALPHA_DOWN: f32 = 0.10;
pub const DISPLAY_EMA_ALPHA_UP: f32 = 0.20;

// Adaptive conditioning cooldown:
// cooldown = clamp(min, max, base * largest / MIN_CONTIG_FOR_TLS).
// Stressed heap (largest far below the gate) retries at the floor;
// healthy heap waits out the full max.
pub const CONDITION_COOLDOWN_MIN_MS: u32 = 15_000;
pub const CONDITION_COOLDOWN_MAX_MS: u32 = 60_000;
pub const CONDITION_COOLDOWN_BASE_MS: u32 = 30_000;

// ── Conditioning cycle timings ────────────────────────────────────────

pub const CONDITIONING_DWELL_MS: u32 = 3_000;
pub const CONDITIONING_STEP_MS: u32 = 100;
/// No early exit before this much churn — the driver's own buffers are
/// still settling and the largest-block reading undershoots.
pub const CONDITIONING_WARMUP_MS: u32 = 1_000;
pub const CONDITIONING_LOG_INTERVAL_MS: u32 = 1_000;
pub const CONDITIONING_FINAL_DELAY_MS: u32 = 50;

// WiFi/BLE settle delays used during conditioning teardown
pub const WIFI_MODE_DELAY_MS: u32 = 50;
pub const WIFI_DISCONNECT_DELAY_MS: u32 = 50;
pub const WIFI_SHUTDOWN_DELAY_MS: u32 = 80;
pub const BLE_STOP_DELAY_MS: u32 = 50;
pub const BLE_DEINIT_DELAY_MS: u32 = 100;

/// Watermark persistence interval (session min-free/min-largest to SD).
pub const WATERMARK_SAVE_INTERVAL_MS: u32 = 60_000;

// ── Channel scanner ───────────────────────────────────────────────────

/// Hop order: non-overlapping channels first.
pub const CHANNEL_ORDER: [u8; 13] = [1, 6, 11, 2, 3, 4, 5, 7, 8, 9, 10, 12, 13];
/// Conditioning uses its own rotation interleaving primaries for
/// maximum packet churn.
pub const CONDITIONING_CHANNELS: [u8; 13] = [1, 6, 11, 2, 7, 12, 3, 8, 13, 4, 9, 5, 10];

pub const DEFAULT_HOP_INTERVAL_MS: u32 = 250;
/// Beacons weaker than this never enter the network table.
pub const NETWORK_MIN_RSSI: i8 = -90;
/// Stale-network sweep cadence and age limit.
pub const NETWORK_CLEANUP_INTERVAL_MS: u32 = 5_000;
pub const NETWORK_STALE_MS: u32 = 30_000;

pub const MAX_NETWORKS: usize = 48;

// ── Capture engine ────────────────────────────────────────────────────

/// Camp duration while waiting for a beacon to reveal a PMKID's SSID.
pub const DWELL_TIME_MS: u32 = 5_000;
/// Camp duration on a channel that showed handshake activity.
pub const HUNT_DURATION_MS: u32 = 12_000;
/// Minimum gap before re-hunting the same channel.
pub const HUNT_COOLDOWN_MS: u32 = 30_000;
/// Channel activity counters zero out this often.
pub const STATS_DECAY_INTERVAL_MS: u32 = 120_000;

/// Adaptive hop bases: primary channels (1/6/11) carry most traffic.
pub const HOP_BASE_PRIMARY_MS: u16 = 350;
pub const HOP_BASE_SECONDARY_MS: u16 = 150;
pub const HOP_MIN_MS: u16 = 80;
/// Beacon count at which a channel is "busy" for hop-delay purposes.
pub const BUSY_THRESHOLD: u16 = 5;
/// Consecutive silent visits before a channel gets minimum dwell.
pub const DEAD_STREAK_LIMIT: u8 = 3;

pub const MAX_HANDSHAKES: usize = 6;
pub const MAX_PMKIDS: usize = 12;
pub const MAX_INCOMPLETE_HS: usize = 16;
/// Stale incomplete-handshake entries expire after this long.
pub const INCOMPLETE_HS_TIMEOUT_MS: u32 = 300_000;

/// EAPOL payload cap (hashcat 22000 export).
pub const EAPOL_MAX_LEN: usize = 512;
/// Full 802.11 frame cap (pcap export).
pub const FULL_FRAME_MAX_LEN: usize = 300;
/// Beacon blob cap (pcap export).
pub const BEACON_MAX_LEN: usize = 512;

pub const SAVE_MAX_ATTEMPTS: u8 = 3;
/// Save retry backoff per attempt number.
pub const SAVE_BACKOFF_MS: [u32; 3] = [0, 2_000, 5_000];
/// Backup save sweep cadence.
pub const BACKUP_SAVE_INTERVAL_MS: u32 = 30_000;

// ── Attack engine ─────────────────────────────────────────────────────

pub const SCAN_TIME_MS: u32 = 5_000;
pub const PMKID_HUNT_TOTAL_MS: u32 = 30_000;
pub const PMKID_TIMEOUT_MS: u32 = 300;
pub const LOCK_TIME_MS: u32 = 5_000;
/// Fast-track into ATTACKING once a client was seen this recently.
pub const LOCK_FAST_TRACK_MS: u32 = 2_500;
/// Bail out of LOCKING early when no client has appeared by now.
pub const LOCK_EARLY_EXIT_MS: u32 = 4_000;
pub const DEAUTH_BURST_INTERVAL_MS: u32 = 180;
pub const ATTACK_TIMEOUT_MS: u32 = 15_000;
pub const ATTACK_WAIT_MS: u32 = 4_500;
pub const BORED_RETRY_MS: u32 = 30_000;
/// BORED hop cadence: fast sweep when the spectrum is empty or weak,
/// slow when strong networks exist but none are eligible.
pub const BORED_HOP_FAST_MS: u32 = 500;
pub const BORED_HOP_SLOW_MS: u32 = 2_000;
pub const TARGET_MAX_ATTEMPTS: u8 = 4;
/// Candidates weaker than this are never attacked.
pub const ATTACK_MIN_RSSI: i8 = -80;
/// Target selection suppressed until this long after start...
pub const TARGET_WARMUP_MIN_MS: u32 = 1_500;
/// ...and forced permitted after this long regardless of coverage.
pub const TARGET_WARMUP_FORCE_MS: u32 = 5_000;
/// Post-timeout cooldown range, scaled by RSSI (strong = short).
pub const COOLDOWN_MIN_MS: u32 = 4_000;
pub const COOLDOWN_MAX_MS: u32 = 12_000;
/// Frames per deauth burst and per-frame jitter ceiling.
pub const DEAUTH_BURST_FRAMES: u8 = 4;
pub const DEAUTH_JITTER_MAX_MS: u32 = 8;
/// Consecutive empty scan cycles before the engine gets bored.
pub const MAX_FAILED_SCANS: u8 = 3;
/// Clients tracked per locked target.
pub const MAX_CLIENTS: usize = 8;
/// A client counts as "recent" for fast-tracking within this window.
pub const CLIENT_FRESH_MS: u32 = 10_000;

// ── Exclusion list ────────────────────────────────────────────────────

pub const MAX_EXCLUSIONS: usize = 50;

// ── Runtime-tunable subset ────────────────────────────────────────────

/// Thresholds the application may override from a JSON file on SD.
///
/// Only the heap-governance gates and the attack/capture timings are
/// runtime-tunable; collection caps and buffer sizes stay compile-time.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Tunables {
    pub min_heap_for_tls: usize,
    pub min_contig_for_tls: usize,
    pub proactive_contig_threshold: usize,
    pub stable_threshold: usize,
    pub pressure_free: [usize; 3],
    pub pressure_frag: [f32; 3],
    pub pressure_hysteresis_ms: u32,
    pub conditioning_dwell_ms: u32,
    pub conditioning_step_ms: u32,
    pub hop_base_primary_ms: u16,
    pub hop_base_secondary_ms: u16,
    pub attack_deauth_interval_ms: u32,
    pub attack_timeout_ms: u32,
    pub attack_wait_ms: u32,
    pub attack_bored_retry_ms: u32,
    pub attack_target_max_attempts: u8,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            min_heap_for_tls: MIN_HEAP_FOR_TLS,
            min_contig_for_tls: MIN_CONTIG_FOR_TLS,
            proactive_contig_threshold: PROACTIVE_CONTIG_THRESHOLD,
            stable_threshold: HEAP_STABLE_THRESHOLD,
            pressure_free: [PRESSURE_L1_FREE, PRESSURE_L2_FREE, PRESSURE_L3_FREE],
            pressure_frag: [PRESSURE_L1_FRAG, PRESSURE_L2_FRAG, PRESSURE_L3_FRAG],
            pressure_hysteresis_ms: PRESSURE_HYSTERESIS_MS,
            conditioning_dwell_ms: CONDITIONING_DWELL_MS,
            conditioning_step_ms: CONDITIONING_STEP_MS,
            hop_base_primary_ms: HOP_BASE_PRIMARY_MS,
            hop_base_secondary_ms: HOP_BASE_SECONDARY_MS,
            attack_deauth_interval_ms: DEAUTH_BURST_INTERVAL_MS,
            attack_timeout_ms: ATTACK_TIMEOUT_MS,
            attack_wait_ms: ATTACK_WAIT_MS,
            attack_bored_retry_ms: BORED_RETRY_MS,
            attack_target_max_attempts: TARGET_MAX_ATTEMPTS,
        }
    }
}

impl Tunables {
    /// Parse an override file. Returns defaults-merged values; a malformed
    /// file yields `None` so the caller can log and fall back to defaults.
    pub fn from_json(bytes: &[u8]) -> Option<Self> {
        serde_json_core::from_slice::<Tunables>(bytes)
            .ok()
            .map(|(t, _)| t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy_constants() {
        let t = Tunables::default();
        assert_eq!(t.min_heap_for_tls, 35_000);
        assert_eq!(t.min_contig_for_tls, 35_000);
        assert_eq!(t.pressure_free, [80_000, 50_000, 30_000]);
        assert_eq!(t.attack_deauth_interval_ms, 180);
        assert_eq!(t.attack_timeout_ms, 15_000);
        assert_eq!(t.attack_bored_retry_ms, 30_000);
    }

    #[test]
    fn tunables_parse_partial_json() {
        let t = Tunables::from_json(br#"{"min_heap_for_tls":40000,"attack_timeout_ms":10000}"#)
            .unwrap();
        assert_eq!(t.min_heap_for_tls, 40_000);
        assert_eq!(t.attack_timeout_ms, 10_000);
        // Untouched fields fall back to defaults
        assert_eq!(t.min_contig_for_tls, 35_000);
    }

    #[test]
    fn tunables_reject_garbage() {
        assert!(Tunables::from_json(b"not json").is_none());
    }

    #[test]
    fn channel_orders_cover_all_13() {
        for order in [&CHANNEL_ORDER, &CONDITIONING_CHANNELS] {
            let mut seen = [false; 14];
            for &ch in order.iter() {
                seen[ch as usize] = true;
            }
            assert!(seen[1..=13].iter().all(|&s| s));
        }
    }
}
