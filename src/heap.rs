//! Heap governance — sampling, graduated pressure, admission gates, and
//! active conditioning.
//!
//! The allocator is only ever queried on the main thread; the latest
//! sample is republished through atomics so admission gates are callable
//! from any context (including the radio callback) without touching the
//! allocator.
//!
//! Conditioning exploits the allocator's immediate coalescing: the WiFi
//! driver's per-packet alloc/free churn merges free neighbours of its
//! long-lived buffers, recovering contiguous space for TLS-class
//! allocations. Channel hopping keeps packets arriving so the driver
//! actually churns.

use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::platform::{CompanionBle, Delay, HeapStats, Radio, Storage, StorageError};
use crate::policy::{self, Tunables};

// ── Pressure levels ───────────────────────────────────────────────────

/// Graduated memory pressure. Consumers shed load accordingly: Caution
/// drops non-essentials, Warning rejects new capture inserts and SD
/// writes, Critical permits only the eviction-preserving emergency path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum PressureLevel {
    #[default]
    Normal = 0,
    Caution = 1,
    Warning = 2,
    Critical = 3,
}

impl PressureLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PressureLevel::Normal,
            1 => PressureLevel::Caution,
            2 => PressureLevel::Warning,
            _ => PressureLevel::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Caution => "caution",
            PressureLevel::Warning => "warning",
            PressureLevel::Critical => "critical",
        }
    }
}

/// TLS admission failure, fragmentation checked first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsGateFailure {
    /// Largest contiguous block below the gate.
    Fragmented,
    /// Total free heap below the gate.
    LowHeap,
}

/// Why a bounded-collection insert was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertReject {
    /// Collection at its hard element cap.
    Full,
    /// Free heap below the collection's floor.
    LowHeap,
    /// Largest block below element size + slack.
    Fragmented,
    /// Pressure at or above the collection's blocking level.
    Pressure(PressureLevel),
}

// ── Published snapshot (atomics) ──────────────────────────────────────

static CACHED_FREE: AtomicUsize = AtomicUsize::new(usize::MAX);
static CACHED_LARGEST: AtomicUsize = AtomicUsize::new(usize::MAX);
static CACHED_PRESSURE: AtomicU8 = AtomicU8::new(0);

/// Last sampled free heap. Callable from any context.
pub fn cached_free() -> usize {
    CACHED_FREE.load(Ordering::Relaxed)
}

/// Last sampled largest contiguous block. Callable from any context.
pub fn cached_largest() -> usize {
    CACHED_LARGEST.load(Ordering::Relaxed)
}

/// Current pressure level. Callable from any context.
pub fn pressure_level() -> PressureLevel {
    PressureLevel::from_u8(CACHED_PRESSURE.load(Ordering::Relaxed))
}

#[cfg(test)]
pub(crate) fn test_set_cached(free: usize, largest: usize, pressure: PressureLevel) {
    CACHED_FREE.store(free, Ordering::Relaxed);
    CACHED_LARGEST.store(largest, Ordering::Relaxed);
    CACHED_PRESSURE.store(pressure as u8, Ordering::Relaxed);
}

/// Admission gate for bounded-collection inserts, evaluated against the
/// cached snapshot. Never blocks, never touches the allocator.
pub fn admit_insert(
    min_free: usize,
    elem_size: usize,
    slack: usize,
    blocking_level: PressureLevel,
) -> Result<(), InsertReject> {
    let level = pressure_level();
    if level >= blocking_level {
        return Err(InsertReject::Pressure(level));
    }
    if cached_free() < min_free {
        return Err(InsertReject::LowHeap);
    }
    if cached_largest() < elem_size + slack {
        return Err(InsertReject::Fragmented);
    }
    Ok(())
}

// ── Snapshot ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct HeapSnapshot {
    pub free: usize,
    pub largest: usize,
    pub sampled_at_ms: u32,
}

impl HeapSnapshot {
    /// largest / free — 1.0 means one contiguous region, small values
    /// mean shattered heap.
    pub fn fragmentation_ratio(&self) -> f32 {
        if self.free == 0 {
            0.0
        } else {
            self.largest as f32 / self.free as f32
        }
    }
}

/// O(1) allocator query. Pure; no side effects.
pub fn snapshot(heap: &impl HeapStats, now_ms: u32) -> HeapSnapshot {
    HeapSnapshot {
        free: heap.free_bytes(),
        largest: heap.largest_free_block(),
        sampled_at_ms: now_ms,
    }
}

/// Pure TLS gate: fragmentation first, then free heap.
pub fn gate_tls(heap: &impl HeapStats, t: &Tunables) -> Result<(), TlsGateFailure> {
    if heap.largest_free_block() < t.min_contig_for_tls {
        return Err(TlsGateFailure::Fragmented);
    }
    if heap.free_bytes() < t.min_heap_for_tls {
        return Err(TlsGateFailure::LowHeap);
    }
    Ok(())
}

/// Worth conditioning before it matters: gate passes but headroom is
/// thin.
pub fn should_proactively_condition(heap: &impl HeapStats, t: &Tunables) -> bool {
    let largest = heap.largest_free_block();
    largest < t.proactive_contig_threshold && largest >= t.min_contig_for_tls
}

/// Growth gate for bounded collections: enough free heap and the heap
/// not too shattered.
pub fn can_grow(heap: &impl HeapStats, min_free: usize, min_frag_ratio: f32) -> bool {
    let free = heap.free_bytes();
    if free < min_free {
        return false;
    }
    let frag = if free == 0 {
        0.0
    } else {
        heap.largest_free_block() as f32 / free as f32
    };
    frag >= min_frag_ratio
}

// ── Monitor ───────────────────────────────────────────────────────────

/// Rate-limited heap health tracking: watermarks, health percent,
/// pressure with hysteresis, and the conditioning-request latch.
pub struct HeapMonitor {
    tunables: Tunables,
    last_sample_ms: u32,
    sampled_once: bool,

    health_pct: u8,
    display_pct: f32,

    peak_free: usize,
    peak_largest: usize,
    min_free: usize,
    min_largest: usize,
    prev_min_free: u32,
    prev_min_largest: u32,

    pressure: PressureLevel,
    /// Candidate better level + when it first held, for hysteresis.
    relax_candidate: PressureLevel,
    relax_since_ms: u32,

    condition_pending: bool,
    last_condition_ms: u32,
    conditioned_once: bool,

    last_watermark_save_ms: u32,
}

/// Watermark file record: magic + session minimums.
const WATERMARK_MAGIC: [u8; 4] = *b"BHW1";
const WATERMARK_LEN: usize = 12;
/// Watermark file path (relative to the storage root).
pub const WATERMARK_PATH: &str = "/boarhound/meta/heap_watermarks.bin";

impl HeapMonitor {
    pub fn new(tunables: Tunables) -> Self {
        Self {
            tunables,
            last_sample_ms: 0,
            sampled_once: false,
            health_pct: 100,
            display_pct: 100.0,
            peak_free: 0,
            peak_largest: 0,
            min_free: 0,
            min_largest: 0,
            prev_min_free: 0,
            prev_min_largest: 0,
            pressure: PressureLevel::Normal,
            relax_candidate: PressureLevel::Normal,
            relax_since_ms: 0,
            condition_pending: false,
            last_condition_ms: 0,
            conditioned_once: false,
            last_watermark_save_ms: 0,
        }
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// Main-loop update, rate-limited to the sampling interval.
    pub fn update(&mut self, heap: &impl HeapStats, now_ms: u32) {
        if self.sampled_once
            && now_ms.wrapping_sub(self.last_sample_ms) < policy::HEALTH_SAMPLE_INTERVAL_MS
        {
            return;
        }
        self.last_sample_ms = now_ms;
        self.sampled_once = true;

        let free = heap.free_bytes();
        let largest = heap.largest_free_block();

        if self.peak_free == 0 || self.peak_largest == 0 {
            self.peak_free = free;
            self.peak_largest = largest;
        }
        if free > self.peak_free {
            self.peak_free = free;
        }
        if largest > self.peak_largest {
            self.peak_largest = largest;
        }
        if self.min_free == 0 || free < self.min_free {
            self.min_free = free;
        }
        if self.min_largest == 0 || largest < self.min_largest {
            self.min_largest = largest;
        }

        let pct = self.compute_percent(free, largest);
        self.health_pct = pct;

        // Asymmetric display smoothing: slow fall, moderate rise
        let alpha = if (pct as f32) < self.display_pct {
            policy::DISPLAY_EMA_ALPHA_DOWN
        } else {
            policy::DISPLAY_EMA_ALPHA_UP
        };
        self.display_pct += alpha * (pct as f32 - self.display_pct);

        self.update_pressure(free, largest, now_ms);
        self.update_condition_latch(pct, largest, now_ms);

        CACHED_FREE.store(free, Ordering::Relaxed);
        CACHED_LARGEST.store(largest, Ordering::Relaxed);
        CACHED_PRESSURE.store(self.pressure as u8, Ordering::Relaxed);
    }

    fn compute_percent(&self, free: usize, largest: usize) -> u8 {
        let free_norm = if self.peak_free > 0 {
            free as f32 / self.peak_free as f32
        } else {
            0.0
        };
        let contig_norm = if self.peak_largest > 0 {
            largest as f32 / self.peak_largest as f32
        } else {
            0.0
        };
        let free_gate = free as f32 / self.tunables.min_heap_for_tls as f32;
        let contig_gate = largest as f32 / self.tunables.min_contig_for_tls as f32;

        let mut health = free_norm.min(contig_norm).min(free_gate.min(contig_gate));

        let frag_ratio = if free > 0 {
            largest as f32 / free as f32
        } else {
            0.0
        };
        let frag_penalty = (frag_ratio / policy::HEALTH_FRAG_PENALTY_SCALE).clamp(0.0, 1.0);
        health = (health * frag_penalty).clamp(0.0, 1.0);

        (health * 100.0 + 0.5) as u8
    }

    fn raw_pressure(&self, free: usize, largest: usize) -> PressureLevel {
        let t = &self.tunables;
        let by_free = if free < t.pressure_free[2] {
            PressureLevel::Critical
        } else if free < t.pressure_free[1] {
            PressureLevel::Warning
        } else if free < t.pressure_free[0] {
            PressureLevel::Caution
        } else {
            PressureLevel::Normal
        };
        let frag = if free > 0 {
            largest as f32 / free as f32
        } else {
            0.0
        };
        let by_frag = if frag < t.pressure_frag[2] {
            PressureLevel::Critical
        } else if frag < t.pressure_frag[1] {
            PressureLevel::Warning
        } else if frag < t.pressure_frag[0] {
            PressureLevel::Caution
        } else {
            PressureLevel::Normal
        };
        by_free.max(by_frag)
    }

    fn update_pressure(&mut self, free: usize, largest: usize, now_ms: u32) {
        let raw = self.raw_pressure(free, largest);
        if raw >= self.pressure {
            // Toward severe: immediate
            if raw > self.pressure {
                log::warn!(
                    "heap pressure {} -> {} (free={} largest={})",
                    self.pressure.as_str(),
                    raw.as_str(),
                    free,
                    largest
                );
            }
            self.pressure = raw;
            self.relax_candidate = raw;
            return;
        }
        // Toward normal: must hold for the hysteresis dwell
        if raw != self.relax_candidate {
            self.relax_candidate = raw;
            self.relax_since_ms = now_ms;
            return;
        }
        if now_ms.wrapping_sub(self.relax_since_ms) >= self.tunables.pressure_hysteresis_ms {
            log::info!(
                "heap pressure {} -> {}",
                self.pressure.as_str(),
                raw.as_str()
            );
            self.pressure = raw;
        }
    }

    fn update_condition_latch(&mut self, pct: u8, largest: usize, now_ms: u32) {
        if !self.condition_pending {
            let pct_low = pct <= policy::HEALTH_CONDITION_TRIGGER_PCT;
            let contig_low = largest < self.tunables.proactive_contig_threshold;
            let cooled = !self.conditioned_once
                || now_ms.wrapping_sub(self.last_condition_ms) >= self.condition_cooldown(largest);
            if pct_low && contig_low && cooled {
                self.condition_pending = true;
            }
        } else {
            let pct_recovered = pct >= policy::HEALTH_CONDITION_CLEAR_PCT;
            let contig_recovered = largest >= self.tunables.proactive_contig_threshold;
            if pct_recovered && contig_recovered {
                self.condition_pending = false;
            }
        }
    }

    /// Adaptive retry spacing: a shattered heap retries at the floor, a
    /// healthy one waits out the full maximum.
    fn condition_cooldown(&self, largest: usize) -> u32 {
        let scaled = (policy::CONDITION_COOLDOWN_BASE_MS as u64 * largest as u64
            / self.tunables.min_contig_for_tls.max(1) as u64) as u32;
        scaled.clamp(
            policy::CONDITION_COOLDOWN_MIN_MS,
            policy::CONDITION_COOLDOWN_MAX_MS,
        )
    }

    /// Latched request set by `update()`; consuming clears it.
    pub fn consume_condition_request(&mut self) -> bool {
        if !self.condition_pending {
            return false;
        }
        self.condition_pending = false;
        true
    }

    pub fn health_percent(&self) -> u8 {
        self.health_pct
    }

    /// EMA-smoothed percent for display.
    pub fn display_percent(&self) -> u8 {
        (self.display_pct + 0.5) as u8
    }

    pub fn pressure(&self) -> PressureLevel {
        self.pressure
    }

    pub fn min_free(&self) -> u32 {
        self.min_free as u32
    }

    pub fn min_largest(&self) -> u32 {
        self.min_largest as u32
    }

    pub fn prev_min_free(&self) -> u32 {
        self.prev_min_free
    }

    pub fn prev_min_largest(&self) -> u32 {
        self.prev_min_largest
    }

    /// Rebase peaks and minimums on the current heap; clears the latch.
    pub fn reset_peaks(&mut self, heap: &impl HeapStats, now_ms: u32) {
        self.peak_free = heap.free_bytes();
        self.peak_largest = heap.largest_free_block();
        self.min_free = self.peak_free;
        self.min_largest = self.peak_largest;
        self.health_pct = self.compute_percent(self.peak_free, self.peak_largest);
        self.condition_pending = false;
        self.last_condition_ms = now_ms;
        self.conditioned_once = true;
        self.last_sample_ms = now_ms;
    }

    /// Load the previous session's minimum watermarks, if a record
    /// exists. Call once after storage init.
    pub fn load_previous_session(&mut self, storage: &mut impl Storage) {
        let mut buf = [0u8; WATERMARK_LEN];
        match storage.read(WATERMARK_PATH, &mut buf) {
            Ok(n) if n == WATERMARK_LEN && buf[..4] == WATERMARK_MAGIC => {
                self.prev_min_free = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
                self.prev_min_largest = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
                log::info!(
                    "previous session watermarks: min_free={} min_largest={}",
                    self.prev_min_free,
                    self.prev_min_largest
                );
            }
            _ => {}
        }
    }

    /// Persist session watermarks, rate-limited. SD writes are blocked
    /// at Warning and above.
    pub fn persist_watermarks(
        &mut self,
        storage: &mut impl Storage,
        now_ms: u32,
    ) -> Result<(), StorageError> {
        if self.last_watermark_save_ms != 0
            && now_ms.wrapping_sub(self.last_watermark_save_ms) < policy::WATERMARK_SAVE_INTERVAL_MS
        {
            return Ok(());
        }
        if self.pressure >= PressureLevel::Warning {
            return Ok(());
        }
        self.last_watermark_save_ms = now_ms;

        let mut record = [0u8; WATERMARK_LEN];
        record[..4].copy_from_slice(&WATERMARK_MAGIC);
        record[4..8].copy_from_slice(&self.min_free().to_le_bytes());
        record[8..12].copy_from_slice(&self.min_largest().to_le_bytes());
        storage.write(WATERMARK_PATH, &record)
    }

    // ── Conditioning ──────────────────────────────────────────────────

    /// Active heap conditioning. Returns the largest contiguous block
    /// after the attempt — callers compare against their threshold.
    /// Cannot fail; any intermediate hiccup still leaves the driver in
    /// STA / promiscuous-off.
    pub fn condition_heap(
        &mut self,
        radio: &mut impl Radio,
        ble: &mut impl CompanionBle,
        heap: &impl HeapStats,
        delay: &mut impl Delay,
        now_ms: u32,
    ) -> usize {
        let initial_free = heap.free_bytes();
        let initial_largest = heap.largest_free_block();
        log::info!(
            "conditioning: free={} largest={}",
            initial_free,
            initial_largest
        );

        // Phase A: companion-radio teardown. A stopped BLE stack still
        // holds 20-30KB of buffers; only deinit releases them.
        if ble.is_initialized() {
            log::info!("conditioning: deinitializing BLE stack");
            if ble.is_scanning() {
                ble.stop_scan();
                delay.delay_ms(policy::BLE_STOP_DELAY_MS);
            }
            if ble.is_advertising() {
                ble.stop_advertising();
                delay.delay_ms(policy::BLE_STOP_DELAY_MS);
            }
            ble.deinit();
            delay.delay_ms(policy::BLE_DEINIT_DELAY_MS);
            log::info!(
                "conditioning: BLE down, free={} largest={}",
                heap.free_bytes(),
                heap.largest_free_block()
            );
        }

        // Phase B: driver exercise. STA mode allocates the driver's
        // RX/TX pools (free heap dips here); promiscuous reception with
        // no filter drives the per-packet churn that coalesces.
        CONDITIONING_PACKETS.store(0, Ordering::Relaxed);
        radio.set_station_mode();
        delay.delay_ms(policy::WIFI_MODE_DELAY_MS);
        radio.disconnect();
        delay.delay_ms(policy::WIFI_DISCONNECT_DELAY_MS);
        radio.set_promiscuous_callback(Some(conditioning_rx));
        radio.clear_promiscuous_filter();
        radio.set_promiscuous(true);
        radio.set_channel(policy::CONDITIONING_CHANNELS[0]);

        let step_ms = self.tunables.conditioning_step_ms.max(1);
        let dwell_ms = self.tunables.conditioning_dwell_ms;
        let steps = dwell_ms.div_ceil(step_ms).max(1);
        for i in 0..steps {
            radio.set_channel(
                policy::CONDITIONING_CHANNELS[(i as usize) % policy::CONDITIONING_CHANNELS.len()],
            );
            delay.delay_ms(step_ms);

            let elapsed_ms = (i + 1) * step_ms;
            let current_largest = heap.largest_free_block();
            if elapsed_ms > policy::CONDITIONING_WARMUP_MS
                && current_largest > self.tunables.stable_threshold
            {
                log::info!(
                    "conditioning: early exit at {}ms, largest={} pkts={}",
                    elapsed_ms,
                    current_largest,
                    CONDITIONING_PACKETS.load(Ordering::Relaxed)
                );
                break;
            }
            if elapsed_ms % policy::CONDITIONING_LOG_INTERVAL_MS == 0 {
                log::info!(
                    "conditioning: {}s free={} largest={} pkts={}",
                    elapsed_ms / 1000,
                    heap.free_bytes(),
                    current_largest,
                    CONDITIONING_PACKETS.load(Ordering::Relaxed)
                );
            }
        }

        // Phase C: teardown to a known driver state
        radio.set_promiscuous(false);
        radio.set_promiscuous_callback(None);
        radio.disconnect();
        radio.set_station_mode();
        delay.delay_ms(policy::WIFI_SHUTDOWN_DELAY_MS);
        delay.delay_ms(policy::CONDITIONING_FINAL_DELAY_MS);

        let final_free = heap.free_bytes();
        let final_largest = heap.largest_free_block();
        log::info!(
            "conditioning complete: free={} ({:+}) largest={} ({:+})",
            final_free,
            final_free as i64 - initial_free as i64,
            final_largest,
            final_largest as i64 - initial_largest as i64,
        );
        self.reset_peaks(heap, now_ms);

        CACHED_FREE.store(final_free, Ordering::Relaxed);
        CACHED_LARGEST.store(final_largest, Ordering::Relaxed);
        CACHED_PRESSURE.store(
            self.raw_pressure(final_free, final_largest) as u8,
            Ordering::Relaxed,
        );
        self.pressure = self.raw_pressure(final_free, final_largest);
        self.relax_candidate = self.pressure;

        final_largest
    }
}

/// Packets seen by the conditioning callback — progress signal only.
static CONDITIONING_PACKETS: AtomicU32 = AtomicU32::new(0);

fn conditioning_rx(_frame: &[u8], _rssi: i8, _channel: u8, _now_ms: u32) {
    CONDITIONING_PACKETS.fetch_add(1, Ordering::Relaxed);
}
