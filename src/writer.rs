//! Capture sinks — the only place that knows on-disk formats.
//!
//! Engines hand completed captures to a [`CaptureSink`] and stay
//! ignorant of rendering. The shipped implementation writes both
//! canonical formats the way crackers expect them: a hashcat 22000
//! line and a libpcap file with a minimal radiotap prefix.

use core::fmt::Write as _;

use heapless::{String, Vec};

use crate::platform::{Storage, StorageError};

/// Capture directory on the storage medium.
pub const CAPTURES_DIR: &str = "/boarhound/handshakes";

/// Message-pair codes in the 22000 format.
pub const MESSAGE_PAIR_M1M2: u8 = 0x00;
pub const MESSAGE_PAIR_M2M3: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkError {
    Storage(StorageError),
    /// Record fields missing or malformed (short frames, no SSID).
    BadRecord,
}

impl From<StorageError> for SinkError {
    fn from(e: StorageError) -> Self {
        SinkError::Storage(e)
    }
}

/// One captured EAPOL message ready for export.
pub struct FrameExport<'a> {
    /// EAPOL payload (hashcat side).
    pub eapol: &'a [u8],
    /// Full 802.11 frame (pcap side); may be empty.
    pub full_frame: &'a [u8],
    pub timestamp_ms: u32,
}

/// A completed handshake ready for export.
pub struct HandshakeExport<'a> {
    pub ssid: &'a str,
    pub bssid: [u8; 6],
    pub station: [u8; 6],
    /// Slots M1..M4; `None` = message not captured.
    pub frames: [Option<FrameExport<'a>>; 4],
    pub beacon: Option<&'a [u8]>,
    pub beacon_timestamp_ms: u32,
    /// 0x00 = M1+M2, 0x02 = M2+M3.
    pub message_pair: u8,
}

/// The narrow seam the engines depend on.
pub trait CaptureSink {
    fn ensure_directory(&mut self) -> Result<(), SinkError>;
    fn write_pmkid_record(
        &mut self,
        ssid: &str,
        bssid: &[u8; 6],
        station: &[u8; 6],
        pmkid: &[u8; 16],
    ) -> Result<(), SinkError>;
    fn write_handshake_records(&mut self, hs: &HandshakeExport<'_>) -> Result<(), SinkError>;
}

// ── Hex helpers ───────────────────────────────────────────────────────

fn push_hex<const N: usize>(out: &mut String<N>, bytes: &[u8]) {
    for &b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn decode_hex(src: &str, out: &mut [u8]) -> Option<usize> {
    let bytes = src.as_bytes();
    if bytes.len() % 2 != 0 || bytes.len() / 2 > out.len() {
        return None;
    }
    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        out[i] = hex_nibble(pair[0])? << 4 | hex_nibble(pair[1])?;
    }
    Some(bytes.len() / 2)
}

// ── Filenames ─────────────────────────────────────────────────────────

pub type PathString = String<96>;

/// SSIDs go into filenames with anything outside `[A-Za-z0-9_-]`
/// replaced, truncated to 20 characters; empty becomes "hidden".
pub fn sanitize_ssid(ssid: &str) -> String<20> {
    let mut out: String<20> = String::new();
    for &b in ssid.as_bytes().iter().take(20) {
        let c = if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            b as char
        } else {
            '_'
        };
        let _ = out.push(c);
    }
    if out.is_empty() {
        let _ = out.push_str("hidden");
    }
    out
}

/// `<dir>/<sanitized-ssid>_<BSSID-hex><suffix>`.
pub fn build_capture_filename(dir: &str, ssid: &str, bssid: &[u8; 6], suffix: &str) -> PathString {
    let mut path = PathString::new();
    let _ = write!(
        path,
        "{}/{}_{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}{}",
        dir,
        sanitize_ssid(ssid),
        bssid[0],
        bssid[1],
        bssid[2],
        bssid[3],
        bssid[4],
        bssid[5],
        suffix
    );
    path
}

// ── Record rendering ──────────────────────────────────────────────────

type RecordLine = String<1536>;

/// `WPA*01*PMKID*MAC_AP*MAC_CLIENT*ESSID***01`
fn render_pmkid_line(
    ssid: &str,
    bssid: &[u8; 6],
    station: &[u8; 6],
    pmkid: &[u8; 16],
) -> RecordLine {
    let mut line = RecordLine::new();
    let _ = line.push_str("WPA*01*");
    push_hex(&mut line, pmkid);
    let _ = line.push('*');
    push_hex(&mut line, bssid);
    let _ = line.push('*');
    push_hex(&mut line, station);
    let _ = line.push('*');
    push_hex(&mut line, &ssid.as_bytes()[..ssid.len().min(32)]);
    let _ = line.push_str("***01\n");
    line
}

/// `WPA*02*MIC*MAC_AP*MAC_CLIENT*ESSID*ANONCE*EAPOL*MESSAGEPAIR`
///
/// The ANonce comes from M1 (pair 0x00) or M3 (pair 0x02); the EAPOL
/// blob is always M2 with its MIC zeroed. Returns `None` when the
/// frames are too short to carry the claimed fields.
fn render_handshake_line(hs: &HandshakeExport<'_>) -> Option<RecordLine> {
    let nonce_frame = match hs.message_pair {
        MESSAGE_PAIR_M1M2 => hs.frames[0].as_ref()?,
        MESSAGE_PAIR_M2M3 => hs.frames[2].as_ref()?,
        _ => return None,
    };
    let eapol_frame = hs.frames[1].as_ref()?;
    // Nonce needs 32 bytes at offset 17, the M2 its MIC at 81..97
    if nonce_frame.eapol.len() < 51 || eapol_frame.eapol.len() < 97 {
        return None;
    }

    // EAPOL length from the header length field, capped at what we hold
    let framed_len =
        (u16::from_be_bytes([eapol_frame.eapol[2], eapol_frame.eapol[3]]) as usize + 4)
            .min(eapol_frame.eapol.len());
    if framed_len < 97 {
        return None;
    }

    let mut eapol_copy: Vec<u8, { crate::policy::EAPOL_MAX_LEN }> = Vec::new();
    eapol_copy.extend_from_slice(&eapol_frame.eapol[..framed_len]).ok()?;
    // MIC zeroed for the hash format
    for b in &mut eapol_copy[81..97] {
        *b = 0;
    }

    let mut line = RecordLine::new();
    let _ = line.push_str("WPA*02*");
    push_hex(&mut line, &eapol_frame.eapol[81..97]);
    let _ = line.push('*');
    push_hex(&mut line, &hs.bssid);
    let _ = line.push('*');
    push_hex(&mut line, &hs.station);
    let _ = line.push('*');
    push_hex(&mut line, &hs.ssid.as_bytes()[..hs.ssid.len().min(32)]);
    let _ = line.push('*');
    push_hex(&mut line, &nonce_frame.eapol[17..49]);
    let _ = line.push('*');
    push_hex(&mut line, &eapol_copy);
    let _ = write!(line, "*{:02x}\n", hs.message_pair);
    Some(line)
}

// ── pcap rendering ────────────────────────────────────────────────────

/// Minimal radiotap header: revision 0, length 8, no optional fields.
const RADIOTAP_HEADER: [u8; 8] = [0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00];
const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
const LINKTYPE_IEEE802_11_RADIOTAP: u32 = 127;

type PcapBuf = Vec<u8, 3072>;

fn pcap_append_packet(out: &mut PcapBuf, timestamp_ms: u32, frame: &[u8]) {
    let total = (RADIOTAP_HEADER.len() + frame.len()) as u32;
    let _ = out.extend_from_slice(&(timestamp_ms / 1000).to_le_bytes());
    let _ = out.extend_from_slice(&((timestamp_ms % 1000) * 1000).to_le_bytes());
    let _ = out.extend_from_slice(&total.to_le_bytes());
    let _ = out.extend_from_slice(&total.to_le_bytes());
    let _ = out.extend_from_slice(&RADIOTAP_HEADER);
    let _ = out.extend_from_slice(frame);
}

/// Classic libpcap capture: global header, optional beacon packet, then
/// every captured full frame.
fn render_pcap(hs: &HandshakeExport<'_>) -> PcapBuf {
    let mut out = PcapBuf::new();
    let _ = out.extend_from_slice(&PCAP_MAGIC.to_le_bytes());
    let _ = out.extend_from_slice(&2u16.to_le_bytes());
    let _ = out.extend_from_slice(&4u16.to_le_bytes());
    let _ = out.extend_from_slice(&0i32.to_le_bytes());
    let _ = out.extend_from_slice(&0u32.to_le_bytes());
    let _ = out.extend_from_slice(&65535u32.to_le_bytes());
    let _ = out.extend_from_slice(&LINKTYPE_IEEE802_11_RADIOTAP.to_le_bytes());

    if let Some(beacon) = hs.beacon {
        if !beacon.is_empty() {
            pcap_append_packet(&mut out, hs.beacon_timestamp_ms, beacon);
        }
    }
    for frame in hs.frames.iter().flatten() {
        if !frame.full_frame.is_empty() {
            pcap_append_packet(&mut out, frame.timestamp_ms, frame.full_frame);
        }
    }
    out
}

// ── Sink implementations ──────────────────────────────────────────────

/// The shipped sink: hashcat 22000 line plus pcap file per capture.
pub struct HashcatPcapSink<S: Storage> {
    storage: S,
    dir: &'static str,
}

impl<S: Storage> HashcatPcapSink<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            dir: CAPTURES_DIR,
        }
    }

    pub fn with_dir(storage: S, dir: &'static str) -> Self {
        Self { storage, dir }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }
}

impl<S: Storage> CaptureSink for HashcatPcapSink<S> {
    fn ensure_directory(&mut self) -> Result<(), SinkError> {
        self.storage.ensure_dir(self.dir)?;
        Ok(())
    }

    fn write_pmkid_record(
        &mut self,
        ssid: &str,
        bssid: &[u8; 6],
        station: &[u8; 6],
        pmkid: &[u8; 16],
    ) -> Result<(), SinkError> {
        if ssid.is_empty() {
            return Err(SinkError::BadRecord);
        }
        self.ensure_directory()?;
        let line = render_pmkid_line(ssid, bssid, station, pmkid);
        let path = build_capture_filename(self.dir, ssid, bssid, ".22000");
        self.storage.write(&path, line.as_bytes())?;
        log::info!("pmkid saved: {}", path.as_str());
        Ok(())
    }

    fn write_handshake_records(&mut self, hs: &HandshakeExport<'_>) -> Result<(), SinkError> {
        if hs.ssid.is_empty() {
            return Err(SinkError::BadRecord);
        }
        let line = render_handshake_line(hs).ok_or(SinkError::BadRecord)?;
        self.ensure_directory()?;
        let path = build_capture_filename(self.dir, hs.ssid, &hs.bssid, "_hs.22000");
        self.storage.write(&path, line.as_bytes())?;

        let pcap = render_pcap(hs);
        let pcap_path = build_capture_filename(self.dir, hs.ssid, &hs.bssid, ".pcap");
        self.storage.write(&pcap_path, &pcap)?;
        log::info!("handshake saved: {}", path.as_str());
        Ok(())
    }
}

/// Counts calls and succeeds — for tests and dry runs.
#[derive(Default)]
pub struct NoopSink {
    pub pmkid_writes: u32,
    pub handshake_writes: u32,
}

impl NoopSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureSink for NoopSink {
    fn ensure_directory(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn write_pmkid_record(
        &mut self,
        _ssid: &str,
        _bssid: &[u8; 6],
        _station: &[u8; 6],
        _pmkid: &[u8; 16],
    ) -> Result<(), SinkError> {
        self.pmkid_writes += 1;
        Ok(())
    }

    fn write_handshake_records(&mut self, _hs: &HandshakeExport<'_>) -> Result<(), SinkError> {
        self.handshake_writes += 1;
        Ok(())
    }
}

// ── Record parsing (round-trips, captures browser) ────────────────────

/// A decoded 22000 line.
pub struct ParsedRecord {
    /// 1 = PMKID, 2 = handshake.
    pub kind: u8,
    /// PMKID or MIC, by kind.
    pub key: [u8; 16],
    pub bssid: [u8; 6],
    pub station: [u8; 6],
    pub essid: String<32>,
    pub anonce: [u8; 32],
    pub eapol: Vec<u8, { crate::policy::EAPOL_MAX_LEN }>,
    pub message_pair: u8,
}

/// Parse one `WPA*NN*...` line back into its fields.
pub fn parse_hashcat_record(line: &str) -> Option<ParsedRecord> {
    let line = line.trim_end();
    let mut fields = line.split('*');
    if fields.next()? != "WPA" {
        return None;
    }
    let kind: u8 = match fields.next()? {
        "01" => 1,
        "02" => 2,
        _ => return None,
    };

    let mut key = [0u8; 16];
    if decode_hex(fields.next()?, &mut key)? != 16 {
        return None;
    }
    let mut bssid = [0u8; 6];
    if decode_hex(fields.next()?, &mut bssid)? != 6 {
        return None;
    }
    let mut station = [0u8; 6];
    if decode_hex(fields.next()?, &mut station)? != 6 {
        return None;
    }
    let essid_hex = fields.next()?;
    let mut essid_bytes = [0u8; 32];
    let essid_len = decode_hex(essid_hex, &mut essid_bytes)?;
    let mut essid: String<32> = String::new();
    let _ = essid.push_str(core::str::from_utf8(&essid_bytes[..essid_len]).ok()?);

    let mut anonce = [0u8; 32];
    let mut eapol: Vec<u8, { crate::policy::EAPOL_MAX_LEN }> = Vec::new();
    let mut message_pair = 0x01;

    if kind == 2 {
        if decode_hex(fields.next()?, &mut anonce)? != 32 {
            return None;
        }
        let eapol_hex = fields.next()?;
        let mut buf = [0u8; crate::policy::EAPOL_MAX_LEN];
        let n = decode_hex(eapol_hex, &mut buf)?;
        eapol.extend_from_slice(&buf[..n]).ok()?;
        let mut pair = [0u8; 1];
        decode_hex(fields.next()?, &mut pair)?;
        message_pair = pair[0];
    } else {
        // PMKID lines carry two empty fields then the terminal "01"
        let _ = fields.next()?;
        let _ = fields.next()?;
        let mut pair = [0u8; 1];
        decode_hex(fields.next()?, &mut pair)?;
        message_pair = pair[0];
    }

    Some(ParsedRecord {
        kind,
        key,
        bssid,
        station,
        essid,
        anonce,
        eapol,
        message_pair,
    })
}
