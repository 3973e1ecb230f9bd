//! Protected networks — the user's exclusion list.
//!
//! Excluded BSSIDs are never PMKID-hunted or deauthed. The list lives
//! in one file: one record per line, uppercase hex BSSID with no
//! separators, optional space-separated SSID comment. Blank and `#`
//! lines are ignored; the table caps at 50 records and overflow is
//! truncated on load.

use core::fmt::Write as _;

use heapless::{String, Vec};

use crate::platform::{Storage, StorageError};
use crate::policy::MAX_EXCLUSIONS;

pub const EXCLUSION_PATH: &str = "/boarhound/config/protected.txt";

/// One protected network. The BSSID is the key; the SSID is a comment
/// carried for the UI.
#[derive(Debug, Clone)]
pub struct ExclusionEntry {
    pub bssid: [u8; 6],
    pub ssid: String<32>,
}

fn bssid_to_u64(bssid: &[u8; 6]) -> u64 {
    let mut v = 0u64;
    for &b in bssid {
        v = v << 8 | b as u64;
    }
    v
}

/// Fixed-capacity exclusion table keyed by BSSID.
pub struct ExclusionList {
    entries: Vec<ExclusionEntry, MAX_EXCLUSIONS>,
    dirty: bool,
}

impl ExclusionList {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ExclusionEntry] {
        &self.entries
    }

    pub fn contains(&self, bssid: &[u8; 6]) -> bool {
        self.entries.iter().any(|e| &e.bssid == bssid)
    }

    /// Add a BSSID; updates the SSID comment when already present.
    /// Returns false when the table is full.
    pub fn add(&mut self, bssid: &[u8; 6], ssid: &str) -> bool {
        if let Some(e) = self.entries.iter_mut().find(|e| &e.bssid == bssid) {
            e.ssid.clear();
            let _ = e.ssid.push_str(ssid);
            self.dirty = true;
            return true;
        }
        let mut entry = ExclusionEntry {
            bssid: *bssid,
            ssid: String::new(),
        };
        let _ = entry.ssid.push_str(ssid);
        match self.entries.push(entry) {
            Ok(()) => {
                self.dirty = true;
                true
            }
            Err(_) => false,
        }
    }

    pub fn remove(&mut self, bssid: &[u8; 6]) -> bool {
        if let Some(i) = self.entries.iter().position(|e| &e.bssid == bssid) {
            self.entries.remove(i);
            self.dirty = true;
            true
        } else {
            false
        }
    }

    /// Load from storage, replacing the current contents. A missing
    /// file is an empty list, not an error.
    pub fn load(&mut self, storage: &mut impl Storage) -> Result<(), StorageError> {
        self.entries.clear();
        self.dirty = false;

        // 50 records at ~50 bytes each fits comfortably
        let mut buf = [0u8; 4096];
        let n = match storage.read(EXCLUSION_PATH, &mut buf) {
            Ok(n) => n,
            Err(_) => return Ok(()),
        };

        for line in buf[..n].split(|&b| b == b'\n') {
            if self.entries.len() >= MAX_EXCLUSIONS {
                log::warn!("exclusion list truncated at {} records", MAX_EXCLUSIONS);
                break;
            }
            if let Some(entry) = parse_line(line) {
                if !self.contains(&entry.bssid) {
                    let _ = self.entries.push(entry);
                }
            }
        }
        log::info!("exclusion list loaded: {} networks", self.entries.len());
        Ok(())
    }

    /// Write the whole table back, sorted by BSSID so repeated
    /// save/load cycles are byte-identical.
    pub fn save(&mut self, storage: &mut impl Storage) -> Result<(), StorageError> {
        let mut order: Vec<usize, MAX_EXCLUSIONS> = (0..self.entries.len()).collect();
        order.sort_unstable_by_key(|&i| bssid_to_u64(&self.entries[i].bssid));

        let mut out: String<4096> = String::new();
        for &i in &order {
            let e = &self.entries[i];
            for &b in &e.bssid {
                let _ = write!(out, "{:02X}", b);
            }
            if !e.ssid.is_empty() {
                let _ = out.push(' ');
                let _ = out.push_str(&e.ssid);
            }
            let _ = out.push('\n');
        }
        storage.write(EXCLUSION_PATH, out.as_bytes())?;
        self.dirty = false;
        Ok(())
    }

    /// True when in-memory contents differ from the last load/save.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl Default for ExclusionList {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_line(line: &[u8]) -> Option<ExclusionEntry> {
    // Strip CR and leading/trailing spaces
    let mut start = 0;
    let mut end = line.len();
    while end > start && (line[end - 1] == b'\r' || line[end - 1] == b' ' || line[end - 1] == b'\t')
    {
        end -= 1;
    }
    while start < end && (line[start] == b' ' || line[start] == b'\t') {
        start += 1;
    }
    let line = &line[start..end];
    if line.is_empty() || line[0] == b'#' {
        return None;
    }
    if line.len() < 12 {
        return None;
    }

    let mut bssid = [0u8; 6];
    for i in 0..6 {
        let hi = hex_val(line[i * 2])?;
        let lo = hex_val(line[i * 2 + 1])?;
        bssid[i] = hi << 4 | lo;
    }

    let mut ssid: String<32> = String::new();
    if line.len() > 12 {
        if line[12] != b' ' {
            return None;
        }
        let comment = &line[13..];
        if let Ok(s) = core::str::from_utf8(comment) {
            let _ = ssid.push_str(s.trim());
        }
    }
    Some(ExclusionEntry { bssid, ssid })
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::MemStorage;

    const AP1: [u8; 6] = [0xAA, 0xBB, 0xCC, 0x11, 0x22, 0x33];
    const AP2: [u8; 6] = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];

    #[test]
    fn add_contains_remove() {
        let mut list = ExclusionList::new();
        assert!(list.add(&AP1, "home"));
        assert!(list.contains(&AP1));
        assert!(!list.contains(&AP2));
        assert!(list.remove(&AP1));
        assert!(!list.contains(&AP1));
        assert!(!list.remove(&AP1));
    }

    #[test]
    fn add_existing_updates_comment() {
        let mut list = ExclusionList::new();
        list.add(&AP1, "old");
        list.add(&AP1, "new");
        assert_eq!(list.len(), 1);
        assert_eq!(list.entries()[0].ssid.as_str(), "new");
    }

    #[test]
    fn capped_at_fifty() {
        let mut list = ExclusionList::new();
        for i in 0..MAX_EXCLUSIONS {
            let mut b = [0u8; 6];
            b[5] = i as u8;
            assert!(list.add(&b, ""));
        }
        assert!(!list.add(&[0xFF; 6], "overflow"));
        assert_eq!(list.len(), MAX_EXCLUSIONS);
    }

    #[test]
    fn load_parses_comments_and_skips_junk() {
        let mut storage = MemStorage::new();
        storage.insert(
            EXCLUSION_PATH,
            b"# protected networks\n\
              AABBCC112233 My Home WiFi\n\
              \n\
              001122334455\n\
              not-a-bssid\n\
              XXYYZZ001122 bad hex\n",
        );
        let mut list = ExclusionList::new();
        list.load(&mut storage).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.contains(&AP1));
        assert!(list.contains(&AP2));
        let home = list.entries().iter().find(|e| e.bssid == AP1).unwrap();
        assert_eq!(home.ssid.as_str(), "My Home WiFi");
    }

    #[test]
    fn save_load_save_is_idempotent() {
        let mut storage = MemStorage::new();
        let mut list = ExclusionList::new();
        list.add(&AP1, "home");
        list.add(&AP2, "office");
        list.save(&mut storage).unwrap();
        let first = storage.file(EXCLUSION_PATH).unwrap().to_vec();

        let mut reloaded = ExclusionList::new();
        reloaded.load(&mut storage).unwrap();
        reloaded.save(&mut storage).unwrap();
        let second = storage.file(EXCLUSION_PATH).unwrap().to_vec();
        assert_eq!(first, second);
        // Sorted by BSSID: AP2 (00...) precedes AP1 (AA...)
        assert!(first.starts_with(b"001122334455 office\nAABBCC112233 home\n"));
    }

    #[test]
    fn missing_file_loads_empty() {
        let mut storage = MemStorage::new();
        let mut list = ExclusionList::new();
        list.add(&AP1, "stale");
        list.load(&mut storage).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn dirty_tracking() {
        let mut storage = MemStorage::new();
        let mut list = ExclusionList::new();
        assert!(!list.is_dirty());
        list.add(&AP1, "x");
        assert!(list.is_dirty());
        list.save(&mut storage).unwrap();
        assert!(!list.is_dirty());
    }
}
