//! Long-to-8.3 name mapping.
//!
//! Host filenames may be arbitrarily long, mixed-case and contain spaces.
//! DOS programs only see 8.3 names, so every host entry gets a stable short
//! alias. Names that already fit are kept (uppercased); everything else gets
//! a numeric tail: `LONGFI~1.TXT`, `LONGFI~2.TXT`, ...
//!
//! The numbering is computed against the list of already-numbered siblings
//! so that tails are unique within a directory and independent of insertion
//! time for a fixed host listing.

use std::cmp::Ordering;

use crate::error::{DosError, DosResult};

/// Largest numeric tail a generated name may carry.
pub const MAX_SHORT_NR: u32 = 9_999_999;

/// Longest short name, `NNNNNNNN.EEE`.
pub const DOS_NAMELENGTH: usize = 12;

const HASH_CHARS: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ012345";
const INVALID_LEGACY_CHARS: &[u8] = b"*?<>|\"+=,;[] ~.";

/// A long name prepared for short-name generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Uppercased name with spaces (and, if needed, leading dots) removed.
    pub name: String,
    /// Characters before the first dot.
    pub base_len: usize,
    /// True when the name cannot be used verbatim and needs a `~N` tail.
    pub force_tail: bool,
}

impl Candidate {
    /// Prepare a host long name.
    pub fn new(long_name: &str) -> Self {
        let upper = long_name.to_ascii_uppercase();
        let stripped: String = upper.chars().filter(|&c| c != ' ').collect();
        let mut force_tail = stripped.len() != upper.len();

        let mut name = stripped.as_str();
        if let Some(pos) = name.find('.') {
            // Extension longer than three characters, or a dotfile
            if name.len() - pos > 4 {
                name = name.trim_start_matches('.');
                force_tail = true;
            }
        }

        let base_len = name.find('.').map_or(name.chars().count(), |pos| name[..pos].chars().count());
        if base_len > 8 {
            force_tail = true;
        }

        Self {
            name: name.to_string(),
            base_len,
            force_tail,
        }
    }

    /// Extension including its dot, taken from the last dot.
    fn extension(&self) -> Option<&str> {
        self.name.rfind('.').map(|pos| &self.name[pos..])
    }

    /// Build `STEM~N.EXT` for a tail number.
    ///
    /// The stem is shortened so the tail always fits in eight characters;
    /// the extension keeps at most three characters after its dot.
    pub fn with_tail(&self, nr: u32) -> DosResult<String> {
        if nr == 0 || nr > MAX_SHORT_NR {
            return Err(DosError::ResourceExhausted(format!(
                "no short name tail left for {}",
                self.name
            )));
        }
        let number = nr.to_string();
        let to_copy = if self.base_len + number.len() + 1 > 8 {
            8 - number.len() - 1
        } else {
            self.base_len
        };

        let mut short: String = self.name.chars().take(to_copy).collect();
        short.push('~');
        short.push_str(&number);
        if let Some(ext) = self.extension() {
            let room = DOS_NAMELENGTH.saturating_sub(short.len());
            short.extend(ext.chars().take(4.min(room)));
        }
        truncate_chars(&mut short, DOS_NAMELENGTH);
        Ok(short)
    }

    /// The verbatim short name, used when no tail is needed.
    pub fn verbatim(&self) -> String {
        let mut short = self.name.clone();
        remove_trailing_dot(&mut short);
        short
    }
}

fn truncate_chars(s: &mut String, max: usize) {
    if let Some((idx, _)) = s.char_indices().nth(max) {
        s.truncate(idx);
    }
}

/// Drop one trailing dot, except for the `.` and `..` entries.
pub fn remove_trailing_dot(name: &mut String) -> bool {
    if name == "." || name == ".." {
        return false;
    }
    if name.ends_with('.') {
        name.pop();
        return true;
    }
    false
}

/// Compare a candidate name against a short name.
///
/// Numbered short names only compare their stem, so `LONGFILENAME.TXT`
/// equals `LONGFI~1.TXT` and lands in the same numbering run. Plain
/// short names compare bytewise.
pub fn compare_short_name(compare: &str, short: &str) -> Ordering {
    let a = compare.as_bytes();
    let b = short.as_bytes();
    match short.find('~') {
        Some(tilde) => {
            let mut count = tilde;
            let number_size = short[tilde..].find('.').unwrap_or(short.len() - tilde);
            let stem = compare.find('.').unwrap_or(compare.len()).min(8);
            if stem > count + number_size {
                count = stem - number_size;
            }
            a[..count.min(a.len())].cmp(&b[..count.min(b.len())])
        }
        None => a.cmp(b),
    }
}

/// Sorted view over the numbered siblings of a directory.
pub trait NumberedNames {
    fn count(&self) -> usize;
    fn short_name_at(&self, index: usize) -> &str;
    fn short_number_at(&self, index: usize) -> u32;
}

impl NumberedNames for [(String, u32)] {
    fn count(&self) -> usize {
        self.len()
    }

    fn short_name_at(&self, index: usize) -> &str {
        &self[index].0
    }

    fn short_number_at(&self, index: usize) -> u32 {
        self[index].1
    }
}

/// Next free tail for `name` among numbered siblings.
///
/// Binary-searches for the numbering run of the name's stem and returns one
/// past the last number in that run; `1` when the run is empty.
pub fn next_short_number<N: NumberedNames + ?Sized>(numbered: &N, name: &str) -> u32 {
    let len = numbered.count();
    if len == 0 {
        return 1;
    }

    let mut low = 0usize;
    let mut high = len;
    let mut found = 0;
    while low < high {
        let mid = low + (high - low) / 2;
        match compare_short_name(name, numbered.short_name_at(mid)) {
            Ordering::Greater => low = mid + 1,
            Ordering::Less => high = mid,
            Ordering::Equal => {
                let mut index = mid;
                loop {
                    found = numbered.short_number_at(index);
                    index += 1;
                    if index >= len
                        || compare_short_name(name, numbered.short_name_at(index)) != Ordering::Equal
                    {
                        break;
                    }
                }
                break;
            }
        }
    }
    found + 1
}

fn legacy_lower(b: u8) -> u16 {
    if b >= 0x80 {
        // Bytes above 0x7F behave as sign-extended chars in the hash
        b as i8 as i16 as u16
    } else {
        b.to_ascii_lowercase() as u16
    }
}

/// Hash used by legacy `XXXX~HHH` short names.
pub fn legacy_hash(name: &[u8]) -> u16 {
    let mut hash: u16 = 0xBEEF;
    for pair in name.windows(2) {
        hash = (hash << 3) ^ (hash >> 5) ^ legacy_lower(pair[0]) ^ (legacy_lower(pair[1]) << 8);
    }
    let last = name.last().copied().unwrap_or(0);
    (hash << 3) ^ (hash >> 5) ^ legacy_lower(last)
}

fn legacy_char(b: u8) -> char {
    if b >= 0x80 || b == 0 || INVALID_LEGACY_CHARS.contains(&b) {
        '_'
    } else {
        b.to_ascii_uppercase() as char
    }
}

/// Legacy hashed alias of a long name: four name characters padded with
/// `~`, three hash characters, then up to three extension characters.
pub fn legacy_short_name(long_name: &str) -> String {
    let bytes = long_name.as_bytes();
    let hash = legacy_hash(bytes);
    let ext = (1..bytes.len().saturating_sub(1))
        .rev()
        .find(|&i| bytes[i] == b'.');

    let mut alias = String::with_capacity(DOS_NAMELENGTH);
    for (i, &b) in bytes.iter().enumerate().take(4) {
        if Some(i) == ext {
            break;
        }
        alias.push(legacy_char(b));
    }
    while alias.len() < 5 {
        alias.push('~');
    }
    alias.push(HASH_CHARS[((hash >> 10) & 0x1f) as usize] as char);
    alias.push(HASH_CHARS[((hash >> 5) & 0x1f) as usize] as char);
    alias.push(HASH_CHARS[(hash & 0x1f) as usize] as char);

    if let Some(dot) = ext {
        alias.push('.');
        for &b in bytes[dot + 1..].iter().take(3) {
            alias.push(legacy_char(b));
        }
    }
    alias
}

/// Whether a short name has the `XXXX~HHH` legacy shape.
pub fn is_legacy_shape(short: &str) -> bool {
    let b = short.as_bytes();
    b.len() >= 8 && b[4] == b'~' && b[5] != b'.' && b[6] != b'.' && b[7] != b'.'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(names: &[(&str, u32)]) -> Vec<(String, u32)> {
        names.iter().map(|(n, nr)| (n.to_string(), *nr)).collect()
    }

    #[test]
    fn test_candidate_fits() {
        let c = Candidate::new("readme.txt");
        assert_eq!(c.name, "README.TXT");
        assert_eq!(c.base_len, 6);
        assert!(!c.force_tail);
        assert_eq!(c.verbatim(), "README.TXT");
    }

    #[test]
    fn test_candidate_forces_tail() {
        assert!(Candidate::new("longfilename.txt").force_tail);
        assert!(Candidate::new("my file.txt").force_tail);
        assert!(Candidate::new("notes.text").force_tail);

        let dotfile = Candidate::new(".profile");
        assert_eq!(dotfile.name, "PROFILE");
        assert!(dotfile.force_tail);
    }

    #[test]
    fn test_with_tail() {
        let c = Candidate::new("longfilename.txt");
        assert_eq!(c.with_tail(1).unwrap(), "LONGFI~1.TXT");
        assert_eq!(c.with_tail(12).unwrap(), "LONGF~12.TXT");
        assert_eq!(c.with_tail(1234567).unwrap(), "~1234567.TXT");

        let c = Candidate::new("My Document.Text");
        assert_eq!(c.with_tail(1).unwrap(), "MYDOCU~1.TEX");

        let c = Candidate::new("a b");
        assert_eq!(c.with_tail(3).unwrap(), "AB~3");
    }

    #[test]
    fn test_with_tail_overflow() {
        let c = Candidate::new("longfilename.txt");
        assert!(matches!(
            c.with_tail(MAX_SHORT_NR + 1),
            Err(DosError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_remove_trailing_dot() {
        let mut name = "FILE.".to_string();
        assert!(remove_trailing_dot(&mut name));
        assert_eq!(name, "FILE");

        let mut dots = "..".to_string();
        assert!(!remove_trailing_dot(&mut dots));
        assert_eq!(dots, "..");
    }

    #[test]
    fn test_compare_short_name() {
        assert_eq!(compare_short_name("LONGFILENAME.TXT", "LONGFI~1.TXT"), Ordering::Equal);
        assert_eq!(compare_short_name("LONGFILENAME2.TXT", "LONGFI~1.TXT"), Ordering::Equal);
        assert_eq!(compare_short_name("ABC.TXT", "ABD.TXT"), Ordering::Less);
        assert_eq!(compare_short_name("README.TXT", "README.TXT"), Ordering::Equal);
        assert_eq!(compare_short_name("MYDOCUMENT.TEXT", "MYDOCU~1.TEX"), Ordering::Equal);
    }

    #[test]
    fn test_next_short_number() {
        let empty: Vec<(String, u32)> = Vec::new();
        assert_eq!(next_short_number(empty.as_slice(), "LONGFILENAME.TXT"), 1);

        let list = numbered(&[("LONGFI~1.TXT", 1), ("LONGFI~2.TXT", 2), ("OTHERN~1.DAT", 1)]);
        assert_eq!(next_short_number(list.as_slice(), "LONGFILENAME3.TXT"), 3);
        assert_eq!(next_short_number(list.as_slice(), "OTHERNAME.DAT"), 2);
        assert_eq!(next_short_number(list.as_slice(), "ZEBRAFILE.TXT"), 1);
    }

    #[test]
    fn test_legacy_hash_regression() {
        assert_eq!(legacy_hash(b"a"), 0xF2EE);
        assert_eq!(legacy_short_name("a"), "A~~~~2XO");
    }

    #[test]
    fn test_legacy_short_name_shape() {
        let alias = legacy_short_name("Program Files");
        assert!(alias.starts_with("PROG~"));
        assert_eq!(alias.len(), 8);
        assert!(is_legacy_shape(&alias));

        let alias = legacy_short_name("archive.backup.zip");
        assert!(alias.starts_with("ARCH~"));
        assert!(alias.ends_with(".ZIP"));

        // Spaces and dots inside the stem are replaced
        let alias = legacy_short_name("a b.c.txt");
        assert!(alias.starts_with("A_B_~"));
    }

    #[test]
    fn test_is_legacy_shape() {
        assert!(is_legacy_shape("PROG~A2X"));
        assert!(!is_legacy_shape("LONGFI~1.TXT"));
        assert!(!is_legacy_shape("AB~1"));
    }
}
