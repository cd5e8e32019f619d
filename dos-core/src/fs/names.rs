//! DOS path and name helpers: normalization, wildcard matching, volume labels.

use crate::error::{DosError, DosResult};

/// Longest DOS path accepted by any drive operation.
pub const MAX_PATH_LEN: usize = 255;

/// Normalize a drive-relative DOS path.
///
/// - Forward slashes become backslashes
/// - Leading and trailing separators are dropped (the root is `""`)
/// - `.` and `..` components are folded away
/// - Everything is uppercased
///
/// # Examples
/// ```
/// use dos_core::fs::normalize_dos_path;
/// assert_eq!(normalize_dos_path("\\games\\save.dat").unwrap(), "GAMES\\SAVE.DAT");
/// assert_eq!(normalize_dos_path("/").unwrap(), "");
/// ```
pub fn normalize_dos_path(path: &str) -> DosResult<String> {
    if path.len() > MAX_PATH_LEN {
        return Err(DosError::PathTooLong(path.len()));
    }
    let upper = path.to_ascii_uppercase();
    let mut parts: Vec<&str> = Vec::new();
    for component in upper.split(['\\', '/']) {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            _ => parts.push(component),
        }
    }
    Ok(parts.join("\\"))
}

/// Split a DOS path into its parent directory and last component.
pub fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('\\') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}

/// Join a DOS directory and a name.
pub fn join_dos(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}\\{}", dir, name)
    }
}

/// Split a guest path like `C:\GAMES\X.EXE` into drive letter and the
/// drive-relative remainder.
pub fn split_drive_path(path: &str) -> DosResult<(char, &str)> {
    let mut chars = path.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic() => {
            Ok((letter.to_ascii_uppercase(), &path[2..]))
        }
        (Some(letter), _) => Err(DosError::InvalidDrive(letter)),
        (None, _) => Err(DosError::InvalidDrive(' ')),
    }
}

/// Space-padded 8.3 fields of a name, uppercased.
fn split_8_3(name: &str) -> ([u8; 8], [u8; 3]) {
    let mut base = [b' '; 8];
    let mut ext = [b' '; 3];
    let bytes = name.as_bytes();
    let (stem, suffix) = match name.rfind('.') {
        Some(pos) => (&bytes[..pos], &bytes[pos + 1..]),
        None => (bytes, &[][..]),
    };
    for (dst, src) in base.iter_mut().zip(stem.iter()) {
        *dst = src.to_ascii_uppercase();
    }
    for (dst, src) in ext.iter_mut().zip(suffix.iter()) {
        *dst = src.to_ascii_uppercase();
    }
    (base, ext)
}

/// Match a short name against a DOS wildcard pattern.
///
/// Name and extension are compared separately: `?` matches any single
/// character, `*` matches the rest of the field.
pub fn wild_file_cmp(file: &str, wild: &str) -> bool {
    let (file_name, file_ext) = split_8_3(file);
    let (wild_name, wild_ext) = split_8_3(wild);

    for r in 0..8 {
        if wild_name[r] == b'*' {
            break;
        }
        if wild_name[r] != b'?' && wild_name[r] != file_name[r] {
            return false;
        }
    }
    for r in 0..3 {
        if wild_ext[r] == b'*' {
            return true;
        }
        if wild_ext[r] != b'?' && wild_ext[r] != file_ext[r] {
            return false;
        }
    }
    true
}

/// Format a volume label following DOS rules.
///
/// At most 11 characters; a dot is forced after the eighth character when
/// the input has none, and a single trailing dot is dropped. CD-ROM labels
/// keep their case and keep the dot of an exactly-8-character label.
pub fn format_label(input: &str, cdrom: bool) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(12);
    let mut togo = 8;
    let mut pos = 0;
    let mut point = false;

    while togo > 0 && pos < bytes.len() {
        if !point && bytes[pos] == b'.' {
            togo = 4;
            point = true;
        }
        out.push(if cdrom {
            bytes[pos]
        } else {
            bytes[pos].to_ascii_uppercase()
        });
        pos += 1;
        togo -= 1;
        if togo == 0 && !point {
            if bytes.get(pos) == Some(&b'.') {
                pos += 1;
            }
            out.push(b'.');
            point = true;
            togo = 3;
        }
    }

    if out.last() == Some(&b'.') && !(cdrom && out.len() == 9) {
        out.pop();
    }
    String::from_utf8_lossy(&out).into_owned()
}
