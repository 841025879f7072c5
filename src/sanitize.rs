/* This file is part of backhaul.
 *
 * backhaul is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * backhaul is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with backhaul.  If not, see <http://www.gnu.org/licenses/>.
 */

use crate::error::NetResult;
use crate::proto_error;

// Wire string fields are 255 bytes with a mandatory NUL terminator
pub const MAX_FIELD_BYTES: usize = 254;

/// Validates a client display name: printable ASCII, whitespace runs
/// collapsed, non-empty, and short enough for its wire field.
pub fn clean_display_name(raw: &str) -> NetResult<String> {
    if raw.bytes().any(|b| !(0x20..=0x7e).contains(&b)) {
        return Err(proto_error!("Display name contains non-printable bytes"));
    }
    let cleaned = collapse_whitespace(raw);
    if cleaned.is_empty() {
        return Err(proto_error!("Display name is empty"));
    }
    if cleaned.len() > MAX_FIELD_BYTES {
        return Err(proto_error!("Display name too long ({} bytes)", cleaned.len()));
    }
    Ok(cleaned)
}

/// Reduces a requested filename to a single path component safe to join
/// under the storage root.  Separators are stripped outright; control
/// characters are rejected rather than silently dropped.
pub fn clean_filename(raw: &str) -> NetResult<String> {
    if raw.chars().any(char::is_control) {
        return Err(proto_error!("Filename contains control characters"));
    }
    let stripped: String = raw.chars()
        .filter(|ch| !matches!(ch, '/' | '\\'))
        .collect();
    let cleaned = collapse_whitespace(&stripped);
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return Err(proto_error!("Filename '{}' reduces to nothing usable", raw));
    }
    if cleaned.len() > MAX_FIELD_BYTES {
        return Err(proto_error!("Filename too long ({} bytes)", cleaned.len()));
    }
    Ok(cleaned)
}

fn collapse_whitespace(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut in_run = false;
    for ch in value.trim().chars() {
        if ch.is_whitespace() {
            if !in_run {
                result.push(' ');
            }
            in_run = true;
        } else {
            result.push(ch);
            in_run = false;
        }
    }
    result
}

#[test]
fn test_clean_display_name() {
    assert_eq!(clean_display_name("alice").unwrap(), "alice");
    assert_eq!(clean_display_name("  alice   smith ").unwrap(), "alice smith");
    assert!(clean_display_name("").is_err());
    assert!(clean_display_name("   ").is_err());
    assert!(clean_display_name("line\nbreak").is_err());
    assert!(clean_display_name("caf\u{e9}").is_err());
    assert!(clean_display_name(&"x".repeat(255)).is_err());
    assert_eq!(clean_display_name(&"x".repeat(254)).unwrap(), "x".repeat(254));
}

#[test]
fn test_clean_filename() {
    assert_eq!(clean_filename("notes.txt").unwrap(), "notes.txt");
    assert_eq!(clean_filename("../../etc/passwd").unwrap(), "....etcpasswd");
    assert_eq!(clean_filename("dir\\file.bin").unwrap(), "dirfile.bin");
    assert_eq!(clean_filename("two  spaces.txt").unwrap(), "two spaces.txt");
    assert!(clean_filename("").is_err());
    assert!(clean_filename("///").is_err());
    assert!(clean_filename(".").is_err());
    assert!(clean_filename("..").is_err());
    assert!(clean_filename("nul\0byte").is_err());
    // Multi-byte UTF-8 is fine as long as it fits the wire field
    assert_eq!(clean_filename("r\u{e9}sum\u{e9}.pdf").unwrap(), "r\u{e9}sum\u{e9}.pdf");
}
