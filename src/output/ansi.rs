//! Escape-sequence stripping and text scrubbing for TUI output
//!
//! Raw bytes go through [`strip_ansi`] first. What survives is scrubbed with
//! [`scrub`], which removes the debris a full-screen interface leaves behind:
//! escape remnants whose ESC byte was lost, box-drawing frames and markup tags.

use regex::Regex;
use std::sync::OnceLock;

/// Strip ANSI escape sequences from a byte slice, returning UTF-8 text.
///
/// Handles CSI (`ESC [`), OSC (`ESC ]` terminated by BEL or `ESC \`), simple
/// two-byte escapes, and 8-bit CSI (`0x9B`). Cursor moves to another row and
/// a bare carriage return become `\n`, so a screen redrawn in place still
/// yields separate lines. Other C0 controls except `\n` and `\t` are dropped.
/// Invalid UTF-8 is replaced.
pub fn strip_ansi(input: &[u8]) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        match input[i] {
            0x1B => {
                i += 1;
                if i >= input.len() {
                    break;
                }
                match input[i] {
                    b'[' => {
                        i = skip_csi(input, i + 1, &mut out);
                    }
                    b']' | b'P' | b'_' | b'^' => {
                        i += 1;
                        while i < input.len() {
                            if input[i] == 0x07 {
                                i += 1;
                                break;
                            }
                            if input[i] == 0x1B && i + 1 < input.len() && input[i + 1] == b'\\' {
                                i += 2;
                                break;
                            }
                            i += 1;
                        }
                    }
                    // Charset designation takes one more byte (ESC ( B)
                    b'(' | b')' | b'*' | b'+' => {
                        i += 2;
                    }
                    _ => {
                        i += 1;
                    }
                }
            }
            0x9B => {
                i = skip_csi(input, i + 1, &mut out);
            }
            b'\r' => {
                if input.get(i + 1) != Some(&b'\n') {
                    out.push(b'\n');
                }
                i += 1;
            }
            b'\n' | b'\t' => {
                out.push(input[i]);
                i += 1;
            }
            0x00..=0x1F | 0x7F => {
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

/// Skip a CSI body starting at `i`, returning the index past its final byte.
/// Absolute row moves (`H`, `f`, `d`) and line moves (`E`, `F`) emit `\n`.
fn skip_csi(input: &[u8], mut i: usize, out: &mut Vec<u8>) -> usize {
    // Parameter bytes (0x30-0x3F), intermediate bytes (0x20-0x2F)
    while i < input.len() && (0x20..=0x3F).contains(&input[i]) {
        i += 1;
    }
    if i < input.len() && (0x40..=0x7E).contains(&input[i]) {
        if matches!(input[i], b'H' | b'f' | b'd' | b'E' | b'F') {
            out.push(b'\n');
        }
        i += 1;
    }
    i
}

/// Byte offset just past the last full-screen clear (`ESC[2J`, `ESC[3J`,
/// `ESC c`), if the chunk contains one.
pub fn clear_screen_offset(input: &[u8]) -> Option<usize> {
    let mut found = None;
    let mut i = 0;
    while i < input.len() {
        if input[i] == 0x1B {
            let rest = &input[i + 1..];
            if rest.starts_with(b"[2J") || rest.starts_with(b"[3J") {
                found = Some(i + 4);
                i += 4;
                continue;
            }
            if rest.first() == Some(&b'c') {
                found = Some(i + 2);
                i += 2;
                continue;
            }
        }
        i += 1;
    }
    found
}

/// Length of a trailing fragment that must wait for the next chunk: an
/// unterminated escape sequence, a split UTF-8 character, or a carriage
/// return that may be the first half of `\r\n`.
pub fn incomplete_tail_len(input: &[u8]) -> usize {
    const MAX_CARRY: usize = 256;

    if input.last() == Some(&b'\r') {
        return 1;
    }

    let window_start = input.len().saturating_sub(MAX_CARRY);
    if let Some(rel) = input[window_start..].iter().rposition(|&b| b == 0x1B) {
        let esc = window_start + rel;
        if !escape_terminated(&input[esc..]) {
            return input.len() - esc;
        }
    }

    utf8_tail_len(input)
}

fn escape_terminated(seq: &[u8]) -> bool {
    match seq.get(1) {
        None => false,
        Some(b'[') => seq[2..].iter().any(|b| (0x40..=0x7E).contains(b)),
        Some(b']') | Some(b'P') | Some(b'_') | Some(b'^') => {
            seq.contains(&0x07) || seq.windows(2).skip(1).any(|w| w == b"\x1b\\")
        }
        Some(b'(') | Some(b')') | Some(b'*') | Some(b'+') => seq.len() >= 3,
        Some(_) => true,
    }
}

fn utf8_tail_len(input: &[u8]) -> usize {
    for back in 1..=3.min(input.len()) {
        let b = input[input.len() - back];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let needed = match b {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => return 0,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

static REMNANT_REGEX: OnceLock<Regex> = OnceLock::new();
static TAG_REGEX: OnceLock<Regex> = OnceLock::new();

fn remnant_regex() -> &'static Regex {
    // CSI bodies that lost their ESC: [38;5;245m, [2K, [12;1H, [?25l
    REMNANT_REGEX.get_or_init(|| {
        Regex::new(r"\[\??\d{1,3}(?:;\d{1,3})*[HfmKJABCDGEFSTsuhlr]").unwrap()
    })
}

fn tag_regex() -> &'static Regex {
    TAG_REGEX.get_or_init(|| {
        Regex::new(r#"</?[a-z][a-z0-9_-]*(?:\s+[a-z_-]+="[^"]*")*\s*/?>"#).unwrap()
    })
}

/// Box-drawing (U+2500-257F) and block elements (U+2580-259F)
fn is_decorative(c: char) -> bool {
    ('\u{2500}'..='\u{259F}').contains(&c)
}

/// Remove escape remnants, decorative glyphs and markup tags, and trim
/// trailing whitespace on every line.
pub fn scrub(text: &str) -> String {
    let without_remnants = remnant_regex().replace_all(text, "");
    let without_tags = tag_regex().replace_all(&without_remnants, "");
    let without_glyphs: String = without_tags.chars().filter(|c| !is_decorative(*c)).collect();

    let mut out = String::with_capacity(without_glyphs.len());
    for (idx, line) in without_glyphs.split('\n').enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        out.push_str(line.trim_end());
    }
    out
}
