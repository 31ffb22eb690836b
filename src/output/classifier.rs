//! Stateful normalizer turning raw PTY chunks into clean text

use super::ansi;
use regex::Regex;
use std::sync::OnceLock;

/// Clean text extracted from one raw chunk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classified {
    pub text: String,
    /// The chunk contained a full-screen clear; `text` holds only what
    /// followed the last one.
    pub screen_cleared: bool,
}

static BLOCK_OPEN: OnceLock<Regex> = OnceLock::new();
static BLOCK_CLOSE: OnceLock<Regex> = OnceLock::new();

fn block_open() -> &'static Regex {
    BLOCK_OPEN.get_or_init(|| Regex::new(r"<(?:system-[a-z-]+|system|meta-[a-z-]+)>").unwrap())
}

fn block_close() -> &'static Regex {
    BLOCK_CLOSE.get_or_init(|| Regex::new(r"</(?:system-[a-z-]+|system|meta-[a-z-]+)>").unwrap())
}

/// Normalizes the raw output stream of one session.
///
/// Escape sequences and UTF-8 characters split across reads are carried over
/// to the next chunk, and `<system-reminder>`-style blocks are dropped even
/// when they span several chunks.
#[derive(Debug, Default)]
pub struct OutputClassifier {
    carry: Vec<u8>,
    in_system_block: bool,
}

impl OutputClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize(&mut self, raw: &[u8]) -> Classified {
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(raw);

        let keep = ansi::incomplete_tail_len(&data);
        if keep > 0 {
            self.carry = data.split_off(data.len() - keep);
        }

        let mut screen_cleared = false;
        let mut visible: &[u8] = &data;
        if let Some(offset) = ansi::clear_screen_offset(visible) {
            screen_cleared = true;
            self.in_system_block = false;
            visible = &visible[offset..];
        }

        let stripped = ansi::strip_ansi(visible);
        let text = ansi::scrub(&self.drop_system_blocks(&stripped));

        Classified {
            text,
            screen_cleared,
        }
    }

    /// Text held back waiting for the rest of a sequence
    pub fn pending_len(&self) -> usize {
        self.carry.len()
    }

    fn drop_system_blocks(&mut self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        loop {
            if self.in_system_block {
                match block_close().find(rest) {
                    Some(m) => {
                        rest = &rest[m.end()..];
                        self.in_system_block = false;
                    }
                    None => break,
                }
            } else {
                match block_open().find(rest) {
                    Some(m) => {
                        out.push_str(&rest[..m.start()]);
                        rest = &rest[m.end()..];
                        self.in_system_block = true;
                    }
                    None => {
                        out.push_str(rest);
                        break;
                    }
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_chunk() {
        let mut classifier = OutputClassifier::new();
        let out = classifier.normalize(b"\x1b[32mI will create the file\x1b[0m\r\n");
        assert_eq!(out.text, "I will create the file\n");
        assert!(!out.screen_cleared);
    }

    #[test]
    fn test_escape_split_across_chunks() {
        let mut classifier = OutputClassifier::new();
        let first = classifier.normalize(b"hello \x1b[38;5");
        assert_eq!(first.text, "hello");
        assert_eq!(classifier.pending_len(), 6);

        let second = classifier.normalize(b";245mworld");
        assert_eq!(second.text, "world");
        assert_eq!(classifier.pending_len(), 0);
    }

    #[test]
    fn test_clear_screen_keeps_only_post_clear_content() {
        let mut classifier = OutputClassifier::new();
        let out = classifier.normalize(b"stale screen\n\x1b[H\x1b[2Jfresh screen\n");
        assert!(out.screen_cleared);
        assert_eq!(out.text, "fresh screen\n");
    }

    #[test]
    fn test_system_block_spanning_chunks() {
        let mut classifier = OutputClassifier::new();
        let first = classifier.normalize(b"before <system-reminder>secret");
        assert_eq!(first.text, "before");

        let second = classifier.normalize(b" still hidden</system-reminder> after");
        assert_eq!(second.text, " after");
    }

    #[test]
    fn test_split_utf8_character() {
        let mut classifier = OutputClassifier::new();
        let bytes = "héllo".as_bytes();
        let first = classifier.normalize(&bytes[..2]);
        assert_eq!(first.text, "h");
        let second = classifier.normalize(&bytes[2..]);
        assert_eq!(second.text, "éllo");
    }
}
