//! Terminal notification detection for agent PTY output.
//!
//! Agents surface out-of-band events through OSC (Operating System
//! Command) escape sequences in their terminal stream:
//!
//! - **OSC 9**: simple notification (`ESC ] 9 ; message BEL`)
//! - **OSC 777**: rich notification (`ESC ] 777 ; notify ; title ; body BEL`)
//!
//! Detection runs in two stages: [`OscScanner`] yields the payload of
//! every complete OSC sequence (BEL- or ST-terminated) in a chunk, and
//! [`parse_osc`] decides whether a payload is a notification. A standalone
//! BEL is not a sequence and never matches; OSC 9 payloads made only of
//! digits and semicolons are mode-set sequences from full-screen programs
//! and are filtered out.

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

/// Notification parsed from PTY output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// OSC 9 notification message.
    Osc9(String),
    /// OSC 777 notification with title and body.
    Osc777 {
        /// Notification title.
        title: String,
        /// Notification body text.
        body: String,
    },
}

/// Scan raw PTY bytes for OSC notifications.
///
/// Returns every notification found, in stream order. Sequences split
/// across reads are not reassembled; callers that need that guarantee
/// feed whole chunks (PTY reads are line-ish in practice).
#[must_use]
pub fn detect_notifications(data: &[u8]) -> Vec<Notification> {
    OscScanner::new(data).filter_map(parse_osc).collect()
}

/// Iterator over the payloads of complete OSC sequences in one chunk.
///
/// A sequence opens with `ESC ]` and closes with BEL or ST (`ESC \`);
/// anything still open at the end of the chunk is discarded.
struct OscScanner<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> OscScanner<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    /// Position of the next `ESC ]` introducer at or after `from`.
    fn next_introducer(&self, from: usize) -> Option<usize> {
        let limit = self.data.len().checked_sub(1)?;
        (from..limit).find(|&i| self.data[i] == ESC && self.data[i + 1] == b']')
    }

    /// Terminator at or after `from`: returns (payload end, terminator
    /// width).
    fn next_terminator(&self, from: usize) -> Option<(usize, usize)> {
        for i in from..self.data.len() {
            if self.data[i] == BEL {
                return Some((i, 1));
            }
            if self.data[i] == ESC && self.data.get(i + 1) == Some(&b'\\') {
                return Some((i, 2));
            }
        }
        None
    }
}

impl<'a> Iterator for OscScanner<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let intro = self.next_introducer(self.cursor)?;
        let payload_start = intro + 2;

        let Some((payload_end, width)) = self.next_terminator(payload_start) else {
            // Open sequence runs off the chunk; nothing complete remains.
            self.cursor = self.data.len();
            return None;
        };

        self.cursor = payload_end + width;
        Some(&self.data[payload_start..payload_end])
    }
}

/// Interpret one OSC payload as a notification, if it is one.
fn parse_osc(payload: &[u8]) -> Option<Notification> {
    let text = String::from_utf8_lossy(payload);
    let mut fields = text.splitn(2, ';');

    match fields.next()? {
        "9" => {
            let message = fields.next().unwrap_or("").to_string();
            if message.is_empty() || is_mode_sequence(&message) {
                return None;
            }
            Some(Notification::Osc9(message))
        }
        "777" => {
            let rest = fields.next()?;
            let mut parts = rest.splitn(3, ';');
            if parts.next()? != "notify" {
                return None;
            }
            let title = parts.next().unwrap_or("").to_string();
            let body = parts.next().unwrap_or("").to_string();
            if title.is_empty() && body.is_empty() {
                return None;
            }
            Some(Notification::Osc777 { title, body })
        }
        _ => None,
    }
}

/// Digit/semicolon-only OSC 9 payloads are iTerm-style mode sets, not
/// messages.
fn is_mode_sequence(message: &str) -> bool {
    message.chars().all(|c| c.is_ascii_digit() || c == ';')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standalone_bell_ignored() {
        let data = b"some output\x07more output";
        assert!(detect_notifications(data).is_empty());
    }

    #[test]
    fn test_osc9_with_bel_terminator() {
        let data = b"\x1b]9;Build complete\x07";
        let notifications = detect_notifications(data);
        assert_eq!(notifications, vec![Notification::Osc9("Build complete".into())]);
    }

    #[test]
    fn test_osc9_with_st_terminator() {
        let data = b"\x1b]9;Agent notification\x1b\\";
        let notifications = detect_notifications(data);
        assert_eq!(
            notifications,
            vec![Notification::Osc9("Agent notification".into())]
        );
    }

    #[test]
    fn test_osc777_title_and_body() {
        let data = b"\x1b]777;notify;Question;Continue?\x07";
        let notifications = detect_notifications(data);
        assert_eq!(
            notifications,
            vec![Notification::Osc777 {
                title: "Question".into(),
                body: "Continue?".into(),
            }]
        );
    }

    #[test]
    fn test_osc777_body_keeps_embedded_semicolons() {
        let data = b"\x1b]777;notify;T;a;b;c\x07";
        let notifications = detect_notifications(data);
        assert_eq!(
            notifications,
            vec![Notification::Osc777 {
                title: "T".into(),
                body: "a;b;c".into(),
            }]
        );
    }

    #[test]
    fn test_osc777_requires_content() {
        let data = b"\x1b]777;notify;;\x07";
        assert!(detect_notifications(data).is_empty());
    }

    #[test]
    fn test_osc9_filters_mode_sequences() {
        // Digit/semicolon-only payloads are iTerm-style mode sets.
        let data = b"\x1b]9;4;0;\x07";
        assert!(detect_notifications(data).is_empty());

        let data = b"\x1b]9;Real message\x07";
        assert_eq!(detect_notifications(data).len(), 1);
    }

    #[test]
    fn test_multiple_notifications_in_one_chunk() {
        let data = b"\x07\x1b]9;first\x07noise\x1b]9;second\x1b\\";
        let notifications = detect_notifications(data);
        assert_eq!(
            notifications,
            vec![
                Notification::Osc9("first".into()),
                Notification::Osc9("second".into()),
            ]
        );
    }

    #[test]
    fn test_unterminated_sequence_is_discarded() {
        let data = b"before\x1b]9;never finished";
        assert!(detect_notifications(data).is_empty());

        // An unterminated tail does not hide an earlier complete one.
        let data = b"\x1b]9;done\x07\x1b]9;half";
        assert_eq!(
            detect_notifications(data),
            vec![Notification::Osc9("done".into())]
        );
    }

    #[test]
    fn test_unrelated_osc_kinds_are_skipped() {
        // Window-title OSC 0 is a complete sequence but not a notification.
        let data = b"\x1b]0;my window title\x07";
        assert!(detect_notifications(data).is_empty());
    }

    #[test]
    fn test_detection_is_superset_over_concatenation() {
        // detect(a || b) ⊇ detect(a) ∪ detect(b) when the split is not
        // inside an OSC sequence.
        let a: &[u8] = b"out\x1b]9;alpha\x07";
        let b: &[u8] = b"\x1b]777;notify;T;B\x07rest";
        let mut joined = a.to_vec();
        joined.extend_from_slice(b);

        let separate: Vec<_> = detect_notifications(a)
            .into_iter()
            .chain(detect_notifications(b))
            .collect();
        let combined = detect_notifications(&joined);
        for n in &separate {
            assert!(combined.contains(n));
        }
    }

    #[test]
    fn test_plain_output_has_no_notifications() {
        let data = b"Building project...\nCompilation complete.";
        assert!(detect_notifications(data).is_empty());
    }
}
