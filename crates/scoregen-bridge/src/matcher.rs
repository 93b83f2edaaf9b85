//! Deciding when a request is complete from the worker's output.
//!
//! Two modes exist. [`Matcher::Sentinel`] looks for literal success/failure
//! text anywhere in the cumulative output, which is what the legacy worker
//! prints. [`Matcher::Framed`] only honours complete `@@scoregen` lines, so
//! progress chatter that happens to quote a marker cannot end a request.

use tracing::{debug, warn};

use scoregen_core::protocol::{FrameKind, parse_frame};

/// Completion rule for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    Sentinel { success: String, failure: String },
    Framed,
}

/// Outcome decided from the output seen so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure,
}

impl Matcher {
    pub fn sentinel(success: impl Into<String>, failure: impl Into<String>) -> Self {
        Self::Sentinel {
            success: success.into(),
            failure: failure.into(),
        }
    }

    /// Reason this matcher can never work, if any.
    pub fn problem(&self) -> Option<&'static str> {
        match self {
            Self::Sentinel { success, failure } if success.is_empty() || failure.is_empty() => {
                Some("success and failure sentinels must be non-empty")
            }
            Self::Sentinel { success, failure } if success == failure => {
                Some("success and failure sentinels must differ")
            }
            _ => None,
        }
    }

    /// Start tracking a fresh output buffer.
    pub const fn tracker(&self) -> Tracker<'_> {
        Tracker {
            matcher: self,
            scanned: 0,
        }
    }
}

/// Incremental matcher state over one growing buffer.
///
/// `observe` must always be given the whole buffer; only the tail that could
/// contain a new match is searched again.
#[derive(Debug)]
pub struct Tracker<'a> {
    matcher: &'a Matcher,
    scanned: usize,
}

impl Tracker<'_> {
    pub fn observe(&mut self, buf: &[u8]) -> Option<Verdict> {
        match self.matcher {
            Matcher::Sentinel { success, failure } => {
                let verdict = self.observe_sentinels(buf, success.as_bytes(), failure.as_bytes());
                self.scanned = buf.len();
                verdict
            }
            Matcher::Framed => self.observe_frames(buf),
        }
    }

    fn observe_sentinels(&self, buf: &[u8], success: &[u8], failure: &[u8]) -> Option<Verdict> {
        // Re-scan enough of the old tail to catch a marker split across chunks.
        let find = |needle: &[u8]| {
            let start = self.scanned.saturating_sub(needle.len().saturating_sub(1));
            find_bytes(&buf[start..], needle).map(|pos| start + pos)
        };
        match (find(success), find(failure)) {
            (Some(s), Some(f)) if f < s => Some(Verdict::Failure),
            (Some(_), _) => Some(Verdict::Success),
            (None, Some(_)) => Some(Verdict::Failure),
            (None, None) => None,
        }
    }

    fn observe_frames(&mut self, buf: &[u8]) -> Option<Verdict> {
        while let Some(end) = find_bytes(&buf[self.scanned..], b"\n") {
            let line = String::from_utf8_lossy(&buf[self.scanned..self.scanned + end]);
            self.scanned += end + 1;
            match parse_frame(&line) {
                Ok(Some(frame)) => match frame.kind {
                    FrameKind::Success => return Some(Verdict::Success),
                    FrameKind::Failure => return Some(Verdict::Failure),
                    FrameKind::Progress => debug!(message = %frame.message, "worker progress"),
                    FrameKind::Unknown => debug!(line = %line, "ignoring unknown frame kind"),
                },
                Ok(None) => {}
                Err(e) => warn!(error = %e, "ignoring malformed frame"),
            }
        }
        None
    }
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(matcher: &Matcher, chunks: &[&str]) -> Option<Verdict> {
        let mut tracker = matcher.tracker();
        let mut buf = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk.as_bytes());
            if let Some(v) = tracker.observe(&buf) {
                return Some(v);
            }
        }
        None
    }

    #[test]
    fn sentinel_split_across_chunks_is_found() {
        let m = Matcher::sentinel("complete", "failed");
        assert_eq!(feed(&m, &["...compl", "ete..."]), Some(Verdict::Success));
        assert_eq!(feed(&m, &["c", "o", "m", "p", "l", "e", "t", "e"]), Some(Verdict::Success));
    }

    #[test]
    fn earliest_sentinel_wins() {
        let m = Matcher::sentinel("OK", "FAIL");
        assert_eq!(feed(&m, &["FAIL: x\nOK\n"]), Some(Verdict::Failure));
        assert_eq!(feed(&m, &["OK\nFAIL later\n"]), Some(Verdict::Success));
    }

    #[test]
    fn no_sentinel_means_no_verdict() {
        let m = Matcher::sentinel("OK", "FAIL");
        assert_eq!(feed(&m, &["working...\n", "still working\n"]), None);
    }

    #[test]
    fn framed_ignores_marker_text_in_diagnostics() {
        let m = Matcher::Framed;
        assert_eq!(
            feed(&m, &["note: success expected\n", "@@scoregen {\"kind\":\"progress\"}\n"]),
            None
        );
        assert_eq!(
            feed(&m, &["log\n@@scoregen {\"kind\":\"succ", "ess\"}\n"]),
            Some(Verdict::Success)
        );
    }

    #[test]
    fn framed_waits_for_complete_line() {
        let m = Matcher::Framed;
        assert_eq!(feed(&m, &["@@scoregen {\"kind\":\"failure\"}"]), None);
        assert_eq!(
            feed(&m, &["@@scoregen {\"kind\":\"failure\"}", "\n"]),
            Some(Verdict::Failure)
        );
    }

    #[test]
    fn framed_skips_malformed_frames() {
        let m = Matcher::Framed;
        assert_eq!(
            feed(&m, &["@@scoregen {broken\n", "@@scoregen {\"kind\":\"success\"}\n"]),
            Some(Verdict::Success)
        );
    }

    #[test]
    fn degenerate_sentinels_are_reported() {
        assert!(Matcher::sentinel("", "FAIL").problem().is_some());
        assert!(Matcher::sentinel("same", "same").problem().is_some());
        assert!(Matcher::sentinel("OK", "FAIL").problem().is_none());
        assert!(Matcher::Framed.problem().is_none());
    }
}
