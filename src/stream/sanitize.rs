//! Reasoning-block removal.
//!
//! Some models interleave "thinking" text delimited by a tag pair
//! (`<think>…</think>` by default). [`sanitize`] strips it from a complete
//! text; [`ReasoningFilter`] does the same for text that arrives as a
//! sequence of streamed fragments where a tag may straddle two fragments.
use memchr::memmem;
use std::borrow::Cow;

use crate::config::FeaturesConfig;

/// Open/close tag pair delimiting a reasoning block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasoningTags {
    pub open: String,
    pub close: String,
}

impl ReasoningTags {
    #[must_use]
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }

    #[must_use]
    pub fn from_features(features: &FeaturesConfig) -> Self {
        Self::new(
            features.reasoning_open_tag.as_str(),
            features.reasoning_close_tag.as_str(),
        )
    }
}

impl Default for ReasoningTags {
    fn default() -> Self {
        Self::new("<think>", "</think>")
    }
}

/// Remove every `open … close` segment, scanning left to right.
///
/// Each open tag pairs with the first close tag after it. Text on both sides
/// of a removed segment is rejoined before scanning continues, so a tag that
/// only forms once a block is gone (`<thi<think>x</think>nk>`) is a tag too.
/// Unmatched tags are left untouched, and the output contains no complete
/// pair, so a second pass changes nothing.
#[must_use]
pub fn sanitize<'a>(text: &'a str, tags: &ReasoningTags) -> Cow<'a, str> {
    if tags.open.is_empty() || tags.close.is_empty() {
        return Cow::Borrowed(text);
    }
    let Some(first_open) = memmem::find(text.as_bytes(), tags.open.as_bytes()) else {
        return Cow::Borrowed(text);
    };
    let after_open = first_open + tags.open.len();
    if memmem::find(&text.as_bytes()[after_open..], tags.close.as_bytes()).is_none() {
        return Cow::Borrowed(text);
    }

    let mut filter = ReasoningFilter::new(tags.clone());
    let mut out = filter.push(text);
    out.push_str(&filter.flush());
    Cow::Owned(out)
}

/// Streaming counterpart of [`sanitize`], with identical output for any
/// split of the input into fragments.
///
/// Removing a block rejoins the text around it, and the rejoined text can
/// complete a new open tag (`<thi` + `nk>`). So the filter only releases
/// text that no later removal can reach: everything before the trailing run
/// of partial open tags, and nothing from the current block on.
#[derive(Debug, Clone)]
pub struct ReasoningFilter {
    tags: ReasoningTags,
    /// Output not yet released.
    pending: String,
    /// Offset in `pending` of the open tag of the current block.
    open_at: Option<usize>,
    /// Byte offset in `pending` where the close-tag search resumes.
    close_scan_from: usize,
}

impl ReasoningFilter {
    #[must_use]
    pub fn new(tags: ReasoningTags) -> Self {
        Self {
            tags,
            pending: String::new(),
            open_at: None,
            close_scan_from: 0,
        }
    }

    /// Feed one fragment and return the text that is safe to emit now.
    pub fn push(&mut self, fragment: &str) -> String {
        if self.tags.open.is_empty() || self.tags.close.is_empty() {
            return fragment.to_owned();
        }
        self.pending.push_str(fragment);

        let open = self.tags.open.as_bytes();
        let close = self.tags.close.as_bytes();
        let mut visible = String::new();
        loop {
            if let Some(open_at) = self.open_at {
                let haystack = &self.pending.as_bytes()[self.close_scan_from..];
                if let Some(rel) = memmem::find(haystack, close) {
                    let end = self.close_scan_from + rel + close.len();
                    let rest = self.pending.split_off(end);
                    self.pending.truncate(open_at);
                    self.pending.push_str(&rest);
                    self.open_at = None;
                    continue;
                }

                let safe = open_at - chain_suffix_len(&self.pending[..open_at], &self.tags.open);
                visible.extend(self.pending.drain(..safe));
                let open_at = open_at - safe;
                self.open_at = Some(open_at);
                // Next search only needs to cover a close tag that straddles
                // the current end of `pending`.
                let mut from = self
                    .pending
                    .len()
                    .saturating_sub(close.len() - 1)
                    .max(open_at + open.len());
                while !self.pending.is_char_boundary(from) {
                    from -= 1;
                }
                self.close_scan_from = from;
                break;
            }

            if let Some(start) = memmem::find(self.pending.as_bytes(), open) {
                self.open_at = Some(start);
                self.close_scan_from = start + open.len();
                continue;
            }

            let safe = self.pending.len() - chain_suffix_len(&self.pending, &self.tags.open);
            visible.extend(self.pending.drain(..safe));
            break;
        }
        visible
    }

    /// Release everything still held.
    ///
    /// A partial open tag comes back as plain text; an unclosed block comes
    /// back verbatim, open tag included.
    pub fn flush(&mut self) -> String {
        self.open_at = None;
        self.close_scan_from = 0;
        std::mem::take(&mut self.pending)
    }

    /// Whether the filter is currently inside an unclosed block.
    #[must_use]
    pub fn in_block(&self) -> bool {
        self.open_at.is_some()
    }

    #[must_use]
    pub fn held_len(&self) -> usize {
        self.pending.len()
    }
}

/// Length of the longest suffix of `text` made of proper prefixes of
/// `open`, back to back. Any of them may still become part of an open tag.
fn chain_suffix_len(text: &str, open: &str) -> usize {
    let bytes = text.as_bytes();
    let open_bytes = open.as_bytes();
    let max_piece = open.len().saturating_sub(1);
    if max_piece == 0 {
        return 0;
    }

    // reachable[i]: text[i..] splits into pieces.
    let mut reachable = vec![false; bytes.len() + 1];
    reachable[bytes.len()] = true;
    let mut start = bytes.len();
    let mut misses = 0usize;
    for i in (0..bytes.len()).rev() {
        let longest = max_piece.min(bytes.len() - i);
        reachable[i] = (1..=longest).any(|len| {
            open.is_char_boundary(len)
                && reachable[i + len]
                && bytes[i..i + len] == open_bytes[..len]
        });
        if reachable[i] {
            start = i;
            misses = 0;
        } else {
            misses += 1;
            if misses >= max_piece {
                break;
            }
        }
    }
    bytes.len() - start
}
