//! Prompt detection over a growing byte stream.
//!
//! A [`PromptSet`] compiles one or more vendor prompt patterns into a single
//! alternation anchored at end-of-buffer. The [`PromptMatcher`] owns the
//! accumulation buffer: every received chunk is fed in, and the active
//! prompt set is matched against the trailing window. NETCONF sessions frame
//! on the RFC 4742 `]]>]]>` end-of-message marker instead.

use std::sync::LazyLock;

use regex::bytes::Regex;

use super::buffer::{PatternBuffer, DEFAULT_SEARCH_DEPTH};

/// RFC 4742 NETCONF end-of-message marker.
pub const NETCONF_EOM: &[u8] = b"]]>]]>";

/// A compiled set of prompt patterns.
///
/// Each pattern must match at the start of the last line of the buffer and
/// extend to the end of the buffer (trailing spaces/tabs allowed). `regex`
/// has no lookbehind, so the line-start requirement is expressed as an
/// explicit `(?:\A|[\r\n])` alternation and the prompt itself is captured to
/// recover its exact span. `\r\n`, `\n` and bare `\r` line endings all
/// qualify as line starts.
#[derive(Debug, Clone)]
pub struct PromptSet {
    regex: Regex,
}

impl PromptSet {
    /// Compile a union of prompt patterns into one end-anchored alternation.
    ///
    /// Empty patterns are skipped; an all-empty input yields a set that
    /// never matches.
    pub fn compile<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let alts: Vec<String> = patterns
            .into_iter()
            .filter(|p| !p.as_ref().is_empty())
            .map(|p| format!("(?:{})", p.as_ref()))
            .collect();

        let body = if alts.is_empty() {
            // never matches
            "[^\\s\\S]".to_string()
        } else {
            alts.join("|")
        };

        let regex = Regex::new(&format!(r"(?:\A|[\r\n])(?P<prompt>{body})[ \t]*\z"))?;
        Ok(Self { regex })
    }

    /// Compile a single pattern (per-command overrides, raw sessions).
    pub fn single(pattern: &str) -> Result<Self, regex::Error> {
        Self::compile([pattern])
    }

    /// Span of the prompt within `haystack`, if the buffer ends in one.
    fn find(&self, haystack: &[u8]) -> Option<(usize, usize)> {
        self.regex
            .captures(haystack)
            .and_then(|c| c.name("prompt"))
            .map(|m| (m.start(), m.end()))
    }
}

/// A successful prompt match.
#[derive(Debug)]
pub struct PromptMatch {
    /// Everything received before the prompt (raw, unnormalized).
    pub output: Vec<u8>,

    /// The prompt text itself.
    pub prompt: Vec<u8>,
}

/// Incremental prompt matcher over accumulated device output.
#[derive(Debug, Default)]
pub struct PromptMatcher {
    buffer: PatternBuffer,
}

impl PromptMatcher {
    pub fn new() -> Self {
        Self {
            buffer: PatternBuffer::new(DEFAULT_SEARCH_DEPTH),
        }
    }

    /// Append a received chunk.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend(chunk);
    }

    /// Try to match any of the active prompts at the end of the buffer.
    ///
    /// On a match the buffer is consumed entirely: the prompt is anchored at
    /// end-of-buffer, so nothing can follow it.
    pub fn match_prompt(&mut self, prompts: &PromptSet) -> Option<PromptMatch> {
        let (offset, tail) = self.buffer.tail_window();
        let (start, end) = prompts.find(tail)?;

        let buf = self.buffer.as_slice();
        let output = buf[..offset + start].to_vec();
        let prompt = buf[offset + start..offset + end].to_vec();
        self.buffer.clear();

        Some(PromptMatch { output, prompt })
    }

    /// Try to match a NETCONF `]]>]]>` framed message.
    ///
    /// Unlike prompts, the marker may appear mid-buffer; bytes after it are
    /// retained for the next message.
    pub fn match_eom(&mut self) -> Option<Vec<u8>> {
        let buf = self.buffer.as_slice();
        let pos = buf
            .windows(NETCONF_EOM.len())
            .position(|w| w == NETCONF_EOM)?;

        let output = buf[..pos].to_vec();
        self.buffer.consume(pos + NETCONF_EOM.len());
        Some(output)
    }

    /// Drain everything accumulated so far.
    pub fn take(&mut self) -> Vec<u8> {
        self.buffer.take()
    }

    /// Lossy text of the trailing `n` bytes, for timeout diagnostics.
    pub fn tail_text(&self, n: usize) -> String {
        let buf = self.buffer.as_slice();
        let start = buf.len().saturating_sub(n);
        String::from_utf8_lossy(&buf[start..]).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }
}

/// Clean up raw command output for the client.
///
/// Removes char+backspace pairs and BEL, collapses `\r\n` / `\n\r` / bare
/// `\r` to `\n`, strips the echoed command when it leads the output, and
/// trims surrounding whitespace.
pub fn normalize_output(command: &str, raw: &[u8]) -> String {
    static LINE_ENDINGS: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(\r+\n)|(\n\r+)|\r").expect("static pattern"));

    // Some devices insert backspace characters into the command echo.
    let mut cleaned: Vec<u8> = Vec::with_capacity(raw.len());
    for &b in raw {
        match b {
            0x08 => {
                cleaned.pop();
            }
            0x07 => {}
            _ => cleaned.push(b),
        }
    }

    let cleaned = LINE_ENDINGS.replace_all(&cleaned, &b"\n"[..]);
    let text = String::from_utf8_lossy(&cleaned);
    let text = text.trim();

    // Strip the echoed command if it is the first line. Devices may re-space
    // the echo, so compare with collapsed whitespace.
    let cmd_norm = normalize_spaces(command);
    if !cmd_norm.is_empty() {
        let mut parts = text.splitn(2, '\n');
        if let Some(first) = parts.next() {
            if normalize_spaces(first) == cmd_norm {
                return parts.next().unwrap_or("").trim().to_string();
            }
        }
    }

    text.to_string()
}

fn normalize_spaces(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
