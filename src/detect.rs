//! Prompt detection state machine
//!
//! Classifies the agent's raw output stream as ordinary text vs. a
//! permission prompt in progress. The decision is online and
//! irrevocable — on each chunk we either forward bytes now or hold
//! them — with no lookahead, so two fixed thresholds bound how long a
//! suspected prompt may be held before it is declared a false start
//! and flushed.
//!
//! Two states:
//! - Idle: no buffered content; chunks pass straight through unless the
//!   start marker ("allow <tool>") appears in the stripped text. A
//!   short tail of already-forwarded stripped text is kept for matching
//!   only, so a marker split across chunk boundaries is still seen.
//! - Accumulating: raw chunks append to the buffer until a line with
//!   both "(Y)es" and "(N)o" tokens completes the block, or the
//!   overflow guard gives up.
//!
//! The buffer always holds original bytes; stripping is only ever
//! applied to a copy for matching, so a flushed or completed block
//! reaches the terminal exactly as the agent wrote it. Bytes forwarded
//! while Idle are never recalled: when a marker straddles a boundary,
//! the prefix has already been displayed and only the current chunk
//! onward is buffered, keeping sink output byte-identical to the input.

use regex::Regex;
use std::sync::OnceLock;

use crate::ansi;
use crate::log::log_info;
use crate::parse::{ToolUseRequest, parse_prompt};

/// Overflow guard: stripped buffer length above this is a false start.
pub const MAX_PROMPT_CHARS: usize = 3000;
/// Overflow guard: stripped line count above this is a false start.
pub const MAX_PROMPT_LINES: usize = 30;

/// Stripped characters retained while Idle for cross-chunk marker
/// matching. Long enough for "allow" plus a tool token.
const IDLE_TAIL_CHARS: usize = 64;

/// Start marker: case-insensitive "allow" followed by a tool-name token
fn start_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\ballow\s+\w+").unwrap())
}

fn yes_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\(y\)es").unwrap())
}

fn no_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\(n\)o").unwrap())
}

/// Completion marker: a single line containing both a "(Y)es" and a
/// "(N)o" token, in either order.
fn has_completion_marker(stripped: &str) -> bool {
    stripped
        .lines()
        .any(|line| yes_regex().is_match(line) && no_regex().is_match(line))
}

/// What the detector decided about a chunk of output.
#[derive(Debug, PartialEq)]
pub enum DetectorEvent {
    /// Raw bytes to forward to the terminal sink unchanged.
    Forward(Vec<u8>),
    /// A completed prompt block: the parsed request plus the entire raw
    /// buffer, which must be forwarded to the sink as one contiguous
    /// write so the human sees the untruncated prompt.
    Prompt {
        request: ToolUseRequest,
        raw: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Idle,
    Accumulating,
}

/// The buffering state machine. One instance per agent session; owns
/// the single piece of mutable state (buffer + mode).
///
/// Invariant: the buffer is non-empty only while Accumulating.
pub struct PromptDetector {
    mode: Mode,
    buffer: Vec<u8>,
    /// Stripped text already forwarded, kept only so a start marker
    /// split across chunks still matches. Never re-emitted.
    idle_tail: String,
    /// Stripped prefix of the current block that was forwarded before
    /// the marker matched. Used for matching/parsing only.
    held_prefix: String,
}

impl Default for PromptDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptDetector {
    pub fn new() -> Self {
        Self {
            mode: Mode::Idle,
            buffer: Vec::new(),
            idle_tail: String::new(),
            held_prefix: String::new(),
        }
    }

    pub fn is_accumulating(&self) -> bool {
        self.mode == Mode::Accumulating
    }

    /// Consume one raw output chunk, in arrival order.
    ///
    /// Returns the events the caller must act on, in order. Chunk
    /// boundaries are arbitrary — a marker may land split across calls,
    /// which is why matching always re-strips the whole buffer.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<DetectorEvent> {
        match self.mode {
            Mode::Idle => {
                let stripped = ansi::strip(&String::from_utf8_lossy(chunk));
                let probe = format!("{}{}", self.idle_tail, stripped);
                if !start_regex().is_match(&probe) {
                    self.retain_tail(probe);
                    return vec![DetectorEvent::Forward(chunk.to_vec())];
                }
                // Seed with the raw chunk, not the stripped version —
                // original bytes are preserved for later display. Any
                // marker prefix already forwarded stays display-side;
                // it is remembered only for matching.
                self.mode = Mode::Accumulating;
                self.held_prefix = std::mem::take(&mut self.idle_tail);
                self.buffer.extend_from_slice(chunk);
                self.evaluate()
            }
            Mode::Accumulating => {
                self.buffer.extend_from_slice(chunk);
                self.evaluate()
            }
        }
    }

    /// Keep the last IDLE_TAIL_CHARS characters of forwarded stripped
    /// text for cross-chunk matching.
    fn retain_tail(&mut self, probe: String) {
        let count = probe.chars().count();
        if count <= IDLE_TAIL_CHARS {
            self.idle_tail = probe;
        } else {
            let skip = count - IDLE_TAIL_CHARS;
            self.idle_tail = probe.chars().skip(skip).collect();
        }
    }

    /// Re-check the accumulated buffer. Completion is tested before the
    /// overflow guard so a completion landing exactly at the threshold
    /// still resolves as a completion.
    fn evaluate(&mut self) -> Vec<DetectorEvent> {
        let stripped = ansi::strip(&String::from_utf8_lossy(&self.buffer));

        if has_completion_marker(&stripped) {
            let block = format!("{}{}", self.held_prefix, stripped);
            self.held_prefix.clear();
            let raw = std::mem::take(&mut self.buffer);
            self.mode = Mode::Idle;
            let request = parse_prompt(&block);
            return vec![DetectorEvent::Prompt { request, raw }];
        }

        if stripped.chars().count() > MAX_PROMPT_CHARS || stripped.lines().count() > MAX_PROMPT_LINES
        {
            // False positive: "allow" appeared in text that never
            // resolved into a real prompt. Flush verbatim.
            log_info(
                "detect",
                "overflow.flush",
                &format!("flushing {} held bytes (no completion marker)", self.buffer.len()),
            );
            self.held_prefix.clear();
            let raw = std::mem::take(&mut self.buffer);
            self.mode = Mode::Idle;
            return vec![DetectorEvent::Forward(raw)];
        }

        Vec::new()
    }

    /// External reset (session restart). Returns the held buffer, which
    /// the caller must forward to the terminal sink — a held block is
    /// never silently dropped. Any decision awaited for the in-flight
    /// block is abandoned by the caller without write-back.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        self.mode = Mode::Idle;
        self.idle_tail.clear();
        self.held_prefix.clear();
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}
