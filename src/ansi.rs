//! ANSI escape stripping for prompt detection
//!
//! The wrapped agent colors and repaints its output heavily. Prompt
//! detection works on visible characters only, so this module removes
//! exactly three classes of control sequences:
//!
//! - CSI: `ESC [ params final` (colors, cursor movement, erase)
//! - OSC: `ESC ] ... BEL` (window title and friends)
//! - Charset select: `ESC ( X` / `ESC ) X`
//!
//! Everything else — including raw newlines — passes through untouched,
//! so line- and length-based heuristics downstream stay accurate.
//! This is deliberately not a general ANSI parser.

use regex::Regex;
use std::sync::OnceLock;

/// CSI sequences: ESC [ then parameter/intermediate bytes, then a final letter
fn csi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").unwrap())
}

/// OSC sequences terminated by BEL
fn osc_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\][^\x07]*\x07").unwrap())
}

/// Two-character charset select sequences: ESC ( X or ESC ) X
fn charset_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b[()][A-Za-z0-9]").unwrap())
}

/// Strip terminal control sequences from text.
///
/// Total function: no failure mode, and idempotent — stripping already
/// stripped text is a no-op.
pub fn strip(text: &str) -> String {
    let out = csi_regex().replace_all(text, "");
    let out = osc_regex().replace_all(&out, "");
    let out = charset_regex().replace_all(&out, "");
    out.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- sequence classes ----

    #[test]
    fn strips_csi_colors() {
        assert_eq!(strip("\x1b[31mred\x1b[0m"), "red");
    }

    #[test]
    fn strips_csi_cursor_and_private_modes() {
        assert_eq!(strip("\x1b[2Jcleared\x1b[?25h"), "cleared");
        assert_eq!(strip("a\x1b[10;20Hb"), "ab");
    }

    #[test]
    fn strips_osc_title() {
        assert_eq!(strip("\x1b]0;my title\x07text"), "text");
    }

    #[test]
    fn strips_charset_select() {
        assert_eq!(strip("\x1b(Bhello\x1b)0"), "hello");
    }

    // ---- preservation ----

    #[test]
    fn preserves_plain_text_and_newlines() {
        let s = "line one\nline two\r\nline three\n";
        assert_eq!(strip(s), s);
    }

    #[test]
    fn preserves_unicode() {
        assert_eq!(strip("\x1b[1m─❯─\x1b[0m"), "─❯─");
    }

    #[test]
    fn empty_input() {
        assert_eq!(strip(""), "");
    }

    // ---- idempotence ----

    #[test]
    fn idempotent_on_mixed_input() {
        let cases = [
            "\x1b[31mAllow Bash?\x1b[0m\n(Y)es / (N)o\n",
            "plain text, no escapes",
            "\x1b]2;title\x07\x1b(B\x1b[2K\x1b[1Gready",
            "",
        ];
        for s in cases {
            let once = strip(s);
            assert_eq!(strip(&once), once, "strip not idempotent for {:?}", s);
        }
    }
}
