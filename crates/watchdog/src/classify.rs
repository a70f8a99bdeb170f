//! Error line classification and stack trace extraction.

use regex::Regex;
use std::sync::LazyLock;

/// Substrings that mark a log line as an error signal.
pub const ERROR_PATTERNS: &[&str] = &["Error:", "FATAL", "[ERROR]", "404 Not Found"];

/// Frames beyond this are dropped from extracted traces.
const MAX_FRAMES: usize = 20;

/// Lines that look like a stack frame or trace header.
static FRAME_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^\s+at\s+\S",                 // JavaScript / Java
        r#"^\s*File "[^"]+", line \d+"#, // Python
        r"^Traceback \(most recent call last\)",
        r"^\s*stack backtrace:",         // Rust
        r"^\s*\d+:\s+\S+::",             // Rust frame
        r"^\s+at\s+[^\s]+\.rs:\d+",      // Rust frame location
        r"^goroutine \d+ \[",            // Go
        r"^\s+\S+\.go:\d+",
        r"^\s*Caused by:",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

/// Whether a line matches any error pattern.
#[must_use]
pub fn is_error_line(line: &str) -> bool {
    ERROR_PATTERNS.iter().any(|p| line.contains(p))
}

fn is_frame(line: &str) -> bool {
    FRAME_PATTERNS.iter().any(|re| re.is_match(line))
}

/// Best-effort stack trace for `message`.
///
/// Looks first inside a multi-line message, then at the buffered lines that
/// follow the last occurrence of the message. Returns `None` when nothing
/// frame-like is found.
#[must_use]
pub fn extract_stack_trace(message: &str, recent: &[String]) -> Option<String> {
    let inline: Vec<&str> = message.lines().skip(1).filter(|l| is_frame(l)).collect();
    if !inline.is_empty() {
        return Some(join_frames(inline));
    }

    let first_line = message.lines().next().unwrap_or(message).trim();
    let start = recent.iter().rposition(|l| l.trim() == first_line)?;

    let frames: Vec<&str> = recent[start + 1..]
        .iter()
        .map(String::as_str)
        .skip_while(|l| l.trim().is_empty())
        .take_while(|l| is_frame(l))
        .collect();

    if frames.is_empty() {
        None
    } else {
        Some(join_frames(frames))
    }
}

fn join_frames(frames: Vec<&str>) -> String {
    let total = frames.len();
    let mut out = frames
        .into_iter()
        .take(MAX_FRAMES)
        .collect::<Vec<_>>()
        .join("\n");
    if total > MAX_FRAMES {
        out.push_str(&format!("\n... {} more frames", total - MAX_FRAMES));
    }
    out
}
