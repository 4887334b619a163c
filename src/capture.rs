//! Runs one command inside an interactive PTY and returns its output as a
//! unit. Completion relies on a prompt regex: an unusual prompt means the
//! trailer is never sent and the caller's timeout has to force completion.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use tracing::debug;

static PROMPT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:\([^)]*\)\s*)?(?:\[[^\]\s@]+@[^\]\s]+(?:\s[^\]]*)?\]|[\w.-]+@[\w.-]+(?::\S*|\s+\S+)?)\s*[$#%>]\s*$",
    )
    .expect("prompt pattern is valid")
});

static START_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^RRS([0-9a-f]+)[ \t]*$").expect("start pattern is valid"));

static END_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^RRE([0-9a-f]+):(\d+)[ \t]*$").expect("end pattern is valid"));

/// True for `user@host:path$`, `[user@host dir]#`, `user@host dir %` and
/// similar, optionally behind a `(venv)` tag.
pub fn looks_like_prompt(line: &str) -> bool {
    PROMPT_RE.is_match(line.trim_end_matches(['\r', '\n']))
}

/// Escape sequences removed, CRLF folded, lone CRs dropped.
pub fn clean_terminal_text(raw: &[u8]) -> String {
    let stripped = strip_ansi_escapes::strip(raw);
    String::from_utf8_lossy(&stripped)
        .replace("\r\n", "\n")
        .replace('\r', "")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub text: String,
    pub exit_code: i32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CaptureStep {
    Pending,
    /// Bytes to write to the PTY now.
    SendTrailer(Vec<u8>),
    Complete(CommandOutput),
}

/// Cleaned text kept per capture. Older lines go first once the buffer
/// reaches twice this size.
const MAX_RETAINED: usize = 256 * 1024;
/// An unterminated escape sequence longer than this is flushed as is.
const MAX_HELD: usize = 4096;

/// Whether the escape sequence starting at `seq[0]` is complete.
fn escape_terminated(seq: &[u8]) -> bool {
    match seq.get(1) {
        None => false,
        Some(b'[') => seq[2..].iter().any(|b| (0x40..=0x7e).contains(b)),
        Some(b']' | b'P' | b'_' | b'^') => {
            seq[2..].contains(&0x07) || seq[2..].windows(2).any(|w| w == b"\x1b\\")
        }
        Some(b'(' | b')' | b'*' | b'+') => seq.len() >= 3,
        Some(_) => true,
    }
}

/// Length of the prefix of `bytes` that ends neither inside an escape
/// sequence nor inside a multi-byte character.
fn complete_prefix(bytes: &[u8]) -> usize {
    let mut end = bytes.len();
    if let Some(esc) = bytes.iter().rposition(|&b| b == 0x1b) {
        if !escape_terminated(&bytes[esc..]) {
            end = esc;
        }
    }
    let floor = end.saturating_sub(4);
    let mut i = end;
    while i > floor {
        i -= 1;
        let b = bytes[i];
        if b & 0xc0 != 0x80 {
            let need = match b {
                0xc0..=0xdf => 2,
                0xe0..=0xef => 3,
                0xf0..=0xf7 => 4,
                _ => 1,
            };
            if end - i < need {
                return i;
            }
            break;
        }
    }
    end
}

pub struct CaptureSession {
    command: String,
    start_marker: String,
    end_marker: String,
    nonce: String,
    /// Raw bytes waiting for the rest of an escape sequence or character.
    held: Vec<u8>,
    /// Cleaned output. Once the start marker is seen this holds the body only.
    text: String,
    /// Start of the first line not yet searched for markers.
    scanned: usize,
    body_started: bool,
    body_newlines: usize,
    trailer_sent: bool,
    completed: bool,
    started_at: Instant,
}

impl CaptureSession {
    pub fn new(command: &str) -> Self {
        let nonce = format!("{:016x}", rand::thread_rng().gen::<u64>());
        Self::with_nonce(command, nonce)
    }

    fn with_nonce(command: &str, nonce: String) -> Self {
        let start_marker = format!("RRS{nonce}");
        let end_marker = format!("RRE{nonce}");
        Self {
            command: command.trim_end_matches(['\r', '\n']).to_string(),
            start_marker,
            end_marker,
            nonce,
            held: Vec::new(),
            text: String::new(),
            scanned: 0,
            body_started: false,
            body_newlines: 0,
            trailer_sent: false,
            completed: false,
            started_at: Instant::now(),
        }
    }

    pub fn start_marker(&self) -> &str {
        &self.start_marker
    }

    pub fn end_marker(&self) -> &str {
        &self.end_marker
    }

    /// The quotes split the marker so the terminal's echo of this line can
    /// never match it.
    pub fn opening_input(&self) -> Vec<u8> {
        format!("echo 'RRS'{}\n{}\n", self.nonce, self.command).into_bytes()
    }

    pub fn trailer_input(&self) -> Vec<u8> {
        format!("echo 'RRE'{}:$?\n", self.nonce).into_bytes()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Offset just past our start marker line.
    fn find_start(&self, text: &str) -> Option<usize> {
        START_RE
            .captures_iter(text)
            .find(|c| &c[1] == self.nonce)
            .and_then(|c| c.get(0))
            .map(|m| m.end())
    }

    /// Offset of our end marker line and the status it carries.
    fn find_end(&self, text: &str) -> Option<(usize, i32)> {
        let caps = END_RE.captures_iter(text).find(|c| &c[1] == self.nonce)?;
        let at = caps.get(0)?.start();
        Some((at, caps[2].parse::<i32>().unwrap_or(0)))
    }

    fn append(&mut self, raw: &[u8]) {
        let cleaned = clean_terminal_text(raw);
        if self.body_started {
            self.body_newlines += cleaned.matches('\n').count();
        }
        self.text.push_str(&cleaned);
    }

    /// Searches only the lines completed since the previous call.
    fn scan(&mut self) -> Option<CommandOutput> {
        let limit = self.text.rfind('\n').map_or(0, |i| i + 1);
        if limit <= self.scanned {
            return None;
        }
        if !self.body_started {
            let Some(at) = self.find_start(&self.text[self.scanned..limit]) else {
                self.scanned = limit;
                return None;
            };
            let at = self.scanned + at;
            self.text.drain(..at);
            self.body_started = true;
            self.body_newlines = self.text.matches('\n').count();
            self.scanned = 0;
        }
        let limit = self.text.rfind('\n').map_or(0, |i| i + 1);
        if limit <= self.scanned {
            return None;
        }
        match self.find_end(&self.text[self.scanned..limit]) {
            Some((at, exit_code)) => Some(CommandOutput {
                text: self.tidy(&self.text[..self.scanned + at]),
                exit_code,
            }),
            None => {
                self.scanned = limit;
                None
            }
        }
    }

    fn trim_retained(&mut self) {
        if self.text.len() <= 2 * MAX_RETAINED {
            return;
        }
        let mut cut = self.text.len() - MAX_RETAINED;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        if let Some(nl) = self.text[cut..].find('\n') {
            if cut + nl < self.scanned {
                cut += nl + 1;
            }
        }
        self.text.drain(..cut);
        self.scanned = self.scanned.saturating_sub(cut);
        debug!(dropped = cut, "Capture output over limit, dropped oldest lines");
    }

    pub fn feed(&mut self, chunk: &[u8]) -> CaptureStep {
        if self.completed {
            return CaptureStep::Pending;
        }
        self.held.extend_from_slice(chunk);
        let mut ready = complete_prefix(&self.held);
        if self.held.len() - ready > MAX_HELD {
            ready = self.held.len();
        }
        let rest = self.held.split_off(ready);
        let raw = std::mem::replace(&mut self.held, rest);
        self.append(&raw);

        if let Some(out) = self.scan() {
            self.completed = true;
            return CaptureStep::Complete(out);
        }
        self.trim_retained();

        if self.body_started && !self.trailer_sent && self.body_newlines >= 2 {
            let last_line = self.text.rsplit('\n').next().unwrap_or_default();
            if looks_like_prompt(last_line) {
                self.trailer_sent = true;
                return CaptureStep::SendTrailer(self.trailer_input());
            }
        }
        CaptureStep::Pending
    }

    /// Ends the capture with whatever arrived so far and exit code 0.
    /// Returns `None` if it already completed.
    pub fn force(&mut self) -> Option<CommandOutput> {
        if self.completed {
            return None;
        }
        self.completed = true;
        let held = std::mem::take(&mut self.held);
        self.append(&held);
        let body = if self.body_started {
            self.text.as_str()
        } else {
            match self.find_start(&self.text[self.scanned..]) {
                Some(at) => &self.text[self.scanned + at..],
                None => self.text.as_str(),
            }
        };
        Some(CommandOutput {
            text: self.tidy(body),
            exit_code: 0,
        })
    }

    #[cfg(test)]
    fn retained(&self) -> usize {
        self.text.len() + self.held.len()
    }

    fn is_noise(&self, line: &str) -> bool {
        let trimmed = line.trim();
        if trimmed.is_empty() || looks_like_prompt(trimmed) {
            return true;
        }
        if trimmed.contains(&format!("'RRS'{}", self.nonce))
            || trimmed.contains(&format!("'RRE'{}", self.nonce))
        {
            return true;
        }
        let cmd = self.command.trim();
        !cmd.is_empty() && trimmed.ends_with(cmd) && {
            let prefix = trimmed[..trimmed.len() - cmd.len()].trim_end();
            prefix.is_empty()
                || matches!(prefix, "$" | "#" | "%" | ">")
                || looks_like_prompt(prefix)
        }
    }

    /// Drops the echoed command line and prompt lines around the output.
    fn tidy(&self, body: &str) -> String {
        let lines: Vec<&str> = body.split('\n').collect();
        let mut start = 0;
        while start < lines.len() && self.is_noise(lines[start]) {
            start += 1;
        }
        let mut end = lines.len();
        while end > start && self.is_noise(lines[end - 1]) {
            end -= 1;
        }
        lines[start..end].join("\n")
    }
}
