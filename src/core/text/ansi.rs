//! ANSI escape extraction, stripping, and SGR color memory.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnsiCodeKind {
    Csi,
    Osc,
    Apc,
    Dcs,
    Ss3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnsiCode {
    pub code: String,
    pub length: usize,
    pub kind: AnsiCodeKind,
}

/// Extract the escape sequence starting at byte offset `pos`, if any.
pub fn extract_ansi_code(input: &str, pos: usize) -> Option<AnsiCode> {
    let bytes = input.as_bytes();
    if pos >= bytes.len() || bytes[pos] != 0x1b {
        return None;
    }
    if pos + 1 >= bytes.len() {
        return None;
    }

    match bytes[pos + 1] {
        b'[' => extract_csi(input, pos),
        b']' => extract_string_terminated(input, pos, AnsiCodeKind::Osc),
        b'_' => extract_string_terminated(input, pos, AnsiCodeKind::Apc),
        b'P' => extract_string_terminated(input, pos, AnsiCodeKind::Dcs),
        b'O' => extract_ss3(input, pos),
        _ => None,
    }
}

fn extract_csi(input: &str, pos: usize) -> Option<AnsiCode> {
    let bytes = input.as_bytes();
    let mut idx = pos + 2;
    while idx < bytes.len() {
        let b = bytes[idx];
        if (0x40..=0x7e).contains(&b) {
            let end = idx + 1;
            return Some(AnsiCode {
                code: input[pos..end].to_string(),
                length: end - pos,
                kind: AnsiCodeKind::Csi,
            });
        }
        idx += 1;
    }
    None
}

fn extract_ss3(input: &str, pos: usize) -> Option<AnsiCode> {
    let bytes = input.as_bytes();
    if pos + 2 >= bytes.len() {
        return None;
    }
    let end = pos + 3;
    Some(AnsiCode {
        code: input[pos..end].to_string(),
        length: end - pos,
        kind: AnsiCodeKind::Ss3,
    })
}

fn extract_string_terminated(input: &str, pos: usize, kind: AnsiCodeKind) -> Option<AnsiCode> {
    let bytes = input.as_bytes();
    let mut idx = pos + 2;
    while idx < bytes.len() {
        if bytes[idx] == 0x07 {
            let end = idx + 1;
            return Some(AnsiCode {
                code: input[pos..end].to_string(),
                length: end - pos,
                kind,
            });
        }
        if bytes[idx] == 0x1b && idx + 1 < bytes.len() && bytes[idx + 1] == b'\\' {
            let end = idx + 2;
            return Some(AnsiCode {
                code: input[pos..end].to_string(),
                length: end - pos,
                kind,
            });
        }
        idx += 1;
    }
    None
}

/// Remove every recognized escape sequence, leaving visible text.
pub fn strip_ansi_codes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut idx = 0;
    while idx < input.len() {
        if let Some(ansi) = extract_ansi_code(input, idx) {
            idx += ansi.length;
            continue;
        }
        let ch = input[idx..].chars().next().expect("missing char");
        out.push(ch);
        idx += ch.len_utf8();
    }
    out
}

/// Remembers the last effective foreground SGR sequence.
///
/// The status redraw clears and rewrites the bottom of the screen, which
/// erases the visual effect of any open color. Re-asserting the remembered
/// sequence at the start of the next write keeps color continuity across
/// redraws. Purely advisory, best effort.
#[derive(Debug, Default)]
pub struct ColorMemory {
    last: Option<String>,
}

impl ColorMemory {
    /// Prefix `s` with the remembered color (if any), then update the memory
    /// from every SGR sequence found in the combined text.
    pub fn remember_and_prefix(&mut self, s: &str) -> String {
        let combined = match &self.last {
            Some(color) => format!("{color}{s}"),
            None => s.to_string(),
        };
        self.remember(&combined);
        combined
    }

    /// Update the memory from SGR sequences in `s` without prefixing.
    pub fn remember(&mut self, s: &str) {
        let mut idx = 0;
        while idx < s.len() {
            let Some(ansi) = extract_ansi_code(s, idx) else {
                let ch = s[idx..].chars().next().expect("missing char");
                idx += ch.len_utf8();
                continue;
            };
            idx += ansi.length;
            if ansi.kind != AnsiCodeKind::Csi {
                continue;
            }
            if let Some(code) = leading_sgr_code(&ansi.code) {
                // Reset, standard foreground, bright foreground.
                if code == 0 || (30..=39).contains(&code) || (90..=97).contains(&code) {
                    self.last = Some(ansi.code);
                }
            }
        }
    }

    pub fn last(&self) -> Option<&str> {
        self.last.as_deref()
    }
}

/// Leading numeric parameter of an SGR (`ESC [ ... m`) sequence.
fn leading_sgr_code(code: &str) -> Option<u16> {
    let params = code.strip_prefix("\x1b[")?.strip_suffix('m')?;
    let leading = params.split(';').next().unwrap_or("");
    leading.parse::<u16>().ok()
}
