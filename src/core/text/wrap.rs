//! Visible width and wrap-aware line counting.

use emojis::get as emoji_get;
use unicode_segmentation::UnicodeSegmentation;
use unicode_width::UnicodeWidthChar;

use super::ansi::strip_ansi_codes;

const TAB_WIDTH: usize = 3;

/// Terminal cell width of a single grapheme cluster.
pub fn grapheme_width(grapheme: &str) -> usize {
    if grapheme.is_empty() {
        return 0;
    }
    if grapheme == "\t" {
        return TAB_WIDTH;
    }

    if emoji_get(grapheme).is_some() {
        return 2;
    }

    let mut width = 0;
    for ch in grapheme.chars() {
        if ch == '\t' {
            width += TAB_WIDTH;
            continue;
        }
        width += UnicodeWidthChar::width(ch).unwrap_or(0);
    }
    width
}

/// Visible width of `input`, ignoring escape sequences.
pub fn visible_width(input: &str) -> usize {
    if input.is_empty() {
        return 0;
    }
    let clean = strip_ansi_codes(input);
    clean.graphemes(true).map(grapheme_width).sum()
}

/// Number of terminal rows consumed by line breaks in `s` when printing
/// starts at `start_column` on a terminal `width` cells wide.
///
/// Counts completed breaks only: a literal newline, or the running column
/// reaching `width` (a string of exactly `width` cells from column 0 counts
/// one wrap). Trailing characters short of a break are not counted; callers
/// track them through [`trailing_columns`]. Escape sequences contribute no
/// width.
pub fn count_lines(s: &str, start_column: usize, width: usize) -> usize {
    if s.is_empty() {
        return 0;
    }
    let stripped = strip_ansi_codes(s);
    let mut lines = 0;
    let mut column = start_column;
    for grapheme in stripped.graphemes(true) {
        if grapheme == "\n" || grapheme == "\r\n" {
            lines += 1;
            column = 0;
            continue;
        }
        column += grapheme_width(grapheme);
        if width > 0 && column >= width {
            lines += 1;
            column = 0;
        }
    }
    lines
}

/// Visible width of the text after the last newline (the whole string when
/// there is none). The write path uses this to track the cursor column left
/// behind by a partial line.
pub fn trailing_columns(s: &str) -> usize {
    let stripped = strip_ansi_codes(s);
    let tail = match stripped.rfind('\n') {
        Some(index) => &stripped[index + 1..],
        None => stripped.as_str(),
    };
    tail.graphemes(true).map(grapheme_width).sum()
}
