//! Byte-level primitives shared by the `/proc` parsers.
//!
//! Everything here works directly on the read buffer: whitespace is stepped
//! over through lookup tables, decimals are accumulated digit by digit and
//! fields are returned as offsets into the line rather than copies.

use std::ops::Range;

const fn whitespace_table(with_nl: bool) -> [bool; 256] {
    let mut table = [false; 256];
    table[b' ' as usize] = true;
    table[b'\t' as usize] = true;
    if with_nl {
        table[b'\n' as usize] = true;
    }
    table
}

/// Space and tab.
pub static IS_SPACE: [bool; 256] = whitespace_table(false);
/// Space, tab and newline.
pub static IS_SPACE_OR_NL: [bool; 256] = whitespace_table(true);

#[inline]
pub fn is_space(c: u8) -> bool {
    IS_SPACE[c as usize]
}

#[inline]
pub fn is_space_or_nl(c: u8) -> bool {
    IS_SPACE_OR_NL[c as usize]
}

/// Advances `pos` past spaces and tabs.
#[inline]
pub fn skip_space(buf: &[u8], mut pos: usize) -> usize {
    while pos < buf.len() && is_space(buf[pos]) {
        pos += 1;
    }
    pos
}

/// Advances `pos` to the next space, tab, newline or end of buffer.
#[inline]
pub fn skip_word(buf: &[u8], mut pos: usize) -> usize {
    while pos < buf.len() && !is_space_or_nl(buf[pos]) {
        pos += 1;
    }
    pos
}

/// Index of the `\n` ending the line that contains `start`, or `buf.len()`.
#[inline]
pub fn line_end(buf: &[u8], start: usize) -> usize {
    buf[start..]
        .iter()
        .position(|&c| c == b'\n')
        .map_or(buf.len(), |i| start + i)
}

/// The line containing `start`, without its newline. Used for diagnostics.
pub fn current_line(buf: &[u8], start: usize) -> &[u8] {
    let start = start.min(buf.len());
    let begin = buf[..start]
        .iter()
        .rposition(|&c| c == b'\n')
        .map_or(0, |i| i + 1);
    &buf[begin..line_end(buf, start)]
}

/// Iterates over the lines of a buffer as `(line_num, start_offset, line)`.
///
/// `line_num` is 1-based and `line` excludes the newline. A final newline
/// does not produce a trailing empty line.
pub fn lines(buf: &[u8]) -> Lines<'_> {
    Lines {
        buf,
        pos: 0,
        line_num: 0,
    }
}

pub struct Lines<'a> {
    buf: &'a [u8],
    pos: usize,
    line_num: usize,
}

impl<'a> Iterator for Lines<'a> {
    type Item = (usize, usize, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let start = self.pos;
        let end = line_end(self.buf, start);
        self.pos = end + 1;
        self.line_num += 1;
        Some((self.line_num, start, &self.buf[start..end]))
    }
}

/// Decodes an unsigned decimal. Wraps on overflow like the kernel counters do.
#[inline]
pub fn decode_u64(field: &[u8]) -> Option<u64> {
    if field.is_empty() {
        return None;
    }
    let mut v: u64 = 0;
    for &c in field {
        let d = c.wrapping_sub(b'0');
        if d > 9 {
            return None;
        }
        v = v.wrapping_mul(10).wrapping_add(d as u64);
    }
    Some(v)
}

/// 32-bit variant of [`decode_u64`].
#[inline]
pub fn decode_u32(field: &[u8]) -> Option<u32> {
    if field.is_empty() {
        return None;
    }
    let mut v: u32 = 0;
    for &c in field {
        let d = c.wrapping_sub(b'0');
        if d > 9 {
            return None;
        }
        v = v.wrapping_mul(10).wrapping_add(d as u32);
    }
    Some(v)
}

/// Decodes a decimal with an optional leading `-`.
#[inline]
pub fn decode_i64(field: &[u8]) -> Option<i64> {
    let (negative, digits) = match field.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, field),
    };
    if digits.is_empty() {
        return None;
    }
    let mut v: i64 = 0;
    for &c in digits {
        let d = c.wrapping_sub(b'0');
        if d > 9 {
            return None;
        }
        v = v.wrapping_mul(10).wrapping_add(d as i64);
    }
    Some(if negative { v.wrapping_neg() } else { v })
}

/// Walks the whitespace separated fields of a single line.
#[derive(Debug, Clone)]
pub struct FieldCursor<'a> {
    line: &'a [u8],
    pos: usize,
}

impl<'a> FieldCursor<'a> {
    pub fn new(line: &'a [u8]) -> Self {
        Self { line, pos: 0 }
    }

    /// Starts at `pos` within `line`.
    pub fn at(line: &'a [u8], pos: usize) -> Self {
        Self { line, pos }
    }

    /// Current offset within the line.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Span of the next field, or `None` at end of line.
    pub fn next_span(&mut self) -> Option<Range<usize>> {
        let start = skip_space(self.line, self.pos);
        if start >= self.line.len() {
            self.pos = start;
            return None;
        }
        let end = skip_word(self.line, start);
        self.pos = end;
        Some(start..end)
    }

    /// Next field as a slice.
    pub fn next_field(&mut self) -> Option<&'a [u8]> {
        let line = self.line;
        self.next_span().map(|r| &line[r])
    }

    /// Whatever follows the current position, leading whitespace skipped.
    pub fn rest(&mut self) -> &'a [u8] {
        self.pos = skip_space(self.line, self.pos);
        &self.line[self.pos..]
    }

    /// `true` if only whitespace remains.
    pub fn at_end(&self) -> bool {
        skip_space(self.line, self.pos) >= self.line.len()
    }
}

/// Trims spaces and tabs at both ends.
pub fn trim_space(mut s: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = s {
        if !is_space(*first) {
            break;
        }
        s = rest;
    }
    while let [rest @ .., last] = s {
        if !is_space(*last) {
            break;
        }
        s = rest;
    }
    s
}

/// Trims spaces and tabs at both ends, returning the surviving span of `r`.
pub fn trim_span(buf: &[u8], r: Range<usize>) -> Range<usize> {
    let mut start = r.start;
    let mut end = r.end;
    while start < end && is_space(buf[start]) {
        start += 1;
    }
    while end > start && is_space(buf[end - 1]) {
        end -= 1;
    }
    start..end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_tables() {
        assert!(is_space(b' '));
        assert!(is_space(b'\t'));
        assert!(!is_space(b'\n'));
        assert!(is_space_or_nl(b'\n'));
        assert!(!is_space_or_nl(b'a'));
        assert!(!is_space_or_nl(b'\r'));
    }

    #[test]
    fn test_decode_u64() {
        assert_eq!(decode_u64(b"0"), Some(0));
        assert_eq!(decode_u64(b"18446744073709551615"), Some(u64::MAX));
        assert_eq!(decode_u64(b"12a"), None);
        assert_eq!(decode_u64(b""), None);
        assert_eq!(decode_u64(b"-1"), None);
    }

    #[test]
    fn test_decode_u32_wraps() {
        assert_eq!(decode_u32(b"4294967295"), Some(u32::MAX));
        assert_eq!(decode_u32(b"4294967296"), Some(0));
    }

    #[test]
    fn test_decode_i64() {
        assert_eq!(decode_i64(b"-1"), Some(-1));
        assert_eq!(decode_i64(b"42"), Some(42));
        assert_eq!(decode_i64(b"-"), None);
        assert_eq!(decode_i64(b"4-2"), None);
    }

    #[test]
    fn test_lines() {
        let buf = b"first\nsecond line\n\nlast";
        let got: Vec<_> = lines(buf).collect();
        assert_eq!(
            got,
            vec![
                (1, 0, &b"first"[..]),
                (2, 6, &b"second line"[..]),
                (3, 18, &b""[..]),
                (4, 19, &b"last"[..]),
            ]
        );
        assert_eq!(lines(b"one\n").count(), 1);
    }

    #[test]
    fn test_line_end_and_current_line() {
        let buf = b"abc\ndef ghi\n";
        assert_eq!(line_end(buf, 0), 3);
        assert_eq!(line_end(buf, 4), 11);
        assert_eq!(current_line(buf, 6), b"def ghi");
        assert_eq!(current_line(buf, 1), b"abc");
    }

    #[test]
    fn test_field_cursor() {
        let line = b"  8 0\tsda  12 rest of it ";
        let mut cursor = FieldCursor::new(line);
        assert_eq!(cursor.next_field(), Some(&b"8"[..]));
        assert_eq!(cursor.next_span(), Some(4..5));
        assert_eq!(cursor.next_field(), Some(&b"sda"[..]));
        assert_eq!(cursor.next_field(), Some(&b"12"[..]));
        assert_eq!(cursor.rest(), b"rest of it ");
        assert!(!cursor.at_end());

        let mut cursor = FieldCursor::new(b" x  ");
        assert_eq!(cursor.next_field(), Some(&b"x"[..]));
        assert!(cursor.at_end());
        assert_eq!(cursor.next_field(), None);
    }

    #[test]
    fn test_trim() {
        assert_eq!(trim_space(b" \t ab c\t "), b"ab c");
        assert_eq!(trim_space(b"   "), b"");
        let buf = b"  IO-APIC  ";
        assert_eq!(trim_span(buf, 0..buf.len()), 2..9);
    }
}
