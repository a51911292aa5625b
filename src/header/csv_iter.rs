//! Iteration over the comma (or semicolon) separated sub-values of a
//! multi-valued HTTP field, respecting RFC-style quoted strings and
//! backslash escapes, expressed as an explicit state machine loop.
//!
//! This never fails. An empty sub-value view always means "no more" —
//! genuinely empty fields are a presence-tracking concern handled at the
//! [`super::HttpHeader`] layer, not here.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Unquoted,
    Quoted,
}

/// Iterates the logical sub-values of one or more duplicate field values.
pub struct CsvIter<'a> {
    separator: u8,
    follow_dups: bool,
    /// Duplicate field values not yet visited, in header order.
    pending: VecDeque<&'a str>,
    /// The value currently being scanned.
    cur: &'a str,
    /// Byte offset into `cur` where the next scan starts.
    pos: usize,
    done: bool,
}

impl<'a> CsvIter<'a> {
    /// `separator` is `,` for most multi-valued fields and `;` for Cookie.
    /// `values` are the duplicate field values in header order; only the
    /// first is scanned unless `follow_dups` is set.
    pub fn new(values: impl IntoIterator<Item = &'a str>, separator: u8, follow_dups: bool) -> Self {
        let mut pending: VecDeque<&'a str> = values.into_iter().collect();
        let cur = pending.pop_front().unwrap_or("");
        Self {
            separator,
            follow_dups,
            pending,
            cur,
            pos: 0,
            done: false,
        }
    }

    /// Scans exactly one sub-value starting at the current cursor. Returns
    /// `""` when there is nothing left (end of field, or end of all
    /// followed duplicates).
    fn find_csv(&mut self) -> &'a str {
        loop {
            let bytes = self.cur.as_bytes();
            let end = bytes.len();
            let mut p = self.pos;

            if p >= end {
                if self.advance_to_next_dup() {
                    continue;
                }
                return "";
            }

            // 1. Skip leading whitespace.
            while p < end && is_ws(bytes[p]) {
                p += 1;
            }

            let mut sub_start = p;
            let mut last_data: Option<usize> = None;
            let mut state = ScanState::Unquoted;

            while p < end {
                let b = bytes[p];
                match state {
                    ScanState::Unquoted => {
                        if b == self.separator {
                            break;
                        }
                        if b == b'"' {
                            if p == sub_start {
                                sub_start += 1;
                            }
                            state = ScanState::Quoted;
                            p += 1;
                            continue;
                        }
                        if !is_ws(b) {
                            last_data = Some(p);
                        }
                        p += 1;
                    }
                    ScanState::Quoted => {
                        // Unescaped closing quote: previous byte must not be `\`.
                        if b == b'"' && bytes.get(p.wrapping_sub(1)).copied() != Some(b'\\') {
                            state = ScanState::Unquoted;
                            p += 1;
                            continue;
                        }
                        last_data = Some(p);
                        p += 1;
                    }
                }
            }

            // Advance past the separator (if we stopped on one) for the
            // next call.
            self.pos = if p < end && bytes[p] == self.separator {
                p + 1
            } else {
                p
            };

            return match last_data {
                Some(last) => &self.cur[sub_start..=last],
                None => {
                    if self.advance_to_next_dup() {
                        continue;
                    }
                    ""
                }
            };
        }
    }

    fn advance_to_next_dup(&mut self) -> bool {
        if self.follow_dups {
            if let Some(next) = self.pending.pop_front() {
                self.cur = next;
                self.pos = 0;
                return true;
            }
        }
        false
    }
}

impl<'a> Iterator for CsvIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.done {
            return None;
        }
        let v = self.find_csv();
        if v.is_empty() {
            self.done = true;
            None
        } else {
            Some(v)
        }
    }
}

fn is_ws(b: u8) -> bool {
    b == b' ' || b == b'\t' || b == b'\r' || b == b'\n'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(value: &str, sep: u8) -> Vec<&str> {
        CsvIter::new(std::iter::once(value), sep, false).collect()
    }

    #[test]
    fn simple_csv() {
        assert_eq!(collect("a,b,c", b','), vec!["a", "b", "c"]);
    }

    #[test]
    fn quoted_value_with_comma() {
        assert_eq!(collect("\"This is,\" a test", b','), vec!["This is,\" a test"]);
    }

    #[test]
    fn escaped_quote_passes_through() {
        assert_eq!(collect(r#""a\"b",c"#, b','), vec![r#"a\"b"#, "c"]);
    }

    #[test]
    fn whitespace_is_trimmed() {
        assert_eq!(collect("  a , b  ", b','), vec!["a", "b"]);
    }

    #[test]
    fn unterminated_quote_extends_to_end() {
        assert_eq!(
            collect("\"unterminated, still one value", b','),
            vec!["unterminated, still one value"]
        );
    }

    #[test]
    fn cookie_separator() {
        assert_eq!(collect("a=1; b=2", b';'), vec!["a=1", "b=2"]);
    }

    #[test]
    fn follow_dups_concats_fields() {
        let values = vec!["a,b", "c,d"];
        let iter = CsvIter::new(values, b',', true);
        let out: Vec<&str> = iter.collect();
        assert_eq!(out, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn no_follow_dups_stops_at_first_field() {
        let values = vec!["a,b", "c,d"];
        let iter = CsvIter::new(values, b',', false);
        let out: Vec<&str> = iter.collect();
        assert_eq!(out, vec!["a", "b"]);
    }

    #[test]
    fn empty_field_yields_nothing() {
        let out: Vec<&str> = collect("", b',');
        assert!(out.is_empty());
    }

    #[test]
    fn reconstructs_modulo_whitespace() {
        let original = "  alpha , beta ,gamma";
        let joined = collect(original, b',').join(",");
        assert_eq!(joined, "alpha,beta,gamma");
    }
}
