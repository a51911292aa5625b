//! Serves byte-range requests out of a full response body.
//!
//! Given a list of `(start, end)` byte ranges and the original content
//! length, produces either a single `206 Partial Content` body or a
//! `multipart/byteranges` stream separated by a fixed boundary, tracking
//! how many original-body bytes have been consumed (`done_byte`) to know
//! when to skip, emit, or advance to the next range.

use crate::header::HttpHeader;

use super::TransformStageImpl;

const RANGE_SEPARATOR: &str = "RANGE_SEPARATOR";

/// Parses a `Range: bytes=...` field value into inclusive, 0-based
/// `(start, end)` pairs clamped to `content_length`, per RFC 7233 §2.1.
/// Unsatisfiable or malformed sub-ranges are dropped; returns `None` if
/// nothing in the header is satisfiable.
pub fn parse_ranges(value: &str, content_length: i64) -> Option<Vec<(i64, i64)>> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let mut ranges = Vec::new();

    for part in spec.split(',') {
        let part = part.trim();
        let Some((start_str, end_str)) = part.split_once('-') else {
            continue;
        };

        let (start, end) = if start_str.is_empty() {
            let suffix_len: i64 = match end_str.parse() {
                Ok(n) if n > 0 => n,
                _ => continue,
            };
            ((content_length - suffix_len).max(0), content_length - 1)
        } else {
            let Ok(start) = start_str.parse::<i64>() else {
                continue;
            };
            let end = if end_str.is_empty() {
                content_length - 1
            } else {
                match end_str.parse::<i64>() {
                    Ok(e) => e.min(content_length - 1),
                    Err(_) => continue,
                }
            };
            (start, end)
        };

        if start < 0 || start > end || start >= content_length {
            continue;
        }
        ranges.push((start, end));
    }

    if ranges.is_empty() {
        None
    } else {
        Some(ranges)
    }
}

pub struct RangeTransform {
    ranges: Vec<(i64, i64)>,
    content_length: i64,
    content_type: String,
    multi: bool,
    cur: usize,
    /// Count of original-body bytes consumed so far, `-1` meaning "none
    /// yet" so the first skip computation (`start - done_byte - 1`) lands
    /// on the right offset.
    done_byte: i64,
    header_emitted_for_cur: bool,
    closing_emitted: bool,
}

impl RangeTransform {
    pub fn new(ranges: Vec<(i64, i64)>, content_length: i64, content_type: impl Into<String>) -> Self {
        let multi = ranges.len() > 1;
        Self {
            ranges,
            content_length,
            content_type: content_type.into(),
            multi,
            cur: 0,
            done_byte: -1,
            header_emitted_for_cur: false,
            closing_emitted: false,
        }
    }

    /// Rewrites the response header to describe this transform's output:
    /// status becomes 206, and either `Content-Range` (single range) or
    /// `Content-Type: multipart/byteranges; boundary=...` (multi-range).
    pub fn prepare_header(&self, header: &mut HttpHeader) {
        header.set_status(206, "Partial Content");
        if self.multi {
            header.set("Content-Type", format!("multipart/byteranges; boundary={RANGE_SEPARATOR}"));
            header.remove("Content-Range");
        } else if let Some(&(start, end)) = self.ranges.first() {
            header.set("Content-Range", format!("bytes {start}-{end}/{}", self.content_length));
        }
    }

    fn part_header(&self, start: i64, end: i64) -> Vec<u8> {
        format!(
            "--{RANGE_SEPARATOR}\r\nContent-Type: {}\r\nContent-Range: bytes {start}-{end}/{}\r\n\r\n",
            self.content_type, self.content_length
        )
        .into_bytes()
    }

    fn closing_boundary(&self) -> Vec<u8> {
        format!("--{RANGE_SEPARATOR}--\r\n").into_bytes()
    }
}

impl TransformStageImpl for RangeTransform {
    fn process(&mut self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut pos = 0usize;

        while pos < input.len() && self.cur < self.ranges.len() {
            let (start, end) = self.ranges[self.cur];

            if self.multi && !self.header_emitted_for_cur {
                out.extend(self.part_header(start, end));
                self.header_emitted_for_cur = true;
            }

            // (a) skip bytes preceding this range's start.
            let to_skip = (start - self.done_byte - 1).max(0) as usize;
            if to_skip > 0 {
                let available = input.len() - pos;
                let skip_now = to_skip.min(available);
                pos += skip_now;
                self.done_byte += skip_now as i64;
                if skip_now < to_skip {
                    break; // ran out of input mid-skip; resume next call
                }
            }

            // (b) emit bytes within [start, end].
            let remaining_in_range = (end - self.done_byte).max(0) as usize;
            let available = input.len() - pos;
            let emit_now = remaining_in_range.min(available);
            if emit_now > 0 {
                out.extend_from_slice(&input[pos..pos + emit_now]);
                pos += emit_now;
                self.done_byte += emit_now as i64;
            }

            if self.done_byte >= end {
                // (c) range complete, advance.
                self.cur += 1;
                self.header_emitted_for_cur = false;
                if self.multi {
                    out.extend_from_slice(b"\r\n");
                    if self.cur >= self.ranges.len() {
                        out.extend(self.closing_boundary());
                        self.closing_emitted = true;
                    }
                }
            } else {
                break; // need more input to finish this range
            }
        }

        out
    }

    fn finish(&mut self) -> Vec<u8> {
        if self.multi && self.cur >= self.ranges.len() && !self.closing_emitted {
            self.closing_emitted = true;
            return self.closing_boundary();
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_range_emits_exact_slice() {
        let mut t = RangeTransform::new(vec![(2, 5)], 20, "text/plain");
        let body = b"0123456789";
        let out = t.process(body);
        assert_eq!(out, b"2345");
        assert!(t.finish().is_empty());
    }

    #[test]
    fn single_range_header_sets_content_range() {
        let t = RangeTransform::new(vec![(2, 5)], 20, "text/plain");
        let mut header = HttpHeader::new_response(200, "OK", (1, 1));
        t.prepare_header(&mut header);
        assert_eq!(header.status(), Some(206));
        assert_eq!(header.get("content-range"), Some("bytes 2-5/20"));
    }

    #[test]
    fn multi_range_wraps_each_part_in_boundary() {
        let mut t = RangeTransform::new(vec![(0, 1), (5, 6)], 10, "text/plain");
        let body = b"0123456789";
        let out = t.process(body);
        let out = String::from_utf8(out).unwrap();
        assert_eq!(
            out,
            "--RANGE_SEPARATOR\r\n\
             Content-Type: text/plain\r\n\
             Content-Range: bytes 0-1/10\r\n\
             \r\n\
             01\r\n\
             --RANGE_SEPARATOR\r\n\
             Content-Type: text/plain\r\n\
             Content-Range: bytes 5-6/10\r\n\
             \r\n\
             56\r\n\
             --RANGE_SEPARATOR--\r\n"
        );
    }

    #[test]
    fn multi_range_header_sets_multipart_content_type() {
        let t = RangeTransform::new(vec![(0, 1), (5, 6)], 10, "text/plain");
        let mut header = HttpHeader::new_response(200, "OK", (1, 1));
        t.prepare_header(&mut header);
        assert_eq!(
            header.get("content-type"),
            Some("multipart/byteranges; boundary=RANGE_SEPARATOR")
        );
        assert!(!header.has("content-range"));
    }

    #[test]
    fn parse_ranges_handles_first_last_and_suffix_forms() {
        assert_eq!(parse_ranges("bytes=0-1,5-6", 10), Some(vec![(0, 1), (5, 6)]));
        assert_eq!(parse_ranges("bytes=-3", 10), Some(vec![(7, 9)]));
        assert_eq!(parse_ranges("bytes=5-", 10), Some(vec![(5, 9)]));
    }

    #[test]
    fn parse_ranges_clamps_end_to_content_length() {
        assert_eq!(parse_ranges("bytes=0-100", 10), Some(vec![(0, 9)]));
    }

    #[test]
    fn parse_ranges_rejects_unsatisfiable_and_non_byte_units() {
        assert_eq!(parse_ranges("bytes=20-30", 10), None);
        assert_eq!(parse_ranges("items=0-1", 10), None);
    }

    #[test]
    fn partial_input_resumes_skip_across_calls() {
        let mut t = RangeTransform::new(vec![(5, 7)], 10, "text/plain");
        let out1 = t.process(b"012"); // all skip, range not reached yet
        assert!(out1.is_empty());
        let out2 = t.process(b"34567");
        assert_eq!(out2, b"567");
    }
}
