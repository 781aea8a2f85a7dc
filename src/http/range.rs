//! HTTP byte-range helpers
//!
//! Parsing of inbound `Range` headers and formatting/parsing of the
//! `Range`/`Content-Range` values exchanged with network sources.

use crate::protocol::ByteRange;

/// Outcome of parsing a `Range` request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeParse {
    /// A single satisfiable `bytes=start-[end]` range
    Parsed(ByteRange),
    /// Syntactically broken header
    Unparsed,
    /// Unit other than `bytes`
    NotImplementedRangeType,
    /// Suffix range (`bytes=-500`)
    NotImplementedTailLoad,
    /// More than one range
    NotImplementedMultirange,
    /// Start lies at or beyond the known content size
    OutOfRange,
}

/// Parse a `Range` header value against content of `size` bytes (if known)
///
/// An explicit end is inclusive and is clamped to the last byte of the
/// content when the size is known.
pub fn parse_range_header(value: &str, size: Option<u64>) -> RangeParse {
    let Some((unit, spec)) = value.trim().split_once('=') else {
        return RangeParse::Unparsed;
    };
    let unit = unit.trim();
    if unit.is_empty() {
        return RangeParse::Unparsed;
    }
    if !unit.eq_ignore_ascii_case("bytes") {
        return RangeParse::NotImplementedRangeType;
    }
    if spec.contains(',') {
        return RangeParse::NotImplementedMultirange;
    }

    let Some((start, end)) = spec.trim().split_once('-') else {
        return RangeParse::Unparsed;
    };
    let (start, end) = (start.trim(), end.trim());
    if start.is_empty() {
        return if parse_digits(end).is_some() {
            RangeParse::NotImplementedTailLoad
        } else {
            RangeParse::Unparsed
        };
    }
    let Some(start) = parse_digits(start) else {
        return RangeParse::Unparsed;
    };
    let end = if end.is_empty() {
        None
    } else {
        match parse_digits(end) {
            Some(end) if end >= start => Some(end),
            _ => return RangeParse::Unparsed,
        }
    };

    if let Some(size) = size {
        if start >= size {
            return RangeParse::OutOfRange;
        }
    }

    let range = match end {
        Some(end) => {
            let end = size.map_or(end, |size| end.min(size - 1));
            ByteRange::new(start, (end - start).saturating_add(1))
        }
        None => ByteRange::from_offset(start),
    };
    RangeParse::Parsed(range)
}

fn parse_digits(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// `Content-Range` value for `size` bytes starting at `start`
pub fn content_range(start: u64, size: u64, total: Option<u64>) -> String {
    let end = (start + size).saturating_sub(1);
    match total {
        Some(total) => format!("bytes {}-{}/{}", start, end, total),
        None => format!("bytes {}-{}/*", start, end),
    }
}

/// `Content-Range` value of a 416 response
pub fn unsatisfied_content_range(total: u64) -> String {
    format!("bytes */{}", total)
}

/// `Range` request header for fetching `range` from a source
pub fn range_request_header(range: &ByteRange) -> String {
    match range.end() {
        Some(end) if end > range.start => format!("bytes={}-{}", range.start, end - 1),
        _ => format!("bytes={}-", range.start),
    }
}

/// Parse Content-Range header to extract byte positions
///
/// Format: "bytes start-end/total" or "bytes start-end/*"
pub fn parse_content_range(header: &str) -> Option<(u64, u64, Option<u64>)> {
    let header = header.trim().strip_prefix("bytes ")?;
    let (range, total) = header.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;

    let start = start.parse::<u64>().ok()?;
    let end = end.parse::<u64>().ok()?;
    if end < start {
        return None;
    }

    let total = if total == "*" {
        None
    } else {
        Some(total.parse::<u64>().ok()?)
    };

    Some((start, end, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bounded_range() {
        assert_eq!(
            parse_range_header("bytes=200-499", Some(1000)),
            RangeParse::Parsed(ByteRange::new(200, 300))
        );
        assert_eq!(
            parse_range_header("bytes=0-0", None),
            RangeParse::Parsed(ByteRange::new(0, 1))
        );
        // end past the content is clamped
        assert_eq!(
            parse_range_header("bytes=900-5000", Some(1000)),
            RangeParse::Parsed(ByteRange::new(900, 100))
        );
    }

    #[test]
    fn test_parse_open_range() {
        assert_eq!(
            parse_range_header("bytes=100-", Some(1000)),
            RangeParse::Parsed(ByteRange::from_offset(100))
        );
        assert_eq!(
            parse_range_header(" BYTES = 5 - ", None),
            RangeParse::Parsed(ByteRange::from_offset(5))
        );
    }

    #[test]
    fn test_parse_out_of_range() {
        assert_eq!(parse_range_header("bytes=1000-", Some(1000)), RangeParse::OutOfRange);
        assert_eq!(parse_range_header("bytes=2000-2100", Some(1000)), RangeParse::OutOfRange);
        // unknown size can't be out of range
        assert!(matches!(
            parse_range_header("bytes=2000-2100", None),
            RangeParse::Parsed(_)
        ));
    }

    #[test]
    fn test_parse_unsupported_forms() {
        assert_eq!(parse_range_header("items=0-5", None), RangeParse::NotImplementedRangeType);
        assert_eq!(parse_range_header("bytes=-500", None), RangeParse::NotImplementedTailLoad);
        assert_eq!(
            parse_range_header("bytes=0-5,10-20", None),
            RangeParse::NotImplementedMultirange
        );
    }

    #[test]
    fn test_parse_malformed() {
        for value in ["", "bytes", "bytes=", "bytes=abc-", "bytes=5-2", "=0-1", "bytes=1-x", "bytes=-", "bytes=+1-2"] {
            assert_eq!(parse_range_header(value, Some(100)), RangeParse::Unparsed, "{value}");
        }
    }

    #[test]
    fn test_content_range_formatting() {
        assert_eq!(content_range(200, 300, Some(1000)), "bytes 200-499/1000");
        assert_eq!(content_range(0, 10, None), "bytes 0-9/*");
        assert_eq!(unsatisfied_content_range(1000), "bytes */1000");
    }

    #[test]
    fn test_range_request_header() {
        assert_eq!(range_request_header(&ByteRange::new(0, 100)), "bytes=0-99");
        assert_eq!(range_request_header(&ByteRange::from_offset(100)), "bytes=100-");
        assert_eq!(range_request_header(&ByteRange::new(5, 0)), "bytes=5-");
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 0-99/1000"), Some((0, 99, Some(1000))));
        assert_eq!(parse_content_range("bytes 100-199/*"), Some((100, 199, None)));
        assert_eq!(parse_content_range("invalid"), None);
        assert_eq!(parse_content_range("bytes 0-99"), None);
        assert_eq!(parse_content_range("bytes 99-0/100"), None);
    }
}
