//! Single byte-range resolution (RFC 7233, `bytes=<start>-<end>?` only).

/// A validated inclusive byte range. Always satisfies `start <= end < total_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    start: u64,
    end: u64,
}

impl RangeSpec {
    /// Build a range, or `None` when it does not fit an object of `total_size` bytes.
    pub fn new(start: u64, end: u64, total_size: u64) -> Option<Self> {
        if start > end || end >= total_size {
            return None;
        }
        Some(Self { start, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for a 206 response.
    pub fn content_range(&self, total_size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total_size)
    }
}

/// Outcome of resolving a `Range` header against an object size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeResolution {
    /// No header: serve the whole object with 200.
    NoRange,
    Satisfiable(RangeSpec),
    /// Malformed, unsupported or out of bounds: answer 416.
    Invalid,
}

/// `Content-Range` value for a 416 response.
pub fn unsatisfiable_content_range(total_size: u64) -> String {
    format!("bytes */{}", total_size)
}

/// Resolve a raw `Range` header value against `total_size`.
///
/// Multi-range (`,`) and suffix (`bytes=-N`) forms are not supported and
/// resolve to `Invalid`, as does any range not fully inside the object.
pub fn resolve(header: Option<&str>, total_size: u64) -> RangeResolution {
    let Some(header) = header else {
        return RangeResolution::NoRange;
    };
    let Some(spec) = header.strip_prefix("bytes=") else {
        return RangeResolution::Invalid;
    };
    let Some((start, end)) = spec.split_once('-') else {
        return RangeResolution::Invalid;
    };

    let Some(start) = parse_offset(start) else {
        return RangeResolution::Invalid;
    };
    let end = if end.is_empty() {
        match total_size.checked_sub(1) {
            Some(last) => last,
            None => return RangeResolution::Invalid,
        }
    } else {
        match parse_offset(end) {
            Some(end) => end,
            None => return RangeResolution::Invalid,
        }
    };

    match RangeSpec::new(start, end, total_size) {
        Some(range) => RangeResolution::Satisfiable(range),
        None => RangeResolution::Invalid,
    }
}

/// Strict decimal offset: ASCII digits only, no sign or whitespace.
fn parse_offset(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn satisfiable(header: &str, total: u64) -> RangeSpec {
        match resolve(Some(header), total) {
            RangeResolution::Satisfiable(r) => r,
            other => panic!("expected satisfiable range for {header:?}, got {other:?}"),
        }
    }

    #[test]
    fn absent_header_is_no_range() {
        assert_eq!(resolve(None, 1000), RangeResolution::NoRange);
    }

    #[test]
    fn first_half_of_thousand_bytes() {
        let r = satisfiable("bytes=0-499", 1000);
        assert_eq!((r.start(), r.end(), r.length()), (0, 499, 500));
        assert_eq!(r.content_range(1000), "bytes 0-499/1000");
    }

    #[test]
    fn open_ended_range_runs_to_last_byte() {
        let r = satisfiable("bytes=900-", 1000);
        assert_eq!((r.start(), r.end(), r.length()), (900, 999, 100));
    }

    #[test]
    fn single_byte_ranges() {
        assert_eq!(satisfiable("bytes=0-0", 1).length(), 1);
        assert_eq!(satisfiable("bytes=999-999", 1000).length(), 1);
    }

    #[test]
    fn every_in_bounds_range_has_exact_length() {
        let total = 17;
        for start in 0..total {
            for end in start..total {
                let r = satisfiable(&format!("bytes={start}-{end}"), total);
                assert_eq!(r.length(), end - start + 1);
            }
        }
    }

    #[test]
    fn end_past_size_is_invalid() {
        assert_eq!(resolve(Some("bytes=999-2000"), 1000), RangeResolution::Invalid);
        assert_eq!(resolve(Some("bytes=0-1000"), 1000), RangeResolution::Invalid);
    }

    #[test]
    fn start_past_size_is_invalid() {
        assert_eq!(resolve(Some("bytes=1000-"), 1000), RangeResolution::Invalid);
        assert_eq!(resolve(Some("bytes=1000-1000"), 1000), RangeResolution::Invalid);
    }

    #[test]
    fn reversed_range_is_invalid() {
        assert_eq!(resolve(Some("bytes=500-100"), 1000), RangeResolution::Invalid);
    }

    #[test]
    fn malformed_headers_are_invalid() {
        for header in [
            "",
            "bytes=",
            "bytes=-",
            "bytes=abc-def",
            "bytes=1-x",
            "bytes=+1-5",
            "bytes= 0-5",
            "bytes=0-5 ",
            "items=0-5",
            "Bytes=0-5",
            "bytes=0",
            "bytes=99999999999999999999999-",
        ] {
            assert_eq!(
                resolve(Some(header), 1000),
                RangeResolution::Invalid,
                "header {header:?}"
            );
        }
    }

    #[test]
    fn suffix_and_multi_ranges_are_invalid() {
        assert_eq!(resolve(Some("bytes=-500"), 1000), RangeResolution::Invalid);
        assert_eq!(
            resolve(Some("bytes=0-99,200-299"), 1000),
            RangeResolution::Invalid
        );
    }

    #[test]
    fn empty_object_has_no_satisfiable_range() {
        assert_eq!(resolve(Some("bytes=0-"), 0), RangeResolution::Invalid);
        assert_eq!(resolve(Some("bytes=0-0"), 0), RangeResolution::Invalid);
        assert_eq!(resolve(None, 0), RangeResolution::NoRange);
    }

    #[test]
    fn unsatisfiable_header_value() {
        assert_eq!(unsatisfiable_content_range(1000), "bytes */1000");
    }
}
