//! Single-range `Range: bytes=...` handling.

/// Byte range as requested, before the resource size is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=first-last`
    Bounded { first: u64, last: u64 },
    /// `bytes=first-`
    From { first: u64 },
    /// `bytes=-count`
    Suffix { count: u64 },
}

/// Range resolved against a known total size. `last` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub first: u64,
    pub last: u64,
    pub total: u64,
}

impl ResolvedRange {
    pub fn byte_count(&self) -> u64 {
        self.last - self.first + 1
    }

    /// Value for the `Content-Range` response header.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.first, self.last, self.total)
    }
}

impl ByteRange {
    /// Parses a `Range` header value.
    ///
    /// Returns `None` for anything but a single well-formed byte range;
    /// multi-range requests are treated as if no range was requested.
    pub fn parse(value: &str) -> Option<Self> {
        let (unit, spec) = value.trim().split_once('=')?;
        if !unit.trim().eq_ignore_ascii_case("bytes") {
            return None;
        }

        let spec = spec.trim();
        if spec.contains(',') {
            return None;
        }

        let (first, last) = spec.split_once('-')?;
        let (first, last) = (first.trim(), last.trim());
        match (first.is_empty(), last.is_empty()) {
            (true, true) => None,
            (true, false) => {
                let count = last.parse::<u64>().ok()?;
                Some(Self::Suffix { count })
            }
            (false, true) => Some(Self::From {
                first: first.parse::<u64>().ok()?,
            }),
            (false, false) => {
                let first = first.parse::<u64>().ok()?;
                let last = last.parse::<u64>().ok()?;
                if last < first {
                    return None;
                }
                Some(Self::Bounded { first, last })
            }
        }
    }

    /// First byte to seek to before the size is known, if determinable.
    pub fn start_hint(&self) -> Option<u64> {
        match *self {
            Self::Bounded { first, .. } | Self::From { first } => Some(first),
            Self::Suffix { .. } => None,
        }
    }

    /// Validates the range against `total`; `None` means not satisfiable.
    pub fn resolve(&self, total: u64) -> Option<ResolvedRange> {
        if total == 0 {
            return None;
        }

        let (first, last) = match *self {
            Self::Bounded { first, last } => (first, last.min(total - 1)),
            Self::From { first } => (first, total - 1),
            Self::Suffix { count } => {
                if count == 0 {
                    return None;
                }
                (total.saturating_sub(count), total - 1)
            }
        };

        if first > last || last >= total {
            return None;
        }

        Some(ResolvedRange { first, last, total })
    }
}
