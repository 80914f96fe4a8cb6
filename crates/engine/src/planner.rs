//! Segment planning.

/// Inclusive byte range; `end = None` means "until the end of the body".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end + 1 - self.start)
    }
}

/// Splits a resource into byte ranges.
///
/// Without range support or a known non-zero size the whole resource is a
/// single range. Otherwise the count is `total / min_segment_bytes` clamped to
/// `1..=max_segments`; all ranges share one length and the last one absorbs
/// the remainder.
pub fn plan(
    total_size: Option<u64>,
    range_supported: bool,
    max_segments: u32,
    min_segment_bytes: u64,
) -> Vec<ByteRange> {
    let total = match total_size {
        Some(total) if total > 0 && range_supported => total,
        Some(total) if total > 0 => {
            return vec![ByteRange {
                start: 0,
                end: Some(total - 1),
            }];
        }
        _ => return vec![ByteRange { start: 0, end: None }],
    };

    let by_size = total / min_segment_bytes.max(1);
    let count = by_size.clamp(1, u64::from(max_segments.max(1)));
    let size = total / count;

    (0..count)
        .map(|i| {
            let start = i * size;
            let end = if i == count - 1 {
                total - 1
            } else {
                start + size - 1
            };
            ByteRange {
                start,
                end: Some(end),
            }
        })
        .collect()
}
