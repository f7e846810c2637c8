use crate::error::GatewayError;

/// Inclusive byte interval requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    pub from_byte: u64,
    pub until_byte: u64,
}

impl RangeRequest {
    /// The whole object, or `None` when it is empty.
    pub fn full(object_size: u64) -> Option<Self> {
        object_size.checked_sub(1).map(|last| Self {
            from_byte: 0,
            until_byte: last,
        })
    }

    pub fn len(&self) -> u64 {
        self.until_byte - self.from_byte + 1
    }

    pub fn content_range(&self, object_size: u64) -> String {
        format!("bytes {}-{}/{}", self.from_byte, self.until_byte, object_size)
    }
}

/// Parse a `Range` header against the object's size.
///
/// `bytes=<from>-<to>`, `bytes=<from>-` and `bytes=-<suffix>` are accepted.
/// An end past the last byte is rejected rather than clamped, as are
/// multi-range requests and any range against an empty object.
pub fn parse_range_header(
    header: Option<&str>,
    object_size: u64,
) -> Result<Option<RangeRequest>, GatewayError> {
    let Some(value) = header else {
        return Ok(None);
    };
    let unsatisfiable = GatewayError::RangeNotSatisfiable { size: object_size };
    if object_size == 0 {
        return Err(unsatisfiable);
    }
    let Some(set) = value.trim().strip_prefix("bytes=") else {
        return Err(unsatisfiable);
    };
    if set.contains(',') {
        return Err(unsatisfiable);
    }
    let Some((left, right)) = set.split_once('-') else {
        return Err(unsatisfiable);
    };
    let (left, right) = (left.trim(), right.trim());

    let range = if left.is_empty() {
        let suffix: u64 = right.parse().map_err(|_| unsatisfiable_for(object_size))?;
        if suffix == 0 {
            return Err(unsatisfiable);
        }
        RangeRequest {
            from_byte: object_size - suffix.min(object_size),
            until_byte: object_size - 1,
        }
    } else {
        let from_byte: u64 = left.parse().map_err(|_| unsatisfiable_for(object_size))?;
        let until_byte = if right.is_empty() {
            object_size - 1
        } else {
            right.parse().map_err(|_| unsatisfiable_for(object_size))?
        };
        RangeRequest {
            from_byte,
            until_byte,
        }
    };

    validate(range, object_size)?;
    Ok(Some(range))
}

/// Enforce `from_byte <= until_byte < object_size`.
pub fn validate(range: RangeRequest, object_size: u64) -> Result<(), GatewayError> {
    if range.until_byte >= object_size || range.from_byte > range.until_byte {
        return Err(unsatisfiable_for(object_size));
    }
    Ok(())
}

fn unsatisfiable_for(size: u64) -> GatewayError {
    GatewayError::RangeNotSatisfiable { size }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_header_returns_none() {
        assert_eq!(parse_range_header(None, 1000).unwrap(), None);
    }

    #[test]
    fn simple_range() {
        let r = parse_range_header(Some("bytes=0-499"), 1000).unwrap().unwrap();
        assert_eq!(r.from_byte, 0);
        assert_eq!(r.until_byte, 499);
        assert_eq!(r.len(), 500);
        assert_eq!(r.content_range(1000), "bytes 0-499/1000");
    }

    #[test]
    fn open_ended_defaults_to_last_byte() {
        let r = parse_range_header(Some("bytes=500-"), 1000).unwrap().unwrap();
        assert_eq!(r.until_byte, 999);
        assert_eq!(r.len(), 500);
    }

    #[test]
    fn suffix() {
        let r = parse_range_header(Some("bytes=-200"), 1000).unwrap().unwrap();
        assert_eq!((r.from_byte, r.until_byte), (800, 999));
        let r = parse_range_header(Some("bytes=-5000"), 1000).unwrap().unwrap();
        assert_eq!((r.from_byte, r.until_byte), (0, 999));
    }

    #[test]
    fn last_byte_only() {
        let r = parse_range_header(Some("bytes=999-999"), 1000).unwrap().unwrap();
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn end_past_object_is_rejected() {
        let err = parse_range_header(Some("bytes=900-1000"), 1000).unwrap_err();
        assert!(matches!(err, GatewayError::RangeNotSatisfiable { size: 1000 }));
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(parse_range_header(Some("bytes=600-500"), 1000).is_err());
    }

    #[test]
    fn start_past_end_is_rejected() {
        assert!(parse_range_header(Some("bytes=1000-"), 1000).is_err());
    }

    #[test]
    fn malformed_values_are_rejected() {
        for bad in ["items=0-1", "bytes=a-b", "bytes=5", "bytes=-0", "bytes=0-100,200-300"] {
            assert!(parse_range_header(Some(bad), 1000).is_err(), "{bad}");
        }
    }

    #[test]
    fn any_range_on_empty_object_is_rejected() {
        assert!(parse_range_header(Some("bytes=0-0"), 0).is_err());
        assert_eq!(RangeRequest::full(0), None);
    }
}
