//! Content negotiation against an `Accept` header.

/// One parsed media range from an `Accept` header.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRange {
    pub kind: String,
    pub subtype: String,
    pub quality: f32,
}

impl MediaRange {
    /// `2` for `type/subtype`, `1` for `type/*`, `0` for `*/*`.
    fn specificity(&self) -> u8 {
        match (self.kind.as_str(), self.subtype.as_str()) {
            ("*", _) => 0,
            (_, "*") => 1,
            _ => 2,
        }
    }

    fn matches(&self, kind: &str, subtype: &str) -> bool {
        (self.kind == "*" || self.kind == kind) && (self.subtype == "*" || self.subtype == subtype)
    }
}

/// Parses an `Accept` header into media ranges, in header order.
///
/// Ranges without a `/` or with a malformed or out-of-range `q` are dropped.
pub fn parse_accept(header: &str) -> Vec<MediaRange> {
    header
        .split(',')
        .filter_map(|item| {
            let mut parts = item.split(';');
            let (kind, subtype) = split_type(parts.next()?)?;

            let mut quality = 1.0;
            for param in parts {
                let Some((key, value)) = param.split_once('=') else {
                    continue;
                };
                if key.trim().eq_ignore_ascii_case("q") {
                    quality = value.trim().parse::<f32>().ok()?;
                    if !(0.0..=1.0).contains(&quality) {
                        return None;
                    }
                }
            }

            Some(MediaRange {
                kind,
                subtype,
                quality,
            })
        })
        .collect()
}

fn split_type(raw: &str) -> Option<(String, String)> {
    let base = raw.split(';').next()?.trim();
    let (kind, subtype) = base.split_once('/')?;
    let (kind, subtype) = (kind.trim(), subtype.trim());
    if kind.is_empty() || subtype.is_empty() {
        return None;
    }
    Some((kind.to_ascii_lowercase(), subtype.to_ascii_lowercase()))
}

/// Picks the supported media type the caller prefers most.
///
/// For each supported type the most specific matching range decides its
/// quality. The highest quality above zero wins; ties go to the earliest
/// supported type. A missing, blank or unparsable header selects the first
/// supported type. Returns `None` when no supported type is acceptable.
pub fn negotiate<'a, S: AsRef<str>>(accept: Option<&str>, supported: &'a [S]) -> Option<&'a str> {
    let ranges = accept.map(parse_accept).unwrap_or_default();
    if ranges.is_empty() {
        return supported.first().map(AsRef::as_ref);
    }

    let mut best: Option<(&'a str, f32)> = None;
    for candidate in supported {
        let candidate = candidate.as_ref();
        let Some((kind, subtype)) = split_type(candidate) else {
            continue;
        };
        let quality = ranges
            .iter()
            .filter(|range| range.matches(&kind, &subtype))
            .fold(None::<&MediaRange>, |chosen, range| match chosen {
                Some(current) if current.specificity() >= range.specificity() => Some(current),
                _ => Some(range),
            })
            .map_or(0.0, |range| range.quality);

        if quality > 0.0 && best.is_none_or(|(_, q)| quality > q) {
            best = Some((candidate, quality));
        }
    }

    best.map(|(media_type, _)| media_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUPPORTED: [&str; 2] = ["application/json", "text/plain"];

    #[test]
    fn test_parse_accept() {
        let ranges = parse_accept("text/html;level=1, application/json;q=0.8, bogus, */*;q=x");
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].subtype, "html");
        assert_eq!(ranges[1].quality, 0.8);
    }

    #[test]
    fn test_missing_header_uses_first() {
        assert_eq!(negotiate(None, &SUPPORTED), Some("application/json"));
        assert_eq!(negotiate(Some("  "), &SUPPORTED), Some("application/json"));
    }

    #[test]
    fn test_highest_quality_wins() {
        let accept = Some("application/json;q=0.5, text/plain");
        assert_eq!(negotiate(accept, &SUPPORTED), Some("text/plain"));
    }

    #[test]
    fn test_equal_quality_prefers_declaration_order() {
        let accept = Some("text/plain, application/json");
        assert_eq!(negotiate(accept, &SUPPORTED), Some("application/json"));
        assert_eq!(negotiate(Some("*/*"), &SUPPORTED), Some("application/json"));
    }

    #[test]
    fn test_specific_range_overrides_wildcard() {
        let accept = Some("*/*;q=0.9, application/json;q=0");
        assert_eq!(negotiate(accept, &SUPPORTED), Some("text/plain"));

        let accept = Some("text/*;q=0.2, application/*;q=0.1");
        assert_eq!(negotiate(accept, &SUPPORTED), Some("text/plain"));
    }

    #[test]
    fn test_unsupported_only_is_none() {
        assert_eq!(negotiate(Some("image/png, text/html"), &SUPPORTED), None);
    }

    #[test]
    fn test_idempotent() {
        let accept = Some("text/plain;q=0.7, application/json;q=0.7");
        let first = negotiate(accept, &SUPPORTED);
        for _ in 0..10 {
            assert_eq!(negotiate(accept, &SUPPORTED), first);
        }
    }
}
