//! Event filter matching.
//!
//! Event names are `:`-separated segments. In a filter, `*` matches exactly
//! one segment and `**` matches any number of segments, including none.

/// Returns true if `name` matches `filter`.
pub fn matches(filter: &str, name: &str) -> bool {
    let filter: Vec<&str> = filter.split(':').collect();
    let name: Vec<&str> = name.split(':').collect();
    match_segments(&filter, &name)
}

fn match_segments(filter: &[&str], name: &[&str]) -> bool {
    match (filter.split_first(), name.split_first()) {
        (None, None) => true,
        (Some((&"**", rest)), _) => {
            (0..=name.len()).any(|skip| match_segments(rest, &name[skip..]))
        }
        (Some((&"*", rest)), Some((_, name_rest))) => match_segments(rest, name_rest),
        (Some((segment, rest)), Some((head, name_rest))) => {
            segment == head && match_segments(rest, name_rest)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal() {
        assert!(matches("vm:a:start", "vm:a:start"));
        assert!(!matches("vm:a:start", "vm:a:start:ok"));
    }

    #[test]
    fn test_single_segment_wildcard() {
        assert!(matches("vm:*:start:ok", "vm:alpha:start:ok"));
        assert!(!matches("vm:*:ok", "vm:alpha:start:ok"));
    }

    #[test]
    fn test_multi_segment_wildcard() {
        assert!(matches("vm:alpha:**", "vm:alpha:root:install:ok"));
        assert!(matches("vm:**:error", "vm:alpha:root:install:error"));
        assert!(matches("**", "anything:at:all"));
        assert!(matches("vm:alpha:**", "vm:alpha"));
        assert!(!matches("vm:beta:**", "vm:alpha:start"));
    }
}
