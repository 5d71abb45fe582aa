//! Small string utilities shared across the pipeline.

use std::collections::HashSet;

/// Returns the unique elements of `list`, preserving first-seen order.
#[must_use]
pub fn unique(list: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(list.len());
    let mut result = Vec::with_capacity(list.len());

    for item in list {
        if seen.insert(item.as_str()) {
            result.push(item.clone());
        }
    }

    result
}

/// Splits `input` into chunks of at most `chunk_size` bytes.
///
/// Concatenating the chunks yields `input` again. Inputs are ASCII by
/// construction (TXT record text); a chunk never ends inside a multi-byte
/// character regardless.
#[must_use]
pub fn split_by_length(input: &str, chunk_size: usize) -> Vec<&str> {
    assert!(chunk_size > 0, "chunk_size must be greater than zero");

    let mut chunks = Vec::with_capacity(input.len().div_ceil(chunk_size));
    let mut rest = input;

    while !rest.is_empty() {
        let mut at = chunk_size.min(rest.len());
        while !rest.is_char_boundary(at) {
            at -= 1;
        }
        let (head, tail) = rest.split_at(at);
        chunks.push(head);
        rest = tail;
    }

    chunks
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn unique_preserves_first_seen_order() {
        let list = [
            "mx1.example.test".to_string(),
            "mx2.example.test".to_string(),
            "mx1.example.test".to_string(),
        ];

        assert_eq!(
            unique(&list),
            vec!["mx1.example.test".to_string(), "mx2.example.test".to_string()]
        );
    }

    #[test]
    fn unique_of_empty_is_empty() {
        assert!(unique(&[]).is_empty());
    }

    #[test]
    fn split_empty_input_yields_no_chunks() {
        assert!(split_by_length("", 3).is_empty());
    }

    #[test]
    fn split_exact_and_remainder() {
        assert_eq!(split_by_length("foobar", 3), vec!["foo", "bar"]);
        assert_eq!(split_by_length("foobar", 4), vec!["foob", "ar"]);
    }

    #[test]
    fn split_chunk_at_least_input_length() {
        assert_eq!(split_by_length("foobar", 6), vec!["foobar"]);
        assert_eq!(split_by_length("foobar", 7), vec!["foobar"]);
    }

    #[test]
    fn split_concatenation_equals_input() {
        let input = "a".repeat(600);
        let chunks = split_by_length(&input, 255);

        assert_eq!(
            chunks.iter().map(|c| c.len()).collect::<Vec<_>>(),
            vec![255, 255, 90]
        );
        assert_eq!(chunks.concat(), input);
    }
}
