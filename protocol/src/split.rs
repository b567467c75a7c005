//! Message splitting (§6): chat messages are chunked at 92 chars, IMs at
//! 512, preferring a word boundary when one falls past a third of the
//! chunk length. Also carries the Aa "non-ASCII -> space" substitution
//! (§4.4/§9.5 — lossy by design, no escape mechanism).

pub const CHAT_CHUNK_LEN: usize = 92;
pub const IM_CHUNK_LEN: usize = 512;

/// Splits `s` into chunks of at most `max_len` bytes, breaking on the last
/// space within the window when it lies beyond a third of `max_len`;
/// otherwise hard-splits at `max_len`. The space at a word-boundary split
/// is consumed (not duplicated into either chunk).
pub fn split_message(s: &str, max_len: usize) -> Vec<String> {
    let bytes = s.as_bytes();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let min_boundary = max_len / 3;

    while bytes.len() - start > max_len {
        let window = &bytes[start..start + max_len];
        let split_len = match window.iter().rposition(|&b| b == b' ') {
            Some(pos) if pos > min_boundary => pos,
            _ => max_len,
        };

        chunks.push(String::from_utf8_lossy(&bytes[start..start + split_len]).into_owned());

        let mut next = start + split_len;
        if next < bytes.len() && bytes[next] == b' ' {
            next += 1;
        }
        start = next;
    }

    chunks.push(String::from_utf8_lossy(&bytes[start..]).into_owned());
    chunks
}

/// Replaces every non-ASCII character with a space. Lossy by design; the
/// legacy clients this protocol serves have no escape mechanism for it.
pub fn sanitize_ascii(s: &str) -> String {
    s.chars().map(|c| if c.is_ascii() { c } else { ' ' }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_chunk_fits_the_limit() {
        let long = "a".repeat(500);
        for chunk in split_message(&long, CHAT_CHUNK_LEN) {
            assert!(chunk.len() <= CHAT_CHUNK_LEN);
        }
    }

    #[test]
    fn splits_on_word_boundary_past_a_third() {
        let s = format!("{} {}", "x".repeat(60), "y".repeat(60));
        let chunks = split_message(&s, CHAT_CHUNK_LEN);
        assert_eq!(chunks[0], "x".repeat(60));
        assert_eq!(chunks[1], "y".repeat(60));
    }

    #[test]
    fn hard_splits_when_no_boundary_past_a_third() {
        let s = "a".repeat(100);
        let chunks = split_message(&s, CHAT_CHUNK_LEN);
        assert_eq!(chunks[0].len(), CHAT_CHUNK_LEN);
        assert_eq!(chunks[0].clone() + &chunks[1], s);
    }

    #[test]
    fn sanitize_replaces_non_ascii() {
        assert_eq!(sanitize_ascii("hi \u{00e9} there"), "hi   there");
    }
}
