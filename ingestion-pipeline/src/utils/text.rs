/// Longest prefix of `text` with at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text.get(..byte_idx).unwrap_or(text),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate_chars("Überweisung", 3), "Übe");
        assert_eq!(truncate_chars("short", 12_000), "short");
        assert_eq!(truncate_chars("", 0), "");
    }
}
