//! Splitting narration scripts into synthesizer-sized chunks.

/// Split `text` into chunks of at most `max_len` characters.
///
/// Sentences (ending in `.`, `!` or `?`) are packed greedily and joined by
/// single spaces. A sentence longer than `max_len` is split at word
/// boundaries, and a single word longer than `max_len` at characters.
pub fn split_into_chunks(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence in sentences(text) {
        for piece in fit_sentence(&sentence, max_len) {
            let piece_len = piece.chars().count();
            let current_len = current.chars().count();

            if current.is_empty() {
                current = piece;
            } else if current_len + 1 + piece_len <= max_len {
                current.push(' ');
                current.push_str(&piece);
            } else {
                chunks.push(std::mem::replace(&mut current, piece));
            }
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for c in text.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            push_trimmed(&mut sentences, &current);
            current.clear();
        }
    }
    push_trimmed(&mut sentences, &current);
    sentences
}

fn push_trimmed(out: &mut Vec<String>, s: &str) {
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if !collapsed.is_empty() {
        out.push(collapsed);
    }
}

/// Break one sentence into pieces no longer than `max_len`
fn fit_sentence(sentence: &str, max_len: usize) -> Vec<String> {
    if sentence.chars().count() <= max_len {
        return vec![sentence.to_string()];
    }

    let mut pieces = Vec::new();
    let mut current = String::new();

    for word in sentence.split_whitespace() {
        let word_len = word.chars().count();

        if word_len > max_len {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            let chars: Vec<char> = word.chars().collect();
            pieces.extend(chars.chunks(max_len).map(|c| c.iter().collect::<String>()));
            continue;
        }

        if current.is_empty() {
            current.push_str(word);
        } else if current.chars().count() + 1 + word_len <= max_len {
            current.push(' ');
            current.push_str(word);
        } else {
            pieces.push(std::mem::replace(&mut current, word.to_string()));
        }
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_one_chunk() {
        let chunks = split_into_chunks("Hello there. How are you?", 100);
        assert_eq!(chunks, vec!["Hello there. How are you?"]);
    }

    #[test]
    fn test_sentences_are_packed_greedily() {
        let chunks = split_into_chunks("One two. Three four. Five six.", 20);
        assert_eq!(chunks, vec!["One two. Three four.", "Five six."]);
    }

    #[test]
    fn test_long_sentence_splits_on_words() {
        let chunks = split_into_chunks("alpha beta gamma delta epsilon", 12);
        assert_eq!(chunks, vec!["alpha beta", "gamma delta", "epsilon"]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 12));
    }

    #[test]
    fn test_long_word_splits_on_chars() {
        let chunks = split_into_chunks("abcdefghij", 4);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn test_whitespace_is_normalized() {
        let chunks = split_into_chunks("  First\n line.\n\nSecond   line!  ", 100);
        assert_eq!(chunks, vec!["First line. Second line!"]);
    }

    #[test]
    fn test_empty_text() {
        assert!(split_into_chunks("   ", 10).is_empty());
    }
}
