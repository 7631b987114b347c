use crate::config::Keys;
use smallvec::SmallVec;

/// Token sequence for one message, sentinels included. Chat lines are short,
/// so most fit inline.
pub type Sequence = SmallVec<[String; 16]>;

pub struct Tokenizer {
    keys: Keys,
    group_size: usize,
}

impl Tokenizer {
    pub fn new(keys: Keys, group_size: usize) -> Self {
        Tokenizer {
            keys,
            group_size: group_size.max(1),
        }
    }

    /// Split text on the separator and join every `group_size` words into one token.
    /// Empty pieces and pieces equal to a sentinel are dropped.
    pub fn tokens(&self, text: &str) -> Vec<String> {
        let words: Vec<&str> = text
            .split(self.keys.separator.as_str())
            .filter(|w| !w.is_empty() && !self.keys.is_sentinel(w))
            .collect();

        words
            .chunks(self.group_size)
            .map(|group| group.join(&self.keys.separator))
            .collect()
    }

    /// `[start, tokens..., end]`, or `None` when the text holds no tokens.
    pub fn sequence(&self, text: &str) -> Option<Sequence> {
        let tokens = self.tokens(text);
        if tokens.is_empty() {
            return None;
        }
        let mut sequence = Sequence::with_capacity(tokens.len() + 2);
        sequence.push(self.keys.start.clone());
        sequence.extend(tokens);
        sequence.push(self.keys.end.clone());
        Some(sequence)
    }
}

/// True when `word` is `target` or contains it as one separator-delimited token.
pub fn matches_token(word: &str, target: &str, separator: &str) -> bool {
    word == target || word.split(separator).any(|t| t == target)
}
