use crate::chain::Chain;

/// Accumulate the edges of one `[start, tokens..., end]` sequence into a delta chain.
///
/// Head: `start -> tokens[0]` as a child of the start parent.
/// Body: for every `(prev, cur, next)` window, `cur -> next` as a child and
/// `cur <- prev` as a grandparent, both under `cur`.
/// Tail: `tokens[last] -> end` as a grandparent of the end parent.
pub fn extract(chain: &mut Chain, sequence: &[String]) {
    if sequence.len() < 3 {
        return;
    }
    extract_head(chain, sequence);
    extract_body(chain, sequence);
    extract_tail(chain, sequence);
}

fn extract_head(chain: &mut Chain, sequence: &[String]) {
    chain.parent_mut(&sequence[0]).bump_child(&sequence[1]);
}

fn extract_body(chain: &mut Chain, sequence: &[String]) {
    for window in sequence.windows(3) {
        let (previous, current, next) = (&window[0], &window[1], &window[2]);
        let parent = chain.parent_mut(current);
        parent.bump_child(next);
        parent.bump_grandparent(previous);
    }
}

fn extract_tail(chain: &mut Chain, sequence: &[String]) {
    let last = sequence.len() - 1;
    chain.parent_mut(&sequence[last]).bump_grandparent(&sequence[last - 1]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Edge;

    fn seq(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_single_sentence_edges() {
        let mut chain = Chain::new();
        extract(&mut chain, &seq(&["S", "hello", "there", "friend", "E"]));

        assert_eq!(chain.get("S").unwrap().children, vec![Edge::new("hello", 1)]);
        assert!(chain.get("S").unwrap().grandparents.is_empty());

        let hello = chain.get("hello").unwrap();
        assert_eq!(hello.children, vec![Edge::new("there", 1)]);
        assert_eq!(hello.grandparents, vec![Edge::new("S", 1)]);

        let friend = chain.get("friend").unwrap();
        assert_eq!(friend.children, vec![Edge::new("E", 1)]);
        assert_eq!(friend.grandparents, vec![Edge::new("there", 1)]);

        assert_eq!(chain.get("E").unwrap().grandparents, vec![Edge::new("friend", 1)]);
        assert!(chain.get("E").unwrap().children.is_empty());
        assert_eq!(chain.len(), 5);
    }

    #[test]
    fn test_single_token_message() {
        let mut chain = Chain::new();
        extract(&mut chain, &seq(&["S", "hi", "E"]));
        let hi = chain.get("hi").unwrap();
        assert_eq!(hi.children, vec![Edge::new("E", 1)]);
        assert_eq!(hi.grandparents, vec![Edge::new("S", 1)]);
    }

    #[test]
    fn test_repeated_bigrams_accumulate() {
        let mut chain = Chain::new();
        extract(&mut chain, &seq(&["S", "a", "a", "a", "E"]));
        let a = chain.get("a").unwrap();
        assert_eq!(a.children, vec![Edge::new("a", 2), Edge::new("E", 1)]);
        assert_eq!(a.grandparents, vec![Edge::new("S", 1), Edge::new("a", 2)]);
    }

    #[test]
    fn test_degenerate_sequence_ignored() {
        let mut chain = Chain::new();
        extract(&mut chain, &seq(&["S", "E"]));
        assert!(chain.is_empty());
    }
}
