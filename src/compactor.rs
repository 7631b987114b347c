use crate::chain::{Chain, Edge, Parent};
use crate::codec::{ChainDecoder, ChainEncoder};
use crate::error::Result;
use crate::merge::MergeOptions;
use crate::storage::{replace_file, StorageLayout};
use crate::tokenizer::matches_token;
use std::fs;
use std::io::{BufRead, Write};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DefluffOutcome {
    pub edges_removed: usize,
    pub parents_removed: usize,
}

impl std::ops::AddAssign for DefluffOutcome {
    fn add_assign(&mut self, other: Self) {
        self.edges_removed += other.edges_removed;
        self.parents_removed += other.parents_removed;
    }
}

/// Drop every edge with weight at or below `threshold`, then every parent left without edges.
pub fn defluff_stream<R: BufRead, W: Write>(
    existing: ChainDecoder<R>,
    threshold: u64,
    encoder: &mut ChainEncoder<W>,
) -> Result<DefluffOutcome> {
    let mut outcome = DefluffOutcome::default();
    for parent in existing {
        let mut parent = parent?;
        outcome.edges_removed += prune(&mut parent.children, |e| e.value <= threshold);
        outcome.edges_removed += prune(&mut parent.grandparents, |e| e.value <= threshold);
        if parent.is_empty() {
            outcome.parents_removed += 1;
            continue;
        }
        encoder.add(&parent)?;
    }
    Ok(outcome)
}

/// Remove every record whose word contains `word` as a whole token. Returns the
/// number of records removed: one per dropped parent plus one per edge dropped
/// from a surviving parent.
pub fn cleanse_stream<R: BufRead, W: Write>(
    existing: ChainDecoder<R>,
    word: &str,
    separator: &str,
    encoder: &mut ChainEncoder<W>,
) -> Result<usize> {
    let mut removed = 0;
    for parent in existing {
        let mut parent = parent?;
        let (count, survives) = cleanse_parent(&mut parent, word, separator);
        removed += count;
        if survives {
            encoder.add(&parent)?;
        }
    }
    Ok(removed)
}

/// Same as `cleanse_stream` for a channel's unflushed delta.
pub fn cleanse_delta(delta: &mut Chain, word: &str, separator: &str) -> usize {
    let mut removed = 0;
    let mut kept = Vec::with_capacity(delta.len());
    for parent in delta.parents() {
        let mut parent = parent.clone();
        let (count, survives) = cleanse_parent(&mut parent, word, separator);
        removed += count;
        if survives {
            kept.push(parent);
        }
    }
    if removed > 0 {
        *delta = kept.into_iter().collect();
    }
    removed
}

fn cleanse_parent(parent: &mut Parent, word: &str, separator: &str) -> (usize, bool) {
    if matches_token(&parent.word, word, separator) {
        return (1, false);
    }
    let removed = prune(&mut parent.children, |e| matches_token(&e.word, word, separator))
        + prune(&mut parent.grandparents, |e| matches_token(&e.word, word, separator));
    (removed, !parent.is_empty())
}

fn prune<F: Fn(&Edge) -> bool>(edges: &mut Vec<Edge>, doomed: F) -> usize {
    let before = edges.len();
    edges.retain(|e| !doomed(e));
    before - edges.len()
}

pub fn defluff_chain_file(
    layout: &StorageLayout,
    name: &str,
    threshold: u64,
    options: MergeOptions,
) -> Result<DefluffOutcome> {
    let outcome = rewrite(layout, name, "defluff", options, |decoder, encoder| {
        defluff_stream(decoder, threshold, encoder)
    })?
    .unwrap_or_default();
    debug!(
        chain = %name,
        edges_removed = outcome.edges_removed,
        parents_removed = outcome.parents_removed,
        "defluffed chain"
    );
    Ok(outcome)
}

pub fn cleanse_chain_file(
    layout: &StorageLayout,
    name: &str,
    word: &str,
    separator: &str,
    options: MergeOptions,
) -> Result<usize> {
    let removed = rewrite(layout, name, "cleanse", options, |decoder, encoder| {
        cleanse_stream(decoder, word, separator, encoder)
    })?
    .unwrap_or_default();
    if removed > 0 {
        debug!(chain = %name, removed, "cleansed chain");
    }
    Ok(removed)
}

type FileDecoder = ChainDecoder<std::io::BufReader<fs::File>>;
type FileEncoder = ChainEncoder<std::io::BufWriter<fs::File>>;

/// Stream the chain file through `pass` into a scratch file and swap it in.
/// A chain without a file yields `None`.
fn rewrite<T, F>(
    layout: &StorageLayout,
    name: &str,
    purpose: &str,
    options: MergeOptions,
    pass: F,
) -> Result<Option<T>>
where
    F: FnOnce(FileDecoder, &mut FileEncoder) -> Result<T>,
{
    let path = layout.chain_path(name)?;
    if !path.exists() {
        return Ok(None);
    }
    let temp = layout.temp_path(name, purpose)?;

    let written = ChainDecoder::open(&path).and_then(|decoder| {
        let mut encoder = ChainEncoder::create(&temp)?;
        let result = pass(decoder, &mut encoder)?;
        encoder.finish_file()?;
        Ok(result)
    });
    let result = match written {
        Ok(result) => result,
        Err(e) => {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
    };

    replace_file(&temp, &path, options.replace_attempts, options.replace_backoff)?;
    Ok(Some(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn doc(parents: &[Parent]) -> Vec<u8> {
        let mut encoder = ChainEncoder::new(Vec::new()).unwrap();
        for parent in parents {
            encoder.add(parent).unwrap();
        }
        encoder.finish().unwrap()
    }

    fn parent(word: &str, children: &[(&str, u64)], grandparents: &[(&str, u64)]) -> Parent {
        Parent {
            word: word.to_string(),
            children: children.iter().map(|(w, v)| Edge::new(*w, *v)).collect(),
            grandparents: grandparents.iter().map(|(w, v)| Edge::new(*w, *v)).collect(),
        }
    }

    fn run_defluff(parents: &[Parent], threshold: u64) -> (Vec<Parent>, DefluffOutcome) {
        let input = doc(parents);
        let mut encoder = ChainEncoder::new(Vec::new()).unwrap();
        let outcome = defluff_stream(ChainDecoder::new(Cursor::new(input)), threshold, &mut encoder).unwrap();
        let bytes = encoder.finish().unwrap();
        (serde_json::from_slice(&bytes).unwrap(), outcome)
    }

    fn run_cleanse(parents: &[Parent], word: &str) -> (Vec<Parent>, usize) {
        let input = doc(parents);
        let mut encoder = ChainEncoder::new(Vec::new()).unwrap();
        let removed = cleanse_stream(ChainDecoder::new(Cursor::new(input)), word, " ", &mut encoder).unwrap();
        let bytes = encoder.finish().unwrap();
        (serde_json::from_slice(&bytes).unwrap(), removed)
    }

    #[test]
    fn test_defluff_removes_at_or_below_threshold() {
        let (kept, outcome) = run_defluff(
            &[
                parent("a", &[("b", 5), ("c", 2)], &[("s", 3)]),
                parent("b", &[("e", 1)], &[("a", 2)]),
            ],
            3,
        );
        assert_eq!(kept, vec![parent("a", &[("b", 5)], &[])]);
        assert_eq!(
            outcome,
            DefluffOutcome {
                edges_removed: 4,
                parents_removed: 1
            }
        );
        assert!(kept.iter().flat_map(|p| p.children.iter().chain(&p.grandparents)).all(|e| e.value > 3));
    }

    #[test]
    fn test_defluff_zero_threshold_keeps_everything() {
        let parents = [parent("a", &[("b", 1)], &[("s", 1)])];
        let (kept, outcome) = run_defluff(&parents, 0);
        assert_eq!(kept, parents.to_vec());
        assert_eq!(outcome, DefluffOutcome::default());
    }

    #[test]
    fn test_cleanse_counts_records() {
        let (kept, removed) = run_cleanse(
            &[
                parent("s", &[("x", 1), ("a", 2)], &[]),
                parent("x", &[("a", 1)], &[("s", 1)]),
                parent("a", &[("e", 3)], &[("s", 2), ("x", 1)]),
                parent("y", &[("x", 1)], &[]),
            ],
            "x",
        );
        // parent x, edge s->x, edge a<-x, edge y->x
        assert_eq!(removed, 4);
        assert_eq!(
            kept,
            vec![
                parent("s", &[("a", 2)], &[]),
                parent("a", &[("e", 3)], &[("s", 2)]),
            ]
        );
    }

    #[test]
    fn test_cleanse_matches_whole_tokens_only() {
        let (kept, removed) = run_cleanse(
            &[
                parent("xx", &[("x y", 1)], &[]),
                parent("x y", &[("z", 1)], &[]),
            ],
            "x",
        );
        assert_eq!(removed, 2);
        assert_eq!(kept, Vec::<Parent>::new());
        let (kept, removed) = run_cleanse(&[parent("xx", &[("yx", 1)], &[])], "x");
        assert_eq!(removed, 0);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_cleanse_delta() {
        let mut delta = Chain::new();
        delta.parent_mut("s").bump_child("x");
        delta.parent_mut("x").bump_grandparent("s");
        delta.parent_mut("a").bump_child("b");
        assert_eq!(cleanse_delta(&mut delta, "x", " "), 2);
        assert_eq!(delta.len(), 1);
        assert!(delta.get("a").is_some());
        assert_eq!(cleanse_delta(&mut delta, "x", " "), 0);
    }

    #[test]
    fn test_file_passes_skip_missing_chain() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path(), None);
        layout.ensure().unwrap();
        let options = MergeOptions::default();
        assert_eq!(
            defluff_chain_file(&layout, "ghost", 5, options).unwrap(),
            DefluffOutcome::default()
        );
        assert_eq!(cleanse_chain_file(&layout, "ghost", "x", " ", options).unwrap(), 0);
        assert!(!layout.chain_path("ghost").unwrap().exists());
    }

    #[test]
    fn test_defluff_chain_file_rewrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path(), None);
        layout.ensure().unwrap();
        let path = layout.chain_path("chan").unwrap();
        fs::write(&path, doc(&[parent("a", &[("b", 9), ("c", 1)], &[])])).unwrap();

        let outcome = defluff_chain_file(&layout, "chan", 1, MergeOptions::default()).unwrap();
        assert_eq!(outcome.edges_removed, 1);
        let parents: Vec<Parent> = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(parents, vec![parent("a", &[("b", 9)], &[])]);
        assert!(!layout.temp_path("chan", "defluff").unwrap().exists());
    }
}
