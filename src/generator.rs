use crate::chain::{Edge, Parent};
use crate::codec::ChainDecoder;
use crate::config::Keys;
use crate::error::{MarkovError, Result};
use crate::tokenizer::matches_token;
use crate::weighted::{weighted_random, Reservoir};
use itertools::Itertools;
use rand::Rng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    LikelyBeginning,
    LikelyEnding,
    TargetedBeginning,
    TargetedEnding,
    TargetedMiddle,
    RandomMiddle,
}

impl Method {
    pub const ALL: [Method; 6] = [
        Method::LikelyBeginning,
        Method::LikelyEnding,
        Method::TargetedBeginning,
        Method::TargetedEnding,
        Method::TargetedMiddle,
        Method::RandomMiddle,
    ];

    pub fn is_targeted(self) -> bool {
        matches!(
            self,
            Method::TargetedBeginning | Method::TargetedEnding | Method::TargetedMiddle
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::LikelyBeginning => "LikelyBeginning",
            Method::LikelyEnding => "LikelyEnding",
            Method::TargetedBeginning => "TargetedBeginning",
            Method::TargetedEnding => "TargetedEnding",
            Method::TargetedMiddle => "TargetedMiddle",
            Method::RandomMiddle => "RandomMiddle",
        }
    }
}

impl FromStr for Method {
    type Err = MarkovError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        Method::ALL
            .into_iter()
            .find(|m| m.as_str().to_ascii_lowercase() == wanted)
            .ok_or_else(|| MarkovError::InvalidInput(format!("unknown method '{}'", s)))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Instructions {
    pub chain: String,
    pub method: Method,
    #[serde(default)]
    pub target: String,
}

impl Instructions {
    pub fn new(chain: impl Into<String>, method: Method, target: impl Into<String>) -> Self {
        Instructions {
            chain: chain.into(),
            method,
            target: target.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// What one pass over the chain file learned before any walking starts.
struct Survey {
    parents: usize,
    start: Option<Parent>,
    end: Option<Parent>,
    anchor: Option<Parent>,
}

/// Random walks over one persisted chain file.
///
/// Parents are looked up by streaming the file, so memory use is bounded by
/// the records a single sentence touches rather than the size of the chain.
/// The caller must hold the chain's lock for the generator's lifetime.
pub struct Generator {
    path: PathBuf,
    keys: Keys,
    max_steps: usize,
    min_parents: usize,
    cache: FxHashMap<String, Parent>,
}

impl Generator {
    pub fn new(path: PathBuf, keys: Keys, max_steps: usize, min_parents: usize) -> Self {
        Generator {
            path,
            keys,
            max_steps,
            min_parents,
            cache: FxHashMap::default(),
        }
    }

    pub fn generate<R: Rng + ?Sized>(&mut self, method: Method, target: &str, rng: &mut R) -> Result<String> {
        if !self.path.exists() {
            return Err(MarkovError::NotFound(format!("no chain at {}", self.path.display())));
        }
        if method.is_targeted() {
            self.validate_target(target)?;
        }
        let words = match method {
            Method::LikelyBeginning => self.likely_beginning(rng)?,
            Method::LikelyEnding => self.likely_ending(rng)?,
            Method::TargetedBeginning => self.targeted_beginning(target, rng)?,
            Method::TargetedEnding => self.targeted_ending(target, rng)?,
            Method::TargetedMiddle => self.targeted_middle(target, rng)?,
            Method::RandomMiddle => self.random_middle(rng)?,
        };
        Ok(words.iter().join(&self.keys.separator))
    }

    fn validate_target(&self, target: &str) -> Result<()> {
        if target.is_empty() {
            return Err(MarkovError::InvalidInput("target is empty".into()));
        }
        if target.contains(self.keys.separator.as_str()) {
            return Err(MarkovError::InvalidInput(format!(
                "target '{}' is more than one token",
                target
            )));
        }
        Ok(())
    }

    pub fn likely_beginning<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<Vec<String>> {
        let survey = self.survey(rng, |_| 0)?;
        let start = survey
            .start
            .ok_or_else(|| MarkovError::NotFound("chain has no sentence beginnings".into()))?;
        let first = weighted_random(&start.children, rng)
            .ok_or_else(|| MarkovError::NotFound("chain has no sentence beginnings".into()))?
            .word
            .clone();
        self.from_first_word(first, rng)
    }

    pub fn likely_ending<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<Vec<String>> {
        let survey = self.survey(rng, |_| 0)?;
        let end = survey
            .end
            .ok_or_else(|| MarkovError::NotFound("chain has no sentence endings".into()))?;
        let last = weighted_random(&end.grandparents, rng)
            .ok_or_else(|| MarkovError::NotFound("chain has no sentence endings".into()))?
            .word
            .clone();
        self.from_last_word(last, rng)
    }

    pub fn targeted_beginning<R: Rng + ?Sized>(&mut self, target: &str, rng: &mut R) -> Result<Vec<String>> {
        let survey = self.survey(rng, |_| 0)?;
        let candidates = self.matching(survey.start.map(|p| p.children), target);
        let first = weighted_random(&candidates, rng)
            .ok_or_else(|| no_match(target))?
            .word
            .clone();
        self.from_first_word(first, rng)
    }

    pub fn targeted_ending<R: Rng + ?Sized>(&mut self, target: &str, rng: &mut R) -> Result<Vec<String>> {
        let survey = self.survey(rng, |_| 0)?;
        let candidates = self.matching(survey.end.map(|p| p.grandparents), target);
        let last = weighted_random(&candidates, rng)
            .ok_or_else(|| no_match(target))?
            .word
            .clone();
        self.from_last_word(last, rng)
    }

    pub fn targeted_middle<R: Rng + ?Sized>(&mut self, target: &str, rng: &mut R) -> Result<Vec<String>> {
        let separator = self.keys.separator.clone();
        let survey = self.survey(rng, |p| {
            if matches_token(&p.word, target, &separator) {
                p.total_weight()
            } else {
                0
            }
        })?;
        let anchor = survey.anchor.ok_or_else(|| no_match(target))?;
        self.around(anchor, rng)
    }

    pub fn random_middle<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<Vec<String>> {
        let survey = self.survey(rng, Parent::child_weight)?;
        let anchor = survey
            .anchor
            .ok_or_else(|| MarkovError::NotFound("chain has no words to anchor on".into()))?;
        self.around(anchor, rng)
    }

    fn matching(&self, edges: Option<Vec<Edge>>, target: &str) -> Vec<Edge> {
        edges
            .unwrap_or_default()
            .into_iter()
            .filter(|e| matches_token(&e.word, target, &self.keys.separator))
            .collect()
    }

    fn from_first_word<R: Rng + ?Sized>(&mut self, first: String, rng: &mut R) -> Result<Vec<String>> {
        let mut words = vec![first.clone()];
        words.extend(self.walk(&first, Direction::Forward, rng)?);
        Ok(words)
    }

    fn from_last_word<R: Rng + ?Sized>(&mut self, last: String, rng: &mut R) -> Result<Vec<String>> {
        let mut words = self.walk(&last, Direction::Backward, rng)?;
        words.reverse();
        words.push(last);
        Ok(words)
    }

    /// `backward + anchor + forward`, both walks starting from the anchor.
    fn around<R: Rng + ?Sized>(&mut self, anchor: Parent, rng: &mut R) -> Result<Vec<String>> {
        let word = anchor.word.clone();
        self.cache.insert(word.clone(), anchor);
        let mut words = self.walk(&word, Direction::Backward, rng)?;
        words.reverse();
        words.push(word.clone());
        words.extend(self.walk(&word, Direction::Forward, rng)?);
        Ok(words)
    }

    /// Follow weighted edges from `from` until the sentinel at the end of `direction`.
    /// The returned words exclude `from` and the sentinel, in walk order.
    fn walk<R: Rng + ?Sized>(&mut self, from: &str, direction: Direction, rng: &mut R) -> Result<Vec<String>> {
        let stop = match direction {
            Direction::Forward => self.keys.end.clone(),
            Direction::Backward => self.keys.start.clone(),
        };
        let mut words = Vec::new();
        let mut current = from.to_string();
        loop {
            let parent = self.lookup(&current)?.ok_or_else(|| {
                MarkovError::WalkIncomplete(format!("no record for '{}'", current))
            })?;
            let edges = match direction {
                Direction::Forward => &parent.children,
                Direction::Backward => &parent.grandparents,
            };
            let next = weighted_random(edges, rng)
                .ok_or_else(|| MarkovError::WalkIncomplete(format!("'{}' leads nowhere", current)))?
                .word
                .clone();
            if next == stop {
                return Ok(words);
            }
            if words.len() >= self.max_steps {
                return Err(MarkovError::WalkIncomplete(format!(
                    "walk exceeded {} steps",
                    self.max_steps
                )));
            }
            words.push(next.clone());
            current = next;
        }
    }

    fn lookup(&mut self, word: &str) -> Result<Option<&Parent>> {
        if !self.cache.contains_key(word) {
            let mut found = None;
            for parent in ChainDecoder::open(&self.path)? {
                let parent = parent?;
                if parent.word == word {
                    found = Some(parent);
                    break;
                }
            }
            match found {
                Some(parent) => {
                    self.cache.insert(word.to_string(), parent);
                }
                None => return Ok(None),
            }
        }
        Ok(self.cache.get(word))
    }

    /// One pass over the file: counts non-sentinel parents, captures both sentinel
    /// records, and draws an anchor weighted by `weight`.
    fn survey<R, F>(&mut self, rng: &mut R, weight: F) -> Result<Survey>
    where
        R: Rng + ?Sized,
        F: Fn(&Parent) -> u64,
    {
        let mut survey = Survey {
            parents: 0,
            start: None,
            end: None,
            anchor: None,
        };
        let mut reservoir = Reservoir::new();
        for parent in ChainDecoder::open(&self.path)? {
            let parent = parent?;
            if parent.word == self.keys.start {
                survey.start = Some(parent);
            } else if parent.word == self.keys.end {
                survey.end = Some(parent);
            } else {
                survey.parents += 1;
                let w = weight(&parent);
                reservoir.offer(parent, w, rng);
            }
        }
        if survey.parents <= self.min_parents {
            return Err(MarkovError::NotFound(format!(
                "chain has {} words, needs more than {}",
                survey.parents, self.min_parents
            )));
        }
        survey.anchor = reservoir.finish();
        Ok(survey)
    }
}

fn no_match(target: &str) -> MarkovError {
    MarkovError::NoMatch(format!("nothing matches '{}'", target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::codec::ChainEncoder;
    use crate::ingest::extract;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::path::Path;

    fn keys() -> Keys {
        Keys {
            separator: " ".to_string(),
            start: "<s>".to_string(),
            end: "</s>".to_string(),
        }
    }

    fn write_chain(path: &Path, sentences: &[&str]) {
        let mut chain = Chain::new();
        for sentence in sentences {
            let mut seq = vec!["<s>".to_string()];
            seq.extend(sentence.split(' ').map(|w| w.to_string()));
            seq.push("</s>".to_string());
            extract(&mut chain, &seq);
        }
        let mut encoder = ChainEncoder::create(path).unwrap();
        for parent in chain.parents() {
            encoder.add(parent).unwrap();
        }
        encoder.finish_file().unwrap();
    }

    fn generator(dir: &tempfile::TempDir, sentences: &[&str]) -> Generator {
        let path = dir.path().join("chan.json");
        write_chain(&path, sentences);
        Generator::new(path, keys(), 64, 0)
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("TargetedMiddle".parse::<Method>().unwrap(), Method::TargetedMiddle);
        assert_eq!("likely_beginning".parse::<Method>().unwrap(), Method::LikelyBeginning);
        assert_eq!("random-middle".parse::<Method>().unwrap(), Method::RandomMiddle);
        assert!(matches!("sideways".parse::<Method>(), Err(MarkovError::InvalidInput(_))));
        assert_eq!(Method::TargetedEnding.to_string(), "TargetedEnding");
    }

    #[test]
    fn test_single_path_corpus_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = generator(&dir, &["hello there friend"]);
        let mut rng = StdRng::seed_from_u64(7);
        for method in Method::ALL {
            let target = match method {
                Method::TargetedEnding => "friend",
                Method::TargetedMiddle => "there",
                _ => "hello",
            };
            assert_eq!(
                generator.generate(method, target, &mut rng).unwrap(),
                "hello there friend",
                "{}",
                method
            );
        }
    }

    #[test]
    fn test_targeted_middle_exact() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = generator(&dir, &["a b c"]);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            generator.generate(Method::TargetedMiddle, "b", &mut rng).unwrap(),
            "a b c"
        );
    }

    #[test]
    fn test_target_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = generator(&dir, &["a b c"]);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            generator.generate(Method::TargetedMiddle, "", &mut rng),
            Err(MarkovError::InvalidInput(_))
        ));
        assert!(matches!(
            generator.generate(Method::TargetedBeginning, "a b", &mut rng),
            Err(MarkovError::InvalidInput(_))
        ));
        // Untargeted methods ignore the target entirely.
        assert!(generator.generate(Method::RandomMiddle, "", &mut rng).is_ok());
    }

    #[test]
    fn test_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = generator(&dir, &["a b c"]);
        let mut rng = StdRng::seed_from_u64(1);
        for method in [Method::TargetedBeginning, Method::TargetedEnding, Method::TargetedMiddle] {
            assert!(matches!(
                generator.generate(method, "zzz", &mut rng),
                Err(MarkovError::NoMatch(_))
            ));
        }
        // "b" never begins a sentence.
        assert!(matches!(
            generator.generate(Method::TargetedBeginning, "b", &mut rng),
            Err(MarkovError::NoMatch(_))
        ));
    }

    #[test]
    fn test_missing_and_small_chains_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mut missing = Generator::new(dir.path().join("nope.json"), keys(), 64, 0);
        assert!(matches!(
            missing.generate(Method::LikelyBeginning, "", &mut rng),
            Err(MarkovError::NotFound(_))
        ));

        let path = dir.path().join("small.json");
        write_chain(&path, &["a b"]);
        let mut small = Generator::new(path, keys(), 64, 2);
        assert!(matches!(
            small.generate(Method::LikelyBeginning, "", &mut rng),
            Err(MarkovError::NotFound(_))
        ));
    }

    #[test]
    fn test_missing_parent_is_walk_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chan.json");
        std::fs::write(
            &path,
            r#"[{"Word":"<s>","Children":[{"Word":"a","Value":1}],"Grandparents":[]},
{"Word":"a","Children":[{"Word":"ghost","Value":1}],"Grandparents":[{"Word":"<s>","Value":1}]}]"#,
        )
        .unwrap();
        let mut generator = Generator::new(path, keys(), 64, 0);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            generator.generate(Method::LikelyBeginning, "", &mut rng),
            Err(MarkovError::WalkIncomplete(_))
        ));
    }

    #[test]
    fn test_cycle_hits_step_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chan.json");
        std::fs::write(
            &path,
            r#"[{"Word":"<s>","Children":[{"Word":"a","Value":1}],"Grandparents":[]},
{"Word":"a","Children":[{"Word":"a","Value":1}],"Grandparents":[{"Word":"<s>","Value":1}]}]"#,
        )
        .unwrap();
        let mut generator = Generator::new(path, keys(), 8, 0);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            generator.generate(Method::LikelyBeginning, "", &mut rng),
            Err(MarkovError::WalkIncomplete(_))
        ));
    }

    #[test]
    fn test_grouped_tokens_match_on_inner_word() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chan.json");
        let mut chain = Chain::new();
        let seq: Vec<String> = ["<s>", "one two", "three four", "</s>"]
            .iter()
            .map(|w| w.to_string())
            .collect();
        extract(&mut chain, &seq);
        let mut encoder = ChainEncoder::create(&path).unwrap();
        for parent in chain.parents() {
            encoder.add(parent).unwrap();
        }
        encoder.finish_file().unwrap();

        let mut generator = Generator::new(path, keys(), 64, 0);
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(
            generator.generate(Method::TargetedMiddle, "four", &mut rng).unwrap(),
            "one two three four"
        );
    }

    #[test]
    fn test_walks_only_follow_recorded_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = generator(&dir, &["the cat sat", "the dog ran", "a cat ran"]);
        let mut rng = StdRng::seed_from_u64(11);
        let allowed = [
            "the cat sat", "the cat ran", "the dog ran", "a cat sat", "a cat ran",
        ];
        for _ in 0..50 {
            let text = generator.generate(Method::RandomMiddle, "", &mut rng).unwrap();
            assert!(allowed.contains(&text.as_str()), "{}", text);
        }
    }
}
