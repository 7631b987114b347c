use crate::engine::Engine;
use crate::error::MarkovError;
use crate::generator::Instructions;
use rand::Rng;
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum ResponseError {
    /// The request itself was malformed; retrying cannot help.
    Invalid(MarkovError),
    /// The budget ran out on terminal errors or rejected outputs. Callers stay quiet.
    GaveUp { attempts: usize },
    /// The budget ran out on errors worth an operator's attention.
    Exhausted { attempts: usize, last: MarkovError },
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseError::Invalid(e) => write!(f, "invalid request: {}", e),
            ResponseError::GaveUp { attempts } => write!(f, "gave up after {} attempts", attempts),
            ResponseError::Exhausted { attempts, last } => {
                write!(f, "failed after {} attempts: {}", attempts, last)
            }
        }
    }
}

impl std::error::Error for ResponseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResponseError::Invalid(e) => Some(e),
            ResponseError::Exhausted { last, .. } => Some(last),
            ResponseError::GaveUp { .. } => None,
        }
    }
}

/// Bounded retry around `Engine::generate` for callers that answer chat messages.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    /// Outputs with this many words or fewer are usually rejected.
    pub short_words: usize,
    pub short_pass_chance: f64,
    /// Outputs mentioning this name are always rejected.
    pub own_name: Option<String>,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            short_words: 2,
            short_pass_chance: 0.05,
            own_name: None,
        }
    }

    /// Two attempts per chain that can be generated from, never fewer than two.
    pub fn for_engine(engine: &Engine) -> Self {
        let chains = engine
            .known_chains()
            .iter()
            .filter(|name| engine.chain_exists(name))
            .count();
        Self::new((chains * 2).max(2))
    }

    pub fn with_own_name(mut self, name: impl Into<String>) -> Self {
        self.own_name = Some(name.into());
        self
    }

    pub fn accepts<R: Rng + ?Sized>(&self, text: &str, separator: &str, rng: &mut R) -> bool {
        if let Some(name) = &self.own_name {
            if text.to_lowercase().contains(&name.to_lowercase()) {
                return false;
            }
        }
        let words = text.split(separator).filter(|w| !w.is_empty()).count();
        if words <= self.short_words {
            return rng.gen_bool(self.short_pass_chance.clamp(0.0, 1.0));
        }
        true
    }

    /// Ask the engine for text until an output is accepted or the budget runs out.
    /// `instructions` receives the attempt number, so callers can vary chain or method.
    pub fn respond<R, F>(&self, engine: &Engine, mut instructions: F, rng: &mut R) -> Result<String, ResponseError>
    where
        R: Rng + ?Sized,
        F: FnMut(usize) -> Instructions,
    {
        let separator = engine.config().separator.clone();
        let mut last = None;
        for attempt in 0..self.max_attempts {
            let request = instructions(attempt);
            match engine.generate_with(&request, rng) {
                Ok(text) => {
                    if self.accepts(&text, &separator, rng) {
                        return Ok(text);
                    }
                    debug!(attempt, chain = %request.chain, "rejected generated text");
                }
                Err(e @ MarkovError::InvalidInput(_)) => return Err(ResponseError::Invalid(e)),
                Err(e) => {
                    debug!(attempt, chain = %request.chain, error = %e, "generation failed");
                    last = Some(e);
                }
            }
        }

        match last {
            Some(e) if !e.is_terminal() => {
                warn!(attempts = self.max_attempts, error = %e, "generation kept failing");
                Err(ResponseError::Exhausted {
                    attempts: self.max_attempts,
                    last: e,
                })
            }
            _ => Err(ResponseError::GaveUp {
                attempts: self.max_attempts,
            }),
        }
    }
}
