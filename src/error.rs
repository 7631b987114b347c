use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum MarkovError {
    NotFound(String),
    InvalidInput(String),
    Busy(String),
    WalkIncomplete(String),
    NoMatch(String),
    SizeShrink { path: PathBuf, old: u64, new: u64 },
    Corrupt(String),
    Io(std::io::Error),
    Json(serde_json::Error),
    Zip(zip::result::ZipError),
    Other(String),
}

pub type Result<T> = std::result::Result<T, MarkovError>;

impl MarkovError {
    /// Errors a caller should not keep retrying against the same chain.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MarkovError::NotFound(_) | MarkovError::NoMatch(_))
    }
}

impl fmt::Display for MarkovError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkovError::NotFound(e) => write!(f, "Not found: {}", e),
            MarkovError::InvalidInput(e) => write!(f, "Invalid input: {}", e),
            MarkovError::Busy(e) => write!(f, "Busy: {}", e),
            MarkovError::WalkIncomplete(e) => write!(f, "Walk incomplete: {}", e),
            MarkovError::NoMatch(e) => write!(f, "No match: {}", e),
            MarkovError::SizeShrink { path, old, new } => write!(
                f,
                "Merged file is smaller than before: {} ({} -> {} bytes)",
                path.display(),
                old,
                new
            ),
            MarkovError::Corrupt(e) => write!(f, "Corrupt chain document: {}", e),
            MarkovError::Io(e) => write!(f, "IO error: {}", e),
            MarkovError::Json(e) => write!(f, "JSON error: {}", e),
            MarkovError::Zip(e) => write!(f, "Zip error: {}", e),
            MarkovError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for MarkovError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MarkovError::Io(e) => Some(e),
            MarkovError::Json(e) => Some(e),
            MarkovError::Zip(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MarkovError {
    fn from(err: std::io::Error) -> Self {
        MarkovError::Io(err)
    }
}

impl From<serde_json::Error> for MarkovError {
    fn from(err: serde_json::Error) -> Self {
        MarkovError::Json(err)
    }
}

impl From<zip::result::ZipError> for MarkovError {
    fn from(err: zip::result::ZipError) -> Self {
        MarkovError::Zip(err)
    }
}

impl From<String> for MarkovError {
    fn from(err: String) -> Self {
        MarkovError::Other(err)
    }
}

impl From<&str> for MarkovError {
    fn from(err: &str) -> Self {
        MarkovError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(MarkovError::NotFound("chan".into()).is_terminal());
        assert!(MarkovError::NoMatch("x".into()).is_terminal());
        assert!(!MarkovError::Busy("chan".into()).is_terminal());
        assert!(!MarkovError::WalkIncomplete("a".into()).is_terminal());
        assert!(!MarkovError::InvalidInput("".into()).is_terminal());
    }

    #[test]
    fn test_display_includes_context() {
        let err = MarkovError::SizeShrink {
            path: PathBuf::from("/tmp/chan.json"),
            old: 100,
            new: 40,
        };
        let text = err.to_string();
        assert!(text.contains("chan.json"));
        assert!(text.contains("100 -> 40"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: MarkovError = io.into();
        assert!(matches!(err, MarkovError::Io(_)));
    }
}
