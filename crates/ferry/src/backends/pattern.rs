//! 🌟 Which keys does `file_pattern` select?
//!
//! A key is in when any of these hold:
//! 1. its file name (last `/` segment) matches the pattern,
//! 2. the whole key matches `<prefix><pattern>`,
//! 3. the whole key matches the pattern as written.
//!
//! Keys ending in `/` are directory markers and never match.

use glob::Pattern;

use crate::errors::PipelineError;

#[derive(Debug, Clone)]
pub(crate) struct KeyPattern {
    bare: Pattern,
    prefixed: Option<Pattern>,
}

impl KeyPattern {
    pub(crate) fn new(raw: &str, prefix: &str) -> Result<Self, PipelineError> {
        let raw = if raw.trim().is_empty() { "*" } else { raw.trim() };
        let invalid = |e: glob::PatternError| {
            PipelineError::ConfigInvalid(format!("file_pattern '{raw}': {e}"))
        };
        let bare = Pattern::new(raw).map_err(invalid)?;
        let prefixed = if prefix.is_empty() {
            None
        } else {
            Some(Pattern::new(&format!("{}{raw}", Pattern::escape(prefix))).map_err(invalid)?)
        };
        Ok(Self { bare, prefixed })
    }

    pub(crate) fn matches(&self, key: &str) -> bool {
        if key.is_empty() || key.ends_with('/') {
            return false;
        }
        let file_name = key.rsplit('/').next().unwrap_or(key);
        self.bare.matches(file_name)
            || self.prefixed.as_ref().is_some_and(|p| p.matches(key))
            || self.bare.matches(key)
    }
}
