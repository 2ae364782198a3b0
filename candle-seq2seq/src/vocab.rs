//! Target vocabulary lookup.
use std::collections::HashMap;
use std::path::Path;

use candle::Result;

/// Read-only id <-> token mapping of the target namespace.
pub trait Vocabulary: std::fmt::Debug {
    fn size(&self) -> usize;

    fn token(&self, index: u32) -> Option<&str>;

    fn index(&self, token: &str) -> Option<u32>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetVocabulary {
    tokens: Vec<String>,
    indices: HashMap<String, u32>,
}

impl TargetVocabulary {
    pub fn new<S: Into<String>>(tokens: impl IntoIterator<Item = S>) -> Result<Self> {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        let mut indices = HashMap::with_capacity(tokens.len());
        for (index, token) in tokens.iter().enumerate() {
            if indices.insert(token.clone(), index as u32).is_some() {
                candle::bail!("duplicate token {token:?} in target vocabulary")
            }
        }
        Ok(Self { tokens, indices })
    }

    /// Loads a vocabulary with one token per line, the line number being the id.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::new(content.lines())
    }

    /// Loads a vocabulary stored as a json list of tokens.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let tokens: Vec<String> = serde_json::from_slice(data).map_err(candle::Error::wrap)?;
        Self::new(tokens)
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }
}

impl Vocabulary for TargetVocabulary {
    fn size(&self) -> usize {
        self.tokens.len()
    }

    fn token(&self, index: u32) -> Option<&str> {
        self.tokens.get(index as usize).map(String::as_str)
    }

    fn index(&self, token: &str) -> Option<u32> {
        self.indices.get(token).copied()
    }
}
