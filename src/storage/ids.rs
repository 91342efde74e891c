//! Short random identifiers for `add`

use crate::core::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default identifier alphabet (URL and key safe)
pub const DEFAULT_ALPHABET: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Default identifier length; 62^10 possibilities
pub const DEFAULT_LENGTH: usize = 10;

/// Identifier generation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdConfig {
    /// Characters identifiers are drawn from
    pub alphabet: String,
    /// Identifier length
    pub length: usize,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            alphabet: DEFAULT_ALPHABET.to_string(),
            length: DEFAULT_LENGTH,
        }
    }
}

impl IdConfig {
    /// Validate alphabet and length
    pub fn validate(&self) -> Result<()> {
        if self.length == 0 {
            return Err(Error::config("ids.length must be at least 1"));
        }
        let mut chars: Vec<char> = self.alphabet.chars().collect();
        chars.sort_unstable();
        chars.dedup();
        if chars.len() < 2 {
            return Err(Error::config("ids.alphabet needs at least two distinct characters"));
        }
        Ok(())
    }
}

/// Random identifier generator
#[derive(Debug, Clone)]
pub struct IdGenerator {
    alphabet: Vec<char>,
    length: usize,
}

impl IdGenerator {
    /// Create a generator from validated settings
    pub fn new(config: &IdConfig) -> Result<Self> {
        config.validate()?;
        let mut alphabet: Vec<char> = Vec::new();
        for c in config.alphabet.chars() {
            if !alphabet.contains(&c) {
                alphabet.push(c);
            }
        }
        Ok(Self {
            alphabet,
            length: config.length,
        })
    }

    /// Draw a fresh identifier
    pub fn generate(&self) -> String {
        let mut rng = rand::rng();
        (0..self.length)
            .map(|_| self.alphabet[rng.random_range(0..self.alphabet.len())])
            .collect()
    }

    /// Identifier length
    pub fn length(&self) -> usize {
        self.length
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self {
            alphabet: DEFAULT_ALPHABET.chars().collect(),
            length: DEFAULT_LENGTH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_uses_only_alphabet() {
        let ids = IdGenerator::new(&IdConfig {
            alphabet: "ab".into(),
            length: 16,
        })
        .unwrap();
        let id = ids.generate();
        assert_eq!(id.chars().count(), 16);
        assert!(id.chars().all(|c| c == 'a' || c == 'b'));
    }

    #[test]
    fn test_default_ids_do_not_collide() {
        let ids = IdGenerator::default();
        let drawn: HashSet<String> = (0..10_000).map(|_| ids.generate()).collect();
        assert_eq!(drawn.len(), 10_000);
    }

    #[test]
    fn test_rejects_degenerate_config() {
        assert!(IdGenerator::new(&IdConfig { alphabet: "aaaa".into(), length: 4 }).is_err());
        assert!(IdGenerator::new(&IdConfig { alphabet: "ab".into(), length: 0 }).is_err());
    }
}
