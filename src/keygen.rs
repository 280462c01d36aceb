//! Short key generation
//!
//! Keys are drawn symbol by symbol from a configurable alphabet using the
//! thread-local CSPRNG. Each index is sampled with `random_range`, which
//! rejects out-of-zone draws, so every symbol is equally likely whatever the
//! alphabet size.

use rand::{CryptoRng, Rng};

use crate::config::validate_alphabet;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct KeyGenerator {
    symbols: Vec<char>,
    length: usize,
}

impl KeyGenerator {
    pub fn new(alphabet: &str, length: usize) -> Result<Self> {
        validate_alphabet(alphabet).map_err(|reason| Error::invalid(format!("Alphabet {reason}.")))?;
        if length == 0 {
            return Err(Error::invalid("Key length must be positive."));
        }
        Ok(Self {
            symbols: alphabet.chars().collect(),
            length,
        })
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Returns true when every symbol of `key` belongs to the alphabet.
    pub fn accepts(&self, key: &str) -> bool {
        !key.is_empty() && key.chars().all(|c| self.symbols.contains(&c))
    }

    /// Generates a key of the configured length.
    pub fn generate(&self) -> String {
        self.generate_with(&mut rand::rng())
    }

    /// Generates a key using the given cryptographic RNG.
    pub fn generate_with<R: Rng + CryptoRng>(&self, rng: &mut R) -> String {
        (0..self.length)
            .map(|_| self.symbols[rng.random_range(0..self.symbols.len())])
            .collect()
    }
}

/// Draws `length` symbols uniformly from `alphabet`.
pub fn generate(length: usize, alphabet: &str) -> Result<String> {
    Ok(KeyGenerator::new(alphabet, length)?.generate())
}
