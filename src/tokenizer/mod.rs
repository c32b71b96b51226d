//! Tokenizers
//!
//! The inference engine only needs the [`Tokenizer`] trait. [`WordTokenizer`]
//! is a whitespace word-level implementation with a line-per-token
//! vocabulary file, enough to drive generation end to end.
//!
//! Ids 0-3 are reserved for the special tokens below in every vocabulary.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{HyperionError, HyperionResult};

/// Unknown token id
pub const UNKNOWN: u32 = 0;
/// Beginning-of-sequence token id
pub const BOS: u32 = 1;
/// End-of-sequence token id
pub const EOS: u32 = 2;
/// Padding token id
pub const PAD: u32 = 3;

/// Largest vocabulary a [`WordTokenizer`] will hold
pub const MAX_VOCAB_SIZE: usize = 65536;

/// Longest token in bytes
pub const MAX_TOKEN_LENGTH: usize = 256;

const SPECIAL_TOKENS: [&str; 4] = ["<unk>", "<s>", "</s>", "<pad>"];

/// Text to token id mapping used by the engine
pub trait Tokenizer {
    /// Split text into token ids
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Render token ids as text
    fn decode(&self, tokens: &[u32]) -> String;

    /// Number of ids; the output layer must produce this many logits
    fn vocab_size(&self) -> usize;
}

/// Whitespace-splitting word tokenizer
#[derive(Debug, Clone)]
pub struct WordTokenizer {
    tokens: Vec<String>,
    ids: HashMap<String, u32>,
    case_sensitive: bool,
}

impl Default for WordTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl WordTokenizer {
    /// Tokenizer holding only the special tokens
    #[must_use]
    pub fn new() -> Self {
        let tokens: Vec<String> = SPECIAL_TOKENS.iter().map(|s| (*s).to_string()).collect();
        let ids = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();
        Self {
            tokens,
            ids,
            case_sensitive: true,
        }
    }

    /// Lowercase words before lookup when `false`
    #[must_use]
    pub fn with_case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    /// Parse a vocabulary, one token per line
    ///
    /// Blank lines are skipped and duplicates keep their first id. Special
    /// tokens listed in the file keep their reserved ids.
    ///
    /// # Errors
    ///
    /// Tokenizer error for an over-long token or an oversized vocabulary.
    pub fn from_vocab_str(vocab: &str) -> HyperionResult<Self> {
        let mut tokenizer = Self::new();
        for line in vocab.lines() {
            let token = line.trim_end_matches('\r');
            if !token.trim().is_empty() {
                tokenizer.add_token(token)?;
            }
        }
        Ok(tokenizer)
    }

    /// Load a vocabulary file, one token per line
    ///
    /// # Errors
    ///
    /// I/O errors, or see [`from_vocab_str`](Self::from_vocab_str).
    pub fn from_vocab_file<P: AsRef<Path>>(path: P) -> HyperionResult<Self> {
        let text = fs::read_to_string(path)?;
        let tokenizer = Self::from_vocab_str(&text)?;
        trace_event!(vocab = tokenizer.tokens.len(), "vocabulary loaded");
        Ok(tokenizer)
    }

    /// Build a vocabulary from the most frequent words of `corpus`
    ///
    /// Ties are broken alphabetically. `max_vocab` includes the special
    /// tokens.
    ///
    /// # Errors
    ///
    /// See [`add_token`](Self::add_token).
    pub fn from_corpus(corpus: &str, max_vocab: usize) -> HyperionResult<Self> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for word in corpus.split_whitespace() {
            *counts.entry(word).or_default() += 1;
        }
        let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let mut tokenizer = Self::new();
        for (word, _) in ranked {
            if tokenizer.tokens.len() >= max_vocab.min(MAX_VOCAB_SIZE) {
                break;
            }
            tokenizer.add_token(word)?;
        }
        Ok(tokenizer)
    }

    /// Write the vocabulary, one token per line, in id order
    ///
    /// # Errors
    ///
    /// I/O errors from writing the file.
    pub fn save_vocab<P: AsRef<Path>>(&self, path: P) -> HyperionResult<()> {
        let mut text = self.tokens.join("\n");
        text.push('\n');
        fs::write(path, text)?;
        Ok(())
    }

    /// Add a token, returning its id (existing id for a duplicate)
    ///
    /// # Errors
    ///
    /// Tokenizer error for an empty or over-long token, or a full vocabulary.
    pub fn add_token(&mut self, token: &str) -> HyperionResult<u32> {
        if token.is_empty() || token.len() > MAX_TOKEN_LENGTH {
            return Err(HyperionError::Tokenizer(format!(
                "token length {} outside 1..={MAX_TOKEN_LENGTH}",
                token.len()
            )));
        }
        let key = self.normalize(token);
        if let Some(&id) = self.ids.get(&key) {
            return Ok(id);
        }
        if self.tokens.len() >= MAX_VOCAB_SIZE {
            return Err(HyperionError::Tokenizer(format!(
                "vocabulary full at {MAX_VOCAB_SIZE} tokens"
            )));
        }
        let id = self.tokens.len() as u32;
        self.ids.insert(key.clone(), id);
        self.tokens.push(key);
        Ok(id)
    }

    /// Id of `token`, if present
    #[must_use]
    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.ids.get(&self.normalize(token)).copied()
    }

    /// Text of token `id`, if present
    #[must_use]
    pub fn token_str(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    fn normalize(&self, token: &str) -> String {
        if self.case_sensitive || SPECIAL_TOKENS.contains(&token) {
            token.to_string()
        } else {
            token.to_lowercase()
        }
    }
}

impl Tokenizer for WordTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.split_whitespace()
            .map(|w| self.token_id(w).unwrap_or(UNKNOWN))
            .collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        tokens
            .iter()
            .filter(|&&t| !matches!(t, BOS | EOS | PAD))
            .map(|&t| self.token_str(t).unwrap_or(SPECIAL_TOKENS[UNKNOWN as usize]))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn vocab_size(&self) -> usize {
        self.tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specials_reserved() {
        let tok = WordTokenizer::new();
        assert_eq!(tok.vocab_size(), 4);
        assert_eq!(tok.token_id("<s>"), Some(BOS));
        assert_eq!(tok.token_id("</s>"), Some(EOS));
    }

    #[test]
    fn test_vocab_str_and_encode() {
        let tok = WordTokenizer::from_vocab_str("the\ncat\n\nsat\ncat\n").expect("vocab");
        assert_eq!(tok.vocab_size(), 7);
        assert_eq!(tok.encode("the cat  sat on"), vec![4, 5, 6, UNKNOWN]);
    }

    #[test]
    fn test_decode_skips_control_tokens() {
        let tok = WordTokenizer::from_vocab_str("hello\nworld").expect("vocab");
        assert_eq!(tok.decode(&[BOS, 4, 5, EOS, PAD]), "hello world");
        assert_eq!(tok.decode(&[4, 999]), "hello <unk>");
    }

    #[test]
    fn test_specials_in_file_keep_ids() {
        let tok = WordTokenizer::from_vocab_str("<unk>\n<s>\n</s>\n<pad>\nword").expect("vocab");
        assert_eq!(tok.token_id("word"), Some(4));
    }

    #[test]
    fn test_case_insensitive() {
        let mut tok = WordTokenizer::new().with_case_sensitive(false);
        tok.add_token("Hello").expect("add");
        assert_eq!(tok.encode("HELLO hello"), vec![4, 4]);
    }

    #[test]
    fn test_token_too_long() {
        let mut tok = WordTokenizer::new();
        assert!(matches!(
            tok.add_token(&"x".repeat(MAX_TOKEN_LENGTH + 1)),
            Err(HyperionError::Tokenizer(_))
        ));
    }

    #[test]
    fn test_from_corpus_ranks_by_frequency() {
        let tok = WordTokenizer::from_corpus("b a b c b a", 6).expect("corpus");
        assert_eq!(tok.token_id("b"), Some(4));
        assert_eq!(tok.token_id("a"), Some(5));
        assert_eq!(tok.token_id("c"), None);
    }

    #[test]
    fn test_vocab_file_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vocab.txt");
        let tok = WordTokenizer::from_vocab_str("alpha\nbeta").expect("vocab");
        tok.save_vocab(&path).expect("save");
        let back = WordTokenizer::from_vocab_file(&path).expect("load");
        assert_eq!(back.vocab_size(), 6);
        assert_eq!(back.token_id("beta"), Some(5));
    }
}
