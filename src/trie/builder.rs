//! Incremental construction of a [`TokenTtlTrie`].

use std::collections::BTreeMap;

use super::automaton::{TokenTtlTrie, DEFAULT_DELIMITERS};
use super::parser::TokenSink;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy)]
struct Terminal {
    /// 1-based registration order; lower wins
    priority: u32,
    ttl_millis: Option<i64>,
}

#[derive(Debug, Default, Clone)]
struct Node {
    children: BTreeMap<u8, u32>,
    terminal: Option<Terminal>,
}

/// Collects tokens and compiles them into an immutable [`TokenTtlTrie`].
///
/// Tokens registered earlier win ties at scan time. In merge mode a
/// re-registered token takes the new TTL but keeps its original priority;
/// otherwise re-registration is an error.
#[derive(Debug, Clone)]
pub struct TokenTtlTrieBuilder {
    nodes: Vec<Node>,
    tokens: Vec<Vec<u8>>,
    delimiters: Vec<u8>,
    merge: bool,
    default_ttl_millis: Option<i64>,
}

impl Default for TokenTtlTrieBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenTtlTrieBuilder {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
            tokens: Vec::new(),
            delimiters: DEFAULT_DELIMITERS.to_vec(),
            merge: false,
            default_ttl_millis: None,
        }
    }

    /// Replaces the token boundary bytes.
    pub fn set_delimiters(&mut self, delimiters: &[u8]) -> &mut Self {
        let mut unique = delimiters.to_vec();
        unique.sort_unstable();
        unique.dedup();
        self.delimiters = unique;
        self
    }

    pub fn set_merge(&mut self, merge: bool) -> &mut Self {
        self.merge = merge;
        self
    }

    /// TTL given to tokens registered without one.
    pub fn set_default_ttl(&mut self, ttl_millis: Option<i64>) -> &mut Self {
        self.default_ttl_millis = ttl_millis;
        self
    }

    pub fn is_merge(&self) -> bool {
        self.merge
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Registers `token`. The first registration fixes the token's priority.
    pub fn add_token(&mut self, token: &[u8], ttl_millis: Option<i64>) -> Result<&mut Self, ConfigError> {
        if token.is_empty() {
            return Err(ConfigError::EmptyToken);
        }

        let mut state = 0usize;
        for &b in token {
            let next = self.nodes.len() as u32;
            let child = *self.nodes[state].children.entry(b).or_insert(next);
            if child == next {
                self.nodes.push(Node::default());
            }
            state = child as usize;
        }

        match self.nodes[state].terminal.as_mut() {
            Some(existing) if self.merge => {
                if ttl_millis.is_some() {
                    existing.ttl_millis = ttl_millis;
                }
            }
            Some(_) => {
                return Err(ConfigError::DuplicateToken {
                    token: String::from_utf8_lossy(token).into_owned(),
                })
            }
            None => {
                self.tokens.push(token.to_vec());
                self.nodes[state].terminal = Some(Terminal {
                    priority: self.tokens.len() as u32,
                    ttl_millis,
                });
            }
        }

        Ok(self)
    }

    /// Compiles the registered tokens.
    ///
    /// Only bytes that occur in some token get a character class; the
    /// transition table is `states x classes` regardless of input alphabet.
    pub fn build(&self) -> Result<TokenTtlTrie, ConfigError> {
        for token in &self.tokens {
            if let Some(&d) = token.iter().find(|b| self.delimiters.contains(b)) {
                return Err(ConfigError::DelimiterCollision {
                    delimiter: d as char,
                    token: String::from_utf8_lossy(token).into_owned(),
                });
            }
        }

        let mut used = [false; 256];
        for node in &self.nodes {
            for &b in node.children.keys() {
                used[b as usize] = true;
            }
        }

        let mut classes = [TokenTtlTrie::UNRECOGNIZED; 256];
        let mut class_count = 0usize;
        for (b, class) in classes.iter_mut().enumerate() {
            if used[b] {
                *class = class_count as u16;
                class_count += 1;
            }
        }
        for &d in &self.delimiters {
            classes[d as usize] = TokenTtlTrie::DELIMITER;
        }

        let state_count = self.nodes.len();
        let mut transitions = vec![TokenTtlTrie::REJECT; state_count * class_count];
        let mut priorities = vec![0u32; state_count];
        let mut ttls = vec![0i64; state_count];

        for (state, node) in self.nodes.iter().enumerate() {
            for (&b, &child) in &node.children {
                transitions[state * class_count + classes[b as usize] as usize] = child;
            }
            if let Some(terminal) = node.terminal {
                priorities[state] = terminal.priority;
                ttls[state] = match terminal.ttl_millis.or(self.default_ttl_millis) {
                    Some(ttl) => ttl,
                    None => {
                        let token = &self.tokens[terminal.priority as usize - 1];
                        return Err(ConfigError::MissingTtl {
                            context: format!("token \"{}\"", String::from_utf8_lossy(token)),
                        });
                    }
                };
            }
        }

        let tokens = self
            .tokens
            .iter()
            .map(|token| {
                let ttl = self.lookup(token).unwrap_or(0);
                (token.clone(), ttl)
            })
            .collect::<Vec<_>>();

        Ok(TokenTtlTrie::from_parts(
            classes,
            class_count,
            transitions,
            priorities,
            ttls,
            self.delimiters.clone(),
            tokens,
        ))
    }

    /// Resolved TTL of an exact token.
    fn lookup(&self, token: &[u8]) -> Option<i64> {
        let mut state = 0usize;
        for b in token {
            state = *self.nodes[state].children.get(b)? as usize;
        }
        let terminal = self.nodes[state].terminal?;
        terminal.ttl_millis.or(self.default_ttl_millis)
    }
}

impl TokenSink for TokenTtlTrieBuilder {
    fn add_token(&mut self, token: &[u8], ttl_millis: Option<i64>) -> Result<&mut Self, ConfigError> {
        TokenTtlTrieBuilder::add_token(self, token, ttl_millis)
    }
}
