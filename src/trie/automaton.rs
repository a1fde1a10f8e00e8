//! Compiled, immutable token automaton.

use std::fmt;

use super::builder::TokenTtlTrieBuilder;

/// Token boundary bytes used when none are configured.
pub const DEFAULT_DELIMITERS: &[u8] = b"|&()";

/// Byte-scanning automaton mapping delimiter-bounded tokens to TTLs.
///
/// Layout:
/// - `classes[byte]` → character class, `DELIMITER` or `UNRECOGNIZED`
/// - `transitions[state * class_count + class]` → next state or `REJECT`
/// - `priorities[state]` → registration order of the token ending here, 0 if none
/// - `ttls[state]` → TTL in milliseconds of that token
///
/// Holds no mutable state; one instance serves any number of concurrent scans.
#[derive(Clone)]
pub struct TokenTtlTrie {
    classes: [u16; 256],
    class_count: usize,
    transitions: Box<[u32]>,
    priorities: Box<[u32]>,
    ttls: Box<[i64]>,
    delimiters: Vec<u8>,
    tokens: Vec<(Vec<u8>, i64)>,
}

const ROOT: u32 = 0;

impl TokenTtlTrie {
    pub(crate) const DELIMITER: u16 = u16::MAX - 1;
    pub(crate) const UNRECOGNIZED: u16 = u16::MAX;
    pub(crate) const REJECT: u32 = u32::MAX;

    pub fn builder() -> TokenTtlTrieBuilder {
        TokenTtlTrieBuilder::new()
    }

    pub(crate) fn from_parts(
        classes: [u16; 256],
        class_count: usize,
        transitions: Vec<u32>,
        priorities: Vec<u32>,
        ttls: Vec<i64>,
        delimiters: Vec<u8>,
        tokens: Vec<(Vec<u8>, i64)>,
    ) -> Self {
        Self {
            classes,
            class_count,
            transitions: transitions.into_boxed_slice(),
            priorities: priorities.into_boxed_slice(),
            ttls: ttls.into_boxed_slice(),
            delimiters,
            tokens,
        }
    }

    /// Scans `input` once and returns the TTL of the earliest-registered
    /// token that occurs as a whole delimiter-bounded segment, or `None`.
    ///
    /// A segment containing any byte that appears in no token can never
    /// match; the scan skips to the next delimiter.
    pub fn scan(&self, input: &[u8]) -> Option<i64> {
        let mut state = ROOT;
        let mut best = 0u32;
        let mut best_state = ROOT;

        for &b in input {
            match self.classes[b as usize] {
                Self::DELIMITER => {
                    self.consider(state, &mut best, &mut best_state);
                    if best == 1 {
                        break;
                    }
                    state = ROOT;
                }
                Self::UNRECOGNIZED => state = Self::REJECT,
                class => {
                    if state != Self::REJECT {
                        state = self.transitions[state as usize * self.class_count + class as usize];
                    }
                }
            }
        }
        if best != 1 {
            self.consider(state, &mut best, &mut best_state);
        }

        (best != 0).then(|| self.ttls[best_state as usize])
    }

    #[inline]
    fn consider(&self, state: u32, best: &mut u32, best_state: &mut u32) {
        if state == Self::REJECT {
            return;
        }
        let priority = self.priorities[state as usize];
        if priority != 0 && (*best == 0 || priority < *best) {
            *best = priority;
            *best_state = state;
        }
    }

    /// True when `token` was registered.
    pub fn contains(&self, token: &[u8]) -> bool {
        self.tokens.iter().any(|(t, _)| t == token)
    }

    /// Registered tokens with their resolved TTLs, in priority order.
    pub fn tokens(&self) -> &[(Vec<u8>, i64)] {
        &self.tokens
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn state_count(&self) -> usize {
        self.priorities.len()
    }

    pub fn class_count(&self) -> usize {
        self.class_count
    }

    pub fn delimiters(&self) -> &[u8] {
        &self.delimiters
    }
}

impl fmt::Debug for TokenTtlTrie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenTtlTrie")
            .field("tokens", &self.tokens.len())
            .field("states", &self.state_count())
            .field("classes", &self.class_count)
            .field("delimiters", &String::from_utf8_lossy(&self.delimiters))
            .finish()
    }
}

impl fmt::Display for TokenTtlTrie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (idx, (token, ttl)) in self.tokens.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:?}:{}ms", String::from_utf8_lossy(token), ttl)?;
        }
        f.write_str("}")
    }
}
