//! Token-to-TTL automaton.
//!
//! Two stages:
//! 1. **Parse** (`TokenSpecParser`): token spec text → `(token, ttl)` pairs
//! 2. **Compile** (`TokenTtlTrieBuilder`): pairs + delimiters → `TokenTtlTrie`
//!
//! The compiled trie is immutable and scanned concurrently without locks.

pub mod automaton;
pub mod builder;
pub mod parser;

pub use automaton::{TokenTtlTrie, DEFAULT_DELIMITERS};
pub use builder::TokenTtlTrieBuilder;
pub use parser::{format_spec, parse_entries, TokenSink, TokenSpecEntry, TokenSpecParser};
