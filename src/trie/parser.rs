//! Token specification parser.
//!
//! Grammar:
//! ```text
//! spec      := (SEPARATOR | tokenspec)*
//! tokenspec := token ((':' | '=') ttl)?
//! token     := STRING | WORD
//! ttl       := NUMBER UNIT
//! ```
//! e.g. `"tokenA":30s, "tokenB"=60s, tokenC`.
//!
//! Lexing is a greedy longest match over a fixed, ordered list of lexeme
//! types; ties go to the type listed first. Input that no lexeme matches is a
//! hard error carrying the byte offset.

use crate::error::ConfigError;
use crate::units::TtlUnit;

/// Receives parsed tokens. `ttl_millis` is `None` when the spec gave no TTL
/// and the token inherits the rule's TTL.
pub trait TokenSink {
    fn add_token(&mut self, token: &[u8], ttl_millis: Option<i64>) -> Result<&mut Self, ConfigError>;
}

/// A single parsed token and its optional TTL in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenSpecEntry {
    pub token: Vec<u8>,
    pub ttl_millis: Option<i64>,
}

impl TokenSink for Vec<TokenSpecEntry> {
    fn add_token(&mut self, token: &[u8], ttl_millis: Option<i64>) -> Result<&mut Self, ConfigError> {
        self.push(TokenSpecEntry {
            token: token.to_vec(),
            ttl_millis,
        });
        Ok(self)
    }
}

// ================================================================================================
// LEXER
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lexeme {
    Separator,
    StringLiteral,
    Number,
    Unit,
    Word,
    Equals,
    Colon,
}

const LEXEME_ORDER: [Lexeme; 7] = [
    Lexeme::Separator,
    Lexeme::StringLiteral,
    Lexeme::Number,
    Lexeme::Unit,
    Lexeme::Word,
    Lexeme::Equals,
    Lexeme::Colon,
];

impl Lexeme {
    /// Length of the match at the start of `input`, 0 when there is none.
    fn match_len(self, input: &[u8]) -> usize {
        match self {
            Lexeme::Separator => input
                .iter()
                .take_while(|b| b.is_ascii_whitespace() || **b == b',')
                .count(),
            Lexeme::StringLiteral => string_literal_len(input),
            Lexeme::Number => input.iter().take_while(|b| b.is_ascii_digit()).count(),
            Lexeme::Unit => TtlUnit::ALL
                .iter()
                .map(|unit| unit.as_str().as_bytes())
                .filter(|kw| input.starts_with(kw))
                .map(<[u8]>::len)
                .max()
                .unwrap_or(0),
            Lexeme::Word => match input.first() {
                Some(b) if b.is_ascii_alphabetic() || *b == b'_' => {
                    1 + input[1..].iter().take_while(|b| is_word_byte(**b)).count()
                }
                _ => 0,
            },
            Lexeme::Equals => usize::from(input.first() == Some(&b'=')),
            Lexeme::Colon => usize::from(input.first() == Some(&b':')),
        }
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.')
}

fn string_literal_len(input: &[u8]) -> usize {
    if input.first() != Some(&b'"') {
        return 0;
    }
    let mut i = 1;
    while i < input.len() {
        match input[i] {
            b'\\' => i += 2,
            b'"' => return i + 1,
            _ => i += 1,
        }
    }
    0
}

#[derive(Debug, Clone, Copy)]
struct Lexed<'a> {
    kind: Lexeme,
    text: &'a str,
    offset: usize,
}

fn tokenize(input: &str) -> Result<Vec<Lexed<'_>>, ConfigError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let rest = &bytes[pos..];
        let mut best: Option<(Lexeme, usize)> = None;
        for kind in LEXEME_ORDER {
            let len = kind.match_len(rest);
            if len > best.map_or(0, |(_, l)| l) {
                best = Some((kind, len));
            }
        }

        let (kind, len) = match best {
            Some(found) => found,
            None if rest[0] == b'"' => {
                return Err(ConfigError::invalid_spec("unterminated string literal", input, pos))
            }
            None => return Err(ConfigError::invalid_spec("unrecognized input", input, pos)),
        };

        // every lexeme ends on an ASCII byte, so the slice is on a char boundary
        tokens.push(Lexed {
            kind,
            text: &input[pos..pos + len],
            offset: pos,
        });
        pos += len;
    }

    Ok(tokens)
}

// ================================================================================================
// PARSER
// ================================================================================================

/// Parses token spec text into a [`TokenSink`].
///
/// Calls chain, so several spec fragments can feed one sink:
/// ```
/// use ageoff::trie::{TokenSpecParser, TokenSpecEntry};
///
/// let mut entries: Vec<TokenSpecEntry> = Vec::new();
/// TokenSpecParser::new(&mut entries)
///     .parse("\"tokenA\":30s")?
///     .parse("tokenB=1m, tokenC")?;
/// assert_eq!(entries.len(), 3);
/// # Ok::<(), ageoff::ConfigError>(())
/// ```
pub struct TokenSpecParser<'s, S: TokenSink> {
    sink: &'s mut S,
}

impl<'s, S: TokenSink> TokenSpecParser<'s, S> {
    pub fn new(sink: &'s mut S) -> Self {
        Self { sink }
    }

    pub fn parse(&mut self, text: &str) -> Result<&mut Self, ConfigError> {
        let lexed = tokenize(text)?;
        let mut cursor = Cursor {
            input: text,
            tokens: lexed
                .into_iter()
                .filter(|t| t.kind != Lexeme::Separator)
                .collect(),
            pos: 0,
        };

        while let Some(token) = cursor.next() {
            let bytes = match token.kind {
                Lexeme::StringLiteral => decode_literal(text, token)?,
                Lexeme::Word | Lexeme::Unit => token.text.as_bytes().to_vec(),
                _ => {
                    return Err(ConfigError::invalid_spec(
                        "expected a quoted string or word",
                        text,
                        token.offset,
                    ))
                }
            };

            let ttl_millis = match cursor.peek().map(|t| t.kind) {
                Some(Lexeme::Colon) | Some(Lexeme::Equals) => {
                    cursor.next();
                    Some(cursor.ttl()?)
                }
                _ => None,
            };

            self.sink.add_token(&bytes, ttl_millis)?;
        }

        Ok(self)
    }
}

struct Cursor<'a> {
    input: &'a str,
    tokens: Vec<Lexed<'a>>,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<Lexed<'a>> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Lexed<'a>> {
        let token = self.peek();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn end_offset(&self) -> usize {
        self.input.len()
    }

    fn ttl(&mut self) -> Result<i64, ConfigError> {
        let number = match self.next() {
            Some(t) if t.kind == Lexeme::Number => t,
            Some(t) => return Err(ConfigError::invalid_spec("expected a ttl value", self.input, t.offset)),
            None => {
                return Err(ConfigError::invalid_spec(
                    "expected a ttl value",
                    self.input,
                    self.end_offset(),
                ))
            }
        };
        let value: i64 = number
            .text
            .parse()
            .map_err(|_| ConfigError::InvalidTtl(number.text.to_string()))?;

        let unit = match self.next() {
            Some(t) if t.kind == Lexeme::Unit => t.text.parse::<TtlUnit>()?,
            Some(t) if t.kind == Lexeme::Word => return Err(ConfigError::InvalidUnit(t.text.to_string())),
            Some(t) => return Err(ConfigError::invalid_spec("expected a ttl unit", self.input, t.offset)),
            None => {
                return Err(ConfigError::invalid_spec(
                    "expected a ttl unit",
                    self.input,
                    self.end_offset(),
                ))
            }
        };

        Ok(unit.to_millis(value)?)
    }
}

fn decode_literal(input: &str, token: Lexed<'_>) -> Result<Vec<u8>, ConfigError> {
    let body = &token.text.as_bytes()[1..token.text.len() - 1];
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;

    while i < body.len() {
        if body[i] != b'\\' {
            out.push(body[i]);
            i += 1;
            continue;
        }

        // +1 for the opening quote
        let escape_offset = token.offset + 1 + i;
        let bad_escape = || ConfigError::invalid_spec("invalid escape sequence", input, escape_offset);
        let code = *body.get(i + 1).ok_or_else(bad_escape)?;
        i += 2;
        match code {
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'0' => out.push(0),
            b'"' => out.push(b'"'),
            b'\'' => out.push(b'\''),
            b'\\' => out.push(b'\\'),
            b'x' => {
                let value = parse_hex(body.get(i..i + 2)).ok_or_else(bad_escape)?;
                out.push(value as u8);
                i += 2;
            }
            b'u' => {
                let value = parse_hex(body.get(i..i + 4)).ok_or_else(bad_escape)?;
                let ch = char::from_u32(value).ok_or_else(bad_escape)?;
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                i += 4;
            }
            _ => return Err(bad_escape()),
        }
    }

    Ok(out)
}

fn parse_hex(digits: Option<&[u8]>) -> Option<u32> {
    let digits = digits?;
    let text = std::str::from_utf8(digits).ok()?;
    if !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(text, 16).ok()
}

/// Parses spec text into an ordered list of entries.
pub fn parse_entries(text: &str) -> Result<Vec<TokenSpecEntry>, ConfigError> {
    let mut entries = Vec::new();
    TokenSpecParser::new(&mut entries).parse(text)?;
    Ok(entries)
}

/// Renders entries back into spec text that parses to the same entries.
///
/// Every token is written as an escaped string literal and every TTL in
/// milliseconds.
pub fn format_spec(entries: &[TokenSpecEntry]) -> String {
    let mut out = String::new();
    for (idx, entry) in entries.iter().enumerate() {
        if idx > 0 {
            out.push_str(",\n");
        }
        out.push('"');
        for &b in &entry.token {
            match b {
                b'"' => out.push_str("\\\""),
                b'\\' => out.push_str("\\\\"),
                b'\n' => out.push_str("\\n"),
                b'\t' => out.push_str("\\t"),
                b'\r' => out.push_str("\\r"),
                0x20..=0x7e => out.push(b as char),
                _ => out.push_str(&format!("\\x{:02x}", b)),
            }
        }
        out.push('"');
        if let Some(ttl) = entry.ttl_millis {
            out.push_str(&format!(":{}ms", ttl));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(token: &str, ttl_millis: Option<i64>) -> TokenSpecEntry {
        TokenSpecEntry {
            token: token.as_bytes().to_vec(),
            ttl_millis,
        }
    }

    #[test]
    fn test_parse_mixed_forms() {
        let entries = parse_entries("\"tokenA\":30s, \"tokenB\"=60s, tokenC").unwrap();
        assert_eq!(
            entries,
            vec![
                entry("tokenA", Some(30_000)),
                entry("tokenB", Some(60_000)),
                entry("tokenC", None),
            ]
        );
    }

    #[test]
    fn test_parse_bare_word_with_ttl_and_newlines() {
        let entries = parse_entries("alpha=5m\nbeta=2h\n\n\"gamma\" : 1d").unwrap();
        assert_eq!(
            entries,
            vec![
                entry("alpha", Some(300_000)),
                entry("beta", Some(7_200_000)),
                entry("gamma", Some(86_400_000)),
            ]
        );
    }

    #[test]
    fn test_milliseconds_beats_minutes() {
        let entries = parse_entries("a=250ms").unwrap();
        assert_eq!(entries, vec![entry("a", Some(250))]);
    }

    #[test]
    fn test_unit_keyword_as_bare_token() {
        let entries = parse_entries("d, ms=1s").unwrap();
        assert_eq!(entries, vec![entry("d", None), entry("ms", Some(1_000))]);
    }

    #[test]
    fn test_escapes_decode() {
        let entries = parse_entries(r#""a\tb\n\"q\"\\\x41é""#).unwrap();
        let mut expected = b"a\tb\n\"q\"\\A".to_vec();
        expected.extend_from_slice("é".as_bytes());
        assert_eq!(entries[0].token, expected);
    }

    #[test]
    fn test_unrecognized_input_reports_offset() {
        let err = parse_entries("\"ok\":1s, #bad").unwrap_err();
        match err {
            ConfigError::InvalidSpec {
                offset, excerpt, ..
            } => {
                assert_eq!(offset, 9);
                assert_eq!(excerpt, "#bad");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_unterminated_string() {
        let err = parse_entries("\"open").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSpec { offset: 0, .. }));
    }

    #[test]
    fn test_invalid_escape() {
        let err = parse_entries(r#""bad\q""#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSpec { offset: 4, .. }));
        assert!(parse_entries(r#""\xZZ""#).is_err());
    }

    #[test]
    fn test_ttl_errors() {
        assert!(matches!(
            parse_entries("a:").unwrap_err(),
            ConfigError::InvalidSpec { .. }
        ));
        assert!(matches!(
            parse_entries("a:30").unwrap_err(),
            ConfigError::InvalidSpec { .. }
        ));
        assert_eq!(
            parse_entries("a:30sec").unwrap_err(),
            ConfigError::InvalidUnit("sec".to_string())
        );
        assert!(matches!(
            parse_entries("a:abc").unwrap_err(),
            ConfigError::InvalidSpec { .. }
        ));
        assert_eq!(
            parse_entries("a:99999999999999999999s").unwrap_err(),
            ConfigError::InvalidTtl("99999999999999999999".to_string())
        );
        assert!(matches!(
            parse_entries("a:9223372036854775807d").unwrap_err(),
            ConfigError::Overflow(_)
        ));
    }

    #[test]
    fn test_number_in_token_position() {
        let err = parse_entries("30s").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSpec { offset: 0, .. }));
    }

    #[test]
    fn test_chained_parse_accumulates() {
        let mut entries: Vec<TokenSpecEntry> = Vec::new();
        TokenSpecParser::new(&mut entries)
            .parse("one=1s")
            .unwrap()
            .parse("two=2s")
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], entry("two", Some(2_000)));
    }

    #[test]
    fn test_round_trip_through_format() {
        let original = parse_entries(
            "\"^edge*\":60s, \"BAZ\"=30000ms, plain, \"tab\\there\":1h, \"\\x01\\x7f\"=3d",
        )
        .unwrap();
        let rendered = format_spec(&original);
        let reparsed = parse_entries(&rendered).unwrap();
        assert_eq!(original, reparsed);
    }

    #[test]
    fn test_empty_spec() {
        assert!(parse_entries("").unwrap().is_empty());
        assert!(parse_entries(" ,\n\t,").unwrap().is_empty());
    }
}
