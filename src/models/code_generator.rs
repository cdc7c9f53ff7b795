//! Pattern-driven coupon code generator.
//!
//! A pattern is a string of literal characters in `[A-Z0-9_-]` mixed with
//! placeholder tokens `{X..}`, `{9..}` or `{*..}`. Each placeholder expands
//! to random characters of equal length drawn from the letter, digit or
//! alphanumeric alphabet. Draws come from the operating system RNG so
//! issued codes are unpredictable to holders of earlier ones.

use std::collections::HashSet;

use failure::Error as FailureError;
use rand::rngs::OsRng;
use rand::Rng;

use errors::Error;
use models::validation_rules::validation_error;

const LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Share of a pattern's combinatorial capacity that one generation call
/// may request.
pub const CAPACITY_SHARE: f64 = 0.80;

/// Draws allowed per requested code before generation reports the
/// pattern as exhausted.
const DRAW_BUDGET_FACTOR: usize = 10;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Letters(usize),
    Digits(usize),
    Alphanumeric(usize),
}

impl Segment {
    fn expanded_len(&self) -> usize {
        match *self {
            Segment::Literal(ref s) => s.len(),
            Segment::Letters(n) | Segment::Digits(n) | Segment::Alphanumeric(n) => n,
        }
    }
}

/// A parsed, well-formed code pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    segments: Vec<Segment>,
    expanded_len: usize,
}

impl Pattern {
    /// Parses and validates a raw pattern string.
    pub fn parse(raw: &str) -> Result<Pattern, FailureError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.chars();
        let mut has_placeholder = false;

        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(literal.clone()));
                        literal.clear();
                    }
                    let mut token = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(t) => token.push(t),
                            None => {
                                return Err(pattern_error("Unterminated placeholder in code pattern."));
                            }
                        }
                    }
                    segments.push(parse_placeholder(&token)?);
                    has_placeholder = true;
                }
                'A'...'Z' | '0'...'9' | '-' | '_' => literal.push(c),
                _ => {
                    return Err(pattern_error(
                        "Code pattern literals are limited to A-Z, 0-9, '-' and '_'.",
                    ));
                }
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        if !has_placeholder {
            return Err(pattern_error("Code pattern must contain at least one placeholder."));
        }

        let expanded_len = segments.iter().map(Segment::expanded_len).sum();
        Ok(Pattern {
            segments,
            expanded_len,
        })
    }

    /// Exact number of distinct codes the pattern can produce,
    /// saturating at the integer limit for very wide patterns.
    pub fn capacity(&self) -> u128 {
        self.segments.iter().fold(1u128, |acc, segment| {
            let base = match *segment {
                Segment::Literal(_) => return acc,
                Segment::Letters(_) => LETTERS.len() as u128,
                Segment::Digits(_) => DIGITS.len() as u128,
                Segment::Alphanumeric(_) => ALPHANUMERIC.len() as u128,
            };
            (0..segment.expanded_len()).fold(acc, |acc, _| acc.saturating_mul(base))
        })
    }

    /// Whether `count` stays inside the requestable share of capacity.
    pub fn within_capacity_share(&self, count: usize) -> bool {
        count as f64 <= CAPACITY_SHARE * self.capacity() as f64
    }

    pub fn expanded_len(&self) -> usize {
        self.expanded_len
    }

    /// One random expansion of the pattern.
    fn draw(&self) -> String {
        let mut rng = OsRng;
        let mut out = String::with_capacity(self.expanded_len);
        for segment in &self.segments {
            match *segment {
                Segment::Literal(ref s) => out.push_str(s),
                Segment::Letters(n) => push_random(&mut out, LETTERS, n, &mut rng),
                Segment::Digits(n) => push_random(&mut out, DIGITS, n, &mut rng),
                Segment::Alphanumeric(n) => push_random(&mut out, ALPHANUMERIC, n, &mut rng),
            }
        }
        out
    }

    /// Produces `count` distinct codes, discarding collisions. Gives up
    /// once the draw budget is spent without reaching the target.
    pub fn generate(&self, count: usize) -> Result<Vec<String>, FailureError> {
        let budget = count.saturating_mul(DRAW_BUDGET_FACTOR);
        let mut seen: HashSet<String> = HashSet::with_capacity(count);
        let mut codes = Vec::with_capacity(count);

        for _ in 0..budget {
            if codes.len() == count {
                break;
            }
            let code = self.draw();
            if seen.insert(code.clone()) {
                codes.push(code);
            }
        }
        if codes.len() < count {
            return Err(Error::Business(format!(
                "Pattern exhausted: produced {} of {} requested codes",
                codes.len(),
                count
            )).into());
        }
        Ok(codes)
    }
}

fn push_random(out: &mut String, alphabet: &[u8], n: usize, rng: &mut OsRng) {
    for _ in 0..n {
        let idx = rng.gen_range(0..alphabet.len());
        out.push(alphabet[idx] as char);
    }
}

fn parse_placeholder(token: &str) -> Result<Segment, FailureError> {
    if token.is_empty() {
        return Err(pattern_error("Empty placeholder in code pattern."));
    }
    if token.chars().all(|c| c == 'X' || c == 'x') {
        Ok(Segment::Letters(token.len()))
    } else if token.chars().all(|c| c == '9') {
        Ok(Segment::Digits(token.len()))
    } else if token.chars().all(|c| c == '*') {
        Ok(Segment::Alphanumeric(token.len()))
    } else {
        Err(pattern_error(
            "Placeholders must repeat a single token kind: X, 9 or *.",
        ))
    }
}

fn pattern_error(message: &'static str) -> FailureError {
    Error::Validate(validation_error("code_pattern", message)).into()
}
