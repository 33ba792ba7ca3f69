//! Decoder for scalar text forms
//!
//! Accepts what [`Num::encode`] produces plus a few looser spellings
//! (exponents, a unit with or without the separating space).

use winnow::ascii::digit1;
use winnow::combinator::{alt, opt, preceded};
use winnow::prelude::*;
use winnow::token::{one_of, take_while};

use crate::num::{Num, is_unit_char};
use crate::{HaystackError, Result};

type PResult<T> = winnow::ModalResult<T>;

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub offset: usize,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (offset {})", self.message, self.offset)
    }
}

impl std::error::Error for ParseError {}

/// Parse the plain form: `72.5 kW`, `INF`, `-INF`, `NaN`
pub(crate) fn parse_num(input: &str) -> Result<Num> {
    run(input.trim(), num_literal)
}

/// Parse the tagged form: `n:72.5kW`
pub(crate) fn parse_tagged_num(input: &str) -> Result<Num> {
    run(input.trim(), preceded("n:", num_literal))
}

fn run<'a, P>(input: &'a str, mut parser: P) -> Result<Num>
where
    P: Parser<&'a str, (f64, Option<&'a str>), winnow::error::ErrMode<winnow::error::ContextError>>,
{
    let mut stream = input;
    match parser.parse_next(&mut stream) {
        Ok((val, unit)) => {
            if !stream.is_empty() {
                let offset = input.len() - stream.len();
                return Err(error("unexpected trailing input", offset));
            }
            // unit chars were already restricted by the grammar
            Num::make(val, unit)
        }
        Err(_) => {
            let offset = input.len().saturating_sub(stream.len());
            Err(error("expected number", offset))
        }
    }
}

fn error(message: &str, offset: usize) -> HaystackError {
    HaystackError::Parse(ParseError {
        message: message.to_string(),
        offset,
    })
}

// ============ Grammar ============

fn num_literal<'a>(input: &mut &'a str) -> PResult<(f64, Option<&'a str>)> {
    alt((
        "-INF".value((f64::NEG_INFINITY, None)),
        "INF".value((f64::INFINITY, None)),
        "NaN".value((f64::NAN, None)),
        (decimal, opt(preceded(opt(' '), unit))),
    ))
    .parse_next(input)
}

fn decimal(input: &mut &str) -> PResult<f64> {
    (
        opt('-'),
        digit1,
        opt(('.', digit1)),
        opt((one_of(['e', 'E']), opt(one_of(['+', '-'])), digit1)),
    )
        .take()
        .try_map(str::parse::<f64>)
        .parse_next(input)
}

fn unit<'a>(input: &mut &'a str) -> PResult<&'a str> {
    take_while(1.., is_unit_char).parse_next(input)
}
