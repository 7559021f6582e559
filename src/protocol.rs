//! Pixel flood text protocol parser.
//!
//! One command per line:
//!
//! ```text
//! PX <x> <y> <RRGGBB>
//! ```
//!
//! The leading token is not checked; only the arity and the field formats
//! are. Nothing is ever sent back to the client, valid or not.

use crate::framebuffer::Color;

/// Number of space-separated components in a command line
const COMPONENTS: usize = 4;

/// Length of the `RRGGBB` color field
const COLOR_LENGTH: usize = 6;

/// Parsed set-pixel command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetPixel {
    pub x: u16,
    pub y: u16,
    pub color: Color,
}

/// Protocol parsing errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Wrong number of components (holds the number found)
    Arity(usize),
    /// X or Y is not a base-10 integer in `0..=65535`
    CoordinateFormat,
    /// Color field is not six characters long (holds its length)
    ColorLength(usize),
    /// Color field contains a non-hex digit
    ColorFormat,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Arity(n) => {
                write!(f, "Expected {} components, got {}", COMPONENTS, n)
            }
            ParseError::CoordinateFormat => write!(f, "Invalid coordinate"),
            ParseError::ColorLength(n) => {
                write!(f, "Expected {} color digits, got {}", COLOR_LENGTH, n)
            }
            ParseError::ColorFormat => write!(f, "Invalid color"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse a single line with its terminator already stripped.
pub fn parse(line: &[u8]) -> Result<SetPixel, ParseError> {
    let mut parts: [&[u8]; COMPONENTS] = [&[]; COMPONENTS];
    let mut count = 0;
    for part in line.split(|&b| b == b' ') {
        if count < COMPONENTS {
            parts[count] = part;
        }
        count += 1;
    }
    if count != COMPONENTS {
        return Err(ParseError::Arity(count));
    }

    let x = parse_coordinate(parts[1])?;
    let y = parse_coordinate(parts[2])?;
    let color = parse_color(parts[3])?;

    Ok(SetPixel { x, y, color })
}

fn parse_coordinate(field: &[u8]) -> Result<u16, ParseError> {
    if field.is_empty() {
        return Err(ParseError::CoordinateFormat);
    }

    let mut value: u16 = 0;
    for &b in field {
        if !b.is_ascii_digit() {
            return Err(ParseError::CoordinateFormat);
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as u16))
            .ok_or(ParseError::CoordinateFormat)?;
    }
    Ok(value)
}

fn parse_color(field: &[u8]) -> Result<Color, ParseError> {
    if field.len() != COLOR_LENGTH {
        return Err(ParseError::ColorLength(field.len()));
    }

    let r = parse_hex_byte(field[0], field[1])?;
    let g = parse_hex_byte(field[2], field[3])?;
    let b = parse_hex_byte(field[4], field[5])?;
    Ok(Color::new(r, g, b))
}

#[inline]
fn parse_hex_byte(hi: u8, lo: u8) -> Result<u8, ParseError> {
    Ok((hex_digit(hi)? << 4) | hex_digit(lo)?)
}

#[inline]
fn hex_digit(b: u8) -> Result<u8, ParseError> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(ParseError::ColorFormat),
    }
}
