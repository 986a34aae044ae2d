//! Structural grammar of the RIF: a kind letter, an eight digit body and a
//! check digit. Everything in here is pure and performs no I/O, so a parsed
//! [`Identifier`] can be cached and compared freely.

use {
    serde::{Deserialize, Deserializer, Serialize, Serializer},
    std::{
        fmt::{self, Display, Formatter},
        str::FromStr,
    },
};

/// Number of digits in the numeric body.
pub const BODY_LENGTH: usize = 8;

/// Weights applied to the body digits by the modulo 11 check digit.
const BODY_WEIGHTS: [u32; BODY_LENGTH] = [3, 2, 7, 6, 5, 4, 3, 2];

/// Weight applied to the numeric value of the kind letter.
const KIND_WEIGHT: u32 = 4;

/// Category of the person or entity the identifier was issued to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    /// Venezuelan natural person.
    V,
    /// Foreign natural person.
    E,
    /// Legal person.
    J,
    /// Passport holder.
    P,
    /// Government body.
    G,
    /// Communal council.
    C,
}

impl Kind {
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'V' => Some(Self::V),
            'E' => Some(Self::E),
            'J' => Some(Self::J),
            'P' => Some(Self::P),
            'G' => Some(Self::G),
            'C' => Some(Self::C),
            _ => None,
        }
    }

    pub fn letter(self) -> char {
        match self {
            Self::V => 'V',
            Self::E => 'E',
            Self::J => 'J',
            Self::P => 'P',
            Self::G => 'G',
            Self::C => 'C',
        }
    }

    /// Numeric value of the letter as published for the check digit.
    pub fn weight(self) -> u32 {
        match self {
            Self::V => 1,
            Self::E => 2,
            Self::J | Self::C => 3,
            Self::P => 4,
            Self::G => 5,
        }
    }
}

/// Why a raw input is not a structurally valid identifier. Variants are
/// listed in the order the rules are checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
pub enum InvalidReason {
    #[error("unknown identifier kind")]
    BadKind,
    #[error("identifier must have {} body digits and a check digit", BODY_LENGTH)]
    BadLength,
    #[error("identifier body must be numeric")]
    NonNumericBody,
    #[error("check digit does not match")]
    BadCheckDigit,
}

impl InvalidReason {
    /// Stable machine readable name used in API responses and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadKind => "bad-kind",
            Self::BadLength => "bad-length",
            Self::NonNumericBody => "non-numeric-body",
            Self::BadCheckDigit => "bad-check-digit",
        }
    }
}

/// A structurally valid RIF.
///
/// Only constructed through [`IdentifierFormat`], so the check digit always
/// agrees with the algorithm the identifier was parsed with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier {
    kind: Kind,
    body: [u8; BODY_LENGTH],
    check: u8,
}

impl Identifier {
    /// Builds the identifier for a kind and body number, deriving the check
    /// digit with [`Modulo11`]. Returns `None` if the number has more than
    /// [`BODY_LENGTH`] digits.
    pub fn with_number(kind: Kind, number: u32) -> Option<Self> {
        if number >= 10u32.pow(BODY_LENGTH as u32) {
            return None;
        }
        let mut body = [0; BODY_LENGTH];
        let mut rest = number;
        for digit in body.iter_mut().rev() {
            *digit = (rest % 10) as u8;
            rest /= 10;
        }
        let check = Modulo11.compute(kind, &body);
        Some(Self { kind, body, check })
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn body(&self) -> &[u8; BODY_LENGTH] {
        &self.body
    }

    pub fn check_digit(&self) -> u8 {
        self.check
    }

    /// Canonical form without separators, e.g. `J301234561`. This is the key
    /// used for caching and for the account directory.
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    /// Human readable form, e.g. `J-30123456-1`.
    pub fn formatted(&self) -> String {
        format!("{}-{}-{}", self.kind.letter(), self.body_str(), self.check)
    }

    fn body_str(&self) -> String {
        self.body.iter().map(|digit| char::from(b'0' + digit)).collect()
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.kind.letter(), self.body_str(), self.check)
    }
}

impl FromStr for Identifier {
    type Err = InvalidReason;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        IdentifierFormat::<Modulo11>::default().parse(raw).into_result()
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Result of the local structural validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid(Identifier),
    Invalid(InvalidReason),
}

impl ValidationOutcome {
    pub fn into_result(self) -> Result<Identifier, InvalidReason> {
        match self {
            Self::Valid(identifier) => Ok(identifier),
            Self::Invalid(reason) => Err(reason),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

/// Computes the check digit for a kind and body.
pub trait CheckDigit: Send + Sync {
    fn compute(&self, kind: Kind, body: &[u8; BODY_LENGTH]) -> u8;
}

/// Weighted sum modulo 11 over the kind value and the body digits, as
/// published by the tax authority.
#[derive(Clone, Copy, Debug, Default)]
pub struct Modulo11;

impl CheckDigit for Modulo11 {
    fn compute(&self, kind: Kind, body: &[u8; BODY_LENGTH]) -> u8 {
        let sum = kind.weight() * KIND_WEIGHT
            + body
                .iter()
                .zip(BODY_WEIGHTS)
                .map(|(digit, weight)| u32::from(*digit) * weight)
                .sum::<u32>();
        match 11 - sum % 11 {
            digit @ 0..=9 => digit as u8,
            _ => 0,
        }
    }
}

fn is_separator(c: char) -> bool {
    c.is_whitespace() || matches!(c, '-' | '.' | '/' | '_')
}

/// Parser for the identifier grammar, parameterized over the check digit
/// algorithm.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentifierFormat<A = Modulo11> {
    algorithm: A,
}

impl<A: CheckDigit> IdentifierFormat<A> {
    pub fn with_algorithm(algorithm: A) -> Self {
        Self { algorithm }
    }

    /// Validates a raw user supplied string. Separators are ignored and the
    /// kind letter is case insensitive. The first violated rule wins.
    pub fn parse(&self, raw: &str) -> ValidationOutcome {
        let mut chars = raw.chars().filter(|c| !is_separator(*c));
        let Some(kind) = chars.next().and_then(Kind::from_letter) else {
            return ValidationOutcome::Invalid(InvalidReason::BadKind);
        };
        let rest: Vec<char> = chars.collect();
        if rest.len() != BODY_LENGTH + 1 {
            return ValidationOutcome::Invalid(InvalidReason::BadLength);
        }
        self.verify_digits(kind, &rest)
    }

    /// Validates an identifier submitted as three separate fields: the kind
    /// selector, the body and the check digit. Every field must hold exactly
    /// its own part, a digit moved between body and check is a length error.
    pub fn parse_parts(&self, kind: &str, body: &str, check: &str) -> ValidationOutcome {
        let mut letters = kind.chars().filter(|c| !is_separator(*c));
        let kind = match (letters.next().and_then(Kind::from_letter), letters.next()) {
            (Some(kind), None) => kind,
            _ => return ValidationOutcome::Invalid(InvalidReason::BadKind),
        };
        let mut digits: Vec<char> = body.chars().filter(|c| !is_separator(*c)).collect();
        let check: Vec<char> = check.chars().filter(|c| !is_separator(*c)).collect();
        if digits.len() != BODY_LENGTH || check.len() != 1 {
            return ValidationOutcome::Invalid(InvalidReason::BadLength);
        }
        digits.extend(check);
        self.verify_digits(kind, &digits)
    }

    /// Expects the body followed by the check digit, `BODY_LENGTH + 1`
    /// characters in total.
    fn verify_digits(&self, kind: Kind, chars: &[char]) -> ValidationOutcome {
        let Some(digits) = chars
            .iter()
            .map(|c| c.to_digit(10).map(|digit| digit as u8))
            .collect::<Option<Vec<u8>>>()
        else {
            return ValidationOutcome::Invalid(InvalidReason::NonNumericBody);
        };

        let mut body = [0; BODY_LENGTH];
        body.copy_from_slice(&digits[..BODY_LENGTH]);
        self.verify(kind, body, digits[BODY_LENGTH])
    }

    fn verify(&self, kind: Kind, body: [u8; BODY_LENGTH], check: u8) -> ValidationOutcome {
        if self.algorithm.compute(kind, &body) != check {
            return ValidationOutcome::Invalid(InvalidReason::BadCheckDigit);
        }
        ValidationOutcome::Valid(Identifier { kind, body, check })
    }
}

/// Parses with the default check digit algorithm.
pub fn parse(raw: &str) -> ValidationOutcome {
    IdentifierFormat::<Modulo11>::default().parse(raw)
}
