//! Hierarchical Identities
//!
//! An identity is a path of integer digits from the root of the entity tree.
//! Entities can only be created by other entities, so when external inputs are
//! the same, the sequence of creation and therefore every identity is the same
//! across runs and across machines.
//!
//! # Example
//!
//! ```
//! use sim_types::Identity;
//!
//! let parent = Identity::from([1, 2]);
//! let child = parent.child(0);
//! assert!(parent < child);
//! assert_eq!(child.to_string(), "\"1-2-0\"");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One element of an identity. An entity can mint 2^64 children.
pub type Digit = u64;

/// Immutable, totally ordered, hierarchical name of an entity.
///
/// Ordering is lexicographic over the digits, so a strict prefix sorts before
/// every extension of it: `[1, 2] < [1, 2, 0] < [1, 2, 3] < [1, 2, 4] < [3]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity {
    digits: Vec<Digit>,
}

impl Identity {
    /// The empty identity, root of every entity tree.
    pub const fn root() -> Self {
        Self { digits: Vec::new() }
    }

    /// Builds an identity from digits, most significant first.
    pub fn new(digits: Vec<Digit>) -> Self {
        Self { digits }
    }

    /// The digits of this identity, most significant first.
    pub fn digits(&self) -> &[Digit] {
        &self.digits
    }

    /// Number of digits, which is the depth in the entity tree.
    pub fn depth(&self) -> usize {
        self.digits.len()
    }

    pub fn is_root(&self) -> bool {
        self.digits.is_empty()
    }

    /// Returns the identity formed by appending `digit`.
    pub fn child(&self, digit: Digit) -> Self {
        let mut digits = Vec::with_capacity(self.digits.len() + 1);
        digits.extend_from_slice(&self.digits);
        digits.push(digit);
        Self { digits }
    }

    /// Returns the identity of the creator, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        let (_, prefix) = self.digits.split_last()?;
        Some(Self {
            digits: prefix.to_vec(),
        })
    }

    /// True if `self` is a strict prefix of `other`.
    pub fn is_ancestor_of(&self, other: &Identity) -> bool {
        self.digits.len() < other.digits.len() && other.digits.starts_with(&self.digits)
    }

    /// Platform-independent hash of the digits.
    ///
    /// The hash of a one-digit identity is that digit. Longer identities fold
    /// the remaining digits in from back to front with the classic
    /// `hash_combine` mixing step. Unlike `std::hash`, the result is stable
    /// across processes, which the per-agent seeds rely on.
    pub fn stable_hash(&self) -> u64 {
        let Some((last, rest)) = self.digits.split_last() else {
            return 0;
        };
        let mut seed = *last;
        for digit in rest.iter().rev() {
            seed ^= digit
                .wrapping_add(0x9e37_79b9)
                .wrapping_add(seed << 6)
                .wrapping_add(seed >> 2);
        }
        seed
    }

    /// Renders the identity with every digit zero-padded to `width`.
    pub fn representation(&self, width: usize) -> String {
        let body = self
            .digits
            .iter()
            .map(|d| format!("{:0width$}", d, width = width))
            .collect::<Vec<_>>()
            .join("-");
        format!("\"{}\"", body)
    }
}

impl<const N: usize> From<[Digit; N]> for Identity {
    fn from(digits: [Digit; N]) -> Self {
        Self {
            digits: digits.to_vec(),
        }
    }
}

impl From<Vec<Digit>> for Identity {
    fn from(digits: Vec<Digit>) -> Self {
        Self { digits }
    }
}

/// Renders as `"1-0-23"`. A width (`{:2}`) zero-pads each digit.
impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.representation(f.width().unwrap_or(0)))
    }
}

/// Error type for parsing identities from strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseIdentityError {
    #[error("invalid identity digit '{digit}' in '{input}'")]
    InvalidDigit { input: String, digit: String },
}

impl FromStr for Identity {
    type Err = ParseIdentityError;

    /// Parses `"1-2-3"` or `1-2-3`. The empty string is the root.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_matches('"');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let digits = trimmed
            .split('-')
            .map(|part| {
                part.parse::<Digit>()
                    .map_err(|_| ParseIdentityError::InvalidDigit {
                        input: s.to_string(),
                        digit: part.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { digits })
    }
}
