//! Rune identifiers, names and transfer requests.

use std::{fmt, str::FromStr};

use bitcoin::Amount;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DeserializeFromStr, DisplayFromStr, SerializeDisplay};

/// Spacer character allowed between the letters of a rune name.
pub const SPACER: char = '•';

/// A rune's etching location: `block:tx`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, SerializeDisplay, DeserializeFromStr,
)]
pub struct RuneId {
    /// Height of the etching block.
    pub block: u64,
    /// Index of the etching transaction in the block.
    pub tx: u32,
}

impl fmt::Display for RuneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.tx)
    }
}

impl FromStr for RuneId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (block, tx) = s
            .split_once(':')
            .ok_or_else(|| format!("rune id must be block:tx, got {s}"))?;
        Ok(Self {
            block: block.parse().map_err(|_| format!("bad rune id block: {s}"))?,
            tx: tx.parse().map_err(|_| format!("bad rune id tx: {s}"))?,
        })
    }
}

/// A rune name as its base-26 number: `A` = 0, `Z` = 25, `AA` = 26 and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rune(pub u128);

impl Rune {
    /// The name with spacers removed.
    pub fn unspaced(name: &str) -> String {
        name.chars().filter(|c| *c != SPACER && *c != '.').collect()
    }
}

impl fmt::Display for Rune {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut n = self.0;
        if n == u128::MAX {
            return f.write_str("BCGDENLQRQWDSLRUGSNLBTMFIJAV");
        }
        n += 1;
        let mut symbol = Vec::new();
        while n > 0 {
            symbol.push(b'A' + ((n - 1) % 26) as u8);
            n = (n - 1) / 26;
        }
        symbol.reverse();
        f.write_str(&String::from_utf8_lossy(&symbol))
    }
}

impl FromStr for Rune {
    type Err = String;

    /// Parses a name in `A`-`Z`, spacers ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = Self::unspaced(s);
        if name.is_empty() {
            return Err("empty rune name".to_string());
        }
        let mut x = 0u128;
        for (i, c) in name.chars().enumerate() {
            if i > 0 {
                x = x.checked_add(1).ok_or("rune name out of range")?;
            }
            x = x.checked_mul(26).ok_or("rune name out of range")?;
            match c {
                'A'..='Z' => {
                    x = x
                        .checked_add(u128::from(c as u8 - b'A'))
                        .ok_or("rune name out of range")?;
                }
                _ => return Err(format!("invalid character {c:?} in rune name {s}")),
            }
        }
        Ok(Self(x))
    }
}

/// Transfer `amount` of rune `id` to output `output`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edict {
    /// Rune being moved.
    pub id: RuneId,
    /// Raw amount, in the rune's smallest unit.
    pub amount: u128,
    /// Destination output index.
    pub output: u32,
}

/// A request to pay `amount` raw units of `rune` to `receiver` with `postage` sats.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuneTransfer {
    /// Rune name, spacers allowed.
    pub rune: String,
    /// Receiving BTC address.
    pub receiver: String,
    /// Raw amount.
    #[serde_as(as = "DisplayFromStr")]
    pub amount: u128,
    /// Sats carried by the receiving output.
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub postage: Amount,
}
