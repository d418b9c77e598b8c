//! Symbol descriptors and exchange classification.
//!
//! A symbol is exchange-qualified (`000001.SZ`, `600000.SH`); a code is the
//! bare six-digit part. Identity is the qualified symbol.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Exchange suffixes of a symbol.
pub const SUFFIX_SZ: &str = ".SZ";
pub const SUFFIX_SH: &str = ".SH";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SymbolError {
    #[error("symbol '{0}' has no exchange suffix")]
    MissingSuffix(String),

    #[error("unknown exchange suffix in '{0}'")]
    UnknownExchange(String),
}

/// Exchange a symbol trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Market {
    Shenzhen,
    Shanghai,
}

impl Market {
    /// Market id used by the TDX protocol and the Eastmoney `secid`.
    pub fn wire_id(self) -> u16 {
        match self {
            Market::Shenzhen => 0,
            Market::Shanghai => 1,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Market::Shenzhen => SUFFIX_SZ,
            Market::Shanghai => SUFFIX_SH,
        }
    }

    /// Lowercase prefix used by the session gateway (`sh.600000`).
    pub fn session_prefix(self) -> &'static str {
        match self {
            Market::Shenzhen => "sz",
            Market::Shanghai => "sh",
        }
    }

    /// Anything not explicitly `.SH` is treated as Shenzhen.
    pub fn from_symbol(symbol: &str) -> Self {
        if symbol.ends_with(SUFFIX_SH) {
            Market::Shanghai
        } else {
            Market::Shenzhen
        }
    }

    /// Classify a bare code into its A-share market, or `None` for B-shares,
    /// funds, indices and bonds.
    pub fn classify_a_share(code: &str) -> Option<Self> {
        if code.len() != 6 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        match &code[..3] {
            "600" | "601" | "603" | "605" | "688" | "689" => Some(Market::Shanghai),
            "000" | "001" | "002" | "003" | "300" | "301" => Some(Market::Shenzhen),
            _ => None,
        }
    }
}

/// One entry of the symbol universe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolDescriptor {
    pub symbol: String,
    pub code: String,
    pub name: String,
}

impl SymbolDescriptor {
    /// Build from a 6-digit code; `symbol` is the code plus the market suffix.
    pub fn new(code: &str, market: Market, name: impl Into<String>) -> Self {
        Self {
            symbol: format!("{code}{}", market.suffix()),
            code: code.to_string(),
            name: name.into(),
        }
    }

    /// Rebuild a descriptor from a qualified symbol alone (name unknown).
    pub fn from_symbol(symbol: &str) -> Result<Self, SymbolError> {
        let (code, suffix) = symbol
            .split_once('.')
            .ok_or_else(|| SymbolError::MissingSuffix(symbol.to_string()))?;
        match suffix {
            "SZ" | "SH" => Ok(Self {
                symbol: symbol.to_string(),
                code: code.to_string(),
                name: String::new(),
            }),
            _ => Err(SymbolError::UnknownExchange(symbol.to_string())),
        }
    }

    pub fn market(&self) -> Market {
        Market::from_symbol(&self.symbol)
    }
}

impl PartialEq for SymbolDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.symbol == other.symbol
    }
}

impl Eq for SymbolDescriptor {}

impl std::hash::Hash for SymbolDescriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.symbol.hash(state);
    }
}

impl fmt::Display for SymbolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_from_suffix() {
        assert_eq!(Market::from_symbol("600000.SH"), Market::Shanghai);
        assert_eq!(Market::from_symbol("000001.SZ"), Market::Shenzhen);
        assert_eq!(Market::from_symbol("000001"), Market::Shenzhen);
    }

    #[test]
    fn classify_filters_b_shares_and_funds() {
        assert_eq!(Market::classify_a_share("600519"), Some(Market::Shanghai));
        assert_eq!(Market::classify_a_share("688981"), Some(Market::Shanghai));
        assert_eq!(Market::classify_a_share("300750"), Some(Market::Shenzhen));
        assert_eq!(Market::classify_a_share("900901"), None);
        assert_eq!(Market::classify_a_share("200002"), None);
        assert_eq!(Market::classify_a_share("510300"), None);
        assert_eq!(Market::classify_a_share("12345"), None);
    }

    #[test]
    fn descriptor_identity_is_symbol() {
        let a = SymbolDescriptor::new("000001", Market::Shenzhen, "PAB");
        let b = SymbolDescriptor::from_symbol("000001.SZ").unwrap();
        assert_eq!(a, b);
        assert_eq!(b.code, "000001");
        assert!(b.name.is_empty());
    }

    #[test]
    fn descriptor_rejects_unqualified_symbol() {
        assert_eq!(
            SymbolDescriptor::from_symbol("000001"),
            Err(SymbolError::MissingSuffix("000001".into()))
        );
        assert!(SymbolDescriptor::from_symbol("AAPL.US").is_err());
    }
}
