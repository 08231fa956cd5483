//! Symbol names double as file names, so they are checked before use.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolError {
    #[error("symbol is empty")]
    Empty,

    #[error("symbol '{0}' contains characters outside [A-Za-z0-9._-] or starts with '.'")]
    InvalidCharacters(String),
}

/// Accepts ASCII alphanumerics plus `-`, `_` and `.`, not starting with `.`.
pub fn validate_symbol(symbol: &str) -> Result<(), SymbolError> {
    if symbol.is_empty() {
        return Err(SymbolError::Empty);
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if symbol.starts_with('.') || !symbol.chars().all(allowed) {
        return Err(SymbolError::InvalidCharacters(symbol.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_exchange_symbols() {
        assert!(validate_symbol("BTCUSDT").is_ok());
        assert!(validate_symbol("ETH-PERP").is_ok());
        assert!(validate_symbol("btc_usdt.p").is_ok());
    }

    #[test]
    fn rejects_paths() {
        assert_eq!(validate_symbol(""), Err(SymbolError::Empty));
        assert!(validate_symbol("../etc").is_err());
        assert!(validate_symbol("a/b").is_err());
        assert!(validate_symbol(".hidden").is_err());
    }
}
