//! Identifier rules shared by variables and formulas
//!
//! Keys double as identifiers inside formula expressions, so they follow the
//! expression grammar's identifier rule: `[A-Za-z_][A-Za-z0-9_]*`.

use lazy_regex::regex_is_match;

/// Check whether `key` can be used as a variable or formula key
pub fn is_valid_key(key: &str) -> bool {
    regex_is_match!(r"^[A-Za-z_][A-Za-z0-9_]*$", key)
}

/// Turn a key into lowercase words for explanations
///
/// Splits on `_` and on lower-to-upper camelCase boundaries:
/// `complexityMultiplier` becomes `complexity multiplier`,
/// `credit_price_usd` becomes `credit price usd`.
pub fn humanize_key(key: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for c in key.chars() {
        if c == '_' {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_ascii_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        current.push(c.to_ascii_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }

    words.join(" ")
}
