// Convert gateway wire strings into numeric quote fields.
//
// The Client Portal market-data feed sends prices as strings. A price can
// carry a one-letter prefix ("C" = previous close, "H" = halted) and
// thousands separators. An empty string or a non-number means "no value".

use serde_json::Value;

pub struct Normaliser {
    /// Prefixed prices ("C4512.30") are stale; accept them only when this is set.
    pub accept_prefixed: bool,
}

impl Normaliser {
    pub fn new(accept_prefixed: bool) -> Self {
        Self { accept_prefixed }
    }

    pub fn price(&self, s: &str) -> Option<f64> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }

        let body = match s.chars().next() {
            Some(c) if c.is_ascii_alphabetic() => {
                if !self.accept_prefixed {
                    return None;
                }
                &s[c.len_utf8()..]
            }
            _ => s,
        };

        let cleaned: String = body.chars().filter(|c| *c != ',').collect();
        let value = cleaned.parse::<f64>().ok()?;
        value.is_finite().then_some(value)
    }

    /// Same as `price` but reads a JSON field that may be a string or a number.
    pub fn price_field(&self, v: Option<&Value>) -> Option<f64> {
        match v? {
            Value::String(s) => self.price(s),
            Value::Number(n) => n.as_f64().filter(|x| x.is_finite()),
            _ => None,
        }
    }
}

impl Default for Normaliser {
    fn default() -> Self {
        Self::new(true)
    }
}
