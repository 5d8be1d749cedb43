use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::engine::types::PricingRow;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV encoding failure: {0}")]
    Csv(#[from] csv::Error),
    #[error("bad anchor {0:?}")]
    BadAnchor(String),
    #[error("bad sheet name {0:?}")]
    BadSheet(String),
}

pub type SinkResult<T> = Result<T, SinkError>;

/// Zero-based cell position, parsed from spreadsheet notation such as `C1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellRef {
    pub row: usize,
    pub col: usize,
}

impl CellRef {
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }

    pub fn parse(s: &str) -> SinkResult<Self> {
        let bad = || SinkError::BadAnchor(s.to_string());
        let s_trim = s.trim();
        let split = s_trim.find(|c: char| c.is_ascii_digit()).ok_or_else(bad)?;
        let (letters, digits) = s_trim.split_at(split);
        if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(bad());
        }

        let col = letters
            .chars()
            .map(|c| (c.to_ascii_uppercase() as u8 - b'A') as usize + 1)
            .try_fold(0usize, |acc, d| acc.checked_mul(26)?.checked_add(d))
            .ok_or_else(bad)?;
        let row: usize = digits.parse().map_err(|_| bad())?;
        if row == 0 {
            return Err(bad());
        }
        Ok(Self { row: row - 1, col: col - 1 })
    }
}

impl FromStr for CellRef {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut letters = Vec::new();
        let mut n = self.col + 1;
        while n > 0 {
            let rem = (n - 1) % 26;
            letters.push((b'A' + rem as u8) as char);
            n = (n - 1) / 26;
        }
        let col: String = letters.into_iter().rev().collect();
        write!(f, "{}{}", col, self.row + 1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
}

impl Cell {
    pub fn render(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.clone(),
            Cell::Number(n) => n.to_string(),
        }
    }
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::Text(s.to_string())
    }
}

impl From<String> for Cell {
    fn from(s: String) -> Self {
        Cell::Text(s)
    }
}

impl From<f64> for Cell {
    fn from(n: f64) -> Self {
        Cell::Number(n)
    }
}

impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(v: Option<T>) -> Self {
        v.map_or(Cell::Empty, Into::into)
    }
}

/// A rectangular block of cells, optionally led by a header row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub header: Option<Vec<String>>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(rows: Vec<Vec<Cell>>) -> Self {
        Self { header: None, rows }
    }

    pub fn with_header<S: Into<String>>(mut self, header: impl IntoIterator<Item = S>) -> Self {
        self.header = Some(header.into_iter().map(Into::into).collect());
        self
    }

    pub fn height(&self) -> usize {
        self.rows.len() + usize::from(self.header.is_some())
    }

    pub fn width(&self) -> usize {
        let body = self.rows.iter().map(Vec::len).max().unwrap_or(0);
        self.header.as_ref().map_or(body, |h| h.len().max(body))
    }

    /// Header (if any) then body, rendered to strings.
    pub fn rendered_rows(&self) -> impl Iterator<Item = Vec<String>> + '_ {
        self.header
            .iter()
            .cloned()
            .chain(self.rows.iter().map(|r| r.iter().map(Cell::render).collect()))
    }
}

/// The published feed: header-less, one line per row in column order.
pub fn pricing_table(rows: &[PricingRow]) -> Table {
    Table::new(
        rows.iter()
            .map(|r| {
                vec![
                    Cell::from(r.trade_date.as_str()),
                    Cell::from(r.trade_time.as_str()),
                    Cell::from(r.underlying.as_str()),
                    Cell::from(r.underlying_price),
                    Cell::from(r.option_ref.as_str()),
                    Cell::from(r.strike),
                    Cell::from(r.call_ref.clone()),
                    Cell::from(r.call_mid),
                    Cell::from(r.put_ref.as_str()),
                    Cell::from(r.put_mid),
                ]
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::PRICING_COLUMNS;

    #[test]
    fn test_parse_anchor() {
        assert_eq!(CellRef::parse("A1").unwrap(), CellRef::new(0, 0));
        assert_eq!(CellRef::parse("c1").unwrap(), CellRef::new(0, 2));
        assert_eq!(CellRef::parse("AA10").unwrap(), CellRef::new(9, 26));
        assert!(CellRef::parse("A0").is_err());
        assert!(CellRef::parse("12").is_err());
        assert!(CellRef::parse("C").is_err());
        assert!(CellRef::parse("C1x").is_err());
        assert!(CellRef::parse("A99999999999999999999999").is_err());
        assert_eq!(CellRef::new(9, 26).to_string(), "AA10");
    }

    #[test]
    fn test_overlong_column_is_rejected() {
        let err = CellRef::parse(&format!("{}1", "Z".repeat(40))).unwrap_err();
        assert!(matches!(err, SinkError::BadAnchor(_)));
        assert_eq!(CellRef::parse("XFD1").unwrap(), CellRef::new(0, 16_383));
    }

    #[test]
    fn test_pricing_table_column_order() {
        let row = PricingRow {
            trade_date: "20261018".into(),
            trade_time: "14:30:05".into(),
            underlying: "SPX".into(),
            underlying_price: Some(4501.0),
            option_ref: "SPX   20261218".into(),
            strike: 4500.0,
            call_ref: None,
            call_mid: None,
            put_ref: "SPX   261218P04500000".into(),
            put_mid: 8.5,
        };
        let table = pricing_table(&[row]);
        assert!(table.header.is_none());
        assert_eq!(table.width(), PRICING_COLUMNS.len());
        let rendered: Vec<Vec<String>> = table.rendered_rows().collect();
        assert_eq!(
            rendered[0],
            vec!["20261018", "14:30:05", "SPX", "4501", "SPX   20261218", "4500", "", "", "SPX   261218P04500000", "8.5"]
        );
    }
}
