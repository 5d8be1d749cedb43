// Interest-rate term structure published next to the option feed.
//
// One HTTP fetch at startup: the first HTML table on the page lists each tenor
// by `Name` with its quote in `Kurs`.

use std::fmt;
use std::time::Duration;

use chrono::NaiveDate;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::sink::{Cell, Table};

pub const RATE_DATE_FORMAT: &str = "%d.%m.%y";

#[derive(Debug, Error)]
pub enum RateError {
    #[error("rate request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid extraction pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("no table found in rate page")]
    NoTable,
    #[error("rate table has no {0:?} column")]
    MissingColumn(&'static str),
    #[error("cannot read rate {value:?} for {name:?}")]
    BadValue { name: String, value: String },
    #[error("tenor {0} missing from rate table")]
    MissingTenor(Tenor),
}

pub type RateResult<T> = Result<T, RateError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tenor {
    Overnight,
    Week1,
    Month1,
    Month2,
    Month3,
    Month6,
    Month12,
}

impl Tenor {
    pub const ALL: [Tenor; 7] = [
        Tenor::Overnight,
        Tenor::Week1,
        Tenor::Month1,
        Tenor::Month2,
        Tenor::Month3,
        Tenor::Month6,
        Tenor::Month12,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Tenor::Overnight => "Libor USD Overnight",
            Tenor::Week1 => "Libor USD 1 Week",
            Tenor::Month1 => "Libor USD 1 Month",
            Tenor::Month2 => "Libor USD 2 Months",
            Tenor::Month3 => "Libor USD 3 Months",
            Tenor::Month6 => "Libor USD 6 Months",
            Tenor::Month12 => "Libor USD 12 Months",
        }
    }
}

impl fmt::Display for Tenor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Raw quote as scraped, before scaling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateQuote {
    pub tenor: Tenor,
    pub raw: f64,
}

/// Execution date plus the seven tenors, each scaled by 100.
#[derive(Debug, Clone, PartialEq)]
pub struct RateRow {
    pub date: NaiveDate,
    pub values: [f64; 7],
}

impl RateRow {
    pub fn from_quotes(date: NaiveDate, quotes: &[RateQuote]) -> RateResult<Self> {
        let mut values = [0.0; 7];
        for (slot, tenor) in values.iter_mut().zip(Tenor::ALL) {
            let quote = quotes
                .iter()
                .find(|q| q.tenor == tenor)
                .ok_or(RateError::MissingTenor(tenor))?;
            *slot = quote.raw * 100.0;
        }
        Ok(Self { date, values })
    }

    pub fn date_label(&self) -> String {
        self.date.format(RATE_DATE_FORMAT).to_string()
    }

    pub fn header() -> Vec<&'static str> {
        std::iter::once("Date").chain(Tenor::ALL.iter().map(Tenor::label)).collect()
    }

    pub fn to_table(&self) -> Table {
        let row = std::iter::once(Cell::from(self.date_label()))
            .chain(self.values.iter().map(|v| Cell::from(*v)))
            .collect();
        Table::new(vec![row]).with_header(Self::header())
    }
}

/// Pulls `Name`/`Kurs` pairs out of the first HTML table on a page.
pub struct RateTableParser {
    table: Regex,
    row: Regex,
    cell: Regex,
    tag: Regex,
    tenor: Regex,
}

impl RateTableParser {
    pub fn new() -> RateResult<Self> {
        Ok(Self {
            table: Regex::new(r"(?is)<table\b.*?</table>")?,
            row: Regex::new(r"(?is)<tr\b[^>]*>(.*?)</tr>")?,
            cell: Regex::new(r"(?is)<t[hd]\b[^>]*>(.*?)</t[hd]>")?,
            tag: Regex::new(r"(?s)<[^>]*>")?,
            tenor: Regex::new(r"(?i)(\d+)\s*(woche|week|monat|month)")?,
        })
    }

    fn text(&self, html: &str) -> String {
        let stripped = self.tag.replace_all(html, " ");
        let decoded = stripped.replace("&nbsp;", " ").replace("&amp;", "&");
        decoded.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Tenor named by a row label, in English or German.
    pub fn tenor(&self, name: &str) -> Option<Tenor> {
        if name.to_lowercase().contains("overnight") {
            return Some(Tenor::Overnight);
        }
        let caps = self.tenor.captures(name)?;
        let n: u32 = caps[1].parse().ok()?;
        let unit = caps[2].to_lowercase();
        match (n, unit.as_str()) {
            (1, "woche" | "week") => Some(Tenor::Week1),
            (1, "monat" | "month") => Some(Tenor::Month1),
            (2, "monat" | "month") => Some(Tenor::Month2),
            (3, "monat" | "month") => Some(Tenor::Month3),
            (6, "monat" | "month") => Some(Tenor::Month6),
            (12, "monat" | "month") => Some(Tenor::Month12),
            _ => None,
        }
    }

    pub fn parse(&self, html: &str) -> RateResult<Vec<RateQuote>> {
        let table = self.table.find(html).ok_or(RateError::NoTable)?;
        let mut rows = self.row.captures_iter(table.as_str()).map(|row| {
            self.cell
                .captures_iter(&row[1])
                .map(|c| self.text(&c[1]))
                .collect::<Vec<String>>()
        });

        let header = rows.next().ok_or(RateError::NoTable)?;
        let column = |name: &'static str| {
            header
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name))
                .ok_or(RateError::MissingColumn(name))
        };
        let name_col = column("Name")?;
        let kurs_col = column("Kurs")?;

        let mut quotes = Vec::new();
        for cells in rows {
            let (Some(name), Some(value)) = (cells.get(name_col), cells.get(kurs_col)) else {
                continue;
            };
            let Some(tenor) = self.tenor(name) else {
                debug!(%name, "skipping unrecognised rate row");
                continue;
            };
            let raw = decode_kurs(value).ok_or_else(|| RateError::BadValue {
                name: name.clone(),
                value: value.clone(),
            })?;
            quotes.push(RateQuote { tenor, raw });
        }
        Ok(quotes)
    }
}

/// Separators are dropped and the digits read in millionths.
pub fn decode_kurs(value: &str) -> Option<f64> {
    let digits: String = value.chars().filter(|c| c.is_ascii_digit() || *c == '-').collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<i64>().ok().map(|n| n as f64 / 1_000_000.0)
}

pub struct RateFetcher {
    client: reqwest::Client,
    url: String,
    parser: RateTableParser,
}

impl RateFetcher {
    pub fn new(url: &str) -> RateResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent("Mozilla/5.0 (X11; Linux x86_64)")
            .timeout(Duration::from_secs(20))
            .gzip(true)
            .build()?;
        Ok(Self { client, url: url.to_string(), parser: RateTableParser::new()? })
    }

    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn fetch(&self, today: NaiveDate) -> RateResult<RateRow> {
        info!("retrieving rates....");
        let html = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let quotes = self.parser.parse(&html)?;
        let row = RateRow::from_quotes(today, &quotes)?;
        info!(date = %row.date_label(), overnight = row.values[0], "rates downloaded");
        Ok(row)
    }
}
