use std::path::{Path, PathBuf};

use ahash::AHashMap;
use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{CellRef, SheetSink, SinkError, SinkResult, Table};

#[derive(Debug, Default)]
struct Sheet {
    grid: Vec<Vec<String>>,
    // (height, width) of the last block written at each anchor
    written: AHashMap<CellRef, (usize, usize)>,
}

impl Sheet {
    fn set(&mut self, row: usize, col: usize, value: String) {
        if self.grid.len() <= row {
            self.grid.resize_with(row + 1, Vec::new);
        }
        let line = &mut self.grid[row];
        if line.len() <= col {
            line.resize(col + 1, String::new());
        }
        line[col] = value;
    }

    fn clear_block(&mut self, anchor: CellRef, height: usize, width: usize) {
        for row in anchor.row..anchor.row + height {
            let Some(line) = self.grid.get_mut(row) else {
                break;
            };
            for cell in line.iter_mut().skip(anchor.col).take(width) {
                cell.clear();
            }
        }
    }

    fn trimmed(&self) -> Vec<&[String]> {
        let mut rows: Vec<&[String]> = self
            .grid
            .iter()
            .map(|line| {
                let used = line.iter().rposition(|c| !c.is_empty()).map_or(0, |i| i + 1);
                &line[..used]
            })
            .collect();
        while rows.last().is_some_and(|r| r.is_empty()) {
            rows.pop();
        }
        rows
    }
}

/// A directory of `<sheet>.csv` files standing in for a spreadsheet workbook.
///
/// Each write rewrites the whole sheet file through a temp file and rename,
/// so readers never observe a half-written table.
#[derive(Debug)]
pub struct CsvWorkbook {
    dir: PathBuf,
    sheets: AHashMap<String, Sheet>,
}

impl CsvWorkbook {
    pub async fn open(dir: impl AsRef<Path>) -> SinkResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir, sheets: AHashMap::new() })
    }

    pub fn sheet_path(&self, sheet: &str) -> PathBuf {
        self.dir.join(format!("{sheet}.csv"))
    }

    /// Current value of one cell, empty cells included.
    pub fn cell(&self, sheet: &str, at: CellRef) -> Option<&str> {
        self.sheets.get(sheet)?.grid.get(at.row)?.get(at.col).map(String::as_str)
    }

    async fn load(&self, sheet: &str) -> SinkResult<Sheet> {
        let bytes = match tokio::fs::read(self.sheet_path(sheet)).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Sheet::default()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes.as_slice());
        let mut grid = Vec::new();
        for record in reader.records() {
            grid.push(record?.iter().map(str::to_string).collect());
        }
        Ok(Sheet { grid, written: AHashMap::new() })
    }

    async fn flush(&self, sheet: &str, data: &Sheet) -> SinkResult<()> {
        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(Vec::new());
        for row in data.trimmed() {
            if row.is_empty() {
                // a lone empty field keeps blank lines from collapsing
                writer.write_record([""])?;
            } else {
                writer.write_record(row)?;
            }
        }
        let bytes = writer.into_inner().map_err(|e| SinkError::Io(e.into_error()))?;

        let path = self.sheet_path(sheet);
        let tmp = path.with_extension("csv.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl SheetSink for CsvWorkbook {
    #[instrument(level = "debug", skip(self, table), fields(rows = table.rows.len()))]
    async fn replace_range(&mut self, sheet: &str, anchor: CellRef, table: &Table) -> SinkResult<()> {
        if sheet.is_empty() || sheet.contains(['/', '\\']) || sheet.starts_with('.') {
            return Err(SinkError::BadSheet(sheet.to_string()));
        }

        let mut data = match self.sheets.remove(sheet) {
            Some(s) => s,
            None => self.load(sheet).await?,
        };

        if let Some((height, width)) = data.written.get(&anchor).copied() {
            data.clear_block(anchor, height, width);
        }
        for (i, row) in table.rendered_rows().enumerate() {
            for (j, value) in row.into_iter().enumerate() {
                data.set(anchor.row + i, anchor.col + j, value);
            }
        }
        data.written.insert(anchor, (table.height(), table.width()));

        let flushed = self.flush(sheet, &data).await;
        self.sheets.insert(sheet.to_string(), data);
        flushed?;
        debug!(sheet, %anchor, "range replaced");
        Ok(())
    }
}
