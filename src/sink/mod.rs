pub mod types;
pub use types::*;
pub mod csv_workbook;
pub use csv_workbook::CsvWorkbook;
use async_trait::async_trait;

/// Anything that can hold named sheets of cells.
#[async_trait]
pub trait SheetSink: Send {
    /// Replace the whole range previously written at `anchor` with `table`.
    /// Cells from an earlier, larger write are cleared.
    async fn replace_range(&mut self, sheet: &str, anchor: CellRef, table: &Table) -> SinkResult<()>;
}
