use std::io::Cursor;

use async_trait::async_trait;
use calamine::{Data, Reader, open_workbook_auto_from_rs};
use tracing::warn;

use super::{ExtractContext, ExtractedContent, ExtractionError, Extractor, SourceFile};

/// xlsx and legacy xls workbooks. Every sheet is rendered as CSV-like lines.
#[derive(Debug, Default)]
pub struct SpreadsheetExtractor;

/// Renders one sheet. Only the first `max_rows` rows are kept; `total_rows`
/// is reported in the truncation note.
pub fn render_sheet<I>(name: &str, rows: I, total_rows: usize, max_rows: usize) -> String
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut out = format!("Sheet: {name}");
    for row in rows.into_iter().take(max_rows) {
        out.push('\n');
        out.push_str(&row.join(","));
    }
    if total_rows > max_rows {
        out.push_str(&format!(
            "\n[Note: sheet truncated, showing first {max_rows} of {total_rows} total rows]"
        ));
    }
    out
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}

fn read_workbook(name: &str, data: Vec<u8>, max_rows: usize) -> Result<String, ExtractionError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(data)).map_err(|err| {
        ExtractionError::ProcessingFailed {
            kind: "spreadsheet",
            name: name.to_string(),
            detail: err.to_string(),
        }
    })?;

    let mut sheets = Vec::new();
    for sheet in workbook.sheet_names() {
        match workbook.worksheet_range(&sheet) {
            Ok(range) => {
                let rows = range
                    .rows()
                    .map(|row| row.iter().map(cell_text).collect::<Vec<_>>());
                sheets.push(render_sheet(&sheet, rows, range.height(), max_rows));
            }
            Err(err) => warn!(source = %name, sheet = %sheet, error = %err, "skipping unreadable sheet"),
        }
    }
    Ok(sheets.join("\n\n"))
}

#[async_trait]
impl Extractor for SpreadsheetExtractor {
    fn name(&self) -> &'static str {
        "spreadsheet"
    }

    async fn extract(
        &self,
        source: &SourceFile,
        cx: &ExtractContext,
    ) -> Result<ExtractedContent, ExtractionError> {
        let name = source.name.clone();
        let data = source.data.to_vec();
        let max_rows = cx.config.max_sheet_rows;
        let text = tokio::task::spawn_blocking(move || read_workbook(&name, data, max_rows))
            .await
            .map_err(|err| ExtractionError::ProcessingFailed {
                kind: "spreadsheet",
                name: source.name.clone(),
                detail: err.to_string(),
            })??;
        Ok(ExtractedContent::text(text))
    }
}
