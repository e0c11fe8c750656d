//! Tabular snapshot parsing
//!
//! A snapshot is a list of sheets. A sheet with an `Institution` column is
//! unified; a sheet without one belongs to the institution its name
//! resolves to. Column problems reject the whole snapshot, row problems
//! reject only the row.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

use super::columns::Column;
use crate::directory::Institution;
use crate::types::{Marker, MouError, RecordBody, RowId, TaskRecord, WbsTree};

/// One spreadsheet cell
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl Cell {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(s) => s.trim().is_empty(),
            Self::Number(_) | Self::Bool(_) => false,
        }
    }

    /// Trimmed text; numbers render without a trailing `.0`
    pub fn text(&self) -> Option<String> {
        match self {
            Self::Empty => None,
            Self::Text(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                Some(format!("{}", *n as i64))
            }
            Self::Number(n) => Some(n.to_string()),
            Self::Bool(b) => Some(b.to_string()),
        }
    }

    pub fn number(&self) -> Result<Option<f64>, String> {
        match self {
            Self::Empty => Ok(None),
            Self::Number(n) => Ok(Some(*n)),
            Self::Text(s) if s.trim().is_empty() => Ok(None),
            Self::Text(s) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| format!("'{}' is not a number", s.trim())),
            Self::Bool(b) => Err(format!("'{}' is not a number", b)),
        }
    }
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<f64> for Cell {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

/// One worksheet: a header row and data rows
#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub name: String,
    pub header: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

/// A parsed spreadsheet
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TabularSnapshot {
    pub sheets: Vec<Sheet>,
}

/// A row dropped during ingestion
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowRejection {
    pub sheet: String,
    /// Spreadsheet row number; the header is row 1
    pub row: usize,
    pub reason: String,
}

/// Validated records plus the rows that did not make it
#[derive(Debug, Clone, Default)]
pub struct TabularBatch {
    pub records: Vec<TaskRecord>,
    pub rejected: Vec<RowRejection>,
}

static EMPTY: Cell = Cell::Empty;

struct SheetLayout {
    columns: Vec<Option<Column>>,
    unified: bool,
}

impl SheetLayout {
    fn of(sheet: &Sheet) -> Result<Self, MouError> {
        let mut columns = Vec::with_capacity(sheet.header.len());
        for header in &sheet.header {
            if header.trim().is_empty() {
                columns.push(None);
                continue;
            }
            let column = Column::parse(header).ok_or_else(|| {
                MouError::MalformedSnapshot(format!(
                    "unknown column '{}' in sheet '{}'",
                    header.trim(),
                    sheet.name
                ))
            })?;
            columns.push(Some(column));
        }

        let has = |c: Column| columns.contains(&Some(c));
        if !has(Column::FiscalYear) {
            return Err(MouError::MalformedSnapshot(format!(
                "sheet '{}' has no Fiscal Year column",
                sheet.name
            )));
        }
        if !has(Column::Fte) && !has(Column::Amount) {
            return Err(MouError::MalformedSnapshot(format!(
                "sheet '{}' needs an FTE or Amount column",
                sheet.name
            )));
        }
        let unified = has(Column::Institution);

        Ok(Self { columns, unified })
    }

    fn cell<'a>(&self, row: &'a [Cell], column: Column) -> &'a Cell {
        self.columns
            .iter()
            .position(|c| *c == Some(column))
            .and_then(|i| row.get(i))
            .unwrap_or(&EMPTY)
    }

    /// Rows with nothing beyond the WBS and US/Non-US columns are blank
    fn has_data(&self, row: &[Cell]) -> bool {
        self.columns.iter().zip(row).any(|(column, cell)| {
            !matches!(
                column,
                None | Some(Column::WbsL2 | Column::WbsL3 | Column::UsNonUs)
            ) && !cell.is_empty()
        })
    }

    fn is_total_row(&self, row: &[Cell]) -> bool {
        [Column::WbsL2, Column::WbsL3, Column::Institution, Column::UsNonUs]
            .into_iter()
            .filter_map(|c| self.cell(row, c).text())
            .any(|text| text.to_ascii_lowercase().contains("total"))
    }
}

/// Turn a snapshot into validated records
///
/// `institutions` is the directory listing used to resolve institution
/// values; rows naming anything else are rejected, as are rows whose WBS
/// values fall outside `wbs`.
pub fn parse_tabular(
    snapshot: &TabularSnapshot,
    institutions: &[Institution],
    wbs: Option<&WbsTree>,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<TabularBatch, MouError> {
    let layouts = snapshot
        .sheets
        .iter()
        .map(SheetLayout::of)
        .collect::<Result<Vec<_>, _>>()?;

    let mut batch = TabularBatch::default();
    let mut seen_ids = HashSet::new();
    let marker = Marker::loaded(actor, now);

    for (sheet, layout) in snapshot.sheets.iter().zip(&layouts) {
        for (index, row) in sheet.rows.iter().enumerate() {
            let row_number = index + 2;
            if !layout.has_data(row) || layout.is_total_row(row) {
                continue;
            }

            let reject = |reason: String| RowRejection {
                sheet: sheet.name.clone(),
                row: row_number,
                reason,
            };

            let record = match build_record(sheet, layout, row, institutions, wbs, &marker) {
                Ok(record) => record,
                Err(reason) => {
                    batch.rejected.push(reject(reason));
                    continue;
                }
            };

            if seen_ids.contains(&record.row_id) {
                batch
                    .rejected
                    .push(reject(format!("duplicate row id '{}'", record.row_id)));
                continue;
            }
            seen_ids.insert(record.row_id.clone());
            batch.records.push(record);
        }
    }

    debug!(
        sheets = snapshot.sheets.len(),
        records = batch.records.len(),
        rejected = batch.rejected.len(),
        "Tabular snapshot parsed"
    );
    Ok(batch)
}

fn build_record(
    sheet: &Sheet,
    layout: &SheetLayout,
    row: &[Cell],
    institutions: &[Institution],
    wbs: Option<&WbsTree>,
    marker: &Marker,
) -> Result<TaskRecord, String> {
    let named = if layout.unified {
        layout
            .cell(row, Column::Institution)
            .text()
            .ok_or("missing Institution")?
    } else {
        sheet.name.trim().to_string()
    };
    let institution = institutions
        .iter()
        .find(|inst| inst.matches_name(&named))
        .ok_or_else(|| format!("unknown institution '{}'", named))?;

    let fiscal_year = match layout.cell(row, Column::FiscalYear).number()? {
        Some(y) if y.fract() == 0.0 && y.abs() < i32::MAX as f64 => y as i32,
        Some(y) => return Err(format!("'{}' is not a fiscal year", y)),
        None => return Err("missing Fiscal Year".into()),
    };

    let mut body = RecordBody::task(&institution.short_name, fiscal_year);
    body.fte = layout.cell(row, Column::Fte).number()?;
    body.amount = layout.cell(row, Column::Amount).number()?;
    if body.fte.is_none() {
        body.fte = layout.cell(row, Column::GrandTotal).number()?;
    }
    body.labor_category = layout.cell(row, Column::LaborCat).text();
    body.wbs_l2 = layout.cell(row, Column::WbsL2).text();
    body.wbs_l3 = layout.cell(row, Column::WbsL3).text();
    body.names = layout.cell(row, Column::Names).text();
    body.description = layout.cell(row, Column::Description).text();
    body.source_of_funds = layout.cell(row, Column::SourceOfFunds).text();
    body.validate()?;
    if let Some(tree) = wbs {
        tree.check(&body)?;
    }

    let row_id = layout
        .cell(row, Column::Id)
        .text()
        .map(RowId::from)
        .unwrap_or_else(RowId::generate);

    Ok(TaskRecord::new(row_id, body, marker.clone()))
}

#[cfg(test)]
pub(crate) fn sheet(name: &str, header: &[&str], rows: Vec<Vec<Cell>>) -> Sheet {
    Sheet {
        name: name.to_string(),
        header: header.iter().map(|h| h.to_string()).collect(),
        rows,
    }
}
