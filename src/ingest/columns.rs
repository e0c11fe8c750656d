//! Spreadsheet and legacy document column names

pub const ID: &str = "_id";
pub const WBS_L2: &str = "WBS L2";
pub const WBS_L3: &str = "WBS L3";
pub const LABOR_CAT: &str = "Labor Cat.";
pub const US_NON_US: &str = "US / Non-US";
pub const INSTITUTION: &str = "Institution";
pub const NAMES: &str = "Names";
pub const NAME: &str = "Name";
pub const TASKS: &str = "Tasks";
pub const TASK_DESCRIPTION: &str = "Task Description";
pub const SOURCE_OF_FUNDS: &str = "Source of Funds (U.S. Only)";
pub const FTE: &str = "FTE";
pub const AMOUNT: &str = "Amount";
pub const FISCAL_YEAR: &str = "Fiscal Year";
pub const FY: &str = "FY";
pub const NSF_MO_CORE: &str = "NSF M&O Core";
pub const NSF_BASE_GRANTS: &str = "NSF Base Grants";
pub const US_IN_KIND: &str = "US In-Kind";
pub const NON_US_IN_KIND: &str = "Non-US In-Kind";
pub const GRAND_TOTAL: &str = "Grand Total";
pub const TOTAL_ROW_DESCRIPTION: &str = "Total-Row Description";
pub const TOTAL_OF: &str = "Total Of?";
pub const TIMESTAMP: &str = "Date & Time of Last Edit";
pub const EDITOR: &str = "Name of Last Editor";
pub const DELETED: &str = "deleted";

/// Columns the dashboard derives on the fly; accepted on input, never stored
pub const COMPUTED: &[&str] = &[
    US_NON_US,
    NSF_MO_CORE,
    NSF_BASE_GRANTS,
    US_IN_KIND,
    NON_US_IN_KIND,
    TOTAL_ROW_DESCRIPTION,
    TOTAL_OF,
];

/// Undo MongoDB key escaping (`.` is stored as `;`)
pub fn demongofy(key: &str) -> String {
    key.replace(';', ".")
}

/// A recognised spreadsheet column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Id,
    WbsL2,
    WbsL3,
    LaborCat,
    Institution,
    Names,
    Description,
    SourceOfFunds,
    Fte,
    Amount,
    FiscalYear,
    GrandTotal,
    UsNonUs,
    Timestamp,
    Editor,
    /// Derived column, dropped on ingest
    Computed,
}

impl Column {
    /// Classify a header cell, `None` when the column is unknown
    pub fn parse(header: &str) -> Option<Self> {
        let header = demongofy(header.trim());
        let is = |name: &str| header.eq_ignore_ascii_case(name);

        let column = if is(ID) {
            Self::Id
        } else if is(WBS_L2) {
            Self::WbsL2
        } else if is(WBS_L3) {
            Self::WbsL3
        } else if is(LABOR_CAT) || is("Labor Cat") || is("Labor Category") {
            Self::LaborCat
        } else if is(INSTITUTION) {
            Self::Institution
        } else if is(NAMES) || is(NAME) {
            Self::Names
        } else if is(TASK_DESCRIPTION) || is(TASKS) {
            Self::Description
        } else if is(SOURCE_OF_FUNDS) {
            Self::SourceOfFunds
        } else if is(FTE) {
            Self::Fte
        } else if is(AMOUNT) {
            Self::Amount
        } else if is(FISCAL_YEAR) || is(FY) {
            Self::FiscalYear
        } else if is(GRAND_TOTAL) {
            Self::GrandTotal
        } else if is(US_NON_US) {
            Self::UsNonUs
        } else if is(TIMESTAMP) {
            Self::Timestamp
        } else if is(EDITOR) {
            Self::Editor
        } else if COMPUTED.iter().any(|c| is(c)) {
            Self::Computed
        } else {
            return None;
        };
        Some(column)
    }
}
