//! Table layout served to dashboard clients
//!
//! Column order, dropdown menus and numeric columns per MoU, plus the
//! computed total rows a table read can append.

mod totals;

pub use totals::{total_rows, TotalKind, TotalRow};

use serde::Serialize;
use std::collections::BTreeMap;

use crate::directory::Institution;
use crate::ingest::columns::{
    AMOUNT, FISCAL_YEAR, FTE, GRAND_TOTAL, INSTITUTION, LABOR_CAT, NAMES, NON_US_IN_KIND,
    NSF_BASE_GRANTS, NSF_MO_CORE, SOURCE_OF_FUNDS, TASK_DESCRIPTION, TOTAL_OF, US_IN_KIND,
    US_NON_US, WBS_L2, WBS_L3,
};
use crate::types::{wbs_tree, WbsMenus, LABOR_CATEGORIES};

pub const US: &str = "US";
pub const NON_US: &str = "Non-US";

const COLUMNS: &[&str] = &[
    WBS_L2,
    WBS_L3,
    US_NON_US,
    INSTITUTION,
    LABOR_CAT,
    NAMES,
    TASK_DESCRIPTION,
    SOURCE_OF_FUNDS,
    FISCAL_YEAR,
    FTE,
    AMOUNT,
    TOTAL_OF,
    GRAND_TOTAL,
];

const NUMERICS: &[&str] = &[FISCAL_YEAR, FTE, AMOUNT, GRAND_TOTAL];

const MANDATORIES: &[&str] = &[INSTITUTION, FISCAL_YEAR];

/// Table layout of one MoU
#[derive(Debug, Clone, Serialize)]
pub struct TableConfig {
    pub columns: Vec<&'static str>,
    pub numerics: Vec<&'static str>,
    pub mandatories: Vec<&'static str>,
    pub labor_categories: Vec<&'static str>,
    /// Institution short names, sorted
    pub institutions: Vec<String>,
    /// Absent for MoUs without a fixed breakdown
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wbs: Option<WbsMenus>,
    /// Source-of-funds choices keyed by US / Non-US
    pub sources_of_funds: BTreeMap<&'static str, Vec<&'static str>>,
}

impl TableConfig {
    pub fn for_mou(mou: &str, institutions: &[Institution]) -> Self {
        let mut names: Vec<String> = institutions.iter().map(|i| i.short_name.clone()).collect();
        names.sort();
        names.dedup();

        Self {
            columns: COLUMNS.to_vec(),
            numerics: NUMERICS.to_vec(),
            mandatories: MANDATORIES.to_vec(),
            labor_categories: LABOR_CATEGORIES.to_vec(),
            institutions: names,
            wbs: wbs_tree(mou).map(|tree| tree.menus()),
            sources_of_funds: BTreeMap::from([
                (US, vec![NSF_MO_CORE, NSF_BASE_GRANTS, US_IN_KIND]),
                (NON_US, vec![NON_US_IN_KIND]),
            ]),
        }
    }
}
