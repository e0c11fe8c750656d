//! Computed total rows
//!
//! Sums of FTE and amount per WBS L3, per WBS L2 and overall, optionally
//! split into US and Non-US institutions. Deleted rows and institution
//! summaries never count.

use serde::Serialize;
use std::collections::HashMap;

use super::{NON_US, US};
use crate::directory::Institution;
use crate::types::{wbs_tree, RecordBody, RecordKind, TaskRecord};

/// Level a total row sums over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TotalKind {
    L3,
    L2,
    Grand,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TotalRow {
    pub total_of: TotalKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wbs_l2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wbs_l3: Option<String>,
    /// `US` or `Non-US` for split totals
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<&'static str>,
    pub fte: f64,
    pub amount: f64,
    pub n_rows: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Sum {
    fte: f64,
    amount: f64,
    n_rows: usize,
}

impl Sum {
    fn add(&mut self, body: &RecordBody) {
        self.fte += body.fte.unwrap_or_default();
        self.amount += body.amount.unwrap_or_default();
        self.n_rows += 1;
    }
}

fn label(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Total rows for `records` of `mou`
///
/// Every L2/L3 of the MoU's tree gets a total unless `only_with_data` is
/// set, in which case totals over no rows are dropped. `institutions`
/// decides which records are US when `with_us_non_us` is set; unknown
/// institutions count as Non-US.
pub fn total_rows(
    mou: &str,
    records: &[TaskRecord],
    institutions: &[Institution],
    only_with_data: bool,
    with_us_non_us: bool,
) -> Vec<TotalRow> {
    let is_us: HashMap<&str, bool> = institutions
        .iter()
        .map(|inst| (inst.short_name.as_str(), inst.is_us))
        .collect();

    let mut order: Vec<(Option<&str>, Vec<Option<&str>>)> = wbs_tree(mou)
        .map(|tree| {
            tree.l2
                .iter()
                .map(|(l2, l3s)| (Some(*l2), l3s.iter().map(|l3| Some(*l3)).collect()))
                .collect()
        })
        .unwrap_or_default();

    let mut l3_sums: HashMap<(Option<&str>, Option<&str>), Sum> = HashMap::new();
    let mut l2_sums: HashMap<(Option<&str>, Option<&'static str>), Sum> = HashMap::new();
    let mut grand: HashMap<Option<&'static str>, Sum> = HashMap::new();

    for record in records
        .iter()
        .filter(|r| !r.deleted && r.body.kind == RecordKind::Task)
    {
        let body = &record.body;
        let l2 = label(&body.wbs_l2);
        let l3 = label(&body.wbs_l3);
        let region = if is_us.get(body.institution.as_str()).copied().unwrap_or(false) {
            US
        } else {
            NON_US
        };

        l3_sums.entry((l2, l3)).or_default().add(body);
        for split in [None, Some(region)] {
            l2_sums.entry((l2, split)).or_default().add(body);
            grand.entry(split).or_default().add(body);
        }

        match order.iter_mut().find(|(known, _)| *known == l2) {
            Some((_, l3s)) if !l3s.contains(&l3) => l3s.push(l3),
            Some(_) => {}
            None => order.push((l2, vec![l3])),
        }
    }

    let mut rows = Vec::new();
    let mut emit = |total_of: TotalKind,
                    l2: Option<&str>,
                    l3: Option<&str>,
                    region: Option<&'static str>,
                    sum: Option<&Sum>| {
        let sum = sum.copied().unwrap_or_default();
        if only_with_data && sum.n_rows == 0 {
            return;
        }
        rows.push(TotalRow {
            total_of,
            wbs_l2: l2.map(String::from),
            wbs_l3: l3.map(String::from),
            region,
            fte: sum.fte,
            amount: sum.amount,
            n_rows: sum.n_rows,
        });
    };

    for (l2, l3s) in &order {
        for l3 in l3s.iter().filter(|l3| l3.is_some()) {
            emit(TotalKind::L3, *l2, *l3, None, l3_sums.get(&(*l2, *l3)));
        }
        if with_us_non_us {
            for region in [US, NON_US] {
                emit(TotalKind::L2, *l2, None, Some(region), l2_sums.get(&(*l2, Some(region))));
            }
        }
        emit(TotalKind::L2, *l2, None, None, l2_sums.get(&(*l2, None)));
    }
    if with_us_non_us {
        for region in [US, NON_US] {
            emit(TotalKind::Grand, None, None, Some(region), grand.get(&Some(region)));
        }
    }
    emit(TotalKind::Grand, None, None, None, grand.get(&None));

    rows
}
