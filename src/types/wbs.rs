//! Work breakdown structures
//!
//! Each MoU files its tasks under a two-level WBS: an L2 area and an L3
//! item inside it. Dropdown values outside the tree are rejected.

use serde::Serialize;
use std::collections::BTreeMap;

use super::record::RecordBody;

/// The L2/L3 tree of one MoU
#[derive(Debug)]
pub struct WbsTree {
    pub l2: &'static [(&'static str, &'static [&'static str])],
}

const MO: WbsTree = WbsTree {
    l2: &[
        (
            "2.1 Program Coordination",
            &[
                "2.1.0 Program Coordination",
                "2.1.1 Administration",
                "2.1.2 Engineering and R&D Support",
                "2.1.3 USAP Support & Safety",
                "2.1.4 Education & Outreach",
                "2.1.5 Communications",
            ],
        ),
        (
            "2.2 Detector Operations & Maintenance (Online)",
            &[
                "2.2.0 Detector Operations & Maintenance",
                "2.2.1 Run Coordination",
                "2.2.2 Data Acquisition",
                "2.2.3 Online Filter (PnF)",
                "2.2.4 Detector Monitoring",
                "2.2.5 Experiment Control",
                "2.2.6 Surface Detectors",
                "2.2.7 Supernova System",
                "2.2.8 Real-Time Alerts",
                "2.2.9 SPS/SPTS",
            ],
        ),
        (
            "2.3 Computing & Data Management Services",
            &[
                "2.3.0 Computing & Data Management Services",
                "2.3.1 Data Storage & Transfer",
                "2.3.2 Core Data Center Infrastructure",
                "2.3.3 Central Computing Resources",
                "2.3.4 Distributed Computing Resources",
            ],
        ),
        (
            "2.4 Data Processing & Simulation Services",
            &[
                "2.4.0 Data Processing & Simulation Services",
                "2.4.1 Offline Data Production",
                "2.4.2 Simulation Production",
                "2.4.3 Public Data Products",
            ],
        ),
        (
            "2.5 Software",
            &[
                "2.5.0 Software",
                "2.5.1 Core Software",
                "2.5.2 Simulation Software",
                "2.5.3 Reconstruction",
                "2.5.4 Science Support Tools",
                "2.5.5 Software Development Infrastructure",
            ],
        ),
        (
            "2.6 Calibration",
            &[
                "2.6.0 Calibration",
                "2.6.1 Detector Calibration",
                "2.6.2 Ice Properties",
            ],
        ),
    ],
};

const UPGRADE: WbsTree = WbsTree {
    l2: &[
        (
            "1.1 Project Office",
            &[
                "1.1.1 Project Management",
                "1.1.2 Project Controls (EVMS)",
                "1.1.3 Quality and Safety Management",
                "1.1.4 Polar Operations",
                "1.1.5 Project Engineering",
            ],
        ),
        (
            "1.2 Gen2 Enhanced Hot Water Drill",
            &[
                "1.2.1 Drill Management & Systems Engineering",
                "1.2.2 Thermal Plant",
                "1.2.3 Tower Operations Site",
                "1.2.4 Computing and Control System",
                "1.2.5 Electrical Generation and Distribution System",
                "1.2.6 Water Handling Systems",
                "1.2.7 Support Equipment",
                "1.2.8 Drill Field Seasons",
                "1.2.9 String Installation",
            ],
        ),
        (
            "1.3 Deep Ice Sensor Modules",
            &[
                "1.3.1 Multi-PMT Digital Optical Module (mDOM)",
                "1.3.2 D-Egg",
                "1.3.3 PDOM",
                "1.3.4 Ice Comms Module",
                "1.3.5 Special Devices",
            ],
        ),
        (
            "1.4 Comms, Power, and Timing (CPT)",
            &[
                "1.4.1 Downhole Cable Assemblies",
                "1.4.2 Surface Junction Boxes",
                "1.4.3 FieldHub",
                "1.4.4 CPT Central Infrastructure",
                "1.4.5 Northern Test System (NTS)",
            ],
        ),
        (
            "1.5 Characterization & Calibration",
            &[
                "1.5.1 Module Calibration",
                "1.5.2 Calibration Assemblies",
                "1.5.3 Array Calibration",
                "1.5.4 Calibration Management",
            ],
        ),
        (
            "1.6 M&O Data Systems Integration",
            &[
                "1.6.1 Online Software",
                "1.6.2 Offline Software",
                "1.6.3 Simulation Software",
                "1.6.4 Computing Infrastructure",
            ],
        ),
    ],
};

/// Tree of a MoU, `None` for MoUs without a fixed breakdown
pub fn wbs_tree(mou: &str) -> Option<&'static WbsTree> {
    match mou {
        "mo" => Some(&MO),
        "upgrade" => Some(&UPGRADE),
        _ => None,
    }
}

/// Serializable form of a tree for clients building dropdowns
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WbsMenus {
    pub l2_values: Vec<String>,
    pub l3_values_by_l2: BTreeMap<String, Vec<String>>,
}

impl WbsTree {
    fn l3_of(&self, l2: &str) -> Option<&'static [&'static str]> {
        self.l2
            .iter()
            .find(|(name, _)| *name == l2)
            .map(|(_, l3)| *l3)
    }

    /// Check a body's L2/L3 pair
    ///
    /// Blank values pass. An L3 without an L2 must belong to some L2.
    pub fn check(&self, body: &RecordBody) -> Result<(), String> {
        let l2 = body.wbs_l2.as_deref().map(str::trim).filter(|v| !v.is_empty());
        let l3 = body.wbs_l3.as_deref().map(str::trim).filter(|v| !v.is_empty());

        let items = match l2 {
            Some(l2) => Some(
                self.l3_of(l2)
                    .ok_or_else(|| format!("unknown WBS L2 '{}'", l2))?,
            ),
            None => None,
        };

        if let Some(l3) = l3 {
            let known = match items {
                Some(items) => items.contains(&l3),
                None => self.l2.iter().any(|(_, items)| items.contains(&l3)),
            };
            if !known {
                return Err(match l2 {
                    Some(l2) => format!("WBS L3 '{}' is not under '{}'", l3, l2),
                    None => format!("unknown WBS L3 '{}'", l3),
                });
            }
        }
        Ok(())
    }

    pub fn menus(&self) -> WbsMenus {
        WbsMenus {
            l2_values: self.l2.iter().map(|(l2, _)| l2.to_string()).collect(),
            l3_values_by_l2: self
                .l2
                .iter()
                .map(|(l2, l3)| (l2.to_string(), l3.iter().map(|v| v.to_string()).collect()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(l2: Option<&str>, l3: Option<&str>) -> RecordBody {
        let mut body = RecordBody::task("InstA", 2023);
        body.wbs_l2 = l2.map(String::from);
        body.wbs_l3 = l3.map(String::from);
        body
    }

    #[test]
    fn test_check_l2_and_l3() {
        let tree = wbs_tree("mo").unwrap();
        assert!(tree.check(&body(None, None)).is_ok());
        assert!(tree
            .check(&body(Some("2.5 Software"), Some("2.5.1 Core Software")))
            .is_ok());
        assert!(tree.check(&body(Some("9.9 Made Up"), None)).is_err());
        assert!(tree
            .check(&body(Some("2.6 Calibration"), Some("2.5.1 Core Software")))
            .is_err());
        // Orphan L3 must exist somewhere
        assert!(tree.check(&body(None, Some("2.6.2 Ice Properties"))).is_ok());
        assert!(tree.check(&body(Some(" "), Some("1.3.2 D-Egg"))).is_err());
    }

    #[test]
    fn test_trees_per_mou() {
        assert!(wbs_tree("upgrade")
            .unwrap()
            .check(&body(Some("1.3 Deep Ice Sensor Modules"), Some("1.3.2 D-Egg")))
            .is_ok());
        assert!(wbs_tree("other").is_none());

        let menus = wbs_tree("mo").unwrap().menus();
        assert_eq!(menus.l2_values.len(), 6);
        assert_eq!(menus.l3_values_by_l2["2.6 Calibration"].len(), 3);
    }
}
