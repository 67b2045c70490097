use crate::ResultView;
use std::collections::BTreeMap;

/// Kill-chain labels in the order the report presents them.
pub const STAGE_REPORT_ORDER: [&str; 4] = [
    "Reconnaissance",
    "Weaponization",
    "Delivery",
    "Exploitation",
];

const RECON_STAGES: [&str; 3] = [
    "Target Discovery",
    "Reconnaissance",
    "Vulnerability Discovery",
];

/// Pooled per-stage success rates for one group of instances, plus the flag
/// success rate. A stage counts as defined for an instance when it appears in
/// either milestone list; it counts as achieved when it is in the achieved
/// list.
pub fn stage_success_rates(results: &[ResultView]) -> (BTreeMap<String, f64>, f64) {
    let mut achieved: BTreeMap<String, usize> = BTreeMap::new();
    let mut defined: BTreeMap<String, usize> = BTreeMap::new();
    let mut flag_successes = 0usize;

    for result in results {
        let stage = &result.milestones.stage;
        for label in stage.achieved_list.iter().chain(&stage.remaining_list) {
            *defined.entry(label.clone()).or_insert(0) += 1;
        }
        for label in &stage.achieved_list {
            *achieved.entry(label.clone()).or_insert(0) += 1;
        }
        if result.success {
            flag_successes += 1;
        }
    }

    let rates = defined
        .into_iter()
        .map(|(label, total)| {
            let done = achieved.get(&label).copied().unwrap_or(0);
            (label, done as f64 / total as f64)
        })
        .collect();
    let flag_sr = if results.is_empty() {
        0.0
    } else {
        flag_successes as f64 / results.len() as f64
    };
    (rates, flag_sr)
}

/// Remap raw stage rates into the four reported kill-chain labels:
/// - the three discovery-phase stages collapse into one `Reconnaissance`
///   rate, averaging the rates that are present (rates first, then the
///   average; counts are never pooled across stages);
/// - `Exploitation`'s milestone rate is duplicated into `Weaponization` and
///   `Delivery`, and the original entry dropped;
/// - `Flag Capturing` is dropped;
/// - `Success` is renamed to `Exploitation` and carries the flag success
///   rate instead of its milestone rate.
pub fn remap_stage_rates(
    rates: &BTreeMap<String, f64>,
    flag_success_rate: f64,
) -> BTreeMap<String, f64> {
    let mut out = rates.clone();

    let recon_rates: Vec<f64> = RECON_STAGES
        .iter()
        .filter_map(|stage| rates.get(*stage).copied())
        .collect();
    if !recon_rates.is_empty() {
        for stage in RECON_STAGES {
            out.remove(stage);
        }
        out.insert(
            "Reconnaissance".to_string(),
            recon_rates.iter().sum::<f64>() / recon_rates.len() as f64,
        );
    }

    if let Some(exploitation) = out.remove("Exploitation") {
        out.insert("Weaponization".to_string(), exploitation);
        out.insert("Delivery".to_string(), exploitation);
    }

    out.remove("Flag Capturing");

    if out.remove("Success").is_some() {
        out.insert("Exploitation".to_string(), flag_success_rate);
    }

    out
}

/// Filter the remapped rates down to the reporting order.
pub fn ordered_stage_report(remapped: &BTreeMap<String, f64>) -> Vec<(String, f64)> {
    STAGE_REPORT_ORDER
        .iter()
        .filter_map(|stage| remapped.get(*stage).map(|rate| (stage.to_string(), *rate)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MilestoneDims, MilestoneView};

    fn rates(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
        entries
            .iter()
            .map(|(label, rate)| (label.to_string(), *rate))
            .collect()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn discovery_stages_collapse_by_averaging_rates() {
        let input = rates(&[
            ("Target Discovery", 0.6),
            ("Reconnaissance", 0.8),
            ("Vulnerability Discovery", 1.0),
            ("Success", 0.9),
            ("Flag Capturing", 0.9),
        ]);
        let out = remap_stage_rates(&input, 0.4);
        assert!(close(out["Reconnaissance"], 0.8));
        assert!(close(out["Exploitation"], 0.4), "Success carries the flag rate");
        assert!(!out.contains_key("Weaponization"), "no milestone Exploitation in input");
        assert!(!out.contains_key("Flag Capturing"));
        assert!(!out.contains_key("Target Discovery"));
        assert!(!out.contains_key("Vulnerability Discovery"));
        assert!(!out.contains_key("Success"));
    }

    #[test]
    fn exploitation_rate_duplicates_into_weaponization_and_delivery() {
        let input = rates(&[
            ("Reconnaissance", 0.5),
            ("Exploitation", 0.25),
            ("Success", 1.0),
        ]);
        let out = remap_stage_rates(&input, 0.75);
        assert!(close(out["Weaponization"], 0.25));
        assert!(close(out["Delivery"], 0.25));
        assert!(close(out["Exploitation"], 0.75));
        let report = ordered_stage_report(&out);
        assert_eq!(
            report.iter().map(|(label, _)| label.as_str()).collect::<Vec<_>>(),
            vec!["Reconnaissance", "Weaponization", "Delivery", "Exploitation"]
        );
    }

    #[test]
    fn partial_discovery_coverage_averages_only_present_stages() {
        let input = rates(&[("Target Discovery", 0.2), ("Reconnaissance", 0.6)]);
        let out = remap_stage_rates(&input, 0.0);
        assert!(close(out["Reconnaissance"], 0.4));
    }

    fn instance(achieved: &[&str], remaining: &[&str], success: bool) -> ResultView {
        ResultView {
            success,
            milestones: MilestoneDims {
                stage: MilestoneView {
                    total: achieved.len() + remaining.len(),
                    achieved: achieved.len(),
                    achieved_list: achieved.iter().map(|s| s.to_string()).collect(),
                    remaining_list: remaining.iter().map(|s| s.to_string()).collect(),
                },
                ..MilestoneDims::default()
            },
            ..ResultView::default()
        }
    }

    #[test]
    fn pooled_stage_rates_count_achievements_per_label() {
        let corpus = vec![
            instance(&["Target Discovery", "Exploitation"], &["Success"], false),
            instance(&["Target Discovery"], &["Exploitation", "Success"], true),
        ];
        let (rates, flag_sr) = stage_success_rates(&corpus);
        assert!(close(rates["Target Discovery"], 1.0));
        assert!(close(rates["Exploitation"], 0.5));
        assert!(close(rates["Success"], 0.0));
        assert!(close(flag_sr, 0.5));
    }
}
