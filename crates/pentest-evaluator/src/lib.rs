use pentest_core::catalog::Dimension;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

mod http;
pub use http::HttpJudge;

/// A judge-verifiable sub-goal. Stage milestones carry a `Label,description`
/// text; reporting uses only the label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Milestone {
    pub text: String,
    pub dimension: Dimension,
}

impl Milestone {
    pub fn command(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            dimension: Dimension::Command,
        }
    }

    pub fn stage(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            dimension: Dimension::Stage,
        }
    }

    pub fn stage_label(&self) -> &str {
        self.text.split(',').next().unwrap_or(&self.text).trim()
    }
}

/// Shared handle over one dimension's remaining milestones. The evaluator
/// removes entries through its handle; the harness snapshots through a clone
/// of the same handle. Entries are only ever removed, never re-added.
#[derive(Clone)]
pub struct MilestoneSet {
    inner: Arc<Mutex<Vec<Milestone>>>,
}

impl MilestoneSet {
    pub fn new(milestones: Vec<Milestone>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(milestones)),
        }
    }

    pub fn snapshot(&self) -> Vec<Milestone> {
        self.inner.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_indices(&self, indices: &[usize]) {
        let mut remaining = self.inner.lock().unwrap();
        let mut ordered: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|idx| *idx < remaining.len())
            .collect();
        ordered.sort_unstable();
        ordered.dedup();
        for idx in ordered.into_iter().rev() {
            remaining.remove(idx);
        }
    }
}

/// External classifier deciding which remaining milestones one step satisfies.
/// Returns indices into `remaining`.
pub trait MilestoneJudge: Send {
    fn satisfied(&self, step: &str, remaining: &[Milestone]) -> anyhow::Result<Vec<usize>>;
}

/// Tracks two independent monotonic milestone sets for one episode.
pub struct Evaluator {
    judge: Box<dyn MilestoneJudge>,
    command: MilestoneSet,
    stage: MilestoneSet,
}

impl Evaluator {
    pub fn new(
        judge: Box<dyn MilestoneJudge>,
        command_milestones: Vec<String>,
        stage_milestones: Vec<String>,
    ) -> Self {
        Self {
            judge,
            command: MilestoneSet::new(
                command_milestones.into_iter().map(Milestone::command).collect(),
            ),
            stage: MilestoneSet::new(
                stage_milestones.into_iter().map(Milestone::stage).collect(),
            ),
        }
    }

    pub fn command_milestones(&self) -> MilestoneSet {
        self.command.clone()
    }

    pub fn stage_milestones(&self) -> MilestoneSet {
        self.stage.clone()
    }

    /// Judge one rendered step against both dimensions and drop whatever the
    /// judge marks satisfied. A failed judge call leaves the sets untouched;
    /// the episode keeps going either way.
    pub fn evaluate_step(&self, step_text: &str) {
        for set in [&self.command, &self.stage] {
            let remaining = set.snapshot();
            if remaining.is_empty() {
                continue;
            }
            match self.judge.satisfied(step_text, &remaining) {
                Ok(indices) => set.remove_indices(&indices),
                Err(err) => {
                    tracing::warn!(
                        dimension = remaining[0].dimension.as_str(),
                        "milestone judge call failed, keeping set unchanged: {:#}",
                        err
                    );
                }
            }
        }
    }
}

/// Set difference by value, ordered as in `original`.
pub fn achieved(original: &[Milestone], remaining: &[Milestone]) -> Vec<Milestone> {
    original
        .iter()
        .filter(|milestone| !remaining.contains(milestone))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays a queue of canned verdicts, one per judged dimension call.
    struct ScriptedJudge {
        verdicts: Mutex<Vec<anyhow::Result<Vec<usize>>>>,
    }

    impl ScriptedJudge {
        fn new(verdicts: Vec<anyhow::Result<Vec<usize>>>) -> Box<Self> {
            Box::new(Self {
                verdicts: Mutex::new(verdicts),
            })
        }
    }

    impl MilestoneJudge for ScriptedJudge {
        fn satisfied(&self, _step: &str, _remaining: &[Milestone]) -> anyhow::Result<Vec<usize>> {
            self.verdicts.lock().unwrap().remove(0)
        }
    }

    fn command_list() -> Vec<String> {
        vec![
            "Scan the network".to_string(),
            "Identify the open service".to_string(),
            "Brute force the login".to_string(),
        ]
    }

    fn stage_list() -> Vec<String> {
        vec![
            "Target Discovery,locate the machine".to_string(),
            "Exploitation,gain a shell".to_string(),
        ]
    }

    #[test]
    fn evaluate_step_removes_exactly_the_judged_milestones() {
        let evaluator = Evaluator::new(
            ScriptedJudge::new(vec![Ok(vec![0, 2]), Ok(vec![])]),
            command_list(),
            stage_list(),
        );
        evaluator.evaluate_step("Action: nmap\nObservation: two hosts up");
        assert_eq!(
            evaluator
                .command_milestones()
                .snapshot()
                .into_iter()
                .map(|m| m.text)
                .collect::<Vec<_>>(),
            vec!["Identify the open service".to_string()]
        );
        assert_eq!(evaluator.stage_milestones().len(), 2);
    }

    #[test]
    fn remaining_sets_only_shrink() {
        let evaluator = Evaluator::new(
            ScriptedJudge::new(vec![
                Ok(vec![1]),
                Ok(vec![0]),
                Ok(vec![0]),
                Ok(vec![5]),
            ]),
            command_list(),
            stage_list(),
        );
        let mut previous_command = evaluator.command_milestones().len();
        let mut previous_stage = evaluator.stage_milestones().len();
        for step in ["first", "second"] {
            evaluator.evaluate_step(step);
            let command = evaluator.command_milestones().len();
            let stage = evaluator.stage_milestones().len();
            assert!(command <= previous_command);
            assert!(stage <= previous_stage);
            previous_command = command;
            previous_stage = stage;
        }
        assert_eq!(previous_command, 1);
        assert_eq!(previous_stage, 1);
    }

    #[test]
    fn judge_failure_leaves_both_sets_unchanged() {
        let evaluator = Evaluator::new(
            ScriptedJudge::new(vec![
                Err(anyhow::anyhow!("judge timeout")),
                Err(anyhow::anyhow!("judge timeout")),
            ]),
            command_list(),
            stage_list(),
        );
        evaluator.evaluate_step("Action: nmap\nObservation: two hosts up");
        assert_eq!(evaluator.command_milestones().len(), 3);
        assert_eq!(evaluator.stage_milestones().len(), 2);
    }

    #[test]
    fn out_of_range_indices_are_ignored() {
        let set = MilestoneSet::new(command_list().into_iter().map(Milestone::command).collect());
        set.remove_indices(&[7, 1, 1]);
        assert_eq!(
            set.snapshot()
                .into_iter()
                .map(|m| m.text)
                .collect::<Vec<_>>(),
            vec!["Scan the network".to_string(), "Brute force the login".to_string()]
        );
    }

    #[test]
    fn achieved_preserves_original_order() {
        let original: Vec<Milestone> =
            command_list().into_iter().map(Milestone::command).collect();
        let remaining = vec![original[1].clone()];
        let done = achieved(&original, &remaining);
        assert_eq!(
            done.into_iter().map(|m| m.text).collect::<Vec<_>>(),
            vec!["Scan the network".to_string(), "Brute force the login".to_string()]
        );
    }

    #[test]
    fn stage_label_is_the_text_before_the_comma() {
        let milestone = Milestone::stage("Vulnerability Discovery, find the SQLi entry point");
        assert_eq!(milestone.stage_label(), "Vulnerability Discovery");
        let plain = Milestone::stage("Success");
        assert_eq!(plain.stage_label(), "Success");
    }
}
