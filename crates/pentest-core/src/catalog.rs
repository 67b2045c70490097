use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const PER_ITERATION_SECONDS: u64 = 20;

/// One benchmark task: the brief given to the agent, the ground-truth flag
/// and the identifier of the machine hosting it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskInstance {
    pub task: String,
    pub flag: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Command,
    Stage,
}

impl Dimension {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Stage => "stage",
        }
    }
}

/// Step budget for one (level, category) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryPlan {
    pub level: String,
    pub category: String,
    pub num_instances: usize,
    pub max_iterations: usize,
}

/// The published benchmark composition: four in-vitro categories at a
/// 30-step budget and the real-world CVE set at 60 steps.
pub fn benchmark_plan() -> Vec<CategoryPlan> {
    let plan = [
        ("in-vitro", "access_control", 5, 30),
        ("in-vitro", "network_security", 6, 30),
        ("in-vitro", "cryptography", 4, 30),
        ("in-vitro", "web_security", 7, 30),
        ("real-world", "cve", 11, 60),
    ];
    plan.iter()
        .map(|(level, category, num_instances, max_iterations)| CategoryPlan {
            level: level.to_string(),
            category: category.to_string(),
            num_instances: *num_instances,
            max_iterations: *max_iterations,
        })
        .collect()
}

pub fn category_plan(level: &str, category: &str) -> Result<CategoryPlan> {
    benchmark_plan()
        .into_iter()
        .find(|plan| plan.level == level && plan.category == category)
        .ok_or_else(|| anyhow!("unknown benchmark category: {}/{}", level, category))
}

/// Load every task for one level, keyed by category. The catalog file is
/// `<data_root>/<level>/games.json`, a JSON object mapping category names to
/// ordered task arrays.
pub fn load_tasks(data_root: &Path, level: &str) -> Result<BTreeMap<String, Vec<TaskInstance>>> {
    let path = data_root.join(level).join("games.json");
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read task catalog {}", path.display()))?;
    let games: BTreeMap<String, Vec<TaskInstance>> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid task catalog {}", path.display()))?;
    Ok(games)
}

pub fn load_task(
    data_root: &Path,
    level: &str,
    category: &str,
    instance_idx: usize,
) -> Result<TaskInstance> {
    let games = load_tasks(data_root, level)?;
    let instances = games
        .get(category)
        .ok_or_else(|| anyhow!("no category '{}' in level '{}'", category, level))?;
    instances
        .get(instance_idx)
        .cloned()
        .ok_or_else(|| {
            anyhow!(
                "instance {} out of range for {}/{} ({} instances)",
                instance_idx,
                level,
                category,
                instances.len()
            )
        })
}

/// Milestone lists live one-per-line under
/// `<data_root>/milestones/<dimension>/<level>/<category>/instance_<idx>.txt`.
/// Blank lines are ignored; order is preserved.
pub fn load_milestones(
    data_root: &Path,
    dimension: Dimension,
    level: &str,
    category: &str,
    instance_idx: usize,
) -> Result<Vec<String>> {
    let path = data_root
        .join("milestones")
        .join(dimension.as_str())
        .join(level)
        .join(category)
        .join(format!("instance_{}.txt", instance_idx));
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read milestone list {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_data_root(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        std::env::temp_dir().join(format!("pentest_catalog_{}_{}", label, nanos))
    }

    #[test]
    fn plan_matches_published_budgets() {
        let plan = category_plan("real-world", "cve").expect("cve plan");
        assert_eq!(plan.num_instances, 11);
        assert_eq!(plan.max_iterations, 60);
        assert!(category_plan("in-vitro", "nope").is_err());
    }

    #[test]
    fn loads_tasks_and_milestones_from_disk() {
        let root = temp_data_root("load");
        fs::create_dir_all(root.join("in-vitro")).expect("level dir");
        fs::write(
            root.join("in-vitro").join("games.json"),
            r#"{"access_control": [{"task": "find the flag", "flag": "flag{0123456789}", "target": "vm0"}]}"#,
        )
        .expect("write catalog");
        let milestones_dir = root
            .join("milestones")
            .join("command")
            .join("in-vitro")
            .join("access_control");
        fs::create_dir_all(&milestones_dir).expect("milestone dir");
        fs::write(
            milestones_dir.join("instance_0.txt"),
            "Scan the network\n\nFind the open port\n",
        )
        .expect("write milestones");

        let task = load_task(&root, "in-vitro", "access_control", 0).expect("task");
        assert_eq!(task.target, "vm0");
        assert!(load_task(&root, "in-vitro", "access_control", 3).is_err());

        let milestones =
            load_milestones(&root, Dimension::Command, "in-vitro", "access_control", 0)
                .expect("milestones");
        assert_eq!(
            milestones,
            vec!["Scan the network".to_string(), "Find the open port".to_string()]
        );
        let _ = fs::remove_dir_all(root);
    }
}
