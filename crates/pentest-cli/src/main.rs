use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use pentest_core::catalog::{category_plan, TaskInstance, PER_ITERATION_SECONDS};
use pentest_driver::{ChannelConfig, PentestDriver, SubprocessChannel};
use pentest_evaluator::{HttpJudge, MilestoneJudge};
use pentest_harness::{
    run_category, AgentController, CategoryOptions, EpisodeFactory, ProcessController,
};
use pentest_metrics::{
    aggregate_log_root, command_frequency, load_results, ordered_stage_report, remap_stage_rates,
    report_table, stage_success_rates, RollupRow,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pentest-bench", version, about = "Pentest benchmark runner and reporter")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct RunArgs {
    #[arg(long)]
    level: String,
    #[arg(long)]
    category: String,
    #[arg(long)]
    data_root: PathBuf,
    #[arg(long)]
    log_root: PathBuf,
    /// Agent command line, whitespace-split (e.g. "python3 agent.py")
    #[arg(long)]
    agent: String,
    /// Model label recorded in result files
    #[arg(long, default_value = "unspecified")]
    model: String,
    /// JSON file with the environment channel command templates
    #[arg(long)]
    env_config: Option<PathBuf>,
    /// Directory of environment-maintained session artifacts to preserve
    #[arg(long)]
    session_dir: Option<PathBuf>,
    #[arg(long)]
    judge_model: Option<String>,
    #[arg(long)]
    judge_base_url: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one benchmark instance
    Run {
        #[command(flatten)]
        args: RunArgs,
        #[arg(long)]
        instance: usize,
    },
    /// Run every instance of a category in order
    RunCategory {
        #[command(flatten)]
        args: RunArgs,
        #[arg(long)]
        instance: Option<usize>,
    },
    /// Aggregate result records under a log root into the summary table
    Report {
        log_root: PathBuf,
        /// Also print remapped kill-chain stage rates per group
        #[arg(long)]
        stages: bool,
        /// Also print command usage frequency
        #[arg(long)]
        commands: bool,
        #[arg(long)]
        json: bool,
    },
}

struct CliFactory {
    agent_command: Vec<String>,
    env_config: ChannelConfig,
    judge_key: String,
    judge_model: Option<String>,
    judge_base_url: Option<String>,
    max_iterations: usize,
}

impl EpisodeFactory for CliFactory {
    fn build(
        &mut self,
        task: &TaskInstance,
    ) -> Result<(
        PentestDriver,
        Box<dyn MilestoneJudge>,
        Box<dyn AgentController>,
    )> {
        let channel = Arc::new(SubprocessChannel::new(self.env_config.clone()));
        let driver = PentestDriver::new(task.clone(), channel);
        let mut judge = HttpJudge::new(self.judge_key.as_str())?;
        if let Some(model) = &self.judge_model {
            judge = judge.with_model(model.as_str());
        }
        if let Some(base_url) = &self.judge_base_url {
            judge = judge.with_base_url(base_url.as_str());
        }
        let controller = ProcessController::new(self.agent_command.clone(), self.max_iterations);
        Ok((driver, Box::new(judge), Box::new(controller)))
    }
}

fn load_channel_config(path: Option<&PathBuf>) -> Result<ChannelConfig> {
    let Some(path) = path else {
        return Ok(ChannelConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read channel config {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid channel config {}", path.display()))
}

fn run(args: &RunArgs, instance: Option<usize>) -> Result<()> {
    let judge_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| anyhow!("OPENAI_API_KEY must be set for milestone judging"))?;
    let agent_command: Vec<String> = args.agent.split_whitespace().map(String::from).collect();
    if agent_command.is_empty() {
        anyhow::bail!("--agent must name a command to run");
    }
    let plan = category_plan(&args.level, &args.category)?;
    let mut factory = CliFactory {
        agent_command,
        env_config: load_channel_config(args.env_config.as_ref())?,
        judge_key,
        judge_model: args.judge_model.clone(),
        judge_base_url: args.judge_base_url.clone(),
        max_iterations: plan.max_iterations,
    };
    let opts = CategoryOptions {
        log_root: args.log_root.clone(),
        data_root: args.data_root.clone(),
        level: args.level.clone(),
        category: args.category.clone(),
        model: args.model.clone(),
        per_iteration_secs: PER_ITERATION_SECONDS,
        instance_idx: instance,
        session_dir: args.session_dir.clone(),
    };
    let summary = run_category(&opts, &mut factory)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "{}/{}: {}/{} successful",
            summary.level, summary.category, summary.successful, summary.total_instances
        );
        for record in &summary.results {
            println!(
                "  [{}] {} success={} PR={}/{} steps={} state={}",
                record.instance_idx,
                record.target,
                record.success,
                record.milestones.command.achieved,
                record.milestones.command.total,
                record.iterations,
                record.final_state,
            );
        }
    }
    Ok(())
}

fn rate(value: f64) -> String {
    format!("{:.2}", value)
}

fn render_row(row: &RollupRow) -> String {
    format!(
        "{:<14} {:>5} {:>6} {:>6} {:>10} {:>9}",
        row.label,
        row.tasks,
        rate(row.sr),
        rate(row.pr),
        row.avg_steps
            .map(|steps| format!("{:.1}", steps))
            .unwrap_or_else(|| "-".to_string()),
        format!("{:.3}", row.avg_cost),
    )
}

fn report(log_root: &PathBuf, stages: bool, commands: bool, json: bool) -> Result<()> {
    let metrics = aggregate_log_root(log_root)?;
    if metrics.is_empty() {
        anyhow::bail!("no result records found under {}", log_root.display());
    }
    let table = report_table(&metrics);
    let results = load_results(log_root)?;

    if json {
        let rows: Vec<serde_json::Value> = metrics
            .iter()
            .map(|((level, category), m)| {
                serde_json::json!({
                    "level": level,
                    "category": category,
                    "total": m.total,
                    "sr": m.sr,
                    "overall_pr": m.overall_pr,
                    "failed_pr_avg": m.failed_pr_avg,
                    "failed_pr_min": m.failed_pr_min,
                    "failed_pr_max": m.failed_pr_max,
                    "avg_cost": m.avg_cost,
                    "avg_steps": m.avg_steps,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!(
        "{:<14} {:>5} {:>6} {:>6} {:>10} {:>9}",
        "", "Tasks", "SR", "PR", "Avg Steps", "Cost ($)"
    );
    for row in &table.categories {
        println!("{}", render_row(row));
    }
    if let Some(row) = &table.tot_in_vitro {
        println!("{}", render_row(row));
    }
    if let Some(row) = &table.real_world {
        println!("{}", render_row(row));
    }
    if let Some(row) = &table.grand_total {
        println!("{}", render_row(row));
    }

    if stages {
        for ((level, category), _) in &metrics {
            let group: Vec<_> = results
                .iter()
                .filter(|r| &r.level == level && &r.category == category)
                .cloned()
                .collect();
            let (raw_rates, flag_sr) = stage_success_rates(&group);
            if raw_rates.is_empty() {
                continue;
            }
            let remapped = remap_stage_rates(&raw_rates, flag_sr);
            println!("\nStage success rates for {}/{}:", level, category);
            for (stage, stage_rate) in ordered_stage_report(&remapped) {
                println!("  {:<16} {:>5.1}%", stage, stage_rate * 100.0);
            }
        }
    }

    if commands {
        println!("\nCommand usage:");
        for (command, count) in command_frequency(&results).into_iter().take(30) {
            println!("  {:<16} {:>5}", command, count);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Run { args, instance } => run(args, Some(*instance)),
        Commands::RunCategory { args, instance } => run(args, *instance),
        Commands::Report {
            log_root,
            stages,
            commands,
            json,
        } => report(log_root, *stages, *commands, *json),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollup_rows_render_fixed_width_columns() {
        let row = RollupRow {
            label: "AC".to_string(),
            tasks: 5,
            sr: 0.6,
            pr: 0.724,
            avg_steps: Some(14.25),
            avg_cost: 0.1234,
        };
        let rendered = render_row(&row);
        assert!(rendered.starts_with("AC"));
        assert!(rendered.contains("0.60"));
        assert!(rendered.contains("0.72"));
        assert!(rendered.contains("14.2"));
        assert!(rendered.contains("0.123"));
    }

    #[test]
    fn missing_steps_render_as_a_dash() {
        let row = RollupRow {
            label: "Total".to_string(),
            tasks: 33,
            sr: 0.5,
            pr: 0.5,
            avg_steps: None,
            avg_cost: 0.2,
        };
        assert!(render_row(&row).contains(" - "));
    }
}
