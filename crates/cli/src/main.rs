//! `dagrun` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: check a pipeline definition and print its execution order.
//! - `plan`    : print the tasks level by level.
//! - `run`     : execute one run against the in-memory recording warehouse.
//!
//! Exit codes: 0 when everything succeeded, 1 for a failed run or an invalid
//! pipeline, 2 when the run was aborted (Ctrl-C).

mod cli;
mod logging;

use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use engine::{
    DagExecutor, EventSink, ExecutorConfig, JsonLinesSink, PipelineDefinition, RunReport,
    RunStatus, TaskGraph, TracingSink,
};
use nodes::warehouse::{CredentialProvider, EnvCredentials, RecordingWarehouse, StaticCredentials};
use nodes::{Collaborators, RunContext, WarehouseError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cli::{Cli, Command, EventFormat, RunArgs};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level)?;

    match cli.command {
        Command::Validate { path } => validate(&path),
        Command::Plan { path } => plan(&path),
        Command::Run(args) => run(args).await,
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))
}

/// Parse a definition, check every operator and build the graph.
fn parse(json: &str, with: &Collaborators) -> Result<(PipelineDefinition, TaskGraph)> {
    let def = PipelineDefinition::from_json(json).context("invalid pipeline definition")?;
    def.validate_operators()?;
    let graph = def.build_graph(with)?;
    Ok((def, graph))
}

/// Collaborators for commands that build a graph without running it.
fn inert_collaborators() -> Collaborators {
    Collaborators {
        warehouse: Arc::new(RecordingWarehouse::new()),
        credentials: Arc::new(StaticCredentials::new("dry-run", "dry-run")),
    }
}

fn validate(path: &Path) -> Result<ExitCode> {
    let (def, graph) = parse(&read(path)?, &inert_collaborators())
        .with_context(|| format!("{} is not a valid pipeline", path.display()))?;
    let order = graph
        .validate()
        .with_context(|| format!("{} is not a valid pipeline", path.display()))?;

    println!("{} is valid: {} tasks", def.dag_id, order.len());
    println!("execution order: {}", order.join(" -> "));
    Ok(ExitCode::SUCCESS)
}

fn plan(path: &Path) -> Result<ExitCode> {
    let (def, graph) = parse(&read(path)?, &inert_collaborators())?;
    let levels = graph.levels()?;

    println!("{}", def.dag_id);
    if let Some(description) = &def.description {
        println!("  {description}");
    }
    let width = graph.task_ids().map(str::len).max().unwrap_or(0);
    for (depth, level) in levels.iter().enumerate() {
        println!("level {depth}");
        for id in level {
            let Some(task) = graph.task(id) else { continue };
            let policy = &task.retry_policy;
            print!("  {id:<width$}  {}", task.action.describe());
            if policy.max_retries > 0 {
                print!("  retries={} delay={}s", policy.max_retries, policy.delay.as_secs_f64());
            }
            println!();
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Everything a dry run needs, built from the command-line flags.
struct DryRun {
    def: PipelineDefinition,
    graph: TaskGraph,
    warehouse: RecordingWarehouse,
    ctx: RunContext,
    config: ExecutorConfig,
}

fn prepare(args: &RunArgs, json: &str) -> Result<DryRun> {
    let mut warehouse = RecordingWarehouse::new();
    for needle in &args.fail_on {
        warehouse = warehouse.fail_once(
            needle.clone(),
            WarehouseError::transient(format!("scripted failure on `{needle}`")),
        );
    }
    for needle in &args.fail_always {
        warehouse = warehouse.fail_always(
            needle.clone(),
            WarehouseError::fatal(format!("scripted failure on `{needle}`")),
        );
    }
    for (query, value) in &args.scalar {
        warehouse = warehouse.with_scalar(query.clone(), *value);
    }

    let credentials: Arc<dyn CredentialProvider> = if args.env_credentials {
        Arc::new(EnvCredentials)
    } else {
        Arc::new(StaticCredentials::new("dry-run", "dry-run"))
    };
    let with = Collaborators {
        warehouse: Arc::new(warehouse.clone()),
        credentials,
    };
    let (def, graph) = parse(json, &with)?;

    let config = match args.max_concurrency {
        Some(0) => bail!("--max-concurrency must be at least 1"),
        Some(limit) => ExecutorConfig::with_max_concurrency(limit),
        None => ExecutorConfig::default(),
    };
    let ctx = RunContext::new(
        args.logical_date.unwrap_or_else(Utc::now),
        args.params.iter().cloned().collect(),
    );

    Ok(DryRun {
        def,
        graph,
        warehouse,
        ctx,
        config,
    })
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let DryRun {
        def,
        graph,
        warehouse,
        ctx,
        config,
    } = prepare(&args, &read(&args.path)?)?;

    let sink: Arc<dyn EventSink> = match args.events {
        EventFormat::Log => Arc::new(TracingSink),
        EventFormat::Json => Arc::new(JsonLinesSink::new(std::io::stdout())),
    };
    let executor = DagExecutor::new(config).with_sink(sink);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; waiting for running tasks to finish");
            on_signal.cancel();
        }
    });

    info!(
        dag_id = %def.dag_id,
        run_id = %ctx.run_id(),
        logical_date = %ctx.logical_timestamp(),
        "starting run"
    );
    let report = executor
        .run_with_cancel(&graph, ctx, cancel)
        .await
        .with_context(|| format!("{} could not be run", def.dag_id))?;
    debug!(statements = warehouse.statements().len(), "dry run finished");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
    Ok(ExitCode::from(exit_status(&report)))
}

fn exit_status(report: &RunReport) -> u8 {
    match report.status {
        RunStatus::Succeeded => 0,
        RunStatus::Failed => 1,
        RunStatus::Aborted => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use engine::{CollectingSink, EngineError, RunEvent, TaskState};

    const SPARKIFY: &str = include_str!("../../../demos/sparkify.json");

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["dagrun", "run", "sparkify.json", "--logical-date", "2018-11-01"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Command::Run(args) => args,
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn bundled_pipeline_plans_into_six_levels() {
        let (def, graph) = parse(SPARKIFY, &inert_collaborators()).unwrap();
        assert_eq!(def.dag_id, "sparkify");
        assert_eq!(graph.len(), 10);

        let levels = graph.levels().unwrap();
        assert_eq!(
            levels,
            vec![
                vec!["ETL_Start"],
                vec!["Stage_Events", "Stage_Songs"],
                vec!["Load_Songplays"],
                vec![
                    "Load_Dimension_Artists",
                    "Load_Dimension_Songs",
                    "Load_Dimension_Time",
                    "Load_Dimension_Users"
                ],
                vec!["Quality_Checks"],
                vec!["ETL_Stop"],
            ]
        );

        let stage = graph.task("Stage_Events").unwrap();
        assert_eq!(stage.retry_policy.max_retries, 3);
        assert_eq!(stage.retry_policy.delay.as_secs(), 300);
    }

    #[tokio::test]
    async fn dry_run_stages_the_logical_month() {
        let dry = prepare(&run_args(&[]), SPARKIFY).unwrap();
        assert_eq!(
            dry.ctx.logical_timestamp(),
            Utc.with_ymd_and_hms(2018, 11, 1, 0, 0, 0).unwrap()
        );

        let report = DagExecutor::new(dry.config)
            .run(&dry.graph, dry.ctx)
            .await
            .unwrap();

        assert_eq!(exit_status(&report), 0);
        let statements = dry.warehouse.statements();
        assert!(statements
            .iter()
            .any(|s| s.contains("FROM 's3://udacity-dend/log-data/2018/11'")));
        assert!(statements.iter().any(|s| s.starts_with("TRUNCATE TABLE users")));
        // Three probes, each queried once.
        assert_eq!(statements.iter().filter(|s| s.starts_with("SELECT COUNT(*)")).count(), 3);
    }

    #[tokio::test]
    async fn failing_probe_fails_run_and_skips_stop() {
        let args = run_args(&["--scalar", "SELECT COUNT(*) FROM users WHERE level IS NULL=4"]);
        let dry = prepare(&args, SPARKIFY).unwrap();
        let sink = Arc::new(CollectingSink::new());

        let report = DagExecutor::new(dry.config)
            .with_sink(sink.clone())
            .run(&dry.graph, dry.ctx)
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(exit_status(&report), 1);
        assert_eq!(report.attempts_of("Quality_Checks"), Some(1));
        assert_eq!(report.state_of("ETL_Stop"), Some(TaskState::UpstreamFailed));
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, RunEvent::TaskSkipped { task_id, .. } if task_id == "ETL_Stop")));
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_transient_failure_is_retried() {
        let args = run_args(&["--fail-on", "COPY staging_songs", "--max-concurrency", "2"]);
        let dry = prepare(&args, SPARKIFY).unwrap();

        let report = DagExecutor::new(dry.config)
            .run(&dry.graph, dry.ctx)
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.attempts_of("Stage_Songs"), Some(2));
        assert_eq!(report.attempts_of("Stage_Events"), Some(1));
        // The staging table is cleared again before the retried copy.
        let deletes = dry
            .warehouse
            .statements()
            .iter()
            .filter(|s| s.as_str() == "DELETE FROM staging_songs")
            .count();
        assert_eq!(deletes, 2);
    }

    #[tokio::test]
    async fn missing_user_parameter_stops_before_any_statement() {
        let json = SPARKIFY.replace("song_data", "song_data/{subset}");
        let dry = prepare(&run_args(&[]), &json).unwrap();

        let err = DagExecutor::new(dry.config)
            .run(&dry.graph, dry.ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Template { ref task_id, .. } if task_id == "Stage_Songs"));
        assert!(dry.warehouse.statements().is_empty());

        let dry = prepare(&run_args(&["--param", "subset=A/B"]), &json).unwrap();
        let report = DagExecutor::new(dry.config)
            .run(&dry.graph, dry.ctx)
            .await
            .unwrap();
        assert!(report.is_success());
        assert!(dry
            .warehouse
            .statements()
            .iter()
            .any(|s| s.contains("s3://udacity-dend/song_data/A/B")));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(prepare(&run_args(&["--max-concurrency", "0"]), SPARKIFY).is_err());
    }

    #[test]
    fn aborted_run_exits_with_two() {
        let report = RunReport {
            run_id: Default::default(),
            logical_timestamp: Utc.with_ymd_and_hms(2018, 11, 1, 0, 0, 0).unwrap(),
            status: RunStatus::Aborted,
            tasks: Default::default(),
            failed: Default::default(),
            upstream_failed: Default::default(),
            not_run: Default::default(),
            elapsed: Default::default(),
        };
        assert_eq!(exit_status(&report), 2);
    }
}
