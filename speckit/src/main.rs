//! Spec-driven feature tracker and agent workflow runner.
//!
//! Reads features from the issue tracker (`gh`), derives their lifecycle from
//! the local `specs/` tree, and runs agent prompts and pipeline steps with one
//! resumable session per feature branch.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use speckit::core::tasks::{parse_tasks, parse_user_story_ids, user_story_title};
use speckit::core::types::{Feature, Task};
use speckit::core::workflow::{PipelineStep, WorkflowId, WorkflowKind, WorkflowStatus};
use speckit::executor::{StartOptions, WorkflowExecutor};
use speckit::exit_codes;
use speckit::features::FeatureTracker;
use speckit::io::agent::ClaudeLauncher;
use speckit::io::config::{SpeckitConfig, load_config};
use speckit::io::init::{InitOptions, SpeckitPaths, init_project};
use speckit::io::session_store::SessionStore;
use speckit::io::tracker::GhTracker;
use speckit::logging;
use speckit::pipeline::{PipelineOptions, PipelineStop, run_pipeline};
use speckit::publish::publish_stories;

#[derive(Parser)]
#[command(
    name = "speckit",
    version,
    about = "Spec-driven feature tracking and agent workflows"
)]
struct Cli {
    /// Project root containing `.speckit/` and the specs directory.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.speckit/config.toml` and the specs directory.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// List features with their derived status.
    Features {
        /// Hide completed features.
        #[arg(long)]
        open: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show one feature with its stories, tasks and pull request.
    Feature {
        number: u32,
        #[arg(long)]
        json: bool,
    },
    /// Parse a tasks document and print its tasks.
    Tasks {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List the user stories declared in a spec document.
    Stories { file: PathBuf },
    /// Inspect or reset per-branch agent sessions.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Send a free-form prompt to the agent.
    Prompt {
        message: String,
        /// Run in this branch's session.
        #[arg(long)]
        branch: Option<String>,
        /// Start a new conversation under a new session id.
        #[arg(long, requires = "branch")]
        fresh: bool,
    },
    /// Run one pipeline step for a feature.
    Step {
        step: PipelineStep,
        feature: u32,
        /// Extra arguments passed to the step command.
        args: Vec<String>,
        /// Start a new conversation under a new session id.
        #[arg(long)]
        fresh: bool,
    },
    /// Run several pipeline steps for a feature in order.
    Pipeline {
        feature: u32,
        #[arg(required = true)]
        steps: Vec<PipelineStep>,
        /// Start the first step in a new session.
        #[arg(long)]
        fresh: bool,
        /// Run remaining steps after a failure (overrides `stop_on_error`).
        #[arg(long)]
        keep_going: bool,
    },
    /// Create tracker issues for user stories that have none yet.
    Publish { feature: u32 },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Print the branch's session id, creating one if needed.
    Get { branch: String },
    /// Mark the branch's session as used now.
    Touch { branch: String },
    /// Forget the branch's session.
    Clear { branch: String },
    List,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli.root;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Features { open, json } => cmd_features(&root, open, json),
        Command::Feature { number, json } => cmd_feature(&root, number, json),
        Command::Tasks { file, json } => cmd_tasks(&file, json),
        Command::Stories { file } => cmd_stories(&file),
        Command::Session { action } => cmd_session(&root, action),
        Command::Prompt {
            message,
            branch,
            fresh,
        } => cmd_prompt(&root, message, branch, fresh),
        Command::Step {
            step,
            feature,
            args,
            fresh,
        } => cmd_pipeline(&root, feature, &[step], args.join(" "), fresh, false),
        Command::Pipeline {
            feature,
            steps,
            fresh,
            keep_going,
        } => cmd_pipeline(&root, feature, &steps, String::new(), fresh, keep_going),
        Command::Publish { feature } => cmd_publish(&root, feature),
    }
}

/// Config, paths and the session store shared by every project command.
struct Project {
    paths: SpeckitPaths,
    cfg: SpeckitConfig,
    sessions: Arc<SessionStore>,
}

impl Project {
    fn open(root: &Path) -> Result<Self> {
        let paths = SpeckitPaths::new(root);
        let cfg = load_config(&paths.config_path)?;
        let sessions_path = paths.sessions_path(&cfg);
        let sessions = SessionStore::open_file(&sessions_path)
            .with_context(|| format!("open session store {}", sessions_path.display()))?;
        Ok(Self {
            paths,
            cfg,
            sessions: Arc::new(sessions),
        })
    }

    fn tracker(&self) -> Result<GhTracker> {
        GhTracker::connect(&self.cfg, &self.paths.root)
    }

    fn features<'a>(&'a self, tracker: &'a GhTracker) -> FeatureTracker<'a> {
        FeatureTracker::new(
            tracker,
            &self.sessions,
            self.paths.specs_dir(&self.cfg),
            self.cfg.issue_list_limit,
        )
    }

    fn executor(&self) -> WorkflowExecutor {
        let launcher = ClaudeLauncher::new(&self.cfg, &self.paths.root);
        WorkflowExecutor::new(Arc::new(launcher), Arc::clone(&self.sessions))
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_project(root, &InitOptions { force })?;
    println!("initialized {}", paths.speckit_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_features(root: &Path, open: bool, json: bool) -> Result<i32> {
    let project = Project::open(root)?;
    let tracker = project.tracker()?;
    let features = project.features(&tracker);
    let list = if open {
        features.open_features()?
    } else {
        features.build_features()?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&list)?);
    } else if list.is_empty() {
        println!("no features");
    } else {
        for feature in &list {
            println!("{feature}  {}", feature.name);
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_feature(root: &Path, number: u32, json: bool) -> Result<i32> {
    let project = Project::open(root)?;
    let tracker = project.tracker()?;
    let features = project.features(&tracker);
    let mut feature = features
        .feature_by_number(number)?
        .ok_or_else(|| anyhow!("feature {number} not found"))?;
    let tasks = features.tasks_for(&mut feature)?;
    features.attach_pull_request(&mut feature)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&feature)?);
    } else {
        print_feature(&feature, &tasks);
    }
    Ok(exit_codes::OK)
}

fn print_feature(feature: &Feature, tasks: &[Task]) {
    println!("{feature}");
    println!("  name:     {}", feature.name);
    println!("  session:  {}", feature.session_id);
    println!("  specs:    {}", feature.spec_dir.display());
    if let Some(pr) = feature.pr_number {
        println!("  pull:     #{pr}");
    }
    for story in &feature.user_stories {
        let done = story.tasks.iter().filter(|t| t.completed).count();
        let issue = story
            .issue_number
            .map(|n| format!(" #{n}"))
            .unwrap_or_default();
        println!(
            "  {}{issue} [{}] {done}/{} tasks",
            story.description,
            story.status,
            story.tasks.len()
        );
    }
    let untagged = tasks.iter().filter(|t| t.user_story.is_none()).count();
    if untagged > 0 {
        println!("  {untagged} task(s) not tied to a story");
    }
}

fn cmd_tasks(file: &Path, json: bool) -> Result<i32> {
    let document =
        fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let tasks = parse_tasks(&document);
    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(exit_codes::OK);
    }
    for task in &tasks {
        let mark = if task.completed { "x" } else { " " };
        let parallel = if task.is_parallel { " [P]" } else { "" };
        let story = task
            .user_story
            .as_deref()
            .map(|s| format!(" [{s}]"))
            .unwrap_or_default();
        println!("[{mark}] {}{parallel}{story} {}", task.id, task.description);
    }
    Ok(exit_codes::OK)
}

fn cmd_stories(file: &Path) -> Result<i32> {
    let document =
        fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let mut ids: Vec<String> = parse_user_story_ids(&document).into_iter().collect();
    ids.sort_by_key(|id| id.trim_start_matches("US").parse::<u64>().unwrap_or(u64::MAX));
    for id in ids {
        match user_story_title(&document, &id) {
            Some(title) => println!("{id}: {title}"),
            None => println!("{id}"),
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_session(root: &Path, action: SessionAction) -> Result<i32> {
    let project = Project::open(root)?;
    let sessions = &project.sessions;
    match action {
        SessionAction::Get { branch } => println!("{}", sessions.get_or_create(&branch)?),
        SessionAction::Touch { branch } => {
            if !sessions.touch(&branch)? {
                eprintln!("no session for {branch}");
                return Ok(exit_codes::INVALID);
            }
        }
        SessionAction::Clear { branch } => {
            if sessions.clear(&branch)? {
                println!("cleared session for {branch}");
            } else {
                println!("no session for {branch}");
            }
        }
        SessionAction::List => {
            for (branch, record) in sessions.list() {
                println!(
                    "{branch}  {}  last used {}",
                    record.session_id,
                    record.last_used_at.to_rfc3339()
                );
            }
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_prompt(root: &Path, message: String, branch: Option<String>, fresh: bool) -> Result<i32> {
    let project = Project::open(root)?;
    let runtime = runtime()?;
    runtime.block_on(async {
        let mut executor = project.executor();
        let workflow_id = executor.start(
            WorkflowKind::Prompt { prompt: message },
            StartOptions { branch, fresh },
        )?;
        let interrupt = interrupt_on_ctrl_c();
        executor.run_until(&interrupt, print_delta).await?;
        finish_line();
        Ok::<_, anyhow::Error>(workflow_exit_code(&executor, &workflow_id))
    })
}

fn cmd_pipeline(
    root: &Path,
    feature: u32,
    steps: &[PipelineStep],
    args: String,
    fresh: bool,
    keep_going: bool,
) -> Result<i32> {
    let project = Project::open(root)?;
    let branch = {
        let tracker = project.tracker()?;
        project
            .features(&tracker)
            .feature_by_number(feature)?
            .ok_or_else(|| anyhow!("feature {feature} not found"))?
            .branch
    };
    let options = PipelineOptions {
        args,
        fresh,
        stop_on_error: project.cfg.stop_on_error && !keep_going,
    };

    let runtime = runtime()?;
    runtime.block_on(async {
        let mut executor = project.executor();
        let interrupt = interrupt_on_ctrl_c();
        let outcome =
            run_pipeline(&mut executor, &branch, steps, &options, &interrupt, print_delta).await?;
        finish_line();
        Ok::<_, anyhow::Error>(match outcome.stop {
            PipelineStop::Completed => exit_codes::OK,
            PipelineStop::Failed { step, error } => {
                eprintln!("step {step} failed: {error}");
                exit_codes::WORKFLOW_FAILED
            }
            PipelineStop::Cancelled { step } => {
                eprintln!("step {step} cancelled");
                exit_codes::CANCELLED
            }
        })
    })
}

fn cmd_publish(root: &Path, feature: u32) -> Result<i32> {
    let project = Project::open(root)?;
    let tracker = project.tracker()?;
    let outcome = publish_stories(&project.features(&tracker), &tracker, feature)?;
    for story in &outcome.created {
        println!("#{} {}: {}", story.issue_number, story.id, story.title);
    }
    if outcome.created.is_empty() {
        println!("nothing to publish");
    }
    Ok(exit_codes::OK)
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")
}

/// Token cancelled on the first Ctrl-C. Must be called inside the runtime.
fn interrupt_on_ctrl_c() -> CancellationToken {
    let interrupt = CancellationToken::new();
    let trigger = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    interrupt
}

fn print_delta(_: &WorkflowId, text: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(text.as_bytes());
    let _ = stdout.flush();
}

fn finish_line() {
    println!();
}

fn workflow_exit_code(executor: &WorkflowExecutor, workflow_id: &WorkflowId) -> i32 {
    let Some(entry) = executor.state().workflow(workflow_id) else {
        return exit_codes::INVALID;
    };
    match entry.status {
        WorkflowStatus::Succeeded => exit_codes::OK,
        WorkflowStatus::Cancelled => {
            eprintln!("cancelled");
            exit_codes::CANCELLED
        }
        _ => {
            eprintln!("failed: {}", entry.error.as_deref().unwrap_or("unknown error"));
            exit_codes::WORKFLOW_FAILED
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["speckit", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["speckit", "--root", "/tmp/x", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
        assert_eq!(cli.root, PathBuf::from("/tmp/x"));
    }

    #[test]
    fn parse_step_with_args() {
        let cli = Cli::parse_from(["speckit", "step", "Plan", "3", "use", "postgres"]);
        let Command::Step {
            step,
            feature,
            args,
            fresh,
        } = cli.command
        else {
            panic!("expected step command");
        };
        assert_eq!(step, PipelineStep::Plan);
        assert_eq!(feature, 3);
        assert_eq!(args, vec!["use", "postgres"]);
        assert!(!fresh);
    }

    #[test]
    fn parse_pipeline_steps() {
        let cli = Cli::parse_from(["speckit", "pipeline", "7", "plan", "tasks", "--keep-going"]);
        let Command::Pipeline {
            steps, keep_going, ..
        } = cli.command
        else {
            panic!("expected pipeline command");
        };
        assert_eq!(steps, vec![PipelineStep::Plan, PipelineStep::Tasks]);
        assert!(keep_going);
    }

    #[test]
    fn unknown_step_is_rejected() {
        assert!(Cli::try_parse_from(["speckit", "step", "deploy", "1"]).is_err());
    }

    #[test]
    fn fresh_prompt_requires_branch() {
        assert!(Cli::try_parse_from(["speckit", "prompt", "hi", "--fresh"]).is_err());
        let with_branch = ["speckit", "prompt", "hi", "--fresh", "--branch", "b"];
        assert!(Cli::try_parse_from(with_branch).is_ok());
    }
}
