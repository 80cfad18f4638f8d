//! `overstory` command-line entry point.

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};

use overstory::agents::provider::{CliProvider, ProviderClient, ProviderCommand};
use overstory::agents::sling::{stop_agent, Sling, SlingRequest};
use overstory::agents::tmux::{SystemTmuxClient, TmuxClient, TmuxError, MIN_TMUX};
use overstory::agents::watchdog::Watchdog;
use overstory::agents::{identity, manifest::Manifest};
use overstory::config::Config;
use overstory::errors::{Error, Result};
use overstory::git::{GitCli, WorktreeManager};
use overstory::mail::{Groups, MailBroker, PendingNudge, SendRequest};
use overstory::merge::MergeEngine;
use overstory::paths::{self, OverstoryHome};
use overstory::query::{self, QueryOptions};
use overstory::store::{
    Capability, MailFilter, MailPriority, MailType, MergeQueue, MetricsStore, PurgeFilter,
    SessionStore,
};
use overstory::{hook_events, hooks, prime};

#[derive(Parser)]
#[command(name = "overstory")]
#[command(about = "Control plane for fleets of AI coding agents")]
#[command(version, disable_version_flag = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Print machine-readable JSON instead of human output
    #[arg(long, global = true)]
    json: bool,

    /// Suppress advisory output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Print version
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,

    /// Emit shell completions (not bundled in this build)
    #[arg(long, value_name = "SHELL", hide = true)]
    completions: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
struct QueryArgs {
    /// Narrow to one agent
    #[arg(long)]
    agent: Option<String>,

    /// Narrow to one run
    #[arg(long)]
    run: Option<String>,

    /// ISO-8601 lower bound
    #[arg(long)]
    since: Option<String>,

    /// ISO-8601 upper bound
    #[arg(long)]
    until: Option<String>,

    /// Maximum rows
    #[arg(long)]
    limit: Option<usize>,
}

impl QueryArgs {
    fn options(&self) -> QueryOptions {
        QueryOptions {
            agent: self.agent.clone(),
            run: self.run.clone(),
            since: self.since.clone(),
            until: self.until.clone(),
            limit: self.limit,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize .overstory in the current repository
    Init,

    /// Admit and spawn an agent bound to a task
    Sling {
        /// Agent capability (scout|builder|reviewer|lead|merger|supervisor|coordinator|monitor)
        #[arg(long)]
        capability: String,

        /// Unique agent name
        #[arg(long)]
        name: String,

        /// Path to a task brief
        #[arg(long)]
        spec: Option<PathBuf>,

        /// Comma-separated list narrowing the edit scope
        #[arg(long)]
        files: Option<String>,

        /// Parent agent name
        #[arg(long)]
        parent: Option<String>,

        /// Hierarchy depth of the new agent
        #[arg(long)]
        depth: Option<u32>,

        /// Bypass the depth gate
        #[arg(long)]
        force_hierarchy: bool,

        /// Bead (task) id to bind
        #[arg(long)]
        bead: Option<String>,
    },

    /// Print the context packet for an agent
    Prime {
        #[arg(long)]
        agent: Option<String>,

        /// Post-compaction variant (skips expertise, adds checkpoint)
        #[arg(long)]
        compact: bool,
    },

    /// Show all sessions against the live tmux inventory
    Status,

    /// Plain repeating status view (Ctrl+C to exit)
    Dashboard {
        /// Refresh interval in milliseconds
        #[arg(long, default_value_t = 2000)]
        interval_ms: u64,
    },

    /// Environment health checks
    Doctor,

    /// Deep view of one agent
    Inspect { agent: String },

    /// Merge queued branches (or one ad-hoc branch) into the target
    Merge {
        /// Merge one branch, queueing it if needed
        #[arg(long)]
        branch: Option<String>,

        /// Merge target override
        #[arg(long)]
        into: Option<String>,
    },

    /// Manually drop a pending-nudge marker for an agent
    Nudge {
        agent: String,

        /// Override the nudge message
        #[arg(long)]
        message: Option<String>,
    },

    /// Remove worktrees, branches, and markers of finished agents
    Clean {
        /// Also delete terminal session rows and orphan overstory refs
        #[arg(long)]
        all: bool,
    },

    /// Ingest a hook payload (tool events, session-end, checkpoint)
    Log {
        /// Payload kind: omitted for tool events, or `session-end` / `checkpoint`
        kind: Option<String>,

        /// Read the payload from stdin
        #[arg(long)]
        stdin: bool,

        /// Acting agent (defaults to $OVERSTORY_AGENT_NAME)
        #[arg(long)]
        agent: Option<String>,
    },

    /// List control-plane log files
    Logs {
        /// Lines of the newest file to print
        #[arg(long, default_value_t = 40)]
        tail: usize,
    },

    /// Run the watchdog reconciliation loop
    Watch {
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },

    /// Tool events for an agent
    Trace(QueryArgs),

    /// Error-level events
    Errors(QueryArgs),

    /// All event streams merged by time
    Feed {
        #[command(flatten)]
        query: QueryArgs,

        /// Keep polling for new events
        #[arg(long)]
        follow: bool,
    },

    /// Replay event streams merged by time
    Replay(QueryArgs),

    /// Token and cost roll-ups
    Costs {
        #[command(flatten)]
        query: QueryArgs,

        /// Live burn rate over active sessions
        #[arg(long)]
        live: bool,

        /// Only this process's project (alias of the default scope)
        #[arg(long = "self")]
        self_only: bool,
    },

    /// Recent session metrics
    Metrics {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Web dashboard (external collaborator, not bundled)
    Web,

    /// Task brief management
    Spec {
        #[command(subcommand)]
        command: SpecCommands,
    },

    /// The long-lived coordinator agent
    Coordinator {
        #[command(subcommand)]
        action: LifecycleAction,
    },

    /// The supervisor agent
    Supervisor {
        #[command(subcommand)]
        action: LifecycleAction,
    },

    /// The tier-2 monitor agent
    Monitor {
        #[command(subcommand)]
        action: LifecycleAction,
    },

    /// Hook package management
    Hooks {
        #[command(subcommand)]
        command: HooksCommands,
    },

    /// Durable mail between agents
    Mail {
        #[command(subcommand)]
        command: MailCommands,
    },

    /// Operator-defined broadcast groups
    Group {
        #[command(subcommand)]
        command: GroupCommands,
    },

    /// Agent worktrees
    Worktree {
        #[command(subcommand)]
        command: WorktreeCommands,
    },

    /// Session runs
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },

    /// Agent registry
    Agents {
        #[command(subcommand)]
        command: AgentsCommands,
    },
}

#[derive(Subcommand)]
enum SpecCommands {
    /// Write specs/{bead}.md from a file or stdin
    Write {
        bead: String,

        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum LifecycleAction {
    Start {
        /// Objective recorded on the run this process opens
        #[arg(long)]
        objective: Option<String>,
    },
    Stop,
    Status,
}

#[derive(Subcommand)]
enum HooksCommands {
    Install {
        /// Target checkout (defaults to the project root)
        #[arg(long)]
        worktree: Option<PathBuf>,

        /// Capability whose tool policy to bake in
        #[arg(long, default_value = "coordinator")]
        capability: String,
    },
    Uninstall {
        #[arg(long)]
        worktree: Option<PathBuf>,
    },
    Status {
        #[arg(long)]
        worktree: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum MailCommands {
    Send {
        #[arg(long, default_value = "operator")]
        from: String,

        /// Recipient agent or group address (@all, @builders, ...)
        #[arg(long)]
        to: String,

        #[arg(long)]
        subject: String,

        #[arg(long)]
        body: String,

        /// Message type (status|question|result|error|worker_done|...)
        #[arg(long = "type", default_value = "status")]
        mail_type: String,

        #[arg(long, default_value = "normal")]
        priority: String,

        /// Optional JSON payload
        #[arg(long)]
        payload: Option<String>,
    },
    Check {
        #[arg(long)]
        agent: Option<String>,

        /// Human block with priority banner, clearing the nudge marker
        #[arg(long)]
        inject: bool,

        /// Skip the check when one ran within this many milliseconds
        #[arg(long)]
        debounce: Option<u64>,
    },
    List {
        #[arg(long)]
        from: Option<String>,

        #[arg(long)]
        to: Option<String>,

        #[arg(long)]
        unread: bool,

        #[arg(long)]
        limit: Option<usize>,
    },
    Read {
        id: String,
    },
    Reply {
        id: String,

        #[arg(long)]
        body: String,

        #[arg(long, default_value = "operator")]
        from: String,
    },
    Purge {
        #[arg(long)]
        all: bool,

        #[arg(long)]
        older_than_ms: Option<i64>,

        #[arg(long)]
        agent: Option<String>,
    },
}

#[derive(Subcommand)]
enum GroupCommands {
    Create { name: String },
    Status { name: String },
    Add { name: String, member: String },
    Remove { name: String, member: String },
    List,
}

#[derive(Subcommand)]
enum WorktreeCommands {
    List,
    Clean,
}

#[derive(Subcommand)]
enum RunCommands {
    List,
    Show { id: String },
    Complete { id: String },
}

#[derive(Subcommand)]
enum AgentsCommands {
    /// List known agent identities and manifest roles
    Discover,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Some(shell) = &cli.completions {
        eprintln!("Error [Config]: completion generation for '{shell}' is not bundled in this build");
        std::process::exit(1);
    }

    match run(cli).await {
        Ok(()) => {}
        Err(err) => {
            eprintln!("{}", err.report());
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // init is the one verb that works without an existing home
    if matches!(cli.command, Commands::Init) {
        return cmd_init(cli.json);
    }

    let cwd = std::env::current_dir()
        .map_err(|e| Error::Config(format!("cannot determine working directory: {e}")))?;
    let home = OverstoryHome::discover(&cwd)?;
    let config = Config::load(&home)?;

    let long_lived = matches!(
        cli.command,
        Commands::Watch { once: false } | Commands::Dashboard { .. }
    );
    let _logging = overstory::logging::init_logging(&config, &home, long_lived)
        .map_err(|e| Error::Config(format!("cannot initialize logging: {e}")))?;

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Sling {
            capability,
            name,
            spec,
            files,
            parent,
            depth,
            force_hierarchy,
            bead,
        } => {
            let tmux = SystemTmuxClient::new();
            check_tmux(&tmux)?;
            let request = SlingRequest {
                capability: capability.parse()?,
                name,
                spec,
                files: files
                    .map(|list| {
                        list.split(',')
                            .map(|f| f.trim().to_string())
                            .filter(|f| !f.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
                parent,
                depth,
                force_hierarchy,
                bead_id: bead,
            };
            let session = Sling::new(&home, &config, &tmux).sling(&request).await?;
            if cli.json {
                print_json(&session)?;
            } else {
                println!(
                    "slung {} [{}] in {} on {}",
                    session.agent_name,
                    session.capability,
                    session.tmux_session,
                    session.branch_name
                );
            }
            Ok(())
        }
        Commands::Prime { agent, compact } => {
            let packet = prime::build_prime(&home, &config, agent.as_deref(), compact).await?;
            println!("{packet}");
            Ok(())
        }
        Commands::Status => {
            let tmux = SystemTmuxClient::new();
            let rows = query::status(&home, &tmux)?;
            if cli.json {
                print_json(&rows)?;
            } else {
                print_status_table(&rows);
            }
            Ok(())
        }
        Commands::Dashboard { interval_ms } => cmd_dashboard(&home, interval_ms).await,
        Commands::Doctor => cmd_doctor(&home, &config).await,
        Commands::Inspect { agent } => {
            let report = query::inspect(&home, &agent)?
                .ok_or_else(|| Error::validation("agent", format!("no session named '{agent}'")))?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "{} [{}] state={} branch={} bead={}",
                    report.session.agent_name,
                    report.session.capability,
                    report.session.state,
                    report.session.branch_name,
                    report.session.bead_id
                );
                println!("unread mail: {}", report.unread_mail.len());
                println!("recent events:");
                for event in &report.recent_events {
                    println!(
                        "  {} {} {}",
                        event.created_at,
                        event.event_type,
                        event.tool_name.as_deref().unwrap_or("")
                    );
                }
            }
            Ok(())
        }
        Commands::Merge { branch, into } => {
            cmd_merge(&home, &config, branch, into, cli.json).await
        }
        Commands::Nudge { agent, message } => {
            let marker = PendingNudge::new(
                "operator",
                "escalation",
                message.as_deref().unwrap_or("operator asked you to check in"),
                None,
            );
            overstory::mail::nudge::write_marker(&home, &agent, &marker)?;
            if !cli.quiet {
                println!("nudge marker written for {agent}");
            }
            Ok(())
        }
        Commands::Clean { all } => cmd_clean(&home, &config, all).await,
        Commands::Log { kind, stdin, agent } => {
            let agent = agent
                .or_else(|| std::env::var("OVERSTORY_AGENT_NAME").ok())
                .ok_or_else(|| {
                    Error::validation("agent", "pass --agent or set OVERSTORY_AGENT_NAME")
                })?;
            let payload = if stdin {
                read_stdin()?
            } else {
                String::from("{}")
            };
            match kind.as_deref() {
                None => hook_events::handle_log(&home, &agent, &payload),
                Some("session-end") => hook_events::handle_session_end(&home, &agent, &payload),
                Some("checkpoint") => hook_events::handle_checkpoint(&home, &agent, &payload),
                Some(other) => Err(Error::validation(
                    "kind",
                    format!("unknown log kind '{other}'"),
                )),
            }
        }
        Commands::Logs { tail } => cmd_logs(&home, tail),
        Commands::Watch { once } => cmd_watch(&home, &config, once).await,
        Commands::Trace(args) => {
            let rows = query::trace(&home, &args.options())?;
            if cli.json {
                print_json(&rows)?;
            } else {
                for event in rows {
                    println!(
                        "{} {} {} {} {}",
                        event.created_at,
                        event.agent_name,
                        event.event_type,
                        event.tool_name.as_deref().unwrap_or(""),
                        event
                            .tool_duration_ms
                            .map_or(String::new(), |ms| format!("{ms}ms"))
                    );
                }
            }
            Ok(())
        }
        Commands::Errors(args) => {
            let rows = query::errors(&home, &args.options())?;
            if cli.json {
                print_json(&rows)?;
            } else {
                for event in rows {
                    println!(
                        "{} {} {} {}",
                        event.created_at,
                        event.agent_name,
                        event.event_type,
                        event.data.as_deref().unwrap_or("")
                    );
                }
            }
            Ok(())
        }
        Commands::Feed { query: args, follow } => cmd_feed(&home, &args, follow, cli.json).await,
        Commands::Replay(args) => {
            let rows = query::replay(&home, &args.options())?;
            if cli.json {
                print_json(&rows)?;
            } else {
                for event in rows {
                    println!(
                        "{} {} {} {}",
                        event.created_at,
                        event.agent_name,
                        event.event_type,
                        event.tool_name.as_deref().unwrap_or("")
                    );
                }
            }
            Ok(())
        }
        Commands::Costs {
            query: args,
            live,
            self_only: _,
        } => {
            let report = if live {
                query::costs_live(&home)?
            } else {
                query::costs(&home, &args.options())?
            };
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "{} session(s), {} in / {} out tokens, ${:.2}",
                    report.sessions,
                    report.total_input_tokens,
                    report.total_output_tokens,
                    report.total_cost_usd
                );
                if let Some(rate) = report.burn_rate_usd_per_minute {
                    println!("burn rate: ${rate:.3}/min");
                }
            }
            Ok(())
        }
        Commands::Metrics { limit } => {
            let store = MetricsStore::open(&home.metrics_db())?;
            let rows = store.recent_sessions(limit)?;
            store.close();
            if cli.json {
                print_json(&rows)?;
            } else {
                for row in rows {
                    println!(
                        "{} [{}] {}ms in={} out={} ${}",
                        row.agent_name,
                        row.capability,
                        row.duration_ms,
                        row.input_tokens,
                        row.output_tokens,
                        row.estimated_cost_usd
                            .map_or("?".to_string(), |c| format!("{c:.2}"))
                    );
                }
            }
            Ok(())
        }
        Commands::Web => Err(Error::Config(
            "the web dashboard is not bundled in this build".to_string(),
        )),
        Commands::Spec { command } => match command {
            SpecCommands::Write { bead, file } => {
                let content = match file {
                    Some(path) => std::fs::read_to_string(&path).map_err(|e| {
                        Error::validation("file", format!("cannot read {}: {e}", path.display()))
                    })?,
                    None => read_stdin()?,
                };
                std::fs::write(home.spec_file(&bead), content)
                    .map_err(|e| Error::Agent(format!("cannot write spec: {e}")))?;
                if !cli.quiet {
                    println!("wrote {}", home.spec_file(&bead).display());
                }
                Ok(())
            }
        },
        Commands::Coordinator { action } => {
            cmd_lifecycle(&home, &config, Capability::Coordinator, "coordinator", action, cli.json)
                .await
        }
        Commands::Supervisor { action } => {
            cmd_lifecycle(&home, &config, Capability::Supervisor, "supervisor", action, cli.json)
                .await
        }
        Commands::Monitor { action } => {
            cmd_lifecycle(&home, &config, Capability::Monitor, "monitor", action, cli.json).await
        }
        Commands::Hooks { command } => cmd_hooks(&config, command, cli.json),
        Commands::Mail { command } => cmd_mail(&home, command, cli.json).await,
        Commands::Group { command } => cmd_group(&home, command, cli.json),
        Commands::Worktree { command } => cmd_worktree(&home, &config, command, cli.json).await,
        Commands::Run { command } => cmd_run(&home, command, cli.json),
        Commands::Agents { command } => match command {
            AgentsCommands::Discover => cmd_agents_discover(&home, cli.json),
        },
    }
}

fn cmd_init(json: bool) -> Result<()> {
    let cwd = std::env::current_dir()
        .map_err(|e| Error::Config(format!("cannot determine working directory: {e}")))?;
    let home = OverstoryHome::at(&cwd);
    home.ensure_layout()?;

    if !home.config_file().exists() {
        let mut config = Config::default();
        config.project.name = cwd
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string());
        let body = serde_yaml::to_string(&config)
            .map_err(|e| Error::Config(format!("cannot render default config: {e}")))?;
        std::fs::write(home.config_file(), body)
            .map_err(|e| Error::Config(format!("cannot write config.yaml: {e}")))?;
    }
    Manifest::write_default(&home)?;

    // local state never belongs in the repository
    let gitignore = home.dir().join(".gitignore");
    if !gitignore.exists() {
        std::fs::write(
            &gitignore,
            "config.local.yaml\n*.db\n*.db-wal\n*.db-shm\nlogs/\nworktrees/\npending-nudges/\n\
             agents/\nspecs/\ncurrent-run.txt\nsession-branch.txt\nmail-check-state.json\n\
             nudge-state.json\nmerge-history.json\ngroups.json\n",
        )
        .map_err(|e| Error::Config(format!("cannot write .gitignore: {e}")))?;
    }

    if json {
        print_json(&serde_json::json!({ "initialized": home.dir() }))?;
    } else {
        println!("initialized {}", home.dir().display());
    }
    Ok(())
}

fn check_tmux(tmux: &SystemTmuxClient) -> Result<()> {
    let version = tmux.check_available()?;
    if !version.meets_minimum(MIN_TMUX.0, MIN_TMUX.1) {
        return Err(TmuxError::VersionTooOld(
            version.raw,
            format!("{}.{}", MIN_TMUX.0, MIN_TMUX.1),
        )
        .into());
    }
    Ok(())
}

fn print_status_table(rows: &[query::StatusRow]) {
    if rows.is_empty() {
        println!("No sessions.");
        return;
    }
    println!(
        "{:<16} {:<12} {:<10} {:<6} {:<28} MAIL",
        "AGENT", "CAPABILITY", "STATE", "PANE", "BRANCH"
    );
    for row in rows {
        let pane = if row.tmux_alive {
            "up"
        } else if row.session.state.is_active() {
            "(gone)"
        } else {
            "-"
        };
        println!(
            "{:<16} {:<12} {:<10} {:<6} {:<28} {}",
            row.session.agent_name,
            row.session.capability.to_string(),
            row.session.state.to_string(),
            pane,
            row.session.branch_name,
            row.unread_mail
        );
    }
}

async fn cmd_dashboard(home: &OverstoryHome, interval_ms: u64) -> Result<()> {
    let tmux = SystemTmuxClient::new();
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(500)));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                // clear screen, home cursor
                print!("\x1b[2J\x1b[H");
                println!("overstory dashboard (Ctrl+C to exit)\n");
                match query::status(home, &tmux) {
                    Ok(rows) => print_status_table(&rows),
                    Err(e) => println!("{}", e.report()),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    // restore cursor and leave a clean screen behind
    print!("\x1b[2J\x1b[H\x1b[?25h");
    Ok(())
}

async fn cmd_doctor(home: &OverstoryHome, config: &Config) -> Result<()> {
    let mut failures = 0;
    let mut check = |name: &str, outcome: std::result::Result<String, String>| match outcome {
        Ok(detail) => println!("ok   {name}: {detail}"),
        Err(detail) => {
            failures += 1;
            println!("FAIL {name}: {detail}");
        }
    };

    let tmux = SystemTmuxClient::new();
    check(
        "tmux",
        tmux.check_available()
            .map_err(|e| e.to_string())
            .and_then(|v| {
                if v.meets_minimum(MIN_TMUX.0, MIN_TMUX.1) {
                    Ok(v.raw)
                } else {
                    Err(format!(
                        "{} is older than required {}.{}",
                        v.raw, MIN_TMUX.0, MIN_TMUX.1
                    ))
                }
            }),
    );
    check(
        "git",
        which::which("git")
            .map(|p| p.display().to_string())
            .map_err(|_| "not found in PATH".to_string()),
    );
    check(
        "claude",
        which::which("claude")
            .map(|p| p.display().to_string())
            .map_err(|_| "not found in PATH (agents cannot start)".to_string()),
    );
    if config.beads.enabled {
        check(
            "bd",
            which::which("bd")
                .map(|p| p.display().to_string())
                .map_err(|_| "not found in PATH (bead gates will fail)".to_string()),
        );
    }
    check(
        "config",
        config
            .validate()
            .map(|()| "valid".to_string())
            .map_err(|e| e.to_string()),
    );
    check(
        "stores",
        open_all_stores(home).map(|()| "all five open".to_string()),
    );

    if failures > 0 {
        return Err(Error::Config(format!("{failures} doctor check(s) failed")));
    }
    Ok(())
}

fn open_all_stores(home: &OverstoryHome) -> std::result::Result<(), String> {
    SessionStore::open(&home.sessions_db())
        .map(SessionStore::close)
        .map_err(|e| e.to_string())?;
    overstory::store::EventStore::open(&home.events_db())
        .map(overstory::store::EventStore::close)
        .map_err(|e| e.to_string())?;
    overstory::store::MailStore::open(&home.mail_db())
        .map(overstory::store::MailStore::close)
        .map_err(|e| e.to_string())?;
    MetricsStore::open(&home.metrics_db())
        .map(MetricsStore::close)
        .map_err(|e| e.to_string())?;
    MergeQueue::open(&home.merge_queue_db())
        .map(MergeQueue::close)
        .map_err(|e| e.to_string())?;
    Ok(())
}

async fn cmd_merge(
    home: &OverstoryHome,
    config: &Config,
    branch: Option<String>,
    into: Option<String>,
    json: bool,
) -> Result<()> {
    let engine = MergeEngine::new(home.clone(), config.clone());

    let provider_client;
    let provider: Option<&dyn ProviderClient> =
        if config.merge.ai_resolve_enabled || config.merge.reimagine_enabled {
            let command = ProviderCommand::for_capability(config, Capability::Merger, None);
            provider_client = CliProvider::new(command, Some(config.project_root()));
            Some(&provider_client)
        } else {
            None
        };

    if let Some(branch) = branch {
        let outcome = engine.merge_branch(&branch, into.as_deref(), provider).await?;
        if json {
            print_json(&outcome)?;
        } else {
            print_merge_outcome(&outcome);
        }
        return Ok(());
    }

    let outcomes = engine.process_queue(into.as_deref(), provider).await?;
    if json {
        print_json(&outcomes)?;
    } else if outcomes.is_empty() {
        println!("Merge queue is empty.");
    } else {
        for outcome in &outcomes {
            print_merge_outcome(outcome);
        }
    }
    Ok(())
}

fn print_merge_outcome(outcome: &overstory::merge::MergeOutcome) {
    if outcome.success {
        println!(
            "merged {} ({})",
            outcome.branch_name,
            outcome
                .tier
                .map_or("unknown", overstory::store::ResolveTier::as_str)
        );
    } else {
        println!(
            "conflict {}: {} [{}]",
            outcome.branch_name,
            outcome.error_message.as_deref().unwrap_or("unresolved"),
            outcome.conflict_files.join(", ")
        );
    }
}

async fn cmd_clean(home: &OverstoryHome, config: &Config, all: bool) -> Result<()> {
    let sessions = SessionStore::open(&home.sessions_db())?;
    let everyone = sessions.get_all()?;
    let repo = config.project_root();
    let manager = WorktreeManager::new(
        config
            .worktrees
            .base_dir
            .clone()
            .unwrap_or_else(|| home.worktrees_dir()),
    );

    let mut cleaned = 0usize;
    for session in &everyone {
        if session.state.is_active() {
            continue;
        }
        if manager.worktree_path(&session.agent_name).exists() {
            manager
                .cleanup_worktree(
                    &repo,
                    &session.agent_name,
                    Some(&session.branch_name),
                    true,
                )
                .await
                .map_err(|e| Error::Worktree(e.to_string()))?;
            cleaned += 1;
        }
        if overstory::mail::nudge::has_marker(home, &session.agent_name) {
            let _ = overstory::mail::nudge::take_marker(home, &session.agent_name);
            cleaned += 1;
        }
        if all {
            sessions.delete(&session.agent_name)?;
            cleaned += 1;
        }
    }

    if all {
        // orphan overstory refs with no session at all
        let refs = GitCli::overstory_refs(&repo)
            .await
            .map_err(|e| Error::Worktree(e.to_string()))?;
        for reference in refs {
            let known = everyone.iter().any(|s| s.branch_name == reference);
            if !known {
                let _ = GitCli::delete_branch(&repo, &reference, true).await;
                cleaned += 1;
            }
        }
    }
    sessions.close();

    if cleaned == 0 {
        println!("Nothing to clean.");
    } else {
        println!("cleaned {cleaned} item(s)");
    }
    Ok(())
}

fn cmd_logs(home: &OverstoryHome, tail: usize) -> Result<()> {
    let pattern = home.logs_dir().join("**").join("*.log");
    let mut files: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .map_err(|e| Error::Config(format!("bad glob: {e}")))?
        .filter_map(std::result::Result::ok)
        .collect();
    files.sort();

    if files.is_empty() {
        println!("No log files.");
        return Ok(());
    }
    for file in &files {
        println!("{}", file.display());
    }
    if let Some(newest) = files.last() {
        println!("\n==> {} <==", newest.display());
        let content = std::fs::read_to_string(newest)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", newest.display())))?;
        for line in content.lines().rev().take(tail).collect::<Vec<_>>().iter().rev() {
            println!("{line}");
        }
    }
    Ok(())
}

async fn cmd_watch(home: &OverstoryHome, config: &Config, once: bool) -> Result<()> {
    let tmux = SystemTmuxClient::new();

    let provider_client;
    let provider: Option<&dyn ProviderClient> = if config.watchdog.tier1_enabled {
        let command = ProviderCommand::for_capability(config, Capability::Monitor, None);
        provider_client = CliProvider::new(command, Some(config.project_root()));
        Some(&provider_client)
    } else {
        None
    };

    let watchdog = Watchdog::new(home, config, &tmux, provider);

    // immediate reconciliation pass before the loop: catch sessions that
    // died while no watchdog was running
    let report = watchdog.tick().await?;
    if !report.is_quiet() {
        tracing::info!(?report, "startup reconciliation");
    }
    if once {
        print_json(&report)?;
        return Ok(());
    }
    if !config.watchdog.tier0_enabled {
        return Err(Error::Config(
            "watchdog.tier0Enabled is false; nothing to run".to_string(),
        ));
    }

    let mut interval =
        tokio::time::interval(Duration::from_millis(config.watchdog.tier0_interval_ms.max(500)));
    interval.tick().await; // first tick fires immediately; already done above

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match watchdog.tick().await {
                    Ok(report) if !report.is_quiet() => {
                        tracing::info!(?report, "watchdog tick");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "watchdog tick failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("watchdog stopping");
                break;
            }
        }
    }
    Ok(())
}

async fn cmd_feed(
    home: &OverstoryHome,
    args: &QueryArgs,
    follow: bool,
    json: bool,
) -> Result<()> {
    let options = args.options();
    let rows = query::replay(home, &options)?;
    let mut cursor = rows.last().map_or(0, |e| e.id);
    if json {
        print_json(&rows)?;
    } else {
        for event in &rows {
            println!(
                "{} {} {} {}",
                event.created_at,
                event.agent_name,
                event.event_type,
                event.tool_name.as_deref().unwrap_or("")
            );
        }
    }
    if !follow {
        return Ok(());
    }

    let mut interval = tokio::time::interval(Duration::from_millis(1000));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let fresh = query::feed_after(home, &options, cursor)?;
                for event in &fresh {
                    cursor = cursor.max(event.id);
                    if json {
                        print_json(event)?;
                    } else {
                        println!(
                            "{} {} {} {}",
                            event.created_at,
                            event.agent_name,
                            event.event_type,
                            event.tool_name.as_deref().unwrap_or("")
                        );
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

async fn cmd_lifecycle(
    home: &OverstoryHome,
    config: &Config,
    capability: Capability,
    name: &str,
    action: LifecycleAction,
    json: bool,
) -> Result<()> {
    match action {
        LifecycleAction::Start { objective } => {
            // coordinators open a run when none is active
            if capability == Capability::Coordinator
                && paths::read_pointer(&home.current_run_file()).is_none()
            {
                let run_id = uuid::Uuid::new_v4().to_string();
                let sessions = SessionStore::open(&home.sessions_db())?;
                sessions.create_run(&run_id, objective.as_deref().unwrap_or(""))?;
                sessions.close();
                paths::write_pointer(&home.current_run_file(), &run_id)?;
            }

            let tmux = SystemTmuxClient::new();
            check_tmux(&tmux)?;
            let request = SlingRequest {
                capability,
                name: name.to_string(),
                spec: None,
                files: Vec::new(),
                parent: None,
                depth: Some(0),
                force_hierarchy: false,
                bead_id: None,
            };
            let session = Sling::new(home, config, &tmux).sling(&request).await?;
            if json {
                print_json(&session)?;
            } else {
                println!("{name} started in {}", session.tmux_session);
            }
            Ok(())
        }
        LifecycleAction::Stop => {
            let tmux = SystemTmuxClient::new();
            let session = stop_agent(home, &tmux, name)?;
            if json {
                print_json(&session)?;
            } else {
                println!("{name} stopped");
            }
            Ok(())
        }
        LifecycleAction::Status => {
            let sessions = SessionStore::open(&home.sessions_db())?;
            let session = sessions.get_by_name(name)?;
            sessions.close();
            match session {
                Some(session) if json => print_json(&session),
                Some(session) => {
                    println!("{name}: {}", session.state);
                    Ok(())
                }
                None => {
                    println!("{name}: not started");
                    Ok(())
                }
            }
        }
    }
}

fn cmd_hooks(config: &Config, command: HooksCommands, json: bool) -> Result<()> {
    let target = |worktree: Option<PathBuf>| worktree.unwrap_or_else(|| config.project_root());
    match command {
        HooksCommands::Install {
            worktree,
            capability,
        } => {
            let capability: Capability = capability.parse()?;
            let path = target(worktree);
            hooks::deploy(&path, capability)?;
            println!("hooks installed in {}", path.display());
            Ok(())
        }
        HooksCommands::Uninstall { worktree } => {
            let path = target(worktree);
            let existed = hooks::uninstall(&path)?;
            println!(
                "{}",
                if existed {
                    "hooks removed"
                } else {
                    "no hooks were installed"
                }
            );
            Ok(())
        }
        HooksCommands::Status { worktree } => {
            let path = target(worktree);
            let installed = hooks::is_installed(&path);
            if json {
                print_json(&serde_json::json!({ "installed": installed, "path": path }))?;
            } else {
                println!(
                    "hooks {} in {}",
                    if installed { "installed" } else { "absent" },
                    path.display()
                );
            }
            Ok(())
        }
    }
}

async fn cmd_mail(home: &OverstoryHome, command: MailCommands, json: bool) -> Result<()> {
    let broker = MailBroker::open(home)?;
    match command {
        MailCommands::Send {
            from,
            to,
            subject,
            body,
            mail_type,
            priority,
            payload,
        } => {
            if let Some(raw) = &payload {
                // payload must be valid JSON before it is stored
                serde_json::from_str::<serde_json::Value>(raw)
                    .map_err(|e| Error::validation("payload", format!("invalid JSON: {e}")))?;
            }
            let request = SendRequest {
                from,
                to,
                subject,
                body,
                mail_type: mail_type.parse::<MailType>()?,
                priority: priority.parse::<MailPriority>()?,
                payload,
            };
            let sent = broker.send(&request)?;
            if json {
                print_json(&sent)?;
            } else {
                for message in &sent {
                    println!("sent {} to {}", message.id, message.to);
                }
            }
            Ok(())
        }
        MailCommands::Check {
            agent,
            inject,
            debounce,
        } => {
            let agent = agent
                .or_else(|| std::env::var("OVERSTORY_AGENT_NAME").ok())
                .ok_or_else(|| {
                    Error::validation("agent", "pass --agent or set OVERSTORY_AGENT_NAME")
                })?;
            if inject {
                if let Some(block) = broker.check_inject(&agent, debounce)? {
                    println!("{block}");
                }
                return Ok(());
            }
            let messages = broker.check(&agent)?;
            if json {
                print_json(&messages)?;
            } else if messages.is_empty() {
                println!("No new mail.");
            } else {
                for message in &messages {
                    println!(
                        "[{}] {} -> {} ({}/{}): {}\n{}",
                        message.id,
                        message.from,
                        message.to,
                        message.mail_type,
                        message.priority,
                        message.subject,
                        message.body
                    );
                }
            }
            Ok(())
        }
        MailCommands::List {
            from,
            to,
            unread,
            limit,
        } => {
            let messages = broker.list(&MailFilter {
                from,
                to,
                unread: if unread { Some(true) } else { None },
                limit,
            })?;
            if json {
                print_json(&messages)?;
            } else {
                for message in &messages {
                    println!(
                        "[{}] {} -> {} ({}/{}) {} {}",
                        message.id,
                        message.from,
                        message.to,
                        message.mail_type,
                        message.priority,
                        if message.read { "read" } else { "unread" },
                        message.subject
                    );
                }
            }
            Ok(())
        }
        MailCommands::Read { id } => {
            let already_read = broker.mark_read(&id)?;
            if json {
                print_json(&serde_json::json!({ "id": id, "alreadyRead": already_read }))?;
            } else {
                println!(
                    "{id} {}",
                    if already_read {
                        "(already read)"
                    } else {
                        "marked read"
                    }
                );
            }
            Ok(())
        }
        MailCommands::Reply { id, body, from } => {
            let reply = broker.reply(&id, &body, &from)?;
            if json {
                print_json(&reply)?;
            } else {
                println!("sent {} to {}", reply.id, reply.to);
            }
            Ok(())
        }
        MailCommands::Purge {
            all,
            older_than_ms,
            agent,
        } => {
            let removed = broker.purge(&PurgeFilter {
                all,
                older_than_ms,
                agent_name: agent,
            })?;
            println!("purged {removed} message(s)");
            Ok(())
        }
    }
}

fn cmd_group(home: &OverstoryHome, command: GroupCommands, json: bool) -> Result<()> {
    let mut groups = Groups::load(home);
    match command {
        GroupCommands::Create { name } => {
            groups.create(&name)?;
            groups.save(home)?;
            println!("created group @{name}");
            Ok(())
        }
        GroupCommands::Status { name } => {
            let members = groups
                .members(&name)
                .ok_or_else(|| Error::Mail(format!("no group named '{name}'")))?;
            if json {
                print_json(&serde_json::json!({ "name": name, "members": members }))?;
            } else {
                println!("@{name}: {}", members.join(", "));
            }
            Ok(())
        }
        GroupCommands::Add { name, member } => {
            groups.add(&name, &member)?;
            groups.save(home)?;
            println!("added {member} to @{name}");
            Ok(())
        }
        GroupCommands::Remove { name, member } => {
            groups.remove(&name, &member)?;
            groups.save(home)?;
            println!("removed {member} from @{name}");
            Ok(())
        }
        GroupCommands::List => {
            let names: Vec<_> = groups.names().cloned().collect();
            if json {
                print_json(&names)?;
            } else if names.is_empty() {
                println!("No groups.");
            } else {
                for name in names {
                    println!("@{name}");
                }
            }
            Ok(())
        }
    }
}

async fn cmd_worktree(
    home: &OverstoryHome,
    config: &Config,
    command: WorktreeCommands,
    json: bool,
) -> Result<()> {
    let manager = WorktreeManager::new(
        config
            .worktrees
            .base_dir
            .clone()
            .unwrap_or_else(|| home.worktrees_dir()),
    );
    match command {
        WorktreeCommands::List => {
            let agents = manager
                .list_on_disk()
                .await
                .map_err(|e| Error::Worktree(e.to_string()))?;
            if json {
                print_json(&agents)?;
            } else if agents.is_empty() {
                println!("No worktrees.");
            } else {
                for agent in agents {
                    println!("{}", home.worktree_dir(&agent).display());
                }
            }
            Ok(())
        }
        WorktreeCommands::Clean => {
            let sessions = SessionStore::open(&home.sessions_db())?;
            let active: Vec<String> = sessions
                .get_active()?
                .into_iter()
                .map(|s| s.agent_name)
                .collect();
            let everyone = sessions.get_all()?;
            sessions.close();

            let repo = config.project_root();
            let mut removed = 0;
            for agent in manager
                .list_on_disk()
                .await
                .map_err(|e| Error::Worktree(e.to_string()))?
            {
                if active.contains(&agent) {
                    continue;
                }
                let branch = everyone
                    .iter()
                    .find(|s| s.agent_name == agent)
                    .map(|s| s.branch_name.clone());
                manager
                    .cleanup_worktree(&repo, &agent, branch.as_deref(), true)
                    .await
                    .map_err(|e| Error::Worktree(e.to_string()))?;
                removed += 1;
            }
            if removed == 0 {
                println!("Nothing to clean.");
            } else {
                println!("removed {removed} worktree(s)");
            }
            Ok(())
        }
    }
}

fn cmd_run(home: &OverstoryHome, command: RunCommands, json: bool) -> Result<()> {
    let sessions = SessionStore::open(&home.sessions_db())?;
    let result = match command {
        RunCommands::List => {
            let runs = sessions.list_runs()?;
            if json {
                print_json(&runs)?;
            } else if runs.is_empty() {
                println!("No runs.");
            } else {
                let current = paths::read_pointer(&home.current_run_file());
                for run in runs {
                    let marker = if current.as_deref() == Some(run.id.as_str()) {
                        " (current)"
                    } else {
                        ""
                    };
                    println!(
                        "{}{} {} {}",
                        run.id,
                        marker,
                        if run.completed_at.is_some() {
                            "completed"
                        } else {
                            "open"
                        },
                        run.objective
                    );
                }
            }
            Ok(())
        }
        RunCommands::Show { id } => {
            let run = sessions
                .get_run(&id)?
                .ok_or_else(|| Error::validation("run", format!("no run '{id}'")))?;
            let members = sessions.get_by_run(&id)?;
            if json {
                print_json(&serde_json::json!({ "run": run, "sessions": members }))?;
            } else {
                println!("{} {}", run.id, run.objective);
                for session in members {
                    println!("  {} [{}] {}", session.agent_name, session.capability, session.state);
                }
            }
            Ok(())
        }
        RunCommands::Complete { id } => {
            sessions.complete_run(&id)?;
            if paths::read_pointer(&home.current_run_file()).as_deref() == Some(id.as_str()) {
                paths::clear_pointer(&home.current_run_file())?;
            }
            println!("run {id} completed");
            Ok(())
        }
    };
    sessions.close();
    result
}

fn cmd_agents_discover(home: &OverstoryHome, json: bool) -> Result<()> {
    let manifest = Manifest::load(home)?;
    let mut identities = Vec::new();
    if let Ok(entries) = std::fs::read_dir(home.agents_dir()) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Ok(Some(identity)) = identity::load(home, &name) {
                identities.push(identity);
            }
        }
    }
    identities.sort_by(|a, b| a.name.cmp(&b.name));

    if json {
        print_json(&serde_json::json!({
            "manifest": manifest,
            "identities": identities,
        }))?;
    } else {
        println!("capabilities:");
        let mut roles: Vec<_> = manifest.roles.keys().collect();
        roles.sort();
        for role in roles {
            println!("  {role}");
        }
        println!("known agents:");
        if identities.is_empty() {
            println!("  (none)");
        }
        for identity in identities {
            println!(
                "  {} [{}] {} session(s)",
                identity.name, identity.capability, identity.sessions_run
            );
        }
    }
    Ok(())
}

fn read_stdin() -> Result<String> {
    let mut buffer = String::new();
    std::io::stdin()
        .read_to_string(&mut buffer)
        .map_err(|e| Error::validation("stdin", format!("cannot read stdin: {e}")))?;
    Ok(buffer)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
