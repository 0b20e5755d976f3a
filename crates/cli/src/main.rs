//! DevPulse CLI - delivery metrics from GitLab.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use devpulse_core::{DateWindow, Project, ProjectId};
use devpulse_ingest::{ClientConfig, GitLabClient, RefreshConfig, RefreshService};
use devpulse_metrics::{ActivityAnalyzer, CycleTimeAnalyzer, FourKeysCalculator};
use devpulse_storage::{SqliteStorage, Storage};

#[derive(Parser)]
#[command(name = "devpulse")]
#[command(about = "DORA Four Keys and team activity metrics for GitLab projects", long_about = None)]
struct Cli {
    /// SQLite database file
    #[arg(long, global = true, env = "DEVPULSE_DATABASE", default_value = "devpulse.db")]
    database: PathBuf,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, env = "DEVPULSE_LOG", default_value = "info")]
    log: String,

    /// GitLab API base URL
    #[arg(long, global = true, env = "GITLAB_API_URL")]
    api_url: Option<String>,

    /// GitLab access token
    #[arg(long, global = true, env = "GITLAB_ACCESS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Maximum GitLab requests per minute
    #[arg(long, global = true, env = "GITLAB_RATE_LIMIT_PER_MINUTE")]
    rate_limit: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage registered projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Refresh one project from GitLab
    Refresh {
        /// Project ID
        id: String,
        /// Days of history to fetch
        #[arg(long)]
        days_back: Option<i64>,
        /// Also refresh merge requests and team members
        #[arg(long)]
        activity: bool,
        /// Fetch review data from merge request notes
        #[arg(long)]
        reviews: bool,
    },
    /// Refresh every project and store metric snapshots
    RefreshAll {
        /// Fetch review data from merge request notes
        #[arg(long)]
        reviews: bool,
    },
    /// DORA Four Keys for a date range
    FourKeys {
        /// Project ID
        id: String,
        #[command(flatten)]
        range: DateRange,
        /// Store the result as a snapshot
        #[arg(long)]
        save: bool,
    },
    /// Merge request cycle time for a date range
    CycleTime {
        /// Project ID
        id: String,
        #[command(flatten)]
        range: DateRange,
        /// Print per merge request entries instead of the aggregate
        #[arg(long)]
        distribution: bool,
        /// Maximum number of distribution entries
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Per-member activity and review load for a date range
    TeamActivity {
        /// Project ID
        id: String,
        #[command(flatten)]
        range: DateRange,
        /// Store per-member snapshots
        #[arg(long)]
        save: bool,
    },
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Register a GitLab project
    Add {
        /// GitLab project id
        gitlab_id: i64,
        /// Display name (looked up on GitLab when omitted)
        #[arg(long)]
        name: Option<String>,
        /// Web URL (looked up on GitLab when omitted)
        #[arg(long)]
        url: Option<String>,
    },
    /// List registered projects
    List,
    /// Show a project with record counts
    Show {
        /// Project ID
        id: String,
    },
    /// Remove a project and all of its data
    Remove {
        /// Project ID
        id: String,
    },
}

#[derive(clap::Args)]
struct DateRange {
    /// First day (YYYY-MM-DD)
    #[arg(long)]
    start: String,
    /// Last day, inclusive (YYYY-MM-DD)
    #[arg(long)]
    end: String,
}

impl DateRange {
    fn window(&self) -> Result<DateWindow> {
        Ok(DateWindow::from_dates(&self.start, &self.end)?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let storage = Arc::new(
        SqliteStorage::new_from_path(&cli.database)
            .await
            .with_context(|| format!("opening database {}", cli.database.display()))?,
    );

    match &cli.command {
        Commands::Project { command } => match command {
            ProjectCommands::Add { gitlab_id, name, url } => {
                let (name, url) = match (name, url) {
                    (Some(name), Some(url)) => (name.clone(), url.clone()),
                    (name, url) => {
                        let client = gitlab_client(&cli)?;
                        let Some(remote) = client.get_project(*gitlab_id).await? else {
                            bail!("GitLab project {} not found", gitlab_id);
                        };
                        (
                            name.clone().unwrap_or(remote.name),
                            url.clone().unwrap_or(remote.web_url),
                        )
                    }
                };
                let project = Project::new(*gitlab_id, name, url);
                storage.register_project(&project).await?;
                info!("Registered project {} ({})", project.name, project.id);
                print_json(&project)?;
            }
            ProjectCommands::List => {
                let projects = storage.list_projects().await?;
                print_json(&projects)?;
            }
            ProjectCommands::Show { id } => {
                let id = parse_id(id)?;
                let Some(project) = storage.load_project(id).await? else {
                    bail!("Project not found: {}", id);
                };
                let deployments = storage.count_deployments(id).await?;
                let merge_requests = storage.count_merge_requests(id).await?;
                let members = storage.list_team_members(id).await?.len();
                print_json(&json!({
                    "project": project,
                    "deployments": deployments,
                    "merge_requests": merge_requests,
                    "team_members": members,
                }))?;
            }
            ProjectCommands::Remove { id } => {
                let id = parse_id(id)?;
                if !storage.delete_project(id).await? {
                    bail!("Project not found: {}", id);
                }
                println!("Removed project {}", id);
            }
        },
        Commands::Refresh { id, days_back, activity, reviews } => {
            let id = parse_id(id)?;
            let config = RefreshConfig {
                fetch_reviews: *reviews,
                ..Default::default()
            };
            let days_back = days_back.unwrap_or(config.days_back);
            let service = RefreshService::new(storage.clone(), gitlab_client(&cli)?, config);

            let deployments = service.refresh(id, days_back).await?;
            let activity = if *activity {
                Some(service.refresh_activity(id, days_back).await?)
            } else {
                None
            };
            print_json(&json!({
                "deployments": deployments,
                "activity": activity,
            }))?;
        }
        Commands::RefreshAll { reviews } => {
            let config = RefreshConfig {
                fetch_reviews: *reviews,
                ..Default::default()
            };
            let service = RefreshService::new(storage.clone(), gitlab_client(&cli)?, config);
            let summary = service.refresh_all().await?;
            if summary.projects_failed > 0 {
                warn!("{} project(s) failed to refresh", summary.projects_failed);
            }
            print_json(&summary)?;
        }
        Commands::FourKeys { id, range, save } => {
            let id = parse_id(id)?;
            let window = range.window()?;
            let calculator = FourKeysCalculator::new(storage.clone());
            let result = if *save {
                calculator.calculate_and_save(id, &window).await?
            } else {
                calculator.calculate(id, &window).await?
            };
            print_json(&result)?;
        }
        Commands::CycleTime { id, range, distribution, limit } => {
            let id = parse_id(id)?;
            let window = range.window()?;
            let analyzer = CycleTimeAnalyzer::new(storage.clone());
            if *distribution {
                let mut entries = analyzer.get_distribution(id, &window).await?;
                if let Some(limit) = limit {
                    entries.truncate(*limit);
                }
                print_json(&entries)?;
            } else {
                print_json(&analyzer.calculate_metrics(id, &window).await?)?;
            }
        }
        Commands::TeamActivity { id, range, save } => {
            let id = parse_id(id)?;
            let window = range.window()?;
            let analyzer = ActivityAnalyzer::new(storage.clone());
            let members = if *save {
                analyzer.calculate_and_save(id, &window).await?
            } else {
                analyzer.calculate_activity_metrics(id, &window).await?
            };
            let review_load = analyzer.get_review_load_distribution(id, &window).await?;
            print_json(&json!({
                "window": window,
                "members": members,
                "review_load": review_load,
            }))?;
        }
    }

    Ok(())
}

/// Build a GitLab client from the global flags.
fn gitlab_client(cli: &Cli) -> Result<GitLabClient> {
    let mut config = ClientConfig {
        access_token: cli.token.clone(),
        ..Default::default()
    };
    if let Some(api_url) = &cli.api_url {
        config.api_url = api_url.clone();
    }
    if let Some(rate_limit) = cli.rate_limit {
        config.rate_limit_per_minute = rate_limit;
    }
    Ok(GitLabClient::new(config)?)
}

fn parse_id(id: &str) -> Result<ProjectId> {
    id.parse().with_context(|| format!("invalid project id '{}'", id))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_cycle_time_flags() {
        let cli = Cli::try_parse_from([
            "devpulse",
            "cycle-time",
            "01J0000000000000000000000A",
            "--start",
            "2024-01-01",
            "--end",
            "2024-01-31",
            "--distribution",
            "--limit",
            "5",
        ])
        .unwrap();

        let Commands::CycleTime { range, distribution, limit, .. } = cli.command else {
            panic!("expected cycle-time");
        };
        assert!(distribution);
        assert_eq!(limit, Some(5));
        let window = range.window().unwrap();
        assert_eq!(window.days(), 30);
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let range = DateRange {
            start: "2024-02-01".to_string(),
            end: "2024-01-01".to_string(),
        };
        assert!(range.window().is_err());
    }
}
