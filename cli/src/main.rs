use anyhow::{bail, Context};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use common::{
    CleanupResponse, ErrorResponse, HistoryResponse, JobDetailResponse, JobStats, JobSummary, LogsResponse,
    StatusResponse,
};
use serde::de::DeserializeOwned;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Base URL of the sandrun-daemon history API
    #[arg(long, global = true, default_value_t = format!("http://{}", common::DEFAULT_API_ADDR))]
    url: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Csv,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status and stale running jobs
    Status,
    /// List executed jobs, newest first
    History {
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
        /// Only jobs in this status (e.g. completed, failed)
        #[arg(short, long)]
        status: Option<String>,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Success and failure counts
    Stats,
    /// Print the captured output of a job
    Logs {
        id: String,
    },
    /// Show details for one job
    Show {
        id: String,
    },
    /// Delete finished jobs older than N days
    Cleanup {
        #[arg(long, default_value_t = 30)]
        older_than_days: u32,
    },
}

struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    fn new(base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> anyhow::Result<T> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach sandrun-daemon at {}", self.base))?;
        let status = response.status();
        if !status.is_success() {
            let detail = match response.json::<ErrorResponse>().await {
                Ok(err) => err.detail,
                Err(_) => status.to_string(),
            };
            bail!("{} ({})", detail, status.as_u16());
        }
        Ok(response.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> anyhow::Result<T> {
        self.send(self.http.get(format!("{}{}", self.base, path)).query(query))
            .await
    }

    async fn delete<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> anyhow::Result<T> {
        self.send(self.http.delete(format!("{}{}", self.base, path)).query(query))
            .await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = Client::new(&cli.url);

    match cli.command {
        Commands::Status => {
            let status: StatusResponse = client.get("/status", &[]).await?;
            println!("{} {} ({})", status.app, status.version, status.identity);
            for (component, state) in &status.components {
                println!("  {:<12} {}", component, state);
            }
            if status.stale_running.is_empty() {
                println!("No stale running jobs.");
            } else {
                println!("Stale running jobs:");
                for job in status.stale_running {
                    println!("  {:<24} {:<24} since {}", job.id, job.name, format_time(job.started_at));
                }
            }
        }
        Commands::History { limit, status, format } => {
            let mut query = vec![("limit", limit.to_string())];
            if let Some(status) = status {
                query.push(("status", status));
            }
            let history: HistoryResponse = client.get("/jobs/history", &query).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&history.jobs)?),
                OutputFormat::Csv => print!("{}", history_csv(&history.jobs)?),
                OutputFormat::Table => {
                    if history.jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!("{}", history_table(&history.jobs));
                    }
                }
            }
        }
        Commands::Stats => {
            let stats: JobStats = client.get("/jobs/stats", &[]).await?;
            print_stats(&stats);
        }
        Commands::Logs { id } => {
            let logs: LogsResponse = client.get(&format!("/jobs/history/{}/logs", id), &[]).await?;
            println!("{}", logs.logs);
        }
        Commands::Show { id } => {
            let detail: JobDetailResponse = client.get(&format!("/jobs/history/{}", id), &[]).await?;
            let job = &detail.job;
            println!("Job Details:");
            println!("  ID:        {}", job.id);
            println!("  Name:      {}", job.name);
            println!("  Status:    {}", job.status);
            println!("  Requester: {}", job.requester_identity);
            println!("  Created:   {}", format_time(Some(job.created_at)));
            println!("  Started:   {}", format_time(job.started_at));
            println!("  Completed: {}", format_time(job.completed_at));
            println!("  Duration:  {}", format_seconds(job.execution_time));
            println!(
                "  Exit code: {}",
                job.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string())
            );
            if !job.tags.is_empty() {
                println!("  Tags:      {}", job.tags.join(", "));
            }
        }
        Commands::Cleanup { older_than_days } => {
            let result: CleanupResponse = client
                .delete(
                    "/jobs/history/cleanup",
                    &[("older_than_days", older_than_days.to_string())],
                )
                .await?;
            println!("{}", result.message);
            if result.failed > 0 {
                eprintln!("{} record(s) could not be removed, see the daemon log", result.failed);
            }
        }
    }

    Ok(())
}

fn format_time(at: Option<DateTime<Utc>>) -> String {
    match at {
        Some(at) => at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".to_string(),
    }
}

fn format_seconds(secs: Option<f64>) -> String {
    match secs {
        Some(s) if s >= 60.0 => format!("{}m {:.0}s", (s / 60.0).floor(), s % 60.0),
        Some(s) => format!("{:.1}s", s),
        None => "-".to_string(),
    }
}

fn history_table(jobs: &[JobSummary]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["ID", "Name", "Status", "Requester", "Created", "Duration", "Exit"]);
    for job in jobs {
        table.add_row(vec![
            job.id.to_string(),
            job.name.clone(),
            job.status.to_string(),
            job.requester_identity.clone(),
            format_time(Some(job.created_at)),
            format_seconds(job.execution_time),
            job.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
        ]);
    }
    table
}

fn history_csv(jobs: &[JobSummary]) -> anyhow::Result<String> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record([
        "id",
        "name",
        "status",
        "requester_identity",
        "created_at",
        "completed_at",
        "execution_time",
        "exit_code",
    ])?;
    for job in jobs {
        wtr.write_record([
            job.id.to_string(),
            job.name.clone(),
            job.status.to_string(),
            job.requester_identity.clone(),
            job.created_at.to_rfc3339(),
            job.completed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            job.execution_time.map(|s| s.to_string()).unwrap_or_default(),
            job.exit_code.map(|c| c.to_string()).unwrap_or_default(),
        ])?;
    }
    let bytes = wtr.into_inner().map_err(|e| anyhow::anyhow!("Failed to flush CSV: {}", e))?;
    Ok(String::from_utf8(bytes)?)
}

fn print_stats(stats: &JobStats) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec!["Metric", "Value"]);
    table.add_row(vec!["Finished".to_string(), stats.total.to_string()]);
    table.add_row(vec!["Successful".to_string(), stats.successful.to_string()]);
    table.add_row(vec!["Failed".to_string(), stats.failed.to_string()]);
    table.add_row(vec!["Success rate".to_string(), format!("{:.2}%", stats.success_rate)]);
    table.add_row(vec!["Running".to_string(), stats.running.to_string()]);
    table.add_row(vec!["Pending".to_string(), stats.pending.to_string()]);
    table.add_row(vec!["Rejected".to_string(), stats.rejected.to_string()]);
    println!("{}", table);
}
