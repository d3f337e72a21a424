use std::{
	io::Read,
	path::{Path, PathBuf},
	process,
};

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use reqman::{
	config::{Config, ConfigError, LoggingConfig},
	db::{self, DbError},
	engine::{JobStore, JobStoreError, ListFilter, QueueError, RequestQueue},
	models::{Request, RequestStatus},
};
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "reqman")]
#[command(about = "Persistent request queue for grid data management", version)]
struct Cli {
	/// Configuration file (default: <data dir>/reqman/reqman.toml)
	#[arg(long, short = 'c', global = true)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Store a request read as JSON from a file or stdin
	Put {
		/// JSON file; stdin when omitted
		file: Option<PathBuf>,
	},

	/// Fetch one request, or a random waiting one when no ID is given
	Get {
		id: Option<String>,

		/// Check the request out as Assigned
		#[arg(long)]
		assign: bool,
	},

	/// Fetch several waiting requests at once
	GetBulk {
		#[arg(long, default_value_t = 10)]
		limit: usize,

		#[arg(long)]
		assign: bool,
	},

	Cancel {
		id: String,
	},

	Status {
		id: String,
	},

	/// One line per operation
	Digest {
		id: String,
	},

	/// List request IDs, oldest update first
	List {
		/// Comma separated statuses (e.g. "Waiting,Failed")
		#[arg(long, value_delimiter = ',')]
		status: Vec<String>,

		/// RFC 3339 lower bound on last update
		#[arg(long)]
		since: Option<String>,

		/// RFC 3339 upper bound on last update
		#[arg(long)]
		until: Option<String>,

		#[arg(long, default_value_t = 1000)]
		limit: usize,
	},

	Delete {
		id: String,
	},

	/// Request ID for a request name
	Find {
		name: String,
	},

	/// Show transfer jobs, the active ones unless an operation is given
	Jobs {
		#[arg(long)]
		operation: Option<String>,
	},

	/// One transfer job with its files, as JSON
	Job {
		job_id: String,
	},

	/// Accounting record of a finished transfer job
	Accounting {
		job_id: String,
	},
}

#[derive(Debug, Error)]
enum CliError {
	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error(transparent)]
	Db(#[from] DbError),

	#[error(transparent)]
	Queue(#[from] QueueError),

	#[error(transparent)]
	Jobs(#[from] JobStoreError),

	#[error("cannot read request: {0}")]
	Input(#[from] std::io::Error),

	#[error("invalid request JSON: {0}")]
	Json(#[from] serde_json::Error),

	#[error("{0}")]
	Usage(String),
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	let config = match Config::load_or_default(cli.config.as_deref()) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("Error: {e}");
			process::exit(2);
		}
	};
	init_logging(&config.logging);

	if let Err(e) = run(cli.command, &config).await {
		tracing::error!(error = %e, "command failed");
		eprintln!("Error: {e}");
		process::exit(1);
	}
}

fn init_logging(cfg: &LoggingConfig) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.filter));
	let registry = tracing_subscriber::registry().with(filter);

	match &cfg.directory {
		Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
			let file_appender = tracing_appender::rolling::never(dir, "reqman.log");
			registry.with(fmt::layer().with_ansi(false).with_writer(file_appender)).init();
		}
		_ => registry.with(fmt::layer().with_writer(std::io::stderr)).init(),
	}
}

async fn run(command: Commands, config: &Config) -> Result<(), CliError> {
	let handle = db::init(&config.database).await?;
	let queue = RequestQueue::new(handle.clone());

	match command {
		Commands::Put { file } => {
			let mut request: Request = serde_json::from_str(&read_input(file.as_deref())?)?;
			println!("{}", queue.put(&mut request).await?);
		}
		Commands::Get { id, assign } => match queue.get(id.as_deref(), assign).await? {
			Some(request) => println!("{}", serde_json::to_string_pretty(&request)?),
			None => println!("no eligible request"),
		},
		Commands::GetBulk { limit, assign } => {
			let requests = queue.get_bulk(limit, assign).await?;
			println!("{}", serde_json::to_string_pretty(&requests)?);
		}
		Commands::Cancel { id } => queue.cancel(&id).await?,
		Commands::Status { id } => println!("{}", queue.get_status(&id).await?),
		Commands::Digest { id } => println!("{}", queue.get_digest(&id).await?),
		Commands::List { status, since, until, limit } => {
			let statuses = status
				.iter()
				.map(|s| s.parse::<RequestStatus>())
				.collect::<Result<Vec<_>, _>>()
				.map_err(CliError::Usage)?;
			let filter = ListFilter {
				statuses,
				since: since.as_deref().map(parse_time).transpose()?,
				until: until.as_deref().map(parse_time).transpose()?,
				limit,
			};
			for id in queue.list_ids(&filter).await? {
				println!("{id}");
			}
		}
		Commands::Delete { id } => queue.delete(&id).await?,
		Commands::Find { name } => println!("{}", queue.request_id_for_name(&name).await?),
		Commands::Jobs { operation } => {
			let jobs = JobStore::new(handle);
			let list = match operation {
				Some(op) => jobs.for_operation(&op).await?,
				None => jobs.active().await?,
			};
			for job in list {
				println!(
					"{}\t{}\t{}\t{}%\t{} -> {}",
					job.job_id,
					job.fts_guid.as_deref().unwrap_or("-"),
					job.status,
					job.completeness,
					job.source_se,
					job.target_se,
				);
			}
		}
		Commands::Job { job_id } => {
			let job = JobStore::new(handle).get(&job_id).await?;
			println!("{}", serde_json::to_string_pretty(&job)?);
		}
		Commands::Accounting { job_id } => match JobStore::new(handle).accounting(&job_id).await? {
			Some(acc) => println!("{}", serde_json::to_string_pretty(&acc)?),
			None => println!("no accounting for {job_id}"),
		},
	}
	Ok(())
}

fn read_input(file: Option<&Path>) -> Result<String, std::io::Error> {
	match file {
		Some(path) => std::fs::read_to_string(path),
		None => {
			let mut text = String::new();
			std::io::stdin().read_to_string(&mut text)?;
			Ok(text)
		}
	}
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, CliError> {
	DateTime::parse_from_rfc3339(s)
		.map(|t| t.with_timezone(&Utc))
		.map_err(|e| CliError::Usage(format!("invalid time {s}: {e}")))
}
