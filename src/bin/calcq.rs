//! calcq CLI: run the pipeline processes and inspect jobs.

use calcq::compute::Arithmetic;
use calcq::config::Config;
use calcq::config::secrets::redacted_url;
use calcq::db::Db;
use calcq::db::pgmq::PgmqQueue;
use calcq::model::{JobId, NewJob};
use calcq::pipeline::{CompletionLoop, LoopConfig, Reconciler, Submitter, Worker};
use calcq::queue::{QueueSettings, WorkQueue};
use calcq::store::JobStore;
use calcq::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "calcq", about = "Asynchronous calculation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API and run the completion loop
    Serve {
        /// Also re-enqueue jobs left pending longer than RECONCILE_AFTER_SECS
        #[arg(long)]
        reconcile: bool,
    },
    /// Run the calculator worker loop
    Calculator,
    /// Submit an expression
    Submit {
        /// Expression to evaluate, e.g. "2 * (3+4)"
        expression: String,
        /// Who is submitting
        #[arg(long, default_value = "cli")]
        submitter: String,
    },
    /// Show a job
    Show {
        /// Job ID
        id: String,
    },
    /// Re-enqueue requests for jobs stuck in pending
    Reconcile {
        /// Minimum job age in seconds (default: RECONCILE_AFTER_SECS)
        #[arg(long)]
        older_than_secs: Option<u64>,
        /// Maximum jobs to re-enqueue
        #[arg(long, default_value_t = 500)]
        limit: i64,
    },
}

/// Store and channels shared by every command.
struct Wiring {
    db: Db,
    requests: Arc<dyn WorkQueue>,
    results: Arc<dyn WorkQueue>,
    dead_letters: Arc<dyn WorkQueue>,
}

impl Wiring {
    async fn connect(config: &Config) -> anyhow::Result<Self> {
        info!(database = %redacted_url(&config.database_url), "connecting");
        let db = Db::connect(config.database_url.expose_secret()).await?;
        db.migrate().await?;

        let settings = QueueSettings {
            visibility_timeout: config.visibility_timeout,
            batch_size: config.receive_batch_size,
        };
        let open = |name: &str| PgmqQueue::new(db.clone(), name, settings);
        let requests = open(&config.queues.request);
        let results = open(&config.queues.result);
        let dead_letters = open(&config.queues.dead_letter);
        for queue in [&requests, &results, &dead_letters] {
            queue.ensure_created().await?;
        }

        Ok(Self {
            db,
            requests: Arc::new(requests),
            results: Arc::new(results),
            dead_letters: Arc::new(dead_letters),
        })
    }

    fn store(&self) -> Arc<dyn JobStore> {
        Arc::new(self.db.clone())
    }
}

fn loop_config(config: &Config) -> LoopConfig {
    LoopConfig {
        receive_wait: config.receive_wait,
        max_deliveries: config.max_deliveries,
    }
}

fn telemetry(config: &Config, service_name: &str) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: service_name.to_string(),
        log_level: config.log_level.clone(),
    })?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { reconcile } => cmd_serve(&config, reconcile).await,
        Command::Calculator => cmd_calculator(&config).await,
        Command::Submit {
            expression,
            submitter,
        } => {
            let wiring = Wiring::connect(&config).await?;
            cmd_submit(&wiring, expression, submitter).await
        }
        Command::Show { id } => {
            let wiring = Wiring::connect(&config).await?;
            cmd_show(&wiring, &id).await
        }
        Command::Reconcile {
            older_than_secs,
            limit,
        } => {
            let wiring = Wiring::connect(&config).await?;
            let older_than = older_than_secs
                .map(Duration::from_secs)
                .unwrap_or(config.reconcile_after);
            let n = Reconciler::new(wiring.store(), Arc::clone(&wiring.requests))
                .with_limit(limit)
                .sweep(older_than)
                .await?;
            println!("Re-enqueued {n} pending job(s)");
            Ok(())
        }
    }
}

async fn cmd_serve(config: &Config, reconcile: bool) -> anyhow::Result<()> {
    let guard = telemetry(config, "calcq-server")?;
    let wiring = Wiring::connect(config).await?;
    let store = wiring.store();

    let completion = CompletionLoop::new(
        Arc::clone(&wiring.results),
        Arc::clone(&store),
        Arc::clone(&wiring.dead_letters),
        loop_config(config),
    );
    // Not restarted on exit: a fatal error ends completion for this process.
    let completer = completion.clone();
    tokio::spawn(async move {
        if let Err(e) = completer.run().await {
            error!(error = %e, "completion loop stopped");
        }
    });

    let reconciler = Reconciler::new(Arc::clone(&store), Arc::clone(&wiring.requests));
    if reconcile {
        let sweeper = reconciler.clone();
        let every = config.reconcile_after;
        tokio::spawn(async move {
            if let Err(e) = sweeper.run(every, every).await {
                error!(error = %e, "reconciler stopped");
            }
        });
    }

    let submitter = Submitter::new(Arc::clone(&store), Arc::clone(&wiring.requests));
    let app = calcq::http::router(store, submitter);
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            completion.shutdown();
            reconciler.shutdown();
        })
        .await?;

    guard.force_flush();
    Ok(())
}

async fn cmd_calculator(config: &Config) -> anyhow::Result<()> {
    let guard = telemetry(config, "calcq-calculator")?;
    let wiring = Wiring::connect(config).await?;

    let worker = Worker::new(
        Arc::clone(&wiring.requests),
        Arc::clone(&wiring.results),
        Arc::clone(&wiring.dead_letters),
        Arc::new(Arithmetic),
        loop_config(config),
    );

    let w = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        w.shutdown();
    });

    let outcome = worker.run().await;
    if let Err(ref e) = outcome {
        error!(error = %e, "worker stopped");
    }
    guard.force_flush();
    Ok(outcome?)
}

async fn cmd_submit(wiring: &Wiring, expression: String, submitter: String) -> anyhow::Result<()> {
    let submit = Submitter::new(wiring.store(), Arc::clone(&wiring.requests));
    let id = submit.submit(NewJob::new(expression, submitter)).await?;
    println!("Calculation Id: {id}");
    Ok(())
}

async fn cmd_show(wiring: &Wiring, id: &str) -> anyhow::Result<()> {
    let id: JobId = id
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid job id '{id}': {e}"))?;
    let job = wiring.store().get_job(id).await?;

    println!("ID:         {}", job.id);
    println!("Status:     {}", job.status());
    println!("Submitter:  {}", job.submitter);
    println!("Expression: {}", job.expression);
    println!("Created:    {}", job.created);
    if let (Some(result), Some(completed)) = (job.result, job.completed) {
        println!("Result:     {result}");
        println!("Completed:  {completed}");
    }
    if let (Some(err), Some(failed)) = (&job.error, job.failed) {
        println!("Error:      {err}");
        println!("Failed:     {failed}");
    }

    Ok(())
}
