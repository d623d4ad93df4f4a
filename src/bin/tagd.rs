//! tagd: Auto Scaling volume tagging daemon
//!
//! ## Architecture
//! ```text
//! [ASG] --(launch notification)--> [SNS topic] --> [SQS queue] --> [tagd]
//!                                                                    |
//!                                                                    v
//!                                                         EC2 CreateTags (volumes)
//! ```
//!
//! ## Configuration
//! Every flag can also be set through its `TAGD_*` environment variable.
//! - --sqs-queue-name / TAGD_SQS_QUEUE_NAME: queue to consume (required)
//! - --sns-topic-arn / TAGD_SNS_TOPIC_ARN: if set, tagd subscribes the queue
//!   and enables ASG notifications
//! - --backfill / TAGD_BACKFILL: tag existing instances at startup
//! - --config / TAGD_CONFIG: tagging rules file (default: ./config.yaml)
//! - --level / TAGD_LEVEL: log level; TAGD_LOG overrides with a full filter

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use tagd::aws::{AwsSettings, SdkClients};
use tagd::config::{Config, DEFAULT_CONFIG_FILE};
use tagd::daemon::{Collaborators, Daemon};
use tagd::utils::bootstrap::{init_tracing, shutdown_on_signal, LogFormat};
use tagd::utils::shutdown;

#[derive(Parser, Debug)]
#[command(name = "tagd", about = "Tag EBS volumes of Auto Scaling group instances")]
struct Cli {
    /// Log level.
    #[arg(short, long, env = "TAGD_LEVEL", default_value = "info",
          value_parser = ["trace", "debug", "info", "warn", "error"])]
    level: String,

    /// Log output format.
    #[arg(long, env = "TAGD_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Enable backfilling tags of existing resources.
    #[arg(long, env = "TAGD_BACKFILL")]
    backfill: bool,

    /// Configuration file for ASG tagging.
    #[arg(long, env = "TAGD_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Name of SQS queue to monitor for ASG events.
    #[arg(long, env = "TAGD_SQS_QUEUE_NAME", default_value = "")]
    sqs_queue_name: String,

    /// If not empty, tagd will set up ASG notifications and subscribe SQS to this SNS topic.
    #[arg(long, env = "TAGD_SNS_TOPIC_ARN")]
    sns_topic_arn: Option<String>,

    /// AWS region. Uses the default provider chain if not set.
    #[arg(long, env = "TAGD_AWS_REGION")]
    aws_region: Option<String>,

    /// Custom AWS endpoint URL (for LocalStack or testing).
    #[arg(long, env = "TAGD_AWS_ENDPOINT_URL")]
    aws_endpoint_url: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.level, cli.log_format);

    match run(cli).await {
        Ok(()) => {
            info!("tagd daemon stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Daemon failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(&cli.config)?.with_settings(
        cli.sqs_queue_name,
        cli.sns_topic_arn,
        cli.backfill,
    );
    config.validate()?;

    let clients = SdkClients::load(&AwsSettings {
        region: cli.aws_region,
        endpoint_url: cli.aws_endpoint_url,
    })
    .await;

    let mut daemon = Daemon::new(config, Collaborators::shared(std::sync::Arc::new(clients))).await?;

    let (handle, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        if let Err(e) = shutdown_on_signal(handle).await {
            error!(error = %e, "Failed to listen for shutdown signals");
        }
    });

    daemon.run(shutdown).await?;
    Ok(())
}
