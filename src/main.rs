use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use converge::aws::account::verify_credentials;
use converge::aws::context::AwsContext;
use converge::aws::ec2::instance_architecture;
use converge::aws::AwsProvider;
use converge::config::{
    FailurePolicy, RunConfig, StackConfig, DEFAULT_APP_PORT, DEFAULT_INSTANCE_TYPE,
    DEFAULT_OUTPUT_FILE, DEFAULT_REGION,
};
use converge::orchestrator::Orchestrator;
use converge::output::write_env_file;
use converge::stack::standard_topology;
use converge::tags::cloud_name;
use converge::teardown::{run_teardown, TeardownScope};
use converge::wait::PollConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "converge", version, about = "Idempotent AWS infrastructure reconciler")]
struct Cli {
    /// AWS region to operate in
    #[arg(long, global = true, env = "AWS_REGION", default_value = DEFAULT_REGION)]
    region: String,

    /// Stack name; prefixes every cloud-side resource name
    #[arg(long, global = true, default_value = "app")]
    stack: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile the stack toward the declared topology
    Up(UpArgs),
    /// Tear the whole stack down, dependents first
    Down,
    /// Print the topology and its execution layers without touching AWS
    Plan(PlanArgs),
}

#[derive(Args)]
struct PlanArgs {
    #[command(flatten)]
    shape: ShapeArgs,
}

#[derive(Args)]
struct UpArgs {
    #[command(flatten)]
    shape: ShapeArgs,

    /// Tear down replaceable resources before reconciling
    #[arg(long, env = "FORCE_RECREATE")]
    force_recreate: bool,

    /// Abort on the first failure instead of continuing best-effort
    #[arg(long)]
    strict: bool,

    /// Max concurrent operations per dependency layer
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Where to write the resolved-identifier env file
    #[arg(long, default_value = DEFAULT_OUTPUT_FILE)]
    output: PathBuf,

    /// Print the outcome as JSON instead of the plain report
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ShapeArgs {
    /// EC2 key pair for instance SSH access
    #[arg(long, env = "KEY_NAME")]
    key_name: Option<String>,

    #[arg(long, default_value = DEFAULT_INSTANCE_TYPE)]
    instance_type: String,

    /// Port the application serves behind the load balancer
    #[arg(long, default_value_t = DEFAULT_APP_PORT)]
    app_port: u16,

    #[arg(long, default_value_t = 1)]
    min_size: u32,

    #[arg(long, default_value_t = 3)]
    max_size: u32,

    #[arg(long, default_value_t = 1)]
    desired_capacity: u32,

    /// AMI to launch; defaults to the latest Amazon Linux 2023 image
    #[arg(long)]
    image_id: Option<String>,
}

impl ShapeArgs {
    fn stack_config(&self) -> StackConfig {
        StackConfig {
            key_name: self.key_name.clone(),
            instance_type: self.instance_type.clone(),
            app_port: self.app_port,
            min_size: self.min_size,
            max_size: self.max_size,
            desired_capacity: self.desired_capacity,
            image_id: self.image_id.clone(),
        }
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing current operations");
            trigger.cancel();
        }
    });
    cancel
}

async fn cmd_up(region: &str, stack: &str, args: UpArgs) -> Result<bool> {
    let ctx = AwsContext::new(region).await;
    verify_credentials(&ctx).await?;
    let provider = Arc::new(AwsProvider::new(&ctx, stack));

    let cfg = args.shape.stack_config();
    let image_id = match &cfg.image_id {
        Some(id) => id.clone(),
        None => provider
            .ec2()
            .latest_al2023_ami(instance_architecture(&cfg.instance_type))
            .await
            .context("Failed to resolve an AL2023 AMI")?,
    };
    let topology = standard_topology(stack, region, &cfg, image_id);

    let mut run = RunConfig::new(stack, region);
    run.policy = if args.strict {
        FailurePolicy::Strict
    } else {
        FailurePolicy::BestEffort
    };
    run.force_recreate = args.force_recreate;
    run.concurrency = args.concurrency;
    run.output_file = args.output;

    let output_file = run.output_file.clone();
    let orchestrator = Orchestrator::new(provider, run).with_cancellation(cancel_on_ctrl_c());
    let outcome = orchestrator.run(&topology).await?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&outcome).context("Failed to serialize outcome")?
        );
    } else {
        print!("{}", outcome.report());
    }
    write_env_file(&output_file, stack, region, &outcome)?;

    Ok(outcome.fatal_error.is_none())
}

async fn cmd_down(region: &str, stack: &str) -> Result<bool> {
    let ctx = AwsContext::new(region).await;
    verify_credentials(&ctx).await?;
    let provider = AwsProvider::new(&ctx, stack);

    // The topology shape is all teardown needs; instance details are
    // irrelevant for deletion.
    let topology = standard_topology(stack, region, &StackConfig::default(), String::new());

    let outcome = run_teardown(
        &provider,
        &topology,
        TeardownScope::Full,
        PollConfig::with_timeout(Duration::from_secs(300)),
        &cancel_on_ctrl_c(),
    )
    .await?;

    for (kind, name) in &outcome.deleted {
        println!("{name:<24} {kind:<18} deleted");
    }
    for name in &outcome.absent {
        println!("{name:<24} already absent");
    }
    for (name, reason) in &outcome.failed {
        println!("{name:<24} failed: {reason}");
    }
    info!(
        deleted = outcome.deleted.len(),
        absent = outcome.absent.len(),
        failed = outcome.failed.len(),
        "Teardown finished"
    );

    Ok(outcome.failed.is_empty())
}

fn cmd_plan(region: &str, stack: &str, args: PlanArgs) -> Result<()> {
    let cfg = args.shape.stack_config();
    let image_id = cfg
        .image_id
        .clone()
        .unwrap_or_else(|| "<latest AL2023 AMI>".to_string());
    let topology = standard_topology(stack, region, &cfg, image_id);
    topology.validate()?;

    println!("stack: {stack} ({region})");
    for (depth, layer) in topology.layers()?.iter().enumerate() {
        println!("layer {depth}:");
        for &idx in layer {
            let spec = &topology.specs[idx];
            let mut line = format!(
                "  {:<24} {:<18} -> {}",
                spec.name,
                spec.kind(),
                cloud_name(stack, &spec.name)
            );
            if !spec.depends_on.is_empty() {
                line.push_str(&format!("  (after {})", spec.depends_on.join(", ")));
            }
            println!("{line}");
        }
    }
    Ok(())
}

fn print_error(error: &anyhow::Error) {
    eprintln!("Error: {error}");
    for cause in error.chain().skip(1) {
        eprintln!("  Caused by: {cause}");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Up(args) => cmd_up(&cli.region, &cli.stack, args).await,
        Command::Down => cmd_down(&cli.region, &cli.stack).await,
        Command::Plan(args) => cmd_plan(&cli.region, &cli.stack, args).map(|()| true),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            print_error(&e);
            std::process::exit(1);
        }
    }
}
