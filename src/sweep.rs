use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sealer::aws;
use sealer::cleanup::{clean_up, CleanupSet};
use sealer::clock::WallClock;
use sealer::infra::{InstanceState, Provisioner};
use sealer::session::TAG_SESSION_ID;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
/// Delete every resource left behind by an interrupted run
struct Cli {
    /// AWS profile
    #[clap(long, value_parser, default_value = "default")]
    profile: String,

    /// AWS region
    #[clap(long, value_parser, default_value = "us-west-2")]
    region: String,

    /// Session id whose resources should be removed
    #[clap(long, value_parser)]
    session: String,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("info,aws_config=warn"))
        .init();

    let cli = Cli::parse();
    let aws = aws::Aws::new(cli.profile, cli.region).await;

    let mut set = CleanupSet::default();
    set.instance_ids = aws
        .instances_by_tag(TAG_SESSION_ID, &cli.session)
        .await
        .context("failed to list session instances")?
        .into_iter()
        .filter(|i| i.state != InstanceState::Terminated)
        .map(|i| i.id)
        .collect();
    set.volume_ids = aws
        .volumes_by_tag(TAG_SESSION_ID, &cli.session)
        .await
        .context("failed to list session volumes")?
        .into_iter()
        .map(|v| v.id)
        .collect();
    set.snapshot_ids = aws
        .snapshots_by_tag(TAG_SESSION_ID, &cli.session)
        .await
        .context("failed to list session snapshots")?
        .into_iter()
        .map(|s| s.id)
        .collect();
    set.security_group_ids = aws
        .security_groups_by_tag(TAG_SESSION_ID, &cli.session)
        .await
        .context("failed to list session security groups")?;

    if set.is_empty() {
        println!("no resources tagged with session {}", cli.session);
        return Ok(());
    }

    println!(
        "sweeping session {}: {} instances, {} volumes, {} snapshots, {} security groups",
        cli.session,
        set.instance_ids.len(),
        set.volume_ids.len(),
        set.snapshot_ids.len(),
        set.security_group_ids.len()
    );
    clean_up(&aws, &WallClock, set).await;

    Ok(())
}
