use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sealer::aws;
use sealer::catalog::{self, ServiceEnv};
use sealer::clock::WallClock;
use sealer::encryptor::HttpStatusSource;
use sealer::infra::Instance;
use sealer::launch::{self, LaunchOptions};
use sealer::session::Session;
use sealer::share_logs::{self, ShareLogsOptions};
use sealer::update::{self, UpdateOptions};
use sealer::workflow::{self, EncryptOptions};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
/// Build and maintain encrypted machine images
struct Cli {
    /// AWS profile
    #[clap(long, value_parser, default_value = "default")]
    profile: String,

    /// AWS region
    #[clap(long, value_parser, default_value = "us-west-2")]
    region: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an encrypted image from an existing unencrypted image
    Encrypt {
        /// Source image id
        #[clap(long, value_parser)]
        image: String,

        /// Encryptor image id; resolved from the published catalog when
        /// omitted
        #[clap(long, value_parser)]
        encryptor_image: Option<String>,

        /// Name for the encrypted image
        #[clap(long, value_parser)]
        name: Option<String>,

        /// Subnet to launch instances in
        #[clap(long, value_parser)]
        subnet: Option<String>,

        /// Security group ids, comma separated
        #[clap(long, value_parser, default_value = "")]
        security_groups: String,

        /// NTP servers for the encryptor, comma separated
        #[clap(long, value_parser, default_value = "")]
        ntp_servers: String,

        /// Service endpoints, "api-host:port,keyserver-host:port"
        #[clap(long, value_parser)]
        service_env: Option<String>,

        /// Identity token passed to the encryptor
        #[clap(long, value_parser)]
        token: Option<String>,
    },

    /// Rebuild an encrypted image around a new appliance release
    Update {
        /// Existing encrypted image id
        #[clap(long, value_parser)]
        image: String,

        /// Updater image id; resolved from the published catalog when
        /// omitted
        #[clap(long, value_parser)]
        updater_image: Option<String>,

        /// Name for the updated image
        #[clap(long, value_parser)]
        name: String,

        /// Subnet to launch instances in
        #[clap(long, value_parser)]
        subnet: Option<String>,

        /// Security group ids, comma separated
        #[clap(long, value_parser, default_value = "")]
        security_groups: String,

        /// Service endpoints, "api-host:port,keyserver-host:port"
        #[clap(long, value_parser)]
        service_env: Option<String>,

        /// Identity token passed to the updater
        #[clap(long, value_parser)]
        token: Option<String>,
    },

    /// Launch an instance from an encrypted image
    Launch {
        /// Encrypted image id
        #[clap(long, value_parser)]
        image: String,

        /// Instance type
        #[clap(long, value_parser)]
        instance_type: Option<String>,

        /// Console name for the instance
        #[clap(long, value_parser)]
        name: Option<String>,

        /// Subnet to launch the instance in
        #[clap(long, value_parser)]
        subnet: Option<String>,

        /// Security group ids, comma separated
        #[clap(long, value_parser, default_value = "")]
        security_groups: String,

        /// Service endpoints, "api-host:port,keyserver-host:port"
        #[clap(long, value_parser)]
        service_env: Option<String>,

        /// Identity token passed to the instance
        #[clap(long, value_parser)]
        token: Option<String>,
    },

    /// Upload an appliance's logs to an S3 bucket for support
    ShareLogs {
        /// Appliance instance id
        #[clap(long, value_parser)]
        instance: Option<String>,

        /// Existing snapshot of the appliance root volume
        #[clap(long, value_parser)]
        snapshot: Option<String>,

        /// Destination bucket
        #[clap(long, value_parser)]
        bucket: String,

        /// Destination object path
        #[clap(long, value_parser)]
        path: String,

        /// Helper image id; a stock image for the region by default
        #[clap(long, value_parser)]
        helper_image: Option<String>,
    },
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_service_env(s: Option<&str>) -> Result<Option<ServiceEnv>> {
    s.map(ServiceEnv::parse)
        .transpose()
        .context("failed to parse service env")
}

fn status_source(instance: &Instance) -> sealer::error::Result<HttpStatusSource> {
    let mut hosts = Vec::new();
    if let Some(ip) = &instance.public_ip {
        hosts.push(ip.clone());
    }
    if let Some(ip) = &instance.private_ip {
        hosts.push(ip.clone());
    }
    HttpStatusSource::new(hosts)
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    info!(?cli.profile);
    info!(?cli.region);

    let aws = aws::Aws::new(cli.profile, cli.region.clone()).await;
    let clock = WallClock;

    match cli.command {
        Command::Encrypt {
            image,
            encryptor_image,
            name,
            subnet,
            security_groups,
            ntp_servers,
            service_env,
            token,
        } => {
            let encryptor_image = match encryptor_image {
                Some(id) => id,
                None => catalog::resolve_encryptor_image(&cli.region, true)
                    .await
                    .context("failed to resolve encryptor image")?,
            };
            let session = Session::new(&encryptor_image);
            info!(session_id = session.id(), "starting encryption session");

            let opts = EncryptOptions {
                image_id: image,
                encryptor_image_id: encryptor_image,
                encrypted_image_name: name,
                subnet_id: subnet,
                security_group_ids: split_list(&security_groups),
                ntp_servers: split_list(&ntp_servers),
                service_env: parse_service_env(service_env.as_deref())?,
                token,
            };
            let image_id = workflow::encrypt(&aws, &clock, &session, status_source, &opts)
                .await
                .context("encryption failed")?;
            println!("{image_id}");
        }

        Command::Update {
            image,
            updater_image,
            name,
            subnet,
            security_groups,
            service_env,
            token,
        } => {
            let updater_image = match updater_image {
                Some(id) => id,
                None => catalog::resolve_encryptor_image(&cli.region, true)
                    .await
                    .context("failed to resolve updater image")?,
            };
            let session = Session::new(&updater_image);
            info!(session_id = session.id(), "starting update session");

            let opts = UpdateOptions {
                image_id: image,
                updater_image_id: updater_image,
                updated_image_name: name,
                subnet_id: subnet,
                security_group_ids: split_list(&security_groups),
                service_env: parse_service_env(service_env.as_deref())?,
                token,
            };
            let image_id = update::update(&aws, &clock, &session, status_source, &opts)
                .await
                .context("update failed")?;
            println!("{image_id}");
        }

        Command::Launch {
            image,
            instance_type,
            name,
            subnet,
            security_groups,
            service_env,
            token,
        } => {
            let session = Session::new(&image);
            let opts = LaunchOptions {
                image_id: image,
                instance_type,
                instance_name: name,
                subnet_id: subnet,
                security_group_ids: split_list(&security_groups),
                service_env: parse_service_env(service_env.as_deref())?,
                token,
            };
            let instance = launch::launch(&aws, &clock, &session, &opts)
                .await
                .context("launch failed")?;
            println!("{}", instance.id);
        }

        Command::ShareLogs {
            instance,
            snapshot,
            bucket,
            path,
            helper_image,
        } => {
            let helper_image_id = match helper_image {
                Some(id) => id,
                None => share_logs::default_helper_image(&cli.region)
                    .context("no stock helper image for this region, pass --helper-image")?
                    .to_string(),
            };
            let session = Session::new(&helper_image_id);
            let opts = ShareLogsOptions {
                instance_id: instance,
                snapshot_id: snapshot,
                bucket,
                path,
                helper_image_id,
            };
            let url = share_logs::share(&aws, &clock, &session, &opts)
                .await
                .context("sharing logs failed")?;
            println!("{url}");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let mut filter = EnvFilter::new("info,aws_config=warn");
    if let Ok(var) = std::env::var("RUST_LOG") {
        if let Ok(directive) = var.parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_env_filter(filter)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(?e, "run error");
            ExitCode::FAILURE
        }
    }
}
