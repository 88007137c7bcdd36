use tokio::time::Duration;
use tracing::info;

use crate::cleanup::{clean_up, CleanupSet};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::infra::{DeviceSpec, InstanceState, LaunchSpec, Provisioner, Snapshot};
use crate::session::Session;
use crate::wait::{self, Deadline};
use crate::workflow::DEFAULT_INSTANCE_TYPE;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(900);
const OBJECT_POLL: Duration = Duration::from_secs(10);
// Device the log volume lands on inside the helper, and where its log
// partition is.
const LOG_DEVICE: &str = "/dev/sdg";
const LOG_PARTITION: &str = "/dev/xvdg4";

/// Stock helper images by region, refreshed periodically.
const HELPER_IMAGES: &[(&str, &str)] = &[
    ("us-east-1", "ami-0b33d91d"),
    ("us-east-2", "ami-c55673a0"),
    ("us-west-1", "ami-165a0876"),
    ("us-west-2", "ami-f173cc91"),
    ("ap-south-1", "ami-f9daac96"),
    ("ap-northeast-1", "ami-56d4ad31"),
    ("ap-northeast-2", "ami-dac312b4"),
    ("ap-southeast-1", "ami-dc9339bf"),
    ("ap-southeast-2", "ami-1c47407f"),
    ("eu-central-1", "ami-af0fc0c0"),
    ("eu-west-1", "ami-70edb016"),
    ("eu-west-2", "ami-f1949e95"),
];

pub fn default_helper_image(region: &str) -> Option<&'static str> {
    HELPER_IMAGES
        .iter()
        .find(|(r, _)| *r == region)
        .map(|(_, image)| *image)
}

#[derive(Clone, Debug, Default)]
pub struct ShareLogsOptions {
    /// Appliance instance whose log volume should be exported. Not
    /// needed when a snapshot is given directly.
    pub instance_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub bucket: String,
    pub path: String,
    pub helper_image_id: String,
}

/// Export an appliance's system logs to an S3 object for support.
///
/// Snapshots the appliance root volume (unless a snapshot is supplied),
/// boots a stock helper instance that mounts it, tars the log and crash
/// directories and uploads the archive using its own instance role,
/// then polls the public object URL until the upload lands. The helper
/// and the temporary snapshot are deleted afterwards.
pub async fn share<P, C>(
    infra: &P,
    clock: &C,
    session: &Session,
    opts: &ShareLogsOptions,
) -> Result<String>
where
    P: Provisioner,
    C: Clock + ?Sized,
{
    info!("sharing logs");
    let mut cleanup = CleanupSet::default();
    let result = share_run(infra, clock, session, opts, &mut cleanup).await;
    clean_up(infra, clock, cleanup).await;
    result
}

async fn share_run<P, C>(
    infra: &P,
    clock: &C,
    session: &Session,
    opts: &ShareLogsOptions,
    cleanup: &mut CleanupSet,
) -> Result<String>
where
    P: Provisioner,
    C: Clock + ?Sized,
{
    let snapshot = match &opts.snapshot_id {
        Some(snapshot_id) => infra
            .get_snapshots(&[snapshot_id.clone()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("snapshot {snapshot_id}")))?,
        None => snapshot_root_volume(infra, clock, session, opts, cleanup).await?,
    };

    let file = opts.path.rsplit('/').next().unwrap_or(&opts.path);
    // The helper mounts the log volume read-only, tars the log and
    // crash directories, and pushes the archive with its own role.
    let script = format!(
        "#!/bin/bash\n\
         sudo mount -t ufs -o ro,ufstype=ufs2 {LOG_PARTITION} /mnt\n\
         sudo tar czvf /tmp/{file} -C /mnt ./log ./crash\n\
         sudo aws s3 cp /tmp/{file} s3://{bucket}/{path} --acl public-read\n",
        bucket = opts.bucket,
        path = opts.path,
    );

    let helper = infra
        .run_instance(&LaunchSpec {
            image_id: opts.helper_image_id.clone(),
            instance_type: Some(DEFAULT_INSTANCE_TYPE.to_string()),
            user_data: Some(script),
            devices: vec![DeviceSpec {
                device: LOG_DEVICE.to_string(),
                snapshot_id: Some(snapshot.id.clone()),
                size_gib: snapshot.volume_size_gib,
                volume_type: Some("gp2".to_string()),
                delete_on_termination: true,
                ..Default::default()
            }],
            ebs_optimized: false,
            ..Default::default()
        })
        .await?;
    cleanup.instance_ids.push(helper.id.clone());
    infra
        .create_tags(&helper.id, &session.tags_with(Some("Sealer log helper"), None))
        .await?;
    wait::wait_for_instance(
        infra,
        clock,
        &helper.id,
        InstanceState::Running,
        wait::INSTANCE_TIMEOUT,
    )
    .await?;

    let url = format!(
        "https://{bucket}.s3.amazonaws.com/{path}",
        bucket = opts.bucket,
        path = opts.path
    );
    wait_for_object(clock, &url).await?;
    info!(url, "logs uploaded");
    Ok(url)
}

async fn snapshot_root_volume<P, C>(
    infra: &P,
    clock: &C,
    session: &Session,
    opts: &ShareLogsOptions,
    cleanup: &mut CleanupSet,
) -> Result<Snapshot>
where
    P: Provisioner,
    C: Clock + ?Sized,
{
    let instance_id = opts
        .instance_id
        .as_deref()
        .ok_or_else(|| Error::InvalidInput("an instance id or snapshot id is required".to_string()))?;
    let instance = infra.get_instance(instance_id).await?;
    let root_device = instance
        .root_device_name
        .clone()
        .ok_or_else(|| Error::Api(format!("instance {instance_id} reports no root device")))?;
    let volume_id = instance
        .volume_on(&root_device)
        .ok_or_else(|| Error::NotFound(format!("root volume of {instance_id}")))?
        .to_string();

    let snapshot = infra
        .create_snapshot(&volume_id, "temp-logs-snapshot", "")
        .await?;
    cleanup.snapshot_ids.push(snapshot.id.clone());
    infra
        .create_tags(&snapshot.id, &session.tags_with(None, None))
        .await?;
    wait::wait_for_snapshots(infra, clock, &[snapshot.id.clone()]).await?;
    Ok(snapshot)
}

/// Poll the public object URL until the helper's upload lands.
async fn wait_for_object<C: Clock + ?Sized>(clock: &C, url: &str) -> Result<()> {
    let client = reqwest::Client::builder().build()?;
    let deadline = Deadline::new(UPLOAD_TIMEOUT, clock);
    while !deadline.is_expired(clock) {
        if let Ok(resp) = client.head(url).send().await {
            if resp.status().is_success() {
                return Ok(());
            }
        }
        clock.sleep(OBJECT_POLL).await;
    }
    Err(Error::WaitTimeout {
        what: format!("log archive at {url}"),
        target: "uploaded".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_images_cover_the_major_regions() {
        assert!(default_helper_image("us-east-1").is_some());
        assert!(default_helper_image("eu-west-1").is_some());
        assert!(default_helper_image("mars-north-1").is_none());
    }
}
