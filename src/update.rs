use tracing::{info, warn};

use crate::catalog::{ServiceEnv, UserData};
use crate::cleanup::{clean_up, CleanupSet};
use crate::clock::Clock;
use crate::encryptor::{wait_for_encryption, wait_for_encryptor_up, StatusSource, PROGRESS_TIMEOUT};
use crate::error::{Error, Result};
use crate::infra::{
    DeviceSpec, Instance, InstanceState, LaunchSpec, MachineImage, Provisioner, Virtualization,
    VolumeState,
};
use crate::session::Session;
use crate::wait;
use crate::workflow::{
    CANONICAL_ROOT_DEVICE, DEFAULT_INSTANCE_TYPE, NAME_GUEST_CREATOR, NAME_SYSTEM_GRUB_SNAPSHOT,
    NAME_SYSTEM_LOG_SNAPSHOT, NAME_SYSTEM_ROOT_SNAPSHOT,
};

pub const NAME_UPDATER: &str = "Sealer updater";

#[derive(Clone, Debug, Default)]
pub struct UpdateOptions {
    /// The existing encrypted image.
    pub image_id: String,
    /// The updater appliance image carrying the new system software.
    pub updater_image_id: String,
    pub updated_image_name: String,
    pub subnet_id: Option<String>,
    pub security_group_ids: Vec<String>,
    pub service_env: Option<ServiceEnv>,
    pub token: Option<String>,
}

/// Rebuild an existing encrypted image around a new appliance release.
///
/// The encrypted guest is booted in updater mode purely as an assembly
/// base (this preserves the billing metadata embedded in it), while a
/// separate updater appliance produces fresh system volumes. The
/// guest's old system volumes are swapped for snapshots of the
/// updater's, and a new image is registered from the guest.
pub async fn update<P, C, S, F>(
    infra: &P,
    clock: &C,
    session: &Session,
    status_source: F,
    opts: &UpdateOptions,
) -> Result<String>
where
    P: Provisioner,
    C: Clock + ?Sized,
    S: StatusSource,
    F: Fn(&Instance) -> Result<S>,
{
    let guest_image = infra.get_image(&opts.image_id).await?;

    let mut cleanup = CleanupSet::default();
    let result = update_run(
        infra,
        clock,
        session,
        &status_source,
        opts,
        &guest_image,
        &mut cleanup,
    )
    .await;

    clean_up(infra, clock, cleanup).await;

    if let Ok(image_id) = &result {
        info!(image_id, source = %opts.image_id, "created updated image");
    }
    result
}

async fn update_run<P, C, S, F>(
    infra: &P,
    clock: &C,
    session: &Session,
    status_source: &F,
    opts: &UpdateOptions,
    guest_image: &MachineImage,
    cleanup: &mut CleanupSet,
) -> Result<String>
where
    P: Provisioner,
    C: Clock + ?Sized,
    S: StatusSource,
    F: Fn(&Instance) -> Result<S>,
{
    let user_data = UserData {
        service_env: opts.service_env.clone(),
        token: opts.token.clone(),
        ntp_servers: Vec::new(),
        updater_mode: true,
    }
    .to_json();

    let mut security_group_ids = opts.security_group_ids.clone();
    if security_group_ids.is_empty() {
        let vpc_id = match &opts.subnet_id {
            Some(subnet_id) => Some(infra.get_subnet_vpc(subnet_id).await?),
            None => None,
        };
        let group_id =
            crate::workflow::create_encryptor_security_group(infra, session, vpc_id.as_deref())
                .await?;
        cleanup.security_group_ids.push(group_id.clone());
        security_group_ids.push(group_id);
    }

    info!("launching encrypted guest and updater");
    let guest = infra
        .run_instance(&LaunchSpec {
            image_id: opts.image_id.clone(),
            instance_type: Some(DEFAULT_INSTANCE_TYPE.to_string()),
            subnet_id: opts.subnet_id.clone(),
            security_group_ids: security_group_ids.clone(),
            user_data: Some(user_data.clone()),
            ebs_optimized: false,
            ..Default::default()
        })
        .await?;
    cleanup.instance_ids.push(guest.id.clone());
    infra
        .create_tags(
            &guest.id,
            &session.tags_with(
                Some(NAME_GUEST_CREATOR),
                Some(&format!(
                    "Used to create an encrypted guest root volume from {}",
                    opts.image_id
                )),
            ),
        )
        .await?;

    let updater = infra
        .run_instance(&LaunchSpec {
            image_id: opts.updater_image_id.clone(),
            instance_type: Some(DEFAULT_INSTANCE_TYPE.to_string()),
            subnet_id: opts.subnet_id.clone(),
            security_group_ids,
            user_data: Some(user_data),
            ebs_optimized: false,
            ..Default::default()
        })
        .await?;
    cleanup.instance_ids.push(updater.id.clone());
    infra
        .create_tags(
            &updater.id,
            &session.tags_with(
                Some(NAME_UPDATER),
                Some("Used to upgrade an encrypted image to the latest system software"),
            ),
        )
        .await?;

    let guest = wait::wait_for_instance(
        infra,
        clock,
        &guest.id,
        InstanceState::Running,
        wait::INSTANCE_TIMEOUT,
    )
    .await?;
    info!(guest_id = %guest.id, updater_id = %updater.id, "launched guest and updater");

    // The guest is only an assembly base; it can stop while the
    // updater works.
    infra.stop_instance(&guest.id).await?;

    let updater = wait::wait_for_instance(
        infra,
        clock,
        &updater.id,
        InstanceState::Running,
        wait::INSTANCE_TIMEOUT,
    )
    .await?;

    let svc = status_source(&updater)?;
    info!(endpoint = %svc.endpoint(), "waiting for the updater service");
    wait_for_encryptor_up(&svc, clock).await?;
    if let Err(err) = wait_for_encryption(&svc, clock, PROGRESS_TIMEOUT).await {
        return Err(crate::workflow::attach_console_log(infra, err, &updater.id).await);
    }

    infra.stop_instance(&updater.id).await?;
    let guest = wait::wait_for_instance(
        infra,
        clock,
        &guest.id,
        InstanceState::Stopped,
        wait::INSTANCE_TIMEOUT,
    )
    .await?;
    let updater = wait::wait_for_instance(
        infra,
        clock,
        &updater.id,
        InstanceState::Stopped,
        wait::INSTANCE_TIMEOUT,
    )
    .await?;

    // Shed the old system volumes from the guest.
    let old_devices: &[&str] = match guest_image.virtualization {
        Virtualization::Paravirtual => &["/dev/sda1", "/dev/sda2", "/dev/sda3"],
        Virtualization::Hvm => &["/dev/sda1"],
    };
    for device in old_devices.iter().copied() {
        let Some(volume_id) = guest.volume_on(device).map(str::to_string) else {
            warn!(device, "guest has no volume at expected system device");
            continue;
        };
        info!(volume_id, device, "detaching old system volume");
        infra.detach_volume(&volume_id, &guest.id, true).await?;
        infra.delete_volume(&volume_id).await?;
    }

    let zone = guest.availability_zone.clone().ok_or_else(|| {
        Error::Api(format!("instance {} reports no availability zone", guest.id))
    })?;

    info!("creating snapshots of the updater volumes");
    let mut devices: Vec<DeviceSpec> = Vec::new();
    let snap_boot = match guest_image.virtualization {
        Virtualization::Paravirtual => {
            let snap_grub = infra
                .create_snapshot(
                    &updater_volume(&updater, "/dev/sda1")?,
                    NAME_SYSTEM_GRUB_SNAPSHOT,
                    "",
                )
                .await?;
            let snap_root = infra
                .create_snapshot(
                    &updater_volume(&updater, "/dev/sda2")?,
                    NAME_SYSTEM_ROOT_SNAPSHOT,
                    "",
                )
                .await?;
            let snap_log = infra
                .create_snapshot(
                    &updater_volume(&updater, "/dev/sda3")?,
                    NAME_SYSTEM_LOG_SNAPSHOT,
                    "",
                )
                .await?;
            wait::wait_for_snapshots(
                infra,
                clock,
                &[
                    snap_grub.id.clone(),
                    snap_root.id.clone(),
                    snap_log.id.clone(),
                ],
            )
            .await?;
            devices.push(DeviceSpec {
                device: "/dev/sda2".to_string(),
                snapshot_id: Some(snap_root.id),
                volume_type: Some("gp2".to_string()),
                delete_on_termination: true,
                ..Default::default()
            });
            devices.push(DeviceSpec {
                device: "/dev/sda3".to_string(),
                snapshot_id: Some(snap_log.id),
                volume_type: Some("gp2".to_string()),
                delete_on_termination: true,
                ..Default::default()
            });
            snap_grub
        }
        Virtualization::Hvm => {
            let snap_root = infra
                .create_snapshot(
                    &updater_volume(&updater, "/dev/sda1")?,
                    NAME_SYSTEM_ROOT_SNAPSHOT,
                    "",
                )
                .await?;
            wait::wait_for_snapshots(infra, clock, &[snap_root.id.clone()]).await?;
            snap_root
        }
    };
    // The boot snapshot only feeds the volume below; it is not part of
    // the final image and gets deleted with everything else.
    cleanup.snapshot_ids.push(snap_boot.id.clone());

    info!(snapshot_id = %snap_boot.id, "creating new system boot volume");
    let size = snap_boot
        .volume_size_gib
        .ok_or_else(|| Error::Api(format!("snapshot {} reports no size", snap_boot.id)))?;
    let boot_volume = infra
        .create_volume(size, &zone, Some(&snap_boot.id), "gp2")
        .await?;
    cleanup.volume_ids.push(boot_volume.id.clone());
    wait::wait_for_volume(
        infra,
        clock,
        &boot_volume.id,
        VolumeState::Available,
        wait::VOLUME_TIMEOUT,
    )
    .await?;

    info!(volume_id = %boot_volume.id, "attaching new system boot volume");
    infra
        .attach_volume(&boot_volume.id, &guest.id, CANONICAL_ROOT_DEVICE)
        .await?;
    devices.push(DeviceSpec {
        device: CANONICAL_ROOT_DEVICE.to_string(),
        delete_on_termination: true,
        ..Default::default()
    });

    info!("creating new image");
    let image_id = infra
        .create_image(
            &guest.id,
            &opts.updated_image_name,
            guest_image.description.as_deref().unwrap_or(""),
            &devices,
        )
        .await?;
    wait::wait_for_image(infra, clock, &image_id).await?;
    infra
        .create_tags(&image_id, &session.tags_with(None, None))
        .await?;

    Ok(image_id)
}

fn updater_volume(updater: &Instance, device: &str) -> Result<String> {
    updater
        .volume_on(device)
        .map(str::to_string)
        .ok_or_else(|| Error::NotFound(format!("volume at {device} on {}", updater.id)))
}
