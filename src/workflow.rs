use std::path::PathBuf;

use tracing::{debug, error, info, warn};

use crate::catalog::{ServiceEnv, UserData};
use crate::cleanup::{clean_up, CleanupSet};
use crate::clock::Clock;
use crate::encryptor::{
    self, wait_for_encryption, wait_for_encryptor_up, StatusSource, PROGRESS_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::infra::{
    DeviceSpec, Instance, InstanceState, LaunchSpec, MachineImage, Provisioner, Virtualization,
};
use crate::session::{self, Session};
use crate::wait;

// Operator-visible resource names, mirrored in the cloud console.
pub const NAME_GUEST_CREATOR: &str = "Sealer guest";
pub const NAME_ENCRYPTOR: &str = "Sealer volume encryptor";
pub const NAME_ORIGINAL_SNAPSHOT: &str = "Sealer encryptor original volume";
pub const NAME_ENCRYPTED_ROOT_SNAPSHOT: &str = "Sealer encrypted root volume";
pub const NAME_SYSTEM_ROOT_SNAPSHOT: &str = "Sealer system root";
pub const NAME_SYSTEM_GRUB_SNAPSHOT: &str = "Sealer system GRUB";
pub const NAME_SYSTEM_LOG_SNAPSHOT: &str = "Sealer system log";
pub const NAME_ENCRYPTED_ROOT_VOLUME: &str = "Sealer encrypted root volume";
pub const NAME_SYSTEM_ROOT_VOLUME: &str = "Sealer system root";
pub const NAME_SYSTEM_GRUB_VOLUME: &str = "Sealer system GRUB";
pub const NAME_SYSTEM_LOG_VOLUME: &str = "Sealer system log";
const DESCRIPTION_ENCRYPTOR_SECURITY_GROUP: &str = "Allows access to the encryption service.";

pub const DEFAULT_INSTANCE_TYPE: &str = "m3.medium";
pub const CANONICAL_ROOT_DEVICE: &str = "/dev/sda1";
pub const AMI_NAME_MAX_LENGTH: usize = 128;

// Device layout inside the encryptor appliance. The source snapshot and
// the encrypted destination land on different names depending on the
// appliance's virtualization type.
const PV_SOURCE_DEVICE: &str = "/dev/sda4";
const PV_DEST_DEVICE: &str = "/dev/sda5";
const HVM_SOURCE_DEVICE: &str = "/dev/sdf";
const HVM_DEST_DEVICE: &str = "/dev/sdg";

#[derive(Clone, Debug, Default)]
pub struct EncryptOptions {
    pub image_id: String,
    pub encryptor_image_id: String,
    pub encrypted_image_name: Option<String>,
    pub subnet_id: Option<String>,
    pub security_group_ids: Vec<String>,
    pub ntp_servers: Vec<String>,
    pub service_env: Option<ServiceEnv>,
    pub token: Option<String>,
}

/// Size of the encrypted destination volume for a source of
/// `source_gib`. Doubled plus headroom for the encrypted format.
pub fn destination_size_gib(source_gib: i32) -> i32 {
    2 * source_gib + 1
}

/// Suffix appended to the encrypted image name. The nonce keeps
/// generated names unique, which the provider requires.
pub fn encrypted_image_suffix() -> String {
    format!(" (encrypted {})", session::make_nonce())
}

/// Append `suffix` to `name`, truncating `name` so the result never
/// exceeds `max_length`.
pub fn append_suffix(name: &str, suffix: &str, max_length: usize) -> String {
    let keep = max_length.saturating_sub(suffix.len());
    let name: String = name.chars().take(keep).collect();
    format!("{name}{suffix}")
}

fn name_from_image(image: &MachineImage) -> String {
    append_suffix(
        image.name.as_deref().unwrap_or(&image.id),
        &encrypted_image_suffix(),
        AMI_NAME_MAX_LENGTH,
    )
}

fn description_from_image(image: &MachineImage) -> String {
    match &image.description {
        Some(description) => append_suffix(
            description,
            &format!(" - based on {}, encrypted by Sealer", image.id),
            255,
        ),
        None => format!("Based on {}, encrypted by Sealer", image.id),
    }
}

/// Decide up front whether this guest/encryptor pair can go through the
/// normal assembly path or has to fall back to legacy mode, where the
/// image is registered from the appliance and guest license/billing
/// metadata is not preserved. A paravirtual guest under an HVM
/// encryptor cannot run at all and fails before any resource exists.
pub fn validate_images(guest: &MachineImage, encryptor: &MachineImage) -> Result<bool> {
    debug!(
        guest = %guest.virtualization,
        encryptor = %encryptor.virtualization,
        "virtualization types"
    );
    if encryptor.virtualization == Virtualization::Hvm
        && guest.virtualization == Virtualization::Paravirtual
    {
        return Err(Error::InvalidInput(
            "encryptor/guest virtualization type mismatch".to_string(),
        ));
    }

    let mut legacy = false;
    if encryptor.virtualization == Virtualization::Paravirtual
        && guest.virtualization == Virtualization::Hvm
    {
        warn!(
            "a paravirtual encryptor cannot preserve guest OS license \
             information for an HVM guest"
        );
        legacy = true;
    }
    match guest.root_device_name.as_deref() {
        None => {
            warn!("guest image reports no root device, license information will not be preserved");
            legacy = true;
        }
        Some(root) => {
            if guest.device(root).is_none() {
                warn!(
                    root,
                    "guest image has no mapping for its root device, license \
                     information will not be preserved"
                );
                legacy = true;
            }
            if root != CANONICAL_ROOT_DEVICE {
                warn!(
                    root,
                    "license information will not be preserved, root disk is \
                     not attached at {CANONICAL_ROOT_DEVICE}"
                );
                legacy = true;
            }
        }
    }
    Ok(legacy)
}

/// Create an encrypted image from an unencrypted one.
///
/// Boots the guest to materialize its root volume, snapshots it, hands
/// the snapshot to a freshly launched encryptor appliance, monitors the
/// encryption, and registers a new image from the resulting snapshots.
/// Whatever happens, every resource this run created and did not fold
/// into the final image is deleted before returning, and the original
/// error (if any) is the one returned.
pub async fn encrypt<P, C, S, F>(
    infra: &P,
    clock: &C,
    session: &Session,
    status_source: F,
    opts: &EncryptOptions,
) -> Result<String>
where
    P: Provisioner,
    C: Clock + ?Sized,
    S: StatusSource,
    F: Fn(&Instance) -> Result<S>,
{
    let guest_image = infra.get_image(&opts.image_id).await?;
    let encryptor_image = infra.get_image(&opts.encryptor_image_id).await?;
    let legacy = validate_images(&guest_image, &encryptor_image)?;

    let mut cleanup = CleanupSet::default();
    let result = encrypt_run(
        infra,
        clock,
        session,
        &status_source,
        opts,
        &guest_image,
        &encryptor_image,
        legacy,
        &mut cleanup,
    )
    .await;

    // Volumes should be reaped with their instances, but orphans have
    // been seen in the field; sweep anything still tagged for us.
    match infra
        .volumes_by_tag(session::TAG_SESSION_ID, session.id())
        .await
    {
        Ok(volumes) => {
            for volume in volumes {
                cleanup.add_volume(&volume.id);
            }
        }
        Err(err) => warn!(%err, "unable to sweep session volumes"),
    }

    clean_up(infra, clock, cleanup).await;

    if let Ok(image_id) = &result {
        info!(image_id, source = %opts.image_id, "created encrypted image");
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn encrypt_run<P, C, S, F>(
    infra: &P,
    clock: &C,
    session: &Session,
    status_source: &F,
    opts: &EncryptOptions,
    guest_image: &MachineImage,
    encryptor_image: &MachineImage,
    mut legacy: bool,
    cleanup: &mut CleanupSet,
) -> Result<String>
where
    P: Provisioner,
    C: Clock + ?Sized,
    S: StatusSource,
    F: Fn(&Instance) -> Result<S>,
{
    // Boot the guest so its root volume materializes.
    let guest = run_guest_instance(infra, session, &opts.image_id, opts.subnet_id.as_deref()).await?;
    cleanup.instance_ids.push(guest.id.clone());
    let guest = wait::wait_for_instance(
        infra,
        clock,
        &guest.id,
        InstanceState::Running,
        wait::INSTANCE_TIMEOUT,
    )
    .await?;

    let root = snapshot_root_volume(infra, clock, session, &guest, &opts.image_id).await?;
    cleanup.snapshot_ids.push(root.snapshot_id.clone());

    if guest_image.virtualization == Virtualization::Hvm
        && infra.sriov_net_support(&guest.id).await?.as_deref() == Some("simple")
    {
        warn!(
            "license information will not be preserved, the guest has SR-IOV \
             net support enabled and the appliance does not"
        );
        legacy = true;
    }

    let mut security_group_ids = opts.security_group_ids.clone();
    if security_group_ids.is_empty() {
        let vpc_id = match &opts.subnet_id {
            Some(subnet_id) => Some(infra.get_subnet_vpc(subnet_id).await?),
            None => None,
        };
        let group_id = create_encryptor_security_group(infra, session, vpc_id.as_deref()).await?;
        cleanup.security_group_ids.push(group_id.clone());
        security_group_ids.push(group_id);
    }

    let encryptor = run_encryptor_instance(
        infra,
        clock,
        session,
        opts,
        encryptor_image,
        &root,
        &security_group_ids,
        guest.availability_zone.as_deref(),
    )
    .await?;
    cleanup.instance_ids.push(encryptor.id.clone());

    let svc = status_source(&encryptor)?;
    info!(
        encryptor_id = %encryptor.id,
        endpoint = %svc.endpoint(),
        "waiting for the encryption service"
    );
    wait_for_encryptor_up(&svc, clock).await?;

    info!("creating encrypted root volume");
    if let Err(err) = wait_for_encryption(&svc, clock, PROGRESS_TIMEOUT).await {
        return Err(attach_console_log(infra, err, &encryptor.id).await);
    }
    info!("encrypted root volume is ready");

    let assembly =
        snapshot_encrypted_instance(infra, clock, session, &encryptor, encryptor_image, guest_image, &root, legacy)
            .await?;

    let name = match &opts.encrypted_image_name {
        Some(name) => name.clone(),
        None => name_from_image(guest_image),
    };
    let description = description_from_image(guest_image);

    register_image(
        infra,
        clock,
        session,
        &guest,
        &encryptor,
        encryptor_image,
        &assembly,
        &name,
        &description,
        legacy,
    )
    .await
}

async fn run_guest_instance(
    infra: &impl Provisioner,
    session: &Session,
    image_id: &str,
    subnet_id: Option<&str>,
) -> Result<Instance> {
    let instance = infra
        .run_instance(&LaunchSpec {
            image_id: image_id.to_string(),
            instance_type: Some(DEFAULT_INSTANCE_TYPE.to_string()),
            subnet_id: subnet_id.map(str::to_string),
            ebs_optimized: false,
            ..Default::default()
        })
        .await?;
    info!(
        instance_id = %instance.id,
        image_id,
        "launching instance to snapshot the root disk"
    );
    infra
        .create_tags(
            &instance.id,
            &session.tags_with(
                Some(NAME_GUEST_CREATOR),
                Some(&format!(
                    "Used to create an encrypted guest root volume from {image_id}"
                )),
            ),
        )
        .await?;
    Ok(instance)
}

struct RootSnapshot {
    snapshot_id: String,
    size_gib: i32,
    volume_type: Option<String>,
    iops: Option<i32>,
}

/// Stop the guest, snapshot its root volume, then detach and delete the
/// volume; it is not needed once the snapshot exists.
async fn snapshot_root_volume<C: Clock + ?Sized>(
    infra: &impl Provisioner,
    clock: &C,
    session: &Session,
    guest: &Instance,
    image_id: &str,
) -> Result<RootSnapshot> {
    info!(instance_id = %guest.id, "stopping instance to snapshot its root volume");
    infra.stop_instance(&guest.id).await?;
    wait::wait_for_instance(
        infra,
        clock,
        &guest.id,
        InstanceState::Stopped,
        wait::INSTANCE_TIMEOUT,
    )
    .await?;

    let guest = infra.get_instance(&guest.id).await?;
    let root_dev = guest
        .root_device_name
        .clone()
        .ok_or_else(|| Error::Api(format!("instance {} reports no root device", guest.id)))?;
    // Some images report the root device with a partition suffix.
    let volume_id = match guest.volume_on(&root_dev) {
        Some(id) => id.to_string(),
        None => {
            let stripped = root_dev.trim_end_matches(|c: char| c.is_ascii_digit());
            guest
                .volume_on(stripped)
                .map(str::to_string)
                .ok_or_else(|| Error::NotFound(format!("root volume of {}", guest.id)))?
        }
    };

    let volume = infra.get_volume(&volume_id).await?;
    infra
        .create_tags(
            &volume_id,
            &session.tags_with(
                Some(&format!("Original unencrypted root volume from {image_id}")),
                None,
            ),
        )
        .await?;

    let snapshot = infra
        .create_snapshot(
            &volume_id,
            NAME_ORIGINAL_SNAPSHOT,
            &format!("Original unencrypted root volume from {image_id}"),
        )
        .await?;
    info!(
        snapshot_id = %snapshot.id,
        volume_id,
        "creating snapshot of the root volume"
    );
    infra
        .create_tags(&snapshot.id, &session.tags_with(None, None))
        .await?;
    wait::wait_for_snapshots(infra, clock, &[snapshot.id.clone()]).await?;

    info!(volume_id, "detaching and deleting the unencrypted root volume");
    infra.detach_volume(&volume_id, &guest.id, true).await?;
    infra.delete_volume(&volume_id).await?;

    Ok(RootSnapshot {
        snapshot_id: snapshot.id,
        size_gib: volume.size_gib,
        volume_type: volume.volume_type,
        iops: volume.iops,
    })
}

pub(crate) async fn create_encryptor_security_group(
    infra: &impl Provisioner,
    session: &Session,
    vpc_id: Option<&str>,
) -> Result<String> {
    let name = format!("Sealer Encryptor {}", session.id());
    let group_id = infra
        .create_security_group(&name, DESCRIPTION_ENCRYPTOR_SECURITY_GROUP, vpc_id)
        .await?;
    info!(group_id, "created temporary security group");

    if let Err(err) = infra.open_ingress_port(&group_id, encryptor::STATUS_PORT).await {
        error!(group_id, %err, "failed adding security group rule");
        info!(group_id, "cleaning up temporary security group");
        if let Err(delete_err) = infra.delete_security_group(&group_id).await {
            warn!(group_id, %delete_err, "failed deleting temporary security group");
        }
        return Err(err);
    }

    infra
        .create_tags(&group_id, &session.tags_with(None, None))
        .await?;
    Ok(group_id)
}

#[allow(clippy::too_many_arguments)]
async fn run_encryptor_instance<C: Clock + ?Sized>(
    infra: &impl Provisioner,
    clock: &C,
    session: &Session,
    opts: &EncryptOptions,
    encryptor_image: &MachineImage,
    root: &RootSnapshot,
    security_group_ids: &[String],
    zone: Option<&str>,
) -> Result<Instance> {
    let user_data = UserData {
        service_env: opts.service_env.clone(),
        token: opts.token.clone(),
        ntp_servers: opts.ntp_servers.clone(),
        updater_mode: false,
    }
    .to_json();

    let (source_device, dest_device) = match encryptor_image.virtualization {
        Virtualization::Paravirtual => (PV_SOURCE_DEVICE, PV_DEST_DEVICE),
        // 'sd' names even though the kernel maps them to 'xvd': the
        // console only exposes 'sd', and 'xvd' would let conflicting
        // attachments through.
        Virtualization::Hvm => (HVM_SOURCE_DEVICE, HVM_DEST_DEVICE),
    };

    // gp2 on both sides for burst I/O while the appliance copies the
    // root drive.
    let source = DeviceSpec {
        device: source_device.to_string(),
        snapshot_id: Some(root.snapshot_id.clone()),
        volume_type: Some("gp2".to_string()),
        delete_on_termination: true,
        ..Default::default()
    };
    let destination = DeviceSpec {
        device: dest_device.to_string(),
        size_gib: Some(destination_size_gib(root.size_gib)),
        volume_type: Some("gp2".to_string()),
        delete_on_termination: true,
        ..Default::default()
    };

    info!(snapshot_id = %root.snapshot_id, "launching encryptor instance");
    let instance = infra
        .run_instance(&LaunchSpec {
            image_id: encryptor_image.id.clone(),
            subnet_id: opts.subnet_id.clone(),
            security_group_ids: security_group_ids.to_vec(),
            availability_zone: zone.map(str::to_string),
            user_data: Some(user_data),
            devices: vec![source, destination],
            ..Default::default()
        })
        .await?;
    infra
        .create_tags(
            &instance.id,
            &session.tags_with(
                Some(NAME_ENCRYPTOR),
                Some(&format!(
                    "Copies the root snapshot from {} to a new encrypted volume",
                    opts.image_id
                )),
            ),
        )
        .await?;

    let instance = wait::wait_for_instance(
        infra,
        clock,
        &instance.id,
        InstanceState::Running,
        wait::INSTANCE_TIMEOUT,
    )
    .await?;
    info!(instance_id = %instance.id, "launched encryptor instance");

    // Name the appliance volumes so operators can tell them apart.
    let volume_names: &[(&str, &str)] = match encryptor_image.virtualization {
        Virtualization::Paravirtual => &[
            (PV_DEST_DEVICE, NAME_ENCRYPTED_ROOT_VOLUME),
            ("/dev/sda2", NAME_SYSTEM_ROOT_VOLUME),
            ("/dev/sda1", NAME_SYSTEM_GRUB_VOLUME),
            ("/dev/sda3", NAME_SYSTEM_LOG_VOLUME),
        ],
        Virtualization::Hvm => &[
            ("/dev/sda1", NAME_SYSTEM_ROOT_VOLUME),
            (HVM_DEST_DEVICE, NAME_ENCRYPTED_ROOT_VOLUME),
        ],
    };
    for (device, name) in volume_names.iter().copied() {
        if let Some(volume_id) = instance.volume_on(device) {
            infra
                .create_tags(volume_id, &session.tags_with(Some(name), None))
                .await?;
        }
    }

    Ok(instance)
}

/// Best-effort retrieval of the appliance console output so a failed
/// run leaves something to debug with.
pub(crate) async fn attach_console_log(
    infra: &impl Provisioner,
    err: Error,
    instance_id: &str,
) -> Error {
    error!(
        instance_id,
        "encryption failed, check the console output of the instance for details"
    );
    match write_console_output(infra, instance_id).await {
        Ok(Some(path)) => {
            error!(instance_id, path = %path.display(), "wrote console output");
            if matches!(err, Error::EncryptionFailed { console_log: None }) {
                return Error::EncryptionFailed {
                    console_log: Some(path),
                };
            }
        }
        Ok(None) => error!(
            instance_id,
            "console output is not available yet; check the cloud console in a minute"
        ),
        Err(write_err) => warn!(instance_id, %write_err, "unable to write console output"),
    }
    err
}

async fn write_console_output(
    infra: &impl Provisioner,
    instance_id: &str,
) -> Result<Option<PathBuf>> {
    let Some(output) = infra.get_console_output(instance_id).await? else {
        return Ok(None);
    };
    let path = std::env::temp_dir().join(format!("{instance_id}-console.log"));
    std::fs::write(&path, output)?;
    Ok(Some(path))
}

struct Assembly {
    boot_volume_id: String,
    devices: Vec<DeviceSpec>,
}

fn volume_on_required(instance: &Instance, device: &str) -> Result<String> {
    instance
        .volume_on(device)
        .map(str::to_string)
        .ok_or_else(|| Error::NotFound(format!("volume at {device} on {}", instance.id)))
}

/// Stop the appliance and snapshot the encrypted output volume plus,
/// under paravirtual, the appliance system volumes. Returns the device
/// mappings for the new image and the appliance boot volume id.
#[allow(clippy::too_many_arguments)]
async fn snapshot_encrypted_instance<C: Clock + ?Sized>(
    infra: &impl Provisioner,
    clock: &C,
    session: &Session,
    encryptor: &Instance,
    encryptor_image: &MachineImage,
    guest_image: &MachineImage,
    root: &RootSnapshot,
    legacy: bool,
) -> Result<Assembly> {
    // The appliance may rearrange its attachments while running;
    // re-read before using them.
    let encryptor = infra.get_instance(&encryptor.id).await?;

    info!(instance_id = %encryptor.id, "stopping encryptor instance");
    infra.stop_instance(&encryptor.id).await?;
    wait::wait_for_instance(
        infra,
        clock,
        &encryptor.id,
        InstanceState::Stopped,
        wait::INSTANCE_TIMEOUT,
    )
    .await?;

    let description = format!("Based on {}", guest_image.id);
    let vol_type = root
        .volume_type
        .clone()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "gp2".to_string());

    let mut devices = Vec::new();
    let boot_volume_id;
    match encryptor_image.virtualization {
        Virtualization::Paravirtual => {
            let snap_guest = infra
                .create_snapshot(
                    &volume_on_required(&encryptor, PV_DEST_DEVICE)?,
                    NAME_ENCRYPTED_ROOT_SNAPSHOT,
                    &description,
                )
                .await?;
            let snap_root = infra
                .create_snapshot(
                    &volume_on_required(&encryptor, "/dev/sda2")?,
                    NAME_SYSTEM_ROOT_SNAPSHOT,
                    &description,
                )
                .await?;
            let snap_log = infra
                .create_snapshot(
                    &volume_on_required(&encryptor, "/dev/sda3")?,
                    NAME_SYSTEM_LOG_SNAPSHOT,
                    &description,
                )
                .await?;
            info!(
                encrypted = %snap_guest.id,
                system = %snap_root.id,
                log = %snap_log.id,
                "creating snapshots for the new encrypted image"
            );
            for snapshot_id in [&snap_guest.id, &snap_root.id, &snap_log.id] {
                infra
                    .create_tags(snapshot_id, &session.tags_with(None, None))
                    .await?;
            }
            wait::wait_for_snapshots(
                infra,
                clock,
                &[
                    snap_guest.id.clone(),
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
            devices.push(DeviceSpec {
                device: PV_DEST_DEVICE.to_string(),
                snapshot_id: Some(snap_guest.id),
                volume_type: Some(vol_type),
                iops: root.iops,
                delete_on_termination: true,
                ..Default::default()
            });
            boot_volume_id = volume_on_required(&encryptor, "/dev/sda1")?;
        }
        Virtualization::Hvm => {
            let snap_guest = infra
                .create_snapshot(
                    &volume_on_required(&encryptor, HVM_DEST_DEVICE)?,
                    NAME_ENCRYPTED_ROOT_SNAPSHOT,
                    &description,
                )
                .await?;
            info!(
                encrypted = %snap_guest.id,
                "creating snapshot for the new encrypted image"
            );
            infra
                .create_tags(&snap_guest.id, &session.tags_with(None, None))
                .await?;
            wait::wait_for_snapshots(infra, clock, &[snap_guest.id.clone()]).await?;

            devices.push(DeviceSpec {
                device: HVM_SOURCE_DEVICE.to_string(),
                snapshot_id: Some(snap_guest.id),
                volume_type: Some(vol_type),
                iops: root.iops,
                delete_on_termination: true,
                ..Default::default()
            });
            boot_volume_id = volume_on_required(&encryptor, "/dev/sda1")?;
        }
    }

    if !legacy {
        info!(volume_id = %boot_volume_id, "detaching the new system boot volume");
        infra.detach_volume(&boot_volume_id, &encryptor.id, true).await?;
        infra
            .create_tags(
                &boot_volume_id,
                &session.tags_with(Some(NAME_SYSTEM_ROOT_VOLUME), None),
            )
            .await?;
    }

    // Carry over any ephemeral mappings the source image declared.
    for device in &guest_image.devices {
        if device.virtual_name.is_some() {
            info!(
                device = %device.device,
                virtual_name = ?device.virtual_name,
                "propagating ephemeral device mapping"
            );
            devices.push(DeviceSpec {
                device: device.device.clone(),
                virtual_name: device.virtual_name.clone(),
                ..Default::default()
            });
        }
    }

    Ok(Assembly {
        boot_volume_id,
        devices,
    })
}

/// Register the final image. Non-legacy registers from the stopped
/// guest, which keeps billing metadata from its identity document;
/// legacy registers from the appliance after shedding every device
/// except its boot drive.
#[allow(clippy::too_many_arguments)]
async fn register_image<C: Clock + ?Sized>(
    infra: &impl Provisioner,
    clock: &C,
    session: &Session,
    guest: &Instance,
    encryptor: &Instance,
    encryptor_image: &MachineImage,
    assembly: &Assembly,
    name: &str,
    description: &str,
    legacy: bool,
) -> Result<String> {
    let mut devices = assembly.devices.clone();
    let source_id;
    if legacy {
        let encryptor = infra.get_instance(&encryptor.id).await?;
        source_id = encryptor.id.clone();
        for device in [
            "/dev/sda2", "/dev/sda3", "/dev/sda4", PV_DEST_DEVICE, HVM_SOURCE_DEVICE,
            HVM_DEST_DEVICE,
        ] {
            let Some(volume_id) = encryptor.volume_on(device).map(str::to_string) else {
                continue;
            };
            infra.detach_volume(&volume_id, &encryptor.id, true).await?;
            infra.delete_volume(&volume_id).await?;
        }
    } else {
        let root_device = guest
            .root_device_name
            .clone()
            .unwrap_or_else(|| CANONICAL_ROOT_DEVICE.to_string());
        source_id = guest.id.clone();
        infra
            .attach_volume(&assembly.boot_volume_id, &guest.id, &root_device)
            .await?;
        info!(device = %root_device, "attached new system boot volume to the guest");
        devices.push(DeviceSpec {
            device: root_device,
            delete_on_termination: true,
            ..Default::default()
        });
    }

    let image_id = infra
        .create_image(&source_id, name, description, &devices)
        .await?;
    info!(image_id, "registered image from the snapshots");

    if !legacy {
        info!(volume_id = %assembly.boot_volume_id, "deleting the system boot volume");
        infra
            .detach_volume(&assembly.boot_volume_id, &guest.id, true)
            .await?;
        infra.delete_volume(&assembly.boot_volume_id).await?;
    }

    wait::wait_for_image(infra, clock, &image_id).await?;

    // Name the image's root snapshot after its role.
    let root_snapshot_name = match encryptor_image.virtualization {
        Virtualization::Paravirtual => NAME_SYSTEM_GRUB_SNAPSHOT,
        Virtualization::Hvm => NAME_SYSTEM_ROOT_SNAPSHOT,
    };
    let image = infra.get_image(&image_id).await?;
    if let Some(root_device) = image.root_device_name.as_deref() {
        if let Some(snapshot_id) = image
            .device(root_device)
            .and_then(|d| d.snapshot_id.as_deref())
        {
            infra
                .create_tags(
                    snapshot_id,
                    &session.tags_with(Some(root_snapshot_name), Some(description)),
                )
                .await?;
        }
    }
    infra
        .create_tags(&image_id, &session.tags_with(None, None))
        .await?;

    Ok(image_id)
}
