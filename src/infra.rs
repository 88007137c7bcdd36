use std::fmt;

use async_trait::async_trait;

use crate::error::Result;

/// Provider-agnostic instance lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    Error,
}

impl InstanceState {
    pub fn parse(s: &str) -> Option<InstanceState> {
        match s {
            "pending" => Some(InstanceState::Pending),
            "running" => Some(InstanceState::Running),
            "stopping" => Some(InstanceState::Stopping),
            "stopped" => Some(InstanceState::Stopped),
            "shutting-down" => Some(InstanceState::ShuttingDown),
            "terminated" => Some(InstanceState::Terminated),
            "error" => Some(InstanceState::Error),
            _ => None,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Deleting,
    Error,
}

impl VolumeState {
    pub fn parse(s: &str) -> Option<VolumeState> {
        match s {
            "creating" => Some(VolumeState::Creating),
            "available" => Some(VolumeState::Available),
            "in-use" => Some(VolumeState::InUse),
            "deleting" => Some(VolumeState::Deleting),
            "error" => Some(VolumeState::Error),
            _ => None,
        }
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumeState::Creating => "creating",
            VolumeState::Available => "available",
            VolumeState::InUse => "in-use",
            VolumeState::Deleting => "deleting",
            VolumeState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotState {
    Pending,
    Completed,
    Error,
}

impl SnapshotState {
    pub fn parse(s: &str) -> Option<SnapshotState> {
        match s {
            "pending" => Some(SnapshotState::Pending),
            "completed" => Some(SnapshotState::Completed),
            "error" => Some(SnapshotState::Error),
            _ => None,
        }
    }
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapshotState::Pending => "pending",
            SnapshotState::Completed => "completed",
            SnapshotState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageState {
    Pending,
    Available,
    Failed,
}

impl ImageState {
    pub fn parse(s: &str) -> Option<ImageState> {
        match s {
            "pending" => Some(ImageState::Pending),
            "available" => Some(ImageState::Available),
            "failed" => Some(ImageState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImageState::Pending => "pending",
            ImageState::Available => "available",
            ImageState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Virtualization {
    Hvm,
    Paravirtual,
}

impl Virtualization {
    pub fn parse(s: &str) -> Option<Virtualization> {
        match s {
            "hvm" => Some(Virtualization::Hvm),
            "paravirtual" => Some(Virtualization::Paravirtual),
            _ => None,
        }
    }
}

impl fmt::Display for Virtualization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Virtualization::Hvm => "hvm",
            Virtualization::Paravirtual => "paravirtual",
        };
        f.write_str(s)
    }
}

/// Volume attached to an instance at a device name.
#[derive(Clone, Debug)]
pub struct AttachedDevice {
    pub device: String,
    pub volume_id: String,
}

#[derive(Clone, Debug)]
pub struct Instance {
    pub id: String,
    pub state: InstanceState,
    pub root_device_name: Option<String>,
    pub availability_zone: Option<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub devices: Vec<AttachedDevice>,
}

impl Instance {
    /// Id of the volume attached at `device`, if any.
    pub fn volume_on(&self, device: &str) -> Option<&str> {
        self.devices
            .iter()
            .find(|d| d.device == device)
            .map(|d| d.volume_id.as_str())
    }
}

/// One device mapping of a machine image.
#[derive(Clone, Debug)]
pub struct ImageDevice {
    pub device: String,
    pub snapshot_id: Option<String>,
    pub size_gib: Option<i32>,
    /// Set for ephemeral (instance store) mappings.
    pub virtual_name: Option<String>,
    pub delete_on_termination: bool,
}

#[derive(Clone, Debug)]
pub struct MachineImage {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub state: ImageState,
    pub virtualization: Virtualization,
    pub root_device_name: Option<String>,
    pub devices: Vec<ImageDevice>,
}

impl MachineImage {
    pub fn device(&self, name: &str) -> Option<&ImageDevice> {
        self.devices.iter().find(|d| d.device == name)
    }
}

#[derive(Clone, Debug)]
pub struct Volume {
    pub id: String,
    pub state: VolumeState,
    pub size_gib: i32,
    pub volume_type: Option<String>,
    pub iops: Option<i32>,
}

#[derive(Clone, Debug)]
pub struct Snapshot {
    pub id: String,
    pub state: SnapshotState,
    pub progress: Option<String>,
    pub volume_size_gib: Option<i32>,
}

/// Block device requested at launch or image registration.
#[derive(Clone, Debug, Default)]
pub struct DeviceSpec {
    pub device: String,
    pub snapshot_id: Option<String>,
    pub size_gib: Option<i32>,
    pub volume_type: Option<String>,
    pub iops: Option<i32>,
    pub delete_on_termination: bool,
    /// Ephemeral mapping; mutually exclusive with the EBS fields.
    pub virtual_name: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LaunchSpec {
    pub image_id: String,
    pub instance_type: Option<String>,
    pub subnet_id: Option<String>,
    pub security_group_ids: Vec<String>,
    pub availability_zone: Option<String>,
    /// Plain text; adapters encode as their provider requires.
    pub user_data: Option<String>,
    pub devices: Vec<DeviceSpec>,
    pub ebs_optimized: bool,
}

/// Capability interface the workflows drive.
///
/// One implementation per cloud provider. Every verb is a single
/// blocking call against the provider; adapters translate raw SDK
/// responses into the value types above so the workflows never touch
/// provider shapes. Verbs return errors for provider-reported failures;
/// existence probes (`find_image`) return `None` instead of erroring.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn run_instance(&self, spec: &LaunchSpec) -> Result<Instance>;
    async fn get_instance(&self, instance_id: &str) -> Result<Instance>;
    async fn stop_instance(&self, instance_id: &str) -> Result<()>;
    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;
    async fn instances_by_tag(&self, key: &str, value: &str) -> Result<Vec<Instance>>;

    async fn get_image(&self, image_id: &str) -> Result<MachineImage>;
    async fn find_image(&self, image_id: &str) -> Result<Option<MachineImage>>;
    async fn create_image(
        &self,
        instance_id: &str,
        name: &str,
        description: &str,
        devices: &[DeviceSpec],
    ) -> Result<String>;

    async fn create_snapshot(
        &self,
        volume_id: &str,
        name: &str,
        description: &str,
    ) -> Result<Snapshot>;
    async fn get_snapshots(&self, snapshot_ids: &[String]) -> Result<Vec<Snapshot>>;
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;
    async fn snapshots_by_tag(&self, key: &str, value: &str) -> Result<Vec<Snapshot>>;

    async fn create_volume(
        &self,
        size_gib: i32,
        zone: &str,
        snapshot_id: Option<&str>,
        volume_type: &str,
    ) -> Result<Volume>;
    async fn get_volume(&self, volume_id: &str) -> Result<Volume>;
    async fn delete_volume(&self, volume_id: &str) -> Result<()>;
    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()>;
    async fn detach_volume(&self, volume_id: &str, instance_id: &str, force: bool) -> Result<()>;
    async fn volumes_by_tag(&self, key: &str, value: &str) -> Result<Vec<Volume>>;

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        vpc_id: Option<&str>,
    ) -> Result<String>;
    async fn open_ingress_port(&self, group_id: &str, port: u16) -> Result<()>;
    async fn delete_security_group(&self, group_id: &str) -> Result<()>;
    async fn security_groups_by_tag(&self, key: &str, value: &str) -> Result<Vec<String>>;

    async fn create_tags(&self, resource_id: &str, tags: &[(String, String)]) -> Result<()>;
    async fn get_subnet_vpc(&self, subnet_id: &str) -> Result<String>;
    async fn get_console_output(&self, instance_id: &str) -> Result<Option<String>>;
    async fn sriov_net_support(&self, instance_id: &str) -> Result<Option<String>>;
}
