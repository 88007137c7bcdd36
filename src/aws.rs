use aws_types::region::Region;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::infra::{
    AttachedDevice, DeviceSpec, ImageDevice, ImageState, Instance, InstanceState, LaunchSpec,
    MachineImage, Provisioner, Snapshot, SnapshotState, Virtualization, Volume, VolumeState,
};

/// EC2-backed provisioner. One region per handle; the client is rebuilt
/// per call from the ambient credential chain.
#[derive(Clone)]
pub struct Aws {
    aws_profile: String,
    region: String,
}

impl Aws {
    pub async fn new(aws_profile: String, region: String) -> Aws {
        Aws {
            aws_profile,
            region,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    async fn client(&self) -> aws_sdk_ec2::Client {
        let config = aws_config::from_env()
            .profile_name(&self.aws_profile)
            .region(Region::new(self.region.clone()))
            .load()
            .await;
        aws_sdk_ec2::Client::new(&config)
    }
}

fn api_err(err: impl std::fmt::Display) -> Error {
    Error::Api(err.to_string())
}

/* RESPONSE TRANSLATION */

fn to_instance(instance: &aws_sdk_ec2::types::Instance) -> Result<Instance> {
    let id = instance
        .instance_id()
        .ok_or_else(|| api_err("could not parse instance id"))?
        .to_string();
    let state = instance
        .state()
        .and_then(|s| s.name())
        .map(|n| n.as_str())
        .ok_or_else(|| api_err("could not parse instance state"))?;
    let state = InstanceState::parse(state)
        .ok_or_else(|| api_err(format!("unknown instance state {state}")))?;

    let devices = instance
        .block_device_mappings()
        .iter()
        .filter_map(|mapping| {
            let device = mapping.device_name()?.to_string();
            let volume_id = mapping.ebs().and_then(|ebs| ebs.volume_id())?.to_string();
            Some(AttachedDevice { device, volume_id })
        })
        .collect();

    Ok(Instance {
        id,
        state,
        root_device_name: instance.root_device_name().map(str::to_string),
        availability_zone: instance
            .placement()
            .and_then(|p| p.availability_zone())
            .map(str::to_string),
        public_ip: instance.public_ip_address().map(str::to_string),
        private_ip: instance.private_ip_address().map(str::to_string),
        devices,
    })
}

fn to_image(image: &aws_sdk_ec2::types::Image) -> Result<MachineImage> {
    let id = image
        .image_id()
        .ok_or_else(|| api_err("could not parse image id"))?
        .to_string();
    let state = image
        .state()
        .map(|s| s.as_str())
        .ok_or_else(|| api_err("could not parse image state"))?;
    let state =
        ImageState::parse(state).ok_or_else(|| api_err(format!("unknown image state {state}")))?;
    let virtualization = image
        .virtualization_type()
        .map(|v| v.as_str())
        .ok_or_else(|| api_err("could not parse virtualization type"))?;
    let virtualization = Virtualization::parse(virtualization)
        .ok_or_else(|| api_err(format!("unknown virtualization type {virtualization}")))?;

    let devices = image
        .block_device_mappings()
        .iter()
        .filter_map(|mapping| {
            let device = mapping.device_name()?.to_string();
            let ebs = mapping.ebs();
            Some(ImageDevice {
                device,
                snapshot_id: ebs.and_then(|e| e.snapshot_id()).map(str::to_string),
                size_gib: ebs.and_then(|e| e.volume_size()),
                virtual_name: mapping.virtual_name().map(str::to_string),
                delete_on_termination: ebs
                    .and_then(|e| e.delete_on_termination())
                    .unwrap_or(false),
            })
        })
        .collect();

    Ok(MachineImage {
        id,
        name: image.name().map(str::to_string),
        description: image.description().map(str::to_string),
        state,
        virtualization,
        root_device_name: image.root_device_name().map(str::to_string),
        devices,
    })
}

fn to_snapshot(
    id: Option<&str>,
    state: Option<&aws_sdk_ec2::types::SnapshotState>,
    progress: Option<&str>,
    volume_size: Option<i32>,
) -> Result<Snapshot> {
    let id = id
        .ok_or_else(|| api_err("could not parse snapshot id"))?
        .to_string();
    let state = state
        .map(|s| s.as_str())
        .ok_or_else(|| api_err("could not parse snapshot state"))?;
    let state = SnapshotState::parse(state)
        .ok_or_else(|| api_err(format!("unknown snapshot state {state}")))?;
    Ok(Snapshot {
        id,
        state,
        progress: progress.map(str::to_string),
        volume_size_gib: volume_size,
    })
}

fn to_volume(volume: &aws_sdk_ec2::types::Volume) -> Result<Volume> {
    let id = volume
        .volume_id()
        .ok_or_else(|| api_err("could not parse volume id"))?
        .to_string();
    let state = volume
        .state()
        .map(|s| s.as_str())
        .ok_or_else(|| api_err("could not parse volume state"))?;
    let state = VolumeState::parse(state)
        .ok_or_else(|| api_err(format!("unknown volume state {state}")))?;
    Ok(Volume {
        id,
        state,
        size_gib: volume
            .size()
            .ok_or_else(|| api_err("could not parse volume size"))?,
        volume_type: volume.volume_type().map(|t| t.as_str().to_string()),
        iops: volume.iops(),
    })
}

fn to_bdm_request(device: &DeviceSpec) -> aws_sdk_ec2::types::BlockDeviceMapping {
    let mut mapping =
        aws_sdk_ec2::types::BlockDeviceMapping::builder().device_name(&device.device);
    if let Some(virtual_name) = &device.virtual_name {
        mapping = mapping.virtual_name(virtual_name);
    } else {
        let mut ebs = aws_sdk_ec2::types::EbsBlockDevice::builder()
            .delete_on_termination(device.delete_on_termination);
        if let Some(snapshot_id) = &device.snapshot_id {
            ebs = ebs.snapshot_id(snapshot_id);
        }
        if let Some(size) = device.size_gib {
            ebs = ebs.volume_size(size);
        }
        if let Some(volume_type) = &device.volume_type {
            ebs = ebs.volume_type(aws_sdk_ec2::types::VolumeType::from(volume_type.as_str()));
        }
        if let Some(iops) = device.iops {
            ebs = ebs.iops(iops);
        }
        mapping = mapping.ebs(ebs.build());
    }
    mapping.build()
}

fn tag_filter(key: &str, value: &str) -> aws_sdk_ec2::types::Filter {
    aws_sdk_ec2::types::Filter::builder()
        .name(format!("tag:{key}"))
        .values(value)
        .build()
}

/* EC2 VERBS */

#[async_trait]
impl Provisioner for Aws {
    async fn run_instance(&self, spec: &LaunchSpec) -> Result<Instance> {
        let mut request = self
            .client()
            .await
            .run_instances()
            .image_id(&spec.image_id)
            .min_count(1)
            .max_count(1)
            .ebs_optimized(spec.ebs_optimized);

        if let Some(instance_type) = &spec.instance_type {
            request = request.instance_type(aws_sdk_ec2::types::InstanceType::from(
                instance_type.as_str(),
            ));
        }
        if let Some(subnet_id) = &spec.subnet_id {
            request = request.subnet_id(subnet_id);
        }
        for group_id in &spec.security_group_ids {
            request = request.security_group_ids(group_id);
        }
        if let Some(zone) = &spec.availability_zone {
            request = request.placement(
                aws_sdk_ec2::types::Placement::builder()
                    .availability_zone(zone)
                    .build(),
            );
        }
        if let Some(user_data) = &spec.user_data {
            request = request.user_data(BASE64.encode(user_data));
        }
        for device in &spec.devices {
            request = request.block_device_mappings(to_bdm_request(device));
        }

        let resp = request.send().await.map_err(api_err)?;
        to_instance(
            resp.instances()
                .first()
                .ok_or_else(|| api_err("no instance in run response"))?,
        )
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Instance> {
        let resp = self
            .client()
            .await
            .describe_instances()
            .filters(
                aws_sdk_ec2::types::Filter::builder()
                    .name("instance-id")
                    .values(instance_id)
                    .build(),
            )
            .send()
            .await
            .map_err(api_err)?;
        to_instance(
            resp.reservations()
                .first()
                .ok_or_else(|| Error::NotFound(format!("instance {instance_id}")))?
                .instances()
                .first()
                .ok_or_else(|| Error::NotFound(format!("instance {instance_id}")))?,
        )
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        self.client()
            .await
            .stop_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(api_err)?;
        Ok(())
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.client()
            .await
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(api_err)?;
        Ok(())
    }

    async fn instances_by_tag(&self, key: &str, value: &str) -> Result<Vec<Instance>> {
        let resp = self
            .client()
            .await
            .describe_instances()
            .filters(tag_filter(key, value))
            .send()
            .await
            .map_err(api_err)?;
        resp.reservations()
            .iter()
            .flat_map(|r| r.instances())
            .map(to_instance)
            .collect()
    }

    async fn get_image(&self, image_id: &str) -> Result<MachineImage> {
        self.find_image(image_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("image {image_id}")))
    }

    async fn find_image(&self, image_id: &str) -> Result<Option<MachineImage>> {
        // Filtering instead of passing image ids keeps a missing image
        // an empty response rather than an InvalidAMIID error.
        let resp = self
            .client()
            .await
            .describe_images()
            .filters(
                aws_sdk_ec2::types::Filter::builder()
                    .name("image-id")
                    .values(image_id)
                    .build(),
            )
            .send()
            .await
            .map_err(api_err)?;
        match resp.images().first() {
            Some(image) => Ok(Some(to_image(image)?)),
            None => Ok(None),
        }
    }

    async fn create_image(
        &self,
        instance_id: &str,
        name: &str,
        description: &str,
        devices: &[DeviceSpec],
    ) -> Result<String> {
        let mut request = self
            .client()
            .await
            .create_image()
            .instance_id(instance_id)
            .name(name)
            .description(description)
            .no_reboot(true);
        for device in devices {
            request = request.block_device_mappings(to_bdm_request(device));
        }
        let resp = request.send().await.map_err(api_err)?;
        Ok(resp
            .image_id()
            .ok_or_else(|| api_err("could not parse image id"))?
            .to_string())
    }

    async fn create_snapshot(
        &self,
        volume_id: &str,
        name: &str,
        description: &str,
    ) -> Result<Snapshot> {
        let name_tag = aws_sdk_ec2::types::Tag::builder()
            .key("Name")
            .value(name)
            .build();
        let tags = aws_sdk_ec2::types::TagSpecification::builder()
            .resource_type(aws_sdk_ec2::types::ResourceType::Snapshot)
            .tags(name_tag)
            .build();
        let resp = self
            .client()
            .await
            .create_snapshot()
            .volume_id(volume_id)
            .description(description)
            .tag_specifications(tags)
            .send()
            .await
            .map_err(api_err)?;
        to_snapshot(
            resp.snapshot_id(),
            resp.state(),
            resp.progress(),
            resp.volume_size(),
        )
    }

    async fn get_snapshots(&self, snapshot_ids: &[String]) -> Result<Vec<Snapshot>> {
        let resp = self
            .client()
            .await
            .describe_snapshots()
            .set_snapshot_ids(Some(snapshot_ids.to_vec()))
            .send()
            .await
            .map_err(api_err)?;
        resp.snapshots()
            .iter()
            .map(|s| to_snapshot(s.snapshot_id(), s.state(), s.progress(), s.volume_size()))
            .collect()
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.client()
            .await
            .delete_snapshot()
            .snapshot_id(snapshot_id)
            .send()
            .await
            .map_err(api_err)?;
        Ok(())
    }

    async fn snapshots_by_tag(&self, key: &str, value: &str) -> Result<Vec<Snapshot>> {
        let resp = self
            .client()
            .await
            .describe_snapshots()
            .owner_ids("self")
            .filters(tag_filter(key, value))
            .send()
            .await
            .map_err(api_err)?;
        resp.snapshots()
            .iter()
            .map(|s| to_snapshot(s.snapshot_id(), s.state(), s.progress(), s.volume_size()))
            .collect()
    }

    async fn create_volume(
        &self,
        size_gib: i32,
        zone: &str,
        snapshot_id: Option<&str>,
        volume_type: &str,
    ) -> Result<Volume> {
        let mut request = self
            .client()
            .await
            .create_volume()
            .size(size_gib)
            .availability_zone(zone)
            .volume_type(aws_sdk_ec2::types::VolumeType::from(volume_type));
        if let Some(snapshot_id) = snapshot_id {
            request = request.snapshot_id(snapshot_id);
        }
        let resp = request.send().await.map_err(api_err)?;
        Ok(Volume {
            id: resp
                .volume_id()
                .ok_or_else(|| api_err("could not parse volume id"))?
                .to_string(),
            state: resp
                .state()
                .map(|s| s.as_str())
                .and_then(VolumeState::parse)
                .unwrap_or(VolumeState::Creating),
            size_gib: resp.size().unwrap_or(size_gib),
            volume_type: resp.volume_type().map(|t| t.as_str().to_string()),
            iops: resp.iops(),
        })
    }

    async fn get_volume(&self, volume_id: &str) -> Result<Volume> {
        let resp = self
            .client()
            .await
            .describe_volumes()
            .volume_ids(volume_id)
            .send()
            .await
            .map_err(api_err)?;
        to_volume(
            resp.volumes()
                .first()
                .ok_or_else(|| Error::NotFound(format!("volume {volume_id}")))?,
        )
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        self.client()
            .await
            .delete_volume()
            .volume_id(volume_id)
            .send()
            .await
            .map_err(api_err)?;
        Ok(())
    }

    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()> {
        self.client()
            .await
            .attach_volume()
            .volume_id(volume_id)
            .instance_id(instance_id)
            .device(device)
            .send()
            .await
            .map_err(api_err)?;
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str, instance_id: &str, force: bool) -> Result<()> {
        self.client()
            .await
            .detach_volume()
            .volume_id(volume_id)
            .instance_id(instance_id)
            .force(force)
            .send()
            .await
            .map_err(api_err)?;
        Ok(())
    }

    async fn volumes_by_tag(&self, key: &str, value: &str) -> Result<Vec<Volume>> {
        let resp = self
            .client()
            .await
            .describe_volumes()
            .filters(tag_filter(key, value))
            .send()
            .await
            .map_err(api_err)?;
        resp.volumes().iter().map(to_volume).collect()
    }

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        vpc_id: Option<&str>,
    ) -> Result<String> {
        let mut request = self
            .client()
            .await
            .create_security_group()
            .group_name(name)
            .description(description);
        if let Some(vpc_id) = vpc_id {
            request = request.vpc_id(vpc_id);
        }
        let resp = request.send().await.map_err(api_err)?;
        Ok(resp
            .group_id()
            .ok_or_else(|| api_err("could not parse group id"))?
            .to_string())
    }

    async fn open_ingress_port(&self, group_id: &str, port: u16) -> Result<()> {
        let range = aws_sdk_ec2::types::IpRange::builder()
            .cidr_ip("0.0.0.0/0")
            .build();
        let permission = aws_sdk_ec2::types::IpPermission::builder()
            .ip_protocol("tcp")
            .from_port(i32::from(port))
            .to_port(i32::from(port))
            .ip_ranges(range)
            .build();
        self.client()
            .await
            .authorize_security_group_ingress()
            .group_id(group_id)
            .ip_permissions(permission)
            .send()
            .await
            .map_err(api_err)?;
        Ok(())
    }

    async fn delete_security_group(&self, group_id: &str) -> Result<()> {
        self.client()
            .await
            .delete_security_group()
            .group_id(group_id)
            .send()
            .await
            .map_err(api_err)?;
        Ok(())
    }

    async fn security_groups_by_tag(&self, key: &str, value: &str) -> Result<Vec<String>> {
        let resp = self
            .client()
            .await
            .describe_security_groups()
            .filters(tag_filter(key, value))
            .send()
            .await
            .map_err(api_err)?;
        Ok(resp
            .security_groups()
            .iter()
            .filter_map(|g| g.group_id())
            .map(str::to_string)
            .collect())
    }

    async fn create_tags(&self, resource_id: &str, tags: &[(String, String)]) -> Result<()> {
        let mut request = self.client().await.create_tags().resources(resource_id);
        for (key, value) in tags {
            request = request.tags(
                aws_sdk_ec2::types::Tag::builder()
                    .key(key)
                    .value(value)
                    .build(),
            );
        }
        request.send().await.map_err(api_err)?;
        Ok(())
    }

    async fn get_subnet_vpc(&self, subnet_id: &str) -> Result<String> {
        let resp = self
            .client()
            .await
            .describe_subnets()
            .subnet_ids(subnet_id)
            .send()
            .await
            .map_err(api_err)?;
        Ok(resp
            .subnets()
            .first()
            .ok_or_else(|| Error::NotFound(format!("subnet {subnet_id}")))?
            .vpc_id()
            .ok_or_else(|| api_err("could not parse vpc id"))?
            .to_string())
    }

    async fn get_console_output(&self, instance_id: &str) -> Result<Option<String>> {
        let resp = self
            .client()
            .await
            .get_console_output()
            .instance_id(instance_id)
            .send()
            .await
            .map_err(api_err)?;
        let Some(output) = resp.output() else {
            return Ok(None);
        };
        let decoded = BASE64.decode(output).map_err(api_err)?;
        Ok(Some(String::from_utf8_lossy(&decoded).into_owned()))
    }

    async fn sriov_net_support(&self, instance_id: &str) -> Result<Option<String>> {
        let resp = self
            .client()
            .await
            .describe_instance_attribute()
            .instance_id(instance_id)
            .attribute(aws_sdk_ec2::types::InstanceAttributeName::SriovNetSupport)
            .send()
            .await
            .map_err(api_err)?;
        Ok(resp
            .sriov_net_support()
            .and_then(|attr| attr.value())
            .map(str::to_string))
    }
}
