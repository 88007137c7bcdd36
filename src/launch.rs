use tracing::info;

use crate::catalog::{ServiceEnv, UserData};
use crate::clock::Clock;
use crate::error::Result;
use crate::infra::{Instance, InstanceState, LaunchSpec, Provisioner};
use crate::session::Session;
use crate::wait;
use crate::workflow::DEFAULT_INSTANCE_TYPE;

#[derive(Clone, Debug, Default)]
pub struct LaunchOptions {
    pub image_id: String,
    pub instance_type: Option<String>,
    pub instance_name: Option<String>,
    pub subnet_id: Option<String>,
    pub security_group_ids: Vec<String>,
    pub service_env: Option<ServiceEnv>,
    pub token: Option<String>,
}

/// Launch an instance from an encrypted image with the service
/// endpoints and identity token wired through user data.
pub async fn launch<P, C>(
    infra: &P,
    clock: &C,
    session: &Session,
    opts: &LaunchOptions,
) -> Result<Instance>
where
    P: Provisioner,
    C: Clock + ?Sized,
{
    let image = infra.get_image(&opts.image_id).await?;

    let user_data = UserData {
        service_env: opts.service_env.clone(),
        token: opts.token.clone(),
        ntp_servers: Vec::new(),
        updater_mode: false,
    }
    .to_json();

    let instance = infra
        .run_instance(&LaunchSpec {
            image_id: image.id.clone(),
            instance_type: Some(
                opts.instance_type
                    .clone()
                    .unwrap_or_else(|| DEFAULT_INSTANCE_TYPE.to_string()),
            ),
            subnet_id: opts.subnet_id.clone(),
            security_group_ids: opts.security_group_ids.clone(),
            user_data: Some(user_data),
            ebs_optimized: false,
            ..Default::default()
        })
        .await?;
    infra
        .create_tags(
            &instance.id,
            &session.tags_with(opts.instance_name.as_deref(), None),
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
    info!(
        instance_id = %instance.id,
        public_ip = ?instance.public_ip,
        "launched encrypted instance"
    );
    Ok(instance)
}
