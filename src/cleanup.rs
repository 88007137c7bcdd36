use tracing::{info, warn};

use crate::clock::Clock;
use crate::infra::{InstanceState, Provisioner};
use crate::wait;

/// Resources a run has created and not handed over to the final image.
/// Consumed exactly once by [`clean_up`].
#[derive(Clone, Debug, Default)]
pub struct CleanupSet {
    pub instance_ids: Vec<String>,
    pub volume_ids: Vec<String>,
    pub snapshot_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
}

impl CleanupSet {
    pub fn is_empty(&self) -> bool {
        self.instance_ids.is_empty()
            && self.volume_ids.is_empty()
            && self.snapshot_ids.is_empty()
            && self.security_group_ids.is_empty()
    }

    pub fn add_volume(&mut self, volume_id: &str) {
        if !self.volume_ids.iter().any(|id| id == volume_id) {
            self.volume_ids.push(volume_id.to_string());
        }
    }
}

/// Delete everything in `set`, best effort and in dependency order.
///
/// Every failure is logged as a warning and swallowed so one stuck
/// resource never aborts the rest of the sweep, and so the error that
/// brought us here stays the one the caller sees. Volumes and security
/// groups go last: providers refuse to delete them while an instance
/// still holds them, so the sweep waits for the instances to terminate
/// first.
pub async fn clean_up<C: Clock + ?Sized>(
    infra: &impl Provisioner,
    clock: &C,
    set: CleanupSet,
) {
    if set.is_empty() {
        return;
    }

    let mut terminated = Vec::new();
    for instance_id in &set.instance_ids {
        info!(instance_id, "terminating instance");
        match infra.terminate_instance(instance_id).await {
            Ok(()) => terminated.push(instance_id.clone()),
            Err(err) => warn!(instance_id, %err, "unable to terminate instance"),
        }
    }

    for snapshot_id in &set.snapshot_ids {
        info!(snapshot_id, "deleting snapshot");
        if let Err(err) = infra.delete_snapshot(snapshot_id).await {
            warn!(snapshot_id, %err, "unable to delete snapshot");
        }
    }

    for instance_id in &terminated {
        info!(instance_id, "waiting for instance to terminate");
        if let Err(err) = wait::wait_for_instance(
            infra,
            clock,
            instance_id,
            InstanceState::Terminated,
            wait::INSTANCE_TIMEOUT,
        )
        .await
        {
            warn!(instance_id, %err, "error while waiting for instance to terminate");
        }
    }

    for volume_id in &set.volume_ids {
        info!(volume_id, "deleting volume");
        if let Err(err) = infra.delete_volume(volume_id).await {
            warn!(volume_id, %err, "unable to delete volume");
        }
    }

    for group_id in &set.security_group_ids {
        info!(group_id, "deleting security group");
        if let Err(err) = infra.delete_security_group(group_id).await {
            warn!(group_id, %err, "unable to delete security group");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::WallClock;
    use crate::test::TestCloud;

    #[tokio::test(start_paused = true)]
    async fn sweep_continues_past_failures() {
        let cloud = TestCloud::new();
        let good = cloud.seed_instance(InstanceState::Running);
        let volume_id = cloud.seed_volume(8);

        let set = CleanupSet {
            // The first id does not exist; termination fails but the
            // sweep must still reach the rest.
            instance_ids: vec!["i-missing".to_string(), good.clone()],
            volume_ids: vec!["vol-missing".to_string(), volume_id.clone()],
            snapshot_ids: vec!["snap-missing".to_string()],
            security_group_ids: vec!["sg-missing".to_string()],
        };
        clean_up(&cloud, &WallClock, set).await;

        assert_eq!(cloud.instance_state(&good), Some(InstanceState::Terminated));
        assert!(cloud.volume_is_gone(&volume_id));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_set_is_a_no_op() {
        let cloud = TestCloud::new();
        clean_up(&cloud, &WallClock, CleanupSet::default()).await;
        assert_eq!(cloud.counters().terminate_instance, 0);
    }
}
