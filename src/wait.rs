use std::fmt;
use std::future::Future;

use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::infra::{ImageState, Instance, InstanceState, Provisioner, Snapshot, SnapshotState, VolumeState};

pub const INSTANCE_TIMEOUT: Duration = Duration::from_secs(300);
pub const VOLUME_TIMEOUT: Duration = Duration::from_secs(300);
const INSTANCE_POLL: Duration = Duration::from_secs(2);
const VOLUME_POLL: Duration = Duration::from_secs(2);
// Describing a snapshot right after creating it can 400 before the
// creation has propagated.
const SNAPSHOT_CREATE_GRACE: Duration = Duration::from_secs(20);
const SNAPSHOT_POLL: Duration = Duration::from_secs(5);
const IMAGE_POLL: Duration = Duration::from_secs(5);
const IMAGE_ATTEMPTS: usize = 180;
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Absolute expiry time bounding a polling loop.
///
/// Expired at exactly `timeout` after construction and at every instant
/// after that.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    end: Instant,
}

impl Deadline {
    pub fn new<C: Clock + ?Sized>(timeout: Duration, clock: &C) -> Deadline {
        Deadline {
            end: clock.now() + timeout,
        }
    }

    pub fn is_expired<C: Clock + ?Sized>(&self, clock: &C) -> bool {
        clock.now() >= self.end
    }
}

/// Poll `probe` every `interval` until it reports `target`, a state
/// `fatal` flags as unrecoverable, or `timeout` elapses.
pub async fn wait_for_state<C, S, F, Fut>(
    clock: &C,
    what: &str,
    target: S,
    timeout: Duration,
    interval: Duration,
    fatal: impl Fn(&S) -> bool,
    mut probe: F,
) -> Result<S>
where
    C: Clock + ?Sized,
    S: PartialEq + fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S>>,
{
    let deadline = Deadline::new(timeout, clock);
    while !deadline.is_expired(clock) {
        let state = probe().await?;
        debug!(what, %state, "polled state");
        if state == target {
            return Ok(state);
        }
        if fatal(&state) {
            return Err(Error::UnexpectedState {
                what: what.to_string(),
                state: state.to_string(),
            });
        }
        clock.sleep(interval).await;
    }
    Err(Error::WaitTimeout {
        what: what.to_string(),
        target: target.to_string(),
    })
}

/// Wait for an instance to reach `target`. An `error` state is always
/// fatal, and so is `terminated` unless that is what we are waiting for.
pub async fn wait_for_instance<C: Clock + ?Sized>(
    infra: &impl Provisioner,
    clock: &C,
    instance_id: &str,
    target: InstanceState,
    timeout: Duration,
) -> Result<Instance> {
    debug!(instance_id, %target, ?timeout, "waiting for instance");
    let deadline = Deadline::new(timeout, clock);
    while !deadline.is_expired(clock) {
        let instance = infra.get_instance(instance_id).await?;
        debug!(instance_id, state = %instance.state, "instance state");
        if instance.state == target {
            return Ok(instance);
        }
        if instance.state == InstanceState::Error
            || (target != InstanceState::Terminated && instance.state == InstanceState::Terminated)
        {
            return Err(Error::UnexpectedState {
                what: format!("instance {instance_id}"),
                state: instance.state.to_string(),
            });
        }
        clock.sleep(INSTANCE_POLL).await;
    }
    Err(Error::WaitTimeout {
        what: format!("instance {instance_id}"),
        target: target.to_string(),
    })
}

pub async fn wait_for_volume<C: Clock + ?Sized>(
    infra: &impl Provisioner,
    clock: &C,
    volume_id: &str,
    target: VolumeState,
    timeout: Duration,
) -> Result<()> {
    wait_for_state(
        clock,
        &format!("volume {volume_id}"),
        target,
        timeout,
        VOLUME_POLL,
        |state| *state == VolumeState::Error,
        || async move { Ok(infra.get_volume(volume_id).await?.state) },
    )
    .await?;
    Ok(())
}

/// Wait until every snapshot reports `completed`. Any snapshot entering
/// an error state fails the whole wait.
pub async fn wait_for_snapshots<C: Clock + ?Sized>(
    infra: &impl Provisioner,
    clock: &C,
    snapshot_ids: &[String],
) -> Result<()> {
    debug!(?snapshot_ids, "waiting for snapshots to complete");
    clock.sleep(SNAPSHOT_CREATE_GRACE).await;

    let mut last_progress_log = clock.now();
    loop {
        let snapshots = infra.get_snapshots(snapshot_ids).await?;

        let mut done = true;
        let mut error_ids = Vec::new();
        for snapshot in &snapshots {
            if snapshot.state == SnapshotState::Error {
                error_ids.push(snapshot.id.clone());
            }
            if snapshot.state != SnapshotState::Completed {
                done = false;
            }
        }

        if !error_ids.is_empty() {
            return Err(Error::SnapshotFailed(error_ids));
        }
        if done {
            return Ok(());
        }

        let now = clock.now();
        if now - last_progress_log > PROGRESS_LOG_INTERVAL {
            info!("{}", snapshot_progress_text(&snapshots));
            last_progress_log = now;
        }
        clock.sleep(SNAPSHOT_POLL).await;
    }
}

fn snapshot_progress_text(snapshots: &[Snapshot]) -> String {
    snapshots
        .iter()
        .map(|s| format!("{}: {}", s.id, s.progress.as_deref().unwrap_or("0%")))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Wait for a freshly registered image to become available. The image
/// may not be visible at all for the first few polls.
pub async fn wait_for_image<C: Clock + ?Sized>(
    infra: &impl Provisioner,
    clock: &C,
    image_id: &str,
) -> Result<()> {
    debug!(image_id, "waiting for image to become available");
    for _ in 0..IMAGE_ATTEMPTS {
        clock.sleep(IMAGE_POLL).await;
        let image = match infra.find_image(image_id).await? {
            Some(image) => image,
            None => {
                debug!(image_id, "image not visible yet");
                continue;
            }
        };
        debug!(image_id, state = %image.state, "image state");
        match image.state {
            ImageState::Available => return Ok(()),
            ImageState::Failed => {
                return Err(Error::UnexpectedState {
                    what: format!("image {image_id}"),
                    state: image.state.to_string(),
                })
            }
            ImageState::Pending => {}
        }
    }
    Err(Error::WaitTimeout {
        what: format!("image {image_id}"),
        target: ImageState::Available.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::WallClock;

    #[tokio::test(start_paused = true)]
    async fn deadline_expires_at_exactly_timeout() {
        let clock = WallClock;
        let deadline = Deadline::new(Duration::from_secs(10), &clock);

        assert!(!deadline.is_expired(&clock));

        tokio::time::advance(Duration::from_millis(9_999)).await;
        assert!(!deadline.is_expired(&clock));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(deadline.is_expired(&clock));

        tokio::time::advance(Duration::from_secs(1000)).await;
        assert!(deadline.is_expired(&clock));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_state_reaches_target() {
        let clock = WallClock;
        let states = std::sync::Mutex::new(vec![
            VolumeState::Available,
            VolumeState::Creating,
            VolumeState::Creating,
        ]);
        let states = &states;

        let state = wait_for_state(
            &clock,
            "volume vol-1",
            VolumeState::Available,
            Duration::from_secs(60),
            Duration::from_secs(2),
            |s| *s == VolumeState::Error,
            || async move { Ok(states.lock().unwrap().pop().unwrap()) },
        )
        .await
        .unwrap();
        assert_eq!(state, VolumeState::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_state_fails_on_fatal_state() {
        let clock = WallClock;
        let err = wait_for_state(
            &clock,
            "volume vol-1",
            VolumeState::Available,
            Duration::from_secs(60),
            Duration::from_secs(2),
            |s| *s == VolumeState::Error,
            || async { Ok(VolumeState::Error) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::UnexpectedState { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_state_times_out() {
        let clock = WallClock;
        let err = wait_for_state(
            &clock,
            "volume vol-1",
            VolumeState::Available,
            Duration::from_secs(30),
            Duration::from_secs(2),
            |s| *s == VolumeState::Error,
            || async { Ok(VolumeState::Creating) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::WaitTimeout { .. }));
    }
}
