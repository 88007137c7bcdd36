use std::sync::Mutex;

use sealer::clock::WallClock;
use sealer::encryptor::{EncryptionState, EncryptorStatus};
use sealer::error::Result;
use sealer::infra::Instance;
use sealer::session::Session;
use sealer::test::{ScriptedStatus, TestCloud};
use sealer::update::{update, UpdateOptions};

fn take_source(svc: ScriptedStatus) -> impl Fn(&Instance) -> Result<ScriptedStatus> {
    let cell = Mutex::new(Some(svc));
    move |_instance: &Instance| {
        Ok(cell
            .lock()
            .unwrap()
            .take()
            .expect("status source already taken"))
    }
}

#[tokio::test(start_paused = true)]
async fn update_swaps_system_volumes_and_leaks_nothing() {
    let cloud = TestCloud::new();
    cloud.seed_simple_image("ami-sealed", 21);
    cloud.seed_simple_image("ami-updater", 4);

    let session = Session::new("ami-updater");
    let svc = ScriptedStatus::new(vec![
        Ok(EncryptorStatus {
            state: EncryptionState::Encrypting,
            percent_complete: 50,
            failure_code: None,
        }),
        Ok(EncryptorStatus {
            state: EncryptionState::Successful,
            percent_complete: 100,
            failure_code: None,
        }),
    ]);

    let opts = UpdateOptions {
        image_id: "ami-sealed".to_string(),
        updater_image_id: "ami-updater".to_string(),
        updated_image_name: "sealed image v2".to_string(),
        ..Default::default()
    };
    let image_id = update(&cloud, &WallClock, &session, take_source(svc), &opts)
        .await
        .unwrap();

    let image = cloud
        .images()
        .into_iter()
        .find(|i| i.id == image_id)
        .expect("updated image registered");
    assert_eq!(image.name.as_deref(), Some("sealed image v2"));

    assert!(cloud.live_instances().is_empty(), "no leaked instances");
    assert!(cloud.live_volumes().is_empty(), "no leaked volumes");
    assert!(
        cloud.dangling_snapshots().is_empty(),
        "boot snapshot was deleted with the run"
    );
}

#[tokio::test(start_paused = true)]
async fn update_failure_cleans_up_both_instances() {
    let cloud = TestCloud::new();
    cloud.seed_simple_image("ami-sealed", 21);
    cloud.seed_simple_image("ami-updater", 4);

    let session = Session::new("ami-updater");
    // The updater reports a generic failure on the first poll.
    let svc = ScriptedStatus::new(vec![Ok(EncryptorStatus {
        state: EncryptionState::Failed,
        percent_complete: 0,
        failure_code: Some("disk_error".to_string()),
    })]);

    let opts = UpdateOptions {
        image_id: "ami-sealed".to_string(),
        updater_image_id: "ami-updater".to_string(),
        updated_image_name: "sealed image v2".to_string(),
        ..Default::default()
    };
    let err = update(&cloud, &WallClock, &session, take_source(svc), &opts)
        .await
        .unwrap_err();
    assert!(
        matches!(err, sealer::error::Error::EncryptionFailed { .. }),
        "got {err:?}"
    );

    assert_eq!(cloud.counters().terminate_instance, 2);
    assert!(cloud.live_instances().is_empty());
    assert!(cloud.live_volumes().is_empty());
    assert_eq!(cloud.counters().create_image, 0);
}
