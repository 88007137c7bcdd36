use std::sync::Mutex;

use sealer::clock::WallClock;
use sealer::encryptor::{EncryptionState, EncryptorStatus, FAILURE_CODE_UNSUPPORTED_GUEST};
use sealer::error::{Error, Result};
use sealer::infra::{ImageDevice, ImageState, Instance, MachineImage, Virtualization};
use sealer::session::{Session, TAG_SESSION_ID};
use sealer::test::{ScriptedStatus, TestCloud};
use sealer::workflow::{destination_size_gib, encrypt, EncryptOptions};

fn ok(state: EncryptionState, percent: u8) -> Result<EncryptorStatus> {
    Ok(EncryptorStatus {
        state,
        percent_complete: percent,
        failure_code: None,
    })
}

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

fn options() -> EncryptOptions {
    EncryptOptions {
        image_id: "ami-guest".to_string(),
        encryptor_image_id: "ami-encryptor".to_string(),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn full_run_registers_one_image_and_leaks_nothing() {
    let cloud = TestCloud::new();
    cloud.seed_simple_image("ami-guest", 10);
    cloud.seed_simple_image("ami-encryptor", 4);

    let session = Session::new("ami-encryptor");
    let svc = ScriptedStatus::new(vec![
        ok(EncryptionState::Initializing, 0),
        ok(EncryptionState::Downloading, 30),
        ok(EncryptionState::Encrypting, 60),
        ok(EncryptionState::Successful, 100),
    ]);

    let image_id = encrypt(&cloud, &WallClock, &session, take_source(svc), &options())
        .await
        .unwrap();

    let counters = cloud.counters();
    assert_eq!(counters.create_image, 1, "exactly one image registered");
    assert!(cloud.images().iter().any(|i| i.id == image_id));

    // Destination volume is sized 2x the 10 GiB source plus one.
    assert_eq!(destination_size_gib(10), 21);
    assert!(
        cloud.created_volume_sizes().contains(&21),
        "destination volume of size 21 was created, got {:?}",
        cloud.created_volume_sizes()
    );

    assert!(cloud.live_instances().is_empty(), "no leaked instances");
    assert!(cloud.live_volumes().is_empty(), "no leaked volumes");
    assert!(
        cloud.dangling_snapshots().is_empty(),
        "every surviving snapshot is part of the image"
    );
}

#[tokio::test(start_paused = true)]
async fn unsupported_guest_failure_is_typed_and_cleaned_up() {
    let cloud = TestCloud::new();
    cloud.seed_simple_image("ami-guest", 10);
    cloud.seed_simple_image("ami-encryptor", 4);

    let session = Session::new("ami-encryptor");
    let svc = ScriptedStatus::new(vec![Ok(EncryptorStatus {
        state: EncryptionState::Failed,
        percent_complete: 0,
        failure_code: Some(FAILURE_CODE_UNSUPPORTED_GUEST.to_string()),
    })]);

    let err = encrypt(&cloud, &WallClock, &session, take_source(svc), &options())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedGuest), "got {err:?}");

    assert!(cloud.live_instances().is_empty(), "no leaked instances");
    assert!(cloud.live_volumes().is_empty(), "no leaked volumes");
    assert_eq!(cloud.counters().create_image, 0);
}

#[tokio::test(start_paused = true)]
async fn failure_late_in_the_run_still_cleans_everything() {
    let cloud = TestCloud::new();
    cloud.seed_simple_image("ami-guest", 10);
    cloud.seed_simple_image("ami-encryptor", 4);
    cloud.fail_on("create_image");

    let session = Session::new("ami-encryptor");
    let svc = ScriptedStatus::repeating(EncryptorStatus {
        state: EncryptionState::Successful,
        percent_complete: 100,
        failure_code: None,
    });

    let err = encrypt(&cloud, &WallClock, &session, take_source(svc), &options())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Api(_)), "got {err:?}");

    // Both instances, the original snapshot, and the temporary security
    // group were all created before the failure; every one of them must
    // see a delete attempt.
    let counters = cloud.counters();
    assert_eq!(counters.terminate_instance, 2);
    assert!(counters.delete_snapshot >= 1);
    assert_eq!(counters.delete_security_group, 1);
    assert!(cloud.live_instances().is_empty());
    assert!(cloud.live_volumes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn pv_guest_under_hvm_encryptor_fails_before_creating_anything() {
    let cloud = TestCloud::new();
    cloud.seed_image(MachineImage {
        id: "ami-guest".to_string(),
        name: Some("old pv guest".to_string()),
        description: None,
        state: ImageState::Available,
        virtualization: Virtualization::Paravirtual,
        root_device_name: Some("/dev/sda1".to_string()),
        devices: vec![ImageDevice {
            device: "/dev/sda1".to_string(),
            snapshot_id: Some("snap-guest".to_string()),
            size_gib: Some(10),
            virtual_name: None,
            delete_on_termination: true,
        }],
    });
    cloud.seed_simple_image("ami-encryptor", 4);

    let session = Session::new("ami-encryptor");
    let svc = ScriptedStatus::new(vec![]);

    let err = encrypt(&cloud, &WallClock, &session, take_source(svc), &options())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)), "got {err:?}");
    assert_eq!(cloud.counters().run_instance, 0);
}

#[tokio::test(start_paused = true)]
async fn legacy_run_registers_from_the_appliance() {
    let cloud = TestCloud::new();
    // HVM guest under a paravirtual encryptor forces legacy mode.
    cloud.seed_simple_image("ami-guest", 10);
    cloud.seed_image(MachineImage {
        id: "ami-encryptor".to_string(),
        name: Some("pv encryptor".to_string()),
        description: None,
        state: ImageState::Available,
        virtualization: Virtualization::Paravirtual,
        root_device_name: Some("/dev/sda1".to_string()),
        devices: ["/dev/sda1", "/dev/sda2", "/dev/sda3"]
            .iter()
            .map(|device| ImageDevice {
                device: device.to_string(),
                snapshot_id: Some(format!("snap{device}")),
                size_gib: Some(2),
                virtual_name: None,
                delete_on_termination: true,
            })
            .collect(),
    });

    let session = Session::new("ami-encryptor");
    let svc = ScriptedStatus::new(vec![
        ok(EncryptionState::Encrypting, 50),
        ok(EncryptionState::Successful, 100),
    ]);

    let image_id = encrypt(&cloud, &WallClock, &session, take_source(svc), &options())
        .await
        .unwrap();

    assert!(cloud.images().iter().any(|i| i.id == image_id));
    assert!(cloud.live_instances().is_empty());
    assert!(cloud.live_volumes().is_empty());
    assert!(cloud.dangling_snapshots().is_empty());
}

#[tokio::test(start_paused = true)]
async fn two_runs_never_share_a_session_id() {
    let cloud = TestCloud::new();
    cloud.seed_simple_image("ami-guest", 10);
    cloud.seed_simple_image("ami-encryptor", 4);

    let first = Session::new("ami-encryptor");
    let svc = ScriptedStatus::repeating(EncryptorStatus {
        state: EncryptionState::Successful,
        percent_complete: 100,
        failure_code: None,
    });
    encrypt(&cloud, &WallClock, &first, take_source(svc), &options())
        .await
        .unwrap();

    let second = Session::new("ami-encryptor");
    let svc = ScriptedStatus::repeating(EncryptorStatus {
        state: EncryptionState::Successful,
        percent_complete: 100,
        failure_code: None,
    });
    encrypt(&cloud, &WallClock, &second, take_source(svc), &options())
        .await
        .unwrap();

    assert_ne!(first.id(), second.id());
    let session_ids = cloud.tag_values(TAG_SESSION_ID);
    assert!(session_ids.iter().any(|id| id == first.id()));
    assert!(session_ids.iter().any(|id| id == second.id()));
    assert!(session_ids
        .iter()
        .all(|id| id == first.id() || id == second.id()));
}
