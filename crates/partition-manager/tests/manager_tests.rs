//! Integration tests for the partition manager against the mock driver

use std::sync::Arc;
use std::time::Duration;

use partition_manager::driver::MockDriver;
use partition_manager::layout::DeviceLayout;
use partition_manager::layout::PartitionLayout;
use partition_manager::LayoutSnapshot;
use partition_manager::ManagerConfig;
use partition_manager::ManagerError;
use partition_manager::PartitionManager;
use partition_manager::PartitionMode;
use similar_asserts::assert_eq;
use test_log::test;

fn config() -> ManagerConfig {
    ManagerConfig {
        start_monitoring: false,
        ..Default::default()
    }
}

async fn manager_with(driver: &Arc<MockDriver>) -> Arc<PartitionManager> {
    PartitionManager::init(driver.clone(), config())
        .await
        .expect("manager should initialize")
}

fn enabled_driver(devices: u32) -> Arc<MockDriver> {
    let driver = Arc::new(MockDriver::new(devices));
    for device in 0..devices {
        driver.set_mode(device, PartitionMode::Enabled);
    }
    driver
}

#[test(tokio::test)]
async fn queued_mutations_complete_in_order_without_overlap() {
    let driver = enabled_driver(1);
    driver.set_mutation_delay(Duration::from_millis(10));
    let manager = manager_with(&driver).await;

    let mut tickets = Vec::new();
    for profile in [19, 14, 19] {
        tickets.push(
            manager
                .submit_create_instance(0, profile)
                .await
                .expect("enqueue"),
        );
    }

    let mut created = Vec::new();
    for ticket in tickets {
        created.push(ticket.wait().await.expect("create").created_id);
    }

    assert_eq!(created, vec![Some(1), Some(2), Some(3)]);
    assert_eq!(
        driver.mutation_log(),
        vec![
            "create_instance(0, 19)".to_string(),
            "create_instance(0, 14)".to_string(),
            "create_instance(0, 19)".to_string(),
        ]
    );
    assert_eq!(driver.max_concurrent_mutations(), 1);
    manager.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn inline_and_queued_mutations_never_overlap() {
    let driver = enabled_driver(2);
    driver.set_mutation_delay(Duration::from_millis(20));
    let manager = manager_with(&driver).await;

    let queued = manager
        .submit_create_instance(1, 19)
        .await
        .expect("enqueue");
    let inline = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.create_instance(0, 19).await })
    };

    queued.wait().await.expect("queued create");
    inline
        .await
        .expect("inline task joins")
        .expect("inline create");

    assert_eq!(driver.max_concurrent_mutations(), 1);
    assert_eq!(manager.all_partitions().await.len(), 2);
    manager.shutdown().await;
}

#[test(tokio::test)]
async fn enabling_mode_rebuilds_from_driver_enumeration() {
    let driver = Arc::new(MockDriver::new(1));
    let (_, identity) = driver.insert_instance(0, 9).expect("insert");
    let manager = manager_with(&driver).await;
    assert!(manager.find_partition(&identity).await.is_none());

    manager
        .set_partition_mode(0, PartitionMode::Enabled)
        .await
        .expect("enable");
    let partitions = manager.partitions(0).await.expect("partitions");
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].identity, identity);

    manager
        .set_partition_mode(0, PartitionMode::Disabled)
        .await
        .expect("disable");
    assert!(manager.partitions(0).await.expect("partitions").is_empty());
    manager.shutdown().await;
}

#[test(tokio::test)]
async fn destroyed_partition_has_no_metrics() {
    let driver = enabled_driver(1);
    let (instance_id, identity) = driver.insert_instance(0, 19).expect("insert");
    let manager = manager_with(&driver).await;

    let mut updates = manager.subscribe().await;
    manager
        .start_monitoring(Duration::from_secs(3600))
        .await
        .expect("start");
    updates.recv().await.expect("first cycle");
    assert!(manager.metrics(&identity).await.expect("metrics").is_some());

    manager
        .destroy_instance(0, instance_id)
        .await
        .expect("destroy");
    assert!(manager.metrics(&identity).await.expect("metrics").is_none());
    assert!(!manager
        .all_metrics()
        .await
        .expect("all metrics")
        .contains_key(&identity));
    manager.shutdown().await;
}

#[test(tokio::test)]
async fn starting_monitoring_twice_runs_one_loop() {
    let driver = Arc::new(MockDriver::new(1));
    let manager = manager_with(&driver).await;

    manager
        .start_monitoring(Duration::from_millis(10))
        .await
        .expect("start");
    manager
        .start_monitoring(Duration::from_millis(50))
        .await
        .expect("restart");
    assert!(manager.is_monitoring().await);

    // Each cycle reads the mode of the single device once. One loop at 50ms
    // gives about 10 cycles in 500ms; a leftover 10ms loop would add ~50.
    driver.clear_calls();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let cycles = driver
        .calls()
        .iter()
        .filter(|call| call.as_str() == "partition mode(0)")
        .count();
    assert!((5..=20).contains(&cycles), "saw {cycles} cycles");

    assert!(manager.stop_monitoring().await);
    assert!(!manager.is_monitoring().await);
    assert!(!manager.stop_monitoring().await);

    let err = manager
        .start_monitoring(Duration::ZERO)
        .await
        .expect_err("zero interval");
    assert!(matches!(err, ManagerError::InvalidInterval(_)));
    manager.shutdown().await;
}

#[test(tokio::test)]
async fn layout_round_trip_has_no_work() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("layout.json");

    let driver = enabled_driver(2);
    let (instance_id, _) = driver.insert_instance(0, 9).expect("insert");
    driver.insert_sub_partition(0, instance_id, 0).expect("sub");
    driver.insert_sub_partition(0, instance_id, 1).expect("sub");
    driver.insert_instance(0, 19).expect("insert");
    driver.insert_instance(1, 0).expect("insert");
    let manager = manager_with(&driver).await;

    manager.save_layout(&path).await.expect("save");
    let snapshot = LayoutSnapshot::load(&path).await.expect("load");
    let current = manager.all_partitions().await;
    for device in 0..2 {
        assert!(snapshot.diff(device, &current).is_empty());
    }

    driver.clear_calls();
    let tickets = manager.apply_layout(&path).await.expect("apply");
    assert!(tickets.is_empty());
    assert!(driver.mutation_log().is_empty());
    manager.shutdown().await;
}

#[test(tokio::test)]
async fn out_of_range_device_fails_without_driver_calls() {
    let driver = enabled_driver(2);
    let manager = manager_with(&driver).await;
    driver.clear_calls();

    let err = manager
        .set_partition_mode(5, PartitionMode::Enabled)
        .await
        .expect_err("device 5 does not exist");
    assert_eq!(err.to_string(), "invalid device index 5 (2 devices present)");

    assert!(manager.create_instance(5, 19).await.is_err());
    assert!(manager.submit_destroy_instance(2, 1).await.is_err());
    assert!(manager.create_sub_partition(7, 1, 0).await.is_err());
    assert!(manager.partition_mode(5).await.is_err());
    assert!(manager.available_profiles(5).await.is_err());
    assert!(manager.partitions(5).await.is_err());

    assert_eq!(driver.calls(), Vec::<String>::new());
    manager.shutdown().await;
}

#[test(tokio::test)]
async fn all_metrics_before_first_refresh_samples_synchronously() {
    let driver = enabled_driver(1);
    let (instance_id, identity) = driver.insert_instance(0, 14).expect("insert");
    driver.add_process(0, instance_id, 4242, Some("trainer"), 2048 * 1024 * 1024);
    let manager = manager_with(&driver).await;

    let metrics = manager.all_metrics().await.expect("all metrics");
    assert_eq!(metrics.len(), 1);
    let sample = &metrics[&identity];
    assert_eq!(sample.process_memory.get("trainer"), Some(&2048));
    assert_eq!(sample.temperature, 40);
    manager.shutdown().await;
}

#[test(tokio::test)]
async fn failed_mutation_reports_driver_error() {
    let driver = enabled_driver(1);
    let manager = manager_with(&driver).await;
    driver.fail_mutations(Some("Insufficient Permissions"));

    let ticket = manager
        .submit_set_partition_mode(0, PartitionMode::Disabled)
        .await
        .expect("enqueue");
    let err = ticket.wait().await.expect_err("driver refuses");
    assert_eq!(
        err.to_string(),
        "set partition mode failed: Insufficient Permissions"
    );
    manager.shutdown().await;
}

#[test(tokio::test)]
async fn submissions_after_shutdown_are_refused() {
    let driver = enabled_driver(1);
    let manager = manager_with(&driver).await;
    manager.shutdown().await;

    let err = manager
        .submit_set_partition_mode(0, PartitionMode::Enabled)
        .await
        .expect_err("worker stopped");
    assert!(matches!(err, ManagerError::WorkerStopped));
}

#[test(tokio::test)]
async fn all_metrics_includes_partitions_created_since_last_refresh() {
    let driver = enabled_driver(1);
    let (instance_id, old_identity) = driver.insert_instance(0, 19).expect("insert");
    let manager = manager_with(&driver).await;

    let mut updates = manager.subscribe().await;
    manager
        .start_monitoring(Duration::from_secs(3600))
        .await
        .expect("start");
    updates.recv().await.expect("first cycle");

    manager
        .destroy_instance(0, instance_id)
        .await
        .expect("destroy");
    manager.create_instance(0, 19).await.expect("create");
    let partitions = manager.all_partitions().await;
    assert_eq!(partitions.len(), 1);
    let identity = &partitions[0].identity;

    let metrics = manager.all_metrics().await.expect("all metrics");
    assert_eq!(metrics.len(), 1);
    assert!(metrics.contains_key(identity));
    assert!(!metrics.contains_key(&old_identity));
    assert!(manager.metrics(identity).await.expect("metrics").is_some());
    manager.shutdown().await;
}

#[test(tokio::test)]
async fn layout_larger_than_queue_is_applied_in_full() {
    let driver = enabled_driver(2);
    for device in 0..2 {
        for _ in 0..7 {
            driver.insert_instance(device, 19).expect("insert");
        }
    }
    let manager = PartitionManager::init(
        driver.clone(),
        ManagerConfig {
            queue_capacity: 4,
            ..config()
        },
    )
    .await
    .expect("manager should initialize");

    let snapshot = LayoutSnapshot {
        devices: (0..2)
            .map(|index| DeviceLayout {
                index,
                partitions: vec![PartitionLayout::new(0, Vec::new())],
            })
            .collect(),
    };
    let tickets = manager
        .apply_layout_snapshot(&snapshot)
        .await
        .expect("apply");
    assert_eq!(tickets.len(), 16);
    for ticket in tickets {
        ticket.wait().await.expect("layout step");
    }

    let profiles: Vec<_> = manager
        .all_partitions()
        .await
        .iter()
        .map(|p| (p.device_index, p.profile_id))
        .collect();
    assert_eq!(profiles, vec![(0, 0), (1, 0)]);
    assert_eq!(driver.mutation_log().len(), 16);
    manager.shutdown().await;
}
