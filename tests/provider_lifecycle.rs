mod common;

use common::{offline_params, params, Harness, HarnessBuilder};
use provd::deal_log::DealLogEvent;
use provd::domain::{Checkpoint, RetryPolicy};
use provd::error::ProvdError;
use provd::provider::{CapacityManager, FundsManager};
use rust_decimal::Decimal;
use std::time::Duration;

#[tokio::test]
async fn test_online_deal_runs_to_complete_and_releases_resources() {
    let h = Harness::started().await;
    let p = params(1024);
    let deal_uuid = p.deal_uuid;

    let info = h.provider.execute_deal(p, "peer-1").await.unwrap();
    assert!(info.accepted, "rejected: {}", info.reason);

    let deal = h.wait_for_finished(deal_uuid).await;
    assert!(deal.err.is_none());
    assert!(deal.cleanup_done);
    assert!(deal.publish_cid.is_some());
    assert!(deal.chain_deal_id.is_some());
    assert!(deal.placement.is_some());
    assert_eq!(h.publisher.publishes(deal_uuid), 1);

    // Reservations released exactly once
    assert_eq!(h.capacity.space().await.unwrap().tagged, 0);
    assert_eq!(h.funds.available().await.unwrap(), Decimal::from(100));
    assert_eq!(
        h.count_events(deal_uuid, |e| matches!(e, DealLogEvent::StorageUntagged)),
        1
    );
    assert_eq!(
        h.count_events(deal_uuid, |e| matches!(e, DealLogEvent::FundsUntagged { .. })),
        1
    );

    // Staged payload removed, handler gone
    assert!(!deal.inbound_file_path.unwrap().exists());
    assert!(matches!(
        h.provider.subscribe_deal_updates(deal_uuid).await,
        Err(ProvdError::HandlerNotFound(_))
    ));

    let by_proposal = h
        .provider
        .deal_by_proposal(&deal.signed_proposal_id)
        .await
        .unwrap();
    assert_eq!(by_proposal.deal_uuid, deal_uuid);

    h.provider.stop().await;
}

#[tokio::test]
async fn test_capacity_exhaustion_rejects_and_rolls_back_funds() {
    let h = HarnessBuilder::new().storage(16).gated_transport().build();
    h.provider.start().await.unwrap();

    let first = params(16);
    let first_uuid = first.deal_uuid;
    assert!(h.provider.execute_deal(first, "peer-1").await.unwrap().accepted);

    let second = params(1);
    let second_uuid = second.deal_uuid;
    let info = h.provider.execute_deal(second, "peer-2").await.unwrap();
    assert!(!info.accepted);
    assert!(info.reason.starts_with("cannot accept deal"), "{}", info.reason);

    // Nothing persisted or left tagged for the rejected deal
    assert!(h.provider.deal(second_uuid).await.unwrap_err().is_not_found());
    assert_eq!(
        h.funds.available().await.unwrap(),
        Decimal::from(100) - Decimal::ONE
    );
    let space = h.provider.storage_space().await.unwrap();
    assert_eq!((space.total, space.tagged, space.free), (16, 16, 0));

    h.transport.open();
    h.wait_for_finished(first_uuid).await;
    let space = h.provider.storage_space().await.unwrap();
    assert_eq!(space.free, 16);

    h.provider.stop().await;
}

#[tokio::test]
async fn test_insufficient_funds_rejects() {
    let h = HarnessBuilder::new().funds(Decimal::ZERO).build();
    h.provider.start().await.unwrap();

    let info = h.provider.execute_deal(params(1024), "peer-1").await.unwrap();
    assert!(!info.accepted);
    assert!(info.reason.contains("insufficient funds"), "{}", info.reason);
    assert_eq!(h.capacity.space().await.unwrap().tagged, 0);

    h.provider.stop().await;
}

#[tokio::test]
async fn test_validation_failure_is_a_rejection() {
    let h = Harness::started().await;

    let mut p = params(1024);
    p.client_deal_proposal.proposal.provider = "f09999".into();
    let deal_uuid = p.deal_uuid;
    let info = h.provider.execute_deal(p, "peer-1").await.unwrap();
    assert!(!info.accepted);
    assert!(info.reason.starts_with("failed validation:"), "{}", info.reason);
    assert!(h
        .logger
        .contains(deal_uuid, |e| matches!(e, DealLogEvent::ValidationFailed { .. })));

    let mut p = params(1000);
    p.transfer.size = 10;
    let info = h.provider.execute_deal(p, "peer-1").await.unwrap();
    assert!(!info.accepted);

    h.provider.stop().await;
}

#[tokio::test]
async fn test_duplicate_deal_uuid_is_an_error() {
    let h = HarnessBuilder::new().gated_transport().build();
    h.provider.start().await.unwrap();

    let p = params(1024);
    assert!(h.provider.execute_deal(p.clone(), "peer-1").await.unwrap().accepted);
    let err = h.provider.execute_deal(p, "peer-1").await.unwrap_err();
    assert!(matches!(err, ProvdError::DealAlreadyExists(_)));

    h.provider.stop().await;
}

#[tokio::test]
async fn test_offline_deal_waits_for_import() {
    let h = Harness::started().await;
    let p = offline_params(1024);
    let deal_uuid = p.deal_uuid;

    assert!(h.provider.execute_deal(p, "peer-1").await.unwrap().accepted);
    // Offline deals reserve no storage until their data arrives
    assert_eq!(h.capacity.space().await.unwrap().tagged, 0);
    assert!(matches!(
        h.provider.cancel_transfer(deal_uuid).await,
        Err(ProvdError::Validation(msg)) if msg.contains("offline")
    ));

    let payload = h.staging.path().join("import.car");
    std::fs::write(&payload, vec![1u8; 512]).unwrap();
    let info = h
        .provider
        .import_offline_deal_data(deal_uuid, payload.clone())
        .await
        .unwrap();
    assert!(info.accepted);

    let deal = h.wait_for_finished(deal_uuid).await;
    assert!(deal.err.is_none());
    assert_eq!(h.transport.started(), 0);
    // The operator's file is left in place
    assert!(payload.exists());

    // A second import is refused
    let err = h
        .provider
        .import_offline_deal_data(deal_uuid, payload)
        .await
        .unwrap_err();
    assert!(matches!(err, ProvdError::Validation(_)));

    h.provider.stop().await;
}

#[tokio::test]
async fn test_import_unknown_deal_is_not_found() {
    let h = Harness::started().await;
    let err = h
        .provider
        .import_offline_deal_data(uuid::Uuid::new_v4(), "/tmp/none.car".into())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    h.provider.stop().await;
}

#[tokio::test]
async fn test_cancel_transfer_fails_deal() {
    let h = HarnessBuilder::new().gated_transport().build();
    h.provider.start().await.unwrap();

    let p = params(1024);
    let deal_uuid = p.deal_uuid;
    let mut updates = {
        let mut new_deals = h.provider.subscribe_new_deals();
        assert!(h.provider.execute_deal(p, "peer-1").await.unwrap().accepted);
        assert_eq!(new_deals.recv().await.unwrap().deal_uuid, deal_uuid);
        h.provider.subscribe_deal_updates(deal_uuid).await.unwrap()
    };

    h.wait_for_event(deal_uuid, |e| matches!(e, DealLogEvent::TransferStarted))
        .await;
    h.provider.cancel_transfer(deal_uuid).await.unwrap();

    let deal = h.wait_for_finished(deal_uuid).await;
    assert_eq!(deal.retry, RetryPolicy::Fatal);
    assert!(deal.err.unwrap().contains("cancelled"));
    assert!(h
        .logger
        .contains(deal_uuid, |e| matches!(e, DealLogEvent::TransferCancelled)));
    assert_eq!(h.capacity.space().await.unwrap().tagged, 0);

    let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.checkpoint, Checkpoint::Complete);

    // Nothing left to cancel
    assert!(h.provider.cancel_transfer(deal_uuid).await.is_err());
    h.provider.stop().await;
}

#[tokio::test]
async fn test_transfer_over_max_duration_fails_deal() {
    let h = HarnessBuilder::new()
        .gated_transport()
        .max_transfer_duration(Duration::from_millis(50))
        .build();
    h.provider.start().await.unwrap();

    let p = params(1024);
    let deal_uuid = p.deal_uuid;
    assert!(h.provider.execute_deal(p, "peer-1").await.unwrap().accepted);

    let deal = h.wait_for_finished(deal_uuid).await;
    assert_eq!(deal.checkpoint, Checkpoint::Complete);
    assert_eq!(deal.retry, RetryPolicy::Fatal);
    assert!(deal.err.unwrap().contains("maximum duration"));
    assert_eq!(h.transport.started(), 1);
    assert_eq!(h.publisher.publishes(deal_uuid), 0);

    // Not retried: reservations released for good
    assert_eq!(h.capacity.space().await.unwrap().tagged, 0);
    assert_eq!(h.funds.available().await.unwrap(), Decimal::from(100));
    assert!(h
        .provider
        .retry_paused_deal(deal_uuid)
        .await
        .unwrap_err()
        .is_not_found());

    h.provider.stop().await;
}

#[tokio::test]
async fn test_store_failure_on_accept_rolls_back() {
    let h = Harness::started().await;
    h.faults.set_fail_create(true);

    let p = params(1024);
    let deal_uuid = p.deal_uuid;
    assert!(h.provider.execute_deal(p.clone(), "peer-1").await.is_err());

    assert_eq!(h.capacity.space().await.unwrap().tagged, 0);
    assert_eq!(h.funds.available().await.unwrap(), Decimal::from(100));
    assert!(matches!(
        h.provider.subscribe_deal_updates(deal_uuid).await,
        Err(ProvdError::HandlerNotFound(_))
    ));

    // The same proposal goes through once the store recovers
    h.faults.set_fail_create(false);
    assert!(h.provider.execute_deal(p, "peer-1").await.unwrap().accepted);
    h.wait_for_finished(deal_uuid).await;

    h.provider.stop().await;
}

#[tokio::test]
async fn test_commit_saturation_pauses_with_reservations_held() {
    let h = Harness::started().await;
    h.committer.set_saturated(true);

    let p = params(1024);
    let deal_uuid = p.deal_uuid;
    assert!(h.provider.execute_deal(p, "peer-1").await.unwrap().accepted);

    let paused = h
        .wait_for_deal(deal_uuid, |d| d.retry == RetryPolicy::Manual)
        .await;
    assert_eq!(paused.checkpoint, Checkpoint::PublishConfirmed);
    assert!(paused.err.is_some());
    assert!(h.committer.attempts() >= 2);
    assert_eq!(h.capacity.space().await.unwrap().tagged, 1024);

    h.committer.set_saturated(false);
    h.provider.retry_paused_deal(deal_uuid).await.unwrap();

    let deal = h.wait_for_finished(deal_uuid).await;
    assert!(deal.err.is_none());
    assert_eq!(h.publisher.publishes(deal_uuid), 1);
    assert_eq!(h.capacity.space().await.unwrap().tagged, 0);

    h.provider.stop().await;
}

#[tokio::test]
async fn test_operator_fail_terminates_paused_deal() {
    let h = Harness::started().await;
    h.committer.set_saturated(true);

    let p = params(1024);
    let deal_uuid = p.deal_uuid;
    assert!(h.provider.execute_deal(p, "peer-1").await.unwrap().accepted);
    h.wait_for_deal(deal_uuid, |d| d.retry == RetryPolicy::Manual)
        .await;

    h.provider.fail_paused_deal(deal_uuid).await.unwrap();
    let deal = h.wait_for_finished(deal_uuid).await;
    assert_eq!(deal.err.as_deref(), Some("user manually terminated the deal"));
    assert_eq!(h.capacity.space().await.unwrap().tagged, 0);
    assert_eq!(h.funds.available().await.unwrap(), Decimal::from(100));

    h.provider.stop().await;
}

#[tokio::test]
async fn test_retry_on_running_deal_is_refused() {
    let h = HarnessBuilder::new().gated_transport().build();
    h.provider.start().await.unwrap();

    let p = params(1024);
    let deal_uuid = p.deal_uuid;
    assert!(h.provider.execute_deal(p, "peer-1").await.unwrap().accepted);
    h.wait_for_event(deal_uuid, |e| matches!(e, DealLogEvent::TransferStarted))
        .await;

    let err = h.provider.retry_paused_deal(deal_uuid).await.unwrap_err();
    assert!(matches!(err, ProvdError::NotPaused(_)));
    let err = h
        .provider
        .retry_paused_deal(uuid::Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    h.provider.stop().await;
}

#[tokio::test]
async fn test_stop_joins_and_cancels_pending_requests() {
    let h = HarnessBuilder::new().gated_transport().build();
    h.provider.start().await.unwrap();

    let p = params(1024);
    let deal_uuid = p.deal_uuid;
    assert!(h.provider.execute_deal(p, "peer-1").await.unwrap().accepted);
    h.wait_for_event(deal_uuid, |e| matches!(e, DealLogEvent::TransferStarted))
        .await;

    tokio::time::timeout(Duration::from_secs(5), h.provider.stop())
        .await
        .expect("stop should join promptly");
    assert!(h.provider.is_stopped());
    // Second stop is a no-op
    h.provider.stop().await;

    let err = h.provider.execute_deal(params(1024), "peer-2").await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(h.provider.storage_space().await.unwrap_err().is_cancelled());

    // The interrupted deal keeps its persisted state for recovery
    let deal = h.provider.deal(deal_uuid).await.unwrap();
    assert_eq!(deal.checkpoint, Checkpoint::Accepted);
    assert!(deal.err.is_none());
}
