mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{provider_north, Harness};
use rsd_core::fees::{Promotion, PromotionScope};
use rsd_core::{
    FeeSource, FinishReason, LifecycleError, Party, PaymentMethod, RequestStatus, ServiceRequest,
};
use rsd_dispatch::{
    AcceptOutcome, AutoFinishSweep, DispatchError, SettlementOutcome,
};
use rsd_storage::{LedgerStore, ProviderStore, RequestStore};
use uuid::Uuid;

async fn assigned(h: &Harness, provider_id: Uuid) -> ServiceRequest {
    let request = h.submit("battery_jump").await;
    match h.service.accept(request.id, provider_id).await.unwrap() {
        AcceptOutcome::Assigned { request } => request,
        AcceptOutcome::LostRace => panic!("fresh request should be assignable"),
    }
}

async fn in_service(h: &Harness, provider_id: Uuid, value: f64, method: PaymentMethod) -> ServiceRequest {
    let request = assigned(h, provider_id).await;
    h.service.propose(request.id, Party::Provider, value).await.unwrap();
    h.service.accept_value(request.id, Party::Client).await.unwrap();
    h.service.confirm_value(request.id).await.unwrap();
    h.service.record_payment(request.id, method).await.unwrap()
}

#[tokio::test]
async fn full_lifecycle_settles_direct_payment_onto_pending_balance() {
    let h = Harness::new();
    let provider = h.add_provider(provider_north(1.0)).await;

    let request = in_service(&h, provider.id, 150.0, PaymentMethod::Direct).await;
    assert_eq!(request.status, RequestStatus::InService);
    let busy = h.store.get_provider(provider.id).await.unwrap().unwrap();
    assert_eq!(busy.current_request_id, Some(request.id));

    let pending = h.service.provider_finish(request.id, provider.id).await.unwrap();
    assert_eq!(pending.status, RequestStatus::PendingClientConfirmation);
    assert!(pending.provider_finish_requested_at.is_some());

    let done = h.service.confirm_completion(request.id).await.unwrap();
    assert_eq!(done.request.status, RequestStatus::Finished);
    assert_eq!(done.request.finish_reason, Some(FinishReason::ClientConfirmed));
    assert_eq!(done.request.fulfilled_by, Some(provider.id));
    assert_eq!(done.request.provider_id, None);

    let Some(SettlementOutcome::Settled { record }) = done.settlement else {
        panic!("expected a fresh settlement");
    };
    assert_eq!(record.total_cents, 15_000);
    assert_eq!(record.application_fee_cents, 2_250);
    assert_eq!(record.provider_net_cents, 12_750);
    assert_eq!(record.source, FeeSource::Global);

    let released = h.store.get_provider(provider.id).await.unwrap().unwrap();
    assert_eq!(released.current_request_id, None);
    assert_eq!(released.pending_balance_cents, 2_250);

    let again = h.service.settle(request.id).await.unwrap();
    assert!(matches!(again, SettlementOutcome::AlreadySettled { .. }));
    let unchanged = h.store.get_provider(provider.id).await.unwrap().unwrap();
    assert_eq!(unchanged.pending_balance_cents, 2_250);
}

#[tokio::test]
async fn gateway_payment_leaves_balance_untouched() {
    let h = Harness::new();
    let provider = h.add_provider(provider_north(1.0)).await;
    let request = in_service(&h, provider.id, 80.0, PaymentMethod::Gateway).await;
    h.service.provider_finish(request.id, provider.id).await.unwrap();
    h.service.confirm_completion(request.id).await.unwrap();

    let record = h.store.fee_record(request.id).await.unwrap().unwrap();
    assert_eq!(record.payment_method, Some(PaymentMethod::Gateway));
    let stored = h.store.get_provider(provider.id).await.unwrap().unwrap();
    assert_eq!(stored.pending_balance_cents, 0);
}

#[tokio::test]
async fn active_promotion_beats_custom_rate_at_settlement() {
    let h = Harness::new();
    let mut provider = provider_north(1.0);
    provider.custom_fee_enabled = true;
    provider.custom_fee_percentage = Some(20.0);
    provider.custom_fee_fixed = Some(2.0);
    let provider = h.add_provider(provider).await;
    let promotion = Promotion {
        id: Uuid::new_v4(),
        scope: PromotionScope::Global,
        percentage: 5.0,
        starts_at: Utc::now() - Duration::hours(1),
        ends_at: Utc::now() + Duration::hours(1),
    };
    h.store.insert_promotion(&promotion).await.unwrap();

    let request = in_service(&h, provider.id, 100.0, PaymentMethod::Gateway).await;
    h.service.provider_finish(request.id, provider.id).await.unwrap();
    let done = h.service.confirm_completion(request.id).await.unwrap();

    let record = done.settlement.unwrap().record().clone();
    assert_eq!(record.source, FeeSource::Promotion);
    assert_eq!(record.promotion_id, Some(promotion.id));
    assert_eq!(record.application_fee_cents, 500);
    assert_eq!(record.fixed_fee_cents, 0);
}

#[tokio::test]
async fn invariant_violation_flags_request_for_review() {
    let h = Harness::new();
    let mut provider = provider_north(1.0);
    provider.custom_fee_enabled = true;
    provider.custom_fee_percentage = Some(10.0);
    provider.custom_fee_fixed = Some(200.0);
    let provider = h.add_provider(provider).await;

    let request = in_service(&h, provider.id, 150.0, PaymentMethod::Direct).await;
    h.service.provider_finish(request.id, provider.id).await.unwrap();
    let err = h.service.confirm_completion(request.id).await.unwrap_err();
    assert!(matches!(err, DispatchError::Invariant { .. }));

    let stored = h.service.get_request(request.id).await.unwrap();
    assert_eq!(stored.status, RequestStatus::Finished);
    assert!(h.store.fee_record(request.id).await.unwrap().is_none());
    assert_eq!(h.store.review_flags(request.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn stored_global_rate_overrides_configured_fallback() {
    let h = Harness::new();
    h.store.set_global_fee_percentage(10.0).await.unwrap();
    let provider = h.add_provider(provider_north(1.0)).await;
    let request = in_service(&h, provider.id, 150.0, PaymentMethod::Gateway).await;
    h.service.provider_finish(request.id, provider.id).await.unwrap();
    let done = h.service.confirm_completion(request.id).await.unwrap();
    assert_eq!(done.settlement.unwrap().record().application_fee_cents, 1_500);
}

#[tokio::test]
async fn auto_finish_waits_for_the_full_window() {
    let h = Harness::new();
    let provider = h.add_provider(provider_north(1.0)).await;
    let request = in_service(&h, provider.id, 150.0, PaymentMethod::Gateway).await;
    let pending = h.service.provider_finish(request.id, provider.id).await.unwrap();
    let finished_at = pending.provider_finish_requested_at.unwrap();

    let service = Arc::new(h.service);
    let sweep = AutoFinishSweep::new(service.clone());

    let early = sweep.run_once_at(finished_at + Duration::minutes(14)).await.unwrap();
    assert_eq!((early.scanned, early.finished), (0, 0));

    let due = sweep.run_once_at(finished_at + Duration::minutes(15)).await.unwrap();
    assert_eq!((due.scanned, due.finished, due.failed), (1, 1, 0));

    let stored = service.get_request(request.id).await.unwrap();
    assert_eq!(stored.status, RequestStatus::Finished);
    assert_eq!(stored.finish_reason, Some(FinishReason::ClientTimeout));
    assert!(h.store.fee_record(request.id).await.unwrap().is_some());

    let rerun = sweep.run_once_at(finished_at + Duration::minutes(30)).await.unwrap();
    assert_eq!(rerun.scanned, 0);
}

#[tokio::test]
async fn auto_finish_loses_to_a_concurrent_client_confirmation() {
    let h = Harness::new();
    let provider = h.add_provider(provider_north(1.0)).await;
    let request = in_service(&h, provider.id, 150.0, PaymentMethod::Gateway).await;
    let stale = h.service.provider_finish(request.id, provider.id).await.unwrap();

    h.service.confirm_completion(request.id).await.unwrap();
    let raced = h
        .service
        .auto_finish(&stale, Utc::now() + Duration::minutes(20))
        .await
        .unwrap();
    assert!(raced.is_none());

    let stored = h.service.get_request(request.id).await.unwrap();
    assert_eq!(stored.finish_reason, Some(FinishReason::ClientConfirmed));
}

#[tokio::test]
async fn rejected_completion_returns_to_service() {
    let h = Harness::new();
    let provider = h.add_provider(provider_north(1.0)).await;
    let request = in_service(&h, provider.id, 150.0, PaymentMethod::Gateway).await;
    h.service.provider_finish(request.id, provider.id).await.unwrap();

    let back = h.service.reject_completion(request.id).await.unwrap();
    assert_eq!(back.status, RequestStatus::InService);
    assert!(back.provider_finish_requested_at.is_none());
}

#[tokio::test]
async fn client_cannot_cancel_while_confirming_completion() {
    let h = Harness::new();
    let provider = h.add_provider(provider_north(1.0)).await;
    let request = in_service(&h, provider.id, 150.0, PaymentMethod::Gateway).await;
    h.service.provider_finish(request.id, provider.id).await.unwrap();

    let err = h.service.client_cancel(request.id, None).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Lifecycle(LifecycleError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn client_cancel_releases_the_assigned_provider() {
    let h = Harness::new();
    let provider = h.add_provider(provider_north(1.0)).await;
    let request = assigned(&h, provider.id).await;

    let canceled = h
        .service
        .client_cancel(request.id, Some("found help".into()))
        .await
        .unwrap();
    assert_eq!(canceled.status, RequestStatus::Canceled);
    assert_eq!(canceled.cancel_reason.as_deref(), Some("found help"));
    let stored = h.store.get_provider(provider.id).await.unwrap().unwrap();
    assert_eq!(stored.current_request_id, None);

    let err = h.service.client_cancel(request.id, None).await.unwrap_err();
    assert_eq!(err.reason(), "invalid_transition");
}

#[tokio::test]
async fn provider_cancel_after_price_agreed_restarts_search_without_them() {
    let h = Harness::new();
    let quitter = h.add_provider(provider_north(1.0)).await;
    let request = assigned(&h, quitter.id).await;
    h.service.propose(request.id, Party::Client, 90.0).await.unwrap();
    h.service.accept_value(request.id, Party::Provider).await.unwrap();
    let awaiting = h.service.confirm_value(request.id).await.unwrap();
    assert_eq!(awaiting.status, RequestStatus::AwaitingPayment);

    let released = h
        .service
        .provider_cancel(request.id, quitter.id, Some("vehicle broke down".into()))
        .await
        .unwrap();
    assert_eq!(released.status, RequestStatus::Searching);
    assert_eq!(released.provider_id, None);
    assert_eq!(released.agreed_value, None);
    assert!(released.declined_provider_ids.contains(&quitter.id));

    let snapshot = h.service.dispatcher().snapshot(request.id).unwrap();
    assert!(snapshot.candidates.iter().all(|c| c.provider_id != quitter.id));
    assert!(h
        .service
        .dispatcher()
        .declines()
        .excluded_ids(request.id)
        .contains(&quitter.id));

    let stored = h.store.get_provider(quitter.id).await.unwrap().unwrap();
    assert_eq!(stored.current_request_id, None);
}

#[tokio::test]
async fn provider_cannot_cancel_once_in_service() {
    let h = Harness::new();
    let provider = h.add_provider(provider_north(1.0)).await;
    let request = in_service(&h, provider.id, 150.0, PaymentMethod::Gateway).await;
    let err = h
        .service
        .provider_cancel(request.id, provider.id, None)
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "provider_cancel_not_allowed");
}

#[tokio::test]
async fn negotiation_rules_are_enforced() {
    let h = Harness::new();
    let provider = h.add_provider(provider_north(1.0)).await;
    let request = assigned(&h, provider.id).await;

    let err = h.service.confirm_value(request.id).await.unwrap_err();
    assert_eq!(err.reason(), "value_not_agreed");

    let err = h.service.propose(request.id, Party::Client, 0.0).await.unwrap_err();
    assert_eq!(err.reason(), "non_positive_value");

    h.service.propose(request.id, Party::Client, 120.0).await.unwrap();
    let err = h.service.accept_value(request.id, Party::Client).await.unwrap_err();
    assert_eq!(err.reason(), "own_proposal");

    h.service.propose(request.id, Party::Provider, 140.0).await.unwrap();
    let agreed = h.service.accept_value(request.id, Party::Client).await.unwrap();
    assert_eq!(agreed.agreed_value, Some(140.0));
    h.service.confirm_value(request.id).await.unwrap();

    let reopened = h.service.reopen_negotiation(request.id).await.unwrap();
    assert_eq!(reopened.status, RequestStatus::Negotiating);
    assert!(!reopened.value_accepted);
}

#[tokio::test]
async fn busy_or_unknown_providers_cannot_accept() {
    let h = Harness::new();
    let provider = h.add_provider(provider_north(1.0)).await;
    assigned(&h, provider.id).await;

    let second = h.submit("battery_jump").await;
    let err = h.service.accept(second.id, provider.id).await.unwrap_err();
    assert_eq!(err.reason(), "provider_unavailable");

    let err = h.service.accept(second.id, Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.reason(), "provider_not_found");
}

#[tokio::test]
async fn invalid_submissions_never_reach_the_store() {
    let h = Harness::new();
    let err = h
        .service
        .submit(rsd_core::NewServiceRequest {
            client_id: Uuid::new_v4(),
            service_type: "tow".into(),
            origin: rsd_core::Location::new(-23.55, -46.63, "Praça da Sé"),
            destination: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "missing_destination");
    assert_eq!(h.service.dispatcher().active_count(), 0);
}


#[tokio::test]
async fn provider_cannot_win_two_requests_at_once() {
    let h = Harness::new();
    let provider = h.add_provider(provider_north(1.0)).await;
    let first = h.submit("battery_jump").await;
    let second = h.submit("battery_jump").await;

    let (a, b) = tokio::join!(
        h.service.accept(first.id, provider.id),
        h.service.accept(second.id, provider.id)
    );
    let outcomes = [a, b];
    let won: Vec<_> = outcomes
        .iter()
        .filter_map(|r| match r {
            Ok(AcceptOutcome::Assigned { request }) => Some(request.id),
            _ => None,
        })
        .collect();
    assert_eq!(won.len(), 1);
    let refused: Vec<_> = outcomes
        .iter()
        .filter_map(|r| r.as_ref().err().map(|e| e.reason()))
        .collect();
    assert_eq!(refused, vec!["provider_unavailable"]);

    let stored = h.store.get_provider(provider.id).await.unwrap().unwrap();
    assert_eq!(stored.current_request_id, Some(won[0]));
    let loser = if won[0] == first.id { second.id } else { first.id };
    let untouched = h.store.get_request(loser).await.unwrap().unwrap();
    assert_eq!(untouched.status, RequestStatus::Searching);
}
