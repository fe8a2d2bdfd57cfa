
use flx_core_sync::*;

use std::{
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use futures::{poll, StreamExt};
use mock_instance::{eventually, next_reset, Instance, Recorder, WAIT};
use parking_lot::Mutex;
use tokio::time::timeout;
use tracing_test::traced_test;

fn add_dogs(set: &SubscriptionSet) -> u64 {
	set.update(|txn| {
		txn.add(&Query::new("Dog", "age > 3")?, SubscriptionOptions::named("dogs"))?;
		Ok::<_, Error>(())
	})
	.unwrap();

	set.version().unwrap()
}

fn counter() -> (Arc<AtomicUsize>, impl Fn(&SyncSession, &SessionError) + Send + Sync + 'static) {
	let calls = Arc::new(AtomicUsize::new(0));
	let handler = {
		let calls = Arc::clone(&calls);
		move |_: &SyncSession, _: &SessionError| {
			calls.fetch_add(1, Ordering::SeqCst);
		}
	};
	(calls, handler)
}

#[tokio::test]
#[traced_test]
async fn start_and_stop_are_idempotent() {
	let instance = Instance::new().await;
	let session = instance.session();
	let log = instance.log();

	assert_eq!(session.state().unwrap(), SessionState::Active);
	assert_eq!(log.resumes.load(Ordering::SeqCst), 1);

	session.stop().unwrap();
	session.stop().unwrap();
	assert_eq!(session.state().unwrap(), SessionState::Inactive);
	assert_eq!(log.pauses.load(Ordering::SeqCst), 1);

	session.start().unwrap();
	session.start().unwrap();
	assert_eq!(session.state().unwrap(), SessionState::Active);
	assert_eq!(log.resumes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
#[traced_test]
async fn committed_sets_reach_the_transport() {
	let instance = Instance::new().await;
	let set = instance.replica.subscriptions().unwrap();
	let log = instance.log();

	let version = add_dogs(&set);
	eventually(|| log.sent_versions().contains(&version)).await;

	let payload = log
		.payloads
		.lock()
		.iter()
		.find(|payload| payload.version == version)
		.cloned()
		.unwrap();
	assert_eq!(payload.subscriptions.len(), 1);
	assert_eq!(payload.fingerprint, set.fingerprint().unwrap());

	// Restarting resends the latest version
	let sent = log.payloads.lock().len();
	instance.session().stop().unwrap();
	instance.session().start().unwrap();
	assert_eq!(log.payloads.lock().len(), sent + 1);
	assert_eq!(log.sent_versions().last(), Some(&version));
}

#[tokio::test]
#[traced_test]
async fn acknowledgement_completes_the_set() {
	let instance = Instance::new().await;
	let set = instance.replica.subscriptions().unwrap();
	let version = add_dogs(&set);

	instance
		.sink()
		.on_subscription_version_ack(version, AckOutcome::Complete)
		.unwrap();

	timeout(WAIT, set.wait_for_synchronization())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(set.state().unwrap(), SubscriptionSetState::Complete);
}

#[tokio::test]
#[traced_test]
async fn rejection_reaches_every_waiter() {
	let instance = Instance::new().await;
	let set = instance.replica.subscriptions().unwrap();
	let version = add_dogs(&set);
	let other_handle = instance.replica.open_another().unwrap();
	let other = other_handle.subscriptions().unwrap();

	instance
		.sink()
		.on_subscription_version_ack(version, AckOutcome::Error("unsupported query".to_string()))
		.unwrap();

	let res = timeout(WAIT, set.wait_for_synchronization()).await.unwrap();
	assert!(matches!(
		res,
		Err(flx_sync::Error::Subscription(SubscriptionError { message, .. })) if message == "unsupported query"
	));
	assert_eq!(set.state().unwrap(), SubscriptionSetState::Error);
	assert_eq!(
		set.error().unwrap().map(|e| e.message),
		Some("unsupported query".to_string())
	);
	assert_eq!(other.version().unwrap(), version);
	assert_eq!(other.state().unwrap(), SubscriptionSetState::Error);
}

#[tokio::test]
#[traced_test]
async fn newer_version_supersedes_other_handles() {
	let instance = Instance::new().await;
	let first = instance.replica.subscriptions().unwrap();
	let first_version = add_dogs(&first);

	let second_handle = instance.replica.open_another().unwrap();
	let second = second_handle.subscriptions().unwrap();
	let second_version = second
		.update(|txn| {
			txn.add(&Query::all("Cat")?, SubscriptionOptions::default())?;
			Ok::<_, Error>(())
		})
		.map(|()| second.version().unwrap())
		.unwrap();
	assert!(second_version > first_version);

	instance
		.sink()
		.on_subscription_version_ack(second_version, AckOutcome::Complete)
		.unwrap();

	timeout(WAIT, first.wait_for_synchronization())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(first.state().unwrap(), SubscriptionSetState::Superseded);
	assert_eq!(second.state().unwrap(), SubscriptionSetState::Complete);
}

#[tokio::test]
#[traced_test]
async fn discard_local_runs_callbacks_in_order() {
	let calls = Arc::new(Mutex::new(Vec::new()));
	let (fallbacks, fallback) = counter();

	let strategy = ClientResetStrategy::discard_local(fallback)
		.with_before_reset({
			let calls = Arc::clone(&calls);
			move |before| {
				assert!(before.is_frozen());
				calls.lock().push(("before", before.data_version()));
				Ok(())
			}
		})
		.with_after_reset({
			let calls = Arc::clone(&calls);
			move |before, after| {
				assert!(!after.is_frozen());
				assert!(after.data_version() > before.data_version());
				calls.lock().push(("after", after.data_version()));
				Ok(())
			}
		});

	let instance = Instance::builder().client_reset(strategy).build().await;
	let session = instance.session();
	let mut events = session.events().unwrap();

	instance
		.sink()
		.on_session_error(ErrorCode::ClientReset, "history diverged", true)
		.unwrap();

	let outcome = next_reset(&mut events).await;
	assert!(outcome.recovered());
	assert_eq!(outcome.strategy, StrategyKind::DiscardLocal);
	assert!(outcome.context.before.is_some());
	assert!(outcome.context.after.is_some());

	assert_eq!(*calls.lock(), vec![("before", 0), ("after", 1)]);
	assert_eq!(fallbacks.load(Ordering::SeqCst), 0);
	assert_eq!(instance.engine.discards.load(Ordering::SeqCst), 1);
	assert_eq!(session.state().unwrap(), SessionState::Active);
	assert_eq!(session.reset_phase().unwrap(), ResetPhase::Monitoring);
	assert_eq!(session.error().unwrap(), None);
}

#[tokio::test]
#[traced_test]
async fn start_during_reset_waits_for_after_reset() {
	let session_slot = Arc::new(Mutex::new(None::<SyncSession>));
	let seen_in_after_reset = Arc::new(Mutex::new(None));
	let (fallbacks, fallback) = counter();

	let strategy = ClientResetStrategy::discard_local(fallback)
		.with_before_reset({
			let session_slot = Arc::clone(&session_slot);
			move |_| {
				let session = session_slot.lock().clone().expect("session is set");
				session.start()?;
				assert_eq!(session.state()?, SessionState::Inactive);
				Ok(())
			}
		})
		.with_after_reset({
			let session_slot = Arc::clone(&session_slot);
			let seen_in_after_reset = Arc::clone(&seen_in_after_reset);
			move |_, _| {
				let session = session_slot.lock().clone().expect("session is set");
				*seen_in_after_reset.lock() = Some(session.state()?);
				Ok(())
			}
		});

	let instance = Instance::builder().client_reset(strategy).build().await;
	let session = instance.session();
	*session_slot.lock() = Some(session.clone());
	let mut events = session.events().unwrap();

	let log = instance.log();
	let version = add_dogs(&instance.replica.subscriptions().unwrap());
	eventually(|| log.sent_versions().contains(&version)).await;
	let sent_before = log.sent_versions().len();

	instance
		.sink()
		.on_session_error(ErrorCode::ClientReset, "history diverged", true)
		.unwrap();

	assert!(next_reset(&mut events).await.recovered());
	assert_eq!(fallbacks.load(Ordering::SeqCst), 0);
	assert_eq!(*seen_in_after_reset.lock(), Some(SessionState::Inactive));
	assert_eq!(session.state().unwrap(), SessionState::Active);

	// Resumed once, after the callbacks
	let sent = log.sent_versions();
	assert_eq!(sent.len(), sent_before + 1);
	assert_eq!(sent.last(), Some(&version));
}

#[tokio::test]
#[traced_test]
async fn stop_during_reset_keeps_the_session_inactive() {
	let session_slot = Arc::new(Mutex::new(None::<SyncSession>));
	let (_, fallback) = counter();

	let strategy = ClientResetStrategy::discard_local(fallback).with_before_reset({
		let session_slot = Arc::clone(&session_slot);
		move |_| {
			let session = session_slot.lock().clone().expect("session is set");
			session.start()?;
			session.stop()?;
			Ok(())
		}
	});

	let instance = Instance::builder().client_reset(strategy).build().await;
	let session = instance.session();
	*session_slot.lock() = Some(session.clone());
	let mut events = session.events().unwrap();

	instance
		.sink()
		.on_session_error(ErrorCode::ClientReset, "history diverged", true)
		.unwrap();

	assert!(next_reset(&mut events).await.recovered());
	assert_eq!(session.state().unwrap(), SessionState::Inactive);

	session.start().unwrap();
	assert_eq!(session.state().unwrap(), SessionState::Active);
}

#[tokio::test]
#[traced_test]
async fn reset_errors_are_observed_but_handled_once() {
	let generic = Recorder::default();
	let (resets, on_reset) = counter();

	let instance = Instance::builder()
		.client_reset(ClientResetStrategy::manual(on_reset))
		.session_handler(&generic)
		.build()
		.await;
	let mut events = instance.session().events().unwrap();

	let error = instance
		.sink()
		.on_session_error(ErrorCode::ClientReset, "history diverged", true)
		.unwrap();

	let observed = timeout(WAIT, async {
		loop {
			match events.recv().await.unwrap() {
				SessionEvent::Error(observed) => break observed,
				SessionEvent::ClientReset(_) => panic!("reset finished before the error was observed"),
				_ => {}
			}
		}
	})
	.await
	.unwrap();
	assert_eq!(observed, error);

	assert_eq!(next_reset(&mut events).await.phase, ResetPhase::ManualHandled);
	assert_eq!(resets.load(Ordering::SeqCst), 1);
	assert_eq!(generic.count(), 0);
}

#[tokio::test]
#[traced_test]
async fn failing_before_reset_hands_over_to_fallback() {
	let (afters, after_calls) = {
		let calls = Arc::new(AtomicUsize::new(0));
		(Arc::clone(&calls), move |_: &ReplicaView, _: &ReplicaView| {
			calls.fetch_add(1, Ordering::SeqCst);
			Ok(())
		})
	};
	let (fallbacks, fallback) = counter();

	let strategy = ClientResetStrategy::discard_local(fallback)
		.with_before_reset(|_| Err("local backup failed".into()))
		.with_after_reset(after_calls);

	let instance = Instance::builder().client_reset(strategy).build().await;
	let session = instance.session();
	let mut events = session.events().unwrap();

	let error = instance
		.sink()
		.on_session_error(ErrorCode::ClientReset, "history diverged", true)
		.unwrap();

	let outcome = next_reset(&mut events).await;
	assert_eq!(outcome.phase, ResetPhase::FallbackHandled);
	assert!(!outcome.recovered());

	assert_eq!(afters.load(Ordering::SeqCst), 0);
	assert_eq!(fallbacks.load(Ordering::SeqCst), 1);
	assert_eq!(instance.engine.discards.load(Ordering::SeqCst), 0);
	assert_eq!(session.state().unwrap(), SessionState::Invalid);
	assert_eq!(session.error().unwrap(), Some(error.clone()));
	assert!(matches!(session.start(), Err(Error::SessionInvalid(e)) if e == error));
}

#[tokio::test]
#[traced_test]
async fn panicking_before_reset_hands_over_to_fallback() {
	let (fallbacks, fallback) = counter();
	let strategy =
		ClientResetStrategy::discard_local(fallback).with_before_reset(|_| panic!("backup panicked"));

	let instance = Instance::builder().client_reset(strategy).build().await;
	let mut events = instance.session().events().unwrap();

	instance
		.sink()
		.on_session_error(ErrorCode::ClientReset, "history diverged", true)
		.unwrap();

	assert_eq!(next_reset(&mut events).await.phase, ResetPhase::FallbackHandled);
	assert_eq!(fallbacks.load(Ordering::SeqCst), 1);
	assert_eq!(instance.session().state().unwrap(), SessionState::Invalid);
}

#[tokio::test]
#[traced_test]
async fn failing_reset_engine_hands_over_to_fallback() {
	let (fallbacks, fallback) = counter();
	let instance = Instance::builder()
		.client_reset(ClientResetStrategy::discard_local(fallback))
		.build()
		.await;
	instance.engine.fail.store(true, Ordering::SeqCst);
	let mut events = instance.session().events().unwrap();

	instance
		.sink()
		.on_session_error(ErrorCode::ClientReset, "history diverged", true)
		.unwrap();

	assert_eq!(next_reset(&mut events).await.phase, ResetPhase::FallbackHandled);
	assert_eq!(fallbacks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[traced_test]
async fn failing_after_reset_still_recovers() {
	let (fallbacks, fallback) = counter();
	let strategy = ClientResetStrategy::discard_local(fallback)
		.with_after_reset(|_, _| Err("could not rebuild indexes".into()));

	let instance = Instance::builder().client_reset(strategy).build().await;
	let mut events = instance.session().events().unwrap();

	instance
		.sink()
		.on_session_error(ErrorCode::ClientReset, "history diverged", true)
		.unwrap();

	assert!(next_reset(&mut events).await.recovered());
	assert_eq!(fallbacks.load(Ordering::SeqCst), 0);
	assert_eq!(instance.session().state().unwrap(), SessionState::Active);
}

#[tokio::test]
#[traced_test]
async fn unrecoverable_reset_skips_discard_local() {
	let (befores, before) = {
		let calls = Arc::new(AtomicUsize::new(0));
		(Arc::clone(&calls), move |_: &ReplicaView| {
			calls.fetch_add(1, Ordering::SeqCst);
			Ok(())
		})
	};
	let (fallbacks, fallback) = counter();

	let instance = Instance::builder()
		.client_reset(ClientResetStrategy::discard_local(fallback).with_before_reset(before))
		.build()
		.await;
	let mut events = instance.session().events().unwrap();

	instance
		.sink()
		.on_session_error(ErrorCode::AutoClientResetFailure, "cannot recover", true)
		.unwrap();

	assert_eq!(next_reset(&mut events).await.phase, ResetPhase::FallbackHandled);
	assert_eq!(befores.load(Ordering::SeqCst), 0);
	assert_eq!(fallbacks.load(Ordering::SeqCst), 1);
	assert_eq!(instance.engine.discards.load(Ordering::SeqCst), 0);
}

#[tokio::test]
#[traced_test]
async fn manual_recovery_runs_once() {
	let (resets, on_reset) = counter();
	let generic = Recorder::default();

	let instance = Instance::builder()
		.client_reset(ClientResetStrategy::manual(on_reset))
		.session_handler(&generic)
		.build()
		.await;
	let sink = instance.sink();
	let mut events = instance.session().events().unwrap();

	let error = sink
		.on_session_error(ErrorCode::ClientReset, "history diverged", true)
		.unwrap();
	sink.send(TransportEvent::SessionError(error)).unwrap();
	sink.on_session_error(ErrorCode::ClientReset, "history diverged again", true)
		.unwrap();

	assert_eq!(next_reset(&mut events).await.phase, ResetPhase::ManualHandled);
	instance.flush().await;

	assert_eq!(resets.load(Ordering::SeqCst), 1);
	assert_eq!(generic.count(), 0);
	assert_eq!(instance.session().state().unwrap(), SessionState::Invalid);
}

#[tokio::test]
#[traced_test]
async fn duplicate_reports_are_delivered_once() {
	let handler = Recorder::default();
	let instance = Instance::builder().session_handler(&handler).build().await;
	let sink = instance.sink();

	let error = sink
		.on_session_error(ErrorCode::ConnectionClosed, "connection reset by peer", false)
		.unwrap();
	sink.send(TransportEvent::SessionError(error.clone()))
		.unwrap();
	instance.flush().await;

	assert_eq!(handler.errors(), vec![error]);
	assert_eq!(instance.session().state().unwrap(), SessionState::Active);
}

#[tokio::test]
#[traced_test]
async fn session_handler_takes_precedence() {
	let session_handler = Recorder::default();
	let default_handler = Recorder::default();

	let instance = Instance::builder()
		.session_handler(&session_handler)
		.default_handler(&default_handler)
		.build()
		.await;

	instance
		.sink()
		.on_session_error(ErrorCode::ConnectionClosed, "bye", false)
		.unwrap();
	instance.flush().await;

	assert_eq!(session_handler.count(), 1);
	assert_eq!(default_handler.count(), 0);
}

#[tokio::test]
#[traced_test]
async fn client_default_handler_is_the_fallback() {
	let default_handler = Recorder::default();
	let instance = Instance::builder()
		.default_handler(&default_handler)
		.build()
		.await;

	instance
		.sink()
		.on_session_error(ErrorCode::PermissionDenied, "read only", false)
		.unwrap();
	instance.flush().await;

	assert_eq!(default_handler.count(), 1);
	assert_eq!(instance.session().state().unwrap(), SessionState::Invalid);
}

#[tokio::test]
#[traced_test]
async fn reset_without_strategy_is_a_generic_error() {
	let handler = Recorder::default();
	let instance = Instance::builder().session_handler(&handler).build().await;

	let error = instance
		.sink()
		.on_session_error(ErrorCode::ClientReset, "history diverged", true)
		.unwrap();
	instance.flush().await;

	assert_eq!(handler.errors(), vec![error.clone()]);
	assert_eq!(instance.session().state().unwrap(), SessionState::Invalid);
	assert_eq!(instance.session().error().unwrap(), Some(error));
	assert_eq!(instance.engine.discards.load(Ordering::SeqCst), 0);
}

#[tokio::test]
#[traced_test]
async fn expired_token_is_refreshed() {
	let handler = Recorder::default();
	let instance = Instance::builder().session_handler(&handler).build().await;

	instance
		.sink()
		.on_session_error(ErrorCode::AccessTokenExpired, "token expired", false)
		.unwrap();
	instance.flush().await;

	assert_eq!(*instance.log().tokens.lock(), vec!["access-0", "access-1"]);
	assert_eq!(instance.client.user().access_token(), "access-1");
	assert_eq!(handler.count(), 0);
	assert_eq!(instance.session().state().unwrap(), SessionState::Active);
}

#[tokio::test]
#[traced_test]
async fn failed_refresh_is_an_authentication_error() {
	let handler = Recorder::default();
	let instance = Instance::builder().session_handler(&handler).build().await;
	instance.auth.refresh_fails.store(true, Ordering::SeqCst);

	instance
		.sink()
		.on_session_error(ErrorCode::AccessTokenExpired, "token expired", false)
		.unwrap();
	instance.flush().await;

	let errors = handler.errors();
	assert_eq!(errors.len(), 1);
	assert_eq!(errors[0].code, ErrorCode::AuthenticationFailed);
	assert_eq!(instance.session().state().unwrap(), SessionState::Invalid);
}

#[tokio::test]
#[traced_test]
async fn bounded_progress_stops_at_outstanding_work() {
	let instance = Instance::new().await;
	let session = instance.session();
	let sink = instance.sink();

	sink.on_progress(ProgressDirection::Upload, 0, 100).unwrap();
	instance.flush().await;

	let mut progress = session
		.progress(ProgressDirection::Upload, ProgressMode::ForCurrentlyOutstandingWork)
		.unwrap();
	assert_eq!(session.progress_registrations(ProgressDirection::Upload), 1);

	assert_eq!(
		progress.next().await,
		Some(SyncProgress {
			transferred_bytes: 0,
			transferable_bytes: 100
		})
	);

	sink.on_progress(ProgressDirection::Upload, 120, 150).unwrap();
	let last = timeout(WAIT, progress.next()).await.unwrap().unwrap();
	assert!(last.is_complete());
	assert_eq!(last.transferable_bytes, 100);
	assert_eq!(timeout(WAIT, progress.next()).await.unwrap(), None);

	drop(progress);
	assert_eq!(session.progress_registrations(ProgressDirection::Upload), 0);
}

#[tokio::test]
#[traced_test]
async fn indefinite_progress_ends_when_session_closes() {
	let instance = Instance::new().await;
	let session = instance.session();

	let mut progress = session
		.progress(ProgressDirection::Upload, ProgressMode::ReportIndefinitely)
		.unwrap();
	assert_eq!(progress.next().await, Some(SyncProgress::default()));

	session.close();
	assert_eq!(timeout(WAIT, progress.next()).await.unwrap(), None);
}

#[tokio::test]
#[traced_test]
async fn upload_wait_resolves_when_caught_up() {
	let instance = Instance::new().await;
	let session = instance.session();
	let sink = instance.sink();

	sink.on_progress(ProgressDirection::Upload, 0, 50).unwrap();
	instance.flush().await;

	let mut wait = Box::pin(session.wait_for_upload_completion());
	assert!(poll!(&mut wait).is_pending());

	// Work queued after the wait started doesn't extend it
	sink.on_progress(ProgressDirection::Upload, 50, 80).unwrap();
	timeout(WAIT, wait).await.unwrap().unwrap();
}

#[tokio::test]
#[traced_test]
async fn wait_with_nothing_outstanding_resolves() {
	let instance = Instance::new().await;

	timeout(WAIT, instance.session().wait_for_download_completion())
		.await
		.unwrap()
		.unwrap();
}

#[tokio::test(start_paused = true)]
async fn upload_wait_times_out() {
	let instance = Instance::new().await;
	let session = instance.session();

	instance
		.sink()
		.on_progress(ProgressDirection::Upload, 0, 50)
		.unwrap();
	instance.flush().await;

	let res = session
		.wait_for_upload_completion_with(WaitOptions::with_timeout(Duration::from_secs(1)))
		.await;
	assert!(matches!(res, Err(Error::Timeout(_))));
}

#[tokio::test]
#[traced_test]
async fn nonfatal_errors_interrupt_waits_when_configured() {
	let instance = Instance::builder()
		.config(|config| config.cancel_waits_on_nonfatal_error = true)
		.build()
		.await;
	let session = instance.session();
	let sink = instance.sink();

	sink.on_progress(ProgressDirection::Upload, 0, 50).unwrap();
	instance.flush().await;

	let mut wait = Box::pin(session.wait_for_upload_completion());
	assert!(poll!(&mut wait).is_pending());

	let error = sink
		.on_session_error(ErrorCode::ConnectionClosed, "connection reset", false)
		.unwrap();

	let res = timeout(WAIT, wait).await.unwrap();
	assert!(matches!(res, Err(Error::Interrupted(e)) if e == error));
	assert_eq!(session.state().unwrap(), SessionState::Active);
}

#[tokio::test]
#[traced_test]
async fn fatal_errors_fail_waits() {
	let instance = Instance::new().await;
	let session = instance.session();
	let sink = instance.sink();

	sink.on_progress(ProgressDirection::Upload, 0, 50).unwrap();
	instance.flush().await;

	let mut wait = Box::pin(session.wait_for_upload_completion());
	assert!(poll!(&mut wait).is_pending());

	sink.on_session_error(ErrorCode::ProtocolViolation, "bad frame", false)
		.unwrap();

	let res = timeout(WAIT, wait).await.unwrap();
	assert!(matches!(res, Err(Error::SessionInvalid(e)) if e.code == ErrorCode::ProtocolViolation));
}

#[tokio::test]
#[traced_test]
async fn closed_session_is_disposed() {
	let instance = Instance::new().await;
	let session = instance.session();
	let id = session.id();

	instance
		.sink()
		.on_progress(ProgressDirection::Upload, 0, 50)
		.unwrap();
	instance.flush().await;

	let mut wait = Box::pin(session.wait_for_upload_completion());
	assert!(poll!(&mut wait).is_pending());

	session.close();
	session.close();

	assert!(matches!(timeout(WAIT, wait).await.unwrap(), Err(Error::Disposed(e)) if e == id));
	assert!(matches!(session.state(), Err(Error::Disposed(_))));
	assert!(matches!(session.path(), Err(Error::Disposed(_))));
	assert!(matches!(session.start(), Err(Error::Disposed(_))));
	assert!(matches!(
		session.progress(ProgressDirection::Upload, ProgressMode::ReportIndefinitely),
		Err(Error::Disposed(_))
	));
	assert_eq!(session.id(), id);
	assert_eq!(instance.log().closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[traced_test]
async fn replicas_on_one_path_share_a_session() {
	let instance = Instance::new().await;

	let same = instance
		.client
		.open_replica(ReplicaConfig::new(
			instance.replica.path(),
			Arc::new(MemoryStorage::new()),
			Arc::clone(&instance.engine) as _,
		))
		.await
		.unwrap();
	let other = instance.open("other.replica").await;

	assert_eq!(same.session().unwrap(), instance.session());
	assert_ne!(other.session().unwrap(), instance.session());
	assert_eq!(instance.transport.opens(), 2);

	// Subscriptions are shared too
	let version = add_dogs(&instance.replica.subscriptions().unwrap());
	assert_eq!(same.subscriptions().unwrap().version().unwrap(), version);
}

#[tokio::test]
#[traced_test]
async fn last_handle_closes_the_session() {
	let instance = Instance::new().await;
	let session = instance.session();
	let second = instance.replica.open_another().unwrap();
	let set = instance.replica.subscriptions().unwrap();

	instance.replica.close();
	assert!(instance.replica.is_closed());
	assert!(set.is_closed());
	assert!(matches!(
		instance.replica.subscriptions(),
		Err(Error::ReplicaClosed(_))
	));
	assert_eq!(session.state().unwrap(), SessionState::Active);

	second.close();
	assert!(matches!(session.state(), Err(Error::Disposed(_))));
	assert_eq!(instance.log().closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[traced_test]
async fn subscriptions_are_cached_per_handle() {
	let instance = Instance::new().await;

	let first = instance.replica.subscriptions().unwrap();
	let again = instance.replica.subscriptions().unwrap();
	assert_eq!(first.version().unwrap(), again.version().unwrap());

	let version = add_dogs(&first);
	assert_eq!(
		instance.replica.subscriptions().unwrap().version().unwrap(),
		version
	);
}

#[tokio::test]
#[traced_test]
async fn close_waits_for_uploads() {
	let instance = Instance::new().await;
	let session = instance.session();
	let sink = instance.sink();

	sink.on_progress(ProgressDirection::Upload, 0, 10).unwrap();
	instance.flush().await;

	let mut close = Box::pin(session.close_and_wait());
	assert!(poll!(&mut close).is_pending());
	assert_eq!(instance.log().closes.load(Ordering::SeqCst), 0);

	sink.on_progress(ProgressDirection::Upload, 10, 10).unwrap();
	timeout(WAIT, close).await.unwrap();

	assert_eq!(instance.log().closes.load(Ordering::SeqCst), 1);
	assert!(matches!(session.state(), Err(Error::Disposed(_))));
}

#[tokio::test]
#[traced_test]
async fn immediate_stop_policy_skips_uploads() {
	let instance = Instance::builder()
		.config(|config| config.stop_policy = StopPolicy::Immediately)
		.build()
		.await;
	let session = instance.session();

	instance
		.sink()
		.on_progress(ProgressDirection::Upload, 0, 10)
		.unwrap();
	instance.flush().await;

	timeout(WAIT, session.close_and_wait()).await.unwrap();
	assert_eq!(instance.log().closes.load(Ordering::SeqCst), 1);
}
