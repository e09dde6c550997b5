// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for admission, queueing and promotion.
//!
//! All tests run on a paused clock, so simulated work durations are exact.
//!
//! Run with:
//! ```bash
//! cargo test -p ipcsim-core --test dispatcher_test
//! ```

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use ipcsim_core::permission::{ROLE_ADMIN, ROLE_OPERATOR, ROLE_VIEWER};
use ipcsim_core::{
    Action, ActionType, Denial, Dispatcher, InterruptOutcome, PermissionTable, ProcessOutcome,
    ProcessState, ProcessType, SchedulerEvent,
};

use common::*;

// ============================================================================
// Admission
// ============================================================================

/// A viewer asking for a calculation is refused without side effects.
#[tokio::test(start_paused = true)]
async fn test_viewer_calculation_is_forbidden() {
    let dispatcher = dispatcher(
        Duration::from_secs(1),
        single_role(
            ROLE_VIEWER,
            &[ActionType::Consulta, ActionType::Reporte],
            &[ProcessType::Analysis],
            2,
        ),
        10,
    );
    let mut events = dispatcher.subscribe();

    let denial = dispatcher
        .submit(
            "viewer-1",
            ROLE_VIEWER,
            Action::new(ActionType::Consulta, ProcessType::Calculation),
        )
        .await
        .unwrap_err();

    assert_eq!(denial, Denial::Forbidden);
    assert_eq!(denial.to_string(), "forbidden");
    assert!(dispatcher.registry().is_empty());
    assert_eq!(dispatcher.queued_len().await, 0);
    assert!(dispatcher.queue_stats_for("viewer-1").await.is_none());

    let events = drain_events(&mut events);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        SchedulerEvent::ActionDenied { reason, role, .. }
            if reason == "forbidden" && role == ROLE_VIEWER
    ));
}

/// Admission matches the allow-lists for every role and kind combination.
#[tokio::test(start_paused = true)]
async fn test_admission_follows_allow_lists() {
    let table = PermissionTable::defaults();
    let dispatcher = dispatcher(Duration::from_millis(10), table.clone(), 100);

    for role in [ROLE_ADMIN, ROLE_OPERATOR, ROLE_VIEWER, "guest"] {
        for action_type in ActionType::ALL {
            for process_type in ProcessType::ALL {
                let expected = table
                    .get(role)
                    .is_some_and(|p| p.allows(action_type, process_type));
                let result = dispatcher
                    .submit(
                        &format!("{role}-conn"),
                        role,
                        Action::new(action_type, process_type),
                    )
                    .await;
                assert_eq!(
                    !matches!(result, Err(Denial::Forbidden)),
                    expected,
                    "role={role} action={action_type} process={process_type}"
                );
            }
        }
    }
}

// ============================================================================
// Queueing and promotion
// ============================================================================

/// With a cap of one, the second action waits and starts on its own once
/// the first one ends.
#[tokio::test(start_paused = true)]
async fn test_second_action_is_promoted_after_first_ends() {
    let dispatcher = dispatcher(
        Duration::from_secs(2),
        single_role("worker", &[ActionType::Solicitud], &[ProcessType::Database], 1),
        10,
    );

    let first = dispatcher
        .submit("conn-1", "worker", database_action())
        .await
        .unwrap();
    let second = dispatcher
        .submit("conn-1", "worker", database_action())
        .await
        .unwrap();

    let first_id = first.process_id().unwrap().to_string();
    assert!(second.is_queued());
    assert_eq!(dispatcher.registry().len(), 1);
    assert_eq!(dispatcher.queued_len().await, 1);

    tokio::time::sleep(Duration::from_millis(2100)).await;

    let first_process = dispatcher.registry().get(&first_id).unwrap();
    assert_eq!(first_process.state, ProcessState::Completed);
    let running = dispatcher.registry().active_processes();
    assert_eq!(running.len(), 1);
    assert_ne!(running[0].id, first_id);
    assert_eq!(dispatcher.queued_len().await, 0);

    let outcome = second.into_completion().await;
    assert_eq!(outcome.process_id(), Some(running[0].id.as_str()));
    assert!(outcome.is_success());
}

/// Promotion also happens when the running process is interrupted.
#[tokio::test(start_paused = true)]
async fn test_promotion_after_interrupt() {
    let dispatcher = dispatcher(
        Duration::from_secs(60),
        single_role("worker", &[ActionType::Solicitud], &[ProcessType::Database], 1),
        10,
    );

    let first = dispatcher
        .submit("conn-1", "worker", database_action())
        .await
        .unwrap();
    let _second = dispatcher
        .submit("conn-1", "worker", database_action())
        .await
        .unwrap();
    let first_id = first.process_id().unwrap().to_string();

    assert_eq!(
        dispatcher.interrupt("conn-1", "worker", &first_id).await,
        InterruptOutcome::Interrupted
    );
    assert!(matches!(
        first.into_completion().await,
        ProcessOutcome::Interrupted { .. }
    ));

    let active = dispatcher.registry().active_processes();
    assert_eq!(active.len(), 1);
    assert_ne!(active[0].id, first_id);
}

/// Capacity five: five actions queue, the sixth is refused and counted.
#[tokio::test(start_paused = true)]
async fn test_queue_capacity_and_discard_counter() {
    let dispatcher = dispatcher(
        Duration::from_secs(30),
        single_role("worker", &[ActionType::Solicitud], &[ProcessType::Database], 1),
        5,
    );
    let mut events = dispatcher.subscribe();

    let _running = dispatcher
        .submit("conn-1", "worker", database_action())
        .await
        .unwrap();

    let results =
        join_all((0..6).map(|_| dispatcher.submit("conn-1", "worker", database_action()))).await;
    let queued = results.iter().filter(|r| matches!(r, Ok(s) if s.is_queued())).count();
    let denied: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();

    assert_eq!(queued, 5);
    assert_eq!(denied, vec![&Denial::QueueFull]);
    assert_eq!(denied[0].to_string(), "queue full");

    let stats = dispatcher.queue_stats().await;
    assert_eq!(stats.current_size, 5);
    assert_eq!(stats.max_size, 5);
    assert_eq!(stats.discarded, 1);

    let events = drain_events(&mut events);
    let queue_full = events
        .iter()
        .filter(|e| {
            matches!(e, SchedulerEvent::ActionDenied { reason, .. } if reason == "queue full")
        })
        .count();
    assert_eq!(queue_full, 1);
    assert!(events.iter().any(|e| matches!(e, SchedulerEvent::QueueSample { size: 5 })));
}

/// Queued actions run in submission order regardless of priority.
#[tokio::test(start_paused = true)]
async fn test_queue_is_fifo() {
    let dispatcher = Dispatcher::new(
        single_role("worker", &[ActionType::Solicitud], &[ProcessType::Database], 1),
        Arc::new(Echo {
            delay: Duration::from_secs(1),
        }),
        config(Duration::from_secs(1), 10, 0),
    );

    let mut completions = Vec::new();
    for (n, priority) in [(0, 1), (1, 1), (2, 5), (3, 3)] {
        let mut data = ipcsim_core::ActionPayload::new();
        data.insert("n".to_string(), n.into());
        let action = database_action().with_priority(priority).with_data(data);
        completions.push(
            dispatcher
                .submit("conn-1", "worker", action)
                .await
                .unwrap()
                .into_completion(),
        );
    }

    let mut order = Vec::new();
    for completion in completions {
        let ProcessOutcome::Completed { process_id, result } = completion.await else {
            panic!("expected completion");
        };
        let process = dispatcher.registry().get(&process_id).unwrap();
        order.push((result["echo"]["n"].as_i64().unwrap(), process.start_time.unwrap()));
    }

    assert_eq!(order.iter().map(|(n, _)| *n).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    assert!(order.windows(2).all(|w| w[0].1 <= w[1].1));
}

/// The concurrency cap is never exceeded, even under a burst.
#[tokio::test(start_paused = true)]
async fn test_cap_is_never_exceeded() {
    let dispatcher = dispatcher(
        Duration::from_millis(500),
        PermissionTable::defaults().with_max_concurrent(ROLE_OPERATOR, 3),
        50,
    );

    let submissions = join_all(
        (0..20).map(|_| dispatcher.submit("conn-1", ROLE_OPERATOR, database_action())),
    )
    .await;
    let completions: Vec<_> = submissions
        .into_iter()
        .map(|s| s.unwrap().into_completion())
        .collect();

    let watcher = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let mut peak = 0;
            for _ in 0..100 {
                peak = peak.max(dispatcher.registry().active_count_for("conn-1"));
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            peak
        })
    };

    let outcomes = join_all(completions).await;
    assert!(outcomes.iter().all(ProcessOutcome::is_success));
    assert_eq!(watcher.await.unwrap(), 3);
    assert_eq!(dispatcher.registry().by_state(ProcessState::Completed).len(), 20);
}

// ============================================================================
// Retries and interrupts
// ============================================================================

/// Work that always fails ends FAILED after max_retries + 1 attempts.
#[tokio::test(start_paused = true)]
async fn test_retry_bound() {
    let workload = AlwaysFails::new(Duration::from_millis(200));
    let dispatcher = Dispatcher::new(
        PermissionTable::defaults(),
        workload.clone(),
        config(Duration::from_millis(200), 10, 2),
    );

    let submission = dispatcher
        .submit("conn-1", ROLE_ADMIN, database_action())
        .await
        .unwrap();
    let id = submission.process_id().unwrap().to_string();

    let outcome = submission.into_completion().await;
    let ProcessOutcome::Failed { error, retries, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(retries, 2);
    assert_eq!(error, format!("{id} attempt 3 failed"));
    assert_eq!(workload.attempts(), 3);

    let process = dispatcher.registry().get(&id).unwrap();
    assert_eq!(process.state, ProcessState::Failed);
    assert_eq!(process.retries, 2);
    assert_eq!(process.error.as_deref(), Some(error.as_str()));
    assert!(process.end_time.is_some());
}

/// An interrupt issued before the next poll beats a work timer that fires first.
#[tokio::test(start_paused = true)]
async fn test_interrupt_race_yields_interrupted() {
    // Work takes 150ms; polls happen every 100ms.
    let dispatcher = dispatcher(Duration::from_millis(150), PermissionTable::defaults(), 10);
    let mut events = dispatcher.subscribe();

    let submission = dispatcher
        .submit("conn-1", ROLE_OPERATOR, database_action())
        .await
        .unwrap();
    let id = submission.process_id().unwrap().to_string();

    // Past the first poll at 100ms, before the work completes at 150ms and
    // before the second poll at 200ms.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(
        dispatcher.interrupt("conn-1", ROLE_OPERATOR, &id).await,
        InterruptOutcome::Interrupted
    );

    assert_eq!(
        submission.into_completion().await,
        ProcessOutcome::Interrupted { process_id: id.clone() }
    );
    let process = dispatcher.registry().get(&id).unwrap();
    assert_eq!(process.state, ProcessState::Interrupted);

    let ended: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SchedulerEvent::ProcessEnded { .. }))
        .collect();
    assert_eq!(ended.len(), 1);
    assert!(matches!(
        ended[0],
        SchedulerEvent::ProcessEnded { state: ProcessState::Interrupted, .. }
    ));
}

/// Interrupting an unknown or finished process is a negative result, not an error.
#[tokio::test(start_paused = true)]
async fn test_interrupt_unknown_or_finished() {
    let dispatcher = dispatcher(Duration::from_millis(100), PermissionTable::defaults(), 10);

    assert_eq!(
        dispatcher.interrupt("conn-1", ROLE_ADMIN, "nope").await,
        InterruptOutcome::NotFound
    );

    let submission = dispatcher
        .submit("conn-1", ROLE_ADMIN, database_action())
        .await
        .unwrap();
    let id = submission.process_id().unwrap().to_string();
    assert!(submission.into_completion().await.is_success());

    assert_eq!(
        dispatcher.interrupt("conn-1", ROLE_ADMIN, &id).await,
        InterruptOutcome::NotFound
    );
}

/// Closing a connection only touches that connection's work.
#[tokio::test(start_paused = true)]
async fn test_release_owner_is_scoped() {
    let dispatcher = dispatcher(
        Duration::from_secs(10),
        PermissionTable::defaults().with_max_concurrent(ROLE_OPERATOR, 1),
        10,
    );

    let mine = dispatcher
        .submit("conn-1", ROLE_OPERATOR, database_action())
        .await
        .unwrap();
    let mine_queued = dispatcher
        .submit("conn-1", ROLE_OPERATOR, database_action())
        .await
        .unwrap();
    let theirs = dispatcher
        .submit("conn-2", ROLE_OPERATOR, database_action())
        .await
        .unwrap();
    let theirs_id = theirs.process_id().unwrap().to_string();

    let summary = dispatcher.release_owner("conn-1").await;
    assert_eq!(summary.interrupted, 1);
    assert_eq!(summary.dropped, 1);

    assert!(matches!(mine.into_completion().await, ProcessOutcome::Interrupted { .. }));
    assert!(matches!(
        mine_queued.into_completion().await,
        ProcessOutcome::Dropped { .. }
    ));
    assert!(theirs.into_completion().await.is_success());
    assert_eq!(
        dispatcher.registry().get(&theirs_id).unwrap().state,
        ProcessState::Completed
    );
    assert!(dispatcher.registry().by_owner("conn-1").iter().all(|p| p.is_terminal()));
}
