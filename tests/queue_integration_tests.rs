// Integration tests for the queue driving a scripted agent session end to end

mod common;

#[cfg(test)]
mod queue_integration_tests {
    use super::common::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tui_queue_lib::events::{SessionStatus, SessionStatusChangedPayload, EVENT_SESSION_STATUS_CHANGED};
    use tui_queue_lib::history::{JsonHistoryStore, TaskHistory};
    use tui_queue_lib::{PermissionMode, PilotCommand, Task, TaskErrorKind, TaskStatus};

    async fn enqueue(pilot: &tui_queue_lib::Pilot, text: &str) -> Task {
        pilot
            .execute(PilotCommand::Enqueue {
                text: text.to_string(),
            })
            .await
            .unwrap()
            .unwrap()
    }

    async fn start_queue(pilot: &tui_queue_lib::Pilot) {
        pilot
            .execute(PilotCommand::StartQueue {
                permission_mode: PermissionMode::AcceptEdits,
            })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_task_round_trip() {
        let (pilot, spawner) = pilot(
            fast_config(),
            on_confirm(|ctl| ctl.emit("I will create hello.txt.\r\nFile created: hello.txt\r\n")),
        );
        let task = enqueue(&pilot, "create hello.txt with a greeting").await;
        start_queue(&pilot).await;

        assert!(
            wait_for_status(&pilot, &task.id, TaskStatus::Completed, Duration::from_secs(30))
                .await
                .is_some()
        );

        let done = super::common::task(&pilot, &task.id);
        assert!(done.output.unwrap().contains("File created: hello.txt"));
        assert!(done.started_at.is_some());
        assert!(done.error.is_none());

        let ctl = spawner.last().unwrap();
        assert_eq!(ctl.written_text(), "create hello.txt with a greeting\r");
        assert_eq!(ctl.request().args, vec!["--accept-edits".to_string()]);
        assert_eq!(
            ctl.request().env,
            vec![("TERM".to_string(), "xterm-256color".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_task_processing() {
        let (pilot, spawner) = pilot(
            fast_config(),
            on_confirm(|ctl| {
                ctl.emit("I will handle it.\r\n");
                emit_later(ctl, Duration::from_millis(1500), "Task completed.\r\n");
            }),
        );
        let a = enqueue(&pilot, "first task in line").await;
        let b = enqueue(&pilot, "second task in line").await;
        let c = enqueue(&pilot, "third task in line").await;
        start_queue(&pilot).await;

        let mut max_processing = 0;
        let drained = wait_until(Duration::from_secs(120), || {
            let processing = pilot
                .orchestrator()
                .snapshot()
                .iter()
                .filter(|t| t.status == TaskStatus::Processing)
                .count();
            max_processing = max_processing.max(processing);
            pilot.orchestrator().is_drained()
        })
        .await;
        assert!(drained.is_some());
        assert_eq!(max_processing, 1);

        let tasks = pilot.orchestrator().snapshot();
        let ids: Vec<_> = tasks.iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
        for pair in tasks.windows(2) {
            assert_eq!(pair[0].status, TaskStatus::Completed);
            assert!(pair[0].completed_at.unwrap() <= pair[1].started_at.unwrap());
        }
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_start_spawns_one_session() {
        let (pilot, spawner) = pilot(
            fast_config(),
            on_confirm(|ctl| ctl.emit("I will do it.\r\nAll done\r\n")),
        );
        let mut events = pilot.subscribe();
        for _ in 0..2 {
            pilot
                .execute(PilotCommand::StartSession {
                    permission_mode: PermissionMode::Default,
                })
                .await
                .unwrap();
        }
        let task = enqueue(&pilot, "after two starts").await;
        start_queue(&pilot).await;
        start_queue(&pilot).await;

        assert!(
            wait_for_status(&pilot, &task.id, TaskStatus::Completed, Duration::from_secs(30))
                .await
                .is_some()
        );
        assert_eq!(spawner.spawn_count(), 1);
        assert!(pilot.orchestrator().is_driving());

        let mut starting = 0;
        while let Ok(event) = events.try_recv() {
            if event.event == EVENT_SESSION_STATUS_CHANGED {
                let payload: SessionStatusChangedPayload = event.payload_as().unwrap();
                if payload.status == SessionStatus::Starting {
                    starting += 1;
                }
            }
        }
        assert_eq!(starting, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_fails_task_and_next_task_respawns() {
        let confirms = Arc::new(AtomicUsize::new(0));
        let counter = confirms.clone();
        let (pilot, spawner) = pilot(
            fast_config(),
            on_confirm(move |ctl| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    ctl.emit("I will try.\r\n");
                    ctl.exit(1);
                } else {
                    ctl.emit("I will try again.\r\nTask completed.\r\n");
                }
            }),
        );
        let first = enqueue(&pilot, "crashes the agent").await;
        let second = enqueue(&pilot, "runs on a new session").await;
        start_queue(&pilot).await;

        assert!(
            wait_for_status(&pilot, &second.id, TaskStatus::Completed, Duration::from_secs(60))
                .await
                .is_some()
        );

        let crashed = super::common::task(&pilot, &first.id);
        assert_eq!(crashed.status, TaskStatus::Error);
        assert_eq!(crashed.error_kind, Some(TaskErrorKind::SessionCrash));
        assert_eq!(spawner.spawn_count(), 2);
        assert!(!spawner.controller(0).unwrap().is_alive());
        assert!(spawner.controller(1).unwrap().is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_session_mid_task_fails_task() {
        let (pilot, spawner) = pilot(
            fast_config(),
            on_confirm(|ctl| ctl.emit("I will take a while.\r\n")),
        );
        let task = enqueue(&pilot, "long running work").await;
        start_queue(&pilot).await;
        assert!(
            wait_for_status(&pilot, &task.id, TaskStatus::Processing, Duration::from_secs(10))
                .await
                .is_some()
        );

        pilot.execute(PilotCommand::StopSession).await.unwrap();
        assert!(
            wait_for_status(&pilot, &task.id, TaskStatus::Error, Duration::from_secs(5))
                .await
                .is_some()
        );
        assert!(spawner.controller(0).unwrap().was_killed());
        assert!(pilot.supervisor().session_id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_from_history() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(JsonHistoryStore::new(dir.path().join("history.json")));

        let mut finished = Task::new("finished last time");
        finished.status = TaskStatus::Completed;
        let mut in_flight = Task::new("was running at exit");
        in_flight.status = TaskStatus::Processing;
        let waiting = Task::new("never got a turn");
        for t in [&finished, &in_flight, &waiting] {
            store.append_or_update(t).unwrap();
        }

        let (pilot, spawner) = pilot_with_history(
            fast_config(),
            on_confirm(|ctl| ctl.emit("I will pick it up.\r\nTask completed.\r\n")),
            Some(store.clone()),
        );
        assert_eq!(pilot.restore(store.as_ref()).unwrap(), 3);

        let interrupted = super::common::task(&pilot, &in_flight.id);
        assert_eq!(interrupted.status, TaskStatus::Error);
        assert_eq!(interrupted.error_kind, Some(TaskErrorKind::Interrupted));

        start_queue(&pilot).await;
        assert!(
            wait_for_status(&pilot, &waiting.id, TaskStatus::Completed, Duration::from_secs(30))
                .await
                .is_some()
        );
        assert_eq!(spawner.last().unwrap().written_text(), "never got a turn\r");

        let stored = store.load().unwrap();
        let status_of = |id: &str| stored.iter().find(|t| t.id == id).unwrap().status;
        assert_eq!(status_of(&finished.id), TaskStatus::Completed);
        assert_eq!(status_of(&in_flight.id), TaskStatus::Error);
        assert_eq!(status_of(&waiting.id), TaskStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_reports_interrupted_task() {
        let (pilot, _spawner) = pilot(
            fast_config(),
            on_confirm(|ctl| ctl.emit("I will keep going.\r\n")),
        );
        let task = enqueue(&pilot, "cut short by shutdown").await;
        start_queue(&pilot).await;
        assert!(
            wait_for_status(&pilot, &task.id, TaskStatus::Processing, Duration::from_secs(10))
                .await
                .is_some()
        );

        let report = pilot.shutdown();
        assert!(report.session_stopped);
        assert_eq!(report.interrupted_task, Some(task.id.clone()));
        assert!(!pilot.orchestrator().is_running());
    }
}
