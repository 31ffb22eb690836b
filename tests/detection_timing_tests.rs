// Integration tests for completion timing against a scripted agent
// All tests run on a paused clock; elapsed times are measured from the
// moment the agent received the confirm keystroke.

mod common;

#[cfg(test)]
mod detection_timing_tests {
    use super::common::*;
    use std::time::Duration;
    use tui_queue_lib::{PermissionMode, Pilot, PilotCommand, PilotConfig, TaskStatus};

    /// Run one task and return how long after dispatch it completed
    async fn time_to_completion(
        config: PilotConfig,
        text: &str,
        script: fn(&tui_queue_lib::session::scripted::ScriptedController),
        limit: Duration,
    ) -> (Pilot, String, Duration) {
        let clock = ConfirmClock::default();
        let recorder = clock.clone();
        let (pilot, _spawner) = pilot(
            config,
            on_confirm(move |ctl| {
                recorder.record();
                script(ctl);
            }),
        );
        let task = pilot.orchestrator().enqueue(text).unwrap();
        pilot
            .execute(PilotCommand::StartQueue {
                permission_mode: PermissionMode::Default,
            })
            .await
            .unwrap();

        let done_at = wait_for_status(&pilot, &task.id, TaskStatus::Completed, limit)
            .await
            .expect("task completes");
        let elapsed = done_at - clock.first().expect("payload was confirmed");
        (pilot, task.id, elapsed)
    }

    fn between(elapsed: Duration, low_ms: u64, high_ms: u64) -> bool {
        elapsed >= Duration::from_millis(low_ms) && elapsed <= Duration::from_millis(high_ms)
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_phrase_after_long_silence() {
        let mut config = fast_config();
        config.detection.min_task_duration_ms = 30_000;
        let (pilot, id, elapsed) = time_to_completion(
            config,
            "create a file named notes.txt",
            |ctl| {
                ctl.emit("I will create the file now.\r\n");
                emit_later(ctl, Duration::from_secs(31), "File created\r\n");
            },
            Duration::from_secs(120),
        )
        .await;

        // Phrase at 31s, then grace and stability: 33s
        assert!(between(elapsed, 33_000, 33_300), "completed after {:?}", elapsed);
        assert!(super::common::task(&pilot, &id)
            .output
            .unwrap()
            .contains("File created"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimum_duration_floor() {
        let mut config = fast_config();
        config.detection.min_task_duration_ms = 30_000;
        let (_pilot, _id, elapsed) = time_to_completion(
            config,
            "quick edit",
            |ctl| ctl.emit("I will make the edit.\r\nFile created\r\n"),
            Duration::from_secs(120),
        )
        .await;

        assert!(between(elapsed, 30_000, 30_300), "completed after {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changing_output_delays_completion() {
        let (_pilot, _id, elapsed) = time_to_completion(
            fast_config(),
            "build all the modules",
            |ctl| {
                ctl.emit("I will build everything.\r\nTask completed.\r\n");
                emit_later(ctl, Duration::from_secs(1), "compiling module 1 of 5\r\n");
                emit_later(ctl, Duration::from_secs(2), "compiling module 2 of 5\r\n");
                emit_later(ctl, Duration::from_secs(3), "compiling module 3 of 5\r\n");
                emit_later(ctl, Duration::from_secs(4), "compiling module 4 of 5\r\n");
                emit_later(ctl, Duration::from_secs(5), "compiling module 5 of 5\r\n");
            },
            Duration::from_secs(60),
        )
        .await;

        // Two seconds of stable output after the last change at 5s
        assert!(between(elapsed, 7_000, 7_300), "completed after {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_fallback() {
        let mut config = fast_config();
        config.detection.no_output_timeout_ms = 10_000;
        let (_pilot, _id, elapsed) = time_to_completion(
            config,
            "investigate the failure",
            |ctl| ctl.emit("I will look into it.\r\n"),
            Duration::from_secs(60),
        )
        .await;

        assert!(between(elapsed, 10_000, 10_300), "completed after {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_after_tool_use() {
        let (_pilot, _id, elapsed) = time_to_completion(
            fast_config(),
            "fix the typo in lib.rs",
            |ctl| ctl.emit("I will edit the file.\r\n⏺ Edit(src/lib.rs)\r\nUpdated 3 lines\r\n> \r\n"),
            Duration::from_secs(60),
        )
        .await;

        // Grace, stability and prompt quiet time are 2s each
        assert!(between(elapsed, 2_000, 2_300), "completed after {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_phrase_does_not_complete() {
        let mut config = fast_config();
        config.detection.no_output_timeout_ms = 10_000;
        let (pilot, id, elapsed) = time_to_completion(
            config,
            "write the report",
            |ctl| {
                ctl.emit("I will create it.\r\n");
                emit_later(ctl, Duration::from_millis(1100), "File created\r\n");
                emit_later(
                    ctl,
                    Duration::from_millis(1200),
                    "\x1b[H\x1b[2JRedrawing project view\r\n",
                );
            },
            Duration::from_secs(60),
        )
        .await;

        // Only the idle timeout from the redraw at 1.2s is left
        assert!(between(elapsed, 11_200, 11_500), "completed after {:?}", elapsed);
        let output = super::common::task(&pilot, &id).output.unwrap();
        assert!(!output.contains("File created"));
        assert!(output.contains("Redrawing project view"));
    }
}
