mod fixtures;
mod helpers;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use scene_render_queue::models::job::JobStatus;
use scene_render_queue::models::queue::QueueStatus;
use scene_render_queue::models::requests::JobPatch;
use scene_render_queue::services::registry::RegistryError;
use scene_render_queue::services::scheduler::SchedulerError;
use scene_render_queue::store::SnapshotStore;
use tokio::sync::Semaphore;

use fixtures::{extension_scene, reference_scene, scene, FAILING_SEED};
use helpers::{harness, harness_with, wait_until, ScriptedRenderer};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_single_render_at_a_time_across_queues() {
    let h = harness(ScriptedRenderer::default());
    let s = &h.scheduler;

    let a = s
        .create_queue("A".into(), None, (1..=3).map(reference_scene).collect())
        .await;
    let b = s
        .create_queue("B".into(), None, (10..=12).map(reference_scene).collect())
        .await;
    s.run_all(a.id).await.unwrap();
    s.run_all(b.id).await.unwrap();

    let mut peak = 0;
    let finished = wait_until(WAIT, || {
        peak = peak.max(s.running_count());
        let done = |id| s.queue(id).unwrap().status == QueueStatus::Done;
        done(a.id) && done(b.id)
    })
    .await;

    assert!(finished, "queues did not finish");
    assert!(peak <= 1);
    assert_eq!(h.renderer.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(h.renderer.call_count(), 6);
}

#[tokio::test]
async fn test_same_queue_runs_in_index_order() {
    let h = harness(ScriptedRenderer::default());
    let s = &h.scheduler;
    let q = s
        .create_queue("Order".into(), None, vec![reference_scene(3), reference_scene(1), reference_scene(2)])
        .await;
    s.run_all(q.id).await.unwrap();
    assert!(wait_until(WAIT, || s.queue(q.id).unwrap().status == QueueStatus::Done).await);

    let seeds: Vec<String> = (0..3).map(|i| h.renderer.arg_after(i, "--seed").unwrap()).collect();
    assert_eq!(seeds, vec!["3", "1", "2"]);
}

#[tokio::test]
async fn test_failure_cancels_rest_of_queue() {
    let h = harness(ScriptedRenderer::default());
    let s = &h.scheduler;
    let q = s
        .create_queue(
            "Fails".into(),
            None,
            vec![reference_scene(1), reference_scene(FAILING_SEED), reference_scene(3)],
        )
        .await;
    s.run_all(q.id).await.unwrap();

    assert!(wait_until(WAIT, || s.queue(q.id).unwrap().status == QueueStatus::Error).await);
    let queue = s.queue(q.id).unwrap();
    let statuses: Vec<JobStatus> = queue.jobs.iter().map(|j| j.status).collect();
    assert_eq!(statuses, vec![JobStatus::Done, JobStatus::Error, JobStatus::Idle]);
    assert!(queue.jobs[1].error.as_deref().unwrap().contains("CUDA out of memory"));

    // Nothing else gets dispatched once the worker drains
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.renderer.call_count(), 2);
    assert_eq!(s.status().ready, 0);
}

#[tokio::test]
async fn test_prev_resolves_to_output_at_dispatch() {
    let h = harness(ScriptedRenderer::default());
    let s = &h.scheduler;
    let q = s
        .create_queue(
            "Chain".into(),
            None,
            vec![reference_scene(1), extension_scene(2, "{{prev}}"), extension_scene(3, "{{job:0}}")],
        )
        .await;

    // Stored form keeps the token
    let stored = s.queue(q.id).unwrap();
    assert_eq!(
        stored.jobs[1].task.input_video().map(|r| r.as_str()),
        Some("{{prev}}")
    );

    s.run_all(q.id).await.unwrap();
    assert!(wait_until(WAIT, || s.queue(q.id).unwrap().status == QueueStatus::Done).await);

    let queue = s.queue(q.id).unwrap();
    let first = queue.jobs[0].output.clone().unwrap();
    let second = queue.jobs[1].output.clone().unwrap();
    assert!(first.starts_with("result/reference_to_video/"));
    assert_eq!(h.renderer.arg_after(1, "--input_video"), Some(first.clone()));
    assert_eq!(h.renderer.arg_after(2, "--input_video"), Some(first));
    assert_ne!(second, queue.jobs[0].output.clone().unwrap());

    // The token itself is never rewritten in storage
    assert_eq!(
        queue.jobs[1].task.input_video().map(|r| r.as_str()),
        Some("{{prev}}")
    );
}

#[tokio::test]
async fn test_unresolved_reference_passes_through_by_default() {
    let h = harness(ScriptedRenderer::default());
    let s = &h.scheduler;
    let q = s
        .create_queue("Alone".into(), None, vec![extension_scene(5, "{{prev}}")])
        .await;
    s.run_all(q.id).await.unwrap();
    assert!(wait_until(WAIT, || s.queue(q.id).unwrap().status == QueueStatus::Done).await);
    assert_eq!(h.renderer.arg_after(0, "--input_video").as_deref(), Some("{{prev}}"));
}

#[tokio::test]
async fn test_strict_references_fail_without_rendering() {
    let h = harness_with(ScriptedRenderer::default(), |c| c.strict_references = true);
    let s = &h.scheduler;
    let q = s
        .create_queue("Strict".into(), None, vec![extension_scene(5, "{{job:7}}")])
        .await;
    s.run_all(q.id).await.unwrap();

    assert!(wait_until(WAIT, || s.queue(q.id).unwrap().status == QueueStatus::Error).await);
    let job = s.queue(q.id).unwrap().jobs[0].clone();
    assert!(job.error.unwrap().contains("{{job:7}}"));
    assert_eq!(h.renderer.call_count(), 0);
}

#[tokio::test]
async fn test_snapshot_never_records_in_flight_states() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(ScriptedRenderer::gated(gate.clone()));
    let s = &h.scheduler;
    let q = s
        .create_queue("Persist".into(), None, vec![reference_scene(1), reference_scene(2)])
        .await;
    s.run_all(q.id).await.unwrap();
    assert!(wait_until(WAIT, || s.running_count() == 1).await);

    // Any mutation writes the snapshot while a job is running
    s.set_background_audio(q.id, "music/theme.mp3").await.unwrap();

    let raw = std::fs::read_to_string(h.config.snapshot_path()).unwrap();
    assert!(!raw.contains("\"running\""));
    assert!(!raw.contains("\"pending\""));

    let reloaded = SnapshotStore::new(h.config.snapshot_path()).load().await.unwrap();
    assert_eq!(reloaded[0].status, QueueStatus::Idle);
    assert!(reloaded[0].jobs.iter().all(|j| j.status == JobStatus::Idle));

    gate.add_permits(2);
    assert!(wait_until(WAIT, || s.queue(q.id).unwrap().status == QueueStatus::Done).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let reloaded = SnapshotStore::new(h.config.snapshot_path()).load().await.unwrap();
    assert!(reloaded[0].jobs.iter().all(|j| j.status == JobStatus::Done));
}

#[tokio::test]
async fn test_cancel_pending_scene() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(ScriptedRenderer::gated(gate.clone()));
    let s = &h.scheduler;
    let q = s
        .create_queue("Cancel".into(), None, vec![reference_scene(1), reference_scene(2)])
        .await;
    let ids: Vec<u64> = q.jobs.iter().map(|j| j.id).collect();
    s.run_all(q.id).await.unwrap();
    assert!(wait_until(WAIT, || s.running_count() == 1).await);

    assert!(matches!(s.cancel(q.id, ids[0]).await, Err(RegistryError::Conflict(_))));
    tokio_test::assert_ok!(s.cancel(q.id, ids[1]).await);

    gate.add_permits(1);
    assert!(wait_until(WAIT, || s.queue(q.id).unwrap().status == QueueStatus::Idle).await);
    let queue = s.queue(q.id).unwrap();
    assert_eq!(queue.jobs[0].status, JobStatus::Done);
    assert_eq!(queue.jobs[1].status, JobStatus::Idle);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.renderer.call_count(), 1);
}

#[tokio::test]
async fn test_background_edit_keeps_done_but_prompt_edit_resets() {
    let h = harness(ScriptedRenderer::default());
    let s = &h.scheduler;
    let q = s.create_queue("Edit".into(), None, vec![reference_scene(1)]).await;
    let id = q.jobs[0].id;
    s.run_all(q.id).await.unwrap();
    assert!(wait_until(WAIT, || s.queue(q.id).unwrap().status == QueueStatus::Done).await);
    tokio_test::assert_err!(s.run_all(q.id).await);

    let reset = s
        .patch_job(q.id, id, JobPatch { audio_bg: Some("music/rain.mp3".into()), ..JobPatch::default() })
        .await
        .unwrap();
    assert!(!reset);
    assert_eq!(s.queue(q.id).unwrap().jobs[0].status, JobStatus::Done);

    let reset = s
        .patch_job(q.id, id, JobPatch { prompt: Some("a storm rolls in".into()), ..JobPatch::default() })
        .await
        .unwrap();
    assert!(reset);
    let queue = s.queue(q.id).unwrap();
    assert_eq!(queue.jobs[0].status, JobStatus::Idle);
    assert!(queue.jobs[0].output.is_none());
    assert_eq!(queue.status, QueueStatus::Idle);
}

#[tokio::test]
async fn test_reset_reruns_only_failed_scenes() {
    let h = harness(ScriptedRenderer::default());
    let s = &h.scheduler;
    let q = s
        .create_queue("Retry".into(), None, vec![reference_scene(1), reference_scene(FAILING_SEED)])
        .await;
    let ids: Vec<u64> = q.jobs.iter().map(|j| j.id).collect();
    s.run_all(q.id).await.unwrap();
    assert!(wait_until(WAIT, || s.queue(q.id).unwrap().status == QueueStatus::Error).await);

    s.patch_job(q.id, ids[1], JobPatch { seed: Some(2), ..JobPatch::default() })
        .await
        .unwrap();
    assert_eq!(s.reset(q.id).await.unwrap(), 1);
    assert!(wait_until(WAIT, || s.queue(q.id).unwrap().status == QueueStatus::Done).await);
    assert_eq!(h.renderer.call_count(), 3);
    assert_eq!(h.renderer.arg_after(2, "--seed").as_deref(), Some("2"));
}

#[tokio::test]
async fn test_standalone_job_runs_and_writes_sidecar() {
    let h = harness(ScriptedRenderer::default());
    let s = &h.scheduler;
    let job = s.submit_standalone(scene(serde_json::json!({
        "task_type": "talking_avatar",
        "input_image": "uploads/face.png",
        "input_audio": "audios/line.wav"
    })));
    assert_eq!(job.status, JobStatus::Pending);

    assert!(
        wait_until(WAIT, || {
            s.standalone_jobs()
                .iter()
                .any(|j| j.id == job.id && j.status == JobStatus::Done)
        })
        .await
    );
    let done = s.standalone_jobs().into_iter().find(|j| j.id == job.id).unwrap();
    let output = h.config.resolve(done.output.unwrap());
    let sidecar: serde_json::Value =
        serde_json::from_slice(&std::fs::read(output.with_extension("json")).unwrap()).unwrap();
    assert_eq!(sidecar["task_type"], "talking_avatar");
    assert_eq!(sidecar["resolution"], "480P");
    assert!(sidecar.get("generated_at").is_some());
    assert!(h.dir.path().exists());
}

#[tokio::test]
async fn test_import_then_run() {
    let h = harness(ScriptedRenderer::default());
    let s = &h.scheduler;
    let q = s
        .import_queue(
            "Imported".into(),
            Some("Lumi".into()),
            "## One\n- task_type: reference_to_video\n- seed: 4\n\n## Two\n- task_type: shot_switching_extension\n- input_video: {{prev}}\n",
        )
        .await
        .unwrap();
    assert_eq!(q.jobs.len(), 2);
    assert_eq!(q.ep_code.as_deref(), Some("EP001"));

    s.run_all(q.id).await.unwrap();
    assert!(wait_until(WAIT, || s.queue(q.id).unwrap().status == QueueStatus::Done).await);
    let queue = s.queue(q.id).unwrap();
    assert_eq!(h.renderer.arg_after(1, "--input_video"), queue.jobs[0].output.clone());
}

#[tokio::test]
async fn test_cancel_and_clear_standalone_jobs() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(ScriptedRenderer::gated(gate.clone()));
    let s = &h.scheduler;
    let first = s.submit_standalone(reference_scene(1));
    let second = s.submit_standalone(reference_scene(2));
    assert!(wait_until(WAIT, || s.running_count() == 1).await);

    assert!(matches!(
        s.cancel_standalone(first.id),
        Err(SchedulerError::StandaloneRunning(id)) if id == first.id
    ));
    let removed = s.cancel_standalone(second.id).unwrap();
    assert_eq!(removed.status, JobStatus::Pending);
    assert!(matches!(
        s.cancel_standalone(second.id),
        Err(SchedulerError::StandaloneNotFound(_))
    ));
    assert_eq!(s.status().ready, 0);

    gate.add_permits(1);
    assert!(
        wait_until(WAIT, || {
            s.standalone_jobs()
                .iter()
                .all(|j| j.status == JobStatus::Done)
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.renderer.call_count(), 1);
    assert_eq!(s.standalone_jobs().len(), 1);

    assert_eq!(s.clear_finished_standalone(), 1);
    assert!(s.standalone_jobs().is_empty());
    assert_eq!(s.clear_finished_standalone(), 0);
}

#[tokio::test]
async fn test_remix_waits_for_render_in_flight() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(ScriptedRenderer::gated(gate.clone()));
    let q = h
        .scheduler
        .create_queue("Busy".into(), None, vec![reference_scene(1)])
        .await;
    h.scheduler.run_all(q.id).await.unwrap();
    assert!(wait_until(WAIT, || h.scheduler.running_count() == 1).await);

    let scheduler = Arc::clone(&h.scheduler);
    let remix = tokio::spawn(async move { scheduler.remix(q.id).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!remix.is_finished());

    gate.add_permits(1);
    let report = tokio::time::timeout(WAIT, remix).await.unwrap().unwrap().unwrap();
    assert_eq!(report.mixed, 0);
    assert!(report.errors.is_empty());
}
