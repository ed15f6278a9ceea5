// tests/scenarios.rs

use hpctest::types::{PerfFailureMode, Stage, TestStatus};
use hpctest_test_utils::builders::{partition, ConfigFileBuilder, TestConfigBuilder};
use hpctest_test_utils::fake_backend::JobScript;
use hpctest_test_utils::harness::Harness;
use hpctest_test_utils::{init_tracing, with_timeout};

use std::sync::Arc;
use std::time::Duration;

use hpctest::dag::TestCaseId;
use hpctest::job::batch::Slurm;
use hpctest::job::{BatchOptions, BatchQueueBackend};
use hpctest::types::BackendKind;
use hpctest_test_utils::fake_runner::ScriptedRunner;

const A: &str = "a @p+e";
const B: &str = "b @p+e";

#[tokio::test]
async fn failed_build_skips_dependents_without_running_them() {
    init_tracing();

    let h = Harness::new(
        ConfigFileBuilder::new()
            .with_test(TestConfigBuilder::new("a", "./a.out").build_cmd("make").build())
            .with_test(TestConfigBuilder::new("b", "./b.out").depends_on("a").build()),
    );
    h.backend.script_build("a", JobScript::fail(2));

    let (report, trace) = with_timeout(h.run()).await;

    let a = report.result(A).expect("a reported");
    assert_eq!(a.status, TestStatus::Fail);
    assert_eq!(a.stage, Some(Stage::Compile));
    assert!(a.reason.as_deref().unwrap_or("").contains("exited with code 2"), "{a:?}");

    let b = report.result(B).expect("b reported");
    assert_eq!(b.status, TestStatus::Skip);
    assert_eq!(b.attempts, 0);
    assert!(b.reason.as_deref().unwrap_or("").contains("did not pass"), "{b:?}");

    assert!(h.backend.submitted_tests().is_empty(), "no run job may be submitted");
    assert_eq!(trace.admissions, vec![TestCaseId(0)]);
    assert!(!report.all_passed());
}

#[tokio::test]
async fn global_limit_bounds_concurrency_and_admission_follows_declaration() {
    init_tracing();

    let h = Harness::new(
        ConfigFileBuilder::new()
            .max_jobs(2)
            .with_test(TestConfigBuilder::new("x", "./x").build())
            .with_test(TestConfigBuilder::new("y", "./y").build())
            .with_test(TestConfigBuilder::new("z", "./z").build()),
    );
    for t in ["x", "y", "z"] {
        h.backend.script(t, JobScript::running_for(3));
    }

    let (report, trace) = with_timeout(h.run()).await;

    assert!(report.all_passed(), "{}", report.render_summary());
    assert_eq!(trace.max_running, 2);
    assert_eq!(
        trace.admissions,
        vec![TestCaseId(0), TestCaseId(1), TestCaseId(2)]
    );
    assert_eq!(h.backend.submitted_tests(), vec!["x", "y", "z"]);
}

#[tokio::test]
async fn partition_limit_bounds_concurrency_on_that_partition() {
    init_tracing();

    let h = Harness::new(
        ConfigFileBuilder::new()
            .max_jobs(8)
            .with_partition("q", partition(BackendKind::Local, Some(1)))
            .with_test(TestConfigBuilder::new("x", "./x").partitions(&["q"]).build())
            .with_test(TestConfigBuilder::new("y", "./y").partitions(&["q"]).build())
            .with_test(TestConfigBuilder::new("z", "./z").partitions(&["q"]).build()),
    );
    for t in ["x", "y", "z"] {
        h.backend.script(t, JobScript::running_for(2));
    }

    let (report, trace) = with_timeout(h.run()).await;

    assert_eq!(report.summary.pass, 3);
    assert_eq!(trace.max_running, 1);
}

#[tokio::test]
async fn wall_time_limit_cancels_the_job_and_fails_at_wait() {
    init_tracing();

    let h = Harness::new(
        ConfigFileBuilder::new()
            .with_test(TestConfigBuilder::new("slow", "./slow").time_limit("50ms").build()),
    );
    h.backend.script("slow", JobScript::running_forever());

    let (report, trace) = with_timeout(h.run()).await;

    let slow = report.result("slow @p+e").expect("reported");
    assert_eq!(slow.status, TestStatus::Fail);
    assert_eq!(slow.stage, Some(Stage::Wait));
    assert!(slow.reason.as_deref().unwrap_or("").contains("timed out"), "{slow:?}");

    assert_eq!(h.backend.cancelled(), vec!["slow_p_e"]);
    assert_eq!(trace.attempts.len(), 1);
    assert_eq!(trace.attempts[0].cleanup_runs, 1);
    assert_eq!(trace.attempts[0].stages.last(), Some(&Stage::Cleanup));
}

#[tokio::test]
async fn job_that_never_leaves_the_queue_hits_the_pending_timeout() {
    init_tracing();

    let h = Harness::new(
        ConfigFileBuilder::new()
            .max_pending_time("40ms")
            .with_test(TestConfigBuilder::new("held", "./held").time_limit("50ms").build())
            .with_test(TestConfigBuilder::new("next", "./next").depends_on("held").build()),
    );
    h.backend.script("held", JobScript::queued_forever());

    let (report, trace) = with_timeout(h.run()).await;

    let held = report.result("held @p+e").expect("reported");
    assert_eq!(held.status, TestStatus::Fail);
    assert_eq!(held.stage, Some(Stage::Wait));
    assert!(held.reason.as_deref().unwrap_or("").contains("pending timeout"), "{held:?}");
    assert_eq!(report.result("next @p+e").expect("reported").status, TestStatus::Skip);

    assert_eq!(h.backend.cancelled(), vec!["held_p_e"]);
    assert_eq!(h.backend.finalized(), vec!["held_p_e"]);
    assert_eq!(trace.attempts[0].cleanup_runs, 1);
}

#[tokio::test]
async fn batch_queue_query_failures_are_retried_until_the_job_passes() {
    init_tracing();

    let runner = Arc::new(ScriptedRunner::new());
    runner
        .reply("sbatch", 0, "Submitted batch job 4711\n")
        .reply("sacct", 1, "")
        .reply("sacct", 1, "")
        .reply("sacct", 0, "4711|COMPLETED|0:0\n");
    let slurm = BatchQueueBackend::new(
        Box::new(Slurm),
        runner.clone(),
        BatchOptions {
            poll_retries: 3,
            retry_delay: Duration::from_millis(1),
            cache_ttl: Duration::ZERO,
        },
    );

    let h = Harness::new(
        ConfigFileBuilder::new()
            .with_partition("daint", partition(BackendKind::Slurm, None))
            .with_test(TestConfigBuilder::new("stream", "./stream").partitions(&["daint"]).build()),
    )
    .with_partition_backend("daint", Arc::new(slurm));

    let (report, _) = with_timeout(h.run()).await;

    let stream = report.result("stream @daint+e").expect("reported");
    assert_eq!(stream.status, TestStatus::Pass, "{stream:?}");
    assert_eq!(stream.attempts, 1);
    assert_eq!(runner.calls_to("sbatch"), 1);
    assert_eq!(runner.calls_to("sacct"), 3);
    assert_eq!(runner.calls_to("scancel"), 0);
}

#[tokio::test]
async fn cleanup_runs_once_per_attempt_on_every_path() {
    init_tracing();

    let h = Harness::new(
        ConfigFileBuilder::new()
            .with_test(TestConfigBuilder::new("ok", "./ok").build())
            .with_test(TestConfigBuilder::new("bad_build", "./x").build_cmd("make").build())
            .with_test(TestConfigBuilder::new("bad_run", "./x").build())
            .with_test(TestConfigBuilder::new("bad_out", "./x").sanity("PASSED").build()),
    );
    h.backend.script_build("bad_build", JobScript::fail(1));
    h.backend.script("bad_run", JobScript::fail(3));
    h.backend.script("bad_out", JobScript::succeed().with_stdout("FAILED\n"));

    let (report, trace) = with_timeout(h.run()).await;

    assert_eq!(report.summary.pass, 1);
    assert_eq!(report.summary.fail, 3);
    assert_eq!(trace.attempts.len(), 4);
    for attempt in &trace.attempts {
        assert_eq!(attempt.cleanup_runs, 1, "{attempt:?}");
        assert_eq!(attempt.stages.first(), Some(&Stage::Setup));
        assert_eq!(attempt.stages.last(), Some(&Stage::Cleanup));
    }

    let stage_of = |id: &str| report.result(id).and_then(|r| r.stage);
    assert_eq!(stage_of("ok @p+e"), Some(Stage::Cleanup));
    assert_eq!(stage_of("bad_build @p+e"), Some(Stage::Compile));
    assert_eq!(stage_of("bad_run @p+e"), Some(Stage::Wait));
    assert_eq!(stage_of("bad_out @p+e"), Some(Stage::Sanity));
}

#[tokio::test]
async fn passing_test_keeps_output_and_drops_stage_dir() {
    init_tracing();

    let h = Harness::new(
        ConfigFileBuilder::new().with_test(
            TestConfigBuilder::new("hello", "./hello")
                .sanity(r"Hello, \w+")
                .build(),
        ),
    );
    h.backend
        .script("hello", JobScript::succeed().with_stdout("Hello, cluster\n"));

    let (report, _) = with_timeout(h.run()).await;

    let r = report.result("hello @p+e").expect("reported");
    assert_eq!(r.status, TestStatus::Pass);
    assert_eq!(r.attempts, 1);

    let output_dir = h.root().join("output/p/e/hello");
    assert_eq!(r.output_dir.as_deref(), Some(output_dir.as_path()));
    assert_eq!(r.stdout.as_deref(), Some(output_dir.join("hello_p_e.out").as_path()));
    let copied = std::fs::read_to_string(output_dir.join("hello_p_e.out")).expect("stdout copied");
    assert_eq!(copied, "Hello, cluster\n");
    assert!(!h.root().join("stage/p/e/hello").exists());
}

#[tokio::test]
async fn retryable_test_gets_fresh_attempt_directories() {
    init_tracing();

    let h = Harness::new(
        ConfigFileBuilder::new()
            .max_retries(2)
            .with_test(TestConfigBuilder::new("flaky", "./flaky").retryable().build())
            .with_test(TestConfigBuilder::new("solid", "./solid").build()),
    );
    h.backend.script("flaky", JobScript::fail(1));
    h.backend.script("solid", JobScript::fail(1));

    let (report, trace) = with_timeout(h.run()).await;

    let flaky = report.result("flaky @p+e").expect("reported");
    assert_eq!(flaky.status, TestStatus::Fail);
    assert_eq!(flaky.attempts, 3);
    assert_eq!(h.backend.submissions_of("flaky"), 3);
    assert_eq!(
        flaky.output_dir.as_deref(),
        Some(h.root().join("output/p/e/flaky_retry2").as_path())
    );
    for dir in ["flaky", "flaky_retry1", "flaky_retry2"] {
        assert!(h.root().join("output/p/e").join(dir).is_dir(), "{dir}");
    }

    let solid = report.result("solid @p+e").expect("reported");
    assert_eq!(solid.attempts, 1);
    assert_eq!(h.backend.submissions_of("solid"), 1);

    let flaky_attempts: Vec<u32> = trace
        .attempts
        .iter()
        .filter(|a| a.case == TestCaseId(0))
        .map(|a| a.attempt)
        .collect();
    assert_eq!(flaky_attempts, vec![1, 2, 3]);
}

#[tokio::test]
async fn rejected_submissions_are_retried_with_backoff() {
    init_tracing();

    let h = Harness::new(
        ConfigFileBuilder::new()
            .submission_retries(3)
            .with_test(TestConfigBuilder::new("queued", "./q").build()),
    );
    h.backend
        .script("queued", JobScript::succeed().with_rejected_submissions(2));

    let (report, _) = with_timeout(h.run()).await;

    assert_eq!(report.result("queued @p+e").map(|r| r.status), Some(TestStatus::Pass));
    assert_eq!(h.backend.submissions_of("queued"), 1);
}

#[tokio::test]
async fn exhausted_submission_retries_fail_at_run() {
    init_tracing();

    let h = Harness::new(
        ConfigFileBuilder::new()
            .submission_retries(1)
            .with_test(TestConfigBuilder::new("rejected", "./r").build()),
    );
    h.backend
        .script("rejected", JobScript::succeed().with_rejected_submissions(5));

    let (report, _) = with_timeout(h.run()).await;

    let r = report.result("rejected @p+e").expect("reported");
    assert_eq!(r.status, TestStatus::Fail);
    assert_eq!(r.stage, Some(Stage::Run));
    assert!(
        r.reason.as_deref().unwrap_or("").contains("after 2 attempts"),
        "{r:?}"
    );
    assert_eq!(h.backend.submissions_of("rejected"), 0);
}

#[tokio::test]
async fn poll_error_fails_the_test_at_wait() {
    init_tracing();

    let h = Harness::new(
        ConfigFileBuilder::new().with_test(TestConfigBuilder::new("lost", "./l").build()),
    );
    h.backend.script("lost", JobScript::succeed().with_poll_errors(1));

    let (report, trace) = with_timeout(h.run()).await;

    let r = report.result("lost @p+e").expect("reported");
    assert_eq!(r.status, TestStatus::Fail);
    assert_eq!(r.stage, Some(Stage::Wait));
    assert_eq!(trace.attempts[0].cleanup_runs, 1);
}

#[tokio::test]
async fn performance_failure_mode_decides_the_status() {
    init_tracing();

    for (mode, expected) in [
        (PerfFailureMode::Fail, TestStatus::Fail),
        (PerfFailureMode::Warn, TestStatus::Pass),
    ] {
        let h = Harness::new(
            ConfigFileBuilder::new().perf_failure(mode).with_test(
                TestConfigBuilder::new("stream", "./stream")
                    .perf("triad", r"Triad:\s+(\S+)", 100.0, -0.1, 0.1)
                    .build(),
            ),
        );
        h.backend
            .script("stream", JobScript::succeed().with_stdout("Triad: 80.0\n"));

        let (report, _) = with_timeout(h.run()).await;

        let r = report.result("stream @p+e").expect("reported");
        assert_eq!(r.status, expected, "{mode:?}");
        assert_eq!(r.metrics.len(), 1);
        assert_eq!(r.metrics[0].value, 80.0);
        if expected == TestStatus::Fail {
            assert_eq!(r.stage, Some(Stage::Performance));
            assert!(r.reason.as_deref().unwrap_or("").contains("below lower bound"), "{r:?}");
        }
    }
}

#[tokio::test]
async fn admission_order_is_deterministic_across_runs() {
    init_tracing();

    let config = || {
        ConfigFileBuilder::new()
            .max_jobs(2)
            .with_test(TestConfigBuilder::new("root", "./r").build())
            .with_test(TestConfigBuilder::new("left", "./l").depends_on("root").build())
            .with_test(TestConfigBuilder::new("right", "./r").depends_on("root").build())
            .with_test(TestConfigBuilder::new("free", "./f").build())
            .with_test(
                TestConfigBuilder::new("join", "./j")
                    .depends_on("left")
                    .depends_on("right")
                    .build(),
            )
    };

    let mut admissions = Vec::new();
    for _ in 0..3 {
        let h = Harness::new(config());
        let (report, trace) = with_timeout(h.run()).await;
        assert!(report.all_passed(), "{}", report.render_summary());
        admissions.push(trace.admissions);
    }

    assert_eq!(admissions[0], admissions[1]);
    assert_eq!(admissions[1], admissions[2]);
    assert_eq!(admissions[0][..2], [TestCaseId(0), TestCaseId(3)]);
    assert_eq!(admissions[0].last(), Some(&TestCaseId(4)));
}
