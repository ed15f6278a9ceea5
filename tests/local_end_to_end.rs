// tests/local_end_to_end.rs

#![cfg(unix)]

use std::fs;

use hpctest::cli::CliArgs;
use hpctest::types::{Stage, TestStatus};
use hpctest_test_utils::{init_tracing, with_timeout};

const CONFIG: &str = r#"
[config]
max_jobs = 2
poll_interval = "10ms"
default_time_limit = "30s"

[partition.login]
backend = "local"

[environment.gnu]
variables = { GREETING = "hello from gnu" }

[environment.clang]
variables = { GREETING = "hello from clang" }

[[test]]
name = "greet"
partitions = ["login"]
environments = ["gnu", "clang"]
sources = "src"
build_cmds = ["cp greet.sh app.sh", "chmod +x app.sh"]
cmd = "./app.sh"
sanity = "(?m)^hello from (gnu|clang)$"
keep_files = ["app.sh"]

[test.perf.elapsed]
pattern = 'elapsed=(\d+\.\d+)'
reference = 1.0
lower = -0.5
upper = 0.5
unit = "s"

[[test]]
name = "broken"
partitions = ["login"]
environments = ["gnu"]
cmd = "echo partial; exit 3"

[[test]]
name = "after_broken"
partitions = ["login"]
environments = ["gnu"]
cmd = "true"
depends_on = [{ test = "broken" }]

[[test]]
name = "after_greet"
partitions = ["login"]
environments = ["gnu", "clang"]
cmd = "echo $HPCTEST_TEST $HPCTEST_ENVIRON"
sanity = "after_greet (gnu|clang)"
depends_on = [{ test = "greet", kind = "by_env" }]
"#;

const GREET: &str = "#!/bin/sh\necho \"$GREETING\"\necho elapsed=1.2\n";

#[tokio::test]
async fn runs_real_processes_through_the_whole_pipeline() {
    init_tracing();

    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("src")).expect("mkdir src");
    fs::write(dir.path().join("src/greet.sh"), GREET).expect("write source");
    let config = dir.path().join("hpctest.toml");
    fs::write(&config, CONFIG).expect("write config");
    let report_path = dir.path().join("reports/run.json");

    let args = CliArgs {
        config: config.to_string_lossy().into_owned(),
        max_jobs: None,
        log_level: None,
        report: Some(report_path.to_string_lossy().into_owned()),
        dry_run: false,
    };

    let report = with_timeout(hpctest::run(args))
        .await
        .expect("run succeeds")
        .expect("not a dry run");

    for env in ["gnu", "clang"] {
        let greet = report.result(&format!("greet @login+{env}")).expect("greet");
        assert_eq!(greet.status, TestStatus::Pass, "{greet:?}");
        assert_eq!(greet.metrics.len(), 1);
        assert_eq!(greet.metrics[0].value, 1.2);

        let output = dir.path().join("output/login").join(env).join("greet");
        let stdout = fs::read_to_string(output.join(format!("greet_login_{env}.out")))
            .expect("stdout copied to output dir");
        assert!(stdout.contains(&format!("hello from {env}")), "{stdout}");
        assert!(output.join("app.sh").is_file(), "keep_files copied");
        assert!(output.join(format!("greet_login_{env}_build.out")).is_file());
        assert!(!dir.path().join("stage/login").join(env).join("greet").exists());

        let after = report
            .result(&format!("after_greet @login+{env}"))
            .expect("after_greet");
        assert_eq!(after.status, TestStatus::Pass, "{after:?}");
    }

    let broken = report.result("broken @login+gnu").expect("broken");
    assert_eq!(broken.status, TestStatus::Fail);
    assert_eq!(broken.stage, Some(Stage::Wait));
    assert!(broken.reason.as_deref().unwrap_or("").contains("code 3"), "{broken:?}");
    // Failed test cases keep their stage directory for inspection.
    assert!(dir.path().join("stage/login/gnu/broken").is_dir());

    let skipped = report.result("after_broken @login+gnu").expect("after_broken");
    assert_eq!(skipped.status, TestStatus::Skip);

    assert_eq!(report.summary.total, 6);
    assert_eq!(report.summary.pass, 4);
    assert_eq!(report.summary.fail, 1);
    assert_eq!(report.summary.skip, 1);

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report_path).expect("report written"))
            .expect("valid json");
    assert_eq!(json["summary"]["total"], 6);
    assert_eq!(json["results"][0]["status"], "pass");
}
