//! End-to-end tests driving the processor into a filesystem client

use annotee::annotation::{StepSnapshot, StepStatus};
use annotee::link::ViewerLinkGenerator;
use annotee::processor::MeterPolicy;
use annotee::stream::FilesystemClient;
use annotee::{Processor, ProcessorOptions, Stream, StreamName};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const BUILD_OUTPUT: &str = "\
checking out
@@@SEED_STEP test@@@
@@@BUILD_STEP compile@@@
cc -c main.c
@@@STEP_TEXT@2 files@@@
@@@BUILD_STEP test@@@
@@@STEP_LOG_LINE@results@PASS a@@@
@@@STEP_LOG_LINE@results@FAIL b@@@
@@@STEP_LOG_END@results@@@
@@@STEP_FAILURE@@@
1 of 2 tests failed
@@@STEP_CLOSED@@@
cleaning up
";

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
        .lines()
        .map(str::to_string)
        .collect()
}

fn processor(dir: &TempDir, links: bool) -> Processor {
    let client = FilesystemClient::new(dir.path());
    let mut options = ProcessorOptions::new(StreamName::new("annotee").unwrap(), Arc::new(client));
    options.meter = MeterPolicy::EndpointsOnly;
    if links {
        options.link_generator = Some(Arc::new(ViewerLinkGenerator::new(
            "logs.example.com",
            "ci",
            "build/1",
        )));
    }
    Processor::new(options)
}

#[tokio::test]
async fn test_build_output_is_split_into_step_files() {
    let dir = TempDir::new().unwrap();
    let processor = processor(&dir, false);

    processor
        .run_streams(vec![
            Stream::new(StreamName::new("stdout").unwrap(), BUILD_OUTPUT.as_bytes()).annotate(true),
        ])
        .await
        .unwrap();
    let snapshot = processor.finish().await;

    let root = dir.path().join("annotee");
    assert_eq!(
        read_lines(&root.join("stdout.txt")),
        vec![
            "checking out",
            "@@@SEED_STEP test@@@",
            "@@@STEP_CLOSED@@@",
            "cleaning up"
        ]
    );
    assert_eq!(
        read_lines(&root.join("steps/compile/stdout.txt")),
        vec!["@@@BUILD_STEP compile@@@", "cc -c main.c", "@@@STEP_TEXT@2 files@@@"]
    );
    assert_eq!(
        read_lines(&root.join("steps/test/logs/results.txt")),
        vec!["PASS a", "FAIL b"]
    );
    assert!(root.join("steps/test/logs/results.properties.json").exists());

    // The seeded step was adopted by BUILD_STEP rather than duplicated
    assert_eq!(snapshot.steps.len(), 3);
    let test = snapshot.step("annotee/steps/test").unwrap();
    assert_eq!(test.status, StepStatus::Failure);
    assert_eq!(test.logs.len(), 1);

    let published = read_lines(&root.join("steps/test/annotations.datagrams"));
    let last: StepSnapshot = serde_json::from_str(published.last().unwrap()).unwrap();
    assert_eq!(last.status, StepStatus::Failure);
    assert!(last.ended.is_some());

    let published = read_lines(&root.join("annotations.datagrams"));
    let last: StepSnapshot = serde_json::from_str(published.last().unwrap()).unwrap();
    assert_eq!(last.substeps.len(), 2);
}

#[tokio::test]
async fn test_links_point_at_new_streams() {
    let dir = TempDir::new().unwrap();
    let processor = processor(&dir, true);

    processor
        .run_streams(vec![
            Stream::new(StreamName::new("stdout").unwrap(), BUILD_OUTPUT.as_bytes()).annotate(true),
        ])
        .await
        .unwrap();
    processor.finish().await;

    let lines = read_lines(&dir.path().join("annotee/steps/test/stdout.txt"));
    let link_index = lines
        .iter()
        .position(|l| l.starts_with("@@@STEP_LINK@logdog-->results@https://logs.example.com/v/?s="))
        .expect("log link injected");
    assert_eq!(lines[link_index + 1], "@@@STEP_LOG_LINE@results@PASS a@@@");
}

#[tokio::test]
async fn test_stderr_without_annotations_stays_on_root() {
    let dir = TempDir::new().unwrap();
    let processor = processor(&dir, false);

    processor
        .run_streams(vec![
            Stream::new(StreamName::new("stdout").unwrap(), BUILD_OUTPUT.as_bytes()).annotate(true),
            Stream::new(
                StreamName::new("stderr").unwrap(),
                &b"warning: unused variable\n@@@BUILD_STEP sneaky@@@\n"[..],
            ),
        ])
        .await
        .unwrap();
    let snapshot = processor.finish().await;

    assert_eq!(
        read_lines(&dir.path().join("annotee/stderr.txt")),
        vec!["warning: unused variable", "@@@BUILD_STEP sneaky@@@"]
    );
    assert!(snapshot.step("annotee/steps/sneaky").is_none());
}
