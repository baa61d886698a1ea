//! Worker-side execution tests: frame streaming, the exit-code frame
//! contract, and the gRPC service end to end.

mod test_harness;

use std::time::Duration;

use cronmesh::catalog::TaskKind;
use cronmesh::proto::worker_client::WorkerClient;
use cronmesh::proto::TaskReq;
use cronmesh::worker::executor::{exit_code_frame, parse_exit_code, DEFAULT_EXIT_CODE};
use test_harness::{collect_frames, spawn_worker};

fn shell_payload(command: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "command": command })).unwrap()
}

#[test]
fn test_exit_code_frame_layout() {
    assert_eq!(exit_code_frame(0), b"    0".to_vec());
    assert_eq!(exit_code_frame(2), b"    2".to_vec());
    assert_eq!(exit_code_frame(-1), b"   -1".to_vec());
    assert_eq!(exit_code_frame(12345), b"12345".to_vec());

    assert_eq!(parse_exit_code(b"    0"), Some(0));
    assert_eq!(parse_exit_code(b"   -1"), Some(-1));
    // the code rides on the tail of a larger final frame
    assert_eq!(parse_exit_code(b"ok\n    7"), Some(7));
    assert_eq!(parse_exit_code(b"abc"), None);
    assert_eq!(parse_exit_code(b"xxxxx"), None);
}

#[test]
fn test_exit_code_roundtrip() {
    for code in [0, 1, 2, 7, 127, -1] {
        assert_eq!(parse_exit_code(&exit_code_frame(code)), Some(code));
    }
}

#[tokio::test]
async fn test_shell_streams_output_then_code() {
    let frames = collect_frames(TaskKind::Shell, shell_payload("echo hello; echo world")).await;

    assert!(frames.len() >= 3);
    let joined: String = frames[..frames.len() - 1]
        .iter()
        .map(|f| String::from_utf8_lossy(f))
        .collect();
    assert!(joined.contains("hello\n"));
    assert!(joined.contains("world\n"));
    assert_eq!(frames.last().unwrap(), &exit_code_frame(0));
}

#[tokio::test]
async fn test_shell_reports_nonzero_exit() {
    let frames = collect_frames(TaskKind::Shell, shell_payload("echo bad; exit 3")).await;
    assert_eq!(frames.last().unwrap(), &exit_code_frame(3));
}

#[tokio::test]
async fn test_shell_captures_stderr() {
    let frames = collect_frames(TaskKind::Shell, shell_payload("echo oops >&2; exit 1")).await;
    let joined: String = frames
        .iter()
        .map(|f| String::from_utf8_lossy(f))
        .collect();
    assert!(joined.contains("oops\n"));
    assert_eq!(frames.last().unwrap(), &exit_code_frame(1));
}

#[tokio::test]
async fn test_malformed_payload_reports_default_code() {
    let frames = collect_frames(TaskKind::Shell, b"not json".to_vec()).await;
    assert_eq!(frames.last().unwrap(), &exit_code_frame(DEFAULT_EXIT_CODE));
}

/// Full round trip through the gRPC service: N output frames in worker
/// order, then the exit-code frame.
#[tokio::test]
async fn test_service_streams_frames_in_order() {
    let worker = spawn_worker(54151).await;
    let mut client = WorkerClient::connect(format!("http://{}", worker.addr))
        .await
        .unwrap();

    let request = TaskReq {
        task_id: "t1".to_string(),
        kind: TaskKind::Shell.code(),
        payload: shell_payload("echo one; echo two; echo three"),
    };
    let mut stream = client
        .run_task(tonic::Request::new(request))
        .await
        .unwrap()
        .into_inner();

    let mut frames = Vec::new();
    while let Some(frame) = stream.message().await.unwrap() {
        frames.push(frame.resp);
    }

    let output: Vec<String> = frames
        .iter()
        .map(|f| String::from_utf8_lossy(f).to_string())
        .collect();
    let one = output.iter().position(|f| f == "one\n").unwrap();
    let two = output.iter().position(|f| f == "two\n").unwrap();
    let three = output.iter().position(|f| f == "three\n").unwrap();
    assert!(one < two && two < three);

    let last = frames.last().unwrap();
    assert_eq!(parse_exit_code(last), Some(0));
}

#[tokio::test]
async fn test_service_rejects_unknown_kind() {
    let worker = spawn_worker(54152).await;
    let mut client = WorkerClient::connect(format!("http://{}", worker.addr))
        .await
        .unwrap();

    let request = TaskReq {
        task_id: "t1".to_string(),
        kind: 99,
        payload: Vec::new(),
    };
    let status = client
        .run_task(tonic::Request::new(request))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn test_api_task_reports_http_failure_code() {
    // nothing listens here; the api task fails with the default code
    let payload =
        serde_json::to_vec(&serde_json::json!({ "url": "http://127.0.0.1:54199/health" })).unwrap();
    let frames = tokio::time::timeout(
        Duration::from_secs(10),
        collect_frames(TaskKind::Api, payload),
    )
    .await
    .unwrap();
    assert_eq!(frames.last().unwrap(), &exit_code_frame(DEFAULT_EXIT_CODE));
}
