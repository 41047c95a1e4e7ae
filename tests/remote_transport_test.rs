//! 远程执行器对 HTTP 守护进程的端到端行为（httpmock 模拟守护进程）

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use httpmock::prelude::*;
use serde_json::json;

use mobile_env::core::EnvError;
use mobile_env::device::{Action, Actuator, ControlChannel, RemoteActuator, RemoteTransport};

fn actuator(server: &MockServer, resize_to: Option<[u32; 2]>) -> RemoteActuator {
    let transport = RemoteTransport::new(server.base_url(), Duration::from_secs(5), Duration::from_secs(5), 3).unwrap();
    RemoteActuator::new(Arc::new(transport), resize_to)
}

fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

#[tokio::test]
async fn test_failed_request_is_retried_then_reported() {
    let server = MockServer::start_async().await;
    let act = server
        .mock_async(|when, then| {
            when.method(POST).path("/act").body_contains("\"action_type\":1");
            then.status(500);
        })
        .await;

    let device = actuator(&server, None);
    let err = device.send_action(&[Action::lift()]).await.unwrap_err();
    assert!(matches!(err, EnvError::Transport(msg) if msg.contains("act failed after 3 attempts")));
    act.assert_hits_async(3).await;
}

#[tokio::test]
async fn test_launch_then_restart_then_close() {
    let server = MockServer::start_async().await;
    let init = server
        .mock_async(|when, then| {
            when.method(POST).path("/init");
            then.status(200);
        })
        .await;
    let launch = server
        .mock_async(|when, then| {
            when.method(POST).path("/launch");
            then.status(200);
        })
        .await;
    let restart = server
        .mock_async(|when, then| {
            when.method(POST).path("/restart");
            then.status(200);
        })
        .await;
    let close = server
        .mock_async(|when, then| {
            when.method(POST).path("/close");
            then.status(200);
        })
        .await;

    let device = actuator(&server, None);
    assert!(!device.is_launched());
    assert!(device.uptime().is_none());

    device.launch().await.unwrap();
    assert!(device.is_launched());
    device.launch().await.unwrap();
    device.close().await.unwrap();
    assert!(!device.is_launched());

    init.assert_hits_async(1).await;
    launch.assert_hits_async(1).await;
    restart.assert_hits_async(1).await;
    close.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_observation_is_decoded_and_validated() {
    let server = MockServer::start_async().await;
    let pixels: Vec<u8> = (0..6).collect();
    let observ = server
        .mock_async(|when, then| {
            when.method(POST).path("/observ").json_body(json!({"resize_to": [2, 1]}));
            then.status(200)
                .json_body(json!({"img": b64(&pixels), "size": [2, 1], "time": 1700000000123i64}));
        })
        .await;

    let device = actuator(&server, Some([2, 1]));
    let observation = device.get_observation().await.unwrap();
    assert_eq!(observation.pixels.width, 2);
    assert_eq!(observation.pixels.height, 1);
    assert_eq!(&observation.pixels.data[..], &pixels[..]);
    assert_eq!(observation.timestamp, 1700000000123);
    assert!(observation.view_hierarchy.is_none());
    observ.assert_hits_async(1).await;

    // 像素数与尺寸不符
    let short = MockServer::start_async().await;
    short
        .mock_async(|when, then| {
            when.method(POST).path("/observ");
            then.status(200).json_body(json!({"img": b64(&[1, 2, 3]), "size": [2, 1], "time": 0}));
        })
        .await;
    let err = actuator(&short, None).get_observation().await.unwrap_err();
    assert!(matches!(err, EnvError::MalformedResponse(_)));
}

#[tokio::test]
async fn test_control_channel_decodes_adb_output() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/create_adbc");
            then.status(200).json_body(json!({"name": "emulator-5554", "id": 7}));
        })
        .await;
    let stack = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/adb")
                .body_contains("\"id\":7")
                .body_contains("\"stack\"");
            then.status(200).json_body(json!({
                "output": b64(b"  taskId=5: com.example/.Main bounds=[0,0][1080,1920] userId=0 visible=true\n")
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/adb").body_contains("\"size\"");
            then.status(200)
                .json_body(json!({"output": b64(b"Physical size: 1080x1920\nOverride size: 720x1280\n")}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/adb").body_contains("\"text\"");
            then.status(200).json_body(json!({"output": null}));
        })
        .await;

    let device = actuator(&server, None);
    let channel = device.create_control_channel().await.unwrap();
    assert_eq!(channel.current_activity().await.unwrap(), "com.example/.Main");
    assert_eq!(channel.screen_dimensions().await.unwrap(), (1280, 720));
    let out = channel
        .execute(
            &["shell".to_string(), "input".to_string(), "text".to_string()],
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(out, None);
    stack.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_log_stream_splits_lines_and_pushes_filters() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/create_logs");
            then.status(200).body("I/jd: first line\r\nI/jd: second line\npartial tail");
        })
        .await;
    let filters = server
        .mock_async(|when, then| {
            when.method(POST).path("/set_filts").json_body(json!({"filts": ["jd:V", "*:S"]}));
            then.status(200);
        })
        .await;

    let device = actuator(&server, None);
    let mut stream = device.get_log_stream().await.unwrap();
    stream
        .set_filters(&["jd:V".to_string(), "*:S".to_string()])
        .await
        .unwrap();
    filters.assert_hits_async(1).await;

    assert_eq!(stream.next_line().await.unwrap().as_deref(), Some("I/jd: first line"));
    assert_eq!(stream.next_line().await.unwrap().as_deref(), Some("I/jd: second line"));
    assert_eq!(stream.next_line().await.unwrap().as_deref(), Some("partial tail"));
    assert_eq!(stream.next_line().await.unwrap(), None);
}
