use serde_json::{Map, Value, json};
use serial_test::serial;
use std::time::{Duration, Instant};
use toolbridge::tool::FailureKind;
use toolbridge::{Bridge, BridgeError, BridgeState, ToolAdapter, ToolInvocation, ToolResult};

mod common;

fn args(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn tool<'a>(tools: &'a [ToolAdapter], name: &str) -> &'a ToolAdapter {
    tools.iter().find(|t| t.name() == name).unwrap()
}

#[tokio::test]
async fn test_search_returns_structured_output() {
    let (bridge, tools) = Bridge::connect(common::stub_params("normal"), common::fast_options())
        .await
        .unwrap();

    let result = tool(&tools, "search_flights")
        .call(
            args(json!({"origin": "Atlanta", "destination": "Las Vegas", "date": "2025-05-05"})),
            None,
        )
        .await
        .unwrap();

    let output = result.output().unwrap();
    assert_eq!(output.text(), "Found 2 flights from Atlanta to Las Vegas on 2025-05-05");
    let structured = output.structured_content.as_ref().unwrap();
    assert_eq!(structured["flights"].as_array().unwrap().len(), 2);
    assert_eq!(structured["flights"][0]["destination"], "Las Vegas");

    bridge.close().await;
}

#[tokio::test]
async fn test_concurrent_calls_resolve_by_id() {
    let (bridge, tools) = Bridge::connect(common::stub_params("normal"), common::fast_options())
        .await
        .unwrap();
    let delay = tool(&tools, "delay");

    let slow = async {
        let result = delay.call(args(json!({"ms": 600, "tag": "slow"})), None).await;
        (result, Instant::now())
    };
    let fast = async {
        let result = delay.call(args(json!({"ms": 50, "tag": "fast"})), None).await;
        (result, Instant::now())
    };
    let ((slow_result, slow_done), (fast_result, fast_done)) = tokio::join!(slow, fast);

    assert_eq!(slow_result.unwrap().output().unwrap().text(), "slow");
    assert_eq!(fast_result.unwrap().output().unwrap().text(), "fast");
    assert!(fast_done < slow_done);
    assert_eq!(bridge.in_flight(), 0);

    bridge.close().await;
}

#[tokio::test]
async fn test_timeout_is_failure_and_bridge_stays_usable() {
    let (bridge, tools) = Bridge::connect(common::stub_params("normal"), common::fast_options())
        .await
        .unwrap();

    let started = Instant::now();
    let result = tool(&tools, "hang")
        .call(Map::new(), Some(Duration::from_secs(1)))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    let failure = result.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3));
    assert_eq!(bridge.in_flight(), 0);

    let result = bridge
        .invoke(ToolInvocation::from_value(
            "search_flights",
            json!({"origin": "Atlanta", "destination": "Denver", "date": "2025-06-01"}),
        ))
        .await
        .unwrap();
    assert!(result.is_success());

    bridge.close().await;
}

#[tokio::test]
async fn test_tool_error_is_failure_result() {
    let (bridge, tools) = Bridge::connect(common::stub_params("normal"), common::fast_options())
        .await
        .unwrap();

    let result = tool(&tools, "fail").call(Map::new(), None).await.unwrap();
    match result {
        ToolResult::Failure(failure) => {
            assert_eq!(failure.kind, FailureKind::Tool("tool_error".to_string()));
            assert!(failure.message.contains("backend unavailable"));
        }
        other => panic!("expected failure, got {:?}", other),
    }

    bridge.close().await;
}

#[tokio::test]
async fn test_rpc_error_keeps_server_kind() {
    let (bridge, tools) = Bridge::connect(common::stub_params("normal"), common::fast_options())
        .await
        .unwrap();

    let result = tool(&tools, "explode").call(Map::new(), None).await.unwrap();
    let failure = result.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Tool("rate_limited".to_string()));
    assert_eq!(failure.message, "too many requests");

    bridge.close().await;
}

#[tokio::test]
async fn test_schema_violation_is_rejected_locally() {
    let (bridge, tools) = Bridge::connect(common::stub_params("normal"), common::fast_options())
        .await
        .unwrap();
    let search = tool(&tools, "search_flights");

    let err = search
        .call(args(json!({"origin": "Atlanta", "destination": "Las Vegas"})), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Schema { ref message, .. } if message.contains("date")));

    let err = search
        .call(
            args(json!({"origin": "Atlanta", "destination": "Las Vegas", "date": 20250505})),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Schema { .. }));

    assert!(search.validate(&args(json!({"origin": "A", "destination": "B", "date": "C"}))).is_ok());
    assert_eq!(bridge.in_flight(), 0);

    bridge.close().await;
}

#[tokio::test]
async fn test_unknown_tool_is_rejected() {
    let (bridge, _tools) = Bridge::connect(common::stub_params("normal"), common::fast_options())
        .await
        .unwrap();

    let err = bridge
        .invoke(ToolInvocation::from_value("teleport", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::UnknownTool(ref name) if name == "teleport"));

    bridge.close().await;
}

#[tokio::test]
async fn test_crash_fails_in_flight_call_promptly() {
    let (bridge, tools) =
        Bridge::connect(common::stub_params("crash-after-list"), common::fast_options())
            .await
            .unwrap();

    let started = Instant::now();
    let err = tool(&tools, "hang")
        .call(Map::new(), Some(Duration::from_secs(30)))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::StreamClosed(_)));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(bridge.in_flight(), 0);

    // Later calls fail the same way instead of hanging
    let err = tool(&tools, "fail").call(Map::new(), None).await.unwrap_err();
    assert!(matches!(err, BridgeError::StreamClosed(_)));

    bridge.close().await;
}

#[tokio::test]
async fn test_abandoned_call_releases_pending_slot() {
    let (bridge, tools) = Bridge::connect(common::stub_params("normal"), common::fast_options())
        .await
        .unwrap();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(200),
        tool(&tools, "hang").call(Map::new(), Some(Duration::from_secs(30))),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(bridge.in_flight(), 0);

    bridge.close().await;
}

#[tokio::test]
async fn test_malformed_call_result_closes_bridge() {
    let (bridge, tools) = Bridge::connect(common::stub_params("malformed"), common::fast_options())
        .await
        .unwrap();
    let pid = bridge.pid().unwrap();

    let err = tool(&tools, "fail").call(Map::new(), None).await.unwrap_err();
    assert!(matches!(err, BridgeError::Protocol(ref m) if m.contains("tools/call")));
    assert_eq!(bridge.state(), BridgeState::Closed);

    // The session is unusable but the process is only reaped by close()
    let err = tool(&tools, "fail").call(Map::new(), None).await.unwrap_err();
    assert!(matches!(err, BridgeError::StreamClosed(_)));
    assert!(common::process_alive(pid));

    bridge.close().await;
    assert!(common::wait_for_exit(pid, Duration::from_secs(2)).await);
}

#[tokio::test]
#[serial]
async fn test_environment_reaches_server() {
    unsafe {
        std::env::set_var("TOOLBRIDGE_TEST_SERP_KEY", "secret-123");
    }
    let params = common::stub_params("normal")
        .env("TOOLBRIDGE_TEST_REGION", "eu-west")
        .passthrough("TOOLBRIDGE_TEST_SERP_KEY");
    unsafe {
        std::env::remove_var("TOOLBRIDGE_TEST_SERP_KEY");
    }
    let params = params.unwrap();
    assert_eq!(params.required_env, vec!["TOOLBRIDGE_TEST_SERP_KEY"]);

    let (bridge, tools) = Bridge::connect(params, common::fast_options()).await.unwrap();
    let env = tool(&tools, "env");

    let result = env
        .call(args(json!({"name": "TOOLBRIDGE_TEST_SERP_KEY"})), None)
        .await
        .unwrap();
    assert_eq!(result.output().unwrap().text(), "secret-123");

    let result = env
        .call(args(json!({"name": "TOOLBRIDGE_TEST_REGION"})), None)
        .await
        .unwrap();
    assert_eq!(result.output().unwrap().text(), "eu-west");

    bridge.close().await;
}

#[tokio::test]
#[serial]
async fn test_passthrough_of_unset_variable_fails_fast() {
    let err = common::stub_params("normal")
        .passthrough("TOOLBRIDGE_TEST_DEFINITELY_UNSET")
        .unwrap_err();
    assert!(matches!(err, BridgeError::MissingEnvironment(ref key) if key == "TOOLBRIDGE_TEST_DEFINITELY_UNSET"));
}
