//! End-to-end gateway tests over the JSON-RPC boundary.
//!
//! Sessions run against scripted mock transports under real `CdbDriver`
//! instances, so sentinel framing, the queue worker, and the session
//! manager are all exercised exactly as in production minus the child
//! process.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::post;
use axum_test::TestServer;
use cdb_sdk::transport::{MockController, MockTransport};
use cdb_sdk::{CdbDriver, DebugEngine, DriverOptions};
use parking_lot::Mutex;
use serde_json::{Value, json};

use windbg_api::api::rpc::{self, RpcState};
use windbg_api::core::config::{QueueConfig, RecoveryConfig, SessionConfig};
use windbg_api::core::notifications::NotificationBus;
use windbg_api::core::session_manager::{EngineFactory, SessionManager};

type DriverLog = Arc<Mutex<Vec<(Arc<CdbDriver>, MockController)>>>;

struct Gateway {
    server: TestServer,
    drivers: DriverLog,
    #[allow(dead_code)]
    manager: Arc<SessionManager>,
}

fn gateway(max_sessions: usize) -> Gateway {
    let drivers: DriverLog = Arc::new(Mutex::new(Vec::new()));
    let drivers_factory = drivers.clone();
    let factory: EngineFactory = Arc::new(move |_target, _symbols| {
        let mock = MockTransport::new();
        let controller = mock.controller();
        let options = DriverOptions::builder()
            .executable("cdb")
            .command_timeout(Duration::from_secs(60))
            .interrupt_grace(Duration::from_millis(300))
            .build();
        let driver = Arc::new(CdbDriver::with_transport(options, Box::new(mock)));
        drivers_factory.lock().push((driver.clone(), controller));
        driver as Arc<dyn DebugEngine>
    });

    let session_config = SessionConfig {
        max_concurrent_sessions: max_sessions,
        session_timeout_secs: 3600,
        cleanup_interval_secs: 3600,
        disposal_timeout_secs: 5,
        memory_cleanup_threshold_bytes: u64::MAX,
    };
    let manager = SessionManager::with_engine_factory(
        factory,
        session_config,
        QueueConfig::default(),
        RecoveryConfig {
            interrupt_wait_ms: 50,
            probe_timeout_ms: 1000,
            ..RecoveryConfig::default()
        },
        Arc::new(NotificationBus::new(256)),
    );

    let app = Router::new()
        .route("/rpc", post(rpc::dispatch))
        .with_state(RpcState {
            manager: manager.clone(),
        });

    Gateway {
        server: TestServer::new(app).expect("test server"),
        drivers,
        manager,
    }
}

impl Gateway {
    async fn call(&self, method: &str, params: Value) -> Value {
        let response = self
            .server
            .post("/rpc")
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .await;
        response.json::<Value>()
    }

    fn last_controller(&self) -> MockController {
        self.drivers.lock().last().expect("a driver exists").1.clone()
    }

    fn last_sentinel(&self) -> String {
        self.drivers
            .lock()
            .last()
            .expect("a driver exists")
            .0
            .sentinel_token()
    }

    async fn poll_until_terminal(&self, session_id: &str, command_id: &str) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let status = self
                .call(
                    "commandStatus",
                    json!({"sessionId": session_id, "commandId": command_id}),
                )
                .await;
            let state = status["result"]["state"].as_str().unwrap_or_default();
            match state {
                "pending" | "executing" => {
                    assert!(
                        tokio::time::Instant::now() < deadline,
                        "command never became terminal: {status}"
                    );
                    tokio::time::sleep(Duration::from_millis(20)).await;
                },
                _ => return status["result"].clone(),
            }
        }
    }
}

// ── Happy path ──

#[tokio::test]
async fn test_open_exec_poll_close_roundtrip() {
    let gw = gateway(10);

    let opened = gw.call("openSession", json!({"target": "/tmp/x.dmp"})).await;
    let session_id = opened["result"]["sessionId"]
        .as_str()
        .expect("session id")
        .to_string();

    gw.last_controller()
        .respond("version", &["Microsoft (R) Windows Debugger Version 10.0", "ready"]);

    let exec = gw
        .call(
            "execCommand",
            json!({"sessionId": session_id, "command": "version"}),
        )
        .await;
    let command_id = exec["result"]["commandId"].as_str().expect("command id").to_string();

    let status = gw.poll_until_terminal(&session_id, &command_id).await;
    assert_eq!(status["state"], "completed");
    let output = status["result"].as_str().unwrap();
    assert!(!output.is_empty());
    assert!(output.contains("Windows Debugger"));
    assert!(
        !output.contains(&gw.last_sentinel()),
        "sentinel token must never leak into results"
    );

    let closed = gw
        .call("closeSession", json!({"sessionId": session_id}))
        .await;
    assert_eq!(closed["result"]["success"], true);

    // Closed ids are gone for good
    let again = gw
        .call("closeSession", json!({"sessionId": session_id}))
        .await;
    assert_eq!(again["result"]["success"], false);
    let status = gw
        .call(
            "commandStatus",
            json!({"sessionId": session_id, "commandId": command_id}),
        )
        .await;
    assert_eq!(status["result"]["state"], "notFound");
}

// ── Cancellation over RPC ──

#[tokio::test]
async fn test_cancel_executing_command_over_rpc() {
    let gw = gateway(10);

    let opened = gw.call("openSession", json!({"target": "/tmp/x.dmp"})).await;
    let session_id = opened["result"]["sessionId"].as_str().unwrap().to_string();

    let controller = gw.last_controller();
    controller.respond_after("dd slow", Duration::from_secs(5), &["late"]);
    controller.respond("version", &["alive"]);

    let exec = gw
        .call(
            "execCommand",
            json!({"sessionId": session_id, "command": "dd slow"}),
        )
        .await;
    let command_id = exec["result"]["commandId"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancelled = gw
        .call(
            "cancelCommand",
            json!({"sessionId": session_id, "commandId": command_id}),
        )
        .await;
    assert_eq!(cancelled["result"]["success"], true);

    let status = gw.poll_until_terminal(&session_id, &command_id).await;
    assert_eq!(status["state"], "cancelled");

    // The session still executes commands afterwards
    let exec = gw
        .call(
            "execCommand",
            json!({"sessionId": session_id, "command": "version"}),
        )
        .await;
    let follow_up = exec["result"]["commandId"].as_str().unwrap().to_string();
    let status = gw.poll_until_terminal(&session_id, &follow_up).await;
    assert_eq!(status["state"], "completed");
    assert_eq!(status["result"], "alive");

    // Cancelling a terminal command reports false
    let cancelled = gw
        .call(
            "cancelCommand",
            json!({"sessionId": session_id, "commandId": command_id}),
        )
        .await;
    assert_eq!(cancelled["result"]["success"], false);
}

// ── Session cap ──

#[tokio::test]
async fn test_session_cap_round_trip() {
    let gw = gateway(2);

    let first = gw.call("openSession", json!({"target": "/tmp/a.dmp"})).await;
    let first_id = first["result"]["sessionId"].as_str().unwrap().to_string();
    gw.call("openSession", json!({"target": "/tmp/b.dmp"})).await;

    let third = gw.call("openSession", json!({"target": "/tmp/c.dmp"})).await;
    assert_eq!(third["result"]["error"]["kind"], "limitExceeded");
    assert_eq!(third["result"]["error"]["current"], 2);
    assert_eq!(third["result"]["error"]["max"], 2);

    let closed = gw.call("closeSession", json!({"sessionId": first_id})).await;
    assert_eq!(closed["result"]["success"], true);

    let fourth = gw.call("openSession", json!({"target": "/tmp/d.dmp"})).await;
    assert!(fourth["result"]["sessionId"].is_string());
}

// ── Listings ──

#[tokio::test]
async fn test_list_commands_and_sessions() {
    let gw = gateway(10);

    let opened = gw.call("openSession", json!({"target": "/tmp/x.dmp"})).await;
    let session_id = opened["result"]["sessionId"].as_str().unwrap().to_string();

    let controller = gw.last_controller();
    controller.respond("lm", &["modules"]);

    let exec = gw
        .call("execCommand", json!({"sessionId": session_id, "command": "lm"}))
        .await;
    let command_id = exec["result"]["commandId"].as_str().unwrap().to_string();
    gw.poll_until_terminal(&session_id, &command_id).await;

    let listed = gw
        .call("listCommands", json!({"sessionId": session_id}))
        .await;
    let commands = listed["result"]["commands"].as_array().unwrap();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0]["command"], "lm");
    assert_eq!(commands[0]["state"], "completed");
    assert!(commands[0]["queuedAt"].is_string());

    let sessions = gw.call("listSessions", json!(null)).await;
    let sessions = sessions["result"]["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["sessionId"], session_id.as_str());
    assert_eq!(sessions[0]["target"], "/tmp/x.dmp");
    assert_eq!(sessions[0]["status"], "active");

    let stats = gw.call("sessionStats", json!(null)).await;
    assert_eq!(stats["result"]["activeSessions"], 1);
    assert_eq!(stats["result"]["sessionsCreated"], 1);
}

// ── Protocol errors ──

#[tokio::test]
async fn test_protocol_error_codes() {
    let gw = gateway(10);

    // Unknown operation
    let response = gw.call("timeTravel", json!({})).await;
    assert_eq!(response["error"]["code"], -32601);

    // Missing method entirely
    let raw = gw
        .server
        .post("/rpc")
        .json(&json!({"jsonrpc": "2.0", "id": 5}))
        .await;
    let body: Value = raw.json();
    assert_eq!(body["error"]["code"], -32600);

    // Missing required argument
    let response = gw.call("execCommand", json!({"sessionId": "s"})).await;
    assert_eq!(response["error"]["code"], -32602);

    // Empty command
    let response = gw
        .call("execCommand", json!({"sessionId": "s", "command": "  "}))
        .await;
    assert_eq!(response["error"]["code"], -32602);

    // Empty target
    let response = gw.call("openSession", json!({"target": ""})).await;
    assert_eq!(response["error"]["code"], -32602);

    // Malformed command id
    let response = gw
        .call(
            "commandStatus",
            json!({"sessionId": "s", "commandId": "not-a-uuid"}),
        )
        .await;
    assert_eq!(response["error"]["code"], -32602);
}

// ── Domain failures are payloads, not protocol errors ──

#[tokio::test]
async fn test_unknown_ids_are_structured_payloads() {
    let gw = gateway(10);

    let response = gw
        .call(
            "commandStatus",
            json!({
                "sessionId": "no-such-session",
                "commandId": "7b1c6a20-0000-0000-0000-000000000000",
            }),
        )
        .await;
    assert!(response.get("error").is_none(), "not a protocol error");
    assert_eq!(response["result"]["state"], "notFound");

    let opened = gw.call("openSession", json!({"target": "/tmp/x.dmp"})).await;
    let session_id = opened["result"]["sessionId"].as_str().unwrap().to_string();

    // Valid session, unknown command id
    let response = gw
        .call(
            "commandStatus",
            json!({
                "sessionId": session_id,
                "commandId": "7b1c6a20-0000-0000-0000-000000000000",
            }),
        )
        .await;
    assert_eq!(response["result"]["state"], "notFound");
    assert!(response["result"]["error"].is_string());
}
