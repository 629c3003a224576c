//! Integration tests for the objcall-peer binary.
//!
//! These tests start `objcall-peer serve`, discover its port from stdout,
//! and call into the demo graph over TCP, both through the library and
//! through `objcall-peer call`.

use objcall_core::transport::{connect, NoopHandler};
use objcall_core::{ErrorCode, ExecutionMode, Remote, RevivalRegistry};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;

const TIMEOUT: Duration = Duration::from_secs(5);

fn peer_binary() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_objcall-peer") {
        return Ok(PathBuf::from(path));
    }
    let current_exe = std::env::current_exe()
        .map_err(|e| format!("failed to resolve current_exe for fallback: {e}"))?;
    let target_debug_dir = current_exe
        .parent()
        .and_then(|p| p.parent())
        .ok_or_else(|| "failed to resolve target/debug directory for fallback".to_string())?;

    let mut fallback = target_debug_dir.join("objcall-peer");
    if cfg!(target_os = "windows") {
        fallback.set_extension("exe");
    }
    if !fallback.exists() {
        return Err(format!(
            "CARGO_BIN_EXE_objcall-peer not set and fallback binary not found at {}",
            fallback.display()
        ));
    }
    Ok(fallback)
}

struct PeerServerHandle {
    child: tokio::process::Child,
    port: u16,
    stdout_drain: Option<tokio::task::JoinHandle<()>>,
}

impl PeerServerHandle {
    fn addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.port))
    }

    async fn stop(mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

impl Drop for PeerServerHandle {
    fn drop(&mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.start_kill();
    }
}

/// Start `objcall-peer serve` and wait for its `RPC_PORT=` line.
async fn start_peer_server() -> Result<PeerServerHandle, String> {
    let binary = peer_binary()?;
    let mut child = tokio::process::Command::new(&binary)
        .arg("serve")
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn objcall-peer: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let mut discovered_port: Option<u16> = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Some(value) = line.strip_prefix("RPC_PORT=") {
                    let parsed = value
                        .trim()
                        .parse::<u16>()
                        .map_err(|e| format!("invalid RPC_PORT value '{value}': {e}"))?;
                    discovered_port = Some(parsed);
                    break;
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read objcall-peer stdout: {err}")),
            Err(_) => continue,
        }
    }

    let port =
        discovered_port.ok_or_else(|| "RPC_PORT line not emitted by objcall-peer".to_string())?;

    let stdout_drain =
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    Ok(PeerServerHandle {
        child,
        port,
        stdout_drain: Some(stdout_drain),
    })
}

async fn remote_for(server: &PeerServerHandle) -> Remote {
    let peer = connect(server.addr(), Arc::new(NoopHandler))
        .await
        .expect("connect to objcall-peer");
    let registry = Arc::new(RevivalRegistry::new());
    Remote::new(peer, registry)
}

/// Run `objcall-peer call` against `server` and return its stdout.
async fn run_cli_call(server: &PeerServerHandle, extra: &[&str]) -> (bool, String) {
    let output = tokio::process::Command::new(peer_binary().expect("peer binary"))
        .arg("call")
        .arg("--addr")
        .arg(server.addr().to_string())
        .args(extra)
        .stderr(Stdio::null())
        .output()
        .await
        .expect("run objcall-peer call");
    (
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).trim().to_string(),
    )
}

#[tokio::test]
async fn test_math_over_tcp() {
    let server = start_peer_server().await.expect("start server");
    let remote = remote_for(&server).await;

    let sum = remote
        .call(TIMEOUT)
        .at("math.add")
        .invoke(vec![json!(2), json!(3)])
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(sum.as_f64(), Some(5.0));

    server.stop().await;
}

#[tokio::test]
async fn test_error_codes_over_tcp() {
    let server = start_peer_server().await.expect("start server");
    let remote = remote_for(&server).await;

    let missing = remote
        .call(TIMEOUT)
        .at("math.pow")
        .invoke(vec![])
        .unwrap()
        .value()
        .await
        .unwrap_err();
    assert_eq!(missing.to_error_code(), ErrorCode::MethodNotFound);

    let failed = remote
        .call(TIMEOUT)
        .at("fail")
        .invoke(vec![json!("nope")])
        .unwrap()
        .value()
        .await
        .unwrap_err();
    assert_eq!(failed.to_error_code(), ErrorCode::ServiceError);

    let fallback = remote
        .call_or(TIMEOUT, "fallback")
        .at("fail")
        .invoke(vec![])
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(fallback, json!("fallback"));

    server.stop().await;
}

#[tokio::test]
async fn test_timeout_over_tcp() {
    let server = start_peer_server().await.expect("start server");
    let remote = remote_for(&server).await;

    let err = remote
        .call(Duration::from_millis(50))
        .get("sleep")
        .invoke(vec![json!(1000)])
        .unwrap()
        .value()
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    server.stop().await;
}

#[tokio::test]
async fn test_batch_over_tcp() {
    let server = start_peer_server().await.expect("start server");
    let remote = remote_for(&server).await;

    let mut batch = remote.batch(ExecutionMode::Parallel);
    batch.add_call("sleep", vec![json!(50)]).unwrap();
    batch.add_call("echo", vec![json!("x")]).unwrap();
    batch.add_call("missing", vec![]).unwrap();
    let results = batch.call_all(TIMEOUT).await.unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap(), &json!(50));
    assert_eq!(results[1].as_ref().unwrap(), &json!(["x"]));
    assert_eq!(
        results[2].as_ref().unwrap_err().to_error_code(),
        ErrorCode::MethodNotFound
    );

    server.stop().await;
}

#[tokio::test]
async fn test_cards_revive_over_tcp() {
    let server = start_peer_server().await.expect("start server");
    let remote = remote_for(&server).await;

    // An unregistered caller sees the tagged object as plain data.
    let card = remote
        .call(TIMEOUT)
        .at("cards.draw")
        .invoke(vec![json!(13), json!("hearts")])
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(card["__revive__"], "Card");

    let name = remote
        .call(TIMEOUT)
        .at("cards.describe")
        .invoke(vec![card])
        .unwrap()
        .value()
        .await
        .unwrap();
    assert_eq!(name, json!("King of hearts"));

    server.stop().await;
}

#[tokio::test]
async fn test_cli_call_prints_result() {
    let server = start_peer_server().await.expect("start server");

    let (ok, stdout) = run_cli_call(&server, &["--method", "echo", "--params", "[1, \"two\"]"]).await;
    assert!(ok);
    let printed: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(printed, json!([1, "two"]));

    let (ok, stdout) = run_cli_call(&server, &["--method", "fail", "--default", "\"fallback\""]).await;
    assert!(ok);
    assert_eq!(stdout, "\"fallback\"");

    let (ok, _) = run_cli_call(&server, &["--method", "fail"]).await;
    assert!(!ok);

    let (ok, stdout) = run_cli_call(&server, &["--method", "notify", "--params", "\"hi\"", "--emit"]).await;
    assert!(ok);
    assert!(stdout.is_empty());

    server.stop().await;
}
