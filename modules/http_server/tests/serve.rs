//! Full lifecycle: the HTTP module binds in post_start, serves until shutdown
//! and reports listen failures with the module name.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use http_server::HttpServer;
use modkit::{AppError, Application, ConfigProvider, RunOptions, ShutdownOptions};

#[derive(Default)]
struct MapProvider(HashMap<String, Value>);

impl ConfigProvider for MapProvider {
    fn get_module_config(&self, section: &str) -> Option<&Value> {
        self.0.get(section)
    }
}

fn options(http: Value, token: CancellationToken) -> RunOptions {
    let mut sections = HashMap::new();
    sections.insert("http".to_string(), http);
    RunOptions::default()
        .with_config(Arc::new(MapProvider(sections)))
        .with_shutdown(ShutdownOptions::Token(token))
        .with_stop_timeout(Duration::from_secs(5))
}

async fn raw_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn wait_for_addr(server: &HttpServer) -> SocketAddr {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(addr) = server.local_addr() {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server did not bind in time")
}

#[tokio::test]
async fn serves_until_external_shutdown() {
    let app = Arc::new(Application::new("demo", "0.9.0"));
    let server = Arc::new(HttpServer::new(None));
    app.add("http", server.definition()).unwrap();

    let token = CancellationToken::new();
    let opts = options(
        json!({"address": "127.0.0.1:0", "shutdown_timeout": "1s"}),
        token.clone(),
    );
    let run = tokio::spawn({
        let app = app.clone();
        async move { app.run(opts).await }
    });

    let addr = wait_for_addr(&server).await;
    assert!(addr.ip().is_loopback());
    assert_ne!(addr.port(), 0);

    let response = raw_get(addr, "/api/health").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.to_ascii_lowercase().contains("server: demo/0.9.0"));
    assert!(response.contains(r#"{"ok":true}"#));

    token.cancel();
    let result = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok(), "{result:?}");
    assert!(server.local_addr().is_none());
    assert!(TcpStream::connect(addr).await.is_err(), "listener is closed");
}

#[tokio::test]
async fn listen_failure_is_a_post_start_error() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = occupied.local_addr().unwrap().to_string();

    let app = Arc::new(Application::new("demo", "0.9.0"));
    app.add("http", HttpServer::new(None)).unwrap();

    let err = app
        .run(options(json!({"address": address}), CancellationToken::new()))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::PostStart { .. }), "{err:?}");
    assert_eq!(err.module(), Some("http"));
    let msg = format!("{:#}", anyhow::Error::from(err));
    assert!(msg.contains("failed to listen on"), "{msg}");
}

#[tokio::test]
async fn unknown_config_key_is_a_config_error() {
    let app = Arc::new(Application::new("demo", "0.9.0"));
    app.add("http", HttpServer::new(None)).unwrap();

    let err = app
        .run(options(json!({"bind_addr": "127.0.0.1:0"}), CancellationToken::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Config { .. }), "{err:?}");
}
