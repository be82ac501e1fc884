//! Assembly order, config loading and a full serve cycle through the entry.

use async_trait::async_trait;
use axum::{routing::get, Router};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use bootstrap::{load_config, Bootstrap, BootstrapOptions};
use modkit::{
    AppContext, AppError, Initializer, Module, ModuleDef, PostStarter, Routable, ShutdownOptions,
};
use runtime::{AppConfig, CliArgs};

#[derive(Default)]
struct Spy {
    calls: Arc<Mutex<Vec<String>>>,
}

impl Spy {
    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
    }
}

#[async_trait]
impl Module for Spy {
    async fn start(&self, _ctx: &AppContext) -> anyhow::Result<()> {
        self.record("start");
        Ok(())
    }
    async fn stop(&self, _ctx: &AppContext) -> anyhow::Result<()> {
        self.record("stop");
        Ok(())
    }
}

#[async_trait]
impl Initializer for Spy {
    async fn initialize(&self, ctx: AppContext) -> anyhow::Result<AppContext> {
        self.record("init");
        Ok(ctx)
    }
}

#[async_trait]
impl PostStarter for Spy {
    async fn post_start(&self, _ctx: &AppContext) -> anyhow::Result<()> {
        self.record("post_start");
        Ok(())
    }
}

impl Routable for Spy {
    fn route(&self, _ctx: &AppContext, router: Router) -> anyhow::Result<Router> {
        self.record("route");
        Ok(router.route("/hello", get(|| async { "hi" })))
    }
}

fn spy_def(spy: &Arc<Spy>) -> ModuleDef {
    ModuleDef::builder(spy.clone())
        .initializer()
        .post_starter()
        .routable()
        .build()
}

async fn raw_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[test]
fn stock_modules_come_first() {
    let spy = Arc::new(Spy::default());
    let boot = Bootstrap::new(
        "demo",
        "1.0.0",
        None,
        AppConfig::default(),
        vec![("users".to_string(), spy_def(&spy))],
    )
    .unwrap();

    assert_eq!(
        boot.app().controller().names(),
        vec!["env", "logging", "http", "users"]
    );
}

#[test]
fn user_module_cannot_shadow_a_stock_one() {
    let spy = Arc::new(Spy::default());
    let err = Bootstrap::new(
        "demo",
        "1.0.0",
        None,
        AppConfig::default(),
        vec![("http".to_string(), spy_def(&spy))],
    )
    .err()
    .unwrap();
    assert!(format!("{err:#}").contains("failed to register module \"http\""));
}

#[test]
fn missing_config_file_is_an_error() {
    let args = CliArgs {
        config: Some("/nonexistent/bootstrap.yaml".into()),
        ..Default::default()
    };
    let err = load_config(&args).unwrap_err();
    assert!(format!("{err:#}").contains("config file not found"));
}

#[test]
fn flags_override_the_file() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("cfg.yaml");
    std::fs::write(
        &path,
        format!(
            "server:\n  home_dir: \"{}\"\n  stop_timeout: 3s\nmodules:\n  http:\n    address: \"0.0.0.0:9999\"\n",
            tmp.path().display()
        ),
    )
    .unwrap();

    let args = CliArgs {
        config: Some(path.to_string_lossy().to_string()),
        address: Some("127.0.0.1:0".into()),
        verbose: 1,
        ..Default::default()
    };
    let cfg = load_config(&args).unwrap();
    assert_eq!(cfg.server.stop_timeout, Duration::from_secs(3));
    assert_eq!(cfg.modules["http"]["address"], "127.0.0.1:0");
    assert_eq!(cfg.logging.unwrap()["default"].console_level, "debug");
}

#[test]
fn check_rejects_unknown_http_key() {
    let mut config = AppConfig::default();
    config
        .modules
        .insert("http".into(), serde_json::json!({"adress": ":80"}));
    let boot = Bootstrap::new("demo", "1.0.0", None, config, Vec::new()).unwrap();

    let err = boot.check().unwrap_err();
    assert!(matches!(err, AppError::Config { .. }), "{err:?}");
    assert_eq!(err.module(), Some("http"));
}

#[tokio::test]
async fn serves_user_routes_until_shutdown() {
    let tmp = tempfile::tempdir().unwrap();
    let args = CliArgs {
        address: Some("127.0.0.1:0".into()),
        ..Default::default()
    };
    let mut config = load_config(&args).unwrap();
    config.server.home_dir = tmp.path().to_string_lossy().to_string();
    config.server.stop_timeout = Duration::from_secs(5);

    let spy = Arc::new(Spy::default());
    let boot = Arc::new(
        Bootstrap::new(
            "demo",
            "3.1.4",
            None,
            config,
            vec![("users".to_string(), spy_def(&spy))],
        )
        .unwrap(),
    );

    let token = CancellationToken::new();
    let run = tokio::spawn({
        let boot = boot.clone();
        let token = token.clone();
        async move { boot.run(ShutdownOptions::Token(token)).await }
    });

    let addr = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(addr) = boot.http().local_addr() {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server did not bind in time");

    let response = raw_get(addr, "/hello").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.to_ascii_lowercase().contains("server: demo/3.1.4"));
    assert!(response.ends_with("hi"), "{response}");

    token.cancel();
    run.await.unwrap().unwrap();

    assert_eq!(
        *spy.calls.lock(),
        vec!["init", "route", "start", "post_start", "stop"]
    );
}

#[tokio::test]
async fn entry_reports_failing_module() {
    struct Broken;

    #[async_trait]
    impl Module for Broken {
        async fn start(&self, _ctx: &AppContext) -> anyhow::Result<()> {
            anyhow::bail!("no backend")
        }
        async fn stop(&self, _ctx: &AppContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let tmp = tempfile::tempdir().unwrap();
    let yaml = tmp.path().join("cfg.yaml");
    std::fs::write(
        &yaml,
        format!("server:\n  home_dir: \"{}\"\n", tmp.path().display()),
    )
    .unwrap();

    let token = CancellationToken::new();
    let options = BootstrapOptions::default()
        .with_args(CliArgs {
            config: Some(yaml.to_string_lossy().to_string()),
            address: Some("127.0.0.1:0".into()),
            ..Default::default()
        })
        .with_shutdown(ShutdownOptions::Token(token))
        .with_module("broken", Arc::new(Broken));

    let err = bootstrap::http("demo", "1.0.0", None, options)
        .await
        .unwrap_err();
    let app_err = err.downcast_ref::<AppError>().unwrap();
    assert!(matches!(app_err, AppError::Start { .. }), "{app_err:?}");
    assert_eq!(app_err.module(), Some("broken"));
}
