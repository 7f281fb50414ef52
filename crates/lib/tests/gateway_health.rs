//! Integration test: start the gateway on a free port, GET /, assert health JSON.
//! Does not require an upstream agent. The server task is left running when the test ends.

use relay::config::Config;
use relay::gateway;
use std::path::PathBuf;
use std::time::Duration;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

#[tokio::test]
async fn gateway_health_http_responds_with_running() {
    let port = free_port();

    let mut config = Config::default();
    config.gateway.port = port;
    config.gateway.bind = "127.0.0.1".to_string();
    config.wecom.token = Some("health-token".to_string());
    config.wecom.encoding_aes_key = Some("abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG".to_string());

    let config_path = PathBuf::from("unused-config.json");
    let gateway_handle = tokio::spawn(async move {
        let _ = gateway::run_gateway(config, config_path).await;
    });

    let url = format!("http://127.0.0.1:{}/", port);
    let client = reqwest::Client::new();
    let mut last_err = None;
    for _ in 0..100 {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let json: serde_json::Value = resp.json().await.expect("parse JSON");
                assert_eq!(json.get("runtime").and_then(|v| v.as_str()), Some("running"));
                assert_eq!(json.get("port").and_then(|v| v.as_u64()), Some(port as u64));
                assert_eq!(json.get("conversations").and_then(|v| v.as_u64()), Some(0));
                return;
            }
            Ok(_) => {}
            Err(e) => last_err = Some(e),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    gateway_handle.abort();
    panic!(
        "GET {} did not return 200 with health JSON within 5s; last error: {:?}",
        url, last_err
    );
}

#[tokio::test]
async fn gateway_refuses_to_start_without_credentials() {
    let mut config = Config::default();
    config.gateway.port = free_port();
    config.wecom.token = Some("t".to_string());
    config.wecom.encoding_aes_key = Some("too-short".to_string());
    let err = gateway::run_gateway(config, PathBuf::from("unused.json"))
        .await
        .expect_err("invalid key must fail");
    assert!(format!("{:#}", err).contains("invalid encoding aes key"));
}
