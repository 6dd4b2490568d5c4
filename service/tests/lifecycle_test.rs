//! Full application over a real socket, without Kafka or Redis.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use analytics_service::{Application, Config};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;

fn config() -> Config {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("HOST", "127.0.0.1"),
        ("PORT", "0"),
        ("ENABLE_KAFKA", "false"),
        ("REDIS_URL", ""),
    ]);
    Config::from_lookup(|key| vars.get(key).map(ToString::to_string)).unwrap()
}

#[tokio::test]
async fn serves_until_shutdown_signal() {
    let app = Application::build(config()).await.unwrap();
    let addr = app.local_addr().unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(app.run_until(async {
        let _ = stop_rx.await;
    }));

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    let response = client.get(format!("http://{addr}/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");

    let response = client
        .get(format!("http://{addr}/api/v1/analytics/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["kafka"]["enabled"], false);
    assert_eq!(body["kafka"]["kafka"], "disconnected");
    assert_eq!(body["rateLimit"]["store"], "in-process");

    // Without proxy headers the limiter keys on the socket address.
    for _ in 0..10 {
        let response = client
            .get(format!("http://{addr}/api/v1/rate-limit-examples/basic"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
    let response = client
        .get(format!("http://{addr}/api/v1/rate-limit-examples/basic"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server should stop after the signal")
        .unwrap()
        .unwrap();
}
