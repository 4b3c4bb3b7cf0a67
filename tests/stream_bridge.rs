use devxfer::adapters::simulated::{SimulatedDevice, pattern};
use devxfer::config::AppConfig;
use devxfer::core::{
    BridgeOptions, BridgeState, Channel, DeviceChannelGateway, StreamBridge, StreamBridgeRegistry,
};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const CLIP: &str = "/DCIM/clip.mp4";

async fn setup() -> (SimulatedDevice, DeviceChannelGateway, StreamBridgeRegistry, String) {
    let device = SimulatedDevice::new();
    device.add_file(CLIP, pattern(1000));
    device.add_file("/DCIM/empty.txt", Vec::new());
    let gateway = DeviceChannelGateway::new("sim", Box::new(device.service()), None);

    let mut config = AppConfig::default();
    config.chunk_size = 4096;
    let registry = StreamBridgeRegistry::new(gateway.clone(), Arc::new(config));
    let url = registry.acquire(Channel::Primary, CLIP).await.unwrap();
    (device, gateway, registry, url)
}

async fn slow_bridge(size: usize) -> (SimulatedDevice, StreamBridge) {
    let device = SimulatedDevice::new();
    device.add_file("/slow.bin", pattern(size));
    device.set_latency(Duration::from_millis(2));
    let gateway = DeviceChannelGateway::new("sim", Box::new(device.service()), None);

    let options = BridgeOptions {
        chunk_size: 4096,
        bind_attempts: 3,
    };
    let bridge = StreamBridge::start(gateway, Channel::Primary, "/slow.bin", options)
        .await
        .unwrap();
    (device, bridge)
}

async fn wait_for_state(bridge: &StreamBridge, want: BridgeState) {
    timeout(Duration::from_secs(5), async {
        while bridge.state() != want {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("bridge never reached {:?}, stuck at {:?}", want, bridge.state()));
}

async fn wait_for_closed_handles(device: &SimulatedDevice) {
    timeout(Duration::from_secs(2), async {
        while device.open_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("device handles were not closed");
}

#[tokio::test]
async fn test_full_get_returns_whole_file() {
    let (device, _gateway, _registry, url) = setup().await;

    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-length"], "1000");
    assert_eq!(resp.headers()["accept-ranges"], "bytes");
    assert_eq!(resp.headers()["content-type"], "video/mp4");

    let body = resp.bytes().await.unwrap();
    assert_eq!(body.as_ref(), pattern(1000).as_slice());

    wait_for_closed_handles(&device).await;
}

#[tokio::test]
async fn test_range_request_returns_partial_content() {
    let (device, _gateway, _registry, url) = setup().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(&url)
        .header("Range", "bytes=0-99")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.headers()["content-range"], "bytes 0-99/1000");
    assert_eq!(resp.headers()["content-length"], "100");

    let body = resp.bytes().await.unwrap();
    assert_eq!(body.as_ref(), &pattern(1000)[..100]);

    wait_for_closed_handles(&device).await;
}

#[tokio::test]
async fn test_open_ended_and_suffix_ranges() {
    let (_device, _gateway, _registry, url) = setup().await;
    let client = reqwest::Client::new();
    let content = pattern(1000);

    let resp = client.get(&url).header("Range", "bytes=900-").send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.headers()["content-range"], "bytes 900-999/1000");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), &content[900..]);

    let resp = client.get(&url).header("Range", "bytes=-10").send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.headers()["content-range"], "bytes 990-999/1000");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), &content[990..]);

    let resp = client.get(&url).header("Range", "bytes=500-5000").send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.headers()["content-range"], "bytes 500-999/1000");
}

#[tokio::test]
async fn test_unsatisfiable_range() {
    let (_device, _gateway, _registry, url) = setup().await;

    let resp = reqwest::Client::new()
        .get(&url)
        .header("Range", "bytes=2000-")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(resp.headers()["content-range"], "bytes */1000");
}

#[tokio::test]
async fn test_malformed_range_is_bad_request() {
    let (_device, _gateway, _registry, url) = setup().await;

    let resp = reqwest::Client::new()
        .get(&url)
        .header("Range", "pages=1-2")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_other_methods_are_rejected() {
    let (_device, _gateway, _registry, url) = setup().await;

    let resp = reqwest::Client::new().post(&url).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_head_returns_headers_only() {
    let (device, _gateway, _registry, url) = setup().await;

    let resp = reqwest::Client::new().head(&url).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-length"], "1000");
    assert_eq!(device.open_count(), 0);
}

#[tokio::test]
async fn test_missing_file_is_not_found() {
    let (_device, _gateway, registry, _url) = setup().await;
    let url = registry.acquire(Channel::Primary, "/DCIM/gone.mp4").await.unwrap();

    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_empty_file() {
    let (device, _gateway, registry, _url) = setup().await;
    let url = registry.acquire(Channel::Primary, "/DCIM/empty.txt").await.unwrap();

    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-length"], "0");
    assert!(resp.bytes().await.unwrap().is_empty());
    assert_eq!(device.open_count(), 0);
}

#[tokio::test]
async fn test_other_paths_are_not_found() {
    let (_device, _gateway, _registry, url) = setup().await;

    let resp = reqwest::get(format!("{}other", url)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_detached_device_fails_requests() {
    let (_device, gateway, _registry, url) = setup().await;
    assert!(gateway.detach());

    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_concurrent_streams_and_listing_never_overlap() {
    let device = SimulatedDevice::new();
    device.add_file("/a.bin", pattern(64 * 1024));
    device.add_file("/b.bin", pattern(48 * 1024));
    device.set_latency(Duration::from_millis(1));
    let gateway = DeviceChannelGateway::new("sim", Box::new(device.service()), None);

    let mut config = AppConfig::default();
    config.chunk_size = 4096;
    let registry = StreamBridgeRegistry::new(gateway.clone(), Arc::new(config));
    let url_a = registry.acquire(Channel::Primary, "/a.bin").await.unwrap();
    let url_b = registry.acquire(Channel::Primary, "/b.bin").await.unwrap();

    let fetch_a = tokio::spawn(async move { reqwest::get(url_a).await?.bytes().await });
    let fetch_b = tokio::spawn(async move { reqwest::get(url_b).await?.bytes().await });

    let mut listings = Vec::new();
    for _ in 0..10 {
        let gateway = gateway.clone();
        listings.push(tokio::spawn(async move {
            gateway
                .run_blocking(|gw| gw.list_directory(Channel::Primary, "/"))
                .await
        }));
    }
    for listing in listings {
        assert_eq!(listing.await.unwrap().unwrap().len(), 2);
    }

    assert_eq!(fetch_a.await.unwrap().unwrap().as_ref(), pattern(64 * 1024).as_slice());
    assert_eq!(fetch_b.await.unwrap().unwrap().as_ref(), pattern(48 * 1024).as_slice());
    assert_eq!(device.stats().overlapping_calls, 0);
}

#[tokio::test]
async fn test_bridge_state_follows_lifecycle() {
    let (_device, bridge) = slow_bridge(64 * 1024).await;

    assert!(bridge.local_addr().ip().is_loopback());
    assert_eq!(bridge.url(), format!("http://{}/", bridge.local_addr()));
    assert_eq!(bridge.channel(), Channel::Primary);
    assert_eq!(bridge.path(), "/slow.bin");
    assert_eq!(bridge.state(), BridgeState::Listening);

    let url = bridge.url();
    let fetch = tokio::spawn(async move { reqwest::get(url).await?.bytes().await });
    wait_for_state(&bridge, BridgeState::Serving(1)).await;

    let body = fetch.await.unwrap().unwrap();
    assert_eq!(body.len(), 64 * 1024);
    wait_for_state(&bridge, BridgeState::Draining).await;

    assert!(bridge.close());
    assert!(!bridge.close());
    wait_for_state(&bridge, BridgeState::Closed).await;
}

#[tokio::test]
async fn test_abort_cuts_running_stream() {
    let total = 400 * 1024;
    let (device, bridge) = slow_bridge(total).await;

    let url = bridge.url();
    let fetch = tokio::spawn(async move { reqwest::get(url).await?.bytes().await });
    wait_for_state(&bridge, BridgeState::Serving(1)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    bridge.abort();
    if let Ok(body) = fetch.await.unwrap() {
        assert!(body.len() < total);
    }

    wait_for_closed_handles(&device).await;
    wait_for_state(&bridge, BridgeState::Closed).await;
}
