//! Integration tests for the HTTP and WebSocket protocol servers.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use netrpc::rpc::{into_args, ApiHost, ApiServer, Encoder, JsonEncoder, Message};

mod common;

fn demo_host(name: &str) -> ApiHost {
    let host = ApiHost::new(name);
    host.register("Demo/Echo", |_, args| Ok(Value::Object(args)));
    host.register("Demo/Add", |_, args| {
        let operand = |key: &str| {
            args.get(key)
                .and_then(|v| v.as_f64().or_else(|| v.as_str()?.parse().ok()))
                .unwrap_or_default()
        };
        Ok(json!(operand("a") + operand("b")))
    });
    host
}

#[tokio::test(flavor = "multi_thread")]
async fn http_query_and_body_become_arguments() {
    let host = demo_host("Http");
    let server = host.add("http://127.0.0.1:0").unwrap();
    host.start().unwrap();
    let base = format!("http://127.0.0.1:{}", server.local().port);
    let client = reqwest::Client::new();

    let reply: Value = client
        .get(format!("{}/Demo/Add?a=2&b=40", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reply, json!({"code": 0, "result": 42.0}));

    let reply: Value = client
        .post(format!("{}/Demo/Echo?tag=q", base))
        .json(&json!({"tag": "body", "n": 1}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reply["result"], json!({"tag": "body", "n": 1}));

    let reply: Value = client
        .get(format!("{}/No/Such", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reply["code"], json!(404));

    let status = client
        .post(format!("{}/Demo/Echo", base))
        .body("[1, 2]")
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);

    host.stop("test");
    assert!(!server.is_active());
}

#[tokio::test(flavor = "multi_thread")]
async fn websocket_text_and_binary_frames() {
    let host = demo_host("Ws");
    let server = host.add("ws://127.0.0.1:0/rpc").unwrap();
    host.start().unwrap();

    let url = format!("ws://127.0.0.1:{}/rpc", server.local().port);
    let (mut socket, _) = connect_async(url).await.unwrap();

    let payload = JsonEncoder
        .encode_request("Demo/Echo", &into_args(json!({"hello": "ws"})))
        .unwrap();
    socket
        .send(WsMessage::text(String::from_utf8(payload.clone()).unwrap()))
        .await
        .unwrap();
    let frame = socket.next().await.unwrap().unwrap();
    let reply: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(reply, json!({"code": 0, "result": {"hello": "ws"}}));

    socket
        .send(WsMessage::binary(Message::request(77, payload).to_bytes()))
        .await
        .unwrap();
    let frame = socket.next().await.unwrap().unwrap();
    let reply = Message::from_bytes(&frame.into_data()).unwrap();
    assert!(reply.reply);
    assert!(!reply.error);
    assert_eq!(reply.sequence, 77);

    let info = JsonEncoder
        .encode_request("Api/Info", &serde_json::Map::new())
        .unwrap();
    socket
        .send(WsMessage::text(String::from_utf8(info).unwrap()))
        .await
        .unwrap();
    let frame = socket.next().await.unwrap().unwrap();
    let reply: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(reply["result"]["name"], json!("Ws"));
    assert_ne!(reply["result"]["session"], json!(0));

    socket.close(None).await.unwrap();
    host.stop("test");
}

#[tokio::test(flavor = "multi_thread")]
async fn config_built_host_serves_every_endpoint() {
    let mut config = netrpc::HostConfig::default();
    config.host.name = "Configured".to_string();
    config.host.endpoints = vec![
        "tcp://127.0.0.1:0".to_string(),
        "http://127.0.0.1:0".to_string(),
    ];
    let host = netrpc::lifecycle::startup::build_host(&config).unwrap();
    host.start().unwrap();

    let servers = host.servers();
    assert_eq!(servers.len(), 2);
    assert!(servers.iter().all(|s| s.is_active() && s.local().port != 0));

    let tcp = common::addr(servers[0].local().port);
    let client = netrpc::ApiClient::connect(tcp, &ApiHost::new("Peer")).await.unwrap();
    let info = client
        .invoke_dict("Api/Info", serde_json::Map::new())
        .await
        .unwrap();
    assert_eq!(info["name"], json!("Configured"));

    host.stop("test");
}
