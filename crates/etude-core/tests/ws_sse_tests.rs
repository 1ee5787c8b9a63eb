// WebSocket upgrade/frame tests and SSE reconnect tests.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use etude_core::error::WebError;
use etude_core::fiber::Deadline;
use etude_core::prelude::*;
use etude_core::sse;

use common::{base_url, start_host};

async fn ws_echo(req: &mut WebRequest) -> WebResult<()> {
    let mut socket = ws::accept(req).await?;
    while let Some(message) = socket.recv(Deadline::in_secs(10)).await? {
        match message {
            Message::Text(text) => socket.send_text(&format!("echo: {}", text)).await?,
            Message::Binary(data) => socket.send_binary(&data).await?,
        }
    }
    Ok(())
}

fn ws_config() -> serde_json::Value {
    serde_json::json!({
        "listen": ["http://127.0.0.1:0"],
        "routes": [{"match": "/ws", "handler": "action", "methods": ["GET"]}]
    })
}

#[test]
fn test_upgrade_handshake_accept_key() {
    // S5: the sample key from RFC 6455 must produce the documented
    // accept value.
    fiber::run(async {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let host = start_host(ws_config()).await;
        host.add_action("/ws", ws_echo);
        let addr = host.local_addr().unwrap();

        let mut sock = tokio::net::TcpStream::connect(addr).await.unwrap();
        sock.write_all(
            b"GET /ws HTTP/1.1\r\n\
              Host: localhost\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

        let mut buf = vec![0u8; 1024];
        let mut filled = 0;
        while !buf[..filled].windows(4).any(|w| w == b"\r\n\r\n") {
            let n = sock.read(&mut buf[filled..]).await.unwrap();
            assert!(n > 0, "closed during handshake");
            filled += n;
        }
        let head = String::from_utf8_lossy(&buf[..filled]);
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "got: {}", head);
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(head.contains("Upgrade: websocket"));
    });
}

#[test]
fn test_websocket_echo_roundtrip() {
    fiber::run(async {
        let host = start_host(ws_config()).await;
        host.add_action("/ws", ws_echo);
        let addr = host.local_addr().unwrap();

        let mut socket = ws::connect(
            &format!("ws://127.0.0.1:{}/ws", addr.port()),
            &[],
            Deadline::in_secs(5),
        )
        .await
        .unwrap();

        socket.send_text("hello").await.unwrap();
        let reply = socket.recv(Deadline::in_secs(5)).await.unwrap();
        assert_eq!(reply, Some(Message::Text("echo: hello".to_string())));

        socket.send_binary(&[1, 2, 3]).await.unwrap();
        let reply = socket.recv(Deadline::in_secs(5)).await.unwrap();
        assert_eq!(reply, Some(Message::Binary(vec![1, 2, 3])));

        socket.close(1000, "done").await.unwrap();
        let reply = socket.recv(Deadline::in_secs(5)).await.unwrap();
        assert_eq!(reply, None);
    });
}

#[test]
fn test_websocket_rejects_missing_version() {
    fiber::run(async {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let host = start_host(ws_config()).await;
        host.add_action("/ws", ws_echo);
        let addr = host.local_addr().unwrap();

        let mut sock = tokio::net::TcpStream::connect(addr).await.unwrap();
        sock.write_all(
            b"GET /ws HTTP/1.1\r\n\
              Host: localhost\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 8\r\n\r\n",
        )
        .await
        .unwrap();
        let mut buf = Vec::new();
        sock.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf);
        assert!(text.starts_with("HTTP/1.1 426 "), "got: {}", text);
        assert!(text.contains("Sec-WebSocket-Version: 13"));
    });
}

#[test]
fn test_sse_stream_and_reconnect() {
    // S6: the reader replays Last-Event-Id on reconnect and the stream
    // resumes where it left off.
    fiber::run(async {
        let host = start_host(serde_json::json!({
            "listen": ["http://127.0.0.1:0"],
            "routes": [{"match": "/events", "handler": "action", "methods": ["GET"]}]
        }))
        .await;

        let seen: Rc<RefCell<Vec<Option<String>>>> = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        host.add_action("/events", async move |req: &mut WebRequest| {
            let last = req.headers.get("Last-Event-Id").map(str::to_string);
            log.borrow_mut().push(last.clone());
            let start: u64 = last.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0) + 1;
            sse::start_stream(req).await?;
            for id in start..start + 3 {
                let event = SseEvent::new(format!("tick-{}", id)).with_id(id.to_string());
                sse::write_event(req, &event).await?;
            }
            Ok::<(), WebError>(())
        });
        let base = base_url(&host);

        let mut reader = SseReader::new(&format!("{}/events", base)).retries(1);
        let mut ids = Vec::new();
        let mut payloads = Vec::new();
        while let Some(event) = reader.next().await.unwrap() {
            ids.push(event.id.clone().unwrap());
            payloads.push(event.data.clone());
        }
        assert_eq!(ids, ["1", "2", "3", "4", "5", "6"]);
        assert_eq!(payloads[3], "tick-4");

        // First open carried no id; the reconnect replayed the last one.
        assert_eq!(
            *seen.borrow(),
            vec![None, Some("3".to_string())]
        );
        assert_eq!(reader.last_event_id(), Some("6"));
    });
}

#[test]
fn test_sse_multiline_data() {
    fiber::run(async {
        let host = start_host(serde_json::json!({
            "listen": ["http://127.0.0.1:0"],
            "routes": [{"match": "/events", "handler": "action"}]
        }))
        .await;
        host.add_action("/events", async |req: &mut WebRequest| {
            sse::start_stream(req).await?;
            let event = SseEvent::new("line one\nline two").with_event("multi");
            sse::write_event(req, &event).await
        });
        let base = base_url(&host);

        let mut reader = SseReader::new(&format!("{}/events", base));
        let event = reader.next().await.unwrap().expect("one event");
        assert_eq!(event.event.as_deref(), Some("multi"));
        assert_eq!(event.data, "line one\nline two");
        assert_eq!(reader.next().await.unwrap(), None);
    });
}
