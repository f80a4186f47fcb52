use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use stockbot::execution::{RollingSeriesStore, SeriesField};
use stockbot::feed::{ConnectionState, ConnectionSupervisor, FeedConfig, FeedError};
use stockbot::models::Tick;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

fn trade_frame(symbol: &str, hhmmss: &str, price: u64, volume: u64) -> String {
    let mut fields = vec!["0".to_string(); 46];
    fields[0] = symbol.to_string();
    fields[1] = hhmmss.to_string();
    fields[2] = price.to_string();
    fields[12] = volume.to_string();
    format!("0|H0STCNT0|001|{}", fields.join("^"))
}

fn fast_config(max_attempts: u32) -> FeedConfig {
    FeedConfig {
        max_reconnect_attempts: max_attempts,
        reconnect_base_ms: 20,
        reconnect_max_ms: 50,
        subscribe_spacing_ms: 0,
        ..Default::default()
    }
}

async fn recv_tick(rx: &mut mpsc::Receiver<Tick>) -> Tick {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("tick within 5s")
        .expect("feed channel open")
}

/// Refuses the first `refuse` handshakes, then serves one session per entry
/// of `sessions`, closing every session but the last.
async fn serve(listener: TcpListener, refuse: usize, sessions: Vec<Vec<String>>) {
    for _ in 0..refuse {
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
    }

    let last = sessions.len().saturating_sub(1);
    for (i, frames) in sessions.into_iter().enumerate() {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        // Subscription request first
        let request = ws.next().await.unwrap().unwrap();
        assert!(request.to_text().unwrap().contains("H0STCNT0"));

        for frame in frames {
            ws.send(Message::Text(frame)).await.unwrap();
        }

        if i < last {
            ws.close(None).await.unwrap();
        } else {
            while let Some(Ok(_)) = ws.next().await {}
        }
    }
}

#[tokio::test]
async fn test_reconnect_backoff_and_no_duplicate_after_resume() {
    let _ = tracing_subscriber::fmt::try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let a = trade_frame("005930", "091500", 71000, 10);
    let b = trade_frame("005930", "091501", 71100, 5);
    let c = trade_frame("005930", "091502", 71200, 3);
    let server = tokio::spawn(serve(
        listener,
        3,
        vec![vec![a, b.clone()], vec![b, c]],
    ));

    let (tx, mut rx) = mpsc::channel(64);
    let (supervisor, handle) =
        ConnectionSupervisor::new(fast_config(5), url, "approval", vec!["005930".into()], tx);
    let feed = tokio::spawn(supervisor.run());

    let mut store = RollingSeriesStore::new(200);
    for _ in 0..3 {
        let tick = recv_tick(&mut rx).await;
        store.record_tick(&tick.symbol, tick.price, tick.volume as f64, tick.timestamp);
    }

    // The replayed tick never arrives
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err()
    );

    assert_eq!(
        store.recent("005930", SeriesField::Price, None),
        vec![71000.0, 71100.0, 71200.0]
    );
    assert_eq!(handle.state(), ConnectionState::Connected);

    // Three refused handshakes: strictly increasing up to the cap
    let delays = handle.reconnect_delays();
    assert!(delays.len() >= 3);
    assert!(delays[0] < delays[1] && delays[1] < delays[2]);
    assert_eq!(delays[2], Duration::from_millis(50));

    handle.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(5), feed)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    server.abort();
}

#[tokio::test]
async fn test_exhausted_attempts_report_failed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(serve(listener, 10, Vec::new()));

    let (tx, _rx) = mpsc::channel(8);
    let (supervisor, handle) =
        ConnectionSupervisor::new(fast_config(3), url, "approval", vec!["005930".into()], tx);

    let result = tokio::time::timeout(Duration::from_secs(5), supervisor.run())
        .await
        .unwrap();

    assert!(matches!(result, Err(FeedError::Exhausted { attempts: 3 })));
    assert_eq!(handle.state(), ConnectionState::Failed);
    assert_eq!(handle.reconnect_delays().len(), 2);
    server.abort();
}

#[tokio::test]
async fn test_pingpong_is_echoed_and_targets_resubscribe() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _subscribe = ws.next().await.unwrap().unwrap();

        let ping = r#"{"header":{"tr_id":"PINGPONG","datetime":"20240304091500"}}"#;
        ws.send(Message::Text(ping.to_string())).await.unwrap();
        let echo = ws.next().await.unwrap().unwrap();
        assert_eq!(echo.to_text().unwrap(), ping);

        // After set_targets: unsubscribe 005930, subscribe 000660
        let mut requests = Vec::new();
        for _ in 0..2 {
            requests.push(ws.next().await.unwrap().unwrap().to_text().unwrap().to_string());
        }
        requests
    });

    let (tx, _rx) = mpsc::channel(8);
    let (supervisor, handle) =
        ConnectionSupervisor::new(fast_config(3), url, "approval", vec!["005930".into()], tx);
    let feed = tokio::spawn(supervisor.run());

    while !handle.is_connected() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handle.set_targets(vec!["000660".into()]).await);

    let requests = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert!(requests[0].contains("\"tr_type\":\"2\"") && requests[0].contains("005930"));
    assert!(requests[1].contains("\"tr_type\":\"1\"") && requests[1].contains("000660"));

    handle.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(5), feed).await;
}
