// crates/server/tests/gateway_test.rs
//! WebSocket gateway integration tests against a real listener.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_stream::{self as stream};
use tokio_tungstenite::tungstenite::Message;

use jobstream_db::Database;
use jobstream_server::{create_app, AppState, JobRunner, ProgressBus, RunnerConfig};
use jobstream_types::{ItemOutcome, JobStatus, ProgressEvent};

async fn spawn_server() -> (SocketAddr, Database, JobRunner, ProgressBus) {
    let db = Database::new_in_memory().await.unwrap();
    let bus = ProgressBus::new();
    let runner = JobRunner::new(
        db.clone(),
        bus.clone(),
        RunnerConfig {
            max_concurrent_jobs: 4,
            throttle_percent: 5,
        },
    );
    let app = create_app(AppState::new(db.clone(), bus.clone(), runner.clone()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, db, runner, bus)
}

async fn connect(addr: SocketAddr) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("websocket connect");
    socket
}

fn subscribe_frame(job_id: &str) -> Message {
    Message::Text(format!(r#"{{"type":"subscribe","job_id":"{job_id}"}}"#).into())
}

#[tokio::test]
async fn subscribed_client_receives_ordered_events_through_terminal() {
    let (addr, db, runner, _bus) = spawn_server().await;

    // Create the job pending, subscribe, then start it: the live stream
    // begins before any event is published.
    let job = jobstream_db::create_job(&db, 40).await.unwrap();
    let mut socket = connect(addr).await;
    socket.send(subscribe_frame(&job.id)).await.unwrap();

    // Give the gateway a moment to register the subscription.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let run = {
        let runner = runner.clone();
        let job_id = job.id.clone();
        tokio::spawn(async move {
            runner
                .start(&job_id, stream::iter(vec![ItemOutcome::Ok; 40]))
                .await
                .unwrap();
        })
    };

    let mut seen: Vec<ProgressEvent> = Vec::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for progress frame")
            .expect("socket closed early")
            .expect("socket error");
        if let Message::Text(text) = frame {
            let event: ProgressEvent = serde_json::from_str(&text).unwrap();
            let terminal = event.status.is_terminal();
            seen.push(event);
            if terminal {
                break;
            }
        }
    }
    run.await.unwrap();

    // Relay is verbatim and ordered; done counts never regress.
    for pair in seen.windows(2) {
        assert!(pair[0].sequence < pair[1].sequence);
        assert!(pair[0].done_items() <= pair[1].done_items());
    }
    let last = seen.last().unwrap();
    assert_eq!(last.status, JobStatus::Completed);
    assert_eq!(last.processed_items, 40);
}

#[tokio::test]
async fn slow_or_absent_subscribers_do_not_block_each_other() {
    let (addr, db, runner, _bus) = spawn_server().await;

    let job = jobstream_db::create_job(&db, 20).await.unwrap();

    // One live client, one connection that never subscribes.
    let mut live = connect(addr).await;
    let mut idle = connect(addr).await;
    live.send(subscribe_frame(&job.id)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    runner
        .start(&job.id, stream::iter(vec![ItemOutcome::Ok; 20]))
        .await
        .unwrap();

    // The live client still reaches the terminal event.
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), live.next())
            .await
            .expect("live client starved")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = frame {
            let event: ProgressEvent = serde_json::from_str(&text).unwrap();
            if event.status.is_terminal() {
                break;
            }
        }
    }

    // The idle connection got nothing and is still healthy.
    let nothing = tokio::time::timeout(Duration::from_millis(100), idle.next()).await;
    assert!(nothing.is_err(), "unsubscribed connection received a frame");
}

#[tokio::test]
async fn unsubscribe_stops_delivery_and_is_idempotent() {
    let (addr, db, runner, _bus) = spawn_server().await;
    let job = jobstream_db::create_job(&db, 10).await.unwrap();

    let mut socket = connect(addr).await;
    socket.send(subscribe_frame(&job.id)).await.unwrap();
    let unsub = Message::Text(
        format!(r#"{{"type":"unsubscribe","job_id":"{}"}}"#, job.id).into(),
    );
    socket.send(unsub.clone()).await.unwrap();
    socket.send(unsub).await.unwrap(); // repeated unsubscribe is safe
    tokio::time::sleep(Duration::from_millis(50)).await;

    runner
        .start(&job.id, stream::iter(vec![ItemOutcome::Ok; 10]))
        .await
        .unwrap();

    let nothing = tokio::time::timeout(Duration::from_millis(150), socket.next()).await;
    assert!(nothing.is_err(), "received a frame after unsubscribe");
}

#[tokio::test]
async fn malformed_control_frame_gets_error_reply() {
    let (addr, _db, _runner, _bus) = spawn_server().await;

    let mut socket = connect(addr).await;
    socket
        .send(Message::Text(r#"{"bogus":true}"#.into()))
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .expect("no error reply")
        .unwrap()
        .unwrap();
    let Message::Text(text) = frame else {
        panic!("expected text error frame");
    };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert!(value.get("error").is_some());
}
