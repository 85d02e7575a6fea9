//! The engine on a real socket: `TokioScheduler` against a scripted server.

use std::rc::Rc;
use std::time::Duration;

use idlewire::{Command, Condition, Session, SessionConfig, TokioScheduler};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Minimal server: greets, answers `status`, reports a player change on the
/// first `idle`, and returns every line it received once the client leaves.
async fn scripted_server(listener: TcpListener) -> Vec<String> {
    let (stream, _) = listener.accept().await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    write.write_all(b"OK MPD 0.23.5\n").await.unwrap();

    let mut seen = Vec::new();
    let mut idles = 0;
    while let Ok(Some(line)) = lines.next_line().await {
        match line.as_str() {
            "status" => write.write_all(b"volume: 40\nstate: play\nOK\n").await.unwrap(),
            "idle" => {
                idles += 1;
                if idles == 1 {
                    write.write_all(b"changed: player\nOK\n").await.unwrap();
                }
            }
            "noidle" => write.write_all(b"OK\n").await.unwrap(),
            _ => write.write_all(b"ACK [5@0] {} unknown command\n").await.unwrap(),
        }
        seen.push(line);
    }
    seen
}

#[tokio::test(flavor = "current_thread")]
async fn test_status_then_event_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(scripted_server(listener));

    let local = tokio::task::LocalSet::new();
    let (state, fired) = local
        .run_until(async move {
            let config = SessionConfig {
                idle_when_unobserved: false,
                ..SessionConfig::default()
            };
            let session = Session::new(Rc::new(TokioScheduler::new()), config);
            session.connect("127.0.0.1", port, None).unwrap();

            let (tx, rx) = tokio::sync::oneshot::channel();
            let task = session
                .spawn("status-then-wait", move |ctx| async move {
                    let status = ctx.command(Command::new("status")).await?;
                    let fired = ctx
                        .wait([Condition::event("player"), Condition::timeout_ms(2000)])
                        .await?;
                    let _ = tx.send((status.get("state").map(str::to_string), fired));
                    Ok(())
                })
                .unwrap();

            let result = tokio::time::timeout(Duration::from_secs(5), rx)
                .await
                .expect("task did not finish in time")
                .unwrap();
            assert!(task.is_closed());
            assert_eq!(session.protocol_version().as_deref(), Some("0.23.5"));
            session.disconnect();
            result
        })
        .await;
    // Aborted socket tasks only release the stream when the set is dropped.
    drop(local);

    assert_eq!(state.as_deref(), Some("play"));
    assert_eq!(fired, vec![Condition::event("player")]);

    let seen = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not see the disconnect")
        .unwrap();
    assert_eq!(&seen[..2], ["status", "idle"]);
}
