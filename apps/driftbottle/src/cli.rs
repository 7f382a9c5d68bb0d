use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::protocol::{ClientFrame, ServerFrame};

/// Interactive chat client: prints server frames, sends stdin lines as
/// chat. `/leave` ends the room, ctrl-d just disconnects.
pub async fn run_debug_client(url: String, user: String, want: Option<String>) -> Result<()> {
    let mut ws_url = format!("{}/ws?user={}", url.trim_end_matches('/'), user);
    if let Some(want) = &want {
        ws_url.push_str(&format!("&want={want}"));
    }

    let (ws_stream, _) = timeout(Duration::from_secs(5), connect_async(&ws_url))
        .await
        .context("connection timeout - is the server running?")?
        .with_context(|| format!("failed to connect to {ws_url}"))?;
    let (mut write, mut read) = ws_stream.split();
    println!("connected as {user}; type to chat, /leave to end the room");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            message = read.next() => {
                let message = match message {
                    None => break,
                    Some(Err(err)) => {
                        eprintln!("connection error: {err}");
                        break;
                    }
                    Some(Ok(message)) => message,
                };
                match message {
                    Message::Text(text) => render_frame(&text),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let frame = if line == "/leave" {
                    ClientFrame::Leave
                } else {
                    ClientFrame::Chat { content: line }
                };
                let text = serde_json::to_string(&frame)?;
                write.send(Message::Text(text.into())).await?;
            }
        }
    }
    let _ = write.send(Message::Close(None)).await;
    Ok(())
}

fn render_frame(text: &str) {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(ServerFrame::Pairing) => println!("· waiting for a partner..."),
        Ok(ServerFrame::Paired { room_id }) => println!("· paired! (room {room_id})"),
        Ok(ServerFrame::InRoom { room_id }) => println!("· back in room {room_id}"),
        Ok(ServerFrame::RoomClosed) => println!("· the room closed"),
        Ok(ServerFrame::Chat { from, content, .. }) => println!("<{from}> {content}"),
        Ok(ServerFrame::Error { kind }) => eprintln!("server error: {kind:?}"),
        Err(_) => println!("?? {text}"),
    }
}
