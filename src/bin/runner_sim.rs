use clap::{Arg, Command as ClapCommand};
use futures_util::{SinkExt, StreamExt};
use std::io::{self, Write};
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as TungsteniteMessage};
use url::Url;

use runner_broker::broker::protocol::{
    Command, CommandPayload, DecodedCommand, Event, EventPayload, decode_command, encode_body,
};

#[derive(Debug, Clone)]
struct SimConfig {
    server_url: String,
    runner_id: String,
    secret: String,
    auto_reply: bool,
}

fn ack_for(command: &Command) -> Event {
    Event::new(EventPayload::Ack)
        .with_command_id(command.id)
        .with_project_id(command.project_id.clone())
}

/// Canned replies so the broker's proxy and health paths can be exercised
/// end to end without a real runner.
fn auto_replies(command: &Command) -> Vec<Event> {
    match &command.payload {
        CommandPayload::RunnerHealthCheck {} => vec![
            Event::new(EventPayload::RunnerStatus {
                status: "healthy".to_string(),
            })
            .with_command_id(command.id)
            .with_project_id(command.project_id.clone()),
        ],
        CommandPayload::HttpProxyRequest {
            request_id, path, ..
        } => {
            let body = format!("<!doctype html><p>simulated {}</p>", path);
            vec![
                Event::new(EventPayload::HttpProxyResponse {
                    request_id: *request_id,
                    status_code: 200,
                    headers: [("content-type".to_string(), "text/html".to_string())]
                        .into_iter()
                        .collect(),
                    is_chunked: false,
                    body: Some(encode_body(body.as_bytes())),
                })
                .with_project_id(command.project_id.clone()),
            ]
        }
        CommandPayload::HmrConnect { connection_id, .. } => vec![
            Event::new(EventPayload::HmrConnected {
                connection_id: connection_id.clone(),
            })
            .with_project_id(command.project_id.clone()),
        ],
        CommandPayload::HmrMessage { connection_id, .. } => vec![
            Event::new(EventPayload::HmrMessage {
                connection_id: connection_id.clone(),
                message: "{\"type\":\"update-accepted\"}".to_string(),
            })
            .with_project_id(command.project_id.clone()),
        ],
        CommandPayload::StartDevServer { preferred_port, .. } => vec![
            Event::new(EventPayload::PortDetected {
                port: preferred_port.unwrap_or(5173),
                url: None,
            })
            .with_command_id(command.id)
            .with_project_id(command.project_id.clone()),
        ],
        _ => Vec::new(),
    }
}

async fn run(config: SimConfig) -> Result<(), Box<dyn std::error::Error>> {
    let url = Url::parse(&format!(
        "{}?runnerId={}",
        config.server_url, config.runner_id
    ))?;
    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", config.secret).parse()?,
    );

    println!("Connecting to {} as runner {}", config.server_url, config.runner_id);
    let (ws_stream, response) = connect_async(request).await?;
    println!("Connected, HTTP status {}", response.status());

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<Event>();

    // Inbound commands: print, ack, and (optionally) auto-reply
    let receive_handle = tokio::spawn({
        let event_tx = event_tx.clone();
        let auto_reply = config.auto_reply;
        async move {
            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(TungsteniteMessage::Text(text)) => match decode_command(&text) {
                        Ok(DecodedCommand::Command(command)) => {
                            println!(
                                "<- {} command {} (project {})",
                                command.command_type(),
                                command.id,
                                command.project_id
                            );
                            if event_tx.send(ack_for(&command)).is_err() {
                                break;
                            }
                            if auto_reply {
                                for event in auto_replies(&command) {
                                    println!("-> auto {}", event.event_type());
                                    if event_tx.send(event).is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Ok(DecodedCommand::Unknown { message_type, .. }) => {
                            println!("<- unknown command type {:?}, ignoring", message_type);
                        }
                        Err(e) => println!("<- unparseable frame: {}", e),
                    },
                    Ok(TungsteniteMessage::Ping(_)) => {} // pong is automatic
                    Ok(TungsteniteMessage::Close(frame)) => {
                        println!("Connection closed: {:?}", frame);
                        break;
                    }
                    Err(e) => {
                        println!("Socket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    });

    println!();
    println!("Runner simulator commands:");
    println!("  log <project> <text>      - emit a log-chunk event");
    println!("  port <project> <port>     - emit a port-detected event");
    println!("  built <project>           - emit a build-completed event");
    println!("  failed <project> <error>  - emit a build-failed event");
    println!("  json <raw>                - send a raw JSON frame");
    println!("  quit                      - exit");
    println!();

    let stdin = tokio::io::stdin();
    let mut lines = tokio::io::BufReader::new(stdin).lines();

    loop {
        print!("runner> ");
        io::stdout().flush()?;

        tokio::select! {
            event = event_rx.recv() => {
                match event {
                    Some(event) => {
                        let text = serde_json::to_string(&event)?;
                        if ws_sender.send(TungsteniteMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            },
            line = lines.next_line() => {
                let Ok(Some(input)) = line else { break };
                let input = input.trim();
                if input.is_empty() {
                    continue;
                }

                if let Some(raw) = input.strip_prefix("json ") {
                    match serde_json::from_str::<serde_json::Value>(raw) {
                        Ok(_) => {
                            if ws_sender
                                .send(TungsteniteMessage::Text(raw.to_string()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => println!("Invalid JSON: {}", e),
                    }
                    continue;
                }

                let parts: Vec<&str> = input.splitn(3, ' ').collect();
                match parts.as_slice() {
                    ["quit"] | ["exit"] | ["q"] => break,
                    ["log", project, text] => {
                        let event = Event::new(EventPayload::LogChunk {
                            chunk: text.to_string(),
                            stream: Some("stdout".to_string()),
                        })
                        .with_project_id(*project);
                        let _ = event_tx.send(event);
                    }
                    ["port", project, port] => match port.parse::<u16>() {
                        Ok(port) => {
                            let event = Event::new(EventPayload::PortDetected { port, url: None })
                                .with_project_id(*project);
                            let _ = event_tx.send(event);
                        }
                        Err(_) => println!("Usage: port <project> <port>"),
                    },
                    ["built", project] => {
                        let event = Event::new(EventPayload::BuildCompleted {
                            summary: Some("simulated build".to_string()),
                        })
                        .with_project_id(*project);
                        let _ = event_tx.send(event);
                    }
                    ["failed", project, error] => {
                        let event = Event::new(EventPayload::BuildFailed {
                            error: error.to_string(),
                        })
                        .with_project_id(*project);
                        let _ = event_tx.send(event);
                    }
                    _ => println!("Unknown command: {}", input),
                }
            },
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                if receive_handle.is_finished() {
                    println!("Receive task ended");
                    break;
                }
            }
        }
    }

    let _ = ws_sender.send(TungsteniteMessage::Close(None)).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), receive_handle).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = ClapCommand::new("Runner Simulator")
        .version("1.0")
        .about("Simulates a runner for manual broker testing")
        .arg(
            Arg::new("url")
                .short('u')
                .long("url")
                .value_name("URL")
                .help("Broker runner endpoint")
                .default_value("ws://127.0.0.1:8000/ws/runner"),
        )
        .arg(
            Arg::new("runner-id")
                .short('r')
                .long("runner-id")
                .value_name("ID")
                .help("Runner id to register as")
                .default_value("default"),
        )
        .arg(
            Arg::new("secret")
                .short('s')
                .long("secret")
                .value_name("SECRET")
                .help("Shared secret (defaults to RUNNER_SHARED_SECRET)"),
        )
        .arg(
            Arg::new("no-auto-reply")
                .long("no-auto-reply")
                .help("Disable canned replies to health/proxy/HMR commands")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let secret = matches
        .get_one::<String>("secret")
        .cloned()
        .or_else(|| std::env::var("RUNNER_SHARED_SECRET").ok())
        .unwrap_or_default();
    if secret.is_empty() {
        eprintln!("No secret provided; pass --secret or set RUNNER_SHARED_SECRET");
        std::process::exit(1);
    }

    let config = SimConfig {
        server_url: matches.get_one::<String>("url").unwrap().clone(),
        runner_id: matches.get_one::<String>("runner-id").unwrap().clone(),
        secret,
        auto_reply: !matches.get_flag("no-auto-reply"),
    };

    run(config).await
}
