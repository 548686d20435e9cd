// ABOUTME: Line-oriented chat client - a thin front end over the Session interface
// ABOUTME: /msg, /list and /quit commands; any other input is broadcast to the room

use argh::FromArgs;
use chathub::codec::FrameType;
use chathub::config::{DEFAULT_FIFO_DIR, DEFAULT_PORT, DEFAULT_SERVER_FIFO};
use chathub::session::{DisconnectReason, Endpoint, Event, InboundFrame, Session};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{Level, error};
use tracing_subscriber::FmtSubscriber;

/// Chat client
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debug logging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// the user name to register
    #[argh(option, short = 'n')]
    name: String,

    /// transport backend, "pipe" or "tls" (default: pipe)
    #[argh(option, short = 't')]
    transport: Option<String>,

    /// hub address for the tls transport (default: localhost:8990)
    #[argh(option)]
    addr: Option<String>,

    /// name on the hub's certificate (default: the host part of --addr)
    #[argh(option)]
    server_name: Option<String>,

    /// trust anchor in PEM format (tls transport)
    #[argh(option)]
    ca: Option<PathBuf>,

    /// inbound pipe path of the hub (default: /tmp/chat_server_fifo)
    #[argh(option)]
    fifo: Option<PathBuf>,

    /// directory for per-client reply pipes (default: /tmp)
    #[argh(option)]
    fifo_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.debugging {
            Level::DEBUG
        } else {
            Level::WARN
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let endpoint = match args.transport.as_deref().unwrap_or("pipe") {
        "pipe" => Endpoint::Pipe {
            server_path: args
                .fifo
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVER_FIFO)),
            client_dir: args
                .fifo_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FIFO_DIR)),
        },
        "tls" => {
            let Some(ca) = args.ca else {
                error!("tls transport requires --ca");
                return ExitCode::FAILURE;
            };
            let addr = args
                .addr
                .unwrap_or_else(|| format!("localhost:{DEFAULT_PORT}"));
            let server_name = args.server_name.unwrap_or_else(|| {
                addr.rsplit_once(':')
                    .map(|(host, _)| host.to_owned())
                    .unwrap_or_else(|| addr.clone())
            });
            Endpoint::Tls {
                addr,
                server_name,
                ca,
            }
        }
        other => {
            error!("unknown transport {other:?} (expected \"pipe\" or \"tls\")");
            return ExitCode::FAILURE;
        }
    };

    let mut session = match Session::connect(endpoint, &args.name).await {
        Ok(session) => session,
        Err(err) => {
            error!("could not connect: {err}");
            return ExitCode::FAILURE;
        }
    };
    println!("Connected as {}. /msg <user> <text>, /list, /quit.", args.name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_line(&mut session, line.trim()).await {
                            break;
                        }
                    }
                    // stdin closed: leave politely.
                    Ok(None) | Err(_) => {
                        let _ = session.leave().await;
                        break;
                    }
                }
            }
            event = session.next_event() => {
                match event {
                    Some(Event::Frame(frame)) => render(&session, &frame),
                    Some(Event::Disconnected(reason)) => {
                        match reason {
                            DisconnectReason::Fatal(text) => println!("Disconnected: {text}"),
                            DisconnectReason::TransportClosed => println!("Lost connection to server"),
                            DisconnectReason::UserLeave => {}
                        }
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    ExitCode::SUCCESS
}

/// Returns false when the user asked to quit.
async fn handle_line(session: &mut Session, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    let result = if line == "/quit" {
        let _ = session.leave().await;
        return false;
    } else if line == "/list" {
        session.request_list().await
    } else if let Some(rest) = line.strip_prefix("/msg ") {
        match rest.split_once(' ') {
            Some((to, text)) => session.send_private(to, text.as_bytes()).await,
            None => {
                println!("usage: /msg <user> <text>");
                return true;
            }
        }
    } else {
        session.send_broadcast(line.as_bytes()).await
    };

    if let Err(err) = result {
        println!("send failed: {err}");
    }
    true
}

fn render(session: &Session, frame: &InboundFrame) {
    let content = String::from_utf8_lossy(&frame.content);
    if frame.is_system() {
        match frame.kind {
            FrameType::Join => println!("* User {} joined the chat", frame.dest),
            FrameType::Leave => println!("* User {} left the chat", frame.dest),
            FrameType::List => println!("Online users: {content}"),
            FrameType::Error => println!("Server error: {content}"),
            _ => println!("Server: {content}"),
        }
        return;
    }
    match frame.kind {
        FrameType::Msg => println!("<{}> {}", frame.source, content),
        FrameType::Priv if frame.source == session.name().as_str() => {
            println!("To <{}>: {}", frame.dest, content)
        }
        FrameType::Priv => println!("From <{}>: {}", frame.source, content),
        _ => println!("{}: {}", frame.source, content),
    }
}
