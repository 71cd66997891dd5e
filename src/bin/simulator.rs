use clap::{App, Arg};
use nbmeter::clock::SpeedLevel;
use nbmeter::events::TracingSink;
use nbmeter::protocol::{Command, CommandResponse, CommandType, ProtocolHandler, ResponseStatus, StreamMessage};
use nbmeter::{SimulationConfig, SimulationContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time;
use tracing::{error, info, warn};

const DEFAULT_PORT: &str = "8181";
const STREAM_BROADCAST_BUFFER_SIZE: usize = 256;
// Driving cadence; virtual time only depends on the wall-clock delta.
const FRAME_PERIOD_MS: u64 = 50;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("nbmeter-simulator")
        .version("0.1.0")
        .about("💧 NB-IoT water meter terminal simulator")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Control port")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("speed")
                .short("s")
                .long("speed")
                .value_name("LEVEL")
                .help("Initial speed (0=PAUSE, 1=x1, 2=x60, 3=x1H, 4=MAX)")
                .takes_value(true)
                .possible_values(&["0", "1", "2", "3", "4"]),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => SimulationConfig::load(path)?,
        None => SimulationConfig::default(),
    };
    if let Some(level) = matches
        .value_of("speed")
        .and_then(|v| v.parse::<u8>().ok())
        .and_then(SpeedLevel::from_index)
    {
        config.speed = level;
    }
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;

    println!("💧 NB-IoT Water Meter Simulator");
    println!("===============================");

    let mut context = SimulationContext::new(&config)?;
    context.add_sink(Box::new(TracingSink));
    let context = Arc::new(Mutex::new(context));

    let (stream_tx, _) = broadcast::channel(STREAM_BROADCAST_BUFFER_SIZE);

    let tcp_context = Arc::clone(&context);
    let tcp_stream_tx = stream_tx.clone();
    let tcp_server = tokio::spawn(async move {
        if let Err(e) = start_tcp_server(port, tcp_context, tcp_stream_tx).await {
            error!("TCP server error: {}", e);
        }
    });

    let mut interval = time::interval(Duration::from_millis(FRAME_PERIOD_MS));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = {
                    let mut guard = context.lock().await;
                    guard.tick()
                };

                for event in report.logs {
                    broadcast_message(&stream_tx, &StreamMessage::Log(event));
                }
                for record in report.packets {
                    broadcast_message(&stream_tx, &StreamMessage::Packet(record));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    tcp_server.abort();
    println!("💤 Water meter simulator stopped");

    Ok(())
}

fn broadcast_message(tx: &broadcast::Sender<String>, message: &StreamMessage) {
    match serde_json::to_string(message) {
        Ok(line) => {
            // No subscribers is not an error.
            let _ = tx.send(line);
        }
        Err(e) => warn!("Failed to serialize stream message: {}", e),
    }
}

async fn start_tcp_server(
    port: u16,
    context: Arc<Mutex<SimulationContext>>,
    stream_tx: broadcast::Sender<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!("🌐 Control server listening on port {}", port);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("🔗 New client connected: {}", addr);
                let client_context = Arc::clone(&context);
                let client_stream_rx = stream_tx.subscribe();

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_context, client_stream_rx).await {
                        warn!("Client {} error: {}", addr, e);
                    }
                    info!("🔌 Client {} disconnected", addr);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    context: Arc<Mutex<SimulationContext>>,
    mut stream_rx: broadcast::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));

    let stream_writer = Arc::clone(&writer);
    let stream_task = tokio::spawn(async move {
        loop {
            match stream_rx.recv().await {
                Ok(line) => {
                    let mut guard = stream_writer.lock().await;
                    if guard.write_all(line.as_bytes()).await.is_err() || guard.write_all(b"\n").await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Client stream lagged, {} messages skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut handler = ProtocolHandler::new();
    let mut line = String::new();
    loop {
        line.clear();
        if buf_reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match handler.parse_command(trimmed) {
            Ok(command) => {
                info!("📨 Received command: {:?}", command.command_type);
                execute_command(&mut handler, &context, command).await
            }
            Err(e) => {
                error!("Failed to parse command: {}", e);
                handler.create_response(0, wall_clock_ms(), ResponseStatus::Error, Some(&e.to_string()))
            }
        };

        let response_json = handler.serialize_response(&response)?.to_string();
        let mut guard = writer.lock().await;
        guard.write_all(response_json.as_bytes()).await?;
        guard.write_all(b"\n").await?;
    }

    stream_task.abort();
    Ok(())
}

async fn execute_command(
    handler: &mut ProtocolHandler,
    context: &Arc<Mutex<SimulationContext>>,
    command: Command,
) -> CommandResponse {
    let now = wall_clock_ms();

    if let Err(e) = handler.validate_command(&command) {
        return handler.create_response(command.id, now, ResponseStatus::Rejected, Some(&e.to_string()));
    }

    let mut guard = context.lock().await;
    match &command.command_type {
        CommandType::Ping => handler.create_response(command.id, now, ResponseStatus::Success, Some("pong")),
        CommandType::Status => match serde_json::to_string(&guard.snapshot()) {
            Ok(snapshot) => handler.create_response(command.id, now, ResponseStatus::Success, Some(&snapshot)),
            Err(e) => handler.create_response(command.id, now, ResponseStatus::Error, Some(&e.to_string())),
        },
        CommandType::ClearLogs => {
            guard.clear_history();
            handler.create_response(command.id, now, ResponseStatus::Success, None)
        }
        deferred => match guard.submit_command(deferred) {
            Ok(()) => handler.create_response(command.id, now, ResponseStatus::Accepted, Some("applied on next tick")),
            Err(e) => handler.create_response(command.id, now, ResponseStatus::Rejected, Some(&e.to_string())),
        },
    }
}

fn wall_clock_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
