use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use nbmeter::clock::SpeedLevel;
use nbmeter::packet;
use nbmeter::protocol::{Command, CommandResponse, CommandType, ProtocolHandler, StreamMessage};
use nbmeter::simulation::SimulationSnapshot;
use nbmeter::EventCategory;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8181";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("nbmeter")
        .version("0.1.0")
        .about("💧 Control client for the NB-IoT water meter simulator")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Simulator host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Simulator port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .subcommand(SubCommand::with_name("ping").about("🏓 Test connection to the simulator"))
        .subcommand(SubCommand::with_name("status").about("📊 Show meter and modem state"))
        .subcommand(
            SubCommand::with_name("flow")
                .about("🚰 Set instantaneous flow (L/h, negative for backflow)")
                .arg(number_arg("lph")),
        )
        .subcommand(
            SubCommand::with_name("temp")
                .about("🌡️  Set water temperature (°C)")
                .arg(number_arg("celsius")),
        )
        .subcommand(
            SubCommand::with_name("voltage")
                .about("🔋 Set battery voltage (V)")
                .arg(number_arg("volts")),
        )
        .subcommand(
            SubCommand::with_name("magnet")
                .about("🧲 Simulate magnet tampering")
                .arg(state_arg()),
        )
        .subcommand(
            SubCommand::with_name("leak")
                .about("💦 Simulate a leak")
                .arg(state_arg()),
        )
        .subcommand(
            SubCommand::with_name("rsrp")
                .about("📶 Set signal strength (dBm)")
                .arg(number_arg("dbm")),
        )
        .subcommand(
            SubCommand::with_name("ack-fail")
                .about("🚫 Force acknowledgement failures")
                .arg(state_arg()),
        )
        .subcommand(
            SubCommand::with_name("periods")
                .about("🗓️  Set read and report periods (hours)")
                .arg(Arg::with_name("read").help("Read period in hours").required(true))
                .arg(Arg::with_name("report").help("Report period in hours").required(true)),
        )
        .subcommand(SubCommand::with_name("force-report").about("📤 Send a report at the next read"))
        .subcommand(
            SubCommand::with_name("speed")
                .about("⏩ Set simulation speed")
                .arg(
                    Arg::with_name("level")
                        .required(true)
                        .possible_values(&["pause", "x1", "x60", "x1h", "max"]),
                ),
        )
        .subcommand(SubCommand::with_name("clear-logs").about("🧹 Clear retained logs and packets"))
        .subcommand(SubCommand::with_name("monitor").about("📡 Stream log events and packets"))
        .subcommand(
            SubCommand::with_name("decode")
                .about("🔍 Decode an uplink packet from hex (offline)")
                .arg(Arg::with_name("hex").help("Packet bytes as hex").required(true).multiple(true)),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let format = matches.value_of("format").unwrap_or("table");

    let command_type = match matches.subcommand() {
        ("decode", Some(sub)) => {
            let text = sub.values_of("hex").map(|v| v.collect::<Vec<_>>().join(" ")).unwrap_or_default();
            return decode_packet(&text, format);
        }
        ("monitor", Some(_)) => return monitor(host, port, format).await,
        ("ping", Some(_)) => CommandType::Ping,
        ("status", Some(_)) => CommandType::Status,
        ("flow", Some(sub)) => CommandType::SetFlow { lph: parse_value(sub, "lph")? },
        ("temp", Some(sub)) => CommandType::SetTemperature { celsius: parse_value(sub, "celsius")? },
        ("voltage", Some(sub)) => CommandType::SetVoltage { volts: parse_value(sub, "volts")? },
        ("magnet", Some(sub)) => CommandType::SetMagnet { detected: state_value(sub) },
        ("leak", Some(sub)) => CommandType::SetLeak { detected: state_value(sub) },
        ("rsrp", Some(sub)) => CommandType::SetRsrp { dbm: parse_value(sub, "dbm")? },
        ("ack-fail", Some(sub)) => CommandType::SetAckFail { fail: state_value(sub) },
        ("periods", Some(sub)) => CommandType::SetPeriods {
            read_hours: parse_value(sub, "read")?,
            report_hours: parse_value(sub, "report")?,
        },
        ("force-report", Some(_)) => CommandType::ForceReport,
        ("speed", Some(sub)) => CommandType::SetSpeed {
            level: match sub.value_of("level").unwrap_or("x1") {
                "pause" => SpeedLevel::Pause,
                "x60" => SpeedLevel::X60,
                "x1h" => SpeedLevel::X1H,
                "max" => SpeedLevel::Max,
                _ => SpeedLevel::X1,
            },
        },
        ("clear-logs", Some(_)) => CommandType::ClearLogs,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            return Ok(());
        }
    };

    let response = send_command(host, port, command_type.clone()).await?;
    match (format, &command_type) {
        ("json", _) => println!("{}", serde_json::to_string_pretty(&response)?),
        (_, CommandType::Status) => print_status(&response),
        _ => print_command_result(&command_type, &response),
    }

    Ok(())
}

fn number_arg(name: &str) -> Arg<'_, '_> {
    Arg::with_name(name).required(true).allow_hyphen_values(true)
}

fn state_arg() -> Arg<'static, 'static> {
    Arg::with_name("state")
        .required(true)
        .possible_values(&["on", "off"])
}

fn state_value(matches: &ArgMatches<'_>) -> bool {
    matches.value_of("state") == Some("on")
}

fn parse_value<T>(matches: &ArgMatches<'_>, name: &str) -> Result<T, Box<dyn std::error::Error>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + 'static,
{
    let raw = matches.value_of(name).ok_or_else(|| format!("missing <{}>", name))?;
    Ok(raw.parse::<T>()?)
}

async fn send_command(host: &str, port: u16, command_type: CommandType) -> Result<CommandResponse, Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", host, port);
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("{} Failed to connect to simulator at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Server is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "cargo run --bin nbmeter-simulator".bright_cyan());
            }
            return Err(e.into());
        }
    };

    let mut handler = ProtocolHandler::new();
    let command = Command {
        id: handler.next_command_id(),
        timestamp: u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0),
        command_type,
    };

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    match tokio::time::timeout(std::time::Duration::from_secs(5), async {
        writer.write_all(serde_json::to_string(&command)?.as_bytes()).await?;
        writer.write_all(b"\n").await?;

        // Stream messages may arrive before the response.
        while let Some(line) = lines.next_line().await? {
            if let Ok(response) = serde_json::from_str::<CommandResponse>(&line) {
                if response.id == command.id || response.id == 0 {
                    return Ok(response);
                }
            }
        }
        Err::<CommandResponse, Box<dyn std::error::Error>>("server closed connection".into())
    })
    .await
    {
        Ok(result) => result,
        Err(_) => {
            eprintln!("{} Command timed out after 5 seconds", "⏰".yellow());
            Err("command timeout".into())
        }
    }
}

fn print_command_result(command_type: &CommandType, response: &CommandResponse) {
    let action = format!("{:?}", command_type);
    let message = response.message.as_deref().unwrap_or("");
    match response.status {
        nbmeter::protocol::ResponseStatus::Success => {
            println!("{} {} {}", "✅".green(), action.bright_white(), message.bright_green());
        }
        nbmeter::protocol::ResponseStatus::Accepted => {
            println!("{} {} {}", "⏳".blue(), action.bright_white(), message.bright_cyan());
        }
        nbmeter::protocol::ResponseStatus::Rejected => {
            println!("{} {} rejected: {}", "❌".red(), action.bright_white(), message.bright_red());
        }
        nbmeter::protocol::ResponseStatus::Error => {
            println!("{} {} failed: {}", "⚠️".yellow(), action.bright_white(), message.bright_red());
        }
    }
}

fn print_status(response: &CommandResponse) {
    let snapshot = match response
        .message
        .as_deref()
        .map(serde_json::from_str::<SimulationSnapshot>)
    {
        Some(Ok(snapshot)) => snapshot,
        _ => {
            println!("{} Failed to parse status", "❌".red());
            return;
        }
    };

    let meter = &snapshot.meter;
    let modem = &snapshot.modem;

    println!("\n{}", "💧 Water Meter Terminal".bright_blue().bold());
    println!("{}", "═══════════════════════".bright_blue());
    println!("Virtual time:   {} ({})", snapshot.virtual_time.bright_cyan(), snapshot.speed);
    println!("Usage:          {:.3} m³", meter.usage_m3);
    println!("Flow:           {} L/h", meter.flow_lph);
    println!("Temperature:    {} °C", meter.temp_c);
    println!("Battery:        {:.1} V", meter.voltage_v);
    println!("Magnet / leak:  {} / {}", meter.magnet_detected, meter.leak_detected);

    println!("\n{}", "⏱️  Alarm timers".bright_white().bold());
    for kind in nbmeter::device::AlarmKind::ALL {
        let timer = meter.alarms.get(kind);
        let state = if timer.is_active() { "ACTIVE".bright_red() } else { "normal".green() };
        println!(
            "  {:<14} {:>7} / {:>7} ms  {}",
            kind.label(),
            timer.elapsed_ms(),
            timer.threshold_ms(),
            state
        );
    }

    println!("\n{}", "📡 Modem".bright_white().bold());
    println!("Mode:           {}", modem.mode.to_string().bright_yellow());
    println!("RSRP:           {} dBm{}", modem.rsrp_dbm, if modem.ack_fail { " (ACK failure forced)".red().to_string() } else { String::new() });
    println!("Periods:        read {}h / report {}h", modem.read_period_hours, modem.report_period_hours);
    println!("Buffered:       {} readings", modem.buffer_size);
    println!("Retries:        {}", modem.retry_count);
    println!("Packets sent:   {}", snapshot.stats.packets_sent);
}

async fn monitor(host: &str, port: u16, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "📡 Monitoring simulator (Press Ctrl+C to stop)...".bright_blue().bold());

    let stream = TcpStream::connect((host, port)).await?;
    let mut lines = BufReader::new(stream).lines();

    while let Some(line) = lines.next_line().await? {
        if format == "json" {
            println!("{}", line);
            continue;
        }
        match serde_json::from_str::<StreamMessage>(&line) {
            Ok(StreamMessage::Log(event)) => {
                let tag = format!("[{:>5}]", event.category.tag());
                let tag = match event.category {
                    EventCategory::Error => tag.bright_red(),
                    EventCategory::Alarm => tag.red().bold(),
                    EventCategory::Transmit => tag.bright_blue(),
                    EventCategory::Receive => tag.bright_green(),
                    EventCategory::MeterRead => tag.bright_cyan(),
                    EventCategory::Info => tag.white(),
                };
                println!("{} {}", tag, event.message);
            }
            Ok(StreamMessage::Packet(record)) => {
                println!("{} {}", "[  PKT]".bright_magenta(), record.hex.dimmed());
            }
            Err(_) => {}
        }
    }

    Ok(())
}

fn decode_packet(text: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = packet::from_hex(text)?;
    let decoded = packet::decode(&bytes)?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&decoded)?);
        return Ok(());
    }

    println!("\n{}", "🔍 Uplink Packet".bright_blue().bold());
    println!("{}", "════════════════".bright_blue());
    println!("Length:         {} bytes", decoded.length);
    println!("Device / net:   {} / {}", decoded.device_id, decoded.network_id);
    println!("Terminal:       {}", decoded.terminal_serial);
    println!("RSRP:           {} dBm", decoded.rsrp_dbm());
    println!("Battery:        {:.1} V", decoded.voltage_v());
    println!("Meter:          {} status {:#04X}", decoded.meter_id, decoded.meter_status);
    println!("Temperature:    {} °C", decoded.temperature_c);
    println!("Periods:        read {}h / report {}h", decoded.read_period_hours, decoded.report_period_hours);
    println!("Timestamp:      {}", decoded.time);
    println!("Readings:       {}", decoded.reading_count);
    for (i, value) in decoded.readings_m3().iter().enumerate() {
        println!("  {:>2}: {:.3} m³", i, value);
    }
    println!("Checksum:       {:#04X} {}", decoded.checksum, "✓".green());

    Ok(())
}
