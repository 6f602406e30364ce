//! Line-oriented operator shell.
//!
//! Commands are read from stdin; everything the link reports arrives on the
//! event channel and is printed as it comes in. Slow operations run on their
//! own task so `disconnect` can interrupt a connect that hangs.

use crate::domain::models::{AppEvent, InboundEvent, MessageSeverity, PeripheralHandle};
use crate::infrastructure::bluetooth::connection::DisconnectOutcome;
use crate::infrastructure::bluetooth::BluetoothService;
use crate::infrastructure::csv_sink::CsvSink;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Rows shown after an upload
const PREVIEW_ROWS: usize = 10;

pub const HELP: &str = "\
Commands:
  scan            discover peripherals (results are appended)
  devices         list discovered peripherals
  clear           forget discovered peripherals
  connect <n>     connect to peripheral number n
  send [text]     write text to the peripheral (default: hello)
  csv             wait for a CSV transfer
  upload          store the received CSV and show a preview
  status          show link status
  log             show text received so far
  disconnect      close the link or cancel a pending connect
  help            show this help
  quit            exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Scan,
    Devices,
    Clear,
    Connect(usize),
    Send(String),
    Csv,
    Upload,
    Status,
    Log,
    Disconnect,
    Help,
    Quit,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}', type 'help' for a list")]
    Unknown(String),

    #[error("'{0}' needs an argument")]
    MissingArgument(&'static str),

    #[error("'{0}' is not a device number")]
    InvalidIndex(String),
}

impl FromStr for ShellCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word.to_lowercase().as_str() {
            "" => Err(CommandError::Empty),
            "scan" => Ok(Self::Scan),
            "devices" | "ls" => Ok(Self::Devices),
            "clear" => Ok(Self::Clear),
            "connect" => {
                if rest.is_empty() {
                    return Err(CommandError::MissingArgument("connect"));
                }
                rest.parse()
                    .map(Self::Connect)
                    .map_err(|_| CommandError::InvalidIndex(rest.to_string()))
            }
            "send" => Ok(Self::Send(rest.to_string())),
            "csv" => Ok(Self::Csv),
            "upload" => Ok(Self::Upload),
            "status" => Ok(Self::Status),
            "log" => Ok(Self::Log),
            "disconnect" => Ok(Self::Disconnect),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

/// One printable line per event; `None` for events only the log cares about
pub fn render_event(event: &AppEvent) -> Option<String> {
    match event {
        AppEvent::DeviceFound(device) => Some(format!("  found {}", describe(device))),
        AppEvent::ConnectionStatus(status) => Some(format!("[{}]", status)),
        AppEvent::Inbound(InboundEvent::TextReceived(text)) => Some(format!("< {}", text)),
        AppEvent::Inbound(InboundEvent::CsvFragmentReceived {
            fragment_len,
            buffered_len,
        }) => Some(format!(
            "  csv +{} bytes ({} buffered)",
            fragment_len, buffered_len
        )),
        AppEvent::Inbound(InboundEvent::CsvComplete(_))
        | AppEvent::Inbound(InboundEvent::DecodeAnomaly { .. }) => None,
        AppEvent::LogMessage(msg) => {
            let tag = match msg.severity {
                MessageSeverity::Info => "info",
                MessageSeverity::Success => " ok ",
                MessageSeverity::Warning => "warn",
                MessageSeverity::Error => "FAIL",
            };
            Some(format!("{} | {}", tag, msg.message))
        }
    }
}

fn describe(device: &PeripheralHandle) -> String {
    match device.signal_strength {
        Some(rssi) => format!("{} [{}] {} dBm", device.display_name(), device.id, rssi),
        None => format!("{} [{}]", device.display_name(), device.id),
    }
}

/// Run the shell until `quit` or end of input
pub async fn run(
    service: Arc<BluetoothService>,
    sink: Arc<dyn CsvSink>,
    mut events: mpsc::UnboundedReceiver<AppEvent>,
) -> anyhow::Result<()> {
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(line) = render_event(&event) {
                println!("{}", line);
            }
        }
    });

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match line.parse::<ShellCommand>() {
            Ok(command) => command,
            Err(CommandError::Empty) => continue,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };
        debug!("Shell command: {:?}", command);

        if command == ShellCommand::Quit {
            break;
        }
        execute(&service, &sink, command);
    }

    info!("Shutting down");
    if service.is_connected() {
        service.disconnect().await;
    }
    printer.abort();
    Ok(())
}

fn execute(service: &Arc<BluetoothService>, sink: &Arc<dyn CsvSink>, command: ShellCommand) {
    match command {
        ShellCommand::Scan => {
            let service = service.clone();
            tokio::spawn(async move {
                // Failures are reported on the event channel
                let _ = service.scan().await;
            });
        }
        ShellCommand::Devices => {
            let devices = service.devices();
            if devices.is_empty() {
                println!("No devices discovered yet, try 'scan'");
            }
            for (index, device) in devices.iter().enumerate() {
                println!("{:>3}  {}", index, describe(device));
            }
        }
        ShellCommand::Clear => service.clear_devices(),
        ShellCommand::Connect(index) => {
            let service = service.clone();
            tokio::spawn(async move {
                let _ = service.connect_index(index).await;
            });
        }
        ShellCommand::Send(text) => {
            let service = service.clone();
            tokio::spawn(async move {
                let _ = service.send(&text).await;
            });
        }
        ShellCommand::Csv => {
            service.start_capture();
        }
        ShellCommand::Upload => {
            let service = service.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                if let Ok(table) = service.upload_csv(sink.as_ref()).await {
                    println!("{}", table.columns.join(", "));
                    for row in table.preview(PREVIEW_ROWS) {
                        let fields: Vec<&str> = table
                            .columns
                            .iter()
                            .map(|c| row.get(c).map(String::as_str).unwrap_or(""))
                            .collect();
                        println!("{}", fields.join(", "));
                    }
                }
            });
        }
        ShellCommand::Status => {
            println!("Status: {}", service.status());
            if let Some(peripheral) = service.connected_peripheral() {
                println!("Device: {}", describe(&peripheral));
            }
            println!(
                "Transfer: {:?}, {} byte(s) buffered, CSV ready: {}",
                service.transfer_mode(),
                service.buffered_len(),
                service.csv_ready()
            );
        }
        ShellCommand::Log => {
            let log = service.text_log();
            if log.is_empty() {
                println!("(nothing received)");
            } else {
                println!("{}", log);
            }
        }
        ShellCommand::Disconnect => {
            let service = service.clone();
            tokio::spawn(async move {
                if service.disconnect().await == DisconnectOutcome::Cancelled {
                    println!("Connection attempt cancelled");
                }
            });
        }
        ShellCommand::Help => println!("{}", HELP),
        ShellCommand::Quit => {}
    }
}
