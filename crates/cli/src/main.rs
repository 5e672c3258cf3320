use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "webbridge")]
#[command(about = "webbridge CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: WEBBRIDGE_CONFIG_PATH or ~/.webbridge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the bridge server (HTTP + WebSocket for web clients, one upstream gateway connection per client).
    Serve {
        /// Config file path (default: WEBBRIDGE_CONFIG_PATH or ~/.webbridge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// WebSocket and HTTP port (default from config or 15252)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Chat through a running bridge server (interactive).
    Chat {
        /// Config file path (default: WEBBRIDGE_CONFIG_PATH or ~/.webbridge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("webbridge {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Serve { config, port }) => {
            if let Err(e) = run_serve(config, port).await {
                log::error!("server failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat { config }) => {
            if let Err(e) = run_chat(config).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let _dir = lib::init::init_config_dir(&path)?;
    println!(
        "initialized configuration at {}",
        path.parent()
            .unwrap_or(std::path::Path::new("."))
            .display()
    );
    Ok(())
}

async fn run_serve(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, _path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.server.port = p;
    }
    log::info!(
        "starting bridge server on {}:{} (gateway {})",
        config.server.bind,
        config.server.port,
        config.gateway.url
    );
    lib::server::run_server(config).await
}

/// Interactive chat against a running bridge server. Responses stream in as
/// they arrive, so inbound frames are printed concurrently with the prompt.
async fn run_chat(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    let bind = config.server.bind.trim();
    let port = config.server.port;
    let mut ws_url = format!("ws://{}:{}/ws", bind, port);
    if let Some(token) = lib::config::resolve_server_token(&config) {
        ws_url = format!("{}?token={}", ws_url, token);
    }

    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url).await?;

    // stdin has no async story here; a plain thread feeding a channel keeps
    // the select loop simple.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if line_tx.send(line.trim().to_string()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    println!("connected to {} (/exit to quit)", ws_url);
    loop {
        tokio::select! {
            line = line_rx.recv() => {
                let Some(input) = line else { break };
                if input.is_empty() {
                    continue;
                }
                if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
                    break;
                }
                let frame = serde_json::json!({ "type": "message", "text": input });
                ws.send(Message::Text(frame.to_string())).await?;
            }
            msg = ws.next() => {
                let Some(msg) = msg else {
                    eprintln!("server closed the connection");
                    break;
                };
                let Message::Text(text) = msg? else { continue };
                let frame: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                print_notification(&frame);
            }
        }
    }

    Ok(())
}

fn print_notification(frame: &serde_json::Value) {
    use std::io::Write;

    match frame.get("type").and_then(|v| v.as_str()) {
        Some("connected") => {
            println!("[gateway connected]");
        }
        Some("response") => {
            if let Some(content) = frame.get("content").and_then(|v| v.as_str()) {
                print!("{}", content);
                let _ = std::io::stdout().flush();
            }
        }
        Some("response_complete") => {
            println!();
        }
        Some("error") => {
            eprintln!("error: {}", frame.get("error").unwrap_or(&serde_json::Value::Null));
        }
        _ => {
            println!("{}", frame);
        }
    }
}
