// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use sockline::service::{setup_local_tracing, setup_tracing};
use sockline::{
    AppError, AppResult, ClientId, Endpoint, MessageChannel, MultiClientServer,
    ServerMessageChannel, SocketConfig, TcpClient,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Command,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// relay every message to all other connected clients
    Serve,
    /// send stdin lines as messages, print incoming messages
    Connect,
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline: CommandLine = CommandLine::parse();

    if std::env::var("RUST_LOG").is_err() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    let config = match commandline.conf.as_ref() {
        Some(path) => SocketConfig::set_up_config(PathBuf::from(path))?,
        None => {
            let default_path = PathBuf::from("./conf.toml");
            if default_path.exists() {
                SocketConfig::set_up_config(default_path)?
            } else {
                SocketConfig::default()
            }
        }
    };

    if let Command::PrintConfig = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let _guard = match config.log_dir.as_deref() {
        Some(log_dir) => Some(setup_tracing(log_dir)?),
        None => {
            setup_local_tracing()?;
            None
        }
    };

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    match commandline.command {
        Command::Serve => rt.block_on(serve(config)),
        Command::Connect => rt.block_on(connect(config)),
        Command::PrintConfig => Ok(()),
    }
}

async fn serve(config: SocketConfig) -> AppResult<()> {
    let endpoint = Endpoint::new(config.network.ip.as_str(), config.network.port)?;
    let server = Arc::new(MultiClientServer::new(
        endpoint,
        config.connection.clone(),
        config.posture,
    ));
    let channel = ServerMessageChannel::attach(&server);

    let (tx, mut relay) = mpsc::unbounded_channel::<(ClientId, String)>();
    channel.subscribe_message(move |client_id, message| {
        tx.send((client_id.clone(), message.to_string()))
            .map_err(|e| AppError::IllegalStateError(format!("relay closed: {}", e)))
    });
    server.subscribe_client_connected(|client_id| info!("client {} joined", client_id));
    server.subscribe_client_disconnected(|client_id| info!("client {} left", client_id));

    let local_addr = server.start().await?;
    println!("relay listening on {}", local_addr);

    loop {
        tokio::select! {
            Some((sender, message)) = relay.recv() => {
                let tagged = format!("[{}] {}", sender, message);
                match channel.broadcast(&tagged, Some(&sender)).await {
                    Ok(delivered) => info!("relayed message from {} to {} clients", sender, delivered),
                    Err(e) => error!("relay from {} failed: {}", sender, e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, stopping relay");
                break;
            }
        }
    }

    server.graceful_stop().await;
    Ok(())
}

async fn connect(config: SocketConfig) -> AppResult<()> {
    let endpoint = Endpoint::new(config.network.ip.as_str(), config.network.port)?;
    let client = TcpClient::new(endpoint, config.connection.clone(), config.posture);
    client.start().await?;
    let channel = MessageChannel::attach(client.connection());
    channel.subscribe_message(|message| {
        println!("{}", message);
        Ok(())
    });
    client.connection().subscribe_disconnected(|_| println!("disconnected"));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.is_empty() => continue,
                Some(line) => channel.send_message(&line).await?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
        if !client.connection().is_online() {
            break;
        }
    }

    client.graceful_stop().await;
    Ok(())
}
