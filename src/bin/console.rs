//! Debug console
//!
//! Runs a key-value client over the in-memory driver and executes console
//! commands against it, either typed at the prompt or, with `--listen ADDR`,
//! from telnet-style TCP connections. An optional argument names a JSON
//! options file.

use dbqueue::console::{self, Response};
use dbqueue::{logging, ClientOptions, DbQueueError, KvClient, MemoryKv};
use std::env;
use std::io::{self, Write};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

struct Args {
    options_path: Option<String>,
    listen: Option<String>,
}

fn parse_args() -> dbqueue::Result<Args> {
    let mut args = env::args().skip(1);
    let mut parsed = Args {
        options_path: None,
        listen: None,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" => {
                let address = args
                    .next()
                    .ok_or_else(|| DbQueueError::Configuration("--listen needs an address".to_string()))?;
                parsed.listen = Some(address);
            }
            _ => parsed.options_path = Some(arg),
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();

    let args = parse_args()?;
    let options = match &args.options_path {
        Some(path) => ClientOptions::from_json_file(path)?,
        None => ClientOptions {
            name: "console".to_string(),
            ..ClientOptions::default()
        },
    };
    let client = KvClient::connect(&options, MemoryKv::connect, None)?;

    match args.listen {
        Some(address) => serve(&address, client.clone()).await?,
        None => prompt(&client, &options).await?,
    }

    client.stop();
    Ok(())
}

async fn serve(address: &str, client: KvClient) -> dbqueue::Result<()> {
    let listener = TcpListener::bind(address).await?;
    println!("dbqueue console listening on {}", listener.local_addr()?);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(());
        }
    });
    console::serve(listener, client, shutdown_rx).await
}

async fn prompt(client: &KvClient, options: &ClientOptions) -> dbqueue::Result<()> {
    println!(
        "dbqueue console ({} workers, queue {}). Type 'help' for commands or 'quit' to exit.",
        options.worker_count, options.queue_capacity
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match console::respond(client, &line).await {
            Response::Quit => {
                println!("Goodbye!");
                break;
            }
            Response::Output(output) => println!("{}", output),
        }
    }
    Ok(())
}
