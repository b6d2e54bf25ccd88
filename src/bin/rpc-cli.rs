use clap::{Parser, Subcommand};
use serde_json::{Map, Value};

use netrpc::net::{NetType, NetUri};
use netrpc::rpc::{ApiClient, ApiHost, Args};

#[derive(Parser)]
#[command(name = "rpc-cli")]
#[command(about = "Invoke actions on a netrpc host", long_about = None)]
struct Cli {
    /// `http://host:port` or `tcp://host:port`
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered actions
    Actions,
    /// Show host information
    Info,
    /// Call an action
    Call {
        action: String,
        /// Argument as key=value; values that parse as JSON are sent as JSON
        #[arg(short = 'a', long = "arg", value_parser = parse_arg)]
        args: Vec<(String, Value)>,
    },
}

fn parse_arg(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let (action, args) = match cli.command {
        Commands::Actions => ("Api/All".to_string(), Map::new()),
        Commands::Info => ("Api/Info".to_string(), Map::new()),
        Commands::Call { action, args } => (action, args.into_iter().collect()),
    };

    let uri = NetUri::parse(&cli.url)?;
    match uri.protocol {
        NetType::Http => call_http(&cli.url, &action, &args).await,
        NetType::Tcp | NetType::Unknown => call_tcp(uri, &action, args).await,
        other => Err(format!("unsupported protocol `{other}`").into()),
    }
}

async fn call_http(url: &str, action: &str, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let res = client
        .post(format!("{}/{}", url.trim_end_matches('/'), action))
        .json(args)
        .send()
        .await?;

    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: host returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

async fn call_tcp(uri: NetUri, action: &str, args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let host = ApiHost::new("rpc-cli");
    let client = ApiClient::connect(uri.socket_addr(), &host).await?;
    let result = client.invoke::<Value>(action, args).await;
    client.close();

    match result {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(e) => eprintln!("Error: {}", e),
    }
    Ok(())
}
