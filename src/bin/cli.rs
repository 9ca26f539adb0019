use resp_client::{Arg, Client, Frame, DEFAULT_PORT};

use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(
    name = "resp-cli",
    version,
    author,
    about = "Issue a raw RESP command and print the reply"
)]
struct Cli {
    #[clap(name = "hostname", long, default_value = "127.0.0.1")]
    host: String,

    #[clap(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Connect timeout in milliseconds.
    #[clap(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// The command and its arguments, e.g. `SET key value`.
    #[clap(required = true)]
    command: Vec<String>,
}

/// Entry point for the CLI tool.
///
/// `flavor = "current_thread"` avoids spawning background threads; a
/// one-shot CLI favors lightweight over multi-threaded.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Enable logging
    tracing_subscriber::fmt::try_init()?;

    let cli = Cli::parse();

    let addr = format!("{}:{}", cli.host, cli.port);
    let timeout = Duration::from_millis(cli.timeout_ms);

    let client = Client::connect(&addr, timeout).await?;

    let args: Vec<Arg> = cli.command.iter().map(|word| word.as_str().into()).collect();

    match client.send_command(&args).await {
        Ok(Frame::Null) => println!("(nil)"),
        Ok(Frame::Simple(value)) => println!("\"{}\"", value),
        Ok(frame) => println!("{}", frame),
        Err(err) => {
            client.close(true).await;
            return Err(err.into());
        }
    }

    client.close(false).await;

    Ok(())
}
