//! Send one command to a beamline-tcp server and print the reply.
//!
//! ```text
//! client 10001 frame 2
//! Sent: "frame 2"
//! Received: "OK set_frame 2"
//! ```

use beamline_tcp::client;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "beamline-client")]
#[command(version)]
#[command(about = "Send one command line to a beamline-tcp server", long_about = None)]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    port: u16,

    /// Command and arguments, joined with spaces
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    message: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let message = args.message.join(" ");
    println!("Sent: {message:?}");

    let reply = client::request((args.host.as_str(), args.port), &message).await?;
    println!("Received: {:?}", reply.line);
    if let Some(values) = reply.payload {
        println!("Payload: {} int16 values", values.len());
    }
    Ok(())
}
