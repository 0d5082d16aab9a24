//! Reactor HTTP server binary.

use std::path::PathBuf;

use clap::Parser;
use reactor_http::{Framework, HandlerError, StatusCode};
use server::config::Config;
use server::logging;

#[derive(Parser)]
#[command(name = "reactor-server")]
#[command(about = "Multi-threaded reactor HTTP server")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Err(e) = run(config) {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    logging::init(&config.logging)?;

    let mut app = Framework::new(config.address, &config.name, config.server_options())?;

    app.get("/", |ctx| {
        ctx.text(StatusCode::Ok, "reactor-server is running\n");
        Ok(())
    })?;

    app.get("/hello", |ctx| {
        ctx.text(StatusCode::Ok, "hello, world\n");
        Ok(())
    })?;

    app.get("/greet", |ctx| {
        let name = ctx.query("name").unwrap_or("world").to_string();
        ctx.text(StatusCode::Ok, format!("hello {name}\n"));
        Ok(())
    })?;

    app.get("/user/:id", |ctx| {
        let id = ctx.path_param("id").unwrap_or("").to_string();
        ctx.json(StatusCode::Ok, format!("{{\"id\":\"{}\"}}", id));
        Ok(())
    })?;

    app.get("/files/*path", |ctx| {
        let path = ctx.path_param("path").unwrap_or("").to_string();
        ctx.text(StatusCode::Ok, path);
        Ok(())
    })?;

    // Exercises the global error handler.
    app.get("/explode", |_ctx| Err(HandlerError::new("demo failure")))?;

    tracing::info!(addr = %app.local_addr(), threads = config.threads(), "serving");
    app.run()?;
    Ok(())
}

fn print_default_config() {
    let config = r#"# Reactor server configuration

# Server name, used for thread and connection naming
name = "reactor"

# Address to listen on
address = "0.0.0.0:9006"

# Set SO_REUSEPORT so several instances can share the port
reuse_port = false

[workers]
# Number of IO loop threads (default: number of CPUs)
# threads = 8

[connection]
# Seconds of silence before a connection is force-closed
idle_timeout_secs = 60

# Output-buffer size that triggers the high-water callback
high_water_mark = "64MB"

[logging]
# Level filter when RUST_LOG is not set: trace, debug, info, warn, error
level = "info"

# Output format: "pretty", "json", or "compact"
format = "pretty"

# Include timestamps and thread names in log lines
timestamps = true
thread_names = true

# Destination: "console" (stderr) or "file"
sink = "console"
# path = "/var/log/reactor-server.log"
"#;
    print!("{}", config);
}
