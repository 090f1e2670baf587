//! Login server: authenticates accounts and hands out world endpoints.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, info};

use yore::net::server::{read_frame, run_acceptor, write_frame, ServerControl};
use yore::proto::login::handle_login_frame;
use yore::{AccountStore, ConfigFile};

#[derive(Parser, Debug)]
#[command(name = "loginserver", about = "Account login server")]
struct Args {
    /// Configuration file.
    #[arg(long, default_value = "data/loginserver.cfg")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("loginserver: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), String> {
    let config = ConfigFile::load(&args.config)
        .map_err(|err| format!("config {}: {err}", args.config.display()))?;
    yore::logging::init(&config.section_entries("logger"))
        .map_err(|err| format!("logging: {err}"))?;

    let port = config.get_integer("server", "port", 7171);
    let motd = config.get_string("login", "motd", "Welcome to the login server!");
    let accounts_file = config.get_string("login", "accounts_file", "data/accounts.xml");

    info!("login server starting on port {}", port);
    info!("accounts file: {}", accounts_file);

    let accounts = Arc::new(
        AccountStore::load(Path::new(&accounts_file))
            .map_err(|err| format!("accounts {accounts_file}: {err}"))?,
    );

    let listener = TcpListener::bind(("0.0.0.0", port as u16))
        .map_err(|err| format!("bind port {port}: {err}"))?;

    let control = Arc::new(ServerControl::new());
    let signal_control = Arc::clone(&control);
    ctrlc::set_handler(move || {
        info!("shutdown requested");
        signal_control.stop();
    })
    .map_err(|err| format!("signal handler: {err}"))?;

    run_acceptor(listener, &control, move |id, mut stream| {
        // One request per connection; answer and hang up.
        match read_frame(&mut stream) {
            Ok(Some(frame)) => match handle_login_frame(&accounts, &motd, &frame) {
                Ok(response) => {
                    if let Err(err) = write_frame(&mut stream, &response) {
                        debug!(connection = %id, "response write failed: {}", err);
                    }
                }
                Err(err) => debug!(connection = %id, "login rejected: {}", err),
            },
            Ok(None) => {}
            Err(err) => debug!(connection = %id, "frame error: {}", err),
        }
    })
    .map_err(|err| format!("accept loop: {err}"))?;

    info!("login server stopped");
    Ok(())
}
