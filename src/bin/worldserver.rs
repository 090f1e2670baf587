//! World server: runs the live game simulation.
//!
//! Startup order matters: configuration, logging, data files, then the
//! engine thread (which owns the world), and only then the accept loop.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{mpsc, Arc};
use std::thread;

use clap::Parser;
use tracing::info;

use yore::game::engine::{EngineHandle, EngineQueue, GameEngine};
use yore::net::server::{run_acceptor, ServerControl};
use yore::world::item::ItemTypeIndex;
use yore::{AccountStore, ConfigFile, World, WorldSession};

#[derive(Parser, Debug)]
#[command(name = "worldserver", about = "Game world server")]
struct Args {
    /// Configuration file.
    #[arg(long, default_value = "data/worldserver.cfg")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("worldserver: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), String> {
    let config = ConfigFile::load(&args.config)
        .map_err(|err| format!("config {}: {err}", args.config.display()))?;
    yore::logging::init(&config.section_entries("logger"))
        .map_err(|err| format!("logging: {err}"))?;

    let port = config.get_integer("server", "port", 7172);
    let motd = config.get_string("world", "motd", "Welcome to the game world!");
    let accounts_file = config.get_string("world", "accounts_file", "data/accounts.xml");
    let data_file = config.get_string("world", "data_file", "data/items.dat");
    let items_file = config.get_string("world", "items_file", "data/items.xml");
    let world_file = config.get_string("world", "world_file", "data/world.xml");

    info!("world server starting on port {}", port);

    let item_types = Arc::new(
        ItemTypeIndex::load(Path::new(&data_file), Path::new(&items_file))
            .map_err(|err| format!("item types: {err}"))?,
    );
    let accounts = Arc::new(
        AccountStore::load(Path::new(&accounts_file))
            .map_err(|err| format!("accounts {accounts_file}: {err}"))?,
    );

    let queue = Arc::new(EngineQueue::new());
    let engine_handle = EngineHandle::new(Arc::clone(&queue));

    // The world is built and owned inside the engine thread; only the load
    // result crosses back so a broken world file still fails startup.
    let (startup_tx, startup_rx) = mpsc::channel();
    let engine_thread = {
        let queue = Arc::clone(&queue);
        let item_types = Arc::clone(&item_types);
        let accounts = Arc::clone(&accounts);
        let world_file = PathBuf::from(&world_file);
        thread::spawn(move || {
            let world = match World::load(&world_file, item_types) {
                Ok(world) => {
                    let _ = startup_tx.send(Ok(()));
                    world
                }
                Err(err) => {
                    let _ = startup_tx.send(Err(format!(
                        "world {}: {err}",
                        world_file.display()
                    )));
                    return;
                }
            };
            GameEngine::new(queue, world, accounts, motd).run();
        })
    };
    startup_rx
        .recv()
        .map_err(|_| "engine thread died during startup".to_string())??;

    let listener = TcpListener::bind(("0.0.0.0", port as u16))
        .map_err(|err| format!("bind port {port}: {err}"))?;

    let control = Arc::new(ServerControl::new());
    let signal_control = Arc::clone(&control);
    let signal_handle = engine_handle.clone();
    ctrlc::set_handler(move || {
        info!("shutdown requested");
        signal_control.stop();
        signal_handle.shutdown();
    })
    .map_err(|err| format!("signal handler: {err}"))?;

    run_acceptor(listener, &control, move |id, stream| {
        let session = WorldSession {
            engine: engine_handle.clone(),
            accounts: Arc::clone(&accounts),
            item_types: Arc::clone(&item_types),
        };
        session.run(id, stream);
    })
    .map_err(|err| format!("accept loop: {err}"))?;

    // Stop accepting, drain the engine queue, close sessions.
    queue.shutdown();
    engine_thread
        .join()
        .map_err(|_| "engine thread panicked".to_string())?;

    info!("world server stopped");
    Ok(())
}
