use std::io::BufRead;
use std::process::ExitCode;

use uwb_positioning::utils::config::SystemConfig;
use uwb_positioning::utils::init_logging;
use uwb_positioning::{Coordinator, TcpLineClient};

fn main() -> ExitCode {
    init_logging("info");

    let args: Vec<String> = std::env::args().collect();
    let config = match args.get(1) {
        Some(path) => match SystemConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load config {}: {}", path, e);
                return ExitCode::FAILURE;
            }
        },
        None => SystemConfig::default(),
    };

    let bus = TcpLineClient::new(config.bus.clone());
    let mut coordinator = match Coordinator::new(config, Box::new(bus)) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            eprintln!("initialization failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = coordinator.start() {
        eprintln!("startup failed: {}", e);
        return ExitCode::FAILURE;
    }

    // Run until stdin closes or a quit line arrives.
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        match line {
            Ok(command) if command.trim() == "quit" => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }

    coordinator.stop();
    ExitCode::SUCCESS
}
