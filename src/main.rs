use std::path::PathBuf;
use std::process::ExitCode;

use log::{error, info};

use frame_pump::sink::PublishSink;
use frame_pump::{FramePump, PumpConfig, PumpError, PumpReport, Result, StopSignal};

const DEFAULT_CONFIG: &str = "frame-pump.json";

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run() {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(e) => error!("failed to serialise report: {e}"),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<PumpReport> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = PumpConfig::load(&path)?.with_env_overrides();

    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.raise())
        .map_err(|e| PumpError::Config(format!("install Ctrl-C handler: {e}")))?;

    let source = config.open_source()?;
    let mut sink = config.build_sink(&source.format())?;
    if let PublishSink::SharedTexture(texture) = &mut sink {
        let handle = texture.export_handle()?;
        match serde_json::to_string(&handle) {
            Ok(json) => info!("shared texture: {json}"),
            Err(e) => error!("failed to serialise texture handle: {e}"),
        }
    }

    let mut pump = FramePump::new(source, sink, config.handoff_policy())?.with_stop_signal(stop);
    info!("press Ctrl-C to stop");
    pump.run()
}
