use clap::{value_parser, Arg, Command};
use std::path::{Path, PathBuf};

use rasterctrl_backend::sim::{SimDevice, SimResponse};
use rasterctrl_backend::{CancelToken, DaqDevice, ScanConfig, ScanFrame, ScanRequest, Scanner};
use rastercompiler_backend::ScanGeometry;

fn report(index: usize, frame: &ScanFrame) {
    for (chan, image) in frame.channels.iter().zip(&frame.images) {
        let (min, max) = image
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        log::info!(
            "Frame {index} {chan}: {}x{} px, mean {:.4}, range [{:.4}, {:.4}]",
            image.nrows(),
            image.ncols(),
            image.mean().unwrap_or(f64::NAN),
            min,
            max
        );
    }
}

fn run_frames<D: DaqDevice>(device: D, request: &ScanRequest, nframes: usize) {
    let scanner = Scanner::new(device);
    let cancel = CancelToken::new();
    let mut sink = report;
    match scanner.scan_frames(request, nframes, &cancel, &mut sink) {
        Ok(n) => log::info!("Acquired {n} frames on {}.", scanner.device_name()),
        Err(e) => log::error!("Scan failed with error: {e}"),
    }
}

#[cfg(feature = "nidaqmx")]
fn run(config: &ScanConfig, request: &ScanRequest, nframes: usize, simulate: bool) {
    if simulate {
        run_frames(simulated_device(config, request), request, nframes)
    } else {
        run_frames(
            rasterctrl_backend::nidaqmx::NiDevice::new(&config.device),
            request,
            nframes,
        )
    }
}

#[cfg(not(feature = "nidaqmx"))]
fn run(config: &ScanConfig, request: &ScanRequest, nframes: usize, simulate: bool) {
    if !simulate {
        log::warn!("Built without the nidaqmx feature, scanning the simulated device instead.");
    }
    run_frames(simulated_device(config, request), request, nframes)
}

/// Simulated device imaging a ring target that fills the scanned field.
fn simulated_device(config: &ScanConfig, request: &ScanRequest) -> SimDevice {
    match ScanGeometry::new(request.params) {
        Ok(geometry) => SimDevice::for_geometry(&config.device, &geometry),
        // The scan itself reports the invalid geometry
        Err(_) => SimDevice::new(&config.device, SimResponse::Constant(0.0)),
    }
}

fn load_config(config_path: &Path) -> Option<ScanConfig> {
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    match ScanConfig::read_config_file(config_path) {
        Ok(c) => {
            log::info!("Config successfully loaded.");
            Some(c)
        }
        Err(e) => {
            log::error!("{e}");
            None
        }
    }
}

fn main() {
    // Create a cli
    let matches = Command::new("rasterctrl")
        .about("Galvo raster scans with synchronized analog input")
        .arg_required_else_help(true)
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .global(true)
                .help("Path to the scan configuration file"),
        )
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(
            Command::new("scan")
                .about("Acquire frames with the configured scan")
                .arg(
                    Arg::new("frames")
                        .short('n')
                        .long("frames")
                        .value_parser(value_parser!(usize))
                        .default_value("1")
                        .help("Number of frames to acquire"),
                )
                .arg(
                    Arg::new("simulate")
                        .long("simulate")
                        .action(clap::ArgAction::SetTrue)
                        .help("Scan the simulated device even when NI-DAQmx support is built in"),
                ),
        )
        .get_matches();

    // Initialize feedback
    if let Err(e) = simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    ) {
        eprintln!("Could not create logger: {e}");
    }

    let config_path = match matches.get_one::<String>("path") {
        Some(path) => PathBuf::from(path),
        None => {
            log::error!("A configuration path is required (--path)");
            return;
        }
    };

    match matches.subcommand() {
        Some(("new", _)) => {
            log::info!(
                "Making a template config at {}...",
                config_path.to_string_lossy()
            );
            match ScanConfig::write_template(&config_path) {
                Ok(()) => log::info!("Done."),
                Err(e) => log::error!("{e}"),
            }
        }
        Some(("scan", sub)) => {
            let Some(config) = load_config(&config_path) else {
                return;
            };
            let request = match config.to_request() {
                Ok(r) => r,
                Err(e) => {
                    log::error!("{e}");
                    return;
                }
            };
            let nframes = sub.get_one::<usize>("frames").copied().unwrap_or(1);
            let simulate = sub.get_flag("simulate");
            log::info!("Device: {}", config.device);
            log::info!("Outputs: {:?} Inputs: {:?}", request.ao_chans, request.ai_chans);
            run(&config, &request, nframes, simulate);
        }
        _ => log::error!("Unknown command"),
    }
}
