//! Device loader launcher
//!
//! Usage:
//!   device-loader-launch
//!   device-loader-launch launch/default.launch.yaml -a port:=8082
//!   device-loader-launch --mode replace
//!   device-loader-launch --dry-run

use device_loader_launch::{Bootstrap, LaunchArgs, LaunchFile, Sequencer, StopHandle};

fn main() {
    let args: LaunchArgs = argh::from_env();

    let env = env_logger::Env::default().default_filter_or(args.log_filter());
    env_logger::init_from_env(env);

    std::process::exit(run(args));
}

fn run(args: LaunchArgs) -> i32 {
    let mut launch_file = match &args.launch_file {
        Some(path) => {
            log::info!("Loading launch file: {}", path);
            match LaunchFile::from_file(path) {
                Ok(lf) => lf,
                Err(e) => {
                    log::error!("Failed to load launch file: {}", e);
                    return 1;
                }
            }
        }
        None => LaunchFile::default(),
    };
    args.apply_to(&mut launch_file);

    if args.validate {
        if let Err(e) = launch_file.validate() {
            log::error!("{}", e);
            return 1;
        }
        println!(
            "Launch file '{}' is valid",
            args.launch_file.as_deref().unwrap_or("<built-in>")
        );
        println!("  Version: {}", launch_file.version);
        println!("  Args: {}", launch_file.args.len());
        println!("  Services: {}", launch_file.services.advertise.len());
        println!("  App: {} ({})", launch_file.app.executable, launch_file.app.mode);
        return 0;
    }

    let stop = StopHandle::new();
    let mut bootstrap = match Bootstrap::new(launch_file, args.arg_overrides(), stop.clone()) {
        Ok(b) => b,
        Err(e) => {
            log::error!("Failed to prepare launch: {}", e);
            return 1;
        }
    };

    if args.dry_run {
        return match bootstrap.plan() {
            Ok(plan) => {
                println!("{}", plan);
                0
            }
            Err(e) => {
                log::error!("Failed to generate launch plan: {}", e);
                1
            }
        };
    }

    // SIGINT/SIGTERM are forwarded to a supervised application
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("Received termination signal, stopping application...");
        stop.request_stop();
    }) {
        log::warn!("Failed to install signal handler: {}", e);
    }

    match Sequencer::new(bootstrap).run() {
        Ok(report) => report.exit_code(),
        Err(e) => {
            log::error!("Launch failed: {}", e);
            1
        }
    }
}
