#![allow(clippy::cast_possible_truncation)]

use clap::{value_parser, Arg, ArgAction, Command};
use gifcast::{Config, Error, Recorder, Rect};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::exit;
use std::thread;
use std::time::{Duration, Instant};

fn main() {
    if let Err(e) = bin_main() {
        eprintln!("error: {e}");
        exit(match e {
            Error::CaptureUnavailable | Error::Io(_) => 2,
            _ => 1,
        });
    }
}

fn bin_main() -> Result<(), Error> {
    let matches = match cli().try_get_matches() {
        Ok(matches) => matches,
        Err(e) => {
            use clap::error::ErrorKind::*;
            let _ = e.print();
            exit(match e.kind() {
                DisplayHelp | DisplayVersion | DisplayHelpOnMissingArgumentOrSubcommand => 0,
                _ => 1,
            });
        },
    };
    run(matches)
}

fn cli() -> Command {
    Command::new(clap::crate_name!())
        .version(clap::crate_version!())
        .about("record your current desktop session into an animated GIF")
        .arg_required_else_help(true)
        .arg(
            Arg::new("duration")
                .long("duration")
                .short('d')
                .help("Duration of animation (default: 10 seconds)")
                .value_parser(value_parser!(u32))
                .value_name("SECS")
                .default_value("10"),
        )
        .arg(
            Arg::new("delay")
                .long("delay")
                .help("Delay before start (default: 1 second)")
                .value_parser(value_parser!(u32))
                .value_name("SECS")
                .default_value("1"),
        )
        .arg(
            Arg::new("loop")
                .long("loop")
                .short('l')
                .num_args(0)
                .action(ArgAction::SetTrue)
                .help("Let the animation loop"),
        )
        .arg(
            Arg::new("cursor")
                .long("cursor")
                .short('c')
                .num_args(0)
                .action(ArgAction::SetTrue)
                .help("Record mouse cursor"),
        )
        .arg(
            Arg::new("x")
                .long("x")
                .short('x')
                .help("X coordinate of rectangle to record")
                .value_parser(value_parser!(i32))
                .value_name("PIXEL"),
        )
        .arg(
            Arg::new("y")
                .long("y")
                .short('y')
                .help("Y coordinate of rectangle to record")
                .value_parser(value_parser!(i32))
                .value_name("PIXEL"),
        )
        .arg(
            Arg::new("width")
                .long("width")
                .short('W')
                .help("Width of recording rectangle")
                .value_parser(value_parser!(i32))
                .value_name("PIXEL"),
        )
        .arg(
            Arg::new("height")
                .long("height")
                .short('H')
                .help("Height of recording rectangle")
                .value_parser(value_parser!(i32))
                .value_name("PIXEL"),
        )
        .arg(
            Arg::new("frame-duration")
                .long("frame-duration")
                .hide_short_help(true)
                .help("Minimum delay between frames in milliseconds")
                .value_parser(value_parser!(u32))
                .value_name("MS")
                .default_value("40"),
        )
        .arg(
            Arg::new("max-colors")
                .long("max-colors")
                .hide_short_help(true)
                .help("Palette size target")
                .value_parser(value_parser!(u16).range(2..=256))
                .value_name("2-256")
                .default_value("255"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .num_args(0)
                .action(ArgAction::SetTrue)
                .help("Be verbose"),
        )
        .arg(
            Arg::new("FILE")
                .help("GIF file to record to")
                .value_parser(value_parser!(PathBuf))
                .required(true),
        )
}

fn run(matches: clap::ArgMatches) -> Result<(), Error> {
    let mut logger = env_logger::Builder::from_default_env();
    if matches.get_flag("verbose") {
        logger.filter_level(log::LevelFilter::Info);
    }
    logger.init();

    let area = if ["x", "y", "width", "height"].iter().any(|k| matches.contains_id(k)) {
        Some(Rect {
            x: matches.get_one::<i32>("x").copied().unwrap_or(0),
            y: matches.get_one::<i32>("y").copied().unwrap_or(0),
            width: matches.get_one::<i32>("width").copied().unwrap_or(i32::MAX / 2),
            height: matches.get_one::<i32>("height").copied().unwrap_or(i32::MAX / 2),
        })
    } else {
        None
    };
    let config = Config {
        duration_ms: matches.get_one::<u32>("duration").copied().unwrap_or(10).saturating_mul(1000),
        delay_ms: matches.get_one::<u32>("delay").copied().unwrap_or(1).max(1).saturating_mul(1000),
        looping: matches.get_flag("loop"),
        record_cursor: matches.get_flag("cursor"),
        area,
        frame_duration_ms: matches.get_one::<u32>("frame-duration").copied().unwrap_or(40),
        max_colors: matches.get_one::<u16>("max-colors").copied().unwrap_or(255),
        ..Config::default()
    };

    let path = matches.get_one::<PathBuf>("FILE").ok_or(Error::InvalidArgument("FILE"))?;
    let file = File::create(path)?;

    let source = match gifcast::source::platform() {
        Ok(source) => source,
        Err(e) => {
            eprintln!(
                "Could not prepare recording.\n\
                 Most likely a damage-reporting display connection is not \
                 available, or the file \"{}\" is not writable.",
                path.display()
            );
            return Err(e);
        },
    };

    let delay = Duration::from_millis(u64::from(config.delay_ms));
    let duration = Duration::from_millis(u64::from(config.duration_ms));
    let mut rec = Recorder::new(source, BufWriter::new(file), config)?;

    // match the classic timing: prepare one second before recording starts
    thread::sleep(delay.saturating_sub(Duration::from_secs(1)));
    log::info!("Preparing recording. Will start in 1 second...");
    rec.prepare(Instant::now())?;
    thread::sleep(Duration::from_secs(1));
    log::info!("Recording starts. Will record {} seconds...", duration.as_secs());
    rec.start(Instant::now())?;

    let stop_at = Instant::now() + duration;
    let mut failure = None;
    while rec.is_active() {
        let now = Instant::now();
        if now >= stop_at {
            if let Err(e) = rec.stop(now) {
                failure = Some(e);
            }
            break;
        }
        let wake = rec.next_deadline().map_or(stop_at, |d| d.min(stop_at));
        if wake > now {
            // short naps so freshly delivered damage is polled promptly
            thread::sleep((wake - now).min(Duration::from_millis(10)));
        }
        if let Err(e) = rec.tick(Instant::now()) {
            failure = Some(e);
            break;
        }
    }

    log::info!("Recording done. Cleaning up...");
    let finished = rec.finish();
    match failure {
        Some(e) => Err(e),
        None => finished,
    }
}
