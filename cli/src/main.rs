use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{Arg, ArgAction, Command};
use halfkay_fw_update_common::pjrc::teensyboot::board::{self, Board, BoardStatus, UploadFlags};
use halfkay_fw_update_common::pjrc::teensyboot::class::Capability;
use halfkay_fw_update_common::pjrc::teensyboot::device::system::SystemBus;
use halfkay_fw_update_common::pjrc::teensyboot::firmware::Firmware;
use halfkay_fw_update_common::pjrc::teensyboot::message::{self, LogLevel, Message};
use halfkay_fw_update_common::pjrc::teensyboot::model::Model;
use halfkay_fw_update_common::pjrc::teensyboot::monitor::{BoardEvent, CallbackAction, Monitor};
use halfkay_fw_update_common::pjrc::teensyboot::task::{Task, TaskStatus};
use indicatif::{ProgressBar, ProgressStyle};

const FIND_BOARD_TIMEOUT: Duration = Duration::from_secs(5);

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_target(false)
        .init();

    if let Err(err) = run() {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let board_arg = Arg::new("board")
        .short('B')
        .long("board")
        .help("Board tag filter \"<serial>[-<family>][@<path>]\"")
        .global(true)
        .action(ArgAction::Set)
        .num_args(1);

    let quiet_arg = Arg::new("quiet")
        .short('q')
        .long("quiet")
        .help("Decrease verbosity, repeat to silence progress and info")
        .global(true)
        .action(ArgAction::Count);

    let format_arg = Arg::new("format")
        .short('f')
        .long("format")
        .help("Firmware format \"ihex\" or \"elf\" (default: by file extension)")
        .action(ArgAction::Set)
        .num_args(1);

    let matches = Command::new("halfkay-fw-update")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Manage and flash Teensy and USB serial boards")
        .arg_required_else_help(true)
        .arg(board_arg)
        .arg(quiet_arg)
        .arg(
            Arg::new("models")
                .long("models")
                .help("List supported board models and exit")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new("list")
                .about("List connected boards")
                .arg(
                    Arg::new("verbose")
                        .short('v')
                        .long("verbose")
                        .help("Show capabilities, serial numbers and interfaces")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("watch")
                        .short('w')
                        .long("watch")
                        .help("Watch for hotplug events")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("output")
                        .short('O')
                        .long("output")
                        .help("Output format \"plain\" or \"json\"")
                        .value_parser(["plain", "json"])
                        .default_value("plain")
                        .action(ArgAction::Set),
                ),
        )
        .subcommand(
            Command::new("identify")
                .about("Guess the models a firmware was built for")
                .arg(format_arg.clone())
                .arg(
                    Arg::new("json")
                        .short('j')
                        .long("json")
                        .help("Report results as JSON")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("firmware")
                        .help("Firmware file, \"-\" for standard input")
                        .required(true)
                        .num_args(1..),
                ),
        )
        .subcommand(
            Command::new("reset")
                .about("Reset the board")
                .arg(
                    Arg::new("bootloader")
                        .short('b')
                        .long("bootloader")
                        .help("Reboot the board into the bootloader instead")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("upload")
                .about("Flash a firmware to the board")
                .arg(format_arg)
                .arg(
                    Arg::new("wait")
                        .short('w')
                        .long("wait")
                        .help("Wait for the bootloader instead of rebooting the board")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("nocheck")
                        .long("nocheck")
                        .help("Skip the firmware/model compatibility check")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("noreset")
                        .long("noreset")
                        .help("Do not reset the board once the upload is finished")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("firmware")
                        .help("Firmware files, the first compatible one is used")
                        .required(true)
                        .num_args(1..),
                ),
        )
        .get_matches();

    match matches.get_count("quiet") {
        0 => {}
        1 => message::set_verbosity(LogLevel::Warning),
        _ => message::set_verbosity(LogLevel::Error),
    }

    if matches.get_flag("models") {
        print_supported_models();
        return Ok(());
    }

    let tag = matches.get_one::<String>("board").map(String::as_str);

    match matches.subcommand() {
        Some(("list", list_matches)) => {
            let verbose = list_matches.get_flag("verbose");
            let watch = list_matches.get_flag("watch");
            let json = list_matches.get_one::<String>("output").map(String::as_str) == Some("json");
            list(tag, verbose, watch, json)
        }
        Some(("identify", identify_matches)) => {
            let format = identify_matches.get_one::<String>("format").map(String::as_str);
            let json = identify_matches.get_flag("json");
            let files: Vec<&String> = identify_matches.get_many::<String>("firmware").unwrap().collect();
            identify(&files, format, json)
        }
        Some(("reset", reset_matches)) => {
            let bootloader = reset_matches.get_flag("bootloader");
            reset(tag, bootloader)
        }
        Some(("upload", upload_matches)) => {
            let format = upload_matches.get_one::<String>("format").map(String::as_str);
            let mut flags = UploadFlags::empty();
            if upload_matches.get_flag("wait") {
                flags |= UploadFlags::WAIT;
            }
            if upload_matches.get_flag("nocheck") {
                flags |= UploadFlags::NOCHECK;
            }
            if upload_matches.get_flag("noreset") {
                flags |= UploadFlags::NORESET;
            }
            let files: Vec<&String> = upload_matches.get_many::<String>("firmware").unwrap().collect();
            upload(tag, &files, format, flags)
        }
        _ => bail!("Missing command, see --help"),
    }
}

fn print_supported_models() {
    println!("Supported models:");
    for model in Model::all() {
        if let Some(mcu) = model.mcu() {
            println!("   {:<20} ({})", model.name(), mcu);
        }
    }
}

// Board resolution -------------------------------------------------------------------------------

fn open_monitor() -> Result<Monitor> {
    let bus = SystemBus::new()?;
    let mut monitor = Monitor::new(Box::new(bus));
    monitor.start()?;
    Ok(monitor)
}

fn get_board(monitor: &mut Monitor, tag: Option<&str>) -> Result<Arc<Board>> {
    monitor.wait(
        |monitor| Ok(monitor.find_board(tag).is_some()),
        Some(FIND_BOARD_TIMEOUT),
    )?;

    monitor.find_board(tag).ok_or_else(|| match tag {
        Some(tag) => anyhow!("Board '{}' not found", tag),
        None => anyhow!("No board available"),
    })
}

/// Pump the monitor on this thread until the task is done, then report its outcome.
fn finish_task(monitor: &mut Monitor, task: &Arc<Task>) -> Result<()> {
    task.start()?;
    monitor.wait(|_monitor| Ok(task.status() == TaskStatus::Finished), None)?;
    task.ret().unwrap_or(Ok(()))?;
    Ok(())
}

// list -------------------------------------------------------------------------------------------

fn board_status_str(status: BoardStatus) -> &'static str {
    match status {
        BoardStatus::Online => "online",
        BoardStatus::Missing => "missing",
        BoardStatus::Dropped => "dropped",
    }
}

fn capability_names(board: &Board) -> Vec<&'static str> {
    Capability::ALL
        .iter()
        .filter(|cap| board.has_capability(**cap))
        .map(|cap| cap.name())
        .collect()
}

fn print_board_plain(board: &Board, verbose: bool) {
    println!(
        "{} {} ({})",
        board.tag(),
        board.location(),
        board.model().name()
    );

    if verbose {
        println!("  description: {}", board.description().unwrap_or_default());
        println!("  serial: {}", board.serial_number().unwrap_or_else(|| "?".to_string()));
        println!("  capabilities: {}", capability_names(board).join(", "));
        println!("  interfaces:");
        for iface in board.interfaces() {
            println!("    {} {}", iface.name(), iface.path());
        }
    }
}

fn board_to_json(board: &Board) -> serde_json::Value {
    serde_json::json!({
        "tag": board.tag(),
        "id": board.id(),
        "location": board.location(),
        "model": board.model().name(),
        "status": board_status_str(board.status()),
        "serial_number": board.serial_number(),
        "description": board.description(),
        "capabilities": capability_names(board),
        "interfaces": board.interfaces().iter().map(|iface| {
            serde_json::json!({
                "name": iface.name(),
                "path": iface.path(),
            })
        }).collect::<Vec<_>>(),
    })
}

fn list(tag: Option<&str>, verbose: bool, watch: bool, json: bool) -> Result<()> {
    let mut monitor = open_monitor()?;

    let filter = tag.map(str::to_string);
    let matches = move |board: &Arc<Board>| match &filter {
        Some(filter) => board.matches_tag(filter),
        None => true,
    };

    for board in monitor.boards() {
        if matches(&board) {
            if json {
                println!("{}", board_to_json(&board));
            } else {
                print_board_plain(&board, verbose);
            }
        }
    }

    if watch {
        monitor.register_callback(Box::new(move |board, event| {
            if matches(board) {
                if json {
                    let mut value = board_to_json(board);
                    value["event"] = serde_json::json!(event_str(event));
                    println!("{}", value);
                } else {
                    println!("{} {} {}", event_str(event), board.tag(), board.location());
                }
            }
            Ok(CallbackAction::Keep)
        }));

        monitor.wait(|_monitor| Ok(false), None)?;
    }

    Ok(())
}

fn event_str(event: BoardEvent) -> &'static str {
    match event {
        BoardEvent::Added => "add",
        BoardEvent::Changed => "change",
        BoardEvent::Disappeared => "miss",
        BoardEvent::Dropped => "remove",
    }
}

// identify ---------------------------------------------------------------------------------------

fn identify(files: &[&String], format: Option<&str>, json: bool) -> Result<()> {
    let mut failed = false;

    for filename in files {
        match Firmware::load_file(filename, format) {
            Ok(fw) => {
                let models: Vec<&str> = fw.identify(16).iter().map(|model| model.name()).collect();

                if json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "file": filename,
                            "models": models,
                        })
                    );
                } else if models.is_empty() {
                    println!("{}: unknown", filename);
                } else {
                    println!("{}: {}", filename, models.join(", "));
                }
            }
            Err(err) => {
                if json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "file": filename,
                            "error": err.to_string(),
                        })
                    );
                } else {
                    eprintln!("{}: {}", filename, err);
                }
                failed = true;
            }
        }
    }

    if failed {
        bail!("Some firmwares could not be identified");
    }
    Ok(())
}

// reset ------------------------------------------------------------------------------------------

fn reset(tag: Option<&str>, bootloader: bool) -> Result<()> {
    let mut monitor = open_monitor()?;
    let board = get_board(&mut monitor, tag)?;

    let task = if bootloader {
        board::reboot(&board)?
    } else {
        board::reset(&board)?
    };

    finish_task(&mut monitor, &task)?;
    Ok(())
}

// upload -----------------------------------------------------------------------------------------

fn upload(tag: Option<&str>, files: &[&String], format: Option<&str>, flags: UploadFlags) -> Result<()> {
    let mut fws = Vec::new();
    for filename in files {
        fws.push(Firmware::load_file(filename, format)?);
    }

    let mut monitor = open_monitor()?;
    let board = get_board(&mut monitor, tag)?;

    install_progress_handler();
    let task = board::upload(&board, &fws, flags)?;
    let result = finish_task(&mut monitor, &task);
    message::redirect_to_default();

    result
}

/// Route progress messages into an indicatif bar, everything else to stderr.
fn install_progress_handler() {
    // Shared so the bar can be lazily created on the first progress update
    let bar: Arc<Mutex<Option<ProgressBar>>> = Arc::new(Mutex::new(None));

    message::redirect(Box::new(move |msg: &Message| match msg {
        Message::Progress { action, value, max, .. } => {
            if *max == 0 {
                return;
            }

            let mut bar = bar.lock().unwrap();
            let bar = bar.get_or_insert_with(|| {
                let bar = ProgressBar::new(*max);
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("[{elapsed_precise}] {bar:40.cyan/blue} {bytes}/{total_bytes} {msg}")
                        .unwrap()
                        .progress_chars("=>-"),
                );
                bar
            });
            bar.set_message(action.to_string());
            bar.set_position(*value);
            if value == max {
                bar.finish_with_message("Done");
            }
        }
        Message::Log { level, text, .. } => {
            if message::log_level_is_enabled(*level) {
                eprintln!("{}", text);
            }
        }
        Message::Status { .. } => {}
    }));
}
