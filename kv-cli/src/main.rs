use std::io::{stdin, IsTerminal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{env, panic};

use anyhow::Result;
use clap::{CommandFactory, Parser};
use log::info;

use kvcli::server::config::ConfigLoad;
use kvcli::server::session;
use kvcli::trace;

#[derive(Debug, Parser, PartialEq)]
#[command(version)]
// disable default help flag since it would conflict with --host
#[command(author, about, disable_help_flag = true)]
pub struct Args {
    #[clap(short, long, help = "debug model")]
    debug: bool,

    #[clap(long, help = "Print help information")]
    help: bool,

    /// Configuration file path, default 'config/kvdb.yaml'
    #[clap(short = 'c', long = "config", help = "Configuration file path", default_value = "config/kvdb.yaml")]
    config: String,

    /// quiet model, No output printed to stdout
    #[clap(long = "quiet", short = 'q', default_value = "false")]
    quiet: bool,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,

    #[clap(short = 'n', long, help = "Force non-interactive mode", default_value = "false")]
    non_interactive: bool,

    #[clap(long, require_equals = true, help = "Admin command to execute")]
    query: Option<String>,
}

/// CMD like:
///     yesquel         ==>  Args { quiet: false }
///     yesquel --quiet ==>  Args { quiet: true }
///
#[tokio::main]
pub async fn main() -> Result<()> {
    setup_panic_hooks();

    eprintln!();
    eprintln!("██  ██  █        █");
    eprintln!("██ ██   ██      ██");
    eprintln!("███      ██    ██");
    eprintln!("██ ██     ██  ██");
    eprintln!("██  ██     ████  KV Storage CLI");
    eprintln!();

    let args = Args::parse();
    if args.debug {
        println!("{:?}", args);
    }

    let log_dir = format!("{}/.kvcli", std::env::var("HOME").unwrap_or_else(|_| ".".to_string()));
    let _guards = trace::init_logging(&log_dir, &args.log_level).await?;
    info!("yesquel start args: {:?}", &args);

    let mut cmd = Args::command();
    if args.help {
        cmd.print_help()?;
        return Ok(());
    }

    let mut cfg = ConfigLoad::new(args.config.as_ref()).unwrap_or_default();
    if args.debug {
        println!("{:?}", &cfg);
        eprintln!();
    }
    info!("yesquel start config: {:?}", &cfg);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("received Ctrl+C!");
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    if args.quiet {
        kvcli::PBAR.set_quiet(true);
    }
    let is_terminal = stdin().is_terminal();
    let is_repl = is_terminal && !args.non_interactive && args.query.is_none();
    if is_repl {
        cfg.terminal_update();
    }

    let mut session = session::Session::try_new(cfg, is_repl, running.clone()).await?;

    info!("yesquel starting, is_repl={is_repl}");

    if is_repl {
        session.handle_repl().await;
        return Ok(());
    }

    // One-shot command: exit with the §6 exit code table instead of the
    // generic anyhow wrapper the REPL path uses.
    if let Some(query) = args.query {
        if let Err(err) = session.run_one(&query) {
            eprintln!("{}", err);
            std::process::exit(err.exit_code() as i32);
        }
        return Ok(());
    }

    session.handle_reader(stdin().lock()).await?;

    Ok(())
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(":", ", ").into(),
        homepage: env!("CARGO_PKG_HOMEPAGE").into(),
    };

    let default_hook = panic::take_hook();

    if env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            default_hook(info);

            let file_path = human_panic::handle_dump(&meta, info);
            human_panic::print_msg(file_path, &meta)
                .expect("human-panic: printing error message to console failed");
        }));
    }
}
