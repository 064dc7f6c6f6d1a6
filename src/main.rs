use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pixmux::server::SHUTDOWN;
use pixmux::{HeadlessToolkit, Server};

const DEFAULT_WIDTH: i32 = 640;
const DEFAULT_HEIGHT: i32 = 480;
const DEFAULT_SOCKET_NAME: &str = "pixmuxsock";

const MIN_WIDTH: i32 = 20;
const MIN_HEIGHT: i32 = 10;

struct Options {
    width: i32,
    height: i32,
    socket_name: String,
    help: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            socket_name: DEFAULT_SOCKET_NAME.to_string(),
            help: false,
        }
    }
}

fn parse_args<I: Iterator<Item = String>>(mut args: I) -> Options {
    let mut options = Options::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-d" => {
                // Invalid dimension strings keep the defaults.
                if let Some(spec) = args.next() {
                    if let Some((w, h)) = parse_dimensions(&spec) {
                        options.width = w;
                        options.height = h;
                    }
                }
            }
            "-n" => {
                if let Some(name) = args.next() {
                    options.socket_name = name;
                }
            }
            "-h" | "--help" => options.help = true,
            _ => {}
        }
    }
    options
}

/// `WxH` or `W,H`, floored to the minimum usable display size.
fn parse_dimensions(spec: &str) -> Option<(i32, i32)> {
    let (w, h) = spec.split_once('x').or_else(|| spec.split_once(','))?;
    let w: i32 = w.trim().parse().ok()?;
    let h: i32 = h.trim().parse().ok()?;
    Some((w.max(MIN_WIDTH), h.max(MIN_HEIGHT)))
}

fn print_help() {
    println!("pixmux - local display-multiplexing server");
    println!();
    println!("Usage: pixmux [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -d WxH      Display dimensions (also W,H; default 640x480)");
    println!("  -n NAME     Socket name (default {DEFAULT_SOCKET_NAME})");
    println!("  -h, --help  Show this help");
}

fn socket_path(name: &str) -> PathBuf {
    let dir = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    dir.join(name)
}

extern "C" fn handle_shutdown(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() -> Result<()> {
    // No SA_RESTART: the poll call must come back with EINTR so the
    // loop rechecks the shutdown flag.
    let action = SigAction::new(
        SigHandler::Handler(handle_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action).context("installing SIGINT handler")?;
        sigaction(Signal::SIGTERM, &action).context("installing SIGTERM handler")?;
    }
    Ok(())
}

fn run(options: &Options) -> Result<()> {
    install_signal_handlers()?;

    let path = socket_path(&options.socket_name);
    let toolkit = HeadlessToolkit::new(options.width, options.height);
    let mut server = Server::bind(&path, toolkit)
        .with_context(|| format!("starting server on {}", path.display()))?;

    info!(
        width = options.width,
        height = options.height,
        socket = %path.display(),
        "pixmux up"
    );
    server.run().context("server loop failed")?;
    Ok(())
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "pixmux=debug,info".into()),
        ))
        .with(fmt::layer())
        .init();

    let options = parse_args(std::env::args().skip(1));
    if options.help {
        print_help();
        return;
    }

    if let Err(err) = run(&options) {
        error!("{err:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_accept_both_separators() {
        assert_eq!(parse_dimensions("800x600"), Some((800, 600)));
        assert_eq!(parse_dimensions("800,600"), Some((800, 600)));
    }

    #[test]
    fn dimensions_floor_to_minimum() {
        assert_eq!(parse_dimensions("1x1"), Some((20, 10)));
    }

    #[test]
    fn bad_dimensions_are_rejected() {
        assert_eq!(parse_dimensions("800"), None);
        assert_eq!(parse_dimensions("axb"), None);
        assert_eq!(parse_dimensions(""), None);
    }

    #[test]
    fn unknown_flags_are_ignored() {
        let options = parse_args(
            ["-q", "-d", "100x100", "-z"]
                .into_iter()
                .map(String::from),
        );
        assert_eq!((options.width, options.height), (100, 100));
        assert_eq!(options.socket_name, DEFAULT_SOCKET_NAME);
        assert!(!options.help);
    }

    #[test]
    fn invalid_dimension_string_keeps_defaults() {
        let options = parse_args(["-d", "nope"].into_iter().map(String::from));
        assert_eq!(
            (options.width, options.height),
            (DEFAULT_WIDTH, DEFAULT_HEIGHT)
        );
    }
}
