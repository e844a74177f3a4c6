#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

#[macro_use]
extern crate clap;

mod args;
mod error;
mod operations;
mod pipeline;
mod pulseop;
mod session;

use std::io;

use log::debug;

use error::Error;
use pulseop::PulseCore;
use session::{Plugin, Scale, SessionCore};

fn run() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .write_style(env_logger::WriteStyle::Auto)
        .format_module_path(false)
        .format_timestamp_nanos()
        .init();

    let arguments = args::get_arguments()?;
    debug!("{:?} on {:?}", arguments.operation, arguments.target);

    let mut session = PulseCore::new(crate_name!(), arguments.server)?;
    for plugin in Plugin::ALL {
        session.load_component(plugin.component())?;
    }
    session.set_mixer_scale(Scale::Cubic);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    pipeline::run(&mut session, arguments.target, arguments.operation, &mut out)
}

fn main() {
    if let Err(err) = run() {
        match &err {
            Error::Usage(usage) => eprintln!("{}", usage),
            _ => eprintln!("{}: {}", crate_name!(), err),
        }
        std::process::exit(err.exit_code());
    }
}
