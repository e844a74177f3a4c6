use std::ffi::OsString;

use clap::error::ErrorKind;
use clap::{Arg, Command};
use log::debug;

use crate::error::Error;
use crate::operations::{DeviceTarget, VolumeOp};

pub struct Arguments {
    pub target: DeviceTarget,
    pub operation: VolumeOp,
    pub server: Option<String>,
}

pub fn usage() -> String {
    format!(
        "usage: {} [p[layback]|c[apture]|b[oth] [g[et]|m[ute]|u[nmute]|t[oggle]|[+|-]0-100]]",
        crate_name!()
    )
}

pub fn parse_device_target(arg: &str) -> Result<DeviceTarget, String> {
    match arg {
        "p" | "playback" => Ok(DeviceTarget::Playback),
        "c" | "capture" => Ok(DeviceTarget::Capture),
        "b" | "both" => Ok(DeviceTarget::Both),
        _ => Err(format!("unknown device '{}'", arg)),
    }
}

/// A leading sign makes the number relative, otherwise it is absolute.
pub fn parse_volume_op(arg: &str) -> Result<VolumeOp, String> {
    match arg {
        "g" | "get" => return Ok(VolumeOp::Get),
        "m" | "mute" => return Ok(VolumeOp::Mute),
        "u" | "unmute" => return Ok(VolumeOp::Unmute),
        "t" | "toggle" => return Ok(VolumeOp::ToggleMute),
        _ => {}
    }
    if arg.starts_with('+') || arg.starts_with('-') {
        arg.parse::<i32>()
            .map(VolumeOp::AdjustRelative)
            .map_err(|e| format!("invalid volume change '{}': {}", arg, e))
    } else {
        arg.parse::<u32>()
            .map(VolumeOp::SetAbsolute)
            .map_err(|e| format!("invalid volume '{}': {}", arg, e))
    }
}

fn command() -> Command {
    Command::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .arg(
            Arg::new("device")
                .value_name("DEVICE")
                .help("p[layback], c[apture] or b[oth]")
                .default_value("both")
                .value_parser(parse_device_target),
        )
        .arg(
            Arg::new("volume")
                .value_name("VOLUME")
                .help("g[et], m[ute], u[nmute], t[oggle], +N/-N to adjust or N to set (percent)")
                .default_value("get")
                .allow_negative_numbers(true)
                .value_parser(parse_volume_op),
        )
        .arg(
            Arg::new("server")
                .long("server")
                .short('s')
                .value_name("SERVER")
                .help("Audio server to connect to instead of the default one"),
        )
}

pub fn parse_arguments<I, T>(args: I) -> Result<Arguments, Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = match command().try_get_matches_from(args) {
        Ok(matches) => matches,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            debug!("rejected arguments: {}", e);
            return Err(Error::Usage(usage()));
        }
    };

    let target = matches
        .get_one::<DeviceTarget>("device")
        .copied()
        .unwrap_or(DeviceTarget::Both);
    let operation = matches
        .get_one::<VolumeOp>("volume")
        .copied()
        .unwrap_or(VolumeOp::Get);
    let server = matches.get_one::<String>("server").cloned();

    Ok(Arguments {
        target,
        operation,
        server,
    })
}

pub fn get_arguments() -> Result<Arguments, Error> {
    parse_arguments(std::env::args_os())
}
