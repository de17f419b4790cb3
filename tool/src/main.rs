use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;

use gcrconvert::error::ImageError;
use gcrconvert::halftrack::HalfTrackImage;
use gcrconvert::image_d64::{parse_d64_image, write_d64_image};
use gcrconvert::image_g64::{parse_g64_image, write_g64_image};
use gcrconvert::image_i64::{parse_i64_image, write_i64_image};

#[derive(Parser, Debug)]
#[command(author, about, long_about = None)]
struct Args {
    /// Path to source disk image
    infile: PathBuf,

    /// Path to destination disk image, must not exist yet
    outfile: PathBuf,
}

fn image_extension(path: &Path) -> Result<String> {
    let extension = path
        .extension()
        .and_then(OsStr::to_str)
        .with_context(|| format!("{} has no file extension!", path.display()))?;
    Ok(extension.to_lowercase())
}

fn parse_image(buffer: &[u8], extension: &str) -> Result<HalfTrackImage> {
    match extension {
        "d64" | "d71" => parse_d64_image(buffer),
        "g64" => parse_g64_image(buffer),
        "i64" => parse_i64_image(buffer),
        _ => bail!("{extension} is an unknown file extension!"),
    }
}

fn write_image(image: &HalfTrackImage, extension: &str) -> Result<Vec<u8>> {
    match extension {
        "d64" | "d71" => write_d64_image(image),
        "g64" => write_g64_image(image),
        "i64" => write_i64_image(image),
        _ => bail!("{extension} is an unknown file extension!"),
    }
}

fn convert(infile: &Path, outfile: &Path) -> Result<()> {
    let in_extension = image_extension(infile)?;
    let out_extension = image_extension(outfile)?;

    let buffer =
        fs::read(infile).with_context(|| format!("unable to read {}", infile.display()))?;
    let image = parse_image(&buffer, &in_extension)?;

    let mut output_file = match OpenOptions::new().write(true).create_new(true).open(outfile) {
        Err(error) if error.kind() == ErrorKind::AlreadyExists => {
            bail!(ImageError::OutputExists(outfile.to_path_buf()))
        }
        result => result.with_context(|| format!("unable to create {}", outfile.display()))?,
    };

    let result = write_image(&image, &out_extension)
        .and_then(|data| output_file.write_all(&data).map_err(Into::into));
    if result.is_err() {
        // no partial output files
        drop(output_file);
        let _ = fs::remove_file(outfile);
    }
    result
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    convert(&args.infile, &args.outfile)
}
