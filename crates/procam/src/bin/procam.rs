use clap::{Parser, Subcommand};
use procam::calib::HomographyEstimator;
use procam::core::LogFilter;
use procam::graycode::{generate, CorrespondenceDataSet, GrayCodeCodec};
use procam::{images, ProcamConfig, ProcamError};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(
    name = "procam",
    version,
    about = "Gray-code structured light scanning and projector calibration"
)]
struct Cli {
    /// Session config (JSON); absent values take their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter: a level, optionally followed by `target=level` overrides
    /// (`warn,procam_calib=debug`). `RUST_LOG` wins when built with `tracing`.
    #[arg(long, global = true, default_value = "info")]
    log_level: LogFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the pattern frames for a projector as numbered PNG files.
    Generate {
        /// Projector resolution, e.g. `1280x800`.
        #[arg(long, value_parser = parse_size)]
        projector: (u32, u32),
        #[arg(long)]
        out: PathBuf,
    },
    /// Decode a directory of captured frames into a data set file.
    Decode {
        /// Directory of PNG frames; file name order must match projection order.
        #[arg(long)]
        frames: PathBuf,
        #[arg(long, value_parser = parse_size)]
        projector: (u32, u32),
        #[arg(long)]
        out: PathBuf,
        /// Overrides the config's white/black threshold.
        #[arg(long)]
        threshold: Option<u8>,
        /// Also write median, inverse median and active-pixel previews here.
        #[arg(long)]
        previews: Option<PathBuf>,
    },
    /// Fit a camera-to-projector homography on a data set and print it as JSON.
    Homography {
        #[arg(long)]
        data_set: PathBuf,
        /// Use every n-th active pixel.
        #[arg(long)]
        stride: Option<usize>,
    },
}

#[derive(Serialize)]
struct HomographyReport {
    homography: [[f64; 3]; 3],
    inliers: usize,
    samples: usize,
    rms: f64,
}

fn parse_size(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got `{s}`"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<u32>()
            .map_err(|e| format!("bad dimension `{v}`: {e}"))
    };
    Ok((parse(w)?, parse(h)?))
}

fn run(cli: Cli) -> Result<(), ProcamError> {
    let config = match &cli.config {
        Some(path) => ProcamConfig::load_json(path)?,
        None => ProcamConfig::default(),
    };

    match cli.command {
        Command::Generate { projector, out } => {
            let pattern = generate(projector.0, projector.1)?;
            let written = images::write_pattern(&pattern, &out)?;
            log::info!("wrote {} frames to {}", written.len(), out.display());
        }
        Command::Decode {
            frames,
            projector,
            out,
            threshold,
            previews,
        } => {
            let codec = GrayCodeCodec::new(projector.0, projector.1)?;
            let captured = images::load_frames(&frames)?;
            let threshold = threshold.unwrap_or(config.scan.threshold);
            let data_set = codec.decode(&captured, threshold)?;
            data_set.save(&out)?;
            log::info!(
                "decoded {} active pixels into {}",
                data_set.active_count(),
                out.display()
            );
            if let Some(dir) = previews {
                images::write_previews(&data_set, &dir)?;
            }
        }
        Command::Homography { data_set, stride } => {
            let data_set = CorrespondenceDataSet::load(&data_set)?;
            let mut params = config.homography;
            if let Some(stride) = stride {
                params.sample_stride = stride;
            }
            let samples = data_set.active_count().div_ceil(params.sample_stride.max(1));
            let fit = HomographyEstimator::new(params).fit_data_set(&data_set, None)?;
            let report = HomographyReport {
                homography: fit.homography.to_array(),
                inliers: fit.inliers.len(),
                samples,
                rms: fit.rms,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    #[cfg(feature = "tracing")]
    procam::init_tracing(false, &cli.log_level);
    #[cfg(not(feature = "tracing"))]
    if let Err(e) = procam::core::init(cli.log_level.clone()) {
        eprintln!("logger: {e}");
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
