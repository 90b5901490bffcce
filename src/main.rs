use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use flate2::write::GzEncoder;
use flate2::Compression;

use tarutil::{
    filter_tar, open_and_unpack, pack, read_headers, AufsWhiteouts, CancelToken, Notifier,
    OverlayWhiteouts, TarFilter, UnpackOptions,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum WhiteoutFormat {
    /// AUFS `.wh.` markers to overlayfs char devices and opaque xattrs
    Overlay,
    /// overlayfs whiteouts back to AUFS `.wh.` markers
    Aufs,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace). Also switches to text-based progress"
    )]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Pack a directory tree into a tarball
    Pack {
        #[arg(help = "Directory to pack")]
        source: PathBuf,

        #[arg(short, long, default_value = "-", help = "Output tarball, '-' for stdout")]
        output: String,

        #[arg(long, help = "Gzip-compress the output")]
        gzip: bool,
    },

    /// Apply one or more layer tarballs, in order, to a directory
    Unpack {
        #[arg(required = true, help = "Layer tarballs (plain or gzipped), oldest first")]
        layers: Vec<PathBuf>,

        #[arg(short, long, help = "Destination directory")]
        dest: PathBuf,

        #[arg(long, help = "Do not change file ownership (for unprivileged use)")]
        no_lchown: bool,
    },

    /// Convert the whiteout format of a layer tarball
    Convert {
        #[arg(value_enum, help = "Whiteout format to produce")]
        to: WhiteoutFormat,

        #[arg(default_value = "-", help = "Input tarball, '-' for stdin")]
        input: String,

        #[arg(short, long, default_value = "-", help = "Output tarball, '-' for stdout")]
        output: String,
    },

    /// Print the entry headers of a tarball as JSON
    List {
        #[arg(default_value = "-", help = "Tarball to inspect, '-' for stdin")]
        archive: String,
    },
}

fn open_input(path: &str) -> Result<Box<dyn Read>> {
    if path == "-" {
        return Ok(Box::new(io::stdin().lock()));
    }
    let file = File::open(path).with_context(|| format!("Failed to open {}", path))?;
    Ok(Box::new(BufReader::new(file)))
}

fn open_output(path: &str) -> Result<Box<dyn Write>> {
    if path == "-" {
        return Ok(Box::new(io::stdout().lock()));
    }
    let file = File::create(path).with_context(|| format!("Failed to create {}", path))?;
    Ok(Box::new(BufWriter::new(file)))
}

fn run_pack(
    source: &Path,
    output: &str,
    gzip: bool,
    cancel: &CancelToken,
    notifier: &Notifier,
) -> Result<()> {
    notifier.info(&format!("Packing {}", source.display()));
    let writer = open_output(output)?;

    let mut writer = if gzip {
        let encoder = pack(source, GzEncoder::new(writer, Compression::default()), cancel)
            .with_context(|| format!("Failed to pack {}", source.display()))?;
        encoder.finish().context("Failed to finish gzip stream")?
    } else {
        pack(source, writer, cancel)
            .with_context(|| format!("Failed to pack {}", source.display()))?
    };
    writer.flush().context("Failed to flush output")?;

    notifier.finish(&format!("Packed {}", source.display()));
    Ok(())
}

fn run_unpack(layers: &[PathBuf], options: &UnpackOptions, dest: &Path, notifier: &Notifier) -> Result<()> {
    let progress = notifier.create_progress_bar(layers.len() as u64, "Applying layers");

    for (index, layer) in layers.iter().enumerate() {
        match &progress {
            Some(progress) if notifier.use_progress_bars() => {
                progress.set_message(layer.display().to_string());
            }
            _ => notifier.info(&format!(
                "Applying layer {}/{}: {}",
                index + 1,
                layers.len(),
                layer.display()
            )),
        }
        open_and_unpack(layer, dest, options)
            .with_context(|| format!("Failed to unpack {}", layer.display()))?;
        if let Some(progress) = &progress {
            progress.inc(1);
        }
    }

    if let Some(progress) = progress {
        progress.finish_with_message("Done");
    }
    notifier.finish(&format!(
        "Unpacked {} layer(s) into {}",
        layers.len(),
        dest.display()
    ));
    Ok(())
}

fn run_convert(to: WhiteoutFormat, input: &str, output: &str, notifier: &Notifier) -> Result<()> {
    notifier.info(&format!("Converting {} to {:?} whiteouts", input, to));

    let mut filter: Box<dyn TarFilter> = match to {
        WhiteoutFormat::Overlay => Box::new(OverlayWhiteouts::new()),
        WhiteoutFormat::Aufs => Box::new(AufsWhiteouts::new()),
    };

    let reader = open_input(input)?;
    let writer = open_output(output)?;
    let mut writer = filter_tar(reader, writer, filter.as_mut())
        .with_context(|| format!("Failed to convert {}", input))?;
    writer.flush().context("Failed to flush output")?;

    notifier.finish("Conversion complete");
    Ok(())
}

fn run_list(archive: &str) -> Result<()> {
    let headers = read_headers(open_input(archive)?)
        .with_context(|| format!("Failed to read {}", archive))?;

    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &headers).context("Failed to encode headers")?;
    writeln!(stdout)?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let notifier = Notifier::new(cli.verbose);

    notifier.debug(&format!("Verbosity: {:?}", notifier.verbosity_level()));

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .map_err(|e| anyhow!("Failed to install Ctrl-C handler: {}", e))?;

    match cli.command {
        Command::Pack {
            source,
            output,
            gzip,
        } => run_pack(&source, &output, gzip, &cancel, &notifier),
        Command::Unpack {
            layers,
            dest,
            no_lchown,
        } => {
            let options = UnpackOptions { no_lchown, cancel };
            run_unpack(&layers, &options, &dest, &notifier)
        }
        Command::Convert { to, input, output } => run_convert(to, &input, &output, &notifier),
        Command::List { archive } => run_list(&archive),
    }
}
