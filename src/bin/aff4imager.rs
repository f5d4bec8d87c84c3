//! `aff4imager`: a CLI front-end exercising `exhume_aff4`'s public API
//! end to end (spec §6 "External interfaces").
//!
//! Acquires one or more inputs into an AFF4 container (or, with
//! `--volume_format raw`, a plain concatenated dd-style image). Memory
//! acquisition and ELF core-dump parsing are platform drivers out of
//! scope (spec.md §1 Non-goals) and are wired to stubs that report
//! `NotImplemented` rather than silently doing nothing.

use std::fs::File;
use std::path::Path;
use std::process::exit;

use clap::{Arg, ArgAction, Command};
use log::{error, info, warn};

use exhume_aff4::{
    AFF4Image, AFF4Object, Aff4Stream, Compression, DataStore, FileBackedObject, Urn, WriteMode,
    ZipFile,
};

fn build_cli() -> Command {
    Command::new("aff4imager")
        .version("0.1.0")
        .author("ForensicXlab")
        .about("Acquires evidence into an AFF4 forensic evidence container.")
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_parser(clap::value_parser!(String))
                .required(true)
                .help("Path to the container (or raw image) to create."),
        )
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_parser(clap::value_parser!(String))
                .action(ArgAction::Append)
                .required(true)
                .help("Path to a source to acquire. May be repeated."),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_parser(["map", "elf", "raw"])
                .default_value("raw")
                .help("Acquisition format: a logical map of the inputs, an ELF core dump, or raw disk imaging."),
        )
        .arg(
            Arg::new("volume_format")
                .long("volume_format")
                .value_parser(["aff4", "raw"])
                .default_value("aff4")
                .help("Container format: an AFF4 ZIP64 volume, or a plain concatenated raw image."),
        )
        .arg(
            Arg::new("compression")
                .long("compression")
                .value_parser(["stored", "deflate", "snappy", "lz4"])
                .default_value("deflate")
                .help("Per-chunk compression method for AFF4Image streams."),
        )
        .arg(
            Arg::new("chunks_per_segment")
                .long("chunks_per_segment")
                .value_parser(clap::value_parser!(usize))
                .default_value("1024")
                .help("Chunks per bevy."),
        )
        .arg(
            Arg::new("max_volume_size")
                .long("max_volume_size")
                .value_parser(clap_num::si_number::<u64>)
                .help("Target volume size, accepting K/M/G suffixes (e.g. 500M)."),
        )
        .arg(
            Arg::new("acquire-memory")
                .short('m')
                .long("acquire-memory")
                .action(ArgAction::SetTrue)
                .help("Acquire live physical memory instead of --input paths."),
        )
        .arg(
            Arg::new("pagefile")
                .short('p')
                .long("pagefile")
                .value_parser(clap::value_parser!(String))
                .help("Path to a pagefile to merge into a memory acquisition."),
        )
}

fn parse_compression(s: &str) -> Compression {
    match s {
        "stored" => Compression::Stored,
        "deflate" => Compression::Deflate,
        "snappy" => Compression::Snappy,
        "lz4" => Compression::Lz4,
        other => {
            error!("unknown compression method '{}'", other);
            exit(1);
        }
    }
}

fn member_name_for_input(index: usize, input_path: &str) -> String {
    let basename = Path::new(input_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("input-{}", index));
    format!("{:02}-{}", index, basename)
}

/// Streams `input_path` into a fresh `AFF4Image` member of `volume`,
/// returning the image's URN and final size.
fn acquire_image(
    store: &DataStore,
    volume: &ZipFile,
    index: usize,
    input_path: &str,
    chunks_per_segment: usize,
    compression: Compression,
) -> exhume_aff4::Aff4Result<(Urn, u64)> {
    let mut source = FileBackedObject::open(Urn::from_filename(input_path), WriteMode::Read)?;
    let image_urn = volume
        .urn()
        .append(&member_name_for_input(index, input_path));
    let mut image = AFF4Image::create(
        store,
        image_urn.clone(),
        volume.clone(),
        exhume_aff4::image::DEFAULT_CHUNK_SIZE,
        chunks_per_segment,
        compression,
    )?;

    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        image.write(&buf[..n])?;
    }
    image.flush(store)?;
    info!("acquired {} into {} ({} bytes)", input_path, image_urn, image.size());
    let size = image.size();
    Ok((image_urn, size))
}

fn run() -> exhume_aff4::Aff4Result<()> {
    let matches = build_cli().get_matches();

    let output = matches.get_one::<String>("output").unwrap();
    let inputs: Vec<String> = matches
        .get_many::<String>("input")
        .unwrap()
        .cloned()
        .collect();
    let format = matches.get_one::<String>("format").unwrap();
    let volume_format = matches.get_one::<String>("volume_format").unwrap();
    let compression = parse_compression(matches.get_one::<String>("compression").unwrap());
    let chunks_per_segment = *matches.get_one::<usize>("chunks_per_segment").unwrap();
    let max_volume_size = matches.get_one::<u64>("max_volume_size");
    let acquire_memory = matches.get_flag("acquire-memory");
    let pagefile = matches.get_one::<String>("pagefile");

    if acquire_memory {
        error!(
            "live memory acquisition is not implemented on any platform: \
             MemorySource has no backend in this build"
        );
        return Err(exhume_aff4::Aff4Status::NotImplemented(
            "memory acquisition".into(),
        ));
    }
    if format == "elf" {
        error!("ELF core-dump acquisition is not implemented (interface-only per scope)");
        return Err(exhume_aff4::Aff4Status::NotImplemented(
            "ELF core-dump acquisition".into(),
        ));
    }
    if let Some(p) = pagefile {
        warn!("--pagefile {} accepted but pagefile merging is not implemented", p);
    }
    if let Some(limit) = max_volume_size {
        warn!(
            "--max_volume_size {} accepted but splitting a volume across multiple files is not implemented",
            limit
        );
    }

    if volume_format == "raw" {
        let mut out = File::create(output)
            .map_err(|e| exhume_aff4::Aff4Status::IoError(e.to_string()))?;
        for input_path in &inputs {
            let mut in_file =
                File::open(input_path).map_err(|e| exhume_aff4::Aff4Status::IoError(e.to_string()))?;
            std::io::copy(&mut in_file, &mut out)
                .map_err(|e| exhume_aff4::Aff4Status::IoError(e.to_string()))?;
        }
        info!("wrote raw concatenated image to {}", output);
        return Ok(());
    }

    let store = DataStore::new();
    let mut volume = ZipFile::create(
        Urn::from_filename(output),
        output,
        "AFF4 container created by aff4imager",
    )?;

    let mut acquired = Vec::with_capacity(inputs.len());
    for (index, input_path) in inputs.iter().enumerate() {
        acquired.push(acquire_image(
            &store,
            &volume,
            index,
            input_path,
            chunks_per_segment,
            compression,
        )?);
    }

    if format == "map" {
        let map_urn = volume.urn().append("logical-image");
        let mut map = exhume_aff4::AFF4Map::create(&store, map_urn.clone(), volume.clone())?;
        let mut offset = 0u64;
        for (image_urn, size) in &acquired {
            map.add_range(offset, 0, *size, image_urn);
            offset += size;
        }
        map.flush(&store)?;
        info!("assembled logical map {} across {} inputs", map_urn, acquired.len());
    }

    volume.close(&store)?;
    info!("wrote AFF4 container to {}", output);
    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        error!("{}", e);
        exit(1);
    }
}
