use anyhow::{bail, Context, Error};
use blake2kit::{Hash, Params, Variant};
use serde::Deserialize;
use std::fs::File;
use std::io;
use std::io::prelude::*;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const LOG_ENV: &str = "BLAKE2KIT_LOG";

const USAGE: &str = "
Usage: blake2kit [options] [<inputs>...]
       blake2kit (--help | --version)

Options:
    --variant=<name>  blake2b or blake2s [default: blake2b]
    --length=<bytes>  Digest length in bytes, the variant's maximum by default
    --key=<hex>       Key for keyed hashing, as hex
    --text=<string>   Hash the UTF-8 bytes of this string instead of inputs
    --upper           Print uppercase hex
    -h, --help        Show this message
    --version         Show the version
";

#[derive(Debug, Deserialize)]
struct Args {
    arg_inputs: Vec<PathBuf>,
    flag_variant: String,
    flag_length: Option<usize>,
    flag_key: Option<String>,
    flag_text: Option<String>,
    flag_upper: bool,
    flag_help: bool,
    flag_version: bool,
}

fn main() -> Result<(), Error> {
    init_logging();
    let args: Args = docopt::Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    if args.flag_help {
        print!("{}", USAGE);
    } else if args.flag_version {
        println!("{}", VERSION);
    } else {
        let params = params(&args)?;
        hash(&args, &params)?;
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

// All parameter problems are reported here, before any input is read.
fn params(args: &Args) -> Result<Params, Error> {
    let variant: Variant = args.flag_variant.parse()?;
    let mut params = Params::new(variant);
    if let Some(length) = args.flag_length {
        params.hash_length(length);
    }
    if let Some(ref key_hex) = args.flag_key {
        let key = hex::decode(key_hex).context("--key must be hex")?;
        params.key(&key);
    }
    params.validate()?;
    tracing::debug!(?params, "parsed parameters");
    Ok(params)
}

fn render(hash: &Hash, upper: bool) -> String {
    if upper {
        hash.to_hex_upper().to_string()
    } else {
        hash.to_hex().to_string()
    }
}

fn hash(args: &Args, params: &Params) -> Result<(), Error> {
    if let Some(ref text) = args.flag_text {
        if !args.arg_inputs.is_empty() {
            bail!("--text can't be combined with input paths");
        }
        let hash = params.hash(text.as_bytes())?;
        println!("{}", render(&hash, args.flag_upper));
        return Ok(());
    }

    if args.arg_inputs.is_empty() {
        let contents = read_input(None)?;
        let hash = params.hash(&contents)?;
        println!("{}", render(&hash, args.flag_upper));
        return Ok(());
    }

    // Load everything first so that all the readable inputs can be hashed in
    // one batch.
    let loaded: Vec<Result<Contents, Error>> = args
        .arg_inputs
        .iter()
        .map(|path| read_input(Some(path)))
        .collect();
    let readable: Vec<&[u8]> = loaded
        .iter()
        .filter_map(|result| result.as_ref().ok())
        .map(|contents| &contents[..])
        .collect();
    let hashes = params.hash_many(&readable)?;
    let mut hashes = hashes.iter();

    let mut did_error = false;
    for (input, result) in args.arg_inputs.iter().zip(loaded.iter()) {
        let input_str = input.to_string_lossy();
        // As with b2sum or sha1sum, the multi-arg hash loop prints errors and keeps going.
        // This is more convenient for the user in cases like `blake2kit *`, where it's common
        // that some of the inputs will error on read e.g. because they're directories.
        match result {
            Ok(_) => {
                // There's exactly one hash for each readable input, in order.
                if let Some(hash) = hashes.next() {
                    if args.arg_inputs.len() > 1 {
                        println!("{}  {}", render(hash, args.flag_upper), input_str);
                    } else {
                        println!("{}", render(hash, args.flag_upper));
                    }
                }
            }
            Err(e) => {
                did_error = true;
                eprintln!("blake2kit: {}: {}", input_str, e);
            }
        }
    }
    if did_error {
        std::process::exit(1);
    }
    Ok(())
}

// Bytes to hash, either mapped from a regular file or read into memory.
enum Contents {
    Mapped(memmap::Mmap),
    Read(Vec<u8>),
}

impl Deref for Contents {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match *self {
            Contents::Mapped(ref map) => &map[..],
            Contents::Read(ref buf) => &buf[..],
        }
    }
}

fn read_input(maybe_path: Option<&PathBuf>) -> Result<Contents, Error> {
    let mut input = open_input(maybe_path)?;
    if let Some(map) = maybe_memmap_input(&input)? {
        return Ok(Contents::Mapped(map));
    }
    let mut buf = Vec::new();
    input.read_to_end(&mut buf)?;
    Ok(Contents::Read(buf))
}

fn open_input(maybe_path: Option<&PathBuf>) -> Result<Input, Error> {
    Ok(
        if let Some(path) = path_if_some_and_not_dash(maybe_path) {
            Input::File(File::open(path)?)
        } else {
            Input::Stdin
        },
    )
}

enum Input {
    Stdin,
    File(File),
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            Input::Stdin => io::stdin().read(buf),
            Input::File(ref mut file) => file.read(buf),
        }
    }
}

fn path_if_some_and_not_dash(maybe_path: Option<&PathBuf>) -> Option<&Path> {
    match maybe_path {
        Some(path) if path != Path::new("-") => Some(path.as_path()),
        _ => None,
    }
}

fn maybe_memmap_input(input: &Input) -> Result<Option<memmap::Mmap>, Error> {
    let in_file = match *input {
        Input::Stdin => return Ok(None),
        Input::File(ref file) => file,
    };
    let metadata = in_file.metadata()?;
    Ok(if !metadata.is_file() {
        // Not a real file.
        None
    } else if metadata.len() > isize::max_value() as u64 {
        // Too long to safely map. https://github.com/danburkert/memmap-rs/issues/69
        None
    } else if metadata.len() == 0 {
        // Mapping an empty file currently fails. https://github.com/danburkert/memmap-rs/issues/72
        None
    } else {
        // Explicitly set the length of the memory map, so that filesystem changes can't race to
        // violate the invariants we just checked.
        let map = unsafe {
            memmap::MmapOptions::new()
                .len(metadata.len() as usize)
                .map(&in_file)?
        };
        Some(map)
    })
}
