use std::error::Error;
use std::time::Instant;

use clap::Parser;

use shmring::reader::{MessageReader, ReaderConfig};

/// Matches the writer_bench end-of-run message.
const END_MARKER: &[u8] = b"shmring:end";

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmring-reader.toml")]
    config: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    let cfg: ReaderConfig = confy::load_path(&opts.config)?;
    let reader = MessageReader::new(&cfg)?;
    run(&reader)?;
    Ok(())
}

fn run(reader: &MessageReader) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let mut received = 0usize;

    loop {
        let payload = reader.receive()?;
        if payload == END_MARKER {
            println!("\nEnd marker after {} messages", received);
            break;
        }
        received += 1;
        if received % 500_000 == 0 {
            eprint!("\r{} messages received", received);
        }
    }

    let duration = start.elapsed();
    let iops = ((received as f64) / (duration.as_millis() as f64)) * 1_000f64;
    println!(
        "\n{:#?}K messages read/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    Ok(())
}
