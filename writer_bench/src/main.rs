use std::error::Error;
use std::time::Instant;

use clap::Parser;

use shmring::writer::{MessageWriter, WriterConfig};

/// Final message of a bench run; the reader stops when it sees it.
const END_MARKER: &[u8] = b"shmring:end";

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmring-writer.toml")]
    config: String,
    #[clap(long = "count", default_value = "1000000")]
    count: usize,
    #[clap(long = "payload-size", default_value = "256")]
    payload_size: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    let cfg: WriterConfig = confy::load_path(&opts.config)?;
    println!("{:?}", &cfg.ring);
    let writer = &mut MessageWriter::new(&cfg)?;
    run(writer, &opts)?;
    Ok(())
}

fn run(writer: &mut MessageWriter, opts: &Opts) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let payload = vec![0x42u8; opts.payload_size];

    for sent in 0..opts.count {
        writer.send(&payload)?;
        if sent % 500_000 == 0 {
            eprint!("\r{} messages sent", sent);
        }
    }
    writer.send(END_MARKER)?;

    let duration = start.elapsed();
    let iops = ((opts.count as f64) / (duration.as_millis() as f64)) * 1_000f64;
    println!(
        "\n{:#?}K messages written/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    Ok(())
}
