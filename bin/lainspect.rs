use std::env;
use std::process::ExitCode;

use largearray::{LargeArray, Result};
use tracing_subscriber::EnvFilter;

fn inspect(path: &str) -> Result<()> {
    let inspection = LargeArray::inspect(path)?;
    println!("file:               {}", path);
    println!("elements:           {}", inspection.count);
    println!("used bytes:         {}", inspection.total_used_bytes);
    match inspection.free_bytes {
        Some(free) => println!("free bytes:         {}", free),
        None => println!("free bytes:         unknown (no snapshot, counters may be stale)"),
    }
    println!("elements per page:  {}", inspection.max_elements_per_page);

    println!("pages:              {}", inspection.pages.len());
    let mut start = 0u64;
    for (i, info) in inspection.pages.iter().enumerate() {
        println!(
            "  #{:<4} {:>12}  [{}..{})  {}/{}  prev {}  next {}",
            i,
            info.address.to_string(),
            start,
            start + info.count,
            info.count,
            info.max_count,
            info.prev,
            info.next,
        );
        start += info.count;
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let Some(path) = env::args().nth(1) else {
        eprintln!("usage: lainspect <path>");
        return ExitCode::from(2);
    };

    match inspect(&path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("lainspect: {}", err);
            ExitCode::FAILURE
        }
    }
}
