use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use clap::Parser;
use mapreduce_ft::mr::app::Application;
use mapreduce_ft::mr::worker;

const OUP_FILE: &str = "mr-out-0";

/// Runs a whole job in-process and writes the result to mr-out-0.
#[derive(Parser, Debug)]
#[command(name = "mrsequential")]
struct Args {
    /// Built-in application name (`wc`) or path to a plugin library.
    app: String,

    #[arg(required = true)]
    files: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let app = Application::from_arg(&args.app)?;

    let mut intermediate = vec![];
    for file in &args.files {
        let content =
            std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file))?;
        intermediate.extend((app.map)(file, &content));
    }

    intermediate.sort_by(|a, b| a.key.cmp(&b.key));

    let mut of = BufWriter::new(File::create(OUP_FILE).context("failed to open the output file")?);
    worker::collapse(&mut of, &intermediate, app.reduce).context("failed to write to file")?;
    of.flush().context("failed to write to file")?;
    Ok(())
}
