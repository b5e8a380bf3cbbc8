use clap::Parser;
use docrag_context::text::{Document, WindowChunker};
use serde::Serialize;
use std::fs;
use std::io::{self, Read};
use std::num::NonZeroUsize;

/// A CLI tool to chunk a page's text into JSON output using docrag-context.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input text file. If not provided, reads from stdin.
    #[arg(short, long)]
    input: Option<String>,

    /// Source URL recorded on every chunk.
    #[arg(short, long, default_value = "unknown_url")]
    url: String,

    /// Optional page title recorded on every chunk.
    #[arg(short, long)]
    title: Option<String>,

    /// Window sizes to chunk at; each produces an independent chunk set.
    #[arg(short, long, value_delimiter = ',', default_value = "1000")]
    window_sizes: Vec<NonZeroUsize>,
}

#[derive(Serialize)]
struct SerializableChunk<'a> {
    url: &'a str,
    title: Option<&'a str>,
    sequence: usize,
    content_length: usize,
    content: &'a str,
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    let text = if let Some(input_path) = args.input {
        fs::read_to_string(input_path)?
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    };
    let document = Document::new(args.url, args.title, text);

    let chunks: Vec<_> = args
        .window_sizes
        .iter()
        .flat_map(|&size| WindowChunker::new(size).get_chunks(&document))
        .collect();

    let mut sequences = std::collections::HashMap::new();
    let serializable_chunks: Vec<SerializableChunk> = chunks
        .iter()
        .map(|c| {
            let sequence = sequences.entry(c.content_length).or_insert(0usize);
            let entry = SerializableChunk {
                url: &c.url,
                title: c.title.as_deref(),
                sequence: *sequence,
                content_length: c.content_length,
                content: &c.content,
            };
            *sequence += 1;
            entry
        })
        .collect();

    let json_output = serde_json::to_string_pretty(&serializable_chunks)?;
    println!("{}", json_output);

    Ok(())
}
