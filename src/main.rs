use camd::{Context, Stack, Value};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "camd", about = "The CAMD compiler-metadata container CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show container header metadata
    Info {
        input: PathBuf,
    },
    /// List the block table
    List {
        input: PathBuf,
    },
    /// Dump block contents (decoded values; raw blocks as hex)
    Dump {
        input: PathBuf,
        /// Dump only the named block
        #[arg(short, long)]
        block: Option<String>,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    match Cli::parse().command {

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let ctx = load_container(&input)?;
            let info = ctx.info().ok_or("container has no header")?;
            println!("── CAMD container ───────────────────────────────────────");
            println!("  Path         {}", input.display());
            println!("  Endianness   {}", info.endianness);
            println!("  Version      {}", info.version);
            println!("  Block list   offset {} B", info.block_list_offset);
            println!("  Blocks       {}", info.n_blocks);
            println!("  Image size   {} B", info.image_len);
            for s in ctx.summaries().unwrap_or_default() {
                println!("    {:<20} {}/{}", s.name, s.format, s.encoding);
            }
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input } => {
            let ctx = load_container(&input)?;
            println!("Container: {}", input.display());
            println!("{:<24} {:>10} {:>10} {:>8}  {:<10}  {:<8} {}",
                     "Name", "Offset", "Size", "NameIdx", "Flags", "Format", "Encoding");
            for s in ctx.summaries().unwrap_or_default() {
                println!("{:<24} {:>10} {:>10} {:>8}  {:#010x}  {:<8} {}",
                    s.name, s.offset, s.size, s.name_idx, s.flags,
                    s.format, s.encoding);
            }
        }

        // ── Dump ─────────────────────────────────────────────────────────────
        Commands::Dump { input, block, json } => {
            let mut ctx = load_container(&input)?;
            let names: Vec<String> = match block {
                Some(name) => vec![name],
                None => ctx.block_names().iter().map(|n| n.to_string()).collect(),
            };

            if json {
                let mut blocks = Vec::new();
                for name in &names {
                    blocks.push(dump_json(&mut ctx, name)?);
                }
                let doc = serde_json::json!({
                    "path":   input.display().to_string(),
                    "blocks": blocks,
                });
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                for name in &names {
                    dump_text(&mut ctx, name)?;
                }
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn load_container(path: &PathBuf) -> Result<Context, Box<dyn std::error::Error>> {
    let image = std::fs::read(path)?;
    Ok(Context::load_bytes(&image)?)
}

fn find_summary(ctx: &Context, name: &str) -> Result<camd::BlockSummary, Box<dyn std::error::Error>> {
    ctx.summaries()
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.name == name)
        .ok_or_else(|| format!("no block named '{name}'").into())
}

fn dump_text(ctx: &mut Context, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let summary = find_summary(ctx, name)?;
    println!("Block: {} ({}, {}-endian, {} B)",
        summary.name, summary.format, summary.encoding, summary.size);

    let stack = ctx.get_block(name)?;
    match stack.raw_bytes() {
        Some(raw) => {
            println!("  raw payload; reading values requires the producer's format string");
            for (i, chunk) in raw.chunks(16).enumerate() {
                let line: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
                println!("  {:06x}  {}", i * 16, line.join(" "));
            }
        }
        None => {
            for (i, &index) in stack.live_indices().iter().enumerate() {
                println!("  [{i}] {}", render_value(stack, index));
            }
        }
    }
    Ok(())
}

fn dump_json(ctx: &mut Context, name: &str) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let summary = find_summary(ctx, name)?;
    let mut doc = serde_json::json!({
        "name":     summary.name,
        "format":   summary.format,
        "encoding": summary.encoding,
        "offset":   summary.offset,
        "size":     summary.size,
    });

    let stack = ctx.get_block(name)?;
    match stack.raw_bytes() {
        Some(raw) => {
            doc["payload_hex"] = serde_json::json!(hex::encode(raw));
        }
        None => {
            doc["values"] = serde_json::Value::Array(
                stack.live_indices().iter().map(|&i| value_to_json(stack, i)).collect(),
            );
        }
    }
    Ok(doc)
}

fn render_value(stack: &Stack, index: u32) -> String {
    match stack.at(index) {
        Ok(Value::Uint(v)) => v.to_string(),
        Ok(Value::Sint(v)) => v.to_string(),
        Ok(Value::Real(v)) => v.to_string(),
        Ok(Value::Zstr(s)) => format!("{s:?}"),
        Ok(Value::Bytes(b)) => format!("0x{}", hex::encode(b)),
        Ok(Value::Array(cells)) => {
            let inner: Vec<String> = cells.borrow().iter()
                .map(|&e| render_value(stack, e))
                .collect();
            format!("[{}]", inner.join(", "))
        }
        Ok(Value::Hash(cells)) => {
            let inner: Vec<String> = cells.borrow().iter()
                .map(|&(k, v)| format!("{}: {}", render_value(stack, k), render_value(stack, v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
        Err(_) => "<unresolvable index>".to_string(),
    }
}

fn value_to_json(stack: &Stack, index: u32) -> serde_json::Value {
    match stack.at(index) {
        Ok(Value::Uint(v)) => serde_json::json!(v),
        Ok(Value::Sint(v)) => serde_json::json!(v),
        Ok(Value::Real(v)) => serde_json::json!(v),
        Ok(Value::Zstr(s)) => serde_json::json!(s.as_ref()),
        Ok(Value::Bytes(b)) => serde_json::json!(hex::encode(b)),
        Ok(Value::Array(cells)) => serde_json::Value::Array(
            cells.borrow().iter().map(|&e| value_to_json(stack, e)).collect(),
        ),
        Ok(Value::Hash(cells)) => {
            let mut map = serde_json::Map::new();
            for &(k, v) in cells.borrow().iter() {
                map.insert(json_key(stack, k), value_to_json(stack, v));
            }
            serde_json::Value::Object(map)
        }
        Err(_) => serde_json::Value::Null,
    }
}

// JSON object keys must be strings; scalar keys render to their text form.
fn json_key(stack: &Stack, index: u32) -> String {
    match stack.at(index) {
        Ok(Value::Zstr(s)) => s.to_string(),
        _ => render_value(stack, index),
    }
}
