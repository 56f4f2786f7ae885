#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tidefs::{mkfs, BlockDevice, FileBlockDevice, Fs, InodeNumber, BLOCK_SIZE};

#[derive(Parser)]
#[command(name = "tidefs", about = "tidefs — copy-on-write block filesystem core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format an image file.
    Mkfs {
        /// Path to the image file (created or truncated).
        image: PathBuf,
        /// Volume size in blocks of 4 KiB.
        #[arg(long, default_value_t = 65536)]
        blocks: u64,
    },
    /// Show a formatted image's geometry and free space.
    Stat {
        /// Path to the image file.
        image: PathBuf,
    },
    /// Exercise the write path: write, commit, read back, rewrite.
    Smoke {
        /// Path to a formatted image file.
        image: PathBuf,
    },
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Mkfs { image, blocks } => cmd_mkfs(&image, blocks),
        Command::Stat { image } => cmd_stat(&image),
        Command::Smoke { image } => cmd_smoke(&image),
    }
}

fn cmd_mkfs(image: &PathBuf, blocks: u64) -> Result<()> {
    let dev = FileBlockDevice::create(image, blocks)
        .with_context(|| format!("creating {}", image.display()))?;

    let fsid = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1);
    let sb = mkfs(&dev, fsid).context("formatting volume")?;

    println!(
        "formatted {}: fsid {:#x}, {} blocks, {} buddy metadata blocks",
        image.display(),
        sb.fsid,
        sb.total_blocks,
        sb.buddy_blocks
    );
    Ok(())
}

fn cmd_stat(image: &PathBuf) -> Result<()> {
    let fs = mount(image)?;
    let sb = fs.superblock();
    let stat = fs.statfs()?;

    println!("fsid:         {:#x}", sb.fsid);
    println!("commit seq:   {}", sb.seq);
    println!("total blocks: {}", stat.total_blocks);
    println!("free blocks:  {}", stat.free_blocks);
    println!("data start:   {}", sb.first_blkno());
    Ok(())
}

fn cmd_smoke(image: &PathBuf) -> Result<()> {
    let fs = mount(image)?;
    let ino = InodeNumber(1);

    let data: Vec<u8> = (0..4 * BLOCK_SIZE as usize).map(|i| i as u8).collect();
    fs.write(ino, 0, &data).context("writing")?;
    fs.commit().context("committing")?;
    let (count, first) = fs.bmap(ino, 0);
    println!("wrote {} bytes -> {count} blocks at {first}", data.len());

    fs.drop_page_cache();
    let mut out = vec![0u8; data.len()];
    fs.read(ino, 0, &mut out).context("reading back")?;
    if out != data {
        bail!("read-back mismatch");
    }

    fs.write(ino, 0, &data[..16]).context("rewriting")?;
    let (_, moved) = fs.bmap(ino, 0);
    fs.commit().context("committing rewrite")?;
    println!("rewrite moved block {first} -> {moved}");

    let stat = fs.statfs()?;
    println!("free blocks:  {}", stat.free_blocks);
    println!("ok");
    Ok(())
}

fn mount(image: &PathBuf) -> Result<Fs> {
    let dev: Arc<dyn BlockDevice> = Arc::new(
        FileBlockDevice::open(image).with_context(|| format!("opening {}", image.display()))?,
    );
    Fs::mount(dev).context("mounting")
}
