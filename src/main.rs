// Async I/O engine demo binary.
//
// Initializes the engine against a scratch file and drives a handful of read/write/fsync
// operations through it, printing the resulting per-backend counters.

use aio_engine::config::AioConfig;
use aio_engine::engine::{self, EngineHooks};
use aio_engine::handle::{ReadMode, RelationTag};
use aio_engine::{AioError, Result, VERSION};
use std::os::unix::io::AsRawFd;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    print_banner();

    let config = AioConfig::default();
    print_config(&config);

    engine::init(config, EngineHooks::default())?;
    let aio = engine::get()?;
    let backend_id = aio.register_backend();
    info!(backend_id, "registered demo backend");

    let scratch_path = std::env::temp_dir().join(format!("aio-engine-demo-{}.dat", std::process::id()));
    std::fs::write(&scratch_path, vec![0xAB_u8; 8192]).map_err(AioError::Io)?;
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&scratch_path)
        .map_err(AioError::Io)?;
    let fd = file.as_raw_fd();

    let mut buf = vec![0u8; 8192];
    let h = aio.acquire(backend_id).await?;
    aio.start_read_buffer(
        backend_id,
        h,
        RelationTag {
            relation_id: 1,
            fork: 0,
            block_size_log2: 13,
        },
        fd,
        0,
        8192,
        buf.as_mut_ptr() as usize,
        1,
        ReadMode::Normal,
    );
    aio.submit_pending(backend_id).await?;
    aio.wait(backend_id, h, false).await?;
    info!(success = aio.success(h), result = h.result(), "read completed");
    aio.release(h);

    let h = aio.acquire(backend_id).await?;
    aio.start_fsync(backend_id, h, fd, None, false);
    aio.submit_pending(backend_id).await?;
    aio.wait(backend_id, h, false).await?;
    info!(success = aio.success(h), "fsync completed");
    aio.release(h);

    let h = aio.acquire(backend_id).await?;
    aio.start_nop(backend_id, h);
    aio.submit_pending(backend_id).await?;
    aio.wait(backend_id, h, false).await?;
    aio.release(h);

    aio.drain_all_outstanding(backend_id).await?;
    println!("{}", aio.stats(backend_id));

    drop(file);
    let _ = std::fs::remove_file(&scratch_path);

    Ok(())
}

fn print_banner() {
    println!("================================================================");
    println!("  Async I/O Engine  v{VERSION}");
    println!("  generation-stamped handles / merge-and-uncombine / 4 providers");
    println!("================================================================");
}

fn print_config(config: &AioConfig) {
    println!("backend:              {:?}", config.backend);
    println!("workers:              {}", config.workers);
    println!("max_in_progress:      {}", config.max_in_progress);
    println!("io_max_concurrency:   {}", config.io_max_concurrency);
    println!("max_combine:          {}", config.max_combine);
    println!();
}
