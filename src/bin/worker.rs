use anyhow::Result;

fn main() -> Result<()> {
    sentinel_worker::cli::run()
}
