use anyhow::Result;

fn main() -> Result<()> {
    mun_os::cli::run()
}
