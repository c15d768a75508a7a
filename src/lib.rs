use anyhow::Context;

pub mod arguments;
pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod metrics;
pub mod process;
pub mod profile;
pub mod report;
pub mod sweep;
pub mod util;

#[allow(clippy::print_stdout)]
pub fn run(config: &config::Config) -> anyhow::Result<()> {
    let mut toolchain = sweep::SystemToolchain::new(config.show_commands);

    let report = sweep::execute(config, &mut toolchain).context("Unable to complete comparison")?;
    let table_path = report::write_report(&report).context("Unable to write comparison report")?;

    println!("All done! The comparison table is at {}", table_path.display());

    Ok(())
}
