use clap::Subcommand;

pub mod mount;

pub use mount::mount;

#[derive(clap::Parser, Debug)]
#[command(name = "freezefs")]
pub struct Cli {
    #[command(subcommand)]
    pub subcommands: Subcommands,
}

#[derive(Subcommand, Debug)]
pub enum Subcommands {
    Mount(mount::Cli),
}
