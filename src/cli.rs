use clap::{Parser, Subcommand};
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[command(name = "proofbox")]
#[command(about = "ProofBox Test-as-a-Service backplane", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the admission API with the in-process worker pool
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Address to bind the API server to (overrides configuration)
    #[arg(long)]
    pub address: Option<SocketAddr>,
}
