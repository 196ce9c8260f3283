use clap::{Parser, Subcommand};

use crate::index::Modality;
use crate::search::SearchMode;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Rebuild the vector indices from the catalog.
    Build {
        /// Rebuild a single index
        #[clap(long)]
        only: Option<Modality>,
    },

    /// Search ads.
    Search {
        /// Search mode
        mode: SearchMode,

        /// Query text, or path to an image for image-to-* modes
        query: String,

        /// Number of ads to return
        #[clap(short = 'k', long)]
        top_k: Option<usize>,
    },

    /// Print index sizes and catalog statistics.
    Status {},

    /// Start the HTTP API.
    Daemon {},
}
