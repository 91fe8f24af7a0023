//! Command line interface for the `btpwire` tester binary.

use std::net::SocketAddr;

use clap::Parser;

/// Command line arguments for the `btpwire` binary.
#[derive(Debug, Parser)]
#[command(
    name = "btpwire",
    version,
    about = "Serve the tester protocol with the echo service over stdio or TCP"
)]
pub struct Cli {
    /// Accept one controller on this TCP address instead of using stdio.
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,
    /// Number of command slots in the buffer pool.
    #[arg(long, default_value_t = 2)]
    pub pool_slots: usize,
    /// Largest frame accepted or sent, header included.
    #[arg(long, default_value_t = 1024)]
    pub mtu: usize,
    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    pub metrics: Option<SocketAddr>,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;

    #[test]
    fn defaults_match_tester_defaults() {
        let cli = Cli::parse_from(["btpwire"]);
        assert_eq!(cli.listen, None);
        assert_eq!(cli.pool_slots, 2);
        assert_eq!(cli.mtu, 1024);
        assert_eq!(cli.metrics, None);
    }

    #[test]
    fn parses_listen_and_pool_options() {
        let cli = Cli::parse_from([
            "btpwire",
            "--listen",
            "127.0.0.1:7000",
            "--pool-slots",
            "4",
            "--mtu",
            "512",
        ]);
        assert_eq!(cli.listen, Some(([127, 0, 0, 1], 7000).into()));
        assert_eq!(cli.pool_slots, 4);
        assert_eq!(cli.mtu, 512);
    }
}
