use anyhow::Result;
use clap::Parser;
use ipadump::cli::{Cli, Commands};
use ipadump::signals;
use ipadump::transfer::SshTransport;
use ipadump::{run_dump, run_list};

fn main() -> Result<()> {
    println!("[>>>]  This is ipadump [<<<]");
    println!("[>>>]  decrypted ipa extractor  [<<<]");

    let cli = Cli::parse();

    match cli.command {
        Commands::List(opts) => run_list(&opts.to_config()),
        Commands::Dump(opts) => {
            let cfg = opts.to_config();

            signals::install_sigint_handler()?;
            signals::reset_interrupt_flag();

            let mut transport = SshTransport::new();
            let connected = transport.connect(
                &cfg.ssh.host,
                cfg.ssh.port,
                &cfg.ssh.username,
                &cfg.ssh.password,
            )?;
            if !connected {
                std::process::exit(1);
            }

            match run_dump(&opts.target, &cfg, transport)? {
                Some(archive) => {
                    println!("[+]  Output ipa file: {}", archive.display());
                    Ok(())
                }
                None => std::process::exit(1),
            }
        }
    }
}
