//! deluged: Deluge code dissemination node.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use deluge_core::config::DelugeConfig;

mod exec;
mod node;
mod transport;

use node::{Node, Role};
use transport::Transport;

fn print_usage() {
    println!("Usage: deluged <command>");
    println!();
    println!("Commands:");
    println!("  seed <file> <version>   Disseminate <file> as <version> (0-255)");
    println!("  join <name>             Receive the neighbourhood's object into the storage dir");
    println!("  exec <file> [arch]      Link and load an ELF object, print the result");
    println!();
    println!("Configuration: {}", DelugeConfig::file_path().display());
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = DelugeConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = DelugeConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        DelugeConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    match args.as_slice() {
        ["seed", file, version] => {
            let version: u8 = version.parse().context("version must be a number from 0 to 255")?;
            let role = Role::Seed {
                path: PathBuf::from(file),
                version,
            };
            serve(config, role).await
        }
        ["join", name] => {
            let role = Role::Join {
                name: name.to_string(),
            };
            serve(config, role).await
        }
        ["exec", file] => exec::run(&config.loader, Path::new(file)),
        ["exec", file, arch] => {
            let mut loader = config.loader.clone();
            loader.arch = arch.parse().map_err(anyhow::Error::msg)?;
            exec::run(&loader, Path::new(file))
        }
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

async fn serve(config: DelugeConfig, role: Role) -> Result<()> {
    tracing::info!(
        variant = ?config.protocol.variant,
        port = config.network.port,
        "deluged starting"
    );
    let transport = Transport::bind(&config.network)?;
    let node = Node::start(config, role, transport)?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    node.run(shutdown_rx).await
}

#[cfg(test)]
mod tests {
    use deluge_core::config::LoaderConfig;
    use deluge_core::elf::{Arch, EM_386};
    use deluge_services::arch::x86::R_386_32;
    use deluge_services::loader::testing::ElfBuilder;
    use deluge_services::loader::START_SYMBOL;
    use std::io::Cursor;

    #[test]
    fn exec_loader_links_against_symbol_file() {
        let dir = std::env::temp_dir().join(format!("deluged-exec-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let symbols = dir.join("symbols.toml");
        std::fs::write(&symbols, "process_start = 0x0040_1000\n").unwrap();

        let mut elf = ElfBuilder::new(EM_386);
        let text = elf.section(".text", &[0xb8, 0, 0, 0, 0]);
        let start = elf.undefined("process_start");
        elf.symbol(START_SYMBOL, text, 0);
        elf.rela(text, 1, start, R_386_32, 0);

        let config = LoaderConfig {
            arch: Arch::X86,
            symbols: Some(symbols),
            ..Default::default()
        };
        let mut loader = super::exec::loader(&config).unwrap();
        let module = loader.load(&mut Cursor::new(elf.build())).unwrap();
        let text = loader.arena().rom.read(module.text, 5).unwrap();
        assert_eq!(text, &[0xb8, 0x00, 0x10, 0x40, 0x00]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn exec_loader_reports_missing_symbol_file() {
        let config = LoaderConfig {
            symbols: Some("/nonexistent/deluge/symbols.toml".into()),
            ..Default::default()
        };
        let err = super::exec::loader(&config).err().unwrap();
        assert!(err.to_string().contains("failed to load symbols"));
    }
}
