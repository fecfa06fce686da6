mod cache;
mod config;
mod entry;
mod resolver;
mod server;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use hickory_proto::rr::RecordType;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, load_config};
use crate::server::DnsServer;

#[derive(Parser, Debug)]
#[command(author, version, about = "relaydns: redirector DNS for game server-list hostnames", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// 覆盖 UDP 监听端口
    #[arg(long = "port")]
    port: Option<u16>,
    /// 覆盖重定向地址（已知服务器列表域名指向的 IP）
    #[arg(long = "redirect-ip")]
    redirect_ip: Option<String>,
    /// 为非本地域名启用递归解析
    #[arg(long = "recursive", default_value_t = false)]
    recursive: bool,
    /// 覆盖解析缓存容量
    #[arg(long = "cache-size")]
    cache_size: Option<usize>,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let mut cfg = match &args.config {
        Some(path) => load_config(path).context("load config")?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(ip) = args.redirect_ip {
        cfg.redirect_ip = Some(ip);
    }
    if let Some(size) = args.cache_size {
        cfg.cache_size = size;
    }
    if args.recursive {
        cfg.recursive = true;
    }
    anyhow::ensure!(cfg.cache_size > 0, "cache size must be at least 1");

    let mut server = DnsServer::new(cfg.port, cfg.cache_size);
    server.set_recursive(cfg.recursive);
    server.set_strip_suffix(cfg.strip_suffix.clone());
    seed_local_entries(&mut server, &cfg);

    server.start().context("start dns server")?;

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!(event = "shutdown", "interrupt received, stopping");
    server.stop().await;

    Ok(())
}

/// Seed the redirect hostnames toward the operator address, then any
/// free-form entries from the config. Bad entries are skipped, not fatal.
fn seed_local_entries(server: &mut DnsServer, cfg: &Config) {
    if let Some(ip) = &cfg.redirect_ip {
        for name in &cfg.redirect_names {
            if server.put_local_entry(RecordType::A, name, ip) {
                info!(event = "redirect_seeded", domain = %name, target = %ip);
            }
        }
    }

    for spec in &cfg.local_entries {
        match (spec.record_type(), spec.dns_class()) {
            (Ok(rtype), Ok(class)) => {
                server.put_local_entry_full(rtype, &spec.domain, &spec.record, spec.ttl, class);
            }
            (Err(err), _) | (_, Err(err)) => {
                warn!(event = "local_entry_rejected", domain = %spec.domain, error = %err, "unusable entry spec");
            }
        }
    }
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_level(debug);

    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
